pub mod context;
pub mod engine;
pub mod episode;
pub mod history;
pub mod parser;
pub mod policy;
pub mod registry;
pub mod state;
pub mod variants;
