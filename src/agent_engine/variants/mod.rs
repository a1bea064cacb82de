pub mod qwen;
pub mod react;
