use std::sync::Arc;

use image::DynamicImage;

/// Snapshot of the device: the screen at native resolution and the
/// foreground application (possibly empty).
#[derive(Debug, Clone)]
pub struct EnvState {
    pub pixels: Arc<DynamicImage>,
    pub package: String,
}

impl EnvState {
    pub fn new(pixels: DynamicImage, package: impl Into<String>) -> Self {
        Self {
            pixels: Arc::new(pixels),
            package: package.into(),
        }
    }

    /// Native `(width, height)` of the screenshot.
    pub fn size(&self) -> (u32, u32) {
        (self.pixels.width(), self.pixels.height())
    }
}
