//! Screenshot encoding and the resize arithmetic that decides which pixel
//! grid the model reasons in.

use std::io::Cursor;

use base64::Engine as _;
use image::{DynamicImage, ImageFormat};

use crate::errors::{MobileUseError, MobileUseResult};

// Qwen2.5-VL preprocessor constants.
pub const QWEN_MIN_PIXELS: u32 = 3136;
pub const QWEN_MAX_PIXELS: u32 = 12_845_056;
pub const QWEN_PATCH_SIZE: u32 = 14;
pub const QWEN_MERGE_SIZE: u32 = 2;
const MAX_ASPECT_RATIO: f64 = 200.0;

/// Encode an image as a `data:image/png;base64,...` URL.
pub fn encode_image_url(image: &DynamicImage) -> MobileUseResult<String> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(buf.into_inner());
    Ok(format!("data:image/png;base64,{b64}"))
}

/// Size an image takes when shrunk to fit inside `max_w`×`max_h`.
///
/// Aspect ratio is preserved and images are never enlarged. Each candidate
/// side is floored or ceiled, whichever keeps the ratio closer.
pub fn thumbnail_size(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width <= max_w && height <= max_h {
        return (width, height);
    }
    let aspect = width as f64 / height as f64;
    let (x, y) = (max_w as f64, max_h as f64);

    if x / y >= aspect {
        let w = closest_side(y * aspect, |n| (aspect - n / y).abs());
        (w, max_h)
    } else {
        let h = closest_side(x / aspect, |n| {
            if n == 0.0 {
                0.0
            } else {
                (aspect - x / n).abs()
            }
        });
        (max_w, h)
    }
}

fn closest_side(value: f64, error: impl Fn(f64) -> f64) -> u32 {
    let lo = value.floor();
    let hi = value.ceil();
    let best = if error(hi) < error(lo) { hi } else { lo };
    (best as u32).max(1)
}

/// Shrink `image` into the box, returning a new image only when it is too large.
pub fn thumbnail(image: &DynamicImage, max_w: u32, max_h: u32) -> DynamicImage {
    let (w, h) = thumbnail_size(image.width(), image.height(), max_w, max_h);
    if (w, h) == (image.width(), image.height()) {
        image.clone()
    } else {
        image.thumbnail_exact(w, h)
    }
}

/// Resolution a Qwen-VL server rescales an image to before the model sees it.
///
/// Both sides become multiples of `patch * merge` (28) and the total pixel
/// count is kept within `[QWEN_MIN_PIXELS, QWEN_MAX_PIXELS]`. Returns
/// `(width, height)`.
pub fn smart_resize(width: u32, height: u32) -> MobileUseResult<(u32, u32)> {
    let factor = (QWEN_PATCH_SIZE * QWEN_MERGE_SIZE) as f64;
    let (w, h) = (width as f64, height as f64);
    if width == 0 || height == 0 {
        return Err(MobileUseError::Config(format!("cannot resize an empty {width}x{height} image")));
    }
    if w.max(h) / w.min(h) > MAX_ASPECT_RATIO {
        return Err(MobileUseError::Config(format!(
            "absolute aspect ratio must be smaller than {MAX_ASPECT_RATIO}, got {width}x{height}"
        )));
    }

    let round_by = |n: f64| (n / factor).round_ties_even() * factor;
    let floor_by = |n: f64| (n / factor).floor() * factor;
    let ceil_by = |n: f64| (n / factor).ceil() * factor;

    let mut h_bar = factor.max(round_by(h));
    let mut w_bar = factor.max(round_by(w));
    let (min_px, max_px) = (QWEN_MIN_PIXELS as f64, QWEN_MAX_PIXELS as f64);

    if h_bar * w_bar > max_px {
        let beta = (h * w / max_px).sqrt();
        h_bar = factor.max(floor_by(h / beta));
        w_bar = factor.max(floor_by(w / beta));
    } else if h_bar * w_bar < min_px {
        let beta = (min_px / (h * w)).sqrt();
        h_bar = ceil_by(h * beta);
        w_bar = ceil_by(w * beta);
    }
    Ok((w_bar as u32, h_bar as u32))
}
