//! Grayscale image transforms used by the decode cascade.

use image::GrayImage;

/// RGB24 to grayscale using ITU-R BT.601 luma weights.
///
/// Returns `None` when the byte count does not match the dimensions.
pub fn luma_from_rgb24(data: &[u8], width: u32, height: u32) -> Option<GrayImage> {
    let expected = width as usize * height as usize * 3;
    if data.len() != expected {
        return None;
    }
    let luma: Vec<u8> = data
        .chunks_exact(3)
        .map(|px| {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect();
    GrayImage::from_raw(width, height, luma)
}

/// Push pixels away from the midpoint by 30 levels, saturating.
pub fn contrast_stretch(img: &GrayImage) -> GrayImage {
    map_pixels(img, |g| {
        if g < 128 {
            g.saturating_sub(30)
        } else {
            g.saturating_add(30)
        }
    })
}

/// Hard threshold to pure black and white.
pub fn binarize(img: &GrayImage, threshold: u8) -> GrayImage {
    map_pixels(img, |g| if g < threshold { 0 } else { 255 })
}

/// Photometric inversion (light-on-dark codes become dark-on-light).
pub fn invert(img: &GrayImage) -> GrayImage {
    map_pixels(img, |g| 255 - g)
}

fn map_pixels(img: &GrayImage, f: impl Fn(u8) -> u8) -> GrayImage {
    let data: Vec<u8> = img.as_raw().iter().map(|&g| f(g)).collect();
    // same dimensions, same length, cannot fail
    GrayImage::from_raw(img.width(), img.height(), data)
        .unwrap_or_else(|| GrayImage::new(img.width(), img.height()))
}
