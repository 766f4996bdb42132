//! Image preprocessing before extraction
//!
//! Pipeline: decode → EXIF orientation → grayscale → cardinal rotation
//! detection → illumination normalization → PNG.
//!
//! Every step is pure integer/f64 arithmetic over the decoded pixels, so the
//! same input bytes always produce the same output bytes.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use std::io::Cursor;
use tracing::debug;

use crate::config::PreprocessConfig;
use crate::error::{Error, Result};
use crate::types::{ProcessedImage, Rotation};

/// Longest side of the copy used for orientation scoring
const ANALYSIS_MAX_SIDE: u32 = 256;

/// Longest side of the grid the background map is estimated on
const BACKGROUND_GRID: u32 = 128;

/// A pixel darker than this fraction of its local background counts as ink
const INK_RATIO_NUM: u32 = 3;
const INK_RATIO_DEN: u32 = 4;

/// Below this share of ink pixels the page is treated as blank
const MIN_INK_FRACTION: f64 = 0.001;

/// Weight of the top-heaviness term relative to line alignment
const TOP_BIAS_WEIGHT: f64 = 0.25;

/// Scores closer than this are ties
const SCORE_EPSILON: f64 = 1e-6;

/// Background brighter than this everywhere needs no normalization
const FLAT_BACKGROUND_MIN: u8 = 245;

/// Correct orientation and lighting of a document photo
pub fn preprocess(bytes: &[u8], config: &PreprocessConfig) -> Result<ProcessedImage> {
    if bytes.is_empty() {
        return Err(Error::ImageDecode("empty image".to_string()));
    }
    if bytes.len() > config.max_image_bytes {
        return Err(Error::ImageDecode(format!(
            "image is {} bytes, limit is {}",
            bytes.len(),
            config.max_image_bytes
        )));
    }

    let (width, height) = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| Error::ImageDecode(format!("unreadable image header: {}", e)))?
        .into_dimensions()?;
    if width == 0 || height == 0 || u64::from(width) * u64::from(height) > config.max_pixels {
        return Err(Error::ImageDecode(format!(
            "unsupported image dimensions {}x{}",
            width, height
        )));
    }

    let decoded = image::load_from_memory(bytes)?;
    let oriented = apply_exif_orientation(decoded, read_exif_orientation(bytes));
    let gray = oriented.to_luma8();

    let rotation = detect_rotation(&gray);
    let upright = rotate(&gray, rotation);
    let (normalized, shadow_removed) = normalize_illumination(&upright);

    debug!(
        width = normalized.width(),
        height = normalized.height(),
        rotation = rotation.degrees(),
        shadow_removed,
        "Preprocessed document image"
    );

    Ok(ProcessedImage {
        bytes: encode_png(normalized)?,
        content_type: "image/png",
        rotation,
        shadow_removed,
    })
}

/// EXIF orientation tag (1 when absent or unreadable)
fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

fn apply_exif_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Pick the clockwise rotation that makes the page upright.
///
/// Each candidate is scored on an ink mask: the share of projection variance
/// carried by rows (text lines run horizontally) plus a bonus for ink sitting
/// in the upper half (pages are filled top-down). Candidates are visited in
/// 0, 90, 180, 270 order and only a strictly better score replaces the
/// current best, so ties stay at 0°.
pub fn detect_rotation(gray: &GrayImage) -> Rotation {
    let analysis = downscale(gray, ANALYSIS_MAX_SIDE);
    let mask = ink_mask(&analysis);

    let ink = mask.pixels().filter(|p| p[0] > 0).count() as f64;
    let area = f64::from(mask.width()) * f64::from(mask.height());
    if area == 0.0 || ink / area < MIN_INK_FRACTION {
        return Rotation::Deg0;
    }

    let mut best = Rotation::Deg0;
    let mut best_score = f64::NEG_INFINITY;
    for candidate in Rotation::ALL {
        let score = orientation_score(&rotate(&mask, candidate));
        debug!(rotation = candidate.degrees(), score, "Orientation candidate");
        if score > best_score + SCORE_EPSILON {
            best = candidate;
            best_score = score;
        }
    }
    best
}

/// 255 where the pixel is ink, 0 elsewhere
fn ink_mask(gray: &GrayImage) -> GrayImage {
    let background = background_map(gray);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let p = u32::from(gray.get_pixel(x, y)[0]);
        let b = u32::from(background.get_pixel(x, y)[0]);
        Luma([if p * INK_RATIO_DEN < b * INK_RATIO_NUM { 255 } else { 0 }])
    })
}

fn orientation_score(mask: &GrayImage) -> f64 {
    let (w, h) = mask.dimensions();
    let mut rows = vec![0u32; h as usize];
    let mut cols = vec![0u32; w as usize];
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] > 0 {
            rows[y as usize] += 1;
            cols[x as usize] += 1;
        }
    }

    let row_profile: Vec<f64> = rows.iter().map(|&c| f64::from(c) / f64::from(w)).collect();
    let col_profile: Vec<f64> = cols.iter().map(|&c| f64::from(c) / f64::from(h)).collect();
    let (var_rows, var_cols) = (variance(&row_profile), variance(&col_profile));
    let alignment = if var_rows + var_cols > 0.0 {
        var_rows / (var_rows + var_cols)
    } else {
        0.5
    };

    let half = (h / 2) as usize;
    let top: u32 = rows[..half].iter().sum();
    let bottom: u32 = rows[(h as usize - half)..].iter().sum();
    let total: u32 = rows.iter().sum();
    let top_bias = if total > 0 {
        (f64::from(top) - f64::from(bottom)) / f64::from(total)
    } else {
        0.0
    };

    alignment + TOP_BIAS_WEIGHT * top_bias
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

fn rotate(img: &GrayImage, rotation: Rotation) -> GrayImage {
    match rotation {
        Rotation::Deg0 => img.clone(),
        Rotation::Deg90 => imageops::rotate90(img),
        Rotation::Deg180 => imageops::rotate180(img),
        Rotation::Deg270 => imageops::rotate270(img),
    }
}

fn downscale(gray: &GrayImage, max_side: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let longest = w.max(h);
    if longest <= max_side {
        return gray.clone();
    }
    let nw = (u64::from(w) * u64::from(max_side)).div_ceil(u64::from(longest)) as u32;
    let nh = (u64::from(h) * u64::from(max_side)).div_ceil(u64::from(longest)) as u32;
    imageops::resize(gray, nw.max(1), nh.max(1), FilterType::Triangle)
}

/// Divide out a smooth estimate of the lighting.
///
/// Returns the image unchanged (and `false`) when the background is already
/// uniformly bright.
pub fn normalize_illumination(gray: &GrayImage) -> (GrayImage, bool) {
    let background = background_map(gray);
    let darkest = background.pixels().map(|p| p[0]).min().unwrap_or(255);
    if darkest >= FLAT_BACKGROUND_MIN {
        return (gray.clone(), false);
    }

    let out = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let p = u32::from(gray.get_pixel(x, y)[0]);
        let b = u32::from(background.get_pixel(x, y)[0].max(1));
        Luma([((p * 255 + b / 2) / b).min(255) as u8])
    });
    (out, true)
}

/// Smoothed background illumination at full resolution.
///
/// Grey closing (max then min filter) on a coarse grid removes strokes and
/// keeps large-scale shading; a box blur smooths the result before it is
/// resized back.
fn background_map(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let step = w.max(h).div_ceil(BACKGROUND_GRID).max(1);
    let (sw, sh) = (w.div_ceil(step), h.div_ceil(step));

    let small = if step > 1 {
        imageops::resize(gray, sw, sh, FilterType::Triangle)
    } else {
        gray.clone()
    };

    let radius = (sw.max(sh) / 12).max(2);
    let closed = window_filter(&window_filter(&small, radius, WindowOp::Max), radius, WindowOp::Min);
    let smooth = window_filter(&closed, radius, WindowOp::Mean);

    if step > 1 {
        imageops::resize(&smooth, w, h, FilterType::Triangle)
    } else {
        smooth
    }
}

#[derive(Debug, Clone, Copy)]
enum WindowOp {
    Max,
    Min,
    Mean,
}

/// Separable square-window filter with edge clamping
fn window_filter(img: &GrayImage, radius: u32, op: WindowOp) -> GrayImage {
    window_pass(&window_pass(img, radius, op, true), radius, op, false)
}

fn window_pass(img: &GrayImage, radius: u32, op: WindowOp, horizontal: bool) -> GrayImage {
    let (w, h) = img.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        let (pos, len) = if horizontal { (x, w) } else { (y, h) };
        let lo = pos.saturating_sub(radius);
        let hi = (pos + radius).min(len - 1);
        let sample = |i: u32| {
            if horizontal {
                img.get_pixel(i, y)[0]
            } else {
                img.get_pixel(x, i)[0]
            }
        };
        let value = match op {
            WindowOp::Max => (lo..=hi).map(sample).max().unwrap_or(0),
            WindowOp::Min => (lo..=hi).map(sample).min().unwrap_or(0),
            WindowOp::Mean => {
                let n = hi - lo + 1;
                let sum: u32 = (lo..=hi).map(|i| u32::from(sample(i))).sum();
                ((sum + n / 2) / n) as u8
            }
        };
        Luma([value])
    })
}

fn encode_png(img: GrayImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| Error::internal(format!("PNG encoding failed: {}", e)))?;
    Ok(cursor.into_inner())
}

/// Synthetic document pages shared by the processing tests
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 200x280 page: a title bar, eight text lines of decreasing length,
    /// empty lower third
    pub fn upright_page() -> GrayImage {
        GrayImage::from_fn(200, 280, |x, y| {
            let title = (20..40).contains(&y) && (30..170).contains(&x);
            let line = (60..188).contains(&y) && {
                let k = (y - 60) / 16;
                (y - 60) % 16 < 6 && x >= 20 && x < 180 - k * 8
            };
            Luma([if title || line { 20 } else { 255 }])
        })
    }

    /// Same page lit from the right, with a shadow over the left edge
    pub fn unevenly_lit(page: &GrayImage) -> GrayImage {
        let w = page.width();
        GrayImage::from_fn(w, page.height(), |x, y| {
            let light = 0.45 + 0.55 * f64::from(x) / f64::from(w - 1);
            Luma([(f64::from(page.get_pixel(x, y)[0]) * light).round() as u8])
        })
    }

    pub fn png(img: &GrayImage) -> Vec<u8> {
        encode_png(img.clone()).unwrap()
    }

    pub fn decode(bytes: &[u8]) -> GrayImage {
        image::load_from_memory(bytes).unwrap().to_luma8()
    }

    /// Mean intensity of the upper half minus that of the lower half
    pub fn top_minus_bottom(img: &GrayImage) -> f64 {
        let half = img.height() / 2;
        let mean = |rows: std::ops::Range<u32>| {
            let mut sum = 0f64;
            let mut n = 0f64;
            for y in rows {
                for x in 0..img.width() {
                    sum += f64::from(img.get_pixel(x, y)[0]);
                    n += 1.0;
                }
            }
            sum / n
        };
        mean(0..half) - mean(half..img.height())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_upright_page_not_rotated() {
        assert_eq!(detect_rotation(&upright_page()), Rotation::Deg0);
    }

    #[test]
    fn test_quarter_turns_are_undone() {
        let page = upright_page();
        // Input turned clockwise by N needs a further (360 - N) to be upright
        let cases = [
            (imageops::rotate90(&page), Rotation::Deg270),
            (imageops::rotate180(&page), Rotation::Deg180),
            (imageops::rotate270(&page), Rotation::Deg90),
        ];
        for (input, expected) in cases {
            assert_eq!(detect_rotation(&input), expected);
            assert_eq!(rotate(&input, expected), page);
        }
    }

    #[test]
    fn test_detection_survives_uneven_lighting() {
        let lit = unevenly_lit(&upright_page());
        assert_eq!(detect_rotation(&lit), Rotation::Deg0);
        assert_eq!(detect_rotation(&imageops::rotate180(&lit)), Rotation::Deg180);
    }

    #[test]
    fn test_ties_resolve_to_zero() {
        // Blank page: no ink at all
        let blank = GrayImage::from_pixel(120, 120, Luma([250]));
        assert_eq!(detect_rotation(&blank), Rotation::Deg0);

        // Square frame: identical under every quarter turn
        let frame = GrayImage::from_fn(100, 100, |x, y| {
            let inside = (20..80).contains(&x) && (20..80).contains(&y);
            let border = inside && (x < 24 || x >= 76 || y < 24 || y >= 76);
            Luma([if border { 10 } else { 255 }])
        });
        assert_eq!(detect_rotation(&frame), Rotation::Deg0);
    }

    #[test]
    fn test_illumination_flattened() {
        let lit = unevenly_lit(&upright_page());
        let (out, removed) = normalize_illumination(&lit);
        assert!(removed);

        // Shadowed paper is brought back near white
        let before = lit.get_pixel(2, 250)[0];
        let after = out.get_pixel(2, 250)[0];
        assert!(before < 130, "fixture shadow too weak: {}", before);
        assert!(after > 200, "background still dark: {}", after);
        for x in 0..out.width() {
            assert!(out.get_pixel(x, 250)[0] > 200);
        }

        // Ink stays dark
        assert!(out.get_pixel(25, 62)[0] < 60);
        assert!(out.get_pixel(100, 30)[0] < 60);
    }

    #[test]
    fn test_evenly_lit_page_untouched() {
        let page = upright_page();
        let (out, removed) = normalize_illumination(&page);
        assert!(!removed);
        assert_eq!(out, page);
    }

    #[test]
    fn test_preprocess_rotated_shadowed_photo() {
        let input = png(&imageops::rotate180(&unevenly_lit(&upright_page())));
        let processed = preprocess(&input, &PreprocessConfig::default()).unwrap();

        assert_eq!(processed.rotation, Rotation::Deg180);
        assert!(processed.shadow_removed);
        assert_eq!(processed.content_type, "image/png");

        let out = decode(&processed.bytes);
        assert_eq!(out.dimensions(), (200, 280));
        // Upright: ink (dark) concentrated in the upper half
        assert!(top_minus_bottom(&out) < -20.0);
        // Title bar back at the top
        assert!(out.get_pixel(100, 30)[0] < 60);
    }

    #[test]
    fn test_preprocess_is_deterministic() {
        let input = png(&imageops::rotate90(&unevenly_lit(&upright_page())));
        let a = preprocess(&input, &PreprocessConfig::default()).unwrap();
        let b = preprocess(&input, &PreprocessConfig::default()).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.rotation, b.rotation);
    }

    #[test]
    fn test_undecodable_bytes() {
        let config = PreprocessConfig::default();
        assert!(matches!(preprocess(b"", &config), Err(Error::ImageDecode(_))));
        assert!(matches!(
            preprocess(b"definitely not an image", &config),
            Err(Error::ImageDecode(_))
        ));

        let tiny_limit = PreprocessConfig {
            max_image_bytes: 10,
            ..PreprocessConfig::default()
        };
        assert!(matches!(
            preprocess(&png(&upright_page()), &tiny_limit),
            Err(Error::ImageDecode(_))
        ));
    }

    #[test]
    fn test_exif_orientation_mapping() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(30, 10));
        assert_eq!(apply_exif_orientation(img.clone(), 1).width(), 30);
        assert_eq!(apply_exif_orientation(img.clone(), 6).width(), 10);
        assert_eq!(apply_exif_orientation(img.clone(), 8).height(), 30);
        assert_eq!(apply_exif_orientation(img, 3).width(), 30);
        assert_eq!(read_exif_orientation(b"no exif here"), 1);
    }
}
