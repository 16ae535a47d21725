//! Preview filters
//!
//! The software backend draws a frame by sampling the camera texture through
//! its transform matrix and then applying a 3x3 convolution kernel, the same
//! model a fragment shader with a kernel uniform would use.

use super::gpu::{CameraFrame, FrameBuffer};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Filter applied to both preview and recorded frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    #[default]
    Normal,
    BlackWhite,
    Blur,
    Sharpen,
    EdgeDetect,
    Emboss,
}

impl FilterMode {
    pub const ALL: [FilterMode; 6] = [
        FilterMode::Normal,
        FilterMode::BlackWhite,
        FilterMode::Blur,
        FilterMode::Sharpen,
        FilterMode::EdgeDetect,
        FilterMode::Emboss,
    ];

    /// Convolution kernel (row-major) and color offset
    pub fn kernel(&self) -> Option<([f32; 9], f32)> {
        match self {
            FilterMode::Normal | FilterMode::BlackWhite => None,
            FilterMode::Blur => Some((
                [
                    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0, //
                    2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0, //
                    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
                ],
                0.0,
            )),
            FilterMode::Sharpen => Some(([0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0], 0.0)),
            FilterMode::EdgeDetect => {
                Some(([-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0], 0.0))
            }
            FilterMode::Emboss => Some(([2.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0], 0.5)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterMode::Normal => "normal",
            FilterMode::BlackWhite => "blackWhite",
            FilterMode::Blur => "blur",
            FilterMode::Sharpen => "sharpen",
            FilterMode::EdgeDetect => "edgeDetect",
            FilterMode::Emboss => "emboss",
        }
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace(['-', '_', ' '], "").to_lowercase();
        FilterMode::ALL
            .into_iter()
            .find(|m| m.name().to_lowercase() == wanted)
            .ok_or_else(|| format!("unknown filter '{}'", s))
    }
}

/// Map a destination pixel center through the st matrix and fetch the
/// nearest source pixel.
fn sample(src: &CameraFrame, st: &[f32; 16], s: f32, t: f32) -> [u8; 4] {
    let u = st[0] * s + st[4] * t + st[12];
    let v = st[1] * s + st[5] * t + st[13];
    if src.width == 0 || src.height == 0 {
        return [0, 0, 0, 255];
    }
    let x = ((u * src.width as f32) as i64).clamp(0, src.width as i64 - 1) as usize;
    let y = ((v * src.height as f32) as i64).clamp(0, src.height as i64 - 1) as usize;
    let i = (y * src.width as usize + x) * 4;
    match src.pixels.get(i..i + 4) {
        Some(p) => [p[0], p[1], p[2], p[3]],
        None => [0, 0, 0, 255],
    }
}

/// Draw `src` into `dst` with the texture transform and filter applied
pub fn draw_frame(src: &CameraFrame, st: &[f32; 16], mode: FilterMode, dst: &mut FrameBuffer) {
    let (w, h) = (dst.width as usize, dst.height as usize);
    for y in 0..h {
        for x in 0..w {
            let s = (x as f32 + 0.5) / w as f32;
            let t = (y as f32 + 0.5) / h as f32;
            let mut px = sample(src, st, s, t);
            if mode == FilterMode::BlackWhite {
                let luma =
                    (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8;
                px = [luma, luma, luma, px[3]];
            }
            let i = (y * w + x) * 4;
            dst.pixels[i..i + 4].copy_from_slice(&px);
        }
    }

    if let Some((kernel, offset)) = mode.kernel() {
        convolve(dst, &kernel, offset);
    }
}

fn convolve(buf: &mut FrameBuffer, kernel: &[f32; 9], offset: f32) {
    let (w, h) = (buf.width as i64, buf.height as i64);
    let src = buf.pixels.clone();
    let at = |x: i64, y: i64, c: usize| -> f32 {
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        src[((y * w + x) * 4) as usize + c] as f32 / 255.0
    };

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let mut acc = 0.0;
                for ky in 0..3 {
                    for kx in 0..3 {
                        acc += kernel[(ky * 3 + kx) as usize] * at(x + kx - 1, y + ky - 1, c);
                    }
                }
                let value = ((acc + offset).clamp(0.0, 1.0) * 255.0).round() as u8;
                buf.pixels[((y * w + x) * 4) as usize + c] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::gpu::{IDENTITY_MATRIX, MIRROR_MATRIX};
    use std::sync::Arc;

    /// 2x1 frame: red pixel then blue pixel
    fn red_blue() -> CameraFrame {
        CameraFrame {
            width: 2,
            height: 1,
            pixels: Arc::new(vec![255, 0, 0, 255, 0, 0, 255, 255]),
            timestamp_ns: 0,
        }
    }

    fn solid(value: u8) -> CameraFrame {
        CameraFrame {
            width: 4,
            height: 4,
            pixels: Arc::new(vec![value; 64]),
            timestamp_ns: 0,
        }
    }

    #[test]
    fn test_filter_names_parse() {
        for mode in FilterMode::ALL {
            assert_eq!(mode.name().parse::<FilterMode>().unwrap(), mode);
        }
        assert_eq!("edge-detect".parse::<FilterMode>().unwrap(), FilterMode::EdgeDetect);
        assert_eq!("BLACK_WHITE".parse::<FilterMode>().unwrap(), FilterMode::BlackWhite);
        assert!("sepia".parse::<FilterMode>().is_err());
    }

    #[test]
    fn test_mirror_matrix_swaps_columns() {
        let mut dst = FrameBuffer::new(2, 1);
        draw_frame(&red_blue(), &IDENTITY_MATRIX, FilterMode::Normal, &mut dst);
        assert_eq!(&dst.pixels[0..4], &[255, 0, 0, 255]);

        draw_frame(&red_blue(), &MIRROR_MATRIX, FilterMode::Normal, &mut dst);
        assert_eq!(&dst.pixels[0..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_black_white_is_gray() {
        let mut dst = FrameBuffer::new(2, 1);
        draw_frame(&red_blue(), &IDENTITY_MATRIX, FilterMode::BlackWhite, &mut dst);
        assert_eq!(dst.pixels[0], dst.pixels[1]);
        assert_eq!(dst.pixels[1], dst.pixels[2]);
        assert_eq!(dst.pixels[0], 76);
    }

    #[test]
    fn test_kernels_on_flat_image() {
        let mut dst = FrameBuffer::new(4, 4);
        draw_frame(&solid(128), &IDENTITY_MATRIX, FilterMode::Blur, &mut dst);
        assert!(dst.pixels.chunks(4).all(|p| p[0] == 128));

        // Edge detection of a flat image is black
        draw_frame(&solid(128), &IDENTITY_MATRIX, FilterMode::EdgeDetect, &mut dst);
        assert!(dst.pixels.chunks(4).all(|p| p[0] == 0 && p[3] == 128));
    }
}
