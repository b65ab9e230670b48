//! Decoded image handles and the pixel statistics engines use on them.

use crate::engine::EngineError;
use crate::ledger::LedgerToken;
use std::borrow::Cow;
use std::path::Path;

/// Pixel layout of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    /// One byte of luminance per pixel.
    Gray8,
    /// Three bytes per pixel, blue first.
    Bgr24,
}

impl ColorSpace {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorSpace::Gray8 => 1,
            ColorSpace::Bgr24 => 3,
        }
    }
}

/// Decode by content; scratch paths carry no extension.
fn read_any(path: &Path) -> Result<image::DynamicImage, image::ImageError> {
    image::ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// Decoded pixel data owned by whichever operation requested the decode.
///
/// Released on drop; the ledger token tracks it while alive.
#[derive(Debug)]
pub struct ImageHandle {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: usize,
    color_space: ColorSpace,
    _token: LedgerToken,
}

impl ImageHandle {
    /// Decode the file at `path` into `color_space`.
    pub fn decode(
        path: &Path,
        color_space: ColorSpace,
        token: LedgerToken,
    ) -> Result<Self, EngineError> {
        let decoded = read_any(path).map_err(|source| EngineError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(EngineError::EmptyImage(path.to_path_buf()));
        }

        let data = match color_space {
            ColorSpace::Gray8 => decoded.to_luma8().into_raw(),
            ColorSpace::Bgr24 => {
                let mut rgb = decoded.to_rgb8().into_raw();
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                rgb
            }
        };

        tracing::debug!(path = %path.display(), width, height, ?color_space, "image decoded");

        Ok(Self::from_parts(data, width, height, color_space, token))
    }

    /// Wrap already-decoded, tightly packed pixels.
    pub fn from_parts(
        data: Vec<u8>,
        width: u32,
        height: u32,
        color_space: ColorSpace,
        token: LedgerToken,
    ) -> Self {
        let stride = width as usize * color_space.bytes_per_pixel();
        debug_assert_eq!(data.len(), stride * height as usize);
        Self {
            data,
            width,
            height,
            stride,
            color_space,
            _token: token,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Luminance plane, `width * height` bytes. Borrowed for GRAY8 images.
    pub fn luma(&self) -> Cow<'_, [u8]> {
        match self.color_space {
            ColorSpace::Gray8 => Cow::Borrowed(&self.data),
            ColorSpace::Bgr24 => Cow::Owned(
                self.data
                    .chunks_exact(3)
                    .map(|px| {
                        let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                        (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8
                    })
                    .collect(),
            ),
        }
    }

    /// Expand into an opaque RGBA buffer.
    pub fn to_rgba(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.width, self.height, |x, y| {
            let at = y as usize * self.stride + x as usize * self.color_space.bytes_per_pixel();
            match self.color_space {
                ColorSpace::Gray8 => {
                    let v = self.data[at];
                    image::Rgba([v, v, v, 255])
                }
                ColorSpace::Bgr24 => image::Rgba([self.data[at + 2], self.data[at + 1], self.data[at], 255]),
            }
        })
    }

    /// Pack an RGBA buffer as BGR24, dropping alpha.
    pub fn from_rgba(rgba: &image::RgbaImage, token: LedgerToken) -> Self {
        let data = rgba.pixels().flat_map(|px| [px[2], px[1], px[0]]).collect();
        Self::from_parts(data, rgba.width(), rgba.height(), ColorSpace::Bgr24, token)
    }
}

/// Copy a `side`×`side` square out of a luminance plane.
pub fn crop_square(gray: &[u8], width: usize, x0: usize, y0: usize, side: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(side * side);
    for y in y0..y0 + side {
        let row = y * width;
        out.extend_from_slice(&gray[row + x0..row + x0 + side]);
    }
    out
}

/// Mean and population standard deviation of a luminance buffer.
pub fn mean_and_std(gray: &[u8]) -> (f32, f32) {
    if gray.is_empty() {
        return (0.0, 0.0);
    }
    let n = gray.len() as f32;
    let mean = gray.iter().map(|&p| p as f32).sum::<f32>() / n;
    let var = gray
        .iter()
        .map(|&p| {
            let d = p as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / n;
    (mean, var.sqrt())
}

/// True when the buffer has no usable structure (blank, or nearly so).
pub fn is_flat(gray: &[u8], std_floor: f32) -> bool {
    mean_and_std(gray).1 <= std_floor
}
