//! Conversion of request bodies into raw encoder frames.

use axum::body::Bytes;
use thiserror::Error;

use crate::encoder::Geometry;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image is {width}x{height}, recording expects {expected_width}x{expected_height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("Raw frame has {actual} bytes, recording expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Body of a frame request, before conversion to raw pixels
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Compressed image in any format the `image` crate recognises
    Image(Bytes),
    /// Raw RGBA pixels, row-major
    Raw(Bytes),
}

impl FramePayload {
    /// Produce the exact RGBA byte stream the encoder expects for `geometry`.
    pub fn into_pixels(self, geometry: &Geometry) -> Result<Bytes, FrameError> {
        match self {
            FramePayload::Image(data) => {
                let rgba = image::load_from_memory(&data)?.into_rgba8();
                if rgba.width() != geometry.width() || rgba.height() != geometry.height() {
                    return Err(FrameError::DimensionMismatch {
                        width: rgba.width(),
                        height: rgba.height(),
                        expected_width: geometry.width(),
                        expected_height: geometry.height(),
                    });
                }
                Ok(Bytes::from(rgba.into_raw()))
            }
            FramePayload::Raw(data) => {
                let expected = geometry.frame_len();
                if data.len() != expected {
                    return Err(FrameError::LengthMismatch {
                        expected,
                        actual: data.len(),
                    });
                }
                Ok(data)
            }
        }
    }
}
