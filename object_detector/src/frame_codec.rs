use ndarray::Array3;
use thiserror::Error;
use video_proto::PixelFormat;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: invalid geometry {width}x{height}")]
    InvalidGeometry { width: i32, height: i32 },
    #[error("malformed frame: unsupported pixel format {0}")]
    UnsupportedFormat(i32),
    #[error("malformed frame: buffer holds {actual} bytes, expected {expected} for {width}x{height}x{channels}")]
    BufferLength {
        actual: usize,
        expected: usize,
        width: i32,
        height: i32,
        channels: usize,
    },
}

/// Bytes per pixel for the formats the service accepts on the wire.
fn channels(format: PixelFormat) -> Option<usize> {
    match format {
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
        PixelFormat::Rgba32 => Some(4),
        PixelFormat::Gray8 => Some(1),
        PixelFormat::Unspecified => None,
    }
}

/// Reshapes a dense row-major pixel buffer into a `height x width x channels`
/// array. A buffer whose length does not match the declared geometry is a
/// `CodecError`, never a panic.
pub fn decode(
    data: &[u8],
    width: i32,
    height: i32,
    pixel_format: i32,
) -> Result<Array3<u8>, CodecError> {
    if width <= 0 || height <= 0 {
        return Err(CodecError::InvalidGeometry { width, height });
    }

    let format = PixelFormat::try_from(pixel_format)
        .map_err(|_| CodecError::UnsupportedFormat(pixel_format))?;
    let channels = channels(format).ok_or(CodecError::UnsupportedFormat(pixel_format))?;

    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(channels))
        .ok_or(CodecError::InvalidGeometry { width, height })?;

    if data.len() != expected {
        return Err(CodecError::BufferLength {
            actual: data.len(),
            expected,
            width,
            height,
            channels,
        });
    }

    let array = Array3::from_shape_vec((height as usize, width as usize, channels), data.to_vec())
        .map_err(|_| CodecError::BufferLength {
            actual: data.len(),
            expected,
            width,
            height,
            channels,
        })?;

    Ok(array)
}

/// Flattens a pixel array back to bytes in row-major order. Exact inverse of
/// `decode` for any array this codec produced.
pub fn encode(pixels: &Array3<u8>) -> Vec<u8> {
    pixels.iter().copied().collect()
}
