//! Image input for multimodal prompts
//!
//! Raw image bytes are checked and decoded with the `image` crate before a
//! turn is submitted. The native projector lives next to the evaluation
//! context on the session worker, so projection happens there, when the turn
//! evaluates the image ahead of its prompt tokens.

use std::fmt;

use image::RgbImage;

use crate::inference::error::EngineError;
use crate::inference::handle::ModelHandle;

/// Status code reported by a native projector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStatus(pub i32);

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native status {}", self.0)
    }
}

impl From<NativeStatus> for EngineError {
    fn from(status: NativeStatus) -> Self {
        EngineError::EmbedFailure(status.to_string())
    }
}

/// A decoded image bound for one turn of a vision-capable model.
///
/// Consumed by exactly one turn; it occupies as many context positions as
/// the projector produces rows for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pixels: RgbImage,
}

impl ImageInput {
    pub fn new(pixels: RgbImage) -> Result<Self, EngineError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(EngineError::DecodeFailure("image has no pixels".into()));
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Packed RGB bytes, row by row
    pub fn as_rgb(&self) -> &[u8] {
        self.pixels.as_raw()
    }
}

/// Decodes image bytes into RGB pixels
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::DecodeFailure("image buffer is empty".into()));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| EngineError::DecodeFailure("unrecognised image format".into()))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| EngineError::DecodeFailure(e.to_string()))?;

    let rgb = decoded.to_rgb8();
    tracing::debug!(
        "Decoded {:?} image {}x{}",
        format,
        rgb.width(),
        rgb.height()
    );
    Ok(rgb)
}

/// Checks `bytes` against the model behind `handle` and decodes them.
///
/// Fails with [`EngineError::DecodeFailure`] for empty or undecodable input
/// and [`EngineError::EmbedFailure`] when the model has no projector. Nothing
/// about any session changes when this fails.
pub fn prepare_image(handle: &ModelHandle, bytes: &[u8]) -> Result<ImageInput, EngineError> {
    let image = ImageInput::new(decode_image(bytes)?)?;

    let backend = handle.acquire()?;
    if !backend.info().has_vision {
        return Err(EngineError::EmbedFailure(
            "model has no vision projector".into(),
        ));
    }
    Ok(image)
}
