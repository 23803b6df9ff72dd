//! Thumbnail rendering boundary.
//!
//! Decoding pixel data and producing an image is delegated to a
//! [`ThumbnailRenderer`]; the read layer only picks the representative frame
//! and caches whatever the renderer returns.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot render {0} frames")]
    Unsupported(String),

    #[error("thumbnail rendering failed: {0}")]
    Failed(String),
}

/// One decompressed frame with the geometry needed to interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameImage {
    pub data: Bytes,
    /// Content type of `data` as stored (an image type for encapsulated
    /// frames, octet-stream for native pixels).
    pub content_type: String,
    pub transfer_syntax: String,
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u32,
    pub bits_allocated: u32,
    pub photometric_interpretation: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThumbnailRenderer: Send + Sync {
    /// Produce a JPEG thumbnail of `frame`.
    async fn render(&self, frame: &FrameImage) -> Result<Bytes, RenderError>;
}

/// Serves JPEG-encapsulated frames unchanged and declines everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodedFramePassthrough;

#[async_trait]
impl ThumbnailRenderer for EncodedFramePassthrough {
    async fn render(&self, frame: &FrameImage) -> Result<Bytes, RenderError> {
        if frame.content_type == THUMBNAIL_CONTENT_TYPE {
            Ok(frame.data.clone())
        } else {
            Err(RenderError::Unsupported(frame.content_type.clone()))
        }
    }
}
