#[cfg(test)]
pub(crate) mod mock;
mod backend;
mod session;

use thiserror::Error;

use crate::source::ResolvedSource;

pub use backend::OpencvOpener;
pub use session::CaptureSession;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open source {0}")]
    Open(String),
    #[error("capture is not open")]
    NotOpen,
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("unsupported frame layout: {0}")]
    Layout(String),
    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("giving up after {0} consecutive read failures")]
    Exhausted(u32),
}

/// One decoded frame, packed BGR8, row-major.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: i32,
    pub height: i32,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn expected_len(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize * 3
    }
}

/// A single open capture handle. Dropping it releases the handle.
pub trait FrameReader: Send {
    /// `Ok(None)` means the source reported no frame (end of stream or a
    /// dropped live feed); `Err` means the backend failed to decode.
    fn read(&mut self) -> Result<Option<RawFrame>, CaptureError>;
}

pub trait CaptureOpener: Send + Sync {
    fn open(&self, source: &ResolvedSource) -> Result<Box<dyn FrameReader>, CaptureError>;
}
