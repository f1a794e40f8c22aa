use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::source::ResolvedSource;

use super::{CaptureError, CaptureOpener, FrameReader, RawFrame};

/// Scripted capture backend: every open yields a short clip whose frames are
/// filled with their index within the clip.
pub struct MockOpener {
    frames_per_open: AtomicUsize,
    fail_open_after: Option<usize>,
    read_error: bool,
    width: i32,
    height: i32,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl MockOpener {
    pub fn clip(frames: usize) -> Self {
        Self {
            frames_per_open: AtomicUsize::new(frames),
            fail_open_after: None,
            read_error: false,
            width: 8,
            height: 6,
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens after the first `n` successful ones fail.
    pub fn fail_open_after(mut self, n: usize) -> Self {
        self.fail_open_after = Some(n);
        self
    }

    /// Exhausted readers report a decode error instead of end of stream.
    pub fn with_read_error(mut self) -> Self {
        self.read_error = true;
        self
    }

    pub fn set_frames_per_open(&self, frames: usize) {
        self.frames_per_open.store(frames, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Readers opened and not yet dropped.
    pub fn live_readers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CaptureOpener for MockOpener {
    fn open(&self, source: &ResolvedSource) -> Result<Box<dyn FrameReader>, CaptureError> {
        if let Some(limit) = self.fail_open_after {
            if self.opens.load(Ordering::SeqCst) >= limit {
                return Err(CaptureError::Open(source.uri()));
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockReader {
            remaining: self.frames_per_open.load(Ordering::SeqCst),
            next_index: 0,
            read_error: self.read_error,
            width: self.width,
            height: self.height,
            live: Arc::clone(&self.live),
        }))
    }
}

struct MockReader {
    remaining: usize,
    next_index: usize,
    read_error: bool,
    width: i32,
    height: i32,
    live: Arc<AtomicUsize>,
}

impl FrameReader for MockReader {
    fn read(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if self.remaining == 0 {
            if self.read_error {
                return Err(CaptureError::Layout("corrupt packet".into()));
            }
            return Ok(None);
        }

        let value = (self.next_index % 256) as u8;
        self.remaining -= 1;
        self.next_index += 1;

        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            data: vec![value; (self.width * self.height * 3) as usize],
        }))
    }
}

impl Drop for MockReader {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
