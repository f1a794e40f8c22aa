use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use crate::source::ResolvedSource;

use super::{CaptureError, CaptureOpener, FrameReader, RawFrame};

pub struct OpencvOpener;

impl CaptureOpener for OpencvOpener {
    fn open(&self, source: &ResolvedSource) -> Result<Box<dyn FrameReader>, CaptureError> {
        let uri = source.uri();
        let capture = VideoCapture::from_file(&uri, videoio::CAP_ANY)?;

        if !capture.is_opened()? {
            return Err(CaptureError::Open(uri));
        }

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);
        let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
        tracing::debug!(source = %uri, width, height, fps, "capture opened");

        Ok(Box::new(OpencvReader { capture, uri }))
    }
}

struct OpencvReader {
    capture: VideoCapture,
    uri: String,
}

impl FrameReader for OpencvReader {
    fn read(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }

        let bgr = to_bgr(mat)?;
        let bgr = if bgr.is_continuous() {
            bgr
        } else {
            bgr.try_clone()?
        };

        Ok(Some(RawFrame {
            width: bgr.cols(),
            height: bgr.rows(),
            data: bgr.data_bytes()?.to_vec(),
        }))
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!(source = %self.uri, error = %e, "failed to release capture");
        } else {
            tracing::trace!(source = %self.uri, "capture released");
        }
    }
}

fn to_bgr(mat: Mat) -> Result<Mat, CaptureError> {
    let code = match mat.channels() {
        3 => return Ok(mat),
        1 => imgproc::COLOR_GRAY2BGR,
        4 => imgproc::COLOR_BGRA2BGR,
        n => return Err(CaptureError::Layout(format!("{n} channels"))),
    };
    let mut bgr = Mat::default();
    imgproc::cvt_color_def(&mat, &mut bgr, code)?;
    Ok(bgr)
}
