use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, ImageFormat, RgbaImage};
use tokio::sync::{oneshot, watch};

use crate::error::CaptureError;
use crate::logger::{EventCategory, EventLog};
use crate::models::EncodedFrame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Display {
  pub id: u32,
  pub width: u32,
  pub height: u32,
  pub is_primary: bool,
}

type FrameResult = Result<RgbaImage, CaptureError>;

/// One-shot delivery slot handed to a capture session. Only the first result gets through.
#[derive(Clone)]
pub struct FrameSink {
  slot: Arc<Mutex<Option<oneshot::Sender<FrameResult>>>>,
}

impl FrameSink {
  fn new() -> (Self, oneshot::Receiver<FrameResult>) {
    let (tx, rx) = oneshot::channel();
    let sink = Self {
      slot: Arc::new(Mutex::new(Some(tx))),
    };
    (sink, rx)
  }

  /// Returns true only for the frame that was actually consumed.
  pub fn deliver(&self, frame: RgbaImage) -> bool {
    self.resolve(Ok(frame))
  }

  /// Ends the session with an error, unless a frame already got through.
  pub fn fail(&self, err: CaptureError) -> bool {
    self.resolve(Err(err))
  }

  fn resolve(&self, result: FrameResult) -> bool {
    let sender = match self.slot.lock() {
      Ok(mut slot) => slot.take(),
      Err(_) => None,
    };
    match sender {
      Some(tx) => tx.send(result).is_ok(),
      None => false,
    }
  }
}

pub trait CaptureSession: Send {
  fn stop(&mut self);
}

/// Platform side of frame acquisition.
pub trait FrameSource: Send + Sync {
  fn permission_granted(&self) -> bool {
    true
  }

  fn request_permission(&self) {}

  fn displays(&self) -> Result<Vec<Display>, CaptureError>;

  fn start_session(
    &self,
    display: &Display,
    sink: FrameSink,
  ) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

struct SessionGuard(Box<dyn CaptureSession>);

impl Drop for SessionGuard {
  fn drop(&mut self) {
    self.0.stop();
  }
}

/// Captures through the `screenshots` crate. The process owns no windows, so there is
/// nothing of ours to exclude from the frame.
pub struct ScreenFrameSource;

struct ThreadSession {
  stopped: Arc<AtomicBool>,
}

impl CaptureSession for ThreadSession {
  fn stop(&mut self) {
    self.stopped.store(true, Ordering::SeqCst);
  }
}

impl FrameSource for ScreenFrameSource {
  fn displays(&self) -> Result<Vec<Display>, CaptureError> {
    let screens = screenshots::Screen::all().map_err(|e| CaptureError::Backend(e.to_string()))?;
    Ok(
      screens
        .iter()
        .map(|s| Display {
          id: s.display_info.id,
          width: s.display_info.width,
          height: s.display_info.height,
          is_primary: s.display_info.is_primary,
        })
        .collect(),
    )
  }

  fn start_session(
    &self,
    display: &Display,
    sink: FrameSink,
  ) -> Result<Box<dyn CaptureSession>, CaptureError> {
    let screens = screenshots::Screen::all().map_err(|e| CaptureError::Backend(e.to_string()))?;
    let screen = screens
      .into_iter()
      .find(|s| s.display_info.id == display.id)
      .ok_or(CaptureError::NoCapturableContent)?;

    let runtime = tokio::runtime::Handle::try_current()
      .map_err(|e| CaptureError::Backend(e.to_string()))?;
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    runtime.spawn_blocking(move || {
      let result = screen.capture().map_err(|e| CaptureError::Backend(e.to_string()));
      if flag.load(Ordering::SeqCst) {
        return;
      }
      match result {
        Ok(image) => sink.deliver(image),
        Err(err) => sink.fail(err),
      };
    });

    Ok(Box::new(ThreadSession { stopped }))
  }
}

/// Quality factors tried in order, from `start` down to `floor` in steps of 0.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityLadder {
  pub start: f32,
  pub floor: f32,
}

impl QualityLadder {
  pub fn levels(&self) -> Vec<u8> {
    let start = (self.start.clamp(0.0, 1.0) * 100.0).round() as i32;
    let floor = ((self.floor.clamp(0.0, 1.0) * 100.0).round() as i32).max(1);
    let mut levels = Vec::new();
    let mut quality = start;
    while quality >= floor {
      levels.push(quality as u8);
      quality -= 10;
    }
    levels
  }
}

pub fn encode_with_ladder<F, E>(
  ladder: QualityLadder,
  mut encode: F,
) -> Result<(Vec<u8>, u8), CaptureError>
where
  F: FnMut(u8) -> Result<Vec<u8>, E>,
  E: std::fmt::Display,
{
  for quality in ladder.levels() {
    match encode(quality) {
      Ok(bytes) if !bytes.is_empty() => return Ok((bytes, quality)),
      Ok(_) => tracing::debug!(quality, "jpeg encoder produced no bytes"),
      Err(err) => tracing::debug!(quality, "jpeg encoding failed: {err}"),
    }
  }
  Err(CaptureError::EncodingFailed)
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> image::ImageResult<Vec<u8>> {
  let mut bytes = Vec::new();
  JpegEncoder::new_with_quality(&mut bytes, quality).encode(rgb, width, height, ColorType::Rgb8)?;
  Ok(bytes)
}

pub struct FrameCapturer {
  source: Arc<dyn FrameSource>,
  ladder: QualityLadder,
  preview: watch::Sender<Option<Arc<RgbaImage>>>,
  events: EventLog,
}

impl FrameCapturer {
  pub fn new(source: Arc<dyn FrameSource>, ladder: QualityLadder, events: EventLog) -> Self {
    let (preview, _) = watch::channel(None);
    Self {
      source,
      ladder,
      preview,
      events,
    }
  }

  pub fn subscribe_preview(&self) -> watch::Receiver<Option<Arc<RgbaImage>>> {
    self.preview.subscribe()
  }

  pub fn preview_png(&self) -> Option<anyhow::Result<Vec<u8>>> {
    let frame = self.preview.borrow().clone()?;
    let mut png = Vec::new();
    let image = DynamicImage::ImageRgba8((*frame).clone());
    if let Err(err) = image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png) {
      return Some(Err(err.into()));
    }
    Some(Ok(png))
  }

  pub async fn acquire_frame(&self) -> Result<EncodedFrame, CaptureError> {
    if !self.source.permission_granted() {
      self.source.request_permission();
      if !self.source.permission_granted() {
        return Err(CaptureError::PermissionDenied);
      }
    }

    let displays = self.source.displays()?;
    let display = displays
      .iter()
      .find(|d| d.is_primary)
      .or_else(|| displays.first())
      .ok_or(CaptureError::NoCapturableContent)?;

    let (sink, first_frame) = FrameSink::new();
    let session = SessionGuard(self.source.start_session(display, sink)?);
    let frame = first_frame.await.unwrap_or(Err(CaptureError::SessionEnded));
    drop(session);
    let frame = Arc::new(frame?);

    self.preview.send_replace(Some(frame.clone()));

    let (width, height) = frame.dimensions();
    let rgb = DynamicImage::ImageRgba8((*frame).clone()).into_rgb8();
    let (bytes, quality) =
      encode_with_ladder(self.ladder, |q| encode_jpeg(rgb.as_raw(), width, height, q))?;
    let encoded = EncodedFrame::jpeg(bytes, width, height);

    self.events.record(
      EventCategory::Screenshot,
      "Screenshot captured",
      [
        ("display", display.id.to_string()),
        ("width", width.to_string()),
        ("height", height.to_string()),
        ("quality", quality.to_string()),
        ("bytes", encoded.bytes.len().to_string()),
      ],
    );
    Ok(encoded)
  }
}
