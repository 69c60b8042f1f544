use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
  #[error("Screen capture permission denied.")]
  PermissionDenied,

  #[error("No capturable displays found.")]
  NoCapturableContent,

  #[error("Failed to encode the captured frame.")]
  EncodingFailed,

  #[error("Capture session ended before delivering a frame.")]
  SessionEnded,

  #[error("Capture backend error: {0}")]
  Backend(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("Invalid endpoint: {0}")]
  InvalidEndpoint(String),

  #[error("Invalid credentials: {0}")]
  InvalidCredentials(String),

  #[error("{0}")]
  ApiError(String),

  #[error("Network error: {0}")]
  NetworkError(#[from] reqwest::Error),

  #[error("Failed to decode stream line: {0}")]
  DecodingError(#[from] serde_json::Error),
}

/// Why the controller refused to start an interaction. Rejections never touch state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ActionRejected {
  #[error("Input text is empty.")]
  EmptyInput,

  #[error("An interaction is already in flight.")]
  Busy,

  #[error("The last interaction failed; reset before starting another.")]
  NeedsReset,

  #[error("No step-based task is active.")]
  NoActiveTask,
}

impl ActionRejected {
  pub fn code(&self) -> &'static str {
    match self {
      ActionRejected::EmptyInput => "empty_input",
      ActionRejected::Busy => "busy",
      ActionRejected::NeedsReset => "needs_reset",
      ActionRejected::NoActiveTask => "no_active_task",
    }
  }
}
