use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use screenguide::capture::{FrameCapturer, QualityLadder, ScreenFrameSource};
use screenguide::config::{self, load_or_init};
use screenguide::controller::ConversationController;
use screenguide::logger::{EventLog, Logger};
use screenguide::router::{run_router, RouterState};
use screenguide::transport::HttpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let data_dir = config::config_dir()?;
  std::fs::create_dir_all(&data_dir)
    .with_context(|| format!("failed to create {}", data_dir.display()))?;

  let config_path = data_dir.join("config.json");
  let config = load_or_init(&config_path)?;

  let file_log = if config.log_events_to_file {
    Some(Arc::new(Logger::new(&data_dir.join("screenguide.log"))?))
  } else {
    None
  };
  let events = EventLog::new(file_log);

  let capturer = FrameCapturer::new(
    Arc::new(ScreenFrameSource),
    QualityLadder {
      start: config.jpeg_quality,
      floor: config.jpeg_quality_floor,
    },
    events.clone(),
  );
  let transport = HttpTransport::new(&config.endpoint, events.clone())?;
  let controller = ConversationController::new(
    capturer,
    Arc::new(transport),
    config.model_config(),
    events.clone(),
  );

  let listener = std::net::TcpListener::bind(&config.bind_address)
    .with_context(|| format!("failed to bind {}", config.bind_address))?;
  tracing::info!(
    address = %listener.local_addr()?,
    model = %config.model,
    config = %config_path.display(),
    "ScreenGuide starting up"
  );

  run_router(
    listener,
    RouterState {
      started_at: Instant::now(),
      controller,
      events,
    },
  )
  .await
}
