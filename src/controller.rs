use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::StreamExt;

use crate::capture::FrameCapturer;
use crate::config::ModelConfig;
use crate::error::ActionRejected;
use crate::logger::{EventCategory, EventLog};
use crate::models::{ControllerUpdate, ConversationState, Mode, Status, StreamChunk};
use crate::prompts;
use crate::transport::ChatTransport;

struct Inner {
  state: ConversationState,
  /// Bumped on every dispatch and reset; work tagged with an older value is dropped.
  generation: u64,
  task: Option<AbortHandle>,
}

impl Inner {
  fn ensure_ready(&self) -> Result<(), ActionRejected> {
    if self.state.status.in_flight() {
      return Err(ActionRejected::Busy);
    }
    if self.state.status == Status::Errored {
      return Err(ActionRejected::NeedsReset);
    }
    Ok(())
  }
}

struct Shared {
  capturer: FrameCapturer,
  transport: Arc<dyn ChatTransport>,
  model: ModelConfig,
  events: EventLog,
  updates: broadcast::Sender<ControllerUpdate>,
  inner: Mutex<Inner>,
}

/// Drives capture, request building and streaming for one interaction at a time.
#[derive(Clone)]
pub struct ConversationController {
  shared: Arc<Shared>,
}

fn non_empty(text: &str) -> Result<&str, ActionRejected> {
  let text = text.trim();
  if text.is_empty() {
    Err(ActionRejected::EmptyInput)
  } else {
    Ok(text)
  }
}

impl ConversationController {
  pub fn new(
    capturer: FrameCapturer,
    transport: Arc<dyn ChatTransport>,
    model: ModelConfig,
    events: EventLog,
  ) -> Self {
    let (updates, _) = broadcast::channel(512);
    Self {
      shared: Arc::new(Shared {
        capturer,
        transport,
        model,
        events,
        updates,
        inner: Mutex::new(Inner {
          state: ConversationState::default(),
          generation: 0,
          task: None,
        }),
      }),
    }
  }

  pub fn capturer(&self) -> &FrameCapturer {
    &self.shared.capturer
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ControllerUpdate> {
    self.shared.updates.subscribe()
  }

  pub async fn state(&self) -> ConversationState {
    self.shared.inner.lock().await.state.clone()
  }

  /// One-shot full answer. Ends any step task.
  pub async fn ask(
    &self,
    query: &str,
    credentials: &str,
  ) -> Result<JoinHandle<()>, ActionRejected> {
    let query = non_empty(query)?;
    let mut inner = self.shared.inner.lock().await;
    inner.ensure_ready()?;

    inner.state.mode = Mode::Standalone;
    inner.state.step_number = 0;
    inner.state.query = query.to_string();
    inner.state.pending_question = None;
    Ok(self.dispatch(&mut inner, credentials))
  }

  pub async fn start_task(
    &self,
    query: &str,
    credentials: &str,
  ) -> Result<JoinHandle<()>, ActionRejected> {
    let query = non_empty(query)?;
    let mut inner = self.shared.inner.lock().await;
    inner.ensure_ready()?;

    inner.state.mode = Mode::FirstStep;
    inner.state.step_number = 1;
    inner.state.query = query.to_string();
    inner.state.pending_question = None;
    Ok(self.dispatch(&mut inner, credentials))
  }

  pub async fn next_step(&self, credentials: &str) -> Result<JoinHandle<()>, ActionRejected> {
    let mut inner = self.shared.inner.lock().await;
    inner.ensure_ready()?;
    if inner.state.step_number == 0 {
      return Err(ActionRejected::NoActiveTask);
    }

    inner.state.mode = Mode::NextStep;
    inner.state.step_number += 1;
    inner.state.pending_question = None;
    Ok(self.dispatch(&mut inner, credentials))
  }

  pub async fn ask_question(
    &self,
    question: &str,
    credentials: &str,
  ) -> Result<JoinHandle<()>, ActionRejected> {
    let question = non_empty(question)?;
    let mut inner = self.shared.inner.lock().await;
    inner.ensure_ready()?;
    if inner.state.step_number == 0 {
      return Err(ActionRejected::NoActiveTask);
    }

    inner.state.mode = Mode::Question;
    inner.state.step_number += 1;
    inner.state.pending_question = Some(question.to_string());
    Ok(self.dispatch(&mut inner, credentials))
  }

  /// Returns to Idle from any state. An in-flight interaction is aborted and its
  /// remaining results are discarded.
  pub async fn reset(&self) {
    let mut inner = self.shared.inner.lock().await;
    inner.generation += 1;
    if let Some(task) = inner.task.take() {
      task.abort();
    }
    inner.state = ConversationState::default();
    self.shared.publish_state(&inner.state);
  }

  fn dispatch(&self, inner: &mut Inner, credentials: &str) -> JoinHandle<()> {
    inner.generation += 1;
    let generation = inner.generation;
    inner.state.accumulated_text.clear();
    inner.state.last_error = None;
    inner.state.status = Status::CapturingFrame;
    self.shared.publish_state(&inner.state);

    let shared = self.shared.clone();
    let credentials = credentials.to_string();
    let interaction = uuid::Uuid::new_v4().to_string();
    let handle =
      tokio::spawn(async move { shared.run(generation, interaction, credentials).await });
    inner.task = Some(handle.abort_handle());
    handle
  }
}

impl Shared {
  fn publish_state(&self, state: &ConversationState) {
    let _ = self.updates.send(ControllerUpdate::State(state.clone()));
  }

  async fn run(&self, generation: u64, interaction: String, credentials: String) {
    let frame = match self.capturer.acquire_frame().await {
      Ok(frame) => frame,
      Err(err) => return self.fail(generation, &interaction, err.to_string()).await,
    };

    let request = {
      let mut inner = self.inner.lock().await;
      if inner.generation != generation {
        return;
      }
      let state = &mut inner.state;
      let question = state.pending_question.take();
      let follow_up = match state.mode {
        Mode::NextStep => Some(prompts::next_step_text(state.step_number, &state.query)),
        Mode::Question => Some(prompts::question_text(
          &state.query,
          state.step_number,
          question.as_deref().unwrap_or_default(),
        )),
        Mode::Standalone | Mode::FirstStep => None,
      };
      let request =
        prompts::build(state.mode, &state.query, follow_up.as_deref(), &frame, &self.model);

      state.status = Status::AwaitingResponse;
      self.events.record(
        EventCategory::Request,
        "Interaction request built",
        [
          ("interaction", interaction.clone()),
          ("mode", format!("{:?}", state.mode)),
          ("step", state.step_number.to_string()),
        ],
      );
      self.publish_state(state);
      request
    };
    drop(frame);

    let mut stream = match self.transport.send(request, &credentials).await {
      Ok(stream) => stream,
      Err(err) => return self.fail(generation, &interaction, err.to_string()).await,
    };

    while let Some(item) = stream.next().await {
      match item {
        Ok(StreamChunk::Text(text)) => {
          let mut inner = self.inner.lock().await;
          if inner.generation != generation {
            return;
          }
          inner.state.accumulated_text.push_str(&text);
          let _ = self.updates.send(ControllerUpdate::Delta(text));
        }
        Ok(StreamChunk::Completed) => break,
        Err(err) => return self.fail(generation, &interaction, err.to_string()).await,
      }
    }

    let mut inner = self.inner.lock().await;
    if inner.generation != generation {
      return;
    }
    inner.state.status = Status::Completed;
    inner.task = None;
    self.publish_state(&inner.state);
  }

  async fn fail(&self, generation: u64, interaction: &str, message: String) {
    let mut inner = self.inner.lock().await;
    if inner.generation != generation {
      return;
    }
    self.events.record(
      EventCategory::Error,
      "Interaction failed",
      [
        ("interaction", interaction.to_string()),
        ("error", message.clone()),
        ("step", inner.state.step_number.to_string()),
      ],
    );
    inner.state.status = Status::Errored;
    inner.state.last_error = Some(message);
    inner.task = None;
    self.publish_state(&inner.state);
  }
}
