//! Prompt construction for every interaction mode.

use crate::config::ModelConfig;
use crate::models::{ChatMessage, ChatRequest, EncodedFrame, Mode};

pub const FULL_ANSWER_SYSTEM_PROMPT: &str = "You are a helpful desktop assistant. The user wants \
  to know how to do something on their computer and has shared a screenshot of their current \
  screen. Answer with clear, numbered, step-by-step instructions formatted in markdown. Refer to \
  the buttons, menus and windows that are visible in the screenshot whenever you can.";

pub const ONE_STEP_SYSTEM_PROMPT: &str = "You are a helpful desktop assistant guiding the user \
  through a task one step at a time. Using the screenshot of their current screen, reply with \
  ONLY the single step they should take now, referring to elements visible on screen. Do not \
  describe any later steps. Format the step in markdown.";

/// Follow-up text for a next-step request.
pub fn next_step_text(step: u32, query: &str) -> String {
  format!(
    "The user is working on the task \"{query}\" and is now on step {step}. Use the new \
     screenshot to infer what they have already completed, then provide ONLY step {step}"
  )
}

/// Follow-up text for a question asked in the middle of a task.
pub fn question_text(query: &str, step: u32, question: &str) -> String {
  format!(
    "The user is working on the task \"{query}\" (currently at step {step}) and asks: \
     \"{question}\". Answer the question using what is visible on screen, and if an action is \
     needed give only that one step"
  )
}

fn system_prompt(mode: Mode, config: &ModelConfig) -> &str {
  match mode {
    Mode::Standalone => FULL_ANSWER_SYSTEM_PROMPT,
    Mode::FirstStep => ONE_STEP_SYSTEM_PROMPT,
    Mode::NextStep | Mode::Question => config
      .follow_up_system_prompt
      .as_deref()
      .unwrap_or(ONE_STEP_SYSTEM_PROMPT),
  }
}

fn user_text(mode: Mode, query: &str, follow_up: Option<&str>) -> String {
  match mode {
    Mode::Standalone => format!(
      "Here is the user's query that you must respond to: {query}. \
       Here is a screenshot of the user's current screen for context."
    ),
    Mode::FirstStep => format!(
      "Here is the user's request: {query}. Provide ONLY THE FIRST STEP. \
       Here is a screenshot of the user's current screen."
    ),
    Mode::NextStep | Mode::Question => {
      let text = follow_up.unwrap_or(query);
      format!(
        "Here is the follow-up step request: {text}. Here is the current screenshot for context."
      )
    }
  }
}

pub fn build(
  mode: Mode,
  query: &str,
  follow_up: Option<&str>,
  frame: &EncodedFrame,
  config: &ModelConfig,
) -> ChatRequest {
  ChatRequest {
    model: config.model.clone(),
    messages: vec![
      ChatMessage::system(system_prompt(mode, config)),
      ChatMessage::user_with_frame(user_text(mode, query, follow_up), frame),
    ],
    temperature: config.temperature,
    stream: true,
  }
}
