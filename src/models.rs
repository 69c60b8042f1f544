use base64::Engine;
use serde::{Deserialize, Serialize};

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";

/// One captured frame, compressed and ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
  pub bytes: Vec<u8>,
  pub media_type: String,
  pub base64: String,
  pub width: u32,
  pub height: u32,
}

impl EncodedFrame {
  pub fn jpeg(bytes: Vec<u8>, width: u32, height: u32) -> Self {
    let base64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Self {
      bytes,
      media_type: JPEG_MEDIA_TYPE.to_string(),
      base64,
      width,
      height,
    }
  }

  pub fn data_url(&self) -> String {
    format!("data:{};base64,{}", self.media_type, self.base64)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  System,
  User,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImageUrl {
  pub url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
  pub fn image(frame: &EncodedFrame) -> Self {
    ContentPart::ImageUrl {
      image_url: ImageUrl {
        url: frame.data_url(),
      },
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
  Text(String),
  Parts(Vec<ContentPart>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
  pub role: Role,
  pub content: MessageContent,
}

impl ChatMessage {
  pub fn system(text: impl Into<String>) -> Self {
    Self {
      role: Role::System,
      content: MessageContent::Text(text.into()),
    }
  }

  pub fn user_with_frame(text: impl Into<String>, frame: &EncodedFrame) -> Self {
    Self {
      role: Role::User,
      content: MessageContent::Parts(vec![
        ContentPart::Text { text: text.into() },
        ContentPart::image(frame),
      ]),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
  pub model: String,
  pub messages: Vec<ChatMessage>,
  pub temperature: f32,
  pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
  Text(String),
  Completed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  Standalone,
  FirstStep,
  NextStep,
  Question,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Idle,
  CapturingFrame,
  AwaitingResponse,
  Errored,
  Completed,
}

impl Status {
  pub fn in_flight(self) -> bool {
    matches!(self, Status::CapturingFrame | Status::AwaitingResponse)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
  pub mode: Mode,
  pub step_number: u32,
  pub query: String,
  pub pending_question: Option<String>,
  pub accumulated_text: String,
  pub status: Status,
  pub last_error: Option<String>,
}

impl Default for ConversationState {
  fn default() -> Self {
    Self {
      mode: Mode::Standalone,
      step_number: 0,
      query: String::new(),
      pending_question: None,
      accumulated_text: String::new(),
      status: Status::Idle,
      last_error: None,
    }
  }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ControllerUpdate {
  State(ConversationState),
  Delta(String),
}

#[derive(Serialize, Deserialize, Default)]
pub struct QueryRequest {
  pub query: String,
  pub api_key: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct QuestionRequest {
  pub question: String,
  pub api_key: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
pub struct NextStepRequest {
  pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn user_message_serializes_text_then_image_part() {
    let frame = EncodedFrame::jpeg(vec![1, 2, 3], 2, 2);
    let message = ChatMessage::user_with_frame("hello", &frame);
    let value = serde_json::to_value(&message).expect("serialize");

    assert_eq!(value["role"], "user");
    assert_eq!(value["content"][0]["type"], "text");
    assert_eq!(value["content"][0]["text"], "hello");
    assert_eq!(value["content"][1]["type"], "image_url");
    assert_eq!(value["content"][1]["image_url"]["url"], "data:image/jpeg;base64,AQID");
  }

  #[test]
  fn system_message_serializes_plain_string() {
    let value = serde_json::to_value(ChatMessage::system("be brief")).expect("serialize");
    assert_eq!(value, serde_json::json!({ "role": "system", "content": "be brief" }));
  }

  #[test]
  fn controller_update_is_tagged() {
    let value = serde_json::to_value(ControllerUpdate::Delta("hi".to_string())).expect("serialize");
    assert_eq!(value, serde_json::json!({ "kind": "delta", "data": "hi" }));
  }
}
