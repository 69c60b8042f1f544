use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio_stream::{Stream, StreamExt};

use crate::error::TransportError;
use crate::logger::{EventCategory, EventLog};
use crate::models::{ChatRequest, StreamChunk};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
const MAX_LINE_BYTES: usize = 1024 * 1024;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, TransportError>> + Send>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
  /// One HTTP exchange. The returned stream ends with `StreamChunk::Completed` or an error.
  async fn send(
    &self,
    request: ChatRequest,
    credentials: &str,
  ) -> Result<ChunkStream, TransportError>;
}

#[derive(Deserialize)]
struct StreamRecord {
  #[serde(default)]
  choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
  #[serde(default)]
  delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
  content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
  error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
  message: String,
}

/// Decodes one body line. `Ok(None)` covers blank lines, non-data records, the sentinel
/// and deltas without text.
pub fn parse_stream_line(line: &str) -> Result<Option<String>, TransportError> {
  let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
  if line.is_empty() {
    return Ok(None);
  }
  let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
    return Ok(None);
  };
  if payload.trim() == DONE_SENTINEL {
    return Ok(None);
  }

  let record: StreamRecord = serde_json::from_str(payload)?;
  Ok(
    record
      .choices
      .into_iter()
      .next()
      .and_then(|choice| choice.delta.content)
      .filter(|text| !text.is_empty()),
  )
}

fn api_error_message(status: StatusCode, body: &str) -> String {
  match serde_json::from_str::<ApiErrorBody>(body) {
    Ok(parsed) => parsed.error.message,
    Err(_) => format!("HTTP Error: {}", status.as_u16()),
  }
}

fn decode_line(raw: &[u8], events: &EventLog, skipped: &mut usize) -> Option<String> {
  let line = String::from_utf8_lossy(raw);
  match parse_stream_line(&line) {
    Ok(text) => text,
    Err(err) => {
      *skipped += 1;
      events.record(
        EventCategory::Response,
        "Skipped malformed stream line",
        [("error", err.to_string()), ("line", line.trim_end().to_string())],
      );
      None
    }
  }
}

/// Splits a streamed body into lines and turns them into chunks, in source order.
pub fn chunk_stream<S, B, E>(body: S, events: EventLog) -> ChunkStream
where
  S: Stream<Item = Result<B, E>> + Send + 'static,
  B: AsRef<[u8]> + Send + 'static,
  E: Into<TransportError> + Send + 'static,
{
  chunk_stream_with_limit(body, events, MAX_LINE_BYTES)
}

/// A line longer than `max_line` bytes is skipped like a malformed one; its bytes are
/// dropped up to the next newline.
fn chunk_stream_with_limit<S, B, E>(body: S, events: EventLog, max_line: usize) -> ChunkStream
where
  S: Stream<Item = Result<B, E>> + Send + 'static,
  B: AsRef<[u8]> + Send + 'static,
  E: Into<TransportError> + Send + 'static,
{
  let stream = stream! {
    let mut body = Box::pin(body);
    let mut buffer: Vec<u8> = Vec::new();
    let mut discarding = false;
    let mut emitted = 0usize;
    let mut skipped = 0usize;

    while let Some(piece) = body.next().await {
      let piece = match piece {
        Ok(piece) => piece,
        Err(err) => {
          let err: TransportError = err.into();
          events.record(
            EventCategory::Error,
            "Response stream failed",
            [("error", err.to_string())],
          );
          yield Err(err);
          return;
        }
      };

      buffer.extend_from_slice(piece.as_ref());
      while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        if discarding {
          discarding = false;
          continue;
        }
        if let Some(text) = decode_line(&line, &events, &mut skipped) {
          emitted += 1;
          yield Ok(StreamChunk::Text(text));
        }
      }

      if buffer.len() > max_line {
        if !discarding {
          skipped += 1;
          events.record(
            EventCategory::Response,
            "Skipped oversized stream line",
            [("limit", max_line)],
          );
          discarding = true;
        }
        buffer.clear();
      }
    }

    if !buffer.is_empty() && !discarding {
      if let Some(text) = decode_line(&buffer, &events, &mut skipped) {
        emitted += 1;
        yield Ok(StreamChunk::Text(text));
      }
    }

    if emitted == 0 {
      events.record(
        EventCategory::Response,
        "Empty response stream",
        [("skipped_lines", skipped)],
      );
    } else {
      events.record(
        EventCategory::Response,
        "Response stream completed",
        [("chunks", emitted), ("skipped_lines", skipped)],
      );
    }
    yield Ok(StreamChunk::Completed);
  };

  Box::pin(stream)
}

/// OpenAI-compatible chat completions over HTTP.
pub struct HttpTransport {
  client: reqwest::Client,
  endpoint: Url,
  events: EventLog,
}

impl HttpTransport {
  pub fn new(endpoint: &str, events: EventLog) -> Result<Self, TransportError> {
    let url = Url::parse(endpoint)
      .map_err(|err| TransportError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
      return Err(TransportError::InvalidEndpoint(format!(
        "{endpoint}: unsupported scheme {}",
        url.scheme()
      )));
    }
    Ok(Self {
      client: reqwest::Client::new(),
      endpoint: url,
      events,
    })
  }
}

#[async_trait]
impl ChatTransport for HttpTransport {
  async fn send(
    &self,
    request: ChatRequest,
    credentials: &str,
  ) -> Result<ChunkStream, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", credentials))
        .map_err(|err| TransportError::InvalidCredentials(err.to_string()))?,
    );

    self.events.record(
      EventCategory::Request,
      "Request dispatched",
      [
        ("endpoint", self.endpoint.to_string()),
        ("model", request.model.clone()),
        ("messages", request.messages.len().to_string()),
      ],
    );

    let resp = self
      .client
      .post(self.endpoint.clone())
      .headers(headers)
      .json(&request)
      .send()
      .await?;

    let status = resp.status();
    if !status.is_success() {
      let text = resp.text().await.unwrap_or_default();
      let message = api_error_message(status, &text);
      self.events.record(
        EventCategory::Error,
        "API request failed",
        [("status", status.as_u16().to_string()), ("message", message.clone())],
      );
      return Err(TransportError::ApiError(message));
    }

    self.events.record(
      EventCategory::Response,
      "Response received",
      [("status", status.as_u16())],
    );
    Ok(chunk_stream(resp.bytes_stream(), self.events.clone()))
  }
}

#[cfg(test)]
mod tests {
  use wiremock::matchers::{body_partial_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  use super::*;
  use crate::logger::DiagnosticEvent;
  use crate::models::ChatMessage;

  fn request() -> ChatRequest {
    ChatRequest {
      model: "gpt-4o".to_string(),
      messages: vec![ChatMessage::system("sys")],
      temperature: 0.7,
      stream: true,
    }
  }

  fn delta(text: &str) -> String {
    let record = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
    format!("data: {record}\n")
  }

  async fn collect(mut stream: ChunkStream) -> Vec<Result<StreamChunk, TransportError>> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
      out.push(item);
    }
    out
  }

  fn texts(items: &[Result<StreamChunk, TransportError>]) -> Vec<String> {
    items
      .iter()
      .filter_map(|item| match item {
        Ok(StreamChunk::Text(text)) => Some(text.clone()),
        _ => None,
      })
      .collect()
  }

  async fn serve(status: u16, body: String) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/v1/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .and(body_partial_json(serde_json::json!({ "model": "gpt-4o", "stream": true })))
      .respond_with(ResponseTemplate::new(status).set_body_string(body))
      .mount(&server)
      .await;
    server
  }

  fn transport(server: &MockServer, events: EventLog) -> HttpTransport {
    let endpoint = format!("{}/v1/chat/completions", server.uri());
    HttpTransport::new(&endpoint, events).expect("transport")
  }

  fn drain(rx: &mut tokio::sync::broadcast::Receiver<DiagnosticEvent>) -> Vec<DiagnosticEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
      out.push(event);
    }
    out
  }

  #[test]
  fn parse_stream_line_cases() {
    assert_eq!(parse_stream_line("").expect("blank"), None);
    assert_eq!(parse_stream_line(": keep-alive").expect("comment"), None);
    assert_eq!(parse_stream_line("event: message").expect("event"), None);
    assert_eq!(parse_stream_line("data: [DONE]").expect("done"), None);
    assert_eq!(
      parse_stream_line("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r")
        .expect("delta"),
      Some("Hi".to_string())
    );
    assert_eq!(
      parse_stream_line("data: {\"choices\":[{\"delta\":{}}]}").expect("role only"),
      None
    );
    assert!(matches!(
      parse_stream_line("data: {not json"),
      Err(TransportError::DecodingError(_))
    ));
  }

  #[tokio::test]
  async fn well_formed_stream_concatenates_in_order() {
    let body = format!(
      ": preamble\n\n{}\n{}\n{}\ndata: [DONE]\n\n",
      delta("Open "),
      delta("the "),
      delta("**Mail** app")
    );
    let server = serve(200, body).await;

    let stream = transport(&server, EventLog::default())
      .send(request(), "sk-test")
      .await
      .expect("stream");
    let items = collect(stream).await;

    assert_eq!(texts(&items).concat(), "Open the **Mail** app");
    assert!(matches!(items.last(), Some(Ok(StreamChunk::Completed))));
    assert!(items.iter().all(|item| item.is_ok()));
  }

  #[tokio::test]
  async fn malformed_lines_are_skipped() {
    let body = format!(
      "{}data: {{broken\n{}data: {{\"choices\": 5}}\n{}data: [DONE]\n",
      delta("one"),
      delta("two"),
      delta("three")
    );
    let server = serve(200, body).await;
    let events = EventLog::default();
    let mut rx = events.subscribe();

    let stream = transport(&server, events).send(request(), "sk-test").await.expect("stream");
    let items = collect(stream).await;

    assert_eq!(texts(&items), vec!["one", "two", "three"]);
    assert!(items.iter().all(|item| item.is_ok()));
    let skipped = drain(&mut rx)
      .into_iter()
      .filter(|e| e.message == "Skipped malformed stream line")
      .count();
    assert_eq!(skipped, 2);
  }

  #[tokio::test]
  async fn api_error_message_is_extracted() {
    let body = r#"{"error":{"message":"boom","type":"invalid_request_error"}}"#;
    let server = serve(400, body.to_string()).await;

    let result = transport(&server, EventLog::default()).send(request(), "sk-test").await;

    match result {
      Err(TransportError::ApiError(message)) => assert!(message.contains("boom")),
      Err(other) => panic!("expected ApiError, got {other:?}"),
      Ok(_) => panic!("expected ApiError, got a stream"),
    }
  }

  #[tokio::test]
  async fn unparseable_error_body_reports_status() {
    let server = serve(503, "<html>unavailable</html>".to_string()).await;

    let result = transport(&server, EventLog::default()).send(request(), "sk-test").await;

    match result {
      Err(TransportError::ApiError(message)) => assert_eq!(message, "HTTP Error: 503"),
      Err(other) => panic!("expected ApiError, got {other:?}"),
      Ok(_) => panic!("expected ApiError, got a stream"),
    }
  }

  #[tokio::test]
  async fn empty_stream_completes_with_soft_diagnostic() {
    let server = serve(200, "data: [DONE]\n".to_string()).await;
    let events = EventLog::default();
    let mut rx = events.subscribe();

    let stream = transport(&server, events).send(request(), "sk-test").await.expect("stream");
    let items = collect(stream).await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Ok(StreamChunk::Completed)));
    assert!(drain(&mut rx).iter().any(|e| e.message == "Empty response stream"));
  }

  #[tokio::test]
  async fn lines_split_across_body_pieces_are_reassembled() {
    let pieces: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
      Ok(b"data: {\"choices\":[{\"delta\":{\"con".to_vec()),
      Ok(b"tent\":\"caf\xC3".to_vec()),
      Ok(b"\xA9\"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}".to_vec()),
    ];

    let items = collect(chunk_stream(tokio_stream::iter(pieces), EventLog::default())).await;

    assert_eq!(texts(&items), vec!["café", "!"]);
    assert!(matches!(items.last(), Some(Ok(StreamChunk::Completed))));
  }

  #[tokio::test]
  async fn failure_midway_keeps_earlier_text_and_never_completes() {
    let pieces: Vec<Result<Vec<u8>, TransportError>> = vec![
      Ok(delta("part").into_bytes()),
      Err(TransportError::ApiError("conn reset".to_string())),
      Ok(delta("never").into_bytes()),
    ];
    let events = EventLog::default();
    let mut rx = events.subscribe();

    let items = collect(chunk_stream(tokio_stream::iter(pieces), events)).await;

    assert_eq!(items.len(), 2);
    assert_eq!(texts(&items), vec!["part"]);
    match items.last() {
      Some(Err(TransportError::ApiError(message))) => assert_eq!(message, "conn reset"),
      other => panic!("expected the stream error last, got {other:?}"),
    }
    assert!(!items.iter().any(|item| matches!(item, Ok(StreamChunk::Completed))));
    assert!(drain(&mut rx).iter().any(|e| e.message == "Response stream failed"));
  }

  #[tokio::test]
  async fn oversized_line_is_dropped_up_to_the_next_newline() {
    let pieces: Vec<Result<Vec<u8>, TransportError>> = vec![
      Ok(vec![b'x'; 50]),
      Ok(vec![b'y'; 50]),
      Ok(vec![b'y'; 50]),
      Ok(format!("zzz\n{}", delta("ok")).into_bytes()),
    ];
    let events = EventLog::default();
    let mut rx = events.subscribe();

    let items = collect(chunk_stream_with_limit(tokio_stream::iter(pieces), events, 64)).await;

    assert_eq!(texts(&items), vec!["ok"]);
    assert!(matches!(items.last(), Some(Ok(StreamChunk::Completed))));
    let oversized = drain(&mut rx)
      .into_iter()
      .filter(|e| e.message == "Skipped oversized stream line")
      .count();
    assert_eq!(oversized, 1);
  }

  #[test]
  fn invalid_endpoint_is_rejected() {
    assert!(matches!(
      HttpTransport::new("not a url", EventLog::default()),
      Err(TransportError::InvalidEndpoint(_))
    ));
    assert!(matches!(
      HttpTransport::new("ftp://example.com/chat", EventLog::default()),
      Err(TransportError::InvalidEndpoint(_))
    ));
  }

  #[tokio::test]
  async fn connection_failure_is_network_error() {
    let endpoint = "http://127.0.0.1:1/v1/chat/completions";
    let transport = HttpTransport::new(endpoint, EventLog::default()).expect("transport");

    let result = transport.send(request(), "sk-test").await;

    assert!(matches!(result, Err(TransportError::NetworkError(_))));
  }
}
