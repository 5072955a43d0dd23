//! Text backend for OpenAI-compatible chat-completion APIs.
//!
//! Endpoint: `/v1/chat/completions`, one user turn per call.
//! Streaming: SSE with `data: {"choices": [{"delta": {"content": "token"}}]}`,
//! plus `delta.reasoning_content` for providers that stream reasoning separately.

use super::{
    merge_extra, reject, require_credential, Backend, BackendKind, FragmentSink,
    GenerationRequest, GenerationResult, StreamFragment,
};
use crate::error::Result;
use crate::parsing;
use crate::PipelineError;
use crate::sse::{SseDecoder, SseFrame};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

/// Base URL used when neither the backend nor the request names one.
pub const DEFAULT_CHAT_ENDPOINT: &str = "https://api.openai.com";

/// Backend for any OpenAI-compatible chat-completion API.
///
/// # Example
///
/// ```
/// use agent_pipeline::backend::ChatCompletionBackend;
///
/// let backend = ChatCompletionBackend::new().with_endpoint("http://localhost:8000/v1");
/// ```
#[derive(Debug, Clone)]
pub struct ChatCompletionBackend {
    endpoint: String,
}

impl ChatCompletionBackend {
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_CHAT_ENDPOINT.to_string(),
        }
    }

    /// Set the default base URL; requests may still override it.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The single user message: plain text, or text + image parts.
    fn build_user_content(request: &GenerationRequest) -> Value {
        if request.images.is_empty() {
            return Value::String(request.prompt.clone());
        }

        let mut parts = vec![json!({"type": "text", "text": request.prompt})];
        parts.extend(
            request
                .images
                .iter()
                .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
        );
        Value::Array(parts)
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &GenerationRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": Self::build_user_content(request)}],
            "stream": stream,
        });

        if let Some(t) = request.options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.options.max_tokens {
            body["max_tokens"] = json!(n);
        }
        merge_extra(&mut body, request.options.extra.as_ref());

        body
    }

    async fn send(
        &self,
        client: &Client,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let key = require_credential(self.name(), request)?;
        let url = format!("{}/v1/chat/completions", request.base_url(&self.endpoint));
        let body = Self::build_body(request, stream);

        tracing::debug!(%url, model = %request.model, stream, "Sending chat completion");
        let resp = client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = reject(resp).await;
            tracing::warn!(%url, error = %err, "Chat completion rejected");
            return Err(err);
        }
        Ok(resp)
    }

    /// Pull text and reasoning out of a buffered response.
    ///
    /// A body carrying an `error` object, or no `choices[0].message`, is a
    /// rejection even when the HTTP status was 2xx.
    fn parse_message(status: u16, json_resp: &Value) -> Result<GenerationResult> {
        if let Some(err) = provider_error(status, json_resp) {
            return Err(err);
        }
        let message = &json_resp["choices"][0]["message"];
        if !message.is_object() {
            return Err(rejected(status, json_resp));
        }
        let content = message["content"].as_str().unwrap_or("");
        let reasoning = message["reasoning_content"]
            .as_str()
            .filter(|r| !r.trim().is_empty())
            .map(str::to_string);

        Ok(finish(content.to_string(), reasoning))
    }

    /// Pull the delta fragments out of one streamed chunk.
    fn parse_delta(chunk: &Value) -> Vec<StreamFragment> {
        let delta = &chunk["choices"][0]["delta"];
        let mut fragments = Vec::new();
        if let Some(r) = delta["reasoning_content"].as_str().filter(|r| !r.is_empty()) {
            fragments.push(StreamFragment::Reasoning(r.to_string()));
        }
        if let Some(c) = delta["content"].as_str().filter(|c| !c.is_empty()) {
            fragments.push(StreamFragment::Content(c.to_string()));
        }
        fragments
    }
}

/// `RemoteRejected` for a payload with a non-null `error` member.
fn provider_error(status: u16, payload: &Value) -> Option<PipelineError> {
    payload
        .get("error")
        .filter(|e| !e.is_null())
        .map(|_| rejected(status, payload))
}

fn rejected(status: u16, payload: &Value) -> PipelineError {
    PipelineError::RemoteRejected {
        status,
        body: payload.to_string(),
        retry_after: None,
    }
}

/// Text and reasoning accumulated over one streamed response.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    reasoning: String,
}

impl StreamAccumulator {
    /// Absorb decoded frames, forwarding fragments. Returns `true` once
    /// `[DONE]` is seen; frames after it are ignored.
    fn absorb(
        &mut self,
        status: u16,
        frames: Vec<SseFrame>,
        on_fragment: FragmentSink<'_>,
    ) -> Result<bool> {
        for frame in frames {
            let chunk = match frame {
                SseFrame::Data(chunk) => chunk,
                SseFrame::Done => return Ok(true),
            };
            if let Some(err) = provider_error(status, &chunk) {
                return Err(err);
            }
            for fragment in ChatCompletionBackend::parse_delta(&chunk) {
                match &fragment {
                    StreamFragment::Content(c) => self.content.push_str(c),
                    StreamFragment::Reasoning(r) => self.reasoning.push_str(r),
                }
                on_fragment(fragment);
            }
        }
        Ok(false)
    }

    fn finish(self) -> GenerationResult {
        let reasoning = (!self.reasoning.trim().is_empty()).then_some(self.reasoning);
        finish(self.content, reasoning)
    }
}

/// Assemble the final text result; inline `<think>` blocks become reasoning
/// when the provider did not send it separately.
fn finish(content: String, reasoning: Option<String>) -> GenerationResult {
    if reasoning.is_some() {
        return GenerationResult::Text {
            text: content,
            reasoning,
        };
    }
    let (reasoning, text) = parsing::extract_thinking(&content);
    GenerationResult::Text { text, reasoning }
}

impl Default for ChatCompletionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ChatCompletionBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Text
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    #[tracing::instrument(skip_all, fields(model = %request.model))]
    async fn generate(
        &self,
        client: &Client,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        let resp = self.send(client, request, false).await?;
        let status = resp.status().as_u16();
        let json_resp: Value = resp.json().await?;
        Self::parse_message(status, &json_resp)
    }

    #[tracing::instrument(skip_all, fields(model = %request.model))]
    async fn generate_streaming(
        &self,
        client: &Client,
        request: &GenerationRequest,
        on_fragment: FragmentSink<'_>,
    ) -> Result<GenerationResult> {
        let resp = self.send(client, request, true).await?;
        let status = resp.status().as_u16();

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut acc = StreamAccumulator::default();
        let mut done = false;

        while let Some(chunk) = stream.next().await {
            done = acc.absorb(status, decoder.decode(&chunk?), on_fragment)?;
            if done {
                break;
            }
        }
        if !done {
            acc.absorb(status, decoder.flush(), on_fragment)?;
        }

        Ok(acc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerationOptions;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_request() -> GenerationRequest {
        GenerationRequest::new("gpt-4o", "Why is the sky blue?").with_credential("sk-test")
    }

    #[test]
    fn test_chat_payload_text_only() {
        let body = ChatCompletionBackend::build_body(&test_request(), false);

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], false);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Why is the sky blue?");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_chat_payload_multimodal() {
        let request = test_request().with_images(vec![
            "https://example.com/cat.png".into(),
            "data:image/png;base64,AAAA".into(),
        ]);
        let body = ChatCompletionBackend::build_body(&request, true);

        let parts = body["messages"][0]["content"].as_array().expect("parts");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[0]["text"], "Why is the sky blue?");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "https://example.com/cat.png");
        assert_eq!(parts[2]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_chat_payload_options_and_extra() {
        let request = test_request().with_options(GenerationOptions {
            temperature: Some(0.2),
            max_tokens: Some(512),
            extra: Some(json!({"top_p": 0.9})),
            ..Default::default()
        });
        let body = ChatCompletionBackend::build_body(&request, false);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["top_p"], 0.9);
    }

    #[test]
    fn test_parse_message_with_reasoning_field() {
        let resp = json!({"choices": [{"message": {
            "content": "Rayleigh scattering.",
            "reasoning_content": "short wavelengths scatter more"
        }}]});
        let result = ChatCompletionBackend::parse_message(200, &resp).unwrap();
        assert_eq!(
            result,
            GenerationResult::Text {
                text: "Rayleigh scattering.".into(),
                reasoning: Some("short wavelengths scatter more".into()),
            }
        );
    }

    #[test]
    fn test_parse_message_inline_think_block() {
        let resp = json!({"choices": [{"message": {"content": "<think>hmm</think>Answer"}}]});
        let result = ChatCompletionBackend::parse_message(200, &resp).unwrap();
        assert_eq!(result.response_text(), "Answer");
        assert_eq!(result.reasoning(), Some("hmm"));
    }

    #[test]
    fn test_parse_delta_fragments() {
        let chunk = json!({"choices": [{"delta": {"reasoning_content": "r", "content": "c"}}]});
        assert_eq!(
            ChatCompletionBackend::parse_delta(&chunk),
            vec![
                StreamFragment::Reasoning("r".into()),
                StreamFragment::Content("c".into())
            ]
        );

        let empty = json!({"choices": [{"delta": {"content": ""}}]});
        assert!(ChatCompletionBackend::parse_delta(&empty).is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_network() {
        let backend = ChatCompletionBackend::new().with_endpoint("http://127.0.0.1:9");
        let client = Client::new();
        let request = GenerationRequest::new("gpt-4o", "hi");

        let err = backend.generate(&client, &request).await.unwrap_err();
        assert!(matches!(err, PipelineError::AuthMissing { ref backend } if backend == "openai"));
    }
    #[test]
    fn test_parse_message_error_body_is_rejection() {
        let resp = json!({"error": {"message": "insufficient quota", "code": 429}});
        let err = ChatCompletionBackend::parse_message(200, &resp).unwrap_err();
        match err {
            PipelineError::RemoteRejected { status, body, .. } => {
                assert_eq!(status, 200);
                assert!(body.contains("insufficient quota"));
            }
            other => panic!("expected RemoteRejected, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_without_choices_is_rejection() {
        let err = ChatCompletionBackend::parse_message(200, &json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, PipelineError::RemoteRejected { status: 200, .. }));

        let err = ChatCompletionBackend::parse_message(200, &json!({"choices": []})).unwrap_err();
        assert!(matches!(err, PipelineError::RemoteRejected { .. }));
    }

    #[test]
    fn test_stream_error_frame_is_rejection() {
        let mut acc = StreamAccumulator::default();
        let sink = |_: StreamFragment| {};
        let frames = vec![
            SseFrame::Data(json!({"choices": [{"delta": {"content": "par"}}]})),
            SseFrame::Data(json!({"error": {"message": "overloaded"}})),
        ];
        let err = acc.absorb(200, frames, &sink).unwrap_err();
        assert!(matches!(err, PipelineError::RemoteRejected { ref body, .. } if body.contains("overloaded")));
    }

    /// Read one HTTP request (headers plus `content-length` body).
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    /// Serve one SSE response, writing `chunks` as separate writes.
    async fn serve_sse(chunks: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for chunk in chunks {
                // the client may hang up after [DONE]
                if socket.write_all(&chunk).await.is_err() {
                    return;
                }
                socket.flush().await.ok();
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    async fn stream_from(chunks: Vec<Vec<u8>>) -> (Result<GenerationResult>, Vec<StreamFragment>) {
        let endpoint = serve_sse(chunks).await;
        let backend = ChatCompletionBackend::new().with_endpoint(endpoint);
        let client = Client::builder().no_proxy().build().unwrap();
        let seen = Mutex::new(Vec::new());
        let sink = |fragment: StreamFragment| seen.lock().push(fragment);

        let result = backend
            .generate_streaming(&client, &test_request(), &sink)
            .await;
        (result, seen.into_inner())
    }

    #[tokio::test]
    async fn test_streaming_end_to_end_stops_at_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hé\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        )
        .as_bytes();
        // split inside the two-byte "é"
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let (result, fragments) =
            stream_from(vec![body[..split].to_vec(), body[split..].to_vec()]).await;

        assert_eq!(
            result.unwrap(),
            GenerationResult::Text {
                text: "Héllo".into(),
                reasoning: Some("think".into()),
            }
        );
        assert_eq!(
            fragments,
            vec![
                StreamFragment::Reasoning("think".into()),
                StreamFragment::Content("Hé".into()),
                StreamFragment::Content("llo".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_streaming_unterminated_tail_is_flushed() {
        let (result, fragments) = stream_from(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}".to_vec(),
        ])
        .await;

        assert_eq!(result.unwrap().response_text(), "ab");
        assert_eq!(fragments.len(), 2);
    }

    #[tokio::test]
    async fn test_streaming_error_frame_fails_call() {
        let (result, fragments) = stream_from(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec(),
            b"data: {\"error\":{\"message\":\"rate limited\"}}\n\n".to_vec(),
        ])
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), Some(crate::error::BackendErrorKind::RemoteRejected));
        assert_eq!(fragments, vec![StreamFragment::Content("a".into())]);
    }
}
