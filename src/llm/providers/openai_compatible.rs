use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::config::VlmConfig;
use crate::errors::{MobileUseError, MobileUseResult};
use crate::llm::provider::{Completion, DeltaStream, VlmProvider};
use crate::llm::sse_parser;
use crate::llm::types::{CallConfig, ChatMessage, StreamChunkKind};

pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    call: CallConfig,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String, call: CallConfig) -> Self {
        Self {
            id,
            api_base,
            api_key,
            call,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &VlmConfig) -> Self {
        Self::new(
            config.model.clone(),
            config.api_base.clone(),
            config.api_key.clone().unwrap_or_default(),
            CallConfig {
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
        )
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> MobileUseResult<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": self.call.model,
            "messages": serde_json::to_value(messages)?,
            "stream": stream,
            "temperature": self.call.temperature,
        });
        if let Some(max_tokens) = self.call.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        Ok(body)
    }
}

#[async_trait]
impl VlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn predict(&self, messages: &[ChatMessage], stream: bool) -> MobileUseResult<Completion> {
        let body = self.request_body(messages, stream)?;

        tracing::debug!(
            provider = %self.id,
            model = %self.call.model,
            stream,
            messages = messages.len(),
            "sending VLM request"
        );
        tracing::trace!(body = %sanitized_for_log(&body), "request body (base64 omitted)");

        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(MobileUseError::VlmProvider(format!("{}: {}", status, err_body)));
        }

        if stream {
            Ok(Completion::Stream(sse_deltas(response)))
        } else {
            let json: serde_json::Value = response.json().await?;
            let content = json["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| {
                    MobileUseError::VlmProvider("response carries no choices[0].message.content".into())
                })?
                .to_string();
            tracing::info!(content_len = content.len(), "VLM JSON response received");
            Ok(Completion::Complete(content))
        }
    }
}

/// Clone the body with every image URL replaced, so logs never carry base64 payloads.
fn sanitized_for_log(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if let Some(url) = part.pointer_mut("/image_url/url") {
                    *url = serde_json::Value::String("<omitted_base64_image>".into());
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    line_buf: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    fn feed(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if b == b'\n' {
                let line = std::mem::take(&mut self.line_buf);
                self.handle_line(&String::from_utf8_lossy(&line));
                if self.done {
                    return;
                }
            } else {
                self.line_buf.push(b);
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match sse_parser::parse_sse_line(line) {
            Ok(Some(chunk)) => match chunk.kind {
                StreamChunkKind::Content => self.pending.push_back(chunk.content),
                StreamChunkKind::Reasoning => {
                    tracing::trace!(len = chunk.content.len(), "reasoning delta ignored");
                }
                StreamChunkKind::Done => self.done = true,
            },
            Ok(None) => {}
            Err(e) => tracing::debug!("SSE parse skipped: {e}"),
        }
    }
}

/// Turn an SSE response body into a stream of content deltas.
fn sse_deltas(response: reqwest::Response) -> DeltaStream {
    let state = SseState {
        bytes: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        line_buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.pending.pop_front() {
                return Some((Ok(delta), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => st.feed(&chunk),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(MobileUseError::from(e)), st));
                }
                None => {
                    // Stream ended without [DONE]; flush a trailing unterminated line.
                    let tail = std::mem::take(&mut st.line_buf);
                    st.handle_line(&String::from_utf8_lossy(&tail));
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}
