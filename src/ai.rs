use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

use crate::config::{AiConfig, AppConfig};

/// Generation inputs forwarded from the submit request. The queue core
/// never looks inside; only prompt assembly does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    pub company_code: String,
    pub job_code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_style_source")]
    pub style_source: String,
    #[serde(default)]
    pub default_style_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

fn default_language() -> String {
    "ko".to_owned()
}

fn default_style_source() -> String {
    "generated".to_owned()
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Produces a finite sequence of text chunks for one generation.
pub trait GenerationStreamer: Send + Sync {
    fn stream(&self, params: &GenerateParams) -> ChunkStream;
}

pub fn make_streamer(config: &AppConfig, http: reqwest::Client) -> Arc<dyn GenerationStreamer> {
    match config.ai.clone() {
        Some(ai) => Arc::new(OpenAiStreamer { http, config: ai }),
        None => Arc::new(NullStreamer),
    }
}

/// Placeholder when no provider is configured; every stream fails fast.
pub struct NullStreamer;

impl GenerationStreamer for NullStreamer {
    fn stream(&self, _params: &GenerateParams) -> ChunkStream {
        Box::pin(async_stream::stream! {
            yield Err(anyhow!("AI is not configured (AI_API_KEY is missing)"));
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// Pulls a human-readable message out of a provider error body. The nested
/// OpenAI shape wins over a flat `message` field.
fn provider_error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["/error/message", "/message"]
        .iter()
        .filter_map(|path| value.pointer(path))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|msg| !msg.is_empty())
        .map(str::to_owned)
}

/// Short lossy preview of a raw response body, for error messages when the
/// body is not parseable json.
fn body_preview(body: &[u8]) -> String {
    const MAX_CHARS: usize = 400;
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}

fn build_user_prompt(params: &GenerateParams) -> String {
    let style_hint = match params.style_source.as_str() {
        "default" => params
            .default_style_name
            .clone()
            .unwrap_or_else(|| "general".to_owned()),
        _ => "latest generated style".to_owned(),
    };
    format!(
        "Company: {}\nJob: {}\nStyle: {}\nLanguage: {}\n\nWrite a complete job description in Markdown. Start with a single H1 title line, then sections for responsibilities, qualifications and benefits.",
        params.company_code, params.job_code, style_hint, params.language
    )
}

/// Streams deltas from an OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiStreamer {
    http: reqwest::Client,
    config: AiConfig,
}

impl OpenAiStreamer {
    pub fn new(http: reqwest::Client, config: AiConfig) -> Self {
        Self { http, config }
    }
}

impl GenerationStreamer for OpenAiStreamer {
    fn stream(&self, params: &GenerateParams) -> ChunkStream {
        let http = self.http.clone();
        let config = self.config.clone();
        let params = params.clone();

        Box::pin(async_stream::stream! {
            let url = match config.base_url.join("chat/completions") {
                Ok(url) => url,
                Err(err) => {
                    yield Err(anyhow::Error::from(err).context("invalid AI_BASE_URL"));
                    return;
                }
            };

            let model = params.model.as_deref().unwrap_or(&config.model);
            let user_prompt = build_user_prompt(&params);
            let req = ChatCompletionsRequest {
                model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: "You write polished, accurate job descriptions in Markdown. Do not include URLs.",
                    },
                    ChatMessage {
                        role: "user",
                        content: &user_prompt,
                    },
                ],
                temperature: 0.2,
                stream: true,
            };

            let resp = match http
                .post(url)
                .bearer_auth(&config.api_key)
                .json(&req)
                .send()
                .await
                .context("AI request failed")
            {
                Ok(resp) => resp,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let body = resp.bytes().await.unwrap_or_default();
                let msg = provider_error_message(&body).unwrap_or_else(|| body_preview(&body));
                yield Err(anyhow!("AI returned {status}: {msg}"));
                return;
            }

            let mut body = Box::pin(resp.bytes_stream());
            let mut pending = String::new();
            while let Some(frame) = body.next().await {
                let frame = match frame.context("AI stream read failed") {
                    Ok(frame) => frame,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&frame));

                // SSE frames: one `data: {...}` json per line, ending with
                // a `data: [DONE]` sentinel.
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_owned();
                    pending.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() {
                        continue;
                    }
                    if payload == "[DONE]" {
                        return;
                    }
                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) else {
                        continue;
                    };
                    if let Some(text) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                    {
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                }
            }
        })
    }
}

/// Deterministic streamer for tests: yields a fixed chunk script, or fails
/// after the chunks when primed with an error.
#[cfg(test)]
pub struct ScriptedStreamer {
    chunks: Vec<String>,
    fail_with: Option<String>,
}

#[cfg(test)]
impl ScriptedStreamer {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_owned()).collect(),
            fail_with: None,
        }
    }

    pub fn failing_after(chunks: &[&str], message: &str) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_owned()).collect(),
            fail_with: Some(message.to_owned()),
        }
    }
}

#[cfg(test)]
impl GenerationStreamer for ScriptedStreamer {
    fn stream(&self, _params: &GenerateParams) -> ChunkStream {
        let chunks = self.chunks.clone();
        let fail_with = self.fail_with.clone();
        Box::pin(async_stream::stream! {
            for chunk in chunks {
                yield Ok(chunk);
            }
            if let Some(message) = fail_with {
                yield Err(anyhow!(message));
            }
        })
    }
}
