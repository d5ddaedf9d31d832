use std::sync::Arc;

use serde_json::json;
use tokio_stream::StreamExt;

use crate::ai::{GenerateParams, GenerationStreamer};
use crate::error::GenerationError;
use crate::events::{EVENT_DELTA, EVENT_START, EventHub};
use crate::sink::ResultSink;

#[derive(Debug)]
pub struct StreamOutcome {
    pub saved_id: i64,
    pub title: String,
    pub markdown: String,
}

/// First markdown heading wins; otherwise the fallback.
pub fn title_from_markdown(markdown: &str, fallback: &str) -> String {
    let first = markdown.lines().next().unwrap_or("").trim();
    if first.starts_with('#') {
        let title = first.trim_start_matches('#').trim();
        if !title.is_empty() {
            return title.to_owned();
        }
    }
    fallback.to_owned()
}

/// Drains the generation stream into one markdown document, without any
/// event fan-out. Used by the synchronous submit path.
pub async fn collect_generation(
    streamer: &Arc<dyn GenerationStreamer>,
    params: &GenerateParams,
) -> Result<String, GenerationError> {
    let mut stream = streamer.stream(params);
    let mut markdown = String::new();
    while let Some(chunk) = stream.next().await {
        let text = chunk.map_err(|err| GenerationError::Streamer(err.to_string()))?;
        markdown.push_str(&text);
    }
    Ok(markdown)
}

/// Relays generator chunks into the event hub and finalizes through the
/// result sink. On any failure the partial markdown is discarded; the
/// caller owns the task-state and `error` event bookkeeping.
pub async fn bridge_generation(
    hub: &EventHub,
    streamer: &Arc<dyn GenerationStreamer>,
    sink: &Arc<dyn ResultSink>,
    task_id: &str,
    params: &GenerateParams,
) -> Result<StreamOutcome, GenerationError> {
    hub.publish(task_id, EVENT_START, json!({ "task_id": task_id }));

    let mut stream = streamer.stream(params);
    let mut markdown = String::new();
    while let Some(chunk) = stream.next().await {
        let text = chunk.map_err(|err| GenerationError::Streamer(err.to_string()))?;
        if text.is_empty() {
            continue;
        }
        hub.publish(task_id, EVENT_DELTA, json!({ "text": text }));
        markdown.push_str(&text);
    }

    let fallback = format!("{} {}", params.company_code, params.job_code);
    let title = title_from_markdown(&markdown, &fallback);
    let meta = json!({
        "company_code": params.company_code,
        "job_code": params.job_code,
        "language": params.language,
        "style_source": params.style_source,
        "model": params.model,
    });
    let saved_id = sink
        .save(task_id, &title, &markdown, &meta)
        .await
        .map_err(|err| GenerationError::Sink(err.to_string()))?;

    Ok(StreamOutcome {
        saved_id,
        title,
        markdown,
    })
}
