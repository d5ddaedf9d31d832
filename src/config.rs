use std::{
    env, fmt,
    net::{IpAddr, SocketAddr},
};

use anyhow::{Context, Result};
use url::Url;

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub public_base_url: Url,
    pub queue: QueueConfig,
    pub ai: Option<AiConfig>,
}

/// Admission-control and ETA knobs for the request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_inflight_global: usize,
    pub max_inflight_per_user: usize,
    pub admit_batch_size: usize,
    pub queued_ttl_sec: u64,
    pub eta_window: usize,
    pub metrics_backend: MetricsBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsBackend {
    Noop,
    Prom,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_inflight_global: 16,
            max_inflight_per_user: 2,
            admit_batch_size: 64,
            queued_ttl_sec: 1800,
            eta_window: 50,
            metrics_backend: MetricsBackend::Noop,
        }
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub base_url: Url,
    pub model: String,
    pub api_key: String,
}

// Hand-written so the key can never leak through a debug log.
impl fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AiConfig {{ base_url: {}, model: {}, api_key: *** }}",
            self.base_url, self.model
        )
    }
}

/// Parses and normalizes the provider base url. `Url::join` drops the last
/// path segment unless the base ends with a slash, so one is appended here.
fn parse_ai_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).context("invalid AI_BASE_URL")?;
    if !url.path().ends_with('/') {
        let slashed = format!("{}/", url.path());
        url.set_path(&slashed);
    }
    Ok(url)
}

/// AI access is optional: without an api key the server still runs and
/// fails generation requests with a clear message.
fn ai_config_from_env() -> Result<Option<AiConfig>> {
    let Ok(api_key) = env::var("AI_API_KEY") else {
        return Ok(None);
    };
    let api_key = api_key.trim().to_owned();
    if api_key.is_empty() {
        return Ok(None);
    }

    let base_url = match env::var("AI_BASE_URL") {
        Ok(raw) => parse_ai_base_url(&raw)?,
        Err(_) => parse_ai_base_url("https://api.openai.com/v1/")?,
    };
    let model = env::var("AI_MODEL")
        .ok()
        .map(|m| m.trim().to_owned())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "gpt-4o-mini".to_owned());

    Ok(Some(AiConfig {
        base_url,
        model,
        api_key,
    }))
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("public_base_url", &self.public_base_url)
            .field("queue", &self.queue)
            .field("ai", &self.ai)
            .finish()
    }
}

fn usize_env(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid {name} (expected non-negative integer)")),
        Err(_) => Ok(default),
    }
}

fn u64_env(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {name} (expected non-negative integer)")),
        Err(_) => Ok(default),
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_backend = match env::var("QUEUE_METRICS")
            .unwrap_or_else(|_| "noop".to_owned())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "" | "noop" => MetricsBackend::Noop,
            "prom" => MetricsBackend::Prom,
            other => anyhow::bail!("invalid QUEUE_METRICS: {other} (expected noop|prom)"),
        };

        Ok(Self {
            max_inflight_global: usize_env("QUEUE_MAX_INFLIGHT", 16)?,
            max_inflight_per_user: usize_env("QUEUE_USER_MAX_INFLIGHT", 2)?,
            admit_batch_size: usize_env("QUEUE_ADMIT_BATCH", 64)?,
            queued_ttl_sec: u64_env("QUEUE_TTL_SEC", 1800)?,
            eta_window: usize_env("QUEUE_ETA_WINDOW", 50)?,
            metrics_backend,
        })
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr: SocketAddr = env::var("JDLOOM_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:58080".to_owned())
            .parse()
            .context("invalid JDLOOM_BIND_ADDR (expected ip:port)")?;

        let default_host = match bind_addr.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => "127.0.0.1".to_owned(),
            IpAddr::V6(v6) if v6.is_unspecified() => "127.0.0.1".to_owned(),
            ip => ip.to_string(),
        };
        let public_base_url = env::var("JDLOOM_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", default_host, bind_addr.port()));
        let public_base_url =
            Url::parse(&public_base_url).context("invalid JDLOOM_PUBLIC_BASE_URL")?;

        Ok(Self {
            bind_addr,
            public_base_url,
            queue: QueueConfig::from_env()?,
            ai: ai_config_from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MetricsBackend, QueueConfig, parse_ai_base_url};

    #[test]
    fn ai_base_url_always_gains_a_trailing_slash() {
        let url = parse_ai_base_url("https://llm.example.com/v1").expect("parse base url");
        assert_eq!(url.as_str(), "https://llm.example.com/v1/");
        let url = parse_ai_base_url("https://llm.example.com/v1/").expect("parse base url");
        assert_eq!(url.as_str(), "https://llm.example.com/v1/");
        assert!(parse_ai_base_url("not a url").is_err());
    }

    #[test]
    fn queue_config_defaults_match_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.max_inflight_global, 16);
        assert_eq!(cfg.max_inflight_per_user, 2);
        assert_eq!(cfg.admit_batch_size, 64);
        assert_eq!(cfg.queued_ttl_sec, 1800);
        assert_eq!(cfg.eta_window, 50);
        assert_eq!(cfg.metrics_backend, MetricsBackend::Noop);
    }
}
