//! Backend drivers behind a single [`ChatProvider`] trait.
//!
//! Every backend — local (Ollama, LM Studio) or cloud (OpenAI-compatible,
//! OpenRouter) — is reached through the same chat-completions wire format.
//! [`OpenAICompatibleProvider`] implements the common request/stream/parse
//! path once; [`Backend`] carries the handful of per-backend quirks
//! (context-length escalation, model-load preamble, extra headers).

use crate::codec::{build_request, read_bounded_body};
use crate::types::{ContentBlock, Message, OpenAIChunk};
use crate::utils::ToolCallAggregator;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

/// Stream of content blocks produced by a streaming chat call.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ContentBlock>> + Send>>;

/// Whether a provider talks to a process on this machine or a hosted API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Cloud,
}

/// Feature flags a provider advertises so callers (and the chain) know which
/// optional capabilities are safe to invoke.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderFeatures {
    pub native_tool_calling: bool,
    pub model_management: bool,
    pub streaming: bool,
}

/// One entry in a [`ChatProvider::list_models`] result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
}

/// Static facts about a provider, used by the chain and by diagnostics.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub features: ProviderFeatures,
}

/// A single backend capable of running chat completions.
///
/// Implementors drive one HTTP endpoint. [`crate::chain::ProviderChain`]
/// holds an ordered list of these and fails over between them according to
/// [`crate::classify::ErrorClass`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Runs a non-streaming chat turn, returning the complete set of content
    /// blocks the model produced.
    async fn chat(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<Vec<ContentBlock>>;

    /// Runs a streaming chat turn.
    async fn chat_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<ChatStream>;

    /// Cheap reachability probe, used by the chain to skip known-dead
    /// providers without spending a full request budget.
    async fn health_check(&self) -> Result<()>;

    /// Static metadata about this provider.
    fn info(&self) -> ProviderInfo;

    /// Lists models known to the provider's server. Only meaningful when
    /// `info().features.model_management` is set; providers that don't set
    /// it inherit the default "unsupported" error.
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Err(Error::unsupported("list_models not supported by this provider"))
    }

    /// Asks the provider's server to download or load `name`.
    async fn pull_model(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported("pull_model not supported by this provider"))
    }

    /// Reports whether `name` is already available, built on
    /// [`ChatProvider::list_models`] by default.
    async fn check_model(&self, name: &str) -> Result<bool> {
        Ok(self.list_models().await?.iter().any(|m| m.name == name))
    }
}

/// Per-backend behavior that doesn't fit the common request/response path.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Ollama's `/v1` OpenAI-compatible endpoint. Escalates `num_ctx` through
    /// a fixed ladder when a context-window error is observed, remembering
    /// the last value that worked.
    Ollama,
    /// LM Studio's endpoint. Issues a tiny warmup completion the first time
    /// a model is used in a session, since LM Studio lazily loads models on
    /// first request and that first request otherwise eats the caller's
    /// timeout.
    LmStudio,
    /// A cloud OpenAI-compatible endpoint reached via a [`CloudProviderDef`].
    Cloud(CloudProviderDef),
    /// OpenRouter: an OpenAI-compatible endpoint that additionally expects
    /// `HTTP-Referer` / `X-Title` attribution headers.
    OpenRouter { referer: String, title: String },
}

/// Table-driven definition of a cloud OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct CloudProviderDef {
    pub name: &'static str,
    pub base_url: &'static str,
    pub api_key_env: &'static str,
}

/// Well-known cloud provider definitions. Looked up by name when building an
/// [`OpenAICompatibleProvider`] from configuration rather than hand-written
/// per-provider structs.
pub const CLOUD_PROVIDERS: &[CloudProviderDef] = &[
    CloudProviderDef {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        api_key_env: "OPENAI_API_KEY",
    },
    CloudProviderDef {
        name: "anthropic-compat",
        base_url: "https://api.anthropic.com/v1",
        api_key_env: "ANTHROPIC_API_KEY",
    },
    CloudProviderDef {
        name: "groq",
        base_url: "https://api.groq.com/openai/v1",
        api_key_env: "GROQ_API_KEY",
    },
    CloudProviderDef {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        api_key_env: "OPENROUTER_API_KEY",
    },
];

/// Looks up a [`CloudProviderDef`] by name (case-insensitive).
pub fn cloud_provider_by_name(name: &str) -> Option<&'static CloudProviderDef> {
    CLOUD_PROVIDERS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

/// The escalating context-window sizes tried, in order, for [`Backend::Ollama`]
/// when a request fails with a context-window error.
pub const OLLAMA_NUM_CTX_LADDER: &[u32] = &[8192, 16384, 32768, 65536];

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const SSE_CHANNEL_CAPACITY: usize = 10;

/// An OpenAI-compatible provider: shared HTTP/SSE plumbing plus a
/// [`Backend`] for the handful of behaviors that differ per server.
pub struct OpenAICompatibleProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
    backend: Backend,
    /// Index into [`OLLAMA_NUM_CTX_LADDER`] currently in use, escalated on
    /// context-window failures and remembered for subsequent calls.
    num_ctx_rung: Mutex<usize>,
    /// Set once the LM Studio warmup preamble has been issued for this
    /// provider instance, so it only runs once per process per model.
    warmed_up: Mutex<bool>,
}

impl OpenAICompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        backend: Backend,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            http,
            backend,
            num_ctx_rung: Mutex::new(0),
            warmed_up: Mutex::new(false),
        })
    }

    /// Builds an Ollama-backed provider pointed at `base_url` (typically
    /// `http://localhost:11434/v1`).
    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::new("ollama", base_url, "not-needed", model, Backend::Ollama)
    }

    /// Builds an LM Studio-backed provider pointed at `base_url` (typically
    /// `http://localhost:1234/v1`).
    pub fn lm_studio(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::new("lm-studio", base_url, "not-needed", model, Backend::LmStudio)
    }

    /// Builds a cloud provider from a [`CloudProviderDef`], reading the API
    /// key from the definition's environment variable.
    pub fn cloud(def: &CloudProviderDef, model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var(def.api_key_env).map_err(|_| {
            Error::config(format!(
                "missing API key: set {} for provider {}",
                def.api_key_env, def.name
            ))
        })?;
        Self::new(
            def.name,
            def.base_url,
            api_key,
            model,
            Backend::Cloud(def.clone()),
        )
    }

    /// Builds an OpenRouter provider, which additionally sends attribution
    /// headers required by OpenRouter's terms of use.
    pub fn openrouter(
        api_key: impl Into<String>,
        model: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            api_key,
            model,
            Backend::OpenRouter {
                referer: referer.into(),
                title: title.into(),
            },
        )
    }

    fn current_num_ctx(&self) -> Option<u32> {
        if !matches!(self.backend, Backend::Ollama) {
            return None;
        }
        let rung = *self.num_ctx_rung.lock().expect("num_ctx lock poisoned");
        OLLAMA_NUM_CTX_LADDER.get(rung).copied()
    }

    /// Escalates the Ollama `num_ctx` rung by one step, returning `true` if
    /// there was a higher rung to move to.
    fn escalate_num_ctx(&self) -> bool {
        let mut rung = self.num_ctx_rung.lock().expect("num_ctx lock poisoned");
        if *rung + 1 < OLLAMA_NUM_CTX_LADDER.len() {
            *rung += 1;
            true
        } else {
            false
        }
    }

    async fn ensure_warmed_up(&self) -> Result<()> {
        if !matches!(self.backend, Backend::LmStudio) {
            return Ok(());
        }
        {
            let warmed = self.warmed_up.lock().expect("warmup lock poisoned");
            if *warmed {
                return Ok(());
            }
        }

        let warmup = build_request(&self.model, "", &[Message::user("hi")], None, Some(1), 0.0);
        let url = format!("{}/chat/completions", self.base_url);
        let _ = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&warmup)
            .send()
            .await;

        *self.warmed_up.lock().expect("warmup lock poisoned") = true;
        Ok(())
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        if let Backend::OpenRouter { referer, title } = &self.backend {
            builder = builder
                .header("HTTP-Referer", referer.clone())
                .header("X-Title", title.clone());
        }

        builder
    }

    fn build_wire_request(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
    ) -> serde_json::Value {
        let request = build_request(&self.model, system_prompt, history, tools, None, 0.7);
        let mut value = serde_json::to_value(&request).expect("request always serializes");
        if let Some(num_ctx) = self.current_num_ctx() {
            value["options"] = serde_json::json!({ "num_ctx": num_ctx });
        }
        value
    }

    async fn send_and_aggregate(&self, body: serde_json::Value) -> Result<Vec<ContentBlock>> {
        self.ensure_warmed_up().await?;

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .request_builder(&url)
            .json(&body)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let bytes = read_bounded_body(response).await.unwrap_or_default();
            let text = String::from_utf8_lossy(&bytes);
            return Err(classify_http_failure(status, &text));
        }

        let bytes = read_bounded_body(response).await?;
        let text = String::from_utf8_lossy(&bytes);

        let mut blocks = Vec::new();
        let mut aggregator = ToolCallAggregator::new();
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let chunk: OpenAIChunk = serde_json::from_str(data)
                .map_err(|e| Error::stream(format!("failed to parse chunk: {e}")))?;
            blocks.extend(aggregator.process_chunk(chunk)?);
        }

        if blocks.is_empty() {
            return Err(Error::stream("empty response from llm"));
        }

        Ok(blocks)
    }
}

/// Maps a non-2xx HTTP status (plus body text) to an [`Error`] whose
/// rendered message carries enough signal for
/// [`crate::classify::classify`] to bucket it correctly.
fn classify_http_failure(status: reqwest::StatusCode, body: &str) -> Error {
    Error::api(format!("HTTP {}: {}", status.as_u16(), body))
}

#[async_trait]
impl ChatProvider for OpenAICompatibleProvider {
    async fn chat(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<Vec<ContentBlock>> {
        let body = self.build_wire_request(system_prompt, history, tools);
        match self.send_and_aggregate(body.clone()).await {
            Err(e) if matches!(self.backend, Backend::Ollama) => {
                if crate::classify::classify(&e) == crate::classify::ErrorClass::ContextWindow
                    && self.escalate_num_ctx()
                {
                    let retried = self.build_wire_request(system_prompt, history, None);
                    let mut retried = retried;
                    retried["tools"] = body.get("tools").cloned().unwrap_or(serde_json::Value::Null);
                    self.send_and_aggregate(retried).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    async fn chat_stream(
        &self,
        system_prompt: &str,
        history: &[Message],
        tools: Option<Vec<serde_json::Value>>,
    ) -> Result<ChatStream> {
        // All backends here are fronted by the same non-streaming aggregation
        // path internally (see `send_and_aggregate`); this adapts it to a
        // stream with a bounded channel so callers that want incremental
        // delivery still get backpressure.
        let blocks = self.chat(system_prompt, history, tools).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(SSE_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for block in blocks {
                if tx.send(Ok(block)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> Result<()> {
        let url = match &self.backend {
            Backend::Ollama => format!("{}/../api/tags", self.base_url),
            _ => format!("{}/models", self.base_url),
        };
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(Error::Http)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::api(format!(
                "health check failed: HTTP {}",
                response.status()
            )))
        }
    }

    fn info(&self) -> ProviderInfo {
        let kind = match self.backend {
            Backend::Ollama | Backend::LmStudio => ProviderKind::Local,
            Backend::Cloud(_) | Backend::OpenRouter { .. } => ProviderKind::Cloud,
        };
        ProviderInfo {
            name: self.name.clone(),
            kind,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            features: ProviderFeatures {
                native_tool_calling: true,
                model_management: matches!(self.backend, Backend::Ollama | Backend::LmStudio),
                streaming: true,
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        match &self.backend {
            Backend::Ollama => {
                let url = format!("{}/../api/tags", self.base_url);
                let response = self.http.get(&url).send().await.map_err(Error::Http)?;
                let body: serde_json::Value = response.json().await.map_err(Error::Http)?;
                Ok(body["models"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|m| m["name"].as_str().map(|n| ModelInfo { name: n.to_string() }))
                    .collect())
            }
            Backend::LmStudio => {
                let url = format!("{}/../api/v1/models", self.base_url);
                let response = self.http.get(&url).send().await.map_err(Error::Http)?;
                let body: serde_json::Value = response.json().await.map_err(Error::Http)?;
                Ok(body["models"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter(|m| m["type"].as_str() != Some("embeddings"))
                    .filter_map(|m| m["key"].as_str().map(|k| ModelInfo { name: k.to_string() }))
                    .collect())
            }
            _ => Err(Error::unsupported("list_models not supported by this provider")),
        }
    }

    async fn pull_model(&self, name: &str) -> Result<()> {
        match &self.backend {
            Backend::Ollama => {
                let url = format!("{}/../api/pull", self.base_url);
                let response = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({ "name": name, "stream": false }))
                    .send()
                    .await
                    .map_err(Error::Http)?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(Error::api(format!("pull failed: HTTP {}", response.status())))
                }
            }
            Backend::LmStudio => {
                let url = format!("{}/../api/v1/models/load", self.base_url);
                let response = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({ "model": name }))
                    .send()
                    .await
                    .map_err(Error::Http)?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(Error::api(format!("load failed: HTTP {}", response.status())))
                }
            }
            _ => Err(Error::unsupported("pull_model not supported by this provider")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_provider_lookup_case_insensitive() {
        let def = cloud_provider_by_name("OpenAI").unwrap();
        assert_eq!(def.name, "openai");
    }

    #[test]
    fn test_cloud_provider_lookup_unknown_returns_none() {
        assert!(cloud_provider_by_name("not-a-provider").is_none());
    }

    #[test]
    fn test_num_ctx_ladder_starts_at_smallest() {
        let provider = OpenAICompatibleProvider::ollama("http://localhost:11434/v1", "llama3")
            .unwrap();
        assert_eq!(provider.current_num_ctx(), Some(OLLAMA_NUM_CTX_LADDER[0]));
    }

    #[test]
    fn test_num_ctx_escalates_through_ladder() {
        let provider = OpenAICompatibleProvider::ollama("http://localhost:11434/v1", "llama3")
            .unwrap();
        for expected in &OLLAMA_NUM_CTX_LADDER[1..] {
            assert!(provider.escalate_num_ctx());
            assert_eq!(provider.current_num_ctx(), Some(*expected));
        }
        assert!(!provider.escalate_num_ctx());
    }

    #[test]
    fn test_non_ollama_backend_has_no_num_ctx() {
        let provider = OpenAICompatibleProvider::lm_studio("http://localhost:1234/v1", "m")
            .unwrap();
        assert_eq!(provider.current_num_ctx(), None);
    }

    #[test]
    fn test_provider_info_reflects_construction() {
        let provider = OpenAICompatibleProvider::lm_studio("http://localhost:1234/v1", "qwen")
            .unwrap();
        let info = provider.info();
        assert_eq!(info.name, "lm-studio");
        assert_eq!(info.model, "qwen");
        assert_eq!(info.kind, ProviderKind::Local);
        assert!(info.features.model_management);
    }

    #[test]
    fn test_cloud_provider_info_reports_cloud_kind() {
        std::env::set_var("OPENAI_API_KEY", "test-key");
        let def = cloud_provider_by_name("openai").unwrap();
        let provider = OpenAICompatibleProvider::cloud(def, "gpt-4o-mini").unwrap();
        let info = provider.info();
        assert_eq!(info.kind, ProviderKind::Cloud);
        assert!(!info.features.model_management);
        std::env::remove_var("OPENAI_API_KEY");
    }
}
