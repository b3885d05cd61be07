//! Ollama Adapter
//!
//! Backend adapter for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/generate` - completions, batch or NDJSON streaming
//! - `/api/tags` - installed models, used as the catalog
//! - `/api/generate` with `keep_alive: 0` - unload a resident model

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{
    BackendError, BackendInvoker, BackendResponse, ModelCatalog, ModelLifecycle, StreamingToken,
};
use crate::config::BackendSettings;
use crate::request::RequestOptions;
use crate::routing::selector::{Capability, ModelDescriptor};

/// Quality assumed for installed models without a configured descriptor
const DEFAULT_LOCAL_QUALITY: f64 = 0.5;

/// Latency assumed for installed models without a configured descriptor
const DEFAULT_LOCAL_LATENCY_MS: u64 = 1000;

/// Ollama HTTP client
#[derive(Clone, Debug)]
pub struct OllamaInvoker {
    base_url: String,
    http_client: reqwest::Client,
    pinned: HashSet<String>,
    known: Vec<ModelDescriptor>,
}

impl OllamaInvoker {
    /// Create a client for `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, BackendError> {
        let host = host.into();
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}:{port}")
        } else {
            format!("http://{host}:{port}")
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| BackendError::Network {
                model_id: String::new(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            base_url,
            http_client,
            pinned: HashSet::new(),
            known: Vec::new(),
        })
    }

    /// Create from backend settings; configured models refine `/api/tags` output
    pub fn from_settings(
        settings: &BackendSettings,
        known: Vec<ModelDescriptor>,
    ) -> Result<Self, BackendError> {
        let mut invoker = Self::new(settings.ollama_host.clone(), settings.ollama_port)?;
        invoker.pinned = settings.pinned_models.iter().cloned().collect();
        invoker.known = known;
        Ok(invoker)
    }

    /// Base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn build_body(model_id: &str, prompt: &str, options: &RequestOptions, stream: bool) -> serde_json::Value {
        let prompt = match options.context.as_deref() {
            Some(context) if !context.is_empty() => format!("{context}\n\n{prompt}"),
            _ => prompt.to_string(),
        };
        let mut body = serde_json::json!({
            "model": model_id,
            "prompt": prompt,
            "stream": stream,
        });

        let mut opts = serde_json::Map::new();
        if let Some(temperature) = options.temperature {
            opts.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            opts.insert("num_predict".to_string(), serde_json::json!(max_tokens));
        }
        if !opts.is_empty() {
            body["options"] = serde_json::Value::Object(opts);
        }
        body
    }

    fn map_send_error(model_id: &str, err: &reqwest::Error, started: Instant) -> BackendError {
        if err.is_timeout() {
            BackendError::timeout(model_id, started.elapsed())
        } else {
            BackendError::Network {
                model_id: model_id.to_string(),
                detail: err.to_string(),
            }
        }
    }

    async fn check_status(
        model_id: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(BackendError::RateLimited {
                model_id: model_id.to_string(),
                retry_after_ms,
            });
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(BackendError::Network {
                model_id: model_id.to_string(),
                detail: format!("Ollama returned {status}: {body}"),
            })
        } else {
            Err(BackendError::InvalidResponse {
                model_id: model_id.to_string(),
                detail: format!("Ollama returned {status}: {body}"),
            })
        }
    }

    async fn invoke_streaming(
        &self,
        model_id: &str,
        body: serde_json::Value,
        chunks: mpsc::Sender<StreamingToken>,
        started: Instant,
    ) -> Result<BackendResponse, BackendError> {
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(model_id, &e, started))?;
        let response = Self::check_status(model_id, response).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut tokens_used = None;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| Self::map_send_error(model_id, &e, started))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Newline-delimited JSON
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let data: serde_json::Value =
                    serde_json::from_str(&line).map_err(|e| BackendError::InvalidResponse {
                        model_id: model_id.to_string(),
                        detail: e.to_string(),
                    })?;
                if let Some(token) = data.get("response").and_then(|r| r.as_str()) {
                    text.push_str(token);
                    // A dropped receiver only stops delivery, not generation
                    let _ = chunks.send(StreamingToken::Token(token.to_string())).await;
                }
                if data.get("done").and_then(serde_json::Value::as_bool).unwrap_or(false) {
                    tokens_used = data
                        .get("eval_count")
                        .and_then(serde_json::Value::as_u64)
                        .and_then(|c| u32::try_from(c).ok());
                }
            }
        }

        Ok(BackendResponse {
            text,
            tokens_used,
            duration_ms: Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
        })
    }

    fn descriptor_for(&self, name: &str, size: Option<u64>) -> ModelDescriptor {
        if let Some(known) = self.known.iter().find(|d| d.id == name) {
            let mut descriptor = known.clone();
            if descriptor.memory_bytes.is_none() {
                descriptor.memory_bytes = size;
            }
            return descriptor;
        }
        let mut descriptor = ModelDescriptor::new(name, DEFAULT_LOCAL_QUALITY, 0.0, DEFAULT_LOCAL_LATENCY_MS)
            .with_capability(Capability::Completion)
            .with_capability(Capability::Streaming);
        descriptor.memory_bytes = size;
        descriptor
    }
}

#[async_trait]
impl BackendInvoker for OllamaInvoker {
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &str,
        options: &RequestOptions,
        chunks: Option<mpsc::Sender<StreamingToken>>,
    ) -> Result<BackendResponse, BackendError> {
        let started = Instant::now();

        if let Some(chunks) = chunks {
            let body = Self::build_body(model_id, prompt, options, true);
            return self.invoke_streaming(model_id, body, chunks, started).await;
        }

        let body = Self::build_body(model_id, prompt, options, false);
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(model_id, &e, started))?;
        let response = Self::check_status(model_id, response).await?;

        let data: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    model_id: model_id.to_string(),
                    detail: e.to_string(),
                })?;

        let text = data
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| BackendError::InvalidResponse {
                model_id: model_id.to_string(),
                detail: "missing 'response' field".to_string(),
            })?
            .to_string();

        let tokens_used = data
            .get("eval_count")
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u32::try_from(c).ok());

        Ok(BackendResponse {
            text,
            tokens_used,
            duration_ms: Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
        })
    }
}

#[async_trait]
impl ModelCatalog for OllamaInvoker {
    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::map_send_error("", &e, started))?;
        let response = Self::check_status("", response).await?;

        let data: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse {
                    model_id: String::new(),
                    detail: e.to_string(),
                })?;

        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let name = m.get("name")?.as_str()?;
                        let size = m.get("size").and_then(serde_json::Value::as_u64);
                        Some(self.descriptor_for(name, size))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

#[async_trait]
impl ModelLifecycle for OllamaInvoker {
    async fn unload(&self, model_id: &str) -> Result<(), BackendError> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": model_id,
            "keep_alive": 0,
        });
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::map_send_error(model_id, &e, started))?;
        Self::check_status(model_id, response).await?;
        tracing::info!(model = %model_id, "Unloaded model from Ollama");
        Ok(())
    }

    fn is_pinned(&self, model_id: &str) -> bool {
        self.pinned.contains(model_id)
    }
}
