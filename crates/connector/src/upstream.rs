//! HTTP client for the local OpenAI-compatible backend.
//!
//! Hop-by-hop and caller-auth headers are never forwarded; the
//! `Authorization` header is rebuilt from the credential carried in the
//! REQUEST frame (falling back to the locally configured key).

use std::{collections::HashMap, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, warn},
};

use crate::{config::ConnectorConfig, error::Result};

/// Headers that must not be replayed toward the backend.
const SKIPPED_HEADERS: &[&str] = &["host", "connection", "authorization"];

pub struct LlmClient {
    base_url: String,
    client: reqwest::Client,
    host_header: Option<String>,
    fallback_key: Option<Secret<String>>,
}

impl LlmClient {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.llm_timeout)
            .build()?;
        Ok(Self {
            base_url: config.llm_url.trim_end_matches('/').to_string(),
            client,
            host_header: config.llm_host.clone(),
            fallback_key: config.llm_api_key.clone(),
        })
    }

    fn build_request(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        frame_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, url);

        for (name, value) in headers {
            if SKIPPED_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(host) = &self.host_header {
            request = request.header("host", host);
        }

        // The broker-injected key wins over the locally configured one.
        let key = frame_key
            .map(String::from)
            .or_else(|| self.fallback_key.as_ref().map(|k| k.expose_secret().clone()));
        if let Some(key) = key {
            request = request.bearer_auth(key);
        }

        request.body(body)
    }

    /// Buffered round trip for non-streaming requests.
    pub async fn forward(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        frame_key: Option<&str>,
    ) -> Result<(u16, HashMap<String, String>, Vec<u8>)> {
        debug!(method, path, "forwarding request to backend");
        let response = self
            .build_request(method, path, headers, body, frame_key)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response_headers(&response);
        let body = response.bytes().await?.to_vec();
        Ok((status, headers, body))
    }

    /// Open a streaming round trip; the caller inspects the status and
    /// drains `bytes_stream`.
    pub async fn forward_streaming(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        frame_key: Option<&str>,
    ) -> Result<reqwest::Response> {
        debug!(method, path, "forwarding streaming request to backend");
        let response = self
            .build_request(method, path, headers, body, frame_key)
            .send()
            .await?;
        Ok(response)
    }

    /// Backend reachability probe for the health endpoint.
    pub async fn check_health(&self) -> bool {
        let probe = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("backend health check failed: {e}");
                false
            },
        }
    }

    /// Discover served models. Tries the Ollama tags endpoint first (it
    /// lists everything installed), then the OpenAI listing.
    pub async fn discover_models(&self) -> Vec<String> {
        if let Some(models) = self.models_from_ollama().await {
            return models;
        }
        if let Some(models) = self.models_from_openai().await {
            return models;
        }
        warn!("no models discovered from any backend endpoint");
        Vec::new()
    }

    async fn models_from_ollama(&self) -> Option<Vec<String>> {
        let value: serde_json::Value = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        let models: Vec<String> = value
            .get("models")?
            .as_array()?
            .iter()
            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
            .map(String::from)
            .collect();
        (!models.is_empty()).then_some(models)
    }

    async fn models_from_openai(&self) -> Option<Vec<String>> {
        let value: serde_json::Value = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        let models: Vec<String> = value
            .get("data")?
            .as_array()?
            .iter()
            .filter_map(|m| m.get("id").and_then(|n| n.as_str()))
            .map(normalize_model_name)
            .collect();
        (!models.is_empty()).then_some(models)
    }
}

fn response_headers(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

/// Turn a backend model id into a clean model name: strip any path prefix,
/// weight-file extension and quantization suffix. llama.cpp servers report
/// ids like `/opt/models/meta-llama-3.1-8b-instruct-q4_k_m.gguf`.
pub fn normalize_model_name(model_id: &str) -> String {
    let name = model_id.rsplit('/').next().unwrap_or(model_id);

    let mut name = name.to_string();
    for extension in [".gguf", ".bin", ".safetensors", ".pt", ".pth", ".onnx"] {
        if name.to_lowercase().ends_with(extension) {
            name.truncate(name.len() - extension.len());
            break;
        }
    }

    strip_quant_suffix(&name)
}

/// Drop a trailing quantization marker such as `-q4_k_m`, `-Q8_0` or `_q5_1`.
fn strip_quant_suffix(name: &str) -> String {
    for (pos, ch) in name.char_indices() {
        if ch != '-' && ch != '_' {
            continue;
        }
        if is_quant_marker(&name[pos + 1..]) {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}

/// `q`/`Q`, a digit, then only digits, `_`, `k`/`K`, `m`/`M` to the end.
fn is_quant_marker(suffix: &str) -> bool {
    let bytes = suffix.as_bytes();
    bytes.len() >= 2
        && matches!(bytes[0], b'q' | b'Q')
        && bytes[1].is_ascii_digit()
        && bytes[2..]
            .iter()
            .all(|b| matches!(b, b'0'..=b'9' | b'_' | b'k' | b'K' | b'm' | b'M'))
}
