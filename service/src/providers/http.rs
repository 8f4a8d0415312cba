use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::providers::{
    BackendAdapter, BackendFailure, BackendOutcome, BackendPayload, BackendTarget, FailureSignal,
    GenerationPayload, ProviderKind,
};

/// Adapter for the HTTP image APIs of every supported provider kind.
///
/// - `google`: `models/{model}:generateContent` with image response modality
/// - `openai`: `/images/generations`, OpenAI or any compatible relay
/// - `zai`: `/images/generations` on the Zhipu open platform
///
/// One client is shared by all presets, generation calls and credential
/// checks alike; per-call deadlines come from the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            client: Self::client_builder().build().unwrap_or_default(),
        }
    }

    /// Route every call through `proxy_url` when one is given.
    pub fn with_proxy(proxy_url: Option<&str>) -> Result<Self> {
        let mut builder = Self::client_builder();
        if let Some(url) = proxy_url {
            let proxy =
                reqwest::Proxy::all(url).with_context(|| format!("invalid proxy URL {url}"))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn client_builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder().connect_timeout(Duration::from_secs(15))
    }

    // -----------------------------------------------------------------------
    // Request building
    // -----------------------------------------------------------------------

    fn generation_url(target: &BackendTarget) -> String {
        match target.kind {
            ProviderKind::Google => format!(
                "{}/v1beta/models/{}:generateContent",
                google_base(&target.endpoint),
                google_model(&target.model)
            ),
            ProviderKind::OpenAi | ProviderKind::Zai => images_url(&target.endpoint),
        }
    }

    fn models_url(target: &BackendTarget) -> String {
        match target.kind {
            ProviderKind::Google => format!("{}/v1beta/models", google_base(&target.endpoint)),
            ProviderKind::OpenAi | ProviderKind::Zai => {
                let base = target.endpoint.trim_end_matches('/');
                let base = base.strip_suffix("/images/generations").unwrap_or(base);
                format!("{base}/models")
            }
        }
    }

    fn prepare_request(target: &BackendTarget, payload: &GenerationPayload) -> Value {
        let mut body = match target.kind {
            ProviderKind::Google => {
                let mut image_config = serde_json::Map::new();
                if let Some(ratio) = payload.aspect_ratio.as_deref().filter(|r| *r != "default") {
                    image_config.insert("aspectRatio".into(), json!(ratio));
                }
                if let Some(size) = payload.resolution.as_deref().filter(|s| *s != "1K") {
                    image_config.insert("imageSize".into(), json!(size));
                }
                let mut text = payload.prompt.clone();
                if let Some(negative) = &payload.negative_prompt {
                    text.push_str("\nAvoid: ");
                    text.push_str(negative);
                }
                let mut generation_config = json!({
                    "responseModalities": ["TEXT", "IMAGE"],
                });
                if !image_config.is_empty() {
                    generation_config["imageConfig"] = Value::Object(image_config);
                }
                json!({
                    "contents": [{ "role": "user", "parts": [{ "text": text }] }],
                    "generationConfig": generation_config,
                })
            }
            ProviderKind::OpenAi | ProviderKind::Zai => {
                let mut body = json!({
                    "model": target.model,
                    "prompt": payload.prompt,
                });
                if target.kind == ProviderKind::OpenAi {
                    body["n"] = json!(1);
                    body["response_format"] = json!("b64_json");
                }
                if let Some(size) = payload.resolution.as_deref().filter(|s| s.contains('x')) {
                    body["size"] = json!(size);
                }
                if let Some(negative) = &payload.negative_prompt {
                    body["negative_prompt"] = json!(negative);
                }
                body
            }
        };

        if let Value::Object(map) = &mut body {
            for (key, value) in &payload.extra {
                map.insert(key.clone(), value.clone());
            }
        }
        body
    }

    fn authorize(
        builder: reqwest::RequestBuilder,
        target: &BackendTarget,
    ) -> reqwest::RequestBuilder {
        match target.kind {
            ProviderKind::Google => builder.header("x-goog-api-key", target.secret.expose()),
            ProviderKind::OpenAi | ProviderKind::Zai => {
                builder.header("Authorization", format!("Bearer {}", target.secret.expose()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        budget: Duration,
    ) -> Result<Value, BackendFailure> {
        let response = builder
            .timeout(budget)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendFailure::status(status.as_u16(), error_message(&text)));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                BackendFailure::timeout()
            } else {
                BackendFailure::new(FailureSignal::Malformed, format!("invalid JSON body: {e}"))
            }
        })
    }
}

impl BackendAdapter for HttpBackend {
    async fn invoke(
        &self,
        target: &BackendTarget,
        payload: &GenerationPayload,
        budget: Duration,
    ) -> BackendOutcome {
        let url = Self::generation_url(target);
        let body = Self::prepare_request(target, payload);
        tracing::debug!(
            preset = %target.preset,
            kind = %target.kind,
            credential = %target.credential,
            url = %url,
            "invoking backend"
        );

        let builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        let json = self.send(Self::authorize(builder, target), budget).await?;

        parse_response(target.kind, &json).map_err(|e| {
            BackendFailure::new(FailureSignal::Malformed, format!("{e:#}"))
        })?;
        Ok(BackendPayload {
            model: target.model.clone(),
            body: json,
        })
    }

    async fn list_models(
        &self,
        target: &BackendTarget,
        budget: Duration,
    ) -> Result<Vec<String>, BackendFailure> {
        let builder = self.client.get(Self::models_url(target));
        let json = self.send(Self::authorize(builder, target), budget).await?;

        let (field, key) = match target.kind {
            ProviderKind::Google => ("models", "name"),
            ProviderKind::OpenAi | ProviderKind::Zai => ("data", "id"),
        };
        let models = json[field]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m[key].as_str())
                    .map(|s| s.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Google endpoints are configured with or without the version segment.
fn google_base(endpoint: &str) -> &str {
    let base = endpoint.trim_end_matches('/');
    base.strip_suffix("/v1beta")
        .or_else(|| base.strip_suffix("/v1"))
        .unwrap_or(base)
}

fn google_model(model: &str) -> &str {
    model.trim_start_matches("models/")
}

fn images_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/images/generations") {
        base.to_string()
    } else {
        format!("{base}/images/generations")
    }
}

fn transport_failure(e: reqwest::Error) -> BackendFailure {
    let signal = if e.is_timeout() {
        FailureSignal::Timeout
    } else if e.is_connect() || e.is_request() {
        FailureSignal::Connect
    } else {
        FailureSignal::Other
    };
    BackendFailure::new(signal, e.to_string())
}

/// Pull `error.message` out of a JSON error body, keeping quota hints intact.
fn error_message(text: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(text).ok();
    let message = parsed.as_ref().and_then(|v| {
        let error = &v["error"];
        let msg = error["message"].as_str().or_else(|| error.as_str())?;
        Some(match error["status"].as_str().or_else(|| error["code"].as_str()) {
            Some(status) => format!("{status}: {msg}"),
            None => msg.to_string(),
        })
    });
    let mut message = message.unwrap_or_else(|| text.to_string());
    if message.len() > 500 {
        let mut end = 500;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

/// Check that a 200 response actually carries an image.
fn parse_response(kind: ProviderKind, json: &Value) -> Result<()> {
    match kind {
        ProviderKind::Google => {
            let candidates = json["candidates"].as_array().context("missing candidates")?;
            let Some(candidate) = candidates.first() else {
                let reason = json["promptFeedback"]["blockReason"]
                    .as_str()
                    .unwrap_or("unknown");
                bail!("no candidates (block reason: {reason})");
            };
            let has_image = candidate["content"]["parts"]
                .as_array()
                .is_some_and(|parts| parts.iter().any(|p| p.get("inlineData").is_some()));
            if !has_image {
                let reason = candidate["finishReason"].as_str().unwrap_or("unknown");
                bail!("response carried no image (finish reason: {reason})");
            }
            Ok(())
        }
        ProviderKind::OpenAi | ProviderKind::Zai => {
            let item = json["data"]
                .as_array()
                .and_then(|d| d.first())
                .context("missing data")?;
            let has_image = ["url", "b64_json", "image"]
                .iter()
                .any(|k| item[*k].as_str().is_some_and(|s| !s.is_empty()));
            if !has_image {
                bail!("response carried no image");
            }
            Ok(())
        }
    }
}
