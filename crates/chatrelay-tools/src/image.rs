use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::ImageConfig;

const DEFAULT_HOST: &str = "https://api.stability.ai";
const DEFAULT_ENGINE: &str = "stable-diffusion-v1-6";

/// Text-to-image client for the Stability generation API.
#[derive(Clone)]
pub struct ImageClient {
    client: Client,
    host: String,
    engine: String,
    api_key: Option<String>,
    width: u32,
    height: u32,
    steps: u32,
    cfg_scale: f64,
}

impl ImageClient {
    pub fn new(client: Client, config: &ImageConfig) -> Self {
        Self {
            client,
            host: config
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_HOST)
                .trim_end_matches('/')
                .to_string(),
            engine: config
                .engine
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            width: config.width.unwrap_or(512),
            height: config.height.unwrap_or(512),
            steps: config.steps.unwrap_or(30),
            cfg_scale: config.cfg_scale.unwrap_or(7.0),
        }
    }

    /// Generates one PNG and returns it as a `data:image/png;base64,` URL.
    pub async fn generate(&self, prompt: &str, cancel: CancellationToken) -> anyhow::Result<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            anyhow::bail!("image prompt is empty");
        }
        let Some(api_key) = self.api_key.as_deref() else {
            anyhow::bail!("image API key is not configured (set STABILITY_API_KEY)");
        };

        let url = format!(
            "{}/v1/generation/{}/text-to-image",
            self.host, self.engine
        );
        let req = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .json(&json!({
                "text_prompts": [{ "text": prompt }],
                "cfg_scale": self.cfg_scale,
                "height": self.height,
                "width": self.width,
                "steps": self.steps,
                "samples": 1,
            }));
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("image generation cancelled"),
            response = req.send() => response?,
        };
        let status = response.status();
        let raw = response.text().await?;
        let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = value
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| raw.trim().to_string());
            anyhow::bail!("image generation failed with status {}: {}", status, detail);
        }

        let artifact = value
            .get("artifacts")
            .and_then(|a| a.get(0))
            .and_then(|a| a.get("base64"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("image API returned no artifacts"))?;
        STANDARD
            .decode(artifact)
            .map_err(|e| anyhow::anyhow!("image API returned invalid base64: {}", e))?;
        Ok(format!("data:image/png;base64,{artifact}"))
    }
}
