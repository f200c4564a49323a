//! Chat-completion style AI responder used by the automation pipeline.

use async_trait::async_trait;
use omc_core::{AiResponder, Error, Result};
use serde_json::json;

use crate::config::AiConfig;

pub struct ChatCompletionResponder {
    http: reqwest::Client,
    config: AiConfig,
}

impl ChatCompletionResponder {
    pub fn new(http: reqwest::Client, config: AiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl AiResponder for ChatCompletionResponder {
    async fn respond(&self, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::upstream("ai request failed").with_source(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(format!("ai provider returned {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::upstream("ai response decode failed").with_source(err))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::upstream("ai response missing content"))
    }
}
