//! AI stage: gather matching contexts, optionally pull supplementary data
//! through the SSRF guard, compose one prompt, and ask the responder.

use std::sync::Arc;
use std::time::Duration;

use omc_core::{AiResponder, Result};
use omc_safehttp::SafeHttpClient;
use omc_storage::AiContext;

use crate::keyword::keywords_match;

const CONTEXT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const RESPONDER_TIMEOUT: Duration = Duration::from_secs(60);
/// Supplementary API bodies are clipped so one oversized endpoint cannot
/// blow up the prompt.
const MAX_FETCH_CHARS: usize = 4000;

#[derive(Clone)]
pub struct AiStage {
    http: SafeHttpClient,
    responder: Arc<dyn AiResponder>,
}

impl AiStage {
    pub fn new(http: SafeHttpClient, responder: Arc<dyn AiResponder>) -> Self {
        Self { http, responder }
    }

    /// Every matching context contributes, concatenated in priority order
    /// (the input list is already priority-sorted). `None` when no context
    /// applies; errors from the responder bubble up so the pipeline can
    /// degrade to the fallback stage.
    pub async fn respond(&self, contexts: &[AiContext], message: &str) -> Result<Option<String>> {
        let matching: Vec<&AiContext> = contexts
            .iter()
            .filter(|ctx| ctx.always_on || keywords_match(&ctx.trigger_keywords, message))
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }

        let mut prompt = String::new();
        for ctx in &matching {
            if !ctx.prompt.is_empty() {
                prompt.push_str(&ctx.prompt);
                prompt.push('\n');
            }
            if !ctx.api_url.is_empty() {
                match self.http.get(&ctx.api_url, CONTEXT_FETCH_TIMEOUT).await {
                    Ok(response) if response.is_success() => {
                        let mut body = response.body;
                        if body.chars().count() > MAX_FETCH_CHARS {
                            body = body.chars().take(MAX_FETCH_CHARS).collect();
                        }
                        prompt.push_str(&body);
                        prompt.push('\n');
                    }
                    Ok(response) => {
                        tracing::warn!(
                            context = %ctx.id,
                            status = response.status,
                            "ai context fetch returned non-2xx"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(context = %ctx.id, error = %err, "ai context fetch failed");
                    }
                }
            }
        }
        prompt.push_str("User message: ");
        prompt.push_str(message);

        let reply = tokio::time::timeout(RESPONDER_TIMEOUT, self.responder.respond(&prompt))
            .await
            .map_err(|_| omc_core::Error::upstream("ai responder timed out"))??;
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct EchoResponder;

    #[async_trait]
    impl AiResponder for EchoResponder {
        async fn respond(&self, prompt: &str) -> Result<String> {
            Ok(format!("echo:{}", prompt.lines().count()))
        }
    }

    fn context(always_on: bool, triggers: &[&str], prompt: &str) -> AiContext {
        AiContext {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "ctx".into(),
            priority: 0,
            enabled: true,
            always_on,
            trigger_keywords: triggers.iter().map(|s| s.to_string()).collect(),
            prompt: prompt.into(),
            api_url: String::new(),
        }
    }

    #[tokio::test]
    async fn no_matching_context_means_no_reply() {
        let stage = AiStage::new(
            SafeHttpClient::new(false, "omnichat-test/0"),
            Arc::new(EchoResponder),
        );
        let contexts = vec![context(false, &["billing"], "You handle billing.")];
        let reply = stage.respond(&contexts, "hello there").await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn matching_contexts_compose_the_prompt() {
        let stage = AiStage::new(
            SafeHttpClient::new(false, "omnichat-test/0"),
            Arc::new(EchoResponder),
        );
        let contexts = vec![
            context(true, &[], "Always present."),
            context(false, &["billing"], "Billing context."),
        ];
        let reply = stage
            .respond(&contexts, "question about billing")
            .await
            .unwrap();
        // two context lines plus the user-message line
        assert_eq!(reply.as_deref(), Some("echo:3"));
    }
}
