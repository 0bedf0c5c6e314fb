//! Completion service client. The debate session only sees free text;
//! decoding and validation happen in `decode`, and any error here is a
//! retryable session failure, never a crash.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait Completion: Send + Sync {
    /// One role-specific turn: system framing plus the accumulated
    /// debate context. Returns raw model text.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

/// OpenAI-compatible chat endpoint over reqwest with a hard timeout.
/// A timeout surfaces as `Err` and is handled by the session retry loop.
pub struct HttpCompletion {
    client: Client,
    base: String,
    model: String,
    key: String,
}

impl HttpCompletion {
    pub fn new(base: String, model: String, key: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, base, model, key })
    }
}

#[async_trait]
impl Completion for HttpCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let resp: ChatResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let text = resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("completion response had no choices"))?;
        if text.trim().is_empty() {
            return Err(anyhow!("completion response was empty"));
        }
        Ok(text)
    }
}

/// Stub used when no completion key is configured, and by tests: emits
/// schema-valid advocate/judge output at a fixed probability so the whole
/// pipeline can be exercised without a live model.
pub struct CannedCompletion {
    pub probability: f64,
}

impl CannedCompletion {
    pub fn new(probability: f64) -> Self {
        Self { probability }
    }
}

#[async_trait]
impl Completion for CannedCompletion {
    async fn complete(&self, system: &str, _prompt: &str) -> Result<String> {
        if system.contains("judge") {
            Ok(serde_json::json!({
                "probability": self.probability,
                "confidence": "medium",
                "key_factors": ["canned factor"],
                "evidence_quality": "stub output, no live evidence",
                "rationale": "canned judge synthesis",
            })
            .to_string())
        } else {
            Ok(serde_json::json!({
                "probability": self.probability,
                "argument": "canned advocate argument",
                "citations": [],
            })
            .to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode_advocate, decode_judge};

    #[tokio::test]
    async fn test_canned_output_decodes_for_both_roles() {
        let canned = CannedCompletion::new(0.42);
        let advocate = canned.complete("high advocate", "q").await.unwrap();
        assert_eq!(decode_advocate(&advocate).unwrap().probability, 0.42);
        let judge = canned.complete("debate judge", "q").await.unwrap();
        assert_eq!(decode_judge(&judge).unwrap().probability, 0.42);
    }
}
