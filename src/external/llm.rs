//! LLM refinement client (OpenAI-compatible chat completions)
//!
//! Cost-bounded post-hoc review of a small region subset. The response is a
//! JSON object; anything unparsable degrades to "no refinement".

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::config::Config;
use crate::models::{error_kinds, RiskLevel, SourceError};

/// Largest confidence adjustment the LLM may apply.
pub const CONFIDENCE_DELTA_LIMIT: f64 = 0.2;

const SYSTEM_PROMPT: &str = "你是地质灾害预警复核助手。请对给定地区做轻量复核，只在必要时调整等级。\
输出JSON: {\"results\":[{\"region_code\":str,\"level_override\":\"green|yellow|orange|red\",\
\"confidence_delta\":float,\"reason_append\":str}]}。\
confidence_delta范围[-0.2,0.2]。reason_append必须为中文、简短、可解释（不超过30字）。不要输出其他文字。";

#[derive(Debug, Clone)]
pub struct LlmRefinement {
    pub region_code: String,
    pub level: Option<RiskLevel>,
    pub confidence_delta: f64,
    pub reason_append: String,
}

pub struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_key: config.llm_api_key.trim().to_string(),
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            model: config.llm_model.clone(),
            timeout: Duration::from_secs_f64(config.llm_timeout_seconds.max(5.0)),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.api_key.is_empty() && super::key_mode(&self.api_key) == super::KeyMode::Live
    }

    /// Submit the candidate payload; returns parsed refinements with the
    /// confidence delta clipped and non-CJK reason text dropped.
    pub async fn refine(
        &self,
        items: Vec<serde_json::Value>,
    ) -> Result<Vec<LlmRefinement>, SourceError> {
        let max_tokens = 180usize.max(60 * items.len());
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": serde_json::json!({ "items": items }).to_string(),
                },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.1,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    error_kinds::TIMEOUT
                } else {
                    error_kinds::CONNECT_ERROR
                };
                SourceError::with_message(kind, e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(SourceError::http_status(
                response.status().as_u16(),
                format!("{}/chat/completions", self.base_url),
            ));
        }

        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatMessage,
        }
        #[derive(Deserialize)]
        struct ChatMessage {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            SourceError::with_message(error_kinds::HTML_PARSE_NO_METRICS, e.to_string())
        })?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(parse_refinements(&content))
    }
}

#[derive(Deserialize)]
struct RefinementRow {
    #[serde(default)]
    region_code: String,
    #[serde(default, alias = "level")]
    level_override: Option<String>,
    #[serde(default)]
    confidence_delta: Option<f64>,
    #[serde(default)]
    reason_append: Option<String>,
}

#[derive(Deserialize)]
struct RefinementEnvelope {
    #[serde(default)]
    results: Vec<RefinementRow>,
}

/// Parses the model's JSON-object reply. Malformed content yields an empty
/// list (the pipeline records `llm_parse_failed`).
pub fn parse_refinements(content: &str) -> Vec<LlmRefinement> {
    let Ok(envelope) = serde_json::from_str::<RefinementEnvelope>(content) else {
        return Vec::new();
    };

    envelope
        .results
        .into_iter()
        .filter(|row| !row.region_code.trim().is_empty())
        .map(|row| {
            let level = row
                .level_override
                .as_deref()
                .filter(|l| matches!(*l, "green" | "yellow" | "orange" | "red"))
                .map(RiskLevel::parse_or_green);
            let reason = row
                .reason_append
                .map(|r| r.trim().to_string())
                .filter(|r| has_cjk(r))
                .unwrap_or_default();
            LlmRefinement {
                region_code: row.region_code.trim().to_string(),
                level,
                confidence_delta: row
                    .confidence_delta
                    .unwrap_or(0.0)
                    .clamp(-CONFIDENCE_DELTA_LIMIT, CONFIDENCE_DELTA_LIMIT),
                reason_append: reason,
            }
        })
        .collect()
}

/// True when the text contains at least one CJK ideograph.
pub fn has_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}
