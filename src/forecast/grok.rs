//! Reasoning-service client
//!
//! Talks to an OpenAI-compatible chat-completions endpoint (xAI Grok by
//! default). Transport only: prompt assembly, the HTTP call, token-based
//! cost accounting. Payload parsing is delegated to the `repair` boundary.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{repair, ForecastClient, ForecastResponse, MarketContext};
use crate::config::ForecastConfig;
use crate::error::{ProphetError, Result};

// Per-million-token rates used for cost attribution when the API does not
// return a dollar figure itself.
const INPUT_COST_PER_MTOK: Decimal = dec!(3.0);
const OUTPUT_COST_PER_MTOK: Decimal = dec!(15.0);

pub struct GrokForecaster {
    config: ForecastConfig,
    http: Client,
}

impl GrokForecaster {
    pub fn new(config: ForecastConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProphetError::Auth(
                "missing forecast service API key".to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ProphetError::Http)?;
        Ok(Self { config, http })
    }

    fn build_prompt(context: &MarketContext) -> String {
        format!(
            "You are forecasting a binary-outcome prediction market.\n\
             Market: {title}\n\
             Category: {category}\n\
             Current YES price: {yes:.2} | NO price: {no:.2}\n\
             Volume: {volume}\n\
             Expires: {expiration}\n\n\
             Estimate the probability that this market resolves YES.\n\
             Respond with a single JSON object:\n\
             {{\"probability\": <0..1>, \"confidence\": <0..1>, \"rationale\": \"<one paragraph>\"}}",
            title = context.title,
            category = context.category,
            yes = context.yes_price,
            no = context.no_price,
            volume = context.volume,
            expiration = context.expiration.to_rfc3339(),
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatUsage {
    fn cost(&self) -> Decimal {
        let million = Decimal::from(1_000_000u64);
        Decimal::from(self.prompt_tokens) * INPUT_COST_PER_MTOK / million
            + Decimal::from(self.completion_tokens) * OUTPUT_COST_PER_MTOK / million
    }
}

#[async_trait]
impl ForecastClient for GrokForecaster {
    async fn analyze(&self, context: &MarketContext) -> Result<ForecastResponse> {
        let prompt = Self::build_prompt(context);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProphetError::RateLimited(
                "forecast service returned 429".to_string(),
            ));
        }
        let response = response.error_for_status().map_err(ProphetError::Http)?;
        let parsed: ChatResponse = response.json().await?;

        let raw_response = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let cost = parsed.usage.unwrap_or_default().cost();
        let outcome = repair::parse_forecast(&raw_response);

        debug!(
            market_id = %context.market_id,
            cost = %cost,
            parsed = outcome.as_parsed().is_some(),
            "forecast received"
        );

        Ok(ForecastResponse {
            outcome,
            cost,
            raw_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_cost() {
        let usage = ChatUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 200_000,
        };
        // 1M input at $3 + 0.2M output at $15 = $6
        assert_eq!(usage.cost(), dec!(6.0));
    }

    #[test]
    fn test_prompt_contains_market_facts() {
        let context = MarketContext {
            market_id: "MKT-A".to_string(),
            title: "Will the incumbent win?".to_string(),
            category: "politics".to_string(),
            yes_price: dec!(0.42),
            no_price: dec!(0.60),
            volume: dec!(15000),
            expiration: chrono::Utc::now(),
        };
        let prompt = GrokForecaster::build_prompt(&context);
        assert!(prompt.contains("Will the incumbent win?"));
        assert!(prompt.contains("0.42"));
        assert!(prompt.contains("probability"));
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = ForecastConfig {
            base_url: "https://api.x.ai/v1".to_string(),
            model: "grok-4".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
            temperature: 0.2,
            max_tokens: 2000,
        };
        assert!(GrokForecaster::new(config).is_err());
    }
}
