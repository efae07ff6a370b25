use super::{Oracle, OracleFuture, OutputShape};
use crate::error::OracleError;
use crate::util::truncate_str;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const MAX_TOKENS: u32 = 8_192;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Oracle backed by the OpenRouter chat completions API.
///
/// Retries are not done here; the caller's retry strategy sees every failure.
pub struct OpenRouterOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenRouterOracle {
    pub fn new(api_key: String, model: Option<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout_secs,
        })
    }

    async fn call(&self, request: &str, shape: OutputShape) -> Result<String, OracleError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: request,
            }],
            max_tokens: MAX_TOKENS,
            stream: false,
            response_format: (shape == OutputShape::Structured).then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Content-Type", "application/json")
            .header("X-Title", "reviewtask")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(map_status(status.as_u16(), &text, self.timeout_secs));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            OracleError::Malformed(format!(
                "failed to parse OpenRouter response: {} ({})",
                e,
                truncate_str(&text, 200)
            ))
        })?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(OracleError::Malformed("OpenRouter returned no choices".into()));
        };
        if choice.finish_reason.as_deref() == Some("length") {
            debug!("OpenRouter stopped at max_tokens; response may be truncated");
        }
        Ok(choice.message.content.unwrap_or_default())
    }

    fn transport_error(&self, err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            OracleError::Network(err.to_string())
        }
    }
}

impl Oracle for OpenRouterOracle {
    fn invoke<'a>(&'a self, request: &'a str, shape: OutputShape) -> OracleFuture<'a> {
        Box::pin(self.call(request, shape))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn map_status(status: u16, text: &str, timeout_secs: u64) -> OracleError {
    let preview = truncate_str(text, 200).to_string();
    match status {
        401 | 403 => OracleError::Auth(format!(
            "OpenRouter rejected the API key ({}). Update OPENROUTER_API_KEY or the keychain entry.",
            status
        )),
        413 => OracleError::PayloadTooLarge(preview),
        429 => {
            if let Some(secs) = parse_retry_after(text) {
                warn!(retry_after_secs = secs, "OpenRouter rate limited");
            }
            OracleError::RateLimited(preview)
        }
        408 | 504 => OracleError::Timeout { secs: timeout_secs },
        500..=599 => OracleError::Network(format!(
            "OpenRouter server error ({}). The service may be temporarily unavailable.",
            status
        )),
        _ => OracleError::Process(format!("API error {}: {}", status, preview)),
    }
}

/// Extract a retry-after hint from an OpenRouter error body (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(map_status(401, "", 5).is_critical());
        assert!(matches!(map_status(413, "big", 5), OracleError::PayloadTooLarge(_)));
        assert!(matches!(map_status(429, "slow", 5), OracleError::RateLimited(_)));
        assert!(matches!(map_status(503, "", 5), OracleError::Network(_)));
        assert!(matches!(map_status(418, "teapot", 5), OracleError::Process(_)));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("retry later"), None);
        assert_eq!(parse_retry_after("no hint"), None);
    }

    #[test]
    fn test_structured_request_sets_json_format() {
        let body = ChatRequest {
            model: "m",
            messages: vec![Message {
                role: "user",
                content: "hi",
            }],
            max_tokens: 10,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}
