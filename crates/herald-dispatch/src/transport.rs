//! Delivery transport: forwards a mailing's messages to one chat.
//!
//! The engine only sees [`DeliveryTransport`]. The production adapter,
//! [`TelegramTransport`], calls the Bot API `forwardMessages` method from a
//! service chat that holds the mailing's source messages.

use std::{fmt, future::Future, pin::Pin, time::Duration};

use herald_core::models::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DispatchError, Result};

/// Sends a fixed list of messages to one recipient.
pub trait DeliveryTransport: Send + Sync + 'static {
    /// Quota identity shared by every sender using the same credentials.
    ///
    /// Rate-gate permits are keyed by this value.
    fn identity(&self) -> &str;

    /// Delivers `message_ids` to `chat_id`.
    ///
    /// # Errors
    ///
    /// Any error marks the recipient as failed for this attempt.
    fn deliver<'a>(
        &'a self,
        chat_id: ChatId,
        message_ids: &'a [MessageId],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Configuration for the Telegram Bot API transport.
#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL.
    pub api_url: String,
    /// Bot token, `<bot id>:<secret>`.
    pub bot_token: String,
    /// Chat holding the messages that get forwarded.
    pub service_chat_id: ChatId,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl TelegramConfig {
    /// Default public Bot API endpoint.
    pub const DEFAULT_API_URL: &'static str = "https://api.telegram.org";

    /// Creates a configuration against the public Bot API.
    pub fn new(bot_token: impl Into<String>, service_chat_id: ChatId) -> Self {
        Self {
            api_url: Self::DEFAULT_API_URL.to_string(),
            bot_token: bot_token.into(),
            service_chat_id,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_url", &self.api_url)
            .field("bot_token", &redact_token(&self.bot_token))
            .field("service_chat_id", &self.service_chat_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Keeps the bot id and hides the secret part of a token.
fn redact_token(token: &str) -> String {
    match token.split_once(':') {
        Some((bot, _)) => format!("{bot}:***"),
        None => "***".to_string(),
    }
}

#[derive(Serialize)]
struct ForwardMessages<'a> {
    chat_id: ChatId,
    from_chat_id: ChatId,
    message_ids: &'a [MessageId],
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct ReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Bot API transport.
///
/// The quota identity is the numeric bot id from the token, so every
/// dispatcher using the same bot shares one rate window while the secret
/// never reaches Redis keys or logs.
#[derive(Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    config: TelegramConfig,
    identity: String,
    endpoint: String,
}

impl fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl TelegramTransport {
    /// Creates a transport.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the token is malformed or
    /// the HTTP client cannot be built.
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let identity = bot_id(&config.bot_token)?.to_string();

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("herald-dispatch/0.1")
            .build()
            .map_err(|e| DispatchError::configuration(format!("failed to build HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/bot{}/forwardMessages",
            config.api_url.trim_end_matches('/'),
            config.bot_token
        );

        Ok(Self { client, config, identity, endpoint })
    }

    async fn forward(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()> {
        let body = ForwardMessages {
            chat_id,
            from_chat_id: self.config.service_chat_id,
            message_ids,
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await.map_err(|e| {
            // Drop the URL: it embeds the bot token.
            let e = e.without_url();
            if e.is_timeout() {
                DispatchError::timeout(self.config.timeout)
            } else {
                DispatchError::network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let reply: Option<ApiReply> = response.json().await.ok();

        match reply {
            Some(reply) if reply.ok && (200..300).contains(&status) => {
                debug!("messages forwarded");
                Ok(())
            },
            Some(reply) => {
                let code = reply.error_code.unwrap_or(status);
                if code == 429 {
                    let retry_after =
                        reply.parameters.and_then(|p| p.retry_after).unwrap_or(1);
                    warn!(retry_after, "bot api rate limited");
                    return Err(DispatchError::rate_limited(retry_after));
                }
                let description = reply.description.unwrap_or_else(|| "no description".into());
                warn!(code, description = %description, "bot api rejected forward");
                Err(DispatchError::api(code, description))
            },
            None if status == 429 => Err(DispatchError::rate_limited(1)),
            None => Err(DispatchError::api(status, "unreadable bot api reply")),
        }
    }
}

impl DeliveryTransport for TelegramTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn deliver<'a>(
        &'a self,
        chat_id: ChatId,
        message_ids: &'a [MessageId],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let span = info_span!("telegram_forward", chat_id = %chat_id, messages = message_ids.len());
        Box::pin(self.forward(chat_id, message_ids).instrument(span))
    }
}

/// Extracts the numeric bot id from `<bot id>:<secret>`.
fn bot_id(token: &str) -> Result<&str> {
    match token.split_once(':') {
        Some((id, secret))
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !secret.is_empty() =>
        {
            Ok(id)
        },
        _ => Err(DispatchError::configuration("telegram bot token must look like <bot id>:<secret>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_the_bot_id() {
        let transport =
            TelegramTransport::new(TelegramConfig::new("123456:ABC-secret", ChatId(-100))).unwrap();
        assert_eq!(transport.identity(), "123456");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "secret-only", ":secret", "12a:secret", "123:"] {
            let result = TelegramTransport::new(TelegramConfig::new(token, ChatId(1)));
            assert!(
                matches!(result, Err(DispatchError::Configuration { .. })),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn request_body_matches_bot_api_shape() {
        let ids = [MessageId(10), MessageId(11)];
        let body = ForwardMessages { chat_id: ChatId(101), from_chat_id: ChatId(-5), message_ids: &ids };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"chat_id": 101, "from_chat_id": -5, "message_ids": [10, 11]})
        );
    }

    #[test]
    fn debug_output_hides_the_token_secret() {
        let config = TelegramConfig::new("123456:ABC-secret", ChatId(-100));
        let transport = TelegramTransport::new(config.clone()).unwrap();

        for rendered in [format!("{config:?}"), format!("{transport:?}")] {
            assert!(!rendered.contains("ABC-secret"), "{rendered}");
            assert!(rendered.contains("123456:***"), "{rendered}");
        }
    }
}
