//! Scripted delivery transport.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use herald_core::models::{ChatId, MessageId};
use herald_dispatch::{DeliveryTransport, DispatchError, Result};
use tokio_util::sync::CancellationToken;

/// One recorded call to [`DeliveryTransport::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Target chat.
    pub chat_id: ChatId,
    /// Messages requested.
    pub message_ids: Vec<MessageId>,
    /// Whether the scripted reply was a success.
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
enum Script {
    /// Fail the next `n` calls, then succeed.
    FailTimes(usize, DispatchError),
    /// Fail every call.
    FailAlways(DispatchError),
}

#[derive(Default)]
struct State {
    scripts: HashMap<ChatId, Script>,
    calls: Vec<Delivery>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Transport whose replies are scripted per chat.
///
/// Chats without a script succeed. Every call is recorded in order of
/// completion.
pub struct ScriptedTransport {
    identity: String,
    latency: Duration,
    state: Mutex<State>,
}

impl ScriptedTransport {
    /// Creates a transport with the given quota identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), latency: Duration::ZERO, state: Mutex::default() }
    }

    /// Adds real (tokio) latency to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call to `chat` fail.
    pub fn fail_always(&self, chat: i64) {
        self.state().scripts.insert(
            ChatId(chat),
            Script::FailAlways(DispatchError::api(403, "Forbidden: bot was blocked by the user")),
        );
    }

    /// Makes the next `times` calls to `chat` fail with a network error.
    pub fn fail_times(&self, chat: i64, times: usize) {
        self.state()
            .scripts
            .insert(ChatId(chat), Script::FailTimes(times, DispatchError::network("connection reset")));
    }

    /// Makes the next call to `chat` fail with a given error.
    pub fn fail_once_with(&self, chat: i64, error: DispatchError) {
        self.state().scripts.insert(ChatId(chat), Script::FailTimes(1, error));
    }

    /// Cancels `token` once `calls` deliveries were recorded.
    pub fn cancel_after(&self, calls: usize, token: CancellationToken) {
        self.state().cancel_after = Some((calls, token));
    }

    /// All recorded calls.
    pub fn calls(&self) -> Vec<Delivery> {
        self.state().calls.clone()
    }

    /// Number of calls made to one chat.
    pub fn calls_to(&self, chat: i64) -> usize {
        self.state().calls.iter().filter(|d| d.chat_id == ChatId(chat)).count()
    }

    /// Chats that received a successful delivery, in completion order.
    pub fn delivered_chats(&self) -> Vec<i64> {
        self.state().calls.iter().filter(|d| d.succeeded).map(|d| d.chat_id.0).collect()
    }

    fn reply(&self, chat_id: ChatId, message_ids: &[MessageId]) -> Result<()> {
        let mut state = self.state();

        let result = match state.scripts.get_mut(&chat_id) {
            Some(Script::FailAlways(error)) => Err(error.clone()),
            Some(Script::FailTimes(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            },
            _ => Ok(()),
        };

        state.calls.push(Delivery {
            chat_id,
            message_ids: message_ids.to_vec(),
            succeeded: result.is_ok(),
        });

        let recorded = state.calls.len();
        if let Some((after, token)) = &state.cancel_after {
            if recorded >= *after {
                token.cancel();
            }
        }

        result
    }
}

impl DeliveryTransport for ScriptedTransport {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn deliver<'a>(
        &'a self,
        chat_id: ChatId,
        message_ids: &'a [MessageId],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.reply(chat_id, message_ids)
        })
    }
}
