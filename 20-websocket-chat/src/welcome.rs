//! Deferred welcome delivery.
//!
//! Entering the named state earns a connection one informational message
//! fetched from a [`WelcomeSource`]. The fetch runs on its own task so a slow
//! source never stalls other connections, and the [`WelcomeTask`] handle lets
//! the owning connection abandon it when the client leaves first.

use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::ConnectionId;

pub const WELCOME_TEXT: &str = "Welcome to the Simple WebSocket Chat!";
pub const WELCOME_FALLBACK: &str = "Sorry, couldn't fetch the welcome message.";
pub const DEFAULT_WELCOME_DELAY: Duration = Duration::from_millis(1500);

/// Somewhere a welcome text can be fetched from.
pub trait WelcomeSource: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Result<String>>;
}

/// Returns a fixed text after a fixed delay, standing in for a slow lookup.
#[derive(Debug, Clone)]
pub struct DelayedWelcome {
    delay: Duration,
    text: String,
}

impl DelayedWelcome {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            text: WELCOME_TEXT.to_string(),
        }
    }

    #[cfg(test)]
    fn with_text(delay: Duration, text: impl Into<String>) -> Self {
        Self {
            delay,
            text: text.into(),
        }
    }
}

impl WelcomeSource for DelayedWelcome {
    fn fetch(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            debug!(delay = ?self.delay, "fetching welcome message");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.text.clone())
        })
    }
}

/// Pending welcome delivery for one connection.
#[derive(Debug)]
pub struct WelcomeTask {
    conn: ConnectionId,
    handle: JoinHandle<()>,
}

impl WelcomeTask {
    pub(crate) fn new(conn: ConnectionId, handle: JoinHandle<()>) -> Self {
        Self { conn, handle }
    }

    pub fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Abandons the delivery. Returns `true` if it had not happened yet.
    pub fn cancel(self) -> bool {
        let pending = self.is_pending();
        self.handle.abort();
        if pending {
            debug!(conn = %self.conn, "welcome delivery abandoned");
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delayed_welcome_waits_for_the_configured_delay() {
        let source = DelayedWelcome::new(Duration::from_millis(1500));
        let started = tokio::time::Instant::now();

        let text = source.fetch().await.expect("fetch succeeds");

        assert_eq!(text, WELCOME_TEXT);
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn zero_delay_returns_immediately() {
        let source = DelayedWelcome::with_text(Duration::ZERO, "hello");
        assert_eq!(source.fetch().await.expect("fetch succeeds"), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reports_whether_delivery_was_pending() {
        let conn = ConnectionId::new(1);

        let slow = WelcomeTask::new(
            conn,
            tokio::spawn(tokio::time::sleep(Duration::from_secs(60))),
        );
        assert!(slow.is_pending());
        assert!(slow.cancel());

        let fast = WelcomeTask::new(conn, tokio::spawn(async {}));
        while fast.is_pending() {
            tokio::task::yield_now().await;
        }
        assert!(!fast.cancel());
    }
}
