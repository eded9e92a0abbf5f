//! Connection establishment with a bounded retry budget.
//!
//! `ConnectionManager::connect` drives the transport until the broker accepts
//! the connection or the budget runs out:
//!
//! ```text
//! connect()
//!   ├── attempt 1 ── Err ── warn, sleep(connect_retry_delay)
//!   ├── attempt 2 ── Err ── warn, sleep(connect_retry_delay)
//!   │   ...
//!   └── attempt N ── Err ── ConnectExhausted (no trailing sleep)
//! ```
//!
//! Each attempt is watched by `connect_attempt_timeout`. A slow attempt is
//! reported with a warning and then awaited to completion; the timeout never
//! abandons an attempt.
//!
//! Once connected, reconnection after a loss belongs to the transport. This
//! manager is not involved again until the next explicit `connect()`.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    config::Tuning,
    error::BridgeError,
    retry::RetryBudget,
    state::{ConnectionState, StateTracker},
    transport::Transport,
};

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    tuning: Tuning,
    state: Arc<StateTracker>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, tuning: Tuning, state: Arc<StateTracker>) -> Self {
        Self {
            transport,
            tuning,
            state,
        }
    }

    /// Connects, retrying up to `connect_retries` times in total.
    ///
    /// # Errors
    /// `BridgeError::ConnectExhausted` carrying the last attempt's failure.
    /// The state is `Disconnected` afterwards.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.run(true).await
    }

    /// Like [`ConnectionManager::connect`], but stays in `Connecting` on
    /// success. Whoever replays the subscriptions reports `Connected`.
    pub async fn connect_pending_replay(&self) -> Result<(), BridgeError> {
        self.run(false).await
    }

    async fn run(&self, report_connected: bool) -> Result<(), BridgeError> {
        self.state.set(ConnectionState::Connecting);

        let mut budget = RetryBudget::new(
            self.tuning.connect_retries,
            self.tuning.connect_retry_delay(),
        );

        loop {
            debug!(
                "Connecting to MQTT broker (attempt {}/{})",
                budget.attempt(),
                budget.max_attempts()
            );

            let err = match self.attempt().await {
                Ok(()) => {
                    info!(
                        "MQTT connection established after {} attempt(s)",
                        budget.attempt()
                    );
                    if report_connected {
                        self.state.set(ConnectionState::Connected);
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            match budget.next_delay() {
                Ok(delay) => {
                    warn!("failed to connect to MQTT broker: {err}. Retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(exhausted) => {
                    error!("Giving up on MQTT broker: {exhausted}");
                    self.state.set(ConnectionState::Disconnected);
                    return Err(BridgeError::ConnectExhausted {
                        attempts: budget.failed(),
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    /// One transport attempt, with a warning if it outlives the attempt timeout.
    async fn attempt(&self) -> Result<(), BridgeError> {
        let attempt = self.transport.connect();
        tokio::pin!(attempt);

        match tokio::time::timeout(self.tuning.connect_attempt_timeout(), &mut attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!("connection to MQTT broker timed out");
                attempt.await
            }
        }
    }

    /// Closes the connection after the disconnect grace period. Never fails.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.transport
            .disconnect(self.tuning.disconnect_grace())
            .await;
        self.state.set(ConnectionState::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::mock::MockTransport;

    fn manager(transport: Arc<MockTransport>, tuning: Tuning) -> ConnectionManager {
        ConnectionManager::new(transport, tuning, Arc::new(StateTracker::new()))
    }

    fn failures(n: usize) -> Vec<Result<(), String>> {
        (0..n).map(|i| Err(format!("refused #{}", i + 1))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let (transport, _events) = MockTransport::new();
        transport.script_connects(failures(9));
        let manager = manager(Arc::clone(&transport), Tuning::default());

        let started = Instant::now();
        manager.connect().await.unwrap();

        assert_eq!(transport.connect_calls(), 10);
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        assert_eq!(manager.state.get(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_budget() {
        let (transport, _events) = MockTransport::new();
        transport.script_connects(failures(12));
        let manager = manager(Arc::clone(&transport), Tuning::default());

        let started = Instant::now();
        let err = manager.connect().await.unwrap_err();

        assert_eq!(transport.connect_calls(), 10);
        // Nine pauses between ten attempts, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        match err {
            BridgeError::ConnectExhausted { attempts, source } => {
                assert_eq!(attempts, 10);
                assert!(source.to_string().contains("refused #10"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_budget() {
        let (transport, _events) = MockTransport::new();
        transport.script_connects(failures(5));
        let tuning = Tuning {
            connect_retries: 3,
            connect_retry_delay_ms: 250,
            ..Tuning::default()
        };
        let manager = manager(Arc::clone(&transport), tuning);

        let started = Instant::now();
        assert!(manager.connect().await.unwrap_err().is_connect_exhausted());
        assert_eq!(transport.connect_calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_is_not_abandoned() {
        let (transport, _events) = MockTransport::new();
        transport.set_connect_delay(Duration::from_millis(1500));
        let manager = manager(Arc::clone(&transport), Tuning::default());

        manager.connect().await.unwrap();

        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(manager.state.get(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_connecting() {
        let (transport, _events) = MockTransport::new();
        transport.script_connects(failures(1));
        let manager = Arc::new(manager(Arc::clone(&transport), Tuning::default()));
        let mut states = manager.state.subscribe();

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

        task.await.unwrap().unwrap();
        assert_eq!(manager.state.get(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_pending_replay_leaves_connected_to_replay() {
        let (transport, _events) = MockTransport::new();
        let manager = manager(Arc::clone(&transport), Tuning::default());

        manager.connect_pending_replay().await.unwrap();

        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(manager.state.get(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_disconnect_always_ok() {
        let (transport, _events) = MockTransport::new();
        let manager = manager(Arc::clone(&transport), Tuning::default());

        manager.connect().await.unwrap();
        assert!(manager.disconnect().await.is_ok());
        assert!(manager.disconnect().await.is_ok());

        assert_eq!(transport.disconnect_calls(), 2);
        assert_eq!(manager.state.get(), ConnectionState::Disconnected);
    }
}
