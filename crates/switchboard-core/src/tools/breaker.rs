//! Per-server circuit breaker.
//!
//! Closed → (N consecutive failures) → Open → (cooldown elapsed) →
//! Half-Open → trial success → Closed, or trial failure → Open with the
//! cooldown reset. While Open, calls short-circuit without touching the
//! server, so one dead dependency cannot drag a whole multi-server turn
//! down to its timeout.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Failure tracker for one downstream server.
pub struct CircuitBreaker {
    server: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            server: server.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Ask permission to contact the server. `Err(())` means short-circuit
    /// now. After the cooldown exactly one caller is admitted as the
    /// half-open trial; everyone else keeps short-circuiting until the
    /// trial reports.
    pub fn try_acquire(&self) -> Result<(), ()> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return Err(()),
        };
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(event = "breaker_half_open", server = %self.server);
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state != BreakerState::Closed {
                tracing::info!(event = "breaker_closed", server = %self.server);
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            match inner.state {
                BreakerState::HalfOpen => {
                    // Failed trial: back to Open, cooldown restarts.
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(event = "breaker_reopened", server = %self.server);
                }
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        tracing::warn!(
                            event = "breaker_opened",
                            server = %self.server,
                            failures = inner.consecutive_failures
                        );
                    }
                }
                BreakerState::Open => {}
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map(|g| g.state)
            .unwrap_or(BreakerState::Open)
    }
}
