//! Request pacing and token budgeting for one rate-limit domain.
//!
//! A [`Throttle`] is shared (via `Arc`) by every engine bound to the same
//! (base_url, model) pair. It enforces two independent mechanisms, matching
//! how vendors express their limits: minimum spacing between requests (rpm)
//! and a rolling 60-second token budget (tpm).

use crate::context::InferenceContext;
use crate::types::EngineError;
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// Fraction of the tpm budget withheld as headroom, because the input-token
/// pre-estimate undercounts actual usage. Tune per vendor via
/// [`Throttle::with_redundancy`].
pub const DEFAULT_REDUNDANCY: f64 = 0.5;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Reservation {
    tokens: u64,
    at: Instant,
}

#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<Reservation>,
    total: u64,
}

/// Shared rpm/tpm gate. All methods are cheap when the corresponding limit
/// is unset.
#[derive(Debug)]
pub struct Throttle {
    rpm: Option<u32>,
    tpm: Option<u32>,
    redundancy: f64,
    valve: Arc<Semaphore>,
    window: Mutex<Window>,
}

impl Throttle {
    pub fn new(rpm: Option<u32>, tpm: Option<u32>) -> Self {
        Self::with_redundancy(rpm, tpm, DEFAULT_REDUNDANCY)
    }

    /// `redundancy` is clamped into `[0, 1]`; a value of 1 leaves a zero
    /// budget and makes every reservation overflow, surfacing the config
    /// mistake loudly.
    pub fn with_redundancy(rpm: Option<u32>, tpm: Option<u32>, redundancy: f64) -> Self {
        Self {
            rpm: rpm.filter(|r| *r > 0),
            tpm: tpm.filter(|t| *t > 0),
            redundancy: redundancy.clamp(0.0, 1.0),
            valve: Arc::new(Semaphore::new(1)),
            window: Mutex::new(Window::default()),
        }
    }

    fn budget(&self, tpm: u32) -> u64 {
        (tpm as f64 * (1.0 - self.redundancy)) as u64
    }

    /// Reserves the request slot, enforcing minimum spacing of
    /// `ceil(60000/rpm)` ms between consecutive reservations. The slot is
    /// released by a timer, not by the caller, so spacing holds no matter
    /// how fast calls complete. Honors the context's pause gate (read side)
    /// and cancellation signal while waiting.
    pub async fn requests(&self, ctx: &InferenceContext) -> Result<()> {
        let Some(rpm) = self.rpm else { return Ok(()) };

        // A rate-limit incident handler holding the write side stops new
        // reservations; concurrent readers pass through freely.
        let _pause = match &ctx.pause_gate {
            Some(gate) => tokio::select! {
                biased;
                _ = ctx.signal.cancelled() => return Err(EngineError::Aborted.into()),
                guard = gate.read() => Some(guard),
            },
            None => None,
        };

        let permit = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(EngineError::Aborted.into()),
            permit = self.valve.clone().acquire_owned() => permit?,
        };

        let interval = Duration::from_millis((60_000 + rpm as u64 - 1) / rpm as u64);
        permit.forget();
        let valve = self.valve.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            valve.add_permits(1);
        });

        Ok(())
    }

    /// Reserves `tokens` of the rolling budget, blocking while the trailing
    /// 60-second total would exceed `tpm * (1 - redundancy)`. Expired
    /// entries are evicted lazily, oldest first; waiters sleep until the
    /// oldest entry ages out. Cancellation rejects the wait without
    /// consuming the slot.
    pub async fn input_tokens(&self, tokens: u64, ctx: &InferenceContext) -> Result<()> {
        let Some(tpm) = self.tpm else { return Ok(()) };
        let budget = self.budget(tpm);

        loop {
            let wait = {
                let mut window = self.window.lock().await;
                loop {
                    if window.total + tokens <= budget {
                        window.entries.push_back(Reservation {
                            tokens,
                            at: Instant::now(),
                        });
                        window.total += tokens;
                        break None;
                    }
                    let now = Instant::now();
                    let Some(oldest_at) = window.entries.front().map(|r| r.at) else {
                        return Err(EngineError::Throttle(format!(
                            "reservation of {tokens} tokens exceeds the budget of {budget}"
                        ))
                        .into());
                    };
                    let age = now.duration_since(oldest_at);
                    if age >= WINDOW {
                        if let Some(expired) = window.entries.pop_front() {
                            window.total -= expired.tokens;
                        }
                    } else {
                        break Some(WINDOW - age);
                    }
                }
            };

            match wait {
                None => return Ok(()),
                Some(delay) => tokio::select! {
                    biased;
                    _ = ctx.signal.cancelled() => return Err(EngineError::Aborted.into()),
                    _ = tokio::time::sleep(delay) => {}
                },
            }
        }
    }

    /// Records tokens that were already consumed (output counts are known
    /// only after a call completes). Never waits for budget; the amount
    /// weighs on future reservations.
    pub async fn output_tokens(&self, tokens: u64) {
        if self.tpm.is_none() || tokens == 0 {
            return;
        }
        let mut window = self.window.lock().await;
        window.entries.push_back(Reservation {
            tokens,
            at: Instant::now(),
        });
        window.total += tokens;
    }

    #[cfg(test)]
    async fn total(&self) -> u64 {
        self.window.lock().await.total
    }
}
