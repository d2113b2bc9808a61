//! Request pacing and cost accounting.
//!
//! The rate limiter is a token bucket: capacity `request_burst`, refill
//! `requests_per_second`.  A turnstile mutex queues waiters so wake order is
//! FIFO.  The cost ledger tracks reservations against the configured USD
//! ceiling; reservations must be committed or released explicitly.

use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::EngineError;

// ─── rate limiter ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    state: StdMutex<BucketState>,
    /// Waiters queue on this mutex; tokio mutexes wake FIFO.
    turnstile: Mutex<()>,
}

impl RateLimiter {
    /// Lock the bucket, recovering from poisoning: a panicking holder
    /// cannot leave the counters in a broken state.
    fn bucket(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        let rate_per_second = requests_per_second.max(0.0);
        // A zero rate admits nothing at all, not even the initial burst.
        let initial_tokens = if rate_per_second > 0.0 { capacity } else { 0.0 };
        Self {
            rate_per_second,
            capacity,
            state: StdMutex::new(BucketState {
                tokens: initial_tokens,
                last_refill: Instant::now(),
            }),
            turnstile: Mutex::new(()),
        }
    }

    /// Block until a request token is available, FIFO across callers.
    ///
    /// A zero rate never produces tokens beyond the initial burst; waiting
    /// callers park until `cancel` flips true.
    pub async fn acquire(&self, cancel: &watch::Receiver<bool>) -> Result<(), EngineError> {
        if *cancel.borrow() {
            return Err(EngineError::Cancelled);
        }
        let mut cancel = cancel.clone();
        let _turn = self.turnstile.lock().await;

        loop {
            let wait = {
                let mut state = self.bucket();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                if self.rate_per_second > 0.0 {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_second))
                } else {
                    None
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                return Err(EngineError::Cancelled);
                            }
                        }
                    }
                }
                None => {
                    // rate = 0: nothing will ever refill.
                    debug!("rate limiter parked: zero refill rate");
                    loop {
                        if cancel.changed().await.is_err() || *cancel.borrow() {
                            return Err(EngineError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
        state.last_refill = now;
    }

    /// Tokens currently available (test observability).
    pub fn available(&self) -> f64 {
        let mut state = self.bucket();
        self.refill(&mut state);
        state.tokens
    }
}

// ─── cost ledger ─────────────────────────────────────────────────────────────

/// Atomically exported usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub spent_usd: f64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    spent_usd: f64,
    reserved_usd: f64,
    requests: u64,
    tokens_in: u64,
    tokens_out: u64,
}

/// A granted budget reservation.  Must be passed back via
/// [`CostLedger::commit`] or [`CostLedger::release`].
#[derive(Debug)]
#[must_use = "reservations must be committed or released"]
pub struct CostReservation {
    amount_usd: f64,
}

impl CostReservation {
    pub fn amount_usd(&self) -> f64 {
        self.amount_usd
    }
}

#[derive(Debug)]
pub struct CostLedger {
    max_usd: Option<f64>,
    state: StdMutex<LedgerState>,
    started_at: DateTime<Utc>,
}

impl CostLedger {
    fn ledger(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new(max_usd: Option<f64>) -> Self {
        Self {
            max_usd,
            state: StdMutex::new(LedgerState::default()),
            started_at: Utc::now(),
        }
    }

    /// Reserve estimated spend.  Fails when spend plus outstanding
    /// reservations would cross the ceiling; non-blocking by design.
    pub fn reserve(&self, estimated_usd: f64) -> Result<CostReservation, EngineError> {
        let mut state = self.ledger();
        if let Some(max) = self.max_usd {
            let committed = state.spent_usd + state.reserved_usd;
            if committed + estimated_usd > max {
                return Err(EngineError::BudgetExceeded {
                    needed: estimated_usd,
                    remaining: (max - committed).max(0.0),
                });
            }
        }
        state.reserved_usd += estimated_usd;
        Ok(CostReservation {
            amount_usd: estimated_usd,
        })
    }

    /// Count one issued LLM request (retries count individually).
    pub fn note_request(&self) {
        let mut state = self.ledger();
        state.requests += 1;
    }

    /// Swap a reservation for actual spend and usage counts.
    pub fn commit(&self, reservation: CostReservation, actual_usd: f64, tokens_in: u64, tokens_out: u64) {
        let mut state = self.ledger();
        state.reserved_usd = (state.reserved_usd - reservation.amount_usd).max(0.0);
        state.spent_usd += actual_usd;
        state.tokens_in += tokens_in;
        state.tokens_out += tokens_out;
    }

    /// Return an unused reservation to the pool.
    pub fn release(&self, reservation: CostReservation) {
        let mut state = self.ledger();
        state.reserved_usd = (state.reserved_usd - reservation.amount_usd).max(0.0);
    }

    pub fn stats(&self) -> UsageStats {
        let state = self.ledger();
        UsageStats {
            requests: state.requests,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            spent_usd: state.spent_usd,
            started_at: self.started_at,
        }
    }
}
