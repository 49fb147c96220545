//! Client-side event buffer.
//!
//! Events are recorded into memory with no I/O, noised at flush time, and
//! transmitted on a randomized schedule so the flush cadence does not mirror
//! user activity. Pending events are only removed after the transport
//! confirms acceptance. A batch that fails transiently is retried as the
//! same prefix with exponential backoff; after `max_retries` it is dropped.
//! Events recorded meanwhile wait for the next batch with a fresh retry
//! count. A batch the endpoint rejects outright is dropped at once.
//!
//! With `privacy.max_epsilon` set, a flush only releases as many events as
//! the remaining budget covers and holds the rest. At most
//! `buffer.max_pending` events are held; newer events are discarded.

pub mod session;
pub mod transport;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BufferConfig, PrivacyConfig};
use crate::error::Error;
use crate::event::{Device, EventRecord, UNKNOWN_COUNTRY};
use crate::privacy::noise::MIN_EPSILON;
use crate::privacy::{add_privacy_noise, Budget, NoiseConfig, PrivacyAccountant};

pub use self::session::Session;
pub use self::transport::{HttpTransport, Transport};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a flush attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Sent { events: usize },
    Empty,
    /// The client context is hidden; nothing was sent.
    Paused,
    /// Another flush is already running on this buffer.
    InProgress,
    /// The remaining privacy budget does not cover a single event; all
    /// pending events are kept.
    BudgetExhausted { held: usize },
}

#[derive(Debug, Error)]
pub enum FlushError {
    /// Transmission failed; events are still pending and will be retried.
    #[error("flush attempt {attempt} failed, retrying in {retry_in:?}: {source}")]
    Retrying {
        attempt: u32,
        retry_in: Duration,
        source: Error,
    },
    /// The batch was discarded: retries ran out, or the endpoint rejected
    /// it permanently.
    #[error("dropped {events} events: {source}")]
    Dropped { events: usize, source: Error },
    #[error(transparent)]
    Config(Error),
}

// ---------------------------------------------------------------------------
// Client context & status
// ---------------------------------------------------------------------------

/// Attributes stamped on every recorded event.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub device: Device,
    pub country: String,
    pub page: Option<String>,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            device: Device::Desktop,
            country: UNKNOWN_COUNTRY.to_string(),
            page: None,
        }
    }
}

/// Read-only snapshot for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub pending: usize,
    pub retry_attempt: u32,
    pub visible: bool,
    pub session_id: String,
    pub epsilon: f64,
    pub budget_spent: Budget,
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Events discarded because `max_pending` was reached.
    pub overflow_dropped: u64,
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

struct BufferState {
    pending: Vec<EventRecord>,
    /// Length of the failed batch at the front of `pending`, 0 when none.
    in_flight: usize,
    retry_attempt: u32,
    visible: bool,
    session: Session,
    context: ClientContext,
    noise: NoiseConfig,
    accountant: PrivacyAccountant,
    last_flush_at: Option<DateTime<Utc>>,
    overflow_dropped: u64,
}

pub struct EventBuffer {
    state: Mutex<BufferState>,
    config: BufferConfig,
    max_epsilon: Option<f64>,
    max_delta: f64,
    transport: Arc<dyn Transport>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_signal: Notify,
}

impl EventBuffer {
    /// Build a buffer. Fails if the privacy configuration cannot produce noise.
    pub fn new(
        config: BufferConfig,
        privacy: &PrivacyConfig,
        context: ClientContext,
        session: Session,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let noise = privacy.noise_config();
        noise.validate()?;
        Ok(Self {
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                in_flight: 0,
                retry_attempt: 0,
                visible: true,
                session,
                context,
                noise,
                accountant: PrivacyAccountant::new(),
                last_flush_at: None,
                overflow_dropped: 0,
            }),
            config,
            max_epsilon: privacy.max_epsilon,
            max_delta: privacy.max_delta,
            transport,
            flush_lock: tokio::sync::Mutex::new(()),
            flush_signal: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // State stays consistent across a panicking holder: every mutation
        // is a single push/drain/assignment.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event. Returns the number of pending events.
    pub fn record(&self, event_type: &str, count: f64, attributes: Map<String, Value>) -> usize {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(self.config.session_ttl_hours);
        let pending = {
            let mut st = self.lock();
            if st.pending.len() >= self.config.max_pending {
                st.overflow_dropped += 1;
                if st.overflow_dropped == 1 || st.overflow_dropped % 100 == 0 {
                    warn!(
                        max_pending = self.config.max_pending,
                        dropped = st.overflow_dropped,
                        "event buffer full, discarding new events"
                    );
                }
                return st.pending.len();
            }
            let session_id = st.session.refresh(now, ttl).to_string();
            let event = EventRecord {
                event_type: event_type.to_string(),
                count,
                timestamp: now,
                session_id,
                device: Some(st.context.device),
                country: st.context.country.clone(),
                page: st.context.page.clone(),
                attributes,
            };
            st.pending.push(event);
            st.pending.len()
        };
        if pending >= self.config.size_threshold {
            debug!(pending, "buffer threshold reached");
            self.flush_signal.notify_one();
        }
        pending
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn set_page(&self, page: Option<String>) {
        self.lock().context.page = page;
    }

    /// Update the privacy parameter used for subsequent flushes.
    pub fn set_epsilon(&self, epsilon: f64) {
        self.lock().noise.epsilon = epsilon;
    }

    /// Start a new accounting period.
    pub fn reset_budget(&self) {
        self.lock().accountant.reset();
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn status(&self) -> BufferStatus {
        let st = self.lock();
        BufferStatus {
            pending: st.pending.len(),
            retry_attempt: st.retry_attempt,
            visible: st.visible,
            session_id: st.session.session_id.to_string(),
            epsilon: st.noise.epsilon,
            budget_spent: st.accountant.spent(),
            last_flush_at: st.last_flush_at,
            overflow_dropped: st.overflow_dropped,
        }
    }

    /// Toggle visibility. Losing visibility pauses the schedule and makes a
    /// best-effort final flush.
    pub async fn set_visible(&self, visible: bool) {
        let was_visible = {
            let mut st = self.lock();
            std::mem::replace(&mut st.visible, visible)
        };
        if was_visible && !visible {
            debug!("client hidden, attempting final flush");
            self.flush_final().await;
        } else if !was_visible && visible {
            debug!("client visible, resuming flush schedule");
        }
    }

    /// Events the remaining budget can release, at most `wanted`.
    fn affordable(&self, st: &BufferState, epsilon: f64, delta: f64, wanted: usize) -> usize {
        let Some(max_epsilon) = self.max_epsilon else {
            return wanted;
        };
        let remaining = st.accountant.get_remaining_budget(max_epsilon, self.max_delta);
        let mut n = ((remaining.epsilon / epsilon).floor() as usize).min(wanted);
        if delta > 0.0 {
            n = n.min((remaining.delta / delta).floor() as usize);
        }
        while n > 0
            && !st.accountant.can_execute_query(
                epsilon * n as f64,
                delta * n as f64,
                max_epsilon,
                self.max_delta,
            )
        {
            n -= 1;
        }
        n
    }

    /// Noise up to `count` events from the front of the queue and charge the
    /// accountant for each. Returns fewer when the budget runs short.
    fn noise_snapshot(&self, count: usize) -> Result<Vec<EventRecord>, Error> {
        let mut st = self.lock();
        let noise = st.noise.clone();
        let epsilon = noise.epsilon.max(MIN_EPSILON);
        let delta = noise.delta.unwrap_or(0.0);
        let count = self.affordable(&st, epsilon, delta, count.min(st.pending.len()));

        let mut batch = Vec::with_capacity(count);
        for event in st.pending.iter().take(count) {
            let mut noised = event.clone();
            noised.count = add_privacy_noise(event.count, &noise)?;
            batch.push(noised);
        }
        for _ in 0..count {
            st.accountant.add_query(epsilon, delta);
        }
        Ok(batch)
    }

    /// Attempt one flush. A batch that failed before is retried as the same
    /// prefix; otherwise everything pending is sent, up to the budget.
    pub async fn flush(&self) -> Result<FlushOutcome, FlushError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(FlushOutcome::InProgress);
        };

        let wanted = {
            let st = self.lock();
            if !st.visible {
                return Ok(FlushOutcome::Paused);
            }
            if st.in_flight > 0 {
                st.in_flight.min(st.pending.len())
            } else {
                st.pending.len()
            }
        };
        if wanted == 0 {
            return Ok(FlushOutcome::Empty);
        }

        let batch = self.noise_snapshot(wanted).map_err(FlushError::Config)?;
        if batch.is_empty() {
            let held = self.pending();
            warn!(held, "privacy budget exhausted, holding events");
            return Ok(FlushOutcome::BudgetExhausted { held });
        }
        let count = batch.len();

        match self.transport.send(&batch).await {
            Ok(()) => {
                let mut st = self.lock();
                // Only flushes remove events, so the batch is still the prefix.
                st.pending.drain(..count);
                st.in_flight = 0;
                st.retry_attempt = 0;
                st.last_flush_at = Some(Utc::now());
                debug!(events = count, remaining = st.pending.len(), "flush succeeded");
                Ok(FlushOutcome::Sent { events: count })
            }
            Err(source) if !source.is_transient() => {
                let mut st = self.lock();
                st.pending.drain(..count);
                st.in_flight = 0;
                st.retry_attempt = 0;
                warn!(events = count, error = %source, "batch rejected, not retrying");
                Err(FlushError::Dropped {
                    events: count,
                    source,
                })
            }
            Err(source) => {
                let mut st = self.lock();
                st.retry_attempt += 1;
                let attempt = st.retry_attempt;
                if attempt > self.config.max_retries {
                    st.pending.drain(..count);
                    st.in_flight = 0;
                    st.retry_attempt = 0;
                    Err(FlushError::Dropped {
                        events: count,
                        source,
                    })
                } else {
                    st.in_flight = count;
                    Err(FlushError::Retrying {
                        attempt,
                        retry_in: self.backoff_delay(attempt),
                        source,
                    })
                }
            }
        }
    }

    /// One best-effort attempt over the teardown path. Never retries.
    pub async fn flush_final(&self) -> Option<FlushOutcome> {
        let _guard = self.flush_lock.lock().await;
        let count = self.pending();
        if count == 0 {
            return Some(FlushOutcome::Empty);
        }
        let batch = match self.noise_snapshot(count) {
            Ok(batch) if batch.is_empty() => {
                return Some(FlushOutcome::BudgetExhausted { held: count })
            }
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "final flush could not noise events");
                return None;
            }
        };
        let count = batch.len();
        match self.transport.send_final(&batch).await {
            Ok(()) => {
                let mut st = self.lock();
                st.pending.drain(..count);
                st.in_flight = st.in_flight.saturating_sub(count);
                if st.in_flight == 0 {
                    st.retry_attempt = 0;
                }
                st.last_flush_at = Some(Utc::now());
                info!(events = count, "final flush delivered");
                Some(FlushOutcome::Sent { events: count })
            }
            Err(e) => {
                warn!(events = count, error = %e, "final flush failed");
                None
            }
        }
    }

    /// `base * 2^(attempt-1)` plus random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.config.base_delay_ms.saturating_mul(1u64 << exp);
        let jitter = if self.config.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Random delay within the configured flush bounds, drawn every cycle.
    pub fn next_interval(&self) -> Duration {
        let min = self.config.flush_min_secs * 1000;
        let max = self.config.flush_max_secs.max(self.config.flush_min_secs) * 1000;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Drive the flush schedule until `shutdown` fires, then make a final
    /// flush. Backoff waits happen in place; cycles never overlap.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("event buffer flush loop started");
        'cycle: loop {
            let wait = self.next_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break 'cycle,
                _ = tokio::time::sleep(wait) => {}
                _ = self.flush_signal.notified() => debug!("early flush on buffer threshold"),
            }

            loop {
                match self.flush().await {
                    Ok(outcome) => {
                        debug!(?outcome, "flush cycle finished");
                        break;
                    }
                    Err(FlushError::Retrying {
                        attempt,
                        retry_in,
                        source,
                    }) => {
                        debug!(attempt, ?retry_in, error = %source, "flush failed, backing off");
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'cycle,
                            _ = tokio::time::sleep(retry_in) => {}
                        }
                    }
                    Err(FlushError::Dropped { events, source }) => {
                        warn!(events, error = %source, "dropping batch");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "flush aborted");
                        break;
                    }
                }
            }
        }
        self.flush_final().await;
        info!("event buffer flush loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
