//! Rate-limited admission queue for outbound reasoning calls.
//!
//! Every request to the reasoning service passes through an
//! [`AdmissionQueue`]. A queue enforces a request quota over a fixed window
//! (one hour by default). Calls that fit run immediately; the rest wait in a
//! strict FIFO and are released when the window rolls over. Queues are
//! independent per provider and are handed out by an [`AdmissionRegistry`].
//!
//! All counters and the wait list live behind one mutex that is never held
//! across an await, so concurrent admission checks cannot lose updates.

use crate::error::{Error, Result};
use crate::{olog_debug, olog_warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default quota window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Configuration sentinel for "no quota".
pub const UNLIMITED: i64 = -1;

/// Provider used when no model route matches.
pub const DEFAULT_PROVIDER: &str = "default";

/// Request quota for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestLimit {
    /// Quota disabled; every call runs immediately.
    Unlimited,
    /// Maximum total weight admitted per window.
    PerWindow(u32),
}

impl RequestLimit {
    /// Parse a configured quota. `-1` disables the quota.
    ///
    /// # Errors
    /// Returns `InvalidQuota` for zero, negative non-sentinel, or out of range
    /// values.
    pub fn from_config(provider: &str, value: i64) -> Result<Self> {
        match value {
            UNLIMITED => Ok(RequestLimit::Unlimited),
            v if v > 0 && v <= u32::MAX as i64 => Ok(RequestLimit::PerWindow(v as u32)),
            v => Err(Error::InvalidQuota {
                provider: provider.to_string(),
                value: v,
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, RequestLimit::Unlimited)
    }
}

impl std::fmt::Display for RequestLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestLimit::Unlimited => write!(f, "unlimited"),
            RequestLimit::PerWindow(n) => write!(f, "{}/window", n),
        }
    }
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdmissionMetrics {
    /// Calls currently waiting.
    pub queue_depth: usize,
    /// Calls admitted since creation or reset.
    pub total_processed: u64,
    /// Mean time between enqueue and admission.
    pub average_wait_ms: f64,
    /// Weight admitted in the current window.
    pub window_usage: u32,
}

struct Waiter {
    weight: u32,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

struct AdmissionState {
    limit: RequestLimit,
    /// Start of the current window; `None` until the first admission.
    window_start: Option<Instant>,
    used: u32,
    waiting: VecDeque<Waiter>,
    drainer_active: bool,
    total_processed: u64,
    total_wait: Duration,
}

impl AdmissionState {
    fn new(limit: RequestLimit) -> Self {
        Self {
            limit,
            window_start: None,
            used: 0,
            waiting: VecDeque::new(),
            drainer_active: false,
            total_processed: 0,
            total_wait: Duration::ZERO,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if let Some(start) = self.window_start {
            if now >= start + window {
                self.window_start = None;
                self.used = 0;
            }
        }
    }

    /// Record `weight` against the window if the quota allows it.
    fn try_admit(&mut self, weight: u32, now: Instant, name: &str) -> bool {
        let fits = match self.limit {
            RequestLimit::Unlimited => true,
            RequestLimit::PerWindow(limit) => {
                if self.used.saturating_add(weight) <= limit {
                    true
                } else if weight > limit && self.used == 0 {
                    olog_warn!(
                        "Admission[{}]: weight {} exceeds the whole limit {}; admitting alone",
                        name,
                        weight,
                        limit
                    );
                    true
                } else {
                    false
                }
            }
        };
        if fits {
            self.window_start.get_or_insert(now);
            self.used = self.used.saturating_add(weight);
        }
        fits
    }

    fn note_admitted(&mut self, waited: Duration) {
        self.total_processed += 1;
        self.total_wait += waited;
    }

    /// Release waiters from the head while they fit.
    fn drain(&mut self, now: Instant, name: &str) {
        while let Some(front) = self.waiting.front() {
            if !self.try_admit(front.weight, now, name) {
                break;
            }
            if let Some(waiter) = self.waiting.pop_front() {
                if waiter.tx.send(()).is_err() {
                    // Caller went away while queued.
                    self.used = self.used.saturating_sub(waiter.weight);
                    continue;
                }
                self.note_admitted(now.saturating_duration_since(waiter.enqueued_at));
            }
        }
    }

    fn metrics(&self) -> AdmissionMetrics {
        let average_wait_ms = if self.total_processed == 0 {
            0.0
        } else {
            self.total_wait.as_secs_f64() * 1000.0 / self.total_processed as f64
        };
        AdmissionMetrics {
            queue_depth: self.waiting.len(),
            total_processed: self.total_processed,
            average_wait_ms,
            window_usage: self.used,
        }
    }
}

fn lock(state: &Mutex<AdmissionState>) -> MutexGuard<'_, AdmissionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A named, FIFO, quota-enforcing gate.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct AdmissionQueue {
    name: Arc<str>,
    window: Duration,
    state: Arc<Mutex<AdmissionState>>,
}

impl AdmissionQueue {
    /// Create a queue with the default one-hour window.
    pub fn new(name: &str, limit: RequestLimit) -> Self {
        Self::with_window(name, limit, DEFAULT_WINDOW)
    }

    /// Create a queue with a custom window length.
    pub fn with_window(name: &str, limit: RequestLimit, window: Duration) -> Self {
        Self {
            name: Arc::from(name),
            window,
            state: Arc::new(Mutex::new(AdmissionState::new(limit))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> RequestLimit {
        lock(&self.state).limit
    }

    /// Change the quota. Admitted work is untouched; queued calls keep their
    /// position and are released at once if the new quota fits them.
    pub fn set_limit(&self, limit: RequestLimit) {
        let mut state = lock(&self.state);
        olog_debug!(
            "Admission[{}]: limit {} -> {}",
            self.name,
            state.limit,
            limit
        );
        state.limit = limit;
        let now = Instant::now();
        state.roll_window(now, self.window);
        state.drain(now, &self.name);
    }

    pub fn metrics(&self) -> AdmissionMetrics {
        lock(&self.state).metrics()
    }

    /// Clear usage and counters, then release any waiters that fit.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.window_start = None;
        state.used = 0;
        state.total_processed = 0;
        state.total_wait = Duration::ZERO;
        state.drain(Instant::now(), &self.name);
    }

    /// Run `call` once the quota admits `weight` units.
    ///
    /// With the quota disabled the call runs immediately. Otherwise it runs
    /// immediately if nobody is waiting and it fits, and waits its FIFO turn
    /// if not.
    pub async fn enqueue<F, Fut, T>(&self, weight: u32, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.admit(weight).await;
        call().await
    }

    /// Wait until `weight` units are admitted.
    pub async fn admit(&self, weight: u32) {
        let weight = weight.max(1);
        let (rx, spawn_drainer) = {
            let mut state = lock(&self.state);
            let now = Instant::now();
            state.roll_window(now, self.window);

            let may_jump = state.limit.is_unlimited() || state.waiting.is_empty();
            if may_jump && state.try_admit(weight, now, &self.name) {
                state.note_admitted(Duration::ZERO);
                return;
            }

            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(Waiter {
                weight,
                enqueued_at: now,
                tx,
            });
            olog_debug!(
                "Admission[{}]: queued weight {} (depth {}, used {}, limit {})",
                self.name,
                weight,
                state.waiting.len(),
                state.used,
                state.limit
            );
            let spawn = !state.drainer_active;
            state.drainer_active = true;
            (rx, spawn)
        };

        if spawn_drainer {
            self.spawn_drainer();
        }
        // A dropped sender only happens if the queue itself is gone.
        let _ = rx.await;
    }

    fn spawn_drainer(&self) {
        let state = Arc::clone(&self.state);
        let window = self.window;
        let name = Arc::clone(&self.name);

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let s = lock(&state);
                    match s.window_start {
                        Some(start) => start + window,
                        None => Instant::now(),
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let mut s = lock(&state);
                let now = Instant::now();
                s.roll_window(now, window);
                s.drain(now, &name);
                if s.waiting.is_empty() {
                    s.drainer_active = false;
                    break;
                }
            }
        });
    }
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("AdmissionQueue")
            .field("name", &self.name)
            .field("limit", &state.limit)
            .field("used", &state.used)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

/// Hands out one [`AdmissionQueue`] per provider.
///
/// Models are routed to providers by id prefix; unmatched models use the
/// [`DEFAULT_PROVIDER`] queue.
pub struct AdmissionRegistry {
    queues: Mutex<HashMap<String, AdmissionQueue>>,
    /// (model prefix, provider) pairs.
    routes: Vec<(String, String)>,
    default_limit: RequestLimit,
    window: Duration,
}

impl AdmissionRegistry {
    pub fn new(default_limit: RequestLimit) -> Self {
        Self::with_window(default_limit, DEFAULT_WINDOW)
    }

    pub fn with_window(default_limit: RequestLimit, window: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            routes: Vec::new(),
            default_limit,
            window,
        }
    }

    /// A registry whose queues never block.
    pub fn unlimited() -> Self {
        Self::new(RequestLimit::Unlimited)
    }

    /// Route models starting with `prefix` to `provider`.
    pub fn add_route(&mut self, prefix: &str, provider: &str) {
        self.routes.push((prefix.to_string(), provider.to_string()));
    }

    /// Create or update the queue for `provider`.
    pub fn register(&self, provider: &str, limit: RequestLimit) -> AdmissionQueue {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match queues.get(provider) {
            Some(queue) => {
                queue.set_limit(limit);
                queue.clone()
            }
            None => {
                let queue = AdmissionQueue::with_window(provider, limit, self.window);
                queues.insert(provider.to_string(), queue.clone());
                queue
            }
        }
    }

    /// Queue for `provider`, created with the default limit if new.
    pub fn queue(&self, provider: &str) -> AdmissionQueue {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(provider.to_string())
            .or_insert_with(|| {
                AdmissionQueue::with_window(provider, self.default_limit, self.window)
            })
            .clone()
    }

    /// Provider a model routes to (longest matching prefix wins).
    pub fn provider_for(&self, model: &str) -> &str {
        self.routes
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, provider)| provider.as_str())
            .unwrap_or(DEFAULT_PROVIDER)
    }

    pub fn queue_for_model(&self, model: &str) -> AdmissionQueue {
        self.queue(self.provider_for(model))
    }

    /// Names of all queues created so far, sorted.
    pub fn providers(&self) -> Vec<String> {
        let queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdmissionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionRegistry")
            .field("providers", &self.providers())
            .field("default_limit", &self.default_limit)
            .finish()
    }
}
