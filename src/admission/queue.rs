//! Per-client FIFO admission queue and dispatch sequencing.

use arc_swap::ArcSwap;
use axum::http::StatusCode;
use axum::response::Response;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::admission::body::BodyError;
use crate::admission::estimator::{DecayParams, DecayState, DelayEstimate};
use crate::admission::unit::{PendingRequest, PendingResponse, RequestUnit, ResultHandle};
use crate::admission::Outcome;
use crate::config::AdmissionConfig;
use crate::http::response::local_response;
use crate::observability::metrics;
use crate::upstream::{Forward, UpstreamRequest};

/// Delays below this are not worth a timer.
const MIN_DELAY_SECS: f64 = 0.001;

/// Result of [`AdmissionQueue::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Answered without queueing.
    Rejected(Response),
    /// Queued; resolves once the unit settles.
    Queued(PendingResponse),
}

impl Admission {
    pub async fn into_response(self) -> Response {
        match self {
            Admission::Rejected(response) => response,
            Admission::Queued(pending) => pending.wait().await,
        }
    }
}

#[derive(Debug)]
struct Slot {
    /// Taken by the driver when the unit is dispatched; the slot stays
    /// queued until the unit settles.
    unit: Option<RequestUnit>,
}

/// Admission state for one client.
#[derive(Debug, Default)]
pub struct ClientState {
    queue: VecDeque<Slot>,
    queued_count: usize,
    decay: DecayState,
}

impl ClientState {
    fn push(&mut self, unit: RequestUnit) {
        self.queue.push_back(Slot { unit: Some(unit) });
        self.queued_count += 1;
        debug_assert_eq!(self.queued_count, self.queue.len());
    }

    fn pop_head(&mut self) {
        if self.queue.pop_front().is_some() {
            self.queued_count -= 1;
        }
        debug_assert_eq!(self.queued_count, self.queue.len());
    }

    fn is_reapable(&self, now: Instant, window: f64) -> bool {
        self.queue.is_empty() && self.decay.is_idle(now, window)
    }
}

/// Point-in-time view of a client's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientSnapshot {
    pub queued: usize,
    pub consumed: f64,
    pub delay: f64,
}

enum Step {
    /// Settle locally without computing a delay.
    Skip(RequestUnit, Outcome),
    Dispatch {
        unit: RequestUnit,
        estimate: DelayEstimate,
        queued: usize,
    },
}

struct Shared {
    clients: DashMap<String, ClientState>,
    settings: ArcSwap<AdmissionConfig>,
    forwarder: Arc<dyn Forward>,
    verbose: bool,
}

/// Owns every client's queue. Cheap to clone.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    /// `verbose` logs every dispatch instead of only delayed ones.
    pub fn new(settings: AdmissionConfig, forwarder: Arc<dyn Forward>, verbose: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                clients: DashMap::new(),
                settings: ArcSwap::from_pointee(settings),
                forwarder,
                verbose,
            }),
        }
    }

    pub fn settings(&self) -> Arc<AdmissionConfig> {
        self.shared.settings.load_full()
    }

    /// Swap tuning; applies from the next admission or delay computation.
    pub fn update_settings(&self, settings: AdmissionConfig) {
        tracing::info!(
            hard_timeout_secs = settings.hard_timeout_secs,
            window_secs = settings.window_secs,
            concurrency_target = settings.concurrency_target,
            concurrency_limit = settings.concurrency_limit,
            max_body_bytes = settings.max_body_bytes,
            "Admission settings updated"
        );
        self.shared.settings.store(Arc::new(settings));
    }

    /// Queue `request` for client `key`, or reject it if the queue is full.
    pub fn admit(&self, key: impl Into<String>, request: PendingRequest) -> Admission {
        let key = key.into();
        let limit = self.shared.settings.load().concurrency_limit;

        let (pending, start_driver) = {
            let mut state = self.shared.clients.entry(key.clone()).or_default();
            if state.queue.len() >= limit {
                let queued = state.queue.len();
                drop(state);
                tracing::warn!(client = %key, queued, path = %request.context.log_path(), "Too many queued requests");
                metrics::record_outcome(Outcome::Rejected.label());
                return Admission::Rejected(local_response(StatusCode::TOO_MANY_REQUESTS));
            }

            let (handle, pending) = ResultHandle::channel();
            state.push(RequestUnit::new(request, handle, Instant::now()));
            (pending, state.queue.len() == 1)
        };

        if start_driver {
            metrics::record_tracked_clients(self.shared.clients.len());
            tokio::spawn(Arc::clone(&self.shared).drive(key));
        }
        Admission::Queued(pending)
    }

    pub fn snapshot(&self, key: &str) -> Option<ClientSnapshot> {
        self.shared.clients.get(key).map(|state| ClientSnapshot {
            queued: state.queued_count,
            consumed: state.decay.consumed(),
            delay: state.decay.delay(),
        })
    }

    pub fn tracked_clients(&self) -> usize {
        self.shared.clients.len()
    }

    /// Forget clients with nothing queued that have been idle for a window.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let window = self.shared.settings.load().window_secs;
        let before = self.shared.clients.len();
        self.shared.clients.retain(|key, state| {
            let reap = state.is_reapable(now, window);
            if reap {
                tracing::trace!(client = %key, "Evicting idle client state");
            }
            !reap
        });
        let after = self.shared.clients.len();
        metrics::record_tracked_clients(after);
        before.saturating_sub(after)
    }
}

impl Shared {
    /// Serve `key`'s queue until it is empty.
    async fn drive(self: Arc<Self>, key: String) {
        let mut waited = false;
        loop {
            let settings = self.settings.load_full();
            let Some(step) = self.next_step(&key, &settings, waited) else {
                tracing::error!(client = %key, "Dispatch driver found no head unit");
                return;
            };

            let action_start = match step {
                Step::Skip(mut unit, outcome) => {
                    settle_locally(&key, &mut unit.handle, outcome);
                    Instant::now()
                }
                Step::Dispatch {
                    unit,
                    estimate,
                    queued,
                } => self.dispatch(&key, unit, estimate, queued, &settings).await,
            };

            if !self.complete(&key, action_start, &settings) {
                return;
            }
            waited = true;
        }
    }

    /// Take the head unit and decide what to do with it.
    fn next_step(&self, key: &str, settings: &AdmissionConfig, waited: bool) -> Option<Step> {
        let mut guard = self.clients.get_mut(key)?;
        let state = &mut *guard;
        let queued = state.queue.len();
        let unit = state.queue.front_mut()?.unit.take()?;
        let now = Instant::now();

        if waited {
            if !unit.handle.is_active() {
                return Some(Step::Skip(unit, Outcome::Cancelled));
            }
            if now.saturating_duration_since(unit.admitted_at) > settings.hard_timeout() {
                return Some(Step::Skip(unit, Outcome::QueueTimeout));
            }
        }

        let estimate = state.decay.compute_delay(now, DecayParams::from(settings));
        Some(Step::Dispatch {
            unit,
            estimate,
            queued,
        })
    }

    /// Wait out the delay and forward. Returns when the forwarded action started.
    async fn dispatch(
        &self,
        key: &str,
        unit: RequestUnit,
        estimate: DelayEstimate,
        queued: usize,
        settings: &AdmissionConfig,
    ) -> Instant {
        let RequestUnit {
            request,
            mut handle,
            ..
        } = unit;
        let PendingRequest {
            context,
            uri,
            headers,
            body,
        } = request;

        if self.verbose || estimate.delay > 0.0 {
            tracing::info!(
                client = %key,
                queued,
                cc_ms = estimate.consumed * 1000.0,
                dt_ms = estimate.since_last * 1000.0,
                delay_ms = estimate.delay * 1000.0,
                path = %context.log_path(),
                "Dispatch"
            );
        }
        metrics::record_dispatch_delay(estimate.delay);

        if estimate.delay > MIN_DELAY_SECS {
            let delay = Duration::try_from_secs_f64(estimate.delay).unwrap_or_else(|_| settings.window());
            tokio::time::sleep(delay).await;
        }

        let action_start = Instant::now();
        if !handle.is_active() {
            settle_locally(key, &mut handle, Outcome::Cancelled);
            return action_start;
        }

        let body = match body.connect() {
            Ok(body) => body,
            Err(BodyError::Overflow(max_bytes)) => {
                tracing::warn!(client = %key, path = %context.log_path(), max_bytes, "Request body too large");
                settle_locally(key, &mut handle, Outcome::BodyOverflow);
                return action_start;
            }
            Err(BodyError::Aborted) => {
                settle_locally(key, &mut handle, Outcome::Cancelled);
                return action_start;
            }
        };

        let request = UpstreamRequest {
            context,
            uri,
            headers,
            body,
            timeout: settings.hard_timeout(),
        };
        let forwarded = AssertUnwindSafe(self.forwarder.forward(request))
            .catch_unwind()
            .await;

        let (response, outcome) = match forwarded {
            Ok(Ok(response)) => (response, Outcome::Forwarded),
            Ok(Err(e)) => {
                let outcome = if e.is_unavailable() {
                    Outcome::UpstreamUnavailable
                } else {
                    Outcome::UpstreamError(e.status())
                };
                (e.into_response(), outcome)
            }
            Err(_) => {
                tracing::error!(client = %key, "Forwarder panicked");
                (
                    local_response(StatusCode::SERVICE_UNAVAILABLE),
                    Outcome::UpstreamUnavailable,
                )
            }
        };
        metrics::record_outcome(outcome.label());
        handle.settle(response);
        action_start
    }

    /// Book the finished unit and pop it. Returns whether more units wait.
    fn complete(&self, key: &str, action_start: Instant, settings: &AdmissionConfig) -> bool {
        let Some(mut state) = self.clients.get_mut(key) else {
            return false;
        };
        state
            .decay
            .on_consume(Instant::now(), action_start, settings.window_secs);
        state.pop_head();
        !state.queue.is_empty()
    }
}

fn settle_locally(key: &str, handle: &mut ResultHandle, outcome: Outcome) {
    let status = outcome
        .local_status()
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    tracing::debug!(client = %key, status = status.as_u16(), outcome = outcome.label(), "Settled without upstream");
    metrics::record_outcome(outcome.label());
    handle.settle(local_response(status));
}
