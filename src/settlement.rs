//! Image settlement detection
//!
//! Tracks in-flight image requests reported by an [`ObserverTap`] and decides
//! when the page has gone quiet enough to capture. The wait is bounded by a
//! timeout and always resolves; running out of time is a degraded success.

use async_trait::async_trait;
use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use tracing::{debug, info, warn};

/// A network lifecycle event observed on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Started { id: String, image: bool },
    Finished { id: String },
    Failed { id: String },
}

/// Scoped source of [`ResourceEvent`]s.
///
/// `detach` stops interception and drops every listener. The detector calls
/// it exactly once, after the wait resolves on any path.
#[async_trait]
pub trait ObserverTap: Send {
    /// Next observed event, or `None` once the page stops reporting.
    async fn next_event(&mut self) -> Option<ResourceEvent>;

    async fn detach(&mut self);
}

/// In-flight image request identifiers for one session.
#[derive(Debug, Default)]
pub struct PendingResourceSet {
    ids: HashSet<String>,
}

impl PendingResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event. Only image requests enter the set. Returns true when
    /// a finish or failure removed a tracked image.
    pub fn apply(&mut self, event: &ResourceEvent) -> bool {
        match event {
            ResourceEvent::Started { id, image: true } => {
                self.ids.insert(id.clone());
                false
            }
            ResourceEvent::Started { image: false, .. } => false,
            ResourceEvent::Finished { id } | ResourceEvent::Failed { id } => self.ids.remove(id),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How the settlement wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// No tracked image was pending across a full debounce window.
    Settled { elapsed: Duration },
    /// The timeout elapsed first; `pending` images were still in flight.
    TimedOut { pending: usize },
    /// The page stopped reporting events before settling.
    Interrupted { pending: usize },
}

impl Settlement {
    pub fn is_settled(&self) -> bool {
        matches!(self, Settlement::Settled { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SettlementDetector {
    timeout: Duration,
    debounce: Duration,
}

impl SettlementDetector {
    pub fn new(timeout: Duration, debounce: Duration) -> Self {
        Self { timeout, debounce }
    }

    /// Wait for the page's image traffic to settle, then detach the tap.
    pub async fn wait(&self, tap: &mut dyn ObserverTap) -> Settlement {
        let outcome = self.track(tap).await;
        tap.detach().await;

        match &outcome {
            Settlement::Settled { elapsed } => {
                debug!("Images settled after {:?}", elapsed);
            }
            Settlement::TimedOut { pending } => {
                warn!(
                    "Settlement timed out after {:?} with {} image request(s) still pending",
                    self.timeout, pending
                );
                metrics::increment_counter!(crate::metrics::SETTLEMENT_TIMEOUTS);
            }
            Settlement::Interrupted { pending } => {
                info!("Page stopped reporting network events with {} pending", pending);
            }
        }

        outcome
    }

    async fn track(&self, tap: &mut dyn ObserverTap) -> Settlement {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut pending = PendingResourceSet::new();

        // Armed at start so a page with no image traffic settles after one window.
        let mut idle_check = Some(Box::pin(sleep(self.debounce)));

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Settlement::TimedOut { pending: pending.len() };
                }
                _ = idle(&mut idle_check) => {
                    idle_check = None;
                    if pending.is_empty() {
                        return Settlement::Settled { elapsed: started.elapsed() };
                    }
                }
                event = tap.next_event() => {
                    let Some(event) = event else {
                        return if pending.is_empty() {
                            Settlement::Settled { elapsed: started.elapsed() }
                        } else {
                            Settlement::Interrupted { pending: pending.len() }
                        };
                    };

                    // Untracked traffic never moves the idle check
                    if pending.apply(&event) {
                        idle_check = Some(Box::pin(sleep(self.debounce)));
                    } else if matches!(event, ResourceEvent::Started { image: true, .. }) {
                        idle_check = None;
                    }
                }
            }
        }
    }
}

async fn idle(check: &mut Option<Pin<Box<Sleep>>>) {
    match check {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
