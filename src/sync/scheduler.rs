use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use super::reconcile::{refresh_feed, ReconcileReport, RefreshError};
use crate::feed::FetchClient;
use crate::storage::Store;

/// Default refresh cadence.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

/// Shortest period the timer accepts; shorter intervals are raised to it.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(10);

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Timer armed with this period.
    Scheduled(Duration),
    InFlight,
}

/// Host process lifecycle. The timer only runs while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Background,
}

/// What launched a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Manual,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// A new cycle was launched; the handle resolves when it completes.
    Started(JoinHandle<()>),
    /// A cycle was already in flight for this feed.
    Coalesced,
}

/// Sent to the observer after every completed cycle.
#[derive(Debug)]
pub struct RefreshEvent {
    pub feed_url: Url,
    pub trigger: Trigger,
    pub result: Result<ReconcileReport, RefreshError>,
}

struct Control {
    /// `start()` was called and `stop()` was not.
    started: bool,
    lifecycle: Lifecycle,
    timer: Option<JoinHandle<()>>,
    /// Blocks new cycles. Tracked apart from `phase` because `stop()` reports
    /// `Idle` while a cycle it did not cancel is still running.
    in_flight: bool,
    phase: SchedulerState,
    events: Option<mpsc::Sender<RefreshEvent>>,
}

struct Inner<S> {
    feed_url: Url,
    fetcher: FetchClient,
    store: Arc<S>,
    interval: Duration,
    completed: AtomicU64,
    control: Mutex<Control>,
}

/// Drives periodic refreshes of a single feed.
///
/// At most one cycle runs at a time: a trigger that arrives while a cycle is
/// in flight is coalesced. A manual trigger disarms the timer until its cycle
/// completes, then re-arms it one full interval later. Stopping never cancels
/// a running cycle.
pub struct RefreshScheduler<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> RefreshScheduler<S> {
    /// `interval` is raised to [`MIN_REFRESH_INTERVAL`] if shorter.
    pub fn new(feed_url: Url, fetcher: FetchClient, store: Arc<S>, interval: Duration) -> Self {
        if interval < MIN_REFRESH_INTERVAL {
            tracing::warn!(
                feed = %feed_url,
                interval_ms = interval.as_millis() as u64,
                "Refresh interval too short, using the minimum"
            );
        }
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        Self {
            inner: Arc::new(Inner {
                feed_url,
                fetcher,
                store,
                interval,
                completed: AtomicU64::new(0),
                control: Mutex::new(Control {
                    started: false,
                    lifecycle: Lifecycle::Active,
                    timer: None,
                    in_flight: false,
                    phase: SchedulerState::Idle,
                    events: None,
                }),
            }),
        }
    }

    /// Reports every completed cycle on `events`.
    pub fn observe(&self, events: mpsc::Sender<RefreshEvent>) {
        self.inner.lock().events = Some(events);
    }

    pub fn feed_url(&self) -> &Url {
        &self.inner.feed_url
    }

    /// Arms the timer and fires the first cycle right away.
    ///
    /// In the background lifecycle nothing is armed until the host becomes
    /// active again.
    pub fn start(&self) {
        let mut control = self.inner.lock();
        control.started = true;
        if control.lifecycle == Lifecycle::Active && control.timer.is_none() {
            self.inner.arm(&mut control, Instant::now());
        }
    }

    /// Disarms the timer. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        let mut control = self.inner.lock();
        control.started = false;
        if let Some(timer) = control.timer.take() {
            timer.abort();
        }
        control.phase = SchedulerState::Idle;
    }

    /// Manual refresh.
    pub fn trigger(&self) -> TriggerOutcome {
        self.inner.launch(Trigger::Manual)
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut control = self.inner.lock();
        control.lifecycle = lifecycle;
        match lifecycle {
            Lifecycle::Background => {
                if let Some(timer) = control.timer.take() {
                    timer.abort();
                }
                if !control.in_flight {
                    control.phase = SchedulerState::Idle;
                }
            }
            Lifecycle::Active => {
                if control.started && control.timer.is_none() {
                    self.inner.arm(&mut control, Instant::now());
                }
            }
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().phase
    }

    pub fn completed_cycles(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }
}

impl<S: Store> Drop for RefreshScheduler<S> {
    fn drop(&mut self) {
        // The timer task holds its own reference to `inner`, and a running
        // cycle would re-arm it on completion
        let mut control = self.inner.lock();
        control.started = false;
        if let Some(timer) = control.timer.take() {
            timer.abort();
        }
    }
}

impl<S: Store> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the timer task. The first tick lands at `first`.
    fn arm(self: &Arc<Self>, control: &mut Control, first: Instant) {
        let inner = Arc::clone(self);
        let period = self.interval;
        control.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let TriggerOutcome::Coalesced = inner.launch(Trigger::Timer) {
                    tracing::debug!(feed = %inner.feed_url, "Timer fired during refresh, skipped");
                }
            }
        }));
        if !control.in_flight {
            control.phase = SchedulerState::Scheduled(period);
        }
    }

    fn launch(self: &Arc<Self>, trigger: Trigger) -> TriggerOutcome {
        let mut control = self.lock();
        if control.in_flight {
            return TriggerOutcome::Coalesced;
        }
        control.in_flight = true;
        control.phase = SchedulerState::InFlight;
        if trigger == Trigger::Manual {
            if let Some(timer) = control.timer.take() {
                timer.abort();
            }
        }
        drop(control);

        let inner = Arc::clone(self);
        TriggerOutcome::Started(tokio::spawn(async move {
            inner.run_cycle(trigger).await;
        }))
    }

    async fn run_cycle(self: Arc<Self>, trigger: Trigger) {
        tracing::debug!(feed = %self.feed_url, trigger = ?trigger, "Refresh cycle started");
        let result = refresh_feed(&self.fetcher, self.store.as_ref(), &self.feed_url).await;
        if let Err(e) = &result {
            tracing::warn!(feed = %self.feed_url, error = %e, "Refresh cycle failed");
        }

        let events = {
            let mut control = self.lock();
            control.in_flight = false;
            if control.started && control.lifecycle == Lifecycle::Active {
                if control.timer.is_none() {
                    let first = Instant::now() + self.interval;
                    self.arm(&mut control, first);
                }
                control.phase = SchedulerState::Scheduled(self.interval);
            } else {
                control.phase = SchedulerState::Idle;
            }
            control.events.clone()
        };
        self.completed.fetch_add(1, Ordering::AcqRel);

        if let Some(events) = events {
            let event = RefreshEvent {
                feed_url: self.feed_url.clone(),
                trigger,
                result,
            };
            if let Err(e) = events.send(event).await {
                tracing::warn!(feed = %self.feed_url, error = %e, "Refresh event dropped (receiver closed)");
            }
        }
    }
}
