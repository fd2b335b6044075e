//! Admission throttling for front-end receive loops.
//!
//! While the gate is throttled, a loop about to arm its next receive parks a continuation
//! instead. The thread that flips the gate back to open drains the parked continuations in
//! FIFO order and each one resubmits its loop as a fresh task.
//!
//! # Key invariants
//! - The throttled flag only changes through compare-and-set, so each open transition is
//!   observed by exactly one caller, and only that caller drains.
//! - A continuation is parked only after re-checking the flag under the queue lock, so no
//!   continuation can be stranded behind an open gate.
//! - After `close` no continuation is parked or run again.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type Continuation = Box<dyn FnOnce() + Send>;

/// Result of asking the gate whether a loop may arm its next receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    Proceed(T),
    /// The state moved into a parked continuation; the calling loop must stop.
    Deferred,
}

pub struct AdmissionGate {
    label: &'static str,
    throttled: AtomicBool,
    deferred: Mutex<Option<VecDeque<Continuation>>>,
    signal: watch::Sender<bool>,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("label", &self.label)
            .field("throttled", &self.is_throttled())
            .field("deferred", &self.deferred_len())
            .finish()
    }
}

impl AdmissionGate {
    pub fn new(label: &'static str) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            label,
            throttled: AtomicBool::new(false),
            deferred: Mutex::new(Some(VecDeque::new())),
            signal,
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().as_ref().map_or(0, VecDeque::len)
    }

    /// Proceeds with `state` when open; otherwise parks `resume(state)` until the gate opens.
    pub fn try_admit<T, F>(&self, state: T, resume: F) -> Admission<T>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        if !self.is_throttled() {
            return Admission::Proceed(state);
        }
        let mut deferred = self.deferred.lock();
        let Some(queue) = deferred.as_mut() else {
            return Admission::Deferred;
        };
        // The gate may have opened after the fast-path check; the drain would have missed us.
        if !self.is_throttled() {
            return Admission::Proceed(state);
        }
        queue.push_back(Box::new(move || resume(state)));
        metrics::counter!("broker_frontend_deferred_total", "transport" => self.label)
            .increment(1);
        Admission::Deferred
    }

    /// Returns `true` when this call performed the open → throttled transition.
    pub fn start_throttling(&self) -> bool {
        if self
            .throttled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.publish_state();
        metrics::counter!(
            "broker_frontend_throttle_transitions_total",
            "transport" => self.label,
            "state" => "throttled"
        )
        .increment(1);
        tracing::info!(transport = self.label, "admission throttling started");
        true
    }

    /// Opens the gate and runs every parked continuation in FIFO order.
    ///
    /// Returns how many continuations were resumed; zero when the gate was already open.
    pub fn stop_throttling(&self) -> usize {
        if self
            .throttled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        metrics::counter!(
            "broker_frontend_throttle_transitions_total",
            "transport" => self.label,
            "state" => "open"
        )
        .increment(1);
        let drained: Vec<Continuation> = {
            let mut deferred = self.deferred.lock();
            self.signal.send_replace(self.is_throttled());
            match deferred.as_mut() {
                Some(queue) => queue.drain(..).collect(),
                None => Vec::new(),
            }
        };
        let resumed = drained.len();
        tracing::info!(transport = self.label, resumed, "admission throttling stopped");
        // Run outside the lock; continuations may re-enter the gate.
        for resume in drained {
            resume();
        }
        resumed
    }

    // Transitions publish under the queue lock and read the flag again, so the last
    // publish always matches the flag even when transitions interleave.
    fn publish_state(&self) {
        let _deferred = self.deferred.lock();
        self.signal.send_replace(self.is_throttled());
    }

    pub fn set_throttled(&self, throttled: bool) {
        if throttled {
            self.start_throttling();
        } else {
            self.stop_throttling();
        }
    }

    /// Waits until the gate is open. Returns `false` if `timeout` elapsed first.
    pub async fn wait_not_throttled(&self, timeout: Duration) -> bool {
        let mut rx = self.signal.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|throttled| !*throttled)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => !self.is_throttled(),
        }
    }

    /// Follows an external overload signal until it closes or the gate is dropped.
    ///
    /// Only changes are applied; an initially open source leaves the gate as it is.
    pub fn follow(self: &Arc<Self>, mut source: watch::Receiver<bool>) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            // An open source must not reopen a gate throttled by someone else.
            if *source.borrow_and_update() {
                match gate.upgrade() {
                    Some(gate) => {
                        gate.start_throttling();
                    }
                    None => return,
                }
            }
            while source.changed().await.is_ok() {
                let throttled = *source.borrow_and_update();
                match gate.upgrade() {
                    Some(gate) => gate.set_throttled(throttled),
                    None => return,
                }
            }
        })
    }

    /// Drops every parked continuation and refuses new ones.
    pub fn close(&self) {
        let dropped = self.deferred.lock().take().map_or(0, |queue| queue.len());
        if dropped > 0 {
            tracing::debug!(transport = self.label, dropped, "deferred receives dropped");
        }
    }
}
