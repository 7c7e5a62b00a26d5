//! Background heartbeat thread for one session
//!
//! The monitor holds only a weak reference, so it never counts as an owner
//! of the session and stops by itself once the session is dropped or LOST.
//! While a check runs the upgraded reference is pinned, which keeps it out
//! of the registry's holder count.

use crate::session::handle::Session;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of the shutdown check while sleeping
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Liveness check run on every beat; returns false on a missed beat
pub type HeartbeatCheck = Arc<dyn Fn(&Session) -> bool + Send + Sync>;

/// A strong reference counted in the session's pins until dropped
struct Pinned<'a> {
    session: Option<Arc<Session>>,
    pins: &'a Mutex<usize>,
}

impl<'a> Pinned<'a> {
    fn upgrade(session: &Weak<Session>, pins: &'a Mutex<usize>) -> Option<Self> {
        let mut count = pins.lock().unwrap_or_else(PoisonError::into_inner);
        let session = session.upgrade()?;
        *count += 1;
        Some(Self {
            session: Some(session),
            pins,
        })
    }

    fn session(&self) -> Option<&Session> {
        self.session.as_deref()
    }
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        let mut count = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        self.session.take();
        *count = count.saturating_sub(1);
    }
}

pub struct HeartbeatMonitor {
    shutdown_flag: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Start probing `session` every `interval`
    pub fn start(session: &Arc<Session>, interval: Duration) -> Self {
        Self::with_check(session, interval, Arc::new(|s: &Session| s.heartbeat()))
    }

    /// Start with a custom check, e.g. one that also updates device records
    pub fn with_check(session: &Arc<Session>, interval: Duration, check: HeartbeatCheck) -> Self {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let beats = Arc::new(AtomicU64::new(0));
        let misses = Arc::new(AtomicU64::new(0));

        let handle = {
            let pins = Arc::clone(session.pins());
            let session = Arc::downgrade(session);
            let shutdown_flag = shutdown_flag.clone();
            let beats = beats.clone();
            let misses = misses.clone();
            thread::spawn(move || {
                Self::monitor_loop(session, pins, check, interval, shutdown_flag, beats, misses)
            })
        };

        info!("Heartbeat monitor started ({:?} interval)", interval);
        Self {
            shutdown_flag,
            beats,
            misses,
            thread_handle: Mutex::new(Some(handle)),
        }
    }

    fn monitor_loop(
        session: Weak<Session>,
        pins: Arc<Mutex<usize>>,
        check: HeartbeatCheck,
        interval: Duration,
        shutdown_flag: Arc<AtomicBool>,
        beats: Arc<AtomicU64>,
        misses: Arc<AtomicU64>,
    ) {
        loop {
            let started = Instant::now();
            while started.elapsed() < interval {
                if shutdown_flag.load(Ordering::SeqCst) {
                    debug!("Heartbeat monitor shutdown requested");
                    return;
                }
                thread::sleep(SLEEP_SLICE.min(interval));
            }

            let Some(pinned) = Pinned::upgrade(&session, &pins) else {
                debug!("Session dropped, heartbeat monitor exiting");
                return;
            };
            let Some(current) = pinned.session() else {
                return;
            };
            if current.is_lost() {
                debug!("Session {} lost, heartbeat monitor exiting", current.serial());
                return;
            }

            beats.fetch_add(1, Ordering::SeqCst);
            if !check(current) {
                misses.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Probes sent so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    /// Probes that went unanswered
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Stop the thread and wait for it
    pub fn stop(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            info!("Heartbeat monitor stopped");
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
