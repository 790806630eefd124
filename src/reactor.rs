// src/reactor.rs
// Cooperative event loop for the control thread. Timers are kept in an
// explicit priority queue keyed on the monotonic clock; the control thread
// suspends only in `run`'s wait-for-next-deadline, and the only cross-thread
// state is the atomic shutdown latch shared with session workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::debug;

/// Sentinel waketime: the timer is parked and will not fire.
pub const NEVER: f64 = 9e99;

/// Process-wide monotonic clock. Session workers stamp frame send/receive
/// times with this same base so clock sync and the reactor agree on host
/// time.
pub fn monotonic() -> f64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Shortest sleep worth handing to the OS scheduler.
const MIN_SLEEP: f64 = 0.000_050;

pub type TimerId = usize;

/// A timer callback receives the event time and returns the next waketime
/// (or `NEVER` to park).
pub type TimerCallback = Box<dyn FnMut(&mut Reactor, f64) -> f64 + Send>;

struct HeapEntry {
    waketime: f64,
    id: TimerId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.waketime == other.waketime && self.id == other.id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on waketime. Waketimes are never NaN: they come from
        // monotonic arithmetic or the NEVER sentinel.
        other
            .waketime
            .partial_cmp(&self.waketime)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerSlot {
    waketime: f64,
    callback: Option<TimerCallback>,
}

/// Shared latch observed by the control thread and every session worker.
#[derive(Clone)]
pub struct ShutdownLatch(Arc<AtomicBool>);

impl ShutdownLatch {
    pub fn new() -> Self {
        ShutdownLatch(Arc::new(AtomicBool::new(false)))
    }
    pub fn trip(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }
    pub fn is_tripped(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Reactor {
    // Test mode pins the clock to a manually advanced value.
    test_time: Option<f64>,
    timers: Vec<TimerSlot>,
    heap: BinaryHeap<HeapEntry>,
    shutdown: ShutdownLatch,
}

impl Reactor {
    pub fn new() -> Self {
        Reactor {
            test_time: None,
            timers: Vec::new(),
            heap: BinaryHeap::new(),
            shutdown: ShutdownLatch::new(),
        }
    }

    pub fn new_for_test() -> Self {
        let mut r = Reactor::new();
        r.test_time = Some(0.0);
        r
    }

    pub fn shutdown_latch(&self) -> ShutdownLatch {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_tripped()
    }

    /// Seconds on the host monotonic clock.
    pub fn monotonic(&self) -> f64 {
        match self.test_time {
            Some(t) => t,
            None => monotonic(),
        }
    }

    /// Register a timer; it first fires at `waketime` (use `NEVER` to start
    /// parked).
    pub fn register_timer(&mut self, waketime: f64, callback: TimerCallback) -> TimerId {
        let id = self.timers.len();
        self.timers.push(TimerSlot {
            waketime,
            callback: Some(callback),
        });
        if waketime < NEVER {
            self.heap.push(HeapEntry { waketime, id });
        }
        id
    }

    /// Move a timer's next firing to `waketime`.
    pub fn update_timer(&mut self, id: TimerId, waketime: f64) {
        if let Some(slot) = self.timers.get_mut(id) {
            slot.waketime = waketime;
            if waketime < NEVER {
                self.heap.push(HeapEntry { waketime, id });
            }
        }
    }

    pub fn unregister_timer(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.get_mut(id) {
            slot.waketime = NEVER;
            slot.callback = None;
        }
    }

    fn next_deadline(&mut self) -> Option<f64> {
        // Drop stale heap entries left behind by update/unregister.
        while let Some(top) = self.heap.peek() {
            let slot = &self.timers[top.id];
            if slot.callback.is_some() && slot.waketime == top.waketime {
                return Some(top.waketime);
            }
            self.heap.pop();
        }
        None
    }

    /// Run every timer due at `eventtime`. Returns the next pending
    /// deadline.
    fn check_timers(&mut self, eventtime: f64) -> Option<f64> {
        loop {
            match self.next_deadline() {
                Some(wt) if wt <= eventtime => {}
                other => return other,
            }
            let id = match self.heap.pop() {
                Some(entry) => entry.id,
                None => return None,
            };
            // Take the callback out so it can borrow the reactor.
            let mut cb = match self.timers[id].callback.take() {
                Some(cb) => cb,
                None => continue,
            };
            let next = cb(self, eventtime);
            let slot = &mut self.timers[id];
            if slot.callback.is_none() {
                slot.callback = Some(cb);
                slot.waketime = next;
                if next < NEVER {
                    self.heap.push(HeapEntry { waketime: next, id });
                }
            }
        }
    }

    /// Block until `waketime`, still dispatching due timers. In test mode
    /// the clock jumps instead of sleeping.
    pub fn pause(&mut self, waketime: f64) {
        loop {
            let now = self.monotonic();
            if now >= waketime || self.is_shutdown() {
                return;
            }
            let next = self.check_timers(now).unwrap_or(NEVER).min(waketime);
            let now = self.monotonic();
            if next <= now {
                continue;
            }
            match self.test_time {
                Some(_) => self.test_time = Some(next),
                None => {
                    let dt = (next - now).min(waketime - now);
                    if dt > MIN_SLEEP {
                        std::thread::sleep(Duration::from_secs_f64(dt));
                    }
                }
            }
        }
    }

    /// Event loop: dispatch timers until the shutdown latch trips.
    pub fn run(&mut self) {
        debug!("reactor: entering main loop");
        while !self.is_shutdown() {
            let now = self.monotonic();
            let next = self.check_timers(now).unwrap_or(now + 1.0);
            let now = self.monotonic();
            if next > now {
                match self.test_time {
                    Some(_) => self.test_time = Some(next),
                    None => {
                        let dt = (next - now).min(1.0);
                        if dt > MIN_SLEEP {
                            std::thread::sleep(Duration::from_secs_f64(dt));
                        }
                    }
                }
            }
        }
        debug!("reactor: main loop exited");
    }

    /// Test hook: advance the pinned clock.
    pub fn advance_for_test(&mut self, dt: f64) {
        if let Some(t) = self.test_time {
            self.test_time = Some(t + dt);
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timer_fires_in_order() {
        let mut r = Reactor::new_for_test();
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (i, wt) in [(0usize, 0.3), (1, 0.1), (2, 0.2)] {
            let fired = fired.clone();
            r.register_timer(
                wt,
                Box::new(move |_r, _t| {
                    fired.lock().push(i);
                    NEVER
                }),
            );
        }
        r.pause(0.5);
        assert_eq!(*fired.lock(), vec![1, 2, 0]);
    }

    #[test]
    fn periodic_timer_reschedules() {
        let mut r = Reactor::new_for_test();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        r.register_timer(
            0.1,
            Box::new(move |_r, t| {
                c.fetch_add(1, AtomicOrdering::SeqCst);
                t + 0.1
            }),
        );
        r.pause(0.45);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 4);
    }

    #[test]
    fn update_timer_moves_deadline() {
        let mut r = Reactor::new_for_test();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = r.register_timer(
            NEVER,
            Box::new(move |_r, _t| {
                c.fetch_add(1, AtomicOrdering::SeqCst);
                NEVER
            }),
        );
        r.pause(0.2);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        r.update_timer(id, 0.3);
        r.pause(0.4);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn unregistered_timer_never_fires() {
        let mut r = Reactor::new_for_test();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = r.register_timer(
            0.1,
            Box::new(move |_r, _t| {
                c.fetch_add(1, AtomicOrdering::SeqCst);
                NEVER
            }),
        );
        r.unregister_timer(id);
        r.pause(0.2);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn shutdown_latch_stops_run() {
        let mut r = Reactor::new_for_test();
        let latch = r.shutdown_latch();
        r.register_timer(
            0.1,
            Box::new(move |r, _t| {
                r.shutdown.trip();
                NEVER
            }),
        );
        r.run();
        assert!(latch.is_tripped());
    }
}
