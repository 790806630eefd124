// src/stepcompress.rs
// Converts a stepper's ideal step times into compact (interval, count, add)
// triples. A triple encodes `count` steps whose inter-step intervals form an
// arithmetic progression; the MCU reconstructs step k at the cumulative time
// `sum_{i<k}(interval + i*add)` after the previous committed step.
//
// Each queued step constrains the reconstruction to land no later than its
// ideal clock and no earlier than the ideal clock minus the tolerance (which
// is additionally capped at half the local step interval, so a reconstructed
// step can never cross its neighbor's midpoint). The fitter maximizes the
// step count per triple; the `add` term is located by bisection and the
// final interval is taken at the midpoint of the surviving feasible range.

use std::collections::VecDeque;

use log::debug;

use crate::error::StepError;

/// Largest relative clock offset handled by the compression window. Steps
/// further out are emitted as single-step moves.
const CLOCK_DIFF_MAX: u64 = 3 << 28;

/// Hard cap on steps per triple (wire format limit of the count field).
const COUNT_MAX: usize = 65535;

/// A run long enough that no further `add` refinement is worth the search.
const LONG_RUN: usize = 0x200;

/// One compressed run of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMove {
    pub interval: u32,
    pub count: u16,
    pub add: i16,
}

impl StepMove {
    /// Total ticks covered by the run.
    pub fn span(&self) -> i64 {
        let count = self.count as i64;
        self.interval as i64 * count + self.add as i64 * count * (count - 1) / 2
    }

    /// Absolute reconstructed step clocks given the clock of the previous
    /// committed step.
    pub fn expand(&self, last_clock: u64) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut clock = last_clock as i64;
        let mut interval = self.interval as i64;
        for _ in 0..self.count {
            clock += interval;
            interval += self.add as i64;
            out.push(clock as u64);
        }
        out
    }
}

/// Ordered per-stepper output: step runs interleaved with direction flips
/// and clock re-anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepperMsg {
    Steps { first_clock: u64, last_clock: u64, mv: StepMove },
    SetDir { clock: u64, dir: bool },
    ResetClock { clock: u64 },
}

impl StepperMsg {
    pub fn req_clock(&self) -> u64 {
        match self {
            StepperMsg::Steps { last_clock, .. } => *last_clock,
            StepperMsg::SetDir { clock, .. } => *clock,
            StepperMsg::ResetClock { clock } => *clock,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Points {
    minp: i64,
    maxp: i64,
}

#[derive(Debug, Clone, Copy)]
struct Fit {
    count: usize,
    add: i64,
    lo: i64,
    hi: i64,
}

impl Fit {
    fn reach(&self) -> i64 {
        self.add * addfactor(self.count as i64) + self.hi * self.count as i64
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b) + i64::from(a.rem_euclid(b) != 0)
}

fn floor_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

fn addfactor(count: i64) -> i64 {
    count * (count - 1) / 2
}

pub struct StepCompress {
    name: String,
    max_error: u32,
    mcu_time_offset: f64,
    mcu_freq: f64,
    /// Absolute ideal clocks of steps not yet compressed.
    queue: VecDeque<u64>,
    /// Clock of the last step committed to a triple.
    last_step_clock: u64,
    /// Compressed output awaiting dispatch.
    ready: VecDeque<StepperMsg>,
    ready_capacity: usize,
}

impl StepCompress {
    pub fn new(name: &str, max_error: u32, ready_capacity: usize) -> Self {
        StepCompress {
            name: name.to_string(),
            max_error,
            mcu_time_offset: 0.0,
            mcu_freq: 1.0,
            queue: VecDeque::new(),
            last_step_clock: 0,
            ready: VecDeque::new(),
            ready_capacity,
        }
    }

    /// Refresh the host-time to MCU-clock mapping before a flush pass.
    pub fn set_time(&mut self, mcu_time_offset: f64, mcu_freq: f64) {
        self.mcu_time_offset = mcu_time_offset;
        self.mcu_freq = mcu_freq;
    }

    /// Re-anchor the step clock base. The matching `reset_step_clock`
    /// command rides the ready queue so it stays ordered with the steps.
    pub fn reset_clock(&mut self, clock: u64) {
        self.queue.clear();
        self.last_step_clock = clock;
        self.ready.push_back(StepperMsg::ResetClock { clock });
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        let ticks = (print_time - self.mcu_time_offset) * self.mcu_freq;
        if ticks <= 0.0 {
            0
        } else {
            ticks.round() as u64
        }
    }

    /// Queue one ideal step time (in print time seconds).
    pub fn append(&mut self, print_time: f64) -> Result<(), StepError> {
        let clock = self.print_time_to_clock(print_time);
        let last = self.queue.back().copied().unwrap_or(self.last_step_clock);
        if clock <= last {
            return Err(StepError::StepOrderViolation {
                stepper: self.name.clone(),
                clock,
                last_clock: last,
            });
        }
        if self.ready.len() >= self.ready_capacity {
            return Err(StepError::Backpressure(self.name.clone()));
        }
        self.queue.push_back(clock);
        Ok(())
    }

    /// Record a direction flip; effective before the next queued step. All
    /// previously queued steps are compressed first so the flip stays
    /// ordered within the output stream.
    pub fn set_next_step_dir(&mut self, dir: bool) -> Result<(), StepError> {
        self.flush(u64::MAX)?;
        self.ready.push_back(StepperMsg::SetDir {
            clock: self.last_step_clock,
            dir,
        });
        Ok(())
    }

    /// Compress every queued step whose clock is at or below `move_clock`.
    /// Steps beyond the window stay queued and may still be repriced.
    pub fn flush(&mut self, move_clock: u64) -> Result<(), StepError> {
        let mut window = self
            .queue
            .iter()
            .take_while(|&&clock| clock <= move_clock)
            .count();
        while window > 0 {
            let first = self.queue[0];
            let gap = first - self.last_step_clock;
            let mv = if gap >= CLOCK_DIFF_MAX {
                if gap > u32::MAX as u64 {
                    return Err(StepError::FarFutureStep {
                        stepper: self.name.clone(),
                        gap,
                    });
                }
                StepMove { interval: gap as u32, count: 1, add: 0 }
            } else {
                self.compress_bisect_add(window)
            };
            let first_clock = self.last_step_clock + mv.interval as u64;
            self.queue.drain(..mv.count as usize);
            window -= mv.count as usize;
            self.last_step_clock += mv.span() as u64;
            self.ready.push_back(StepperMsg::Steps {
                first_clock,
                last_clock: self.last_step_clock,
                mv,
            });
        }
        Ok(())
    }

    /// Put taken-but-undelivered output back at the queue head (the
    /// dispatch path hit backpressure).
    pub fn requeue_ready(&mut self, msgs: Vec<StepperMsg>) {
        for msg in msgs.into_iter().rev() {
            self.ready.push_front(msg);
        }
    }

    /// Take dispatch-ready output whose required clock is at or below
    /// `limit_clock`, in order.
    pub fn take_ready(&mut self, limit_clock: u64) -> Vec<StepperMsg> {
        let mut out = Vec::new();
        while let Some(front) = self.ready.front() {
            if front.req_clock() > limit_clock {
                break;
            }
            if let Some(msg) = self.ready.pop_front() {
                out.push(msg);
            }
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.queue.len() + self.ready.len()
    }

    /// Acceptable cumulative-clock window for the queued step at `idx`,
    /// relative to `last_step_clock`. The reconstruction may be early by at
    /// most the tolerance (further capped at half the local interval), and
    /// never late.
    fn minmax_point(&self, idx: usize) -> Points {
        let point = (self.queue[idx] - self.last_step_clock) as i64;
        let prev = if idx > 0 {
            (self.queue[idx - 1] - self.last_step_clock) as i64
        } else {
            0
        };
        let max_error = ((point - prev) / 2).min(self.max_error as i64);
        Points {
            minp: point - max_error,
            maxp: point,
        }
    }

    /// Longest valid run for a fixed `add`: intersect the per-step interval
    /// windows until empty. Returns the fit plus the constraint window of
    /// the first failing point, used to steer the add bisection.
    fn fit_sequence(&self, add: i64, qlen: usize) -> (Fit, Option<Points>) {
        let p0 = self.minmax_point(0);
        let mut lo = p0.minp;
        let mut hi = p0.maxp;
        let mut valid_lo = lo;
        let mut valid_hi = hi;
        let mut count = 1usize;
        loop {
            let nextcount = count + 1;
            if nextcount > qlen {
                return (Fit { count, add, lo: valid_lo, hi: valid_hi }, None);
            }
            let np = self.minmax_point(nextcount - 1);
            let n = nextcount as i64;
            let c = add * addfactor(n);
            if lo * n < np.minp - c {
                lo = ceil_div(np.minp - c, n);
            }
            if np.maxp - c < hi * n {
                hi = floor_div(np.maxp - c, n);
            }
            if lo > hi {
                return (Fit { count, add, lo: valid_lo, hi: valid_hi }, Some(np));
            }
            valid_lo = lo;
            valid_hi = hi;
            count = nextcount;
        }
    }

    /// Search `add` values by bisection for the longest run, preferring
    /// add = 0 whenever it is nearly as long.
    fn compress_bisect_add(&self, window: usize) -> StepMove {
        let qlen = window.min(COUNT_MAX);
        let p0 = self.minmax_point(0);
        let mut minadd: i64 = i16::MIN as i64;
        let mut maxadd: i64 = i16::MAX as i64;
        let mut add: i64 = 0;
        let mut best: Option<Fit> = None;
        let mut zero: Option<Fit> = None;

        loop {
            let (fit, failure) = self.fit_sequence(add, qlen);
            let improved = best.map_or(true, |b| {
                fit.reach() > b.reach() || (fit.reach() == b.reach() && fit.hi > b.hi)
            });
            if improved {
                best = Some(fit);
            }
            if add == 0 {
                zero = Some(fit);
            }
            let np = match failure {
                // The whole window fits; no longer run exists.
                None => break,
                Some(_) if improved && fit.count > LONG_RUN => break,
                Some(np) => np,
            };
            // Steer: if the progression falls short of the failing point's
            // window, only a larger add can reach it; if it overshoots,
            // only a smaller one.
            let nextcount = fit.count as i64 + 1;
            let nextaf = addfactor(nextcount);
            let nextreach = add * nextaf + fit.hi * nextcount;
            if nextreach < np.minp {
                minadd = add + 1;
            } else {
                maxadd = add - 1;
            }
            // The failing point also bounds the add range outright: the
            // first step's interval window [p0.minp, p0.maxp] limits how
            // much of the reach the interval term can contribute.
            if nextaf > 0 {
                let c = p0.maxp * nextcount;
                if minadd * nextaf < np.minp - c {
                    minadd = ceil_div(np.minp - c, nextaf);
                }
                let c = p0.minp * nextcount;
                if np.maxp - c < maxadd * nextaf {
                    maxadd = floor_div(np.maxp - c, nextaf);
                }
            }
            if minadd > maxadd {
                break;
            }
            add = maxadd - (maxadd - minadd) / 2;
        }

        let fallback = Fit { count: 1, add: 0, lo: p0.minp, hi: p0.maxp };
        let best = best.unwrap_or(fallback);
        let zero = zero.unwrap_or(fallback);
        let chosen = if best.count < zero.count + zero.count / 16
            || (best.count == zero.count && best.add != 0)
        {
            zero
        } else {
            best
        };

        // Centroid of the surviving feasible interval range.
        let interval = (chosen.lo + chosen.hi) / 2;
        debug!(
            "stepcompress {}: emit interval={} count={} add={}",
            self.name, interval, chosen.count, chosen.add
        );
        StepMove {
            interval: interval as u32,
            count: chosen.count as u16,
            add: chosen.add as i16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: f64 = 16_000_000.0;

    fn compressor() -> StepCompress {
        // 25us tolerance at 16MHz = 400 ticks.
        let mut sc = StepCompress::new("stepper_x", 400, 1 << 16);
        sc.set_time(0.0, FREQ);
        sc
    }

    fn reconstruct(msgs: &[StepperMsg], mut last_clock: u64) -> Vec<u64> {
        let mut out = Vec::new();
        for msg in msgs {
            if let StepperMsg::Steps { mv, .. } = msg {
                let clocks = mv.expand(last_clock);
                last_clock = *clocks.last().unwrap();
                out.extend(clocks);
            }
        }
        out
    }

    // A uniform step rate compresses to exactly one triple.
    #[test]
    fn uniform_rate_single_triple() {
        let mut sc = compressor();
        let dt = 250e-6;
        for k in 1..=1000u32 {
            sc.append(k as f64 * dt).unwrap();
        }
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            StepperMsg::Steps { mv, .. } => {
                assert_eq!(mv.count, 1000);
                assert_eq!(mv.add, 0);
                assert_eq!(mv.interval, (dt * FREQ).round() as u32);
            }
            other => panic!("unexpected msg {other:?}"),
        }
    }

    // A sqrt acceleration profile compresses to a small number of triples
    // with every reconstructed time within tolerance (here the default:
    // half the minimum step interval of the profile).
    #[test]
    fn sqrt_profile_compresses() {
        let accel = 1000.0;
        let times: Vec<f64> = (1..=10_000u32)
            .map(|k| (2.0 * k as f64 / accel).sqrt())
            .collect();
        let min_interval = times
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min);
        let tolerance = (0.5 * min_interval * FREQ) as u32;

        let mut sc = StepCompress::new("stepper_x", tolerance, 1 << 16);
        sc.set_time(0.0, FREQ);
        let ideal: Vec<u64> = times
            .iter()
            .map(|&t| {
                sc.append(t).unwrap();
                (t * FREQ).round() as u64
            })
            .collect();
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        let triples = msgs
            .iter()
            .filter(|m| matches!(m, StepperMsg::Steps { .. }))
            .count();
        assert!(triples <= 32, "needed {triples} triples for 10k steps");

        let rebuilt = reconstruct(&msgs, 0);
        assert_eq!(rebuilt.len(), ideal.len());
        let mut prev = 0u64;
        for (got, want) in rebuilt.iter().zip(ideal.iter()) {
            assert!(*got > prev, "non-monotonic reconstruction");
            prev = *got;
            assert!(*got <= *want, "reconstructed step late: {got} > {want}");
            assert!(
                want - got <= tolerance as u64,
                "reconstructed step early by {} ticks",
                want - got
            );
        }
    }

    #[test]
    fn exact_arithmetic_progression_fits_one_triple() {
        let mut sc = compressor();
        // Intervals growing linearly: 1600 + 32k ticks.
        let mut t = 0.0;
        for k in 0..500u32 {
            t += 100e-6 + k as f64 * 2e-6;
            sc.append(t).unwrap();
        }
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            StepperMsg::Steps { mv, .. } => {
                assert_eq!(mv.count, 500);
                assert_eq!(mv.add, 32);
            }
            other => panic!("unexpected msg {other:?}"),
        }
    }

    #[test]
    fn non_monotonic_append_is_rejected() {
        let mut sc = compressor();
        sc.append(0.001).unwrap();
        let err = sc.append(0.001).unwrap_err();
        assert!(matches!(err, StepError::StepOrderViolation { .. }));
        let err = sc.append(0.0005).unwrap_err();
        assert!(matches!(err, StepError::StepOrderViolation { .. }));
    }

    #[test]
    fn flush_respects_move_clock() {
        let mut sc = compressor();
        for k in 1..=100u32 {
            sc.append(k as f64 * 0.001).unwrap();
        }
        // Flush only the first half (50ms -> 800k ticks).
        sc.flush((0.050 * FREQ) as u64).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        let total: usize = msgs
            .iter()
            .map(|m| match m {
                StepperMsg::Steps { mv, .. } => mv.count as usize,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 50);
        assert_eq!(sc.pending(), 50);
    }

    #[test]
    fn dir_change_is_ordered_between_runs() {
        let mut sc = compressor();
        for k in 1..=10u32 {
            sc.append(k as f64 * 0.001).unwrap();
        }
        sc.set_next_step_dir(false).unwrap();
        for k in 11..=20u32 {
            sc.append(k as f64 * 0.001).unwrap();
        }
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], StepperMsg::Steps { .. }));
        assert!(matches!(msgs[1], StepperMsg::SetDir { dir: false, .. }));
        assert!(matches!(msgs[2], StepperMsg::Steps { .. }));
        assert!(msgs[0].req_clock() <= msgs[1].req_clock());
        assert!(msgs[1].req_clock() <= msgs[2].req_clock());
    }

    #[test]
    fn far_future_step_is_isolated() {
        let mut sc = compressor();
        sc.append(0.001).unwrap();
        // 60 seconds of idle, then another step.
        sc.append(60.0).unwrap();
        sc.append(60.001).unwrap();
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        let counts: Vec<u16> = msgs
            .iter()
            .filter_map(|m| match m {
                StepperMsg::Steps { mv, .. } => Some(mv.count),
                _ => None,
            })
            .collect();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[1], 1); // the far step rides alone
        let rebuilt = reconstruct(&msgs, 0);
        assert_eq!(rebuilt[1], (60.0 * FREQ) as u64);
    }

    #[test]
    fn reconstruction_is_never_late_and_within_tolerance() {
        // Mixed profile: accelerate, cruise, decelerate.
        let mut sc = compressor();
        let mut ideal = Vec::new();
        let mut t: f64 = 0.0;
        for k in 0..300u32 {
            let dt = if k < 100 {
                500e-6 - k as f64 * 4e-6
            } else if k < 200 {
                100e-6
            } else {
                100e-6 + (k - 200) as f64 * 4e-6
            };
            t += dt;
            sc.append(t).unwrap();
            ideal.push((t * FREQ).round() as u64);
        }
        sc.flush(u64::MAX).unwrap();
        let msgs = sc.take_ready(u64::MAX);
        let rebuilt = reconstruct(&msgs, 0);
        assert_eq!(rebuilt.len(), ideal.len());
        let mut prev = 0u64;
        for (got, want) in rebuilt.iter().zip(ideal.iter()) {
            assert!(*got > prev);
            prev = *got;
            assert!(got <= want);
            assert!(want - got <= 400);
        }
    }

    #[test]
    fn take_ready_respects_limit() {
        let mut sc = compressor();
        for k in 1..=10u32 {
            sc.append(k as f64 * 0.1).unwrap();
        }
        sc.flush(u64::MAX).unwrap();
        let limit = (0.35 * FREQ) as u64;
        let early = sc.take_ready(limit);
        assert!(!early.is_empty());
        assert!(early.iter().all(|m| m.req_clock() <= limit));
        let rest = sc.take_ready(u64::MAX);
        assert!(!rest.is_empty());
        assert!(rest[0].req_clock() > limit);
    }

    #[test]
    fn backpressure_when_ready_queue_full() {
        let mut sc = StepCompress::new("stepper_y", 400, 2);
        sc.set_time(0.0, FREQ);
        sc.append(0.1).unwrap();
        sc.flush(u64::MAX).unwrap();
        sc.append(60.0).unwrap();
        sc.flush(u64::MAX).unwrap();
        // Two ready messages queued; further appends backpressure.
        let err = sc.append(120.5).unwrap_err();
        assert!(matches!(err, StepError::Backpressure(_)));
    }
}
