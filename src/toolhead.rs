// src/toolhead.rs
// Motion planner: accepts ordered move requests, applies speed and
// acceleration limits, and finalizes junction speeds through the look-ahead
// queue. Moves are mutable only while queued; a flush freezes them and hands
// them to the trapezoid queue for step generation.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::configfile::Configfile;
use crate::error::{HostError, MotionError};
use crate::kinematics::Kinematics;
use crate::trapq::{Coord, TrapQ};

/// Queue flush threshold: accumulated minimum move time before a lazy flush
/// is attempted.
const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

const BUFFER_TIME_START: f64 = 0.250;
const MIN_KIN_TIME: f64 = 0.100;
const MOVE_BATCH_TIME: f64 = 0.500;
const STEPCOMPRESS_FLUSH_TIME: f64 = 0.050;

/// Relative tolerance for treating two candidate cruise speeds as equal.
const CRUISE_TIE_REL: f64 = 1e-9;

/// Effectively-unbounded acceleration used for auxiliary-axis-only moves.
const AUX_MOVE_ACCEL: f64 = 99_999_999.9;

/// Downstream consumer of finalized motion: converts trapezoid segments into
/// steps and forwards them to the MCU sessions. The kinematics handle is
/// borrowed from the toolhead for the duration of each flush.
pub trait MotionFlush: Send {
    /// Best estimate of the MCU print time corresponding to `host_time`.
    fn estimated_print_time(&self, host_time: f64) -> f64;
    /// Generate and dispatch steps for everything up to `step_gen_time`;
    /// segments ending before `free_time` may be released.
    fn flush(&mut self, kin: &dyn Kinematics, step_gen_time: f64, free_time: f64)
        -> Result<(), HostError>;
}

/// A planned segment in tool space. Junction fields hold squared speeds;
/// `set_junction` resolves them into the trapezoid profile.
#[derive(Debug, Clone)]
pub struct Move {
    pub start_pos: [f64; 4],
    pub end_pos: [f64; 4],
    pub accel: f64,
    pub junction_deviation: f64,
    pub is_kinematic_move: bool,
    pub axes_d: [f64; 4],
    pub move_d: f64,
    pub axes_r: [f64; 4],
    pub min_move_t: f64,

    pub max_start_v2: f64,
    pub max_cruise_v2: f64,
    pub delta_v2: f64,
    pub max_smoothed_v2: f64,
    pub smooth_delta_v2: f64,

    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
}

impl Move {
    pub fn new(
        max_accel: f64,
        junction_deviation: f64,
        max_velocity: f64,
        max_accel_to_decel: f64,
        start_pos: [f64; 4],
        end_pos: [f64; 4],
        speed: f64,
    ) -> Result<Self, MotionError> {
        if end_pos.iter().any(|v| !v.is_finite()) || !speed.is_finite() {
            return Err(MotionError::InvalidMove(format!(
                "non-finite move request to {end_pos:?} at {speed}"
            )));
        }
        if speed < 0.0 {
            return Err(MotionError::InvalidMove(format!("negative speed {speed}")));
        }

        let axes_d = [
            end_pos[0] - start_pos[0],
            end_pos[1] - start_pos[1],
            end_pos[2] - start_pos[2],
            end_pos[3] - start_pos[3],
        ];
        let mut move_d = (axes_d[0].powi(2) + axes_d[1].powi(2) + axes_d[2].powi(2)).sqrt();
        let mut is_kinematic_move = true;
        let mut accel = max_accel;
        let mut velocity = speed.min(max_velocity);
        let mut end_pos = end_pos;
        let mut effective_axes_d = axes_d;

        if move_d < 1e-9 {
            // Auxiliary-axis-only move; the toolhead does not travel.
            end_pos = [start_pos[0], start_pos[1], start_pos[2], end_pos[3]];
            effective_axes_d[0] = 0.0;
            effective_axes_d[1] = 0.0;
            effective_axes_d[2] = 0.0;
            move_d = effective_axes_d[3].abs();
            accel = AUX_MOVE_ACCEL;
            velocity = speed;
            is_kinematic_move = false;
        }
        if move_d > 0.0 && velocity == 0.0 {
            return Err(MotionError::InvalidMove(format!(
                "zero speed for {move_d:.3}mm move"
            )));
        }

        let inv_move_d = if move_d == 0.0 { 0.0 } else { 1.0 / move_d };
        let axes_r = [
            effective_axes_d[0] * inv_move_d,
            effective_axes_d[1] * inv_move_d,
            effective_axes_d[2] * inv_move_d,
            effective_axes_d[3] * inv_move_d,
        ];
        let min_move_t = if velocity == 0.0 { 0.0 } else { move_d / velocity };

        Ok(Move {
            start_pos,
            end_pos,
            accel,
            junction_deviation,
            is_kinematic_move,
            axes_d,
            move_d,
            axes_r,
            min_move_t,
            max_start_v2: 0.0,
            max_cruise_v2: velocity.powi(2),
            delta_v2: 2.0 * move_d * accel,
            max_smoothed_v2: 0.0,
            smooth_delta_v2: 2.0 * move_d * max_accel_to_decel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
        })
    }

    /// Kinematics clamp: lower the cruise speed and/or acceleration.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed.powi(2);
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
            self.min_move_t = if speed == 0.0 { 0.0 } else { self.move_d / speed };
        }
        self.accel = self.accel.min(accel);
        self.delta_v2 = 2.0 * self.move_d * self.accel;
        self.smooth_delta_v2 = self.smooth_delta_v2.min(self.delta_v2);
    }

    /// Junction-deviation cornering bound against the previous move.
    pub fn calc_junction(&mut self, prev: &Move) {
        if !self.is_kinematic_move || !prev.is_kinematic_move {
            return;
        }
        let mut max_start_v2 = self
            .max_cruise_v2
            .min(prev.max_cruise_v2)
            .min(prev.max_start_v2 + prev.delta_v2);

        // Angle between the moves; cos(theta) of the direction reversal.
        let junction_cos_theta = -(self.axes_r[0] * prev.axes_r[0]
            + self.axes_r[1] * prev.axes_r[1]
            + self.axes_r[2] * prev.axes_r[2]);
        let junction_cos_theta = junction_cos_theta.clamp(-1.0, 1.0);

        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt().max(0.0);
        let cos_theta_d2 = (0.5 * (1.0 + junction_cos_theta)).sqrt().max(0.0);
        let one_minus_sin = 1.0 - sin_theta_d2;

        if one_minus_sin > 1e-9 && cos_theta_d2 > 1e-9 {
            let r_jd = sin_theta_d2 / one_minus_sin;
            let move_jd_v2 = r_jd * self.junction_deviation * self.accel;
            let pmove_jd_v2 = r_jd * prev.junction_deviation * prev.accel;

            let quarter_tan_theta_d2 = 0.25 * sin_theta_d2 / cos_theta_d2;
            let move_centripetal_v2 = self.delta_v2 * quarter_tan_theta_d2;
            let pmove_centripetal_v2 = prev.delta_v2 * quarter_tan_theta_d2;

            max_start_v2 = max_start_v2
                .min(move_jd_v2)
                .min(pmove_jd_v2)
                .min(move_centripetal_v2)
                .min(pmove_centripetal_v2);
        }

        self.max_start_v2 = max_start_v2;
        self.max_smoothed_v2 = max_start_v2.min(prev.max_smoothed_v2 + prev.smooth_delta_v2);
    }

    /// Resolve the trapezoid from squared start/cruise/end speeds.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        let half_inv_accel = if self.accel == 0.0 { 0.0 } else { 0.5 / self.accel };
        let accel_d = (cruise_v2 - start_v2) * half_inv_accel;
        let decel_d = (cruise_v2 - end_v2) * half_inv_accel;
        let cruise_d = self.move_d - accel_d - decel_d;

        self.start_v = start_v2.max(0.0).sqrt();
        self.cruise_v = cruise_v2.max(0.0).sqrt();
        self.end_v = end_v2.max(0.0).sqrt();

        self.accel_t = if self.start_v + self.cruise_v == 0.0 {
            0.0
        } else {
            accel_d / ((self.start_v + self.cruise_v) * 0.5)
        };
        self.cruise_t = if self.cruise_v == 0.0 { 0.0 } else { cruise_d / self.cruise_v };
        self.decel_t = if self.end_v + self.cruise_v == 0.0 {
            0.0
        } else {
            decel_d / ((self.end_v + self.cruise_v) * 0.5)
        };
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }
}

/// Candidate cruise speeds equal within tolerance are a tie; keep the
/// faster one.
fn pick_cruise_v2(a: f64, b: f64) -> f64 {
    if (a - b).abs() <= CRUISE_TIE_REL * a.max(b) {
        a.max(b)
    } else {
        a.min(b)
    }
}

/// Pending moves awaiting junction finalization. The backward pass is a
/// fixed point: re-running it never changes an already-flushable move.
pub struct LookAheadQueue {
    pub queue: Vec<Move>,
    junction_flush: f64,
}

impl LookAheadQueue {
    pub fn new() -> Self {
        LookAheadQueue {
            queue: Vec::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    /// Returns true when the queue has accumulated enough buffered time that
    /// the caller should attempt a lazy flush.
    pub fn add_move(&mut self, mut mv: Move) -> bool {
        if let Some(prev) = self.queue.last() {
            mv.calc_junction(prev);
        }
        self.junction_flush -= mv.min_move_t;
        self.queue.push(mv);
        self.junction_flush <= 0.0
    }

    /// Junction optimization over the pending queue, newest to oldest.
    /// With `lazy` set, only moves whose profile can no longer change are
    /// returned; otherwise the whole queue is finalized against a full stop.
    pub fn flush(&mut self, lazy: bool) -> Vec<Move> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let mut update_flush_count = lazy;
        let mut flush_count = self.queue.len();
        if flush_count == 0 {
            return Vec::new();
        }

        // Delayed entries: (index, start_v2, next_end_v2) for moves whose
        // cruise speed depends on a peak not yet seen by the backward pass.
        let mut delayed: Vec<(usize, f64, f64)> = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;

        for i in (0..self.queue.len()).rev() {
            let (delta_v2, max_start_v2, smooth_delta_v2, max_smoothed_v2, max_cruise_v2) = {
                let m = &self.queue[i];
                (
                    m.delta_v2,
                    m.max_start_v2,
                    m.smooth_delta_v2,
                    m.max_smoothed_v2,
                    m.max_cruise_v2,
                )
            };
            let reachable_start_v2 = next_end_v2 + delta_v2;
            let start_v2 = max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + smooth_delta_v2;
            let smoothed_v2 = max_smoothed_v2.min(reachable_smoothed_v2);

            if smoothed_v2 < reachable_smoothed_v2 {
                // This move can fully decelerate; a peak cruise point lies
                // at or after it.
                if smoothed_v2 + smooth_delta_v2 > next_smoothed_v2 || !delayed.is_empty() {
                    if update_flush_count && peak_cruise_v2 > 0.0 {
                        flush_count = i;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 =
                        pick_cruise_v2(max_cruise_v2, (smoothed_v2 + reachable_smoothed_v2) * 0.5);
                    if !delayed.is_empty() {
                        if !update_flush_count && i < flush_count {
                            let mut mc_v2 = peak_cruise_v2;
                            for &(idx, ms_v2, me_v2) in delayed.iter().rev() {
                                mc_v2 = mc_v2.min(ms_v2);
                                self.queue[idx].set_junction(
                                    ms_v2.min(mc_v2),
                                    mc_v2,
                                    me_v2.min(mc_v2),
                                );
                            }
                        }
                        delayed.clear();
                    }
                }
                if !update_flush_count && i < flush_count {
                    let cruise_v2 = pick_cruise_v2(
                        pick_cruise_v2((start_v2 + reachable_start_v2) * 0.5, max_cruise_v2),
                        peak_cruise_v2,
                    );
                    self.queue[i].set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                delayed.push((i, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }

        if update_flush_count || flush_count == 0 {
            return Vec::new();
        }
        self.queue.drain(0..flush_count).collect()
    }
}

impl Default for LookAheadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Planner state; `Drained` latches after an out-of-bounds abort until an
/// operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    NeedPrime,
    Active,
    Drained,
}

pub struct Toolhead {
    pub lookahead: LookAheadQueue,
    pub commanded_pos: [f64; 4],
    pub kin: Box<dyn Kinematics>,
    trapq: Arc<Mutex<TrapQ>>,
    motion: Box<dyn MotionFlush>,

    pub max_velocity: f64,
    pub max_accel: f64,
    pub min_cruise_ratio: f64,
    pub square_corner_velocity: f64,
    pub junction_deviation: f64,
    pub max_accel_to_decel: f64,

    pub print_time: f64,
    state: QueueState,
    last_flush_time: f64,
    need_flush_time: f64,
    /// Extra settle time kept between step generation and segment release.
    kin_flush_delay: f64,
}

impl Toolhead {
    pub fn new(
        config: &Configfile,
        kin: Box<dyn Kinematics>,
        trapq: Arc<Mutex<TrapQ>>,
        motion: Box<dyn MotionFlush>,
    ) -> Result<Self, HostError> {
        let cfg = |e: crate::configfile::ConfigError| HostError::Config(e.to_string());
        let max_velocity = config
            .getfloat("printer", "max_velocity", None, Some(0.0), None)
            .map_err(cfg)?;
        let max_accel = config
            .getfloat("printer", "max_accel", None, Some(0.0), None)
            .map_err(cfg)?;
        let min_cruise_ratio = config
            .getfloat("printer", "minimum_cruise_ratio", Some(0.5), Some(0.0), Some(1.0))
            .map_err(cfg)?;
        let square_corner_velocity = config
            .getfloat("printer", "square_corner_velocity", Some(5.0), Some(0.0), None)
            .map_err(cfg)?;

        let mut toolhead = Toolhead {
            lookahead: LookAheadQueue::new(),
            commanded_pos: [0.0; 4],
            kin,
            trapq,
            motion,
            max_velocity,
            max_accel,
            min_cruise_ratio,
            square_corner_velocity,
            junction_deviation: 0.0,
            max_accel_to_decel: 0.0,
            print_time: 0.0,
            state: QueueState::NeedPrime,
            last_flush_time: 0.0,
            need_flush_time: 0.0,
            kin_flush_delay: STEPCOMPRESS_FLUSH_TIME,
        };
        toolhead.calc_junction_deviation();
        Ok(toolhead)
    }

    fn calc_junction_deviation(&mut self) {
        let scv2 = self.square_corner_velocity.powi(2);
        self.junction_deviation = if self.max_accel == 0.0 {
            0.0
        } else {
            scv2 * (2.0_f64.sqrt() - 1.0) / self.max_accel
        };
        self.max_accel_to_decel = self.max_accel * (1.0 - self.min_cruise_ratio);
    }

    pub fn get_position(&self) -> [f64; 4] {
        self.commanded_pos
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Operator reset after a drain; re-primes the queue at `pos`.
    pub fn reset_from_drained(&mut self, pos: [f64; 4]) {
        self.lookahead.reset();
        self.commanded_pos = pos;
        self.state = QueueState::NeedPrime;
        info!("toolhead: reset from drained state at {pos:?}");
    }

    pub fn set_position(&mut self, host_time: f64, pos: [f64; 4]) -> Result<(), HostError> {
        self.flush_lookahead(host_time)?;
        self.commanded_pos = pos;
        self.trapq
            .lock()
            .set_position(self.print_time, Coord::new(pos[0], pos[1], pos[2]));
        Ok(())
    }

    /// Enqueue one move request. Invalid requests are rejected with the
    /// queue unchanged; an out-of-bounds report drains the queue and
    /// latches until reset.
    pub fn move_to(&mut self, host_time: f64, newpos: [f64; 4], speed: f64) -> Result<(), HostError> {
        if self.state == QueueState::Drained {
            return Err(MotionError::InvalidMove("toolhead drained; reset required".into()).into());
        }
        let mut mv = Move::new(
            self.max_accel,
            self.junction_deviation,
            self.max_velocity,
            self.max_accel_to_decel,
            self.commanded_pos,
            newpos,
            speed,
        )?;
        if mv.move_d == 0.0 {
            return Ok(());
        }
        if mv.is_kinematic_move {
            if let Err(e) = self.kin.check_move(&mut mv) {
                if matches!(e, MotionError::OutOfBounds(_)) {
                    warn!("toolhead: aborting print: {e}");
                    self.drain();
                }
                return Err(e.into());
            }
        }
        self.commanded_pos = mv.end_pos;
        let want_flush = self.lookahead.add_move(mv);
        if want_flush {
            self.process_lookahead(host_time, true)?;
        }
        Ok(())
    }

    /// Discard all pending motion. Used by the out-of-bounds abort path and
    /// by shutdown.
    pub fn drain(&mut self) {
        self.lookahead.reset();
        self.state = QueueState::Drained;
    }

    /// Force-finalize the queue (explicit flush request or full stop).
    pub fn flush_lookahead(&mut self, host_time: f64) -> Result<(), HostError> {
        self.process_lookahead(host_time, false)
    }

    /// Insert `delay` seconds of dwell after the last planned move.
    pub fn dwell(&mut self, host_time: f64, delay: f64) -> Result<(), HostError> {
        self.flush_lookahead(host_time)?;
        let next_print_time = self.print_time + delay.max(0.0);
        self.advance_move_time(next_print_time)
    }

    /// Flush and wait-equivalent: finalize everything and drain step
    /// generation out to the end of planned motion.
    pub fn wait_moves(&mut self, host_time: f64) -> Result<(), HostError> {
        self.flush_lookahead(host_time)?;
        self.flush_batches(self.need_flush_time)
    }

    /// Periodic flush entry point for the reactor timer. Besides the lazy
    /// look-ahead pass, this drains the tail of already-planned motion that
    /// the streaming path holds back.
    pub fn flush_handler(&mut self, host_time: f64) -> Result<(), HostError> {
        self.process_lookahead(host_time, true)?;
        if self.lookahead.queue.is_empty() && self.last_flush_time < self.need_flush_time {
            self.flush_batches(self.need_flush_time)?;
        }
        Ok(())
    }

    fn calc_print_time(&mut self, host_time: f64) {
        let est_print_time = self.motion.estimated_print_time(host_time);
        let kin_time = est_print_time + MIN_KIN_TIME + self.kin_flush_delay;
        let min_print_time = (est_print_time + BUFFER_TIME_START).max(kin_time);
        if min_print_time > self.print_time {
            self.print_time = min_print_time;
            debug!(
                "toolhead: print time resync to {:.4} (est {:.4})",
                self.print_time, est_print_time
            );
        }
    }

    fn process_lookahead(&mut self, host_time: f64, lazy: bool) -> Result<(), HostError> {
        let moves = self.lookahead.flush(lazy);
        if moves.is_empty() {
            return Ok(());
        }
        if self.state == QueueState::NeedPrime {
            self.state = QueueState::Active;
            self.calc_print_time(host_time);
        }
        let mut next_move_time = self.print_time;
        {
            let mut trapq = self.trapq.lock();
            for mv in &moves {
                if mv.is_kinematic_move {
                    trapq.append(
                        next_move_time,
                        mv.accel_t,
                        mv.cruise_t,
                        mv.decel_t,
                        Coord::new(mv.start_pos[0], mv.start_pos[1], mv.start_pos[2]),
                        Coord::new(mv.axes_r[0], mv.axes_r[1], mv.axes_r[2]),
                        mv.start_v,
                        mv.cruise_v,
                        mv.accel,
                    );
                }
                next_move_time += mv.total_time();
            }
        }
        self.need_flush_time = self.need_flush_time.max(next_move_time + self.kin_flush_delay);
        self.advance_move_time(next_move_time)
    }

    fn advance_move_time(&mut self, next_print_time: f64) -> Result<(), HostError> {
        let pt_delay = self.kin_flush_delay + STEPCOMPRESS_FLUSH_TIME;
        self.print_time = self.print_time.max(next_print_time);
        let want_flush_time = self.last_flush_time.max(self.print_time - pt_delay);
        self.flush_batches(want_flush_time)
    }

    /// Advance step generation in bounded batches up to `want_flush_time`.
    fn flush_batches(&mut self, want_flush_time: f64) -> Result<(), HostError> {
        let mut flush_time = self.last_flush_time;
        while flush_time < want_flush_time {
            flush_time = (flush_time + MOVE_BATCH_TIME).min(want_flush_time);
            let free_time = flush_time - self.kin_flush_delay;
            match self.motion.flush(self.kin.as_ref(), flush_time, free_time) {
                Ok(()) => {}
                Err(HostError::Step(crate::error::StepError::Backpressure(who))) => {
                    // Soft: hold the flush gate and retry on the next pass.
                    debug!("toolhead: backpressure from {who}, pausing flush");
                    break;
                }
                Err(e) => return Err(e),
            }
            self.trapq.lock().finalize_moves(free_time);
            self.last_flush_time = flush_time;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::cartesian::CartesianKinematics;
    use crate::kinematics::AxisLimits;
    use float_cmp::assert_approx_eq;

    const MAX_ACCEL: f64 = 3000.0;
    const JUNCTION_DEV: f64 = 0.013;
    const MAX_VEL: f64 = 500.0;
    const ACCEL_TO_DECEL: f64 = MAX_ACCEL / 2.0;

    fn mk_move(start: [f64; 4], end: [f64; 4], speed: f64) -> Move {
        Move::new(MAX_ACCEL, JUNCTION_DEV, MAX_VEL, ACCEL_TO_DECEL, start, end, speed).unwrap()
    }

    struct NullMotion;
    impl MotionFlush for NullMotion {
        fn estimated_print_time(&self, _host_time: f64) -> f64 {
            0.0
        }
        fn flush(
            &mut self,
            _kin: &dyn Kinematics,
            _step_gen_time: f64,
            _free_time: f64,
        ) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn test_toolhead() -> Toolhead {
        let mut config = Configfile::new();
        config.add_section("printer");
        config.set("printer", "max_velocity", "500");
        config.set("printer", "max_accel", "1000");
        config.set("printer", "square_corner_velocity", "5.0");
        let limits = vec![
            AxisLimits { min: 0.0, max: 300.0, max_accel: 1000.0 },
            AxisLimits { min: 0.0, max: 300.0, max_accel: 1000.0 },
            AxisLimits { min: 0.0, max: 300.0, max_accel: 100.0 },
        ];
        let kin = Box::new(CartesianKinematics::new(limits, 5.0, 100.0));
        Toolhead::new(
            &config,
            kin,
            Arc::new(Mutex::new(TrapQ::new())),
            Box::new(NullMotion),
        )
        .unwrap()
    }

    #[test]
    fn move_new_normal() {
        let m = mk_move([0.0; 4], [10.0, 0.0, 0.0, 0.0], 100.0);
        assert!(m.is_kinematic_move);
        assert_approx_eq!(f64, m.move_d, 10.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.axes_r[0], 1.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.max_cruise_v2, 10000.0, epsilon = 1e-9);
    }

    #[test]
    fn move_new_rejects_nan() {
        assert!(matches!(
            Move::new(
                MAX_ACCEL,
                JUNCTION_DEV,
                MAX_VEL,
                ACCEL_TO_DECEL,
                [0.0; 4],
                [f64::NAN, 0.0, 0.0, 0.0],
                100.0
            ),
            Err(MotionError::InvalidMove(_))
        ));
    }

    #[test]
    fn move_new_rejects_zero_speed() {
        assert!(matches!(
            Move::new(
                MAX_ACCEL,
                JUNCTION_DEV,
                MAX_VEL,
                ACCEL_TO_DECEL,
                [0.0; 4],
                [10.0, 0.0, 0.0, 0.0],
                0.0
            ),
            Err(MotionError::InvalidMove(_))
        ));
    }

    #[test]
    fn aux_only_move_is_not_kinematic() {
        let m = mk_move([10.0, 0.0, 0.0, 0.0], [10.0, 0.0, 0.0, 5.0], 20.0);
        assert!(!m.is_kinematic_move);
        assert_approx_eq!(f64, m.move_d, 5.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.axes_r[3], 1.0, epsilon = 1e-9);
    }

    // A single straight move, full stop both ends.
    #[test]
    fn straight_move_trapezoid() {
        let mut m = Move::new(
            1000.0,
            JUNCTION_DEV,
            MAX_VEL,
            // Disable the accel smoothing for the textbook profile.
            1000.0,
            [0.0; 4],
            [100.0, 0.0, 0.0, 0.0],
            100.0,
        )
        .unwrap();
        let mut laq = LookAheadQueue::new();
        laq.add_move(m.clone());
        let flushed = laq.flush(false);
        assert_eq!(flushed.len(), 1);
        m = flushed.into_iter().next().unwrap();
        assert_approx_eq!(f64, m.start_v, 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.end_v, 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.cruise_v, 100.0, epsilon = 1e-9);
        assert_approx_eq!(f64, m.accel_t, 0.1, epsilon = 1e-9);
        assert_approx_eq!(f64, m.cruise_t, 0.9, epsilon = 1e-9);
        assert_approx_eq!(f64, m.decel_t, 0.1, epsilon = 1e-9);
        assert_approx_eq!(f64, m.total_time(), 1.1, epsilon = 1e-9);
    }

    // A 90 degree corner with zero junction deviation is a full stop.
    #[test]
    fn square_corner_full_stop() {
        let mut m1 = Move::new(1000.0, 0.0, MAX_VEL, 1000.0, [0.0; 4], [10.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        let mut m2 = Move::new(
            1000.0,
            0.0,
            MAX_VEL,
            1000.0,
            [10.0, 0.0, 0.0, 0.0],
            [10.0, 10.0, 0.0, 0.0],
            100.0,
        )
        .unwrap();
        let mut laq = LookAheadQueue::new();
        laq.add_move(m1.clone());
        laq.add_move(m2.clone());
        let flushed = laq.flush(false);
        assert_eq!(flushed.len(), 2);
        m1 = flushed[0].clone();
        m2 = flushed[1].clone();
        assert_approx_eq!(f64, m1.end_v, 0.0, epsilon = 1e-6);
        assert_approx_eq!(f64, m2.start_v, 0.0, epsilon = 1e-6);
    }

    // A near-collinear corner stays near full speed.
    #[test]
    fn shallow_corner_keeps_speed() {
        let jd = 0.01;
        let m1 = Move::new(1000.0, jd, MAX_VEL, 1000.0, [0.0; 4], [10.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        let mut m2 = Move::new(
            1000.0,
            jd,
            MAX_VEL,
            1000.0,
            [10.0, 0.0, 0.0, 0.0],
            [20.0, 0.1, 0.0, 0.0],
            100.0,
        )
        .unwrap();
        m2.calc_junction(&m1);
        assert!(
            m2.max_start_v2 > 99.0 * 99.0,
            "junction speed {} too low",
            m2.max_start_v2.sqrt()
        );
    }

    // Junction continuity must hold across every flushed pair.
    #[test]
    fn junction_speeds_are_continuous() {
        let mut laq = LookAheadQueue::new();
        let pts = [
            [20.0, 0.0, 0.0, 0.0],
            [40.0, 5.0, 0.0, 0.0],
            [60.0, 0.0, 0.0, 0.0],
            [80.0, 10.0, 0.0, 0.0],
            [100.0, 0.0, 0.0, 0.0],
        ];
        let mut prev = [0.0; 4];
        for p in pts {
            laq.add_move(mk_move(prev, p, 150.0));
            prev = p;
        }
        let flushed = laq.flush(false);
        assert_eq!(flushed.len(), pts.len());
        for pair in flushed.windows(2) {
            assert_approx_eq!(f64, pair[0].end_v, pair[1].start_v, epsilon = 1e-9);
        }
        // The three phases must cover the whole distance.
        for m in &flushed {
            let accel_d = (m.start_v + m.cruise_v) * 0.5 * m.accel_t;
            let cruise_d = m.cruise_v * m.cruise_t;
            let decel_d = (m.end_v + m.cruise_v) * 0.5 * m.decel_t;
            assert_approx_eq!(f64, accel_d + cruise_d + decel_d, m.move_d, epsilon = 1e-9 * m.move_d);
            assert!(accel_d >= -1e-9 && cruise_d >= -1e-9 && decel_d >= -1e-9);
        }
    }

    #[test]
    fn lazy_flush_holds_last_moves() {
        let mut laq = LookAheadQueue::new();
        laq.add_move(mk_move([0.0; 4], [10.0, 0.0, 0.0, 0.0], 100.0));
        laq.add_move(mk_move([10.0, 0.0, 0.0, 0.0], [20.0, 0.0, 0.0, 0.0], 100.0));
        // Lazy flush with no committed peak keeps everything queued.
        let flushed = laq.flush(true);
        assert!(flushed.is_empty());
        assert_eq!(laq.queue.len(), 2);
        let flushed = laq.flush(false);
        assert_eq!(flushed.len(), 2);
    }

    #[test]
    fn toolhead_rejects_out_of_bounds_and_drains() {
        let mut th = test_toolhead();
        th.move_to(0.0, [10.0, 10.0, 0.0, 0.0], 50.0).unwrap();
        let err = th.move_to(0.0, [400.0, 10.0, 0.0, 0.0], 50.0).unwrap_err();
        assert!(matches!(err, HostError::Motion(MotionError::OutOfBounds(_))));
        assert_eq!(th.state(), QueueState::Drained);
        // Further moves rejected until reset.
        assert!(th.move_to(0.0, [20.0, 10.0, 0.0, 0.0], 50.0).is_err());
        th.reset_from_drained([0.0; 4]);
        assert!(th.move_to(0.0, [20.0, 10.0, 0.0, 0.0], 50.0).is_ok());
    }

    #[test]
    fn dwell_advances_print_time() {
        let mut th = test_toolhead();
        th.move_to(0.0, [10.0, 0.0, 0.0, 0.0], 50.0).unwrap();
        th.wait_moves(0.0).unwrap();
        let before = th.print_time;
        th.dwell(0.0, 0.5).unwrap();
        assert_approx_eq!(f64, th.print_time, before + 0.5, epsilon = 1e-9);
    }

    #[test]
    fn set_position_moves_the_commanded_point() {
        let mut th = test_toolhead();
        th.set_position(0.0, [50.0, 60.0, 5.0, 0.0]).unwrap();
        assert_eq!(th.get_position(), [50.0, 60.0, 5.0, 0.0]);
        // Subsequent moves plan from the new origin.
        th.move_to(0.0, [60.0, 60.0, 5.0, 0.0], 50.0).unwrap();
        assert_eq!(th.get_position(), [60.0, 60.0, 5.0, 0.0]);
    }

    #[test]
    fn invalid_move_leaves_queue_unchanged() {
        let mut th = test_toolhead();
        th.move_to(0.0, [10.0, 0.0, 0.0, 0.0], 50.0).unwrap();
        let depth = th.lookahead.queue.len();
        let pos = th.get_position();
        assert!(th.move_to(0.0, [20.0, f64::NAN, 0.0, 0.0], 50.0).is_err());
        assert_eq!(th.lookahead.queue.len(), depth);
        assert_eq!(th.get_position(), pos);
        assert_ne!(th.state(), QueueState::Drained);
    }
}
