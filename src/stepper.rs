// src/stepper.rs
// Host-side steppers: each owns its step compressor and converts trapezoid
// segments (through the kinematics contribution) into ideal step times by
// inverting the segment's closed-form position per step boundary.
// StepperSync drives all steppers of one MCU session during a flush and
// gates dispatch by the clock lead window.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{HostError, StepError};
use crate::kinematics::{Kinematics, StepperContribution};
use crate::stepcompress::{StepCompress, StepperMsg};
use crate::toolhead::MotionFlush;
use crate::trapq::{TrapQ, TrapSegment};

/// Spacing for defensively emitted catch-up steps.
const TIME_EPS: f64 = 1e-6;

/// Sink for compressed stepper output; implemented by the MCU session.
pub trait StepDispatch: Send {
    fn mcu_freq(&self) -> f64;
    /// Best estimate of the MCU print time corresponding to `host_time`.
    fn estimated_print_time(&self, host_time: f64) -> f64;
    /// Latest clock the lead window currently allows on the wire.
    fn lead_limit_clock(&self) -> u64;
    /// Earliest clock that is still safely schedulable.
    fn min_lead_clock(&self) -> u64;
    /// Forward ordered stepper output. A full queue reports backpressure.
    fn dispatch(&mut self, oid: u8, msgs: &[StepperMsg]) -> Result<(), StepError>;
}

pub struct Stepper {
    pub name: String,
    pub oid: u8,
    /// Millimeters per step; the sign encodes the motor's wiring direction.
    step_dist: f64,
    /// Joint position (mm) the step stream has committed to.
    commanded_pos: f64,
    /// Direction as last sent to the MCU.
    dir: Option<bool>,
    compress: StepCompress,
}

impl Stepper {
    pub fn new(name: &str, oid: u8, step_dist: f64, max_error: u32, queue_capacity: usize) -> Self {
        Stepper {
            name: name.to_string(),
            oid,
            step_dist,
            commanded_pos: 0.0,
            dir: None,
            compress: StepCompress::new(name, max_error, queue_capacity),
        }
    }

    pub fn set_time(&mut self, mcu_time_offset: f64, mcu_freq: f64) {
        self.compress.set_time(mcu_time_offset, mcu_freq);
    }

    pub fn set_position(&mut self, pos_mm: f64) {
        self.commanded_pos = pos_mm;
    }

    pub fn commanded_position(&self) -> f64 {
        self.commanded_pos
    }

    pub fn compressor(&mut self) -> &mut StepCompress {
        &mut self.compress
    }

    /// Emit ideal step times for one contribution over the absolute time
    /// window `[abs_start, abs_end]` of a segment starting at
    /// `seg_start_time`.
    pub fn generate_segment(
        &mut self,
        seg_start_time: f64,
        seg_move_t: f64,
        contrib: &StepperContribution,
        abs_start: f64,
        abs_end: f64,
    ) -> Result<(), StepError> {
        let t0 = (abs_start - seg_start_time).max(0.0);
        let t1 = (abs_end - seg_start_time).min(seg_move_t);
        if t1 <= t0 {
            return Ok(());
        }
        let step = self.step_dist.abs();
        let half = 0.5 * step;

        // Joint velocity keeps its sign over one segment.
        let moving_pos = if contrib.start_velocity != 0.0 {
            contrib.start_velocity > 0.0
        } else {
            contrib.accel > 0.0
        };
        let dirsign = if moving_pos { 1.0 } else { -1.0 };
        // Physical direction flips with a negative step distance.
        let phys_dir = moving_pos == (self.step_dist > 0.0);
        if self.dir != Some(phys_dir) {
            self.compress.set_next_step_dir(phys_dir)?;
            self.dir = Some(phys_dir);
        }

        let mut t = t0;
        loop {
            let target = self.commanded_pos + dirsign * half;
            let t_cross = match solve_crossing(contrib, target, dirsign, t, t1) {
                Some(tc) => tc,
                None => break,
            };
            self.compress.append(seg_start_time + t_cross)?;
            self.commanded_pos += dirsign * step;
            t = t_cross;
        }
        Ok(())
    }
}

/// Earliest time in `(t_lo, t_hi]` at which the contribution's position
/// reaches `target`, solving `p(t_lo) + v dt + a dt^2 / 2 = target` in a
/// direction-normalized frame.
fn solve_crossing(
    contrib: &StepperContribution,
    target: f64,
    dirsign: f64,
    t_lo: f64,
    t_hi: f64,
) -> Option<f64> {
    let p_lo = contrib.position_at(t_lo);
    let d = dirsign * (target - p_lo);
    if d <= 0.0 {
        // Position state carried from an earlier segment already crossed
        // the boundary; catch up just inside the window.
        let t = t_lo + TIME_EPS;
        return if t < t_hi { Some(t) } else { None };
    }
    let v = dirsign * contrib.velocity_at(t_lo);
    let a = dirsign * contrib.accel;
    let disc = v * v + 2.0 * a * d;
    if disc < 0.0 {
        // The segment decelerates to a stop before the boundary.
        return None;
    }
    let denom = v + disc.sqrt();
    if denom <= 0.0 {
        return None;
    }
    let dt = 2.0 * d / denom;
    let t = t_lo + dt;
    if t > t_hi {
        return None;
    }
    Some(t)
}

/// Drives every stepper of one session: step generation from the trapezoid
/// queue, compression, and lead-window-gated dispatch.
pub struct StepperSync {
    trapq: Arc<Mutex<TrapQ>>,
    steppers: Vec<Stepper>,
    dispatch: Box<dyn StepDispatch>,
    /// Print time up to which steps have been generated.
    generated_time: f64,
}

impl StepperSync {
    pub fn new(
        trapq: Arc<Mutex<TrapQ>>,
        mut steppers: Vec<Stepper>,
        dispatch: Box<dyn StepDispatch>,
    ) -> Self {
        let mcu_freq = dispatch.mcu_freq();
        for stepper in &mut steppers {
            // Print time maps to MCU clock through the nominal frequency.
            stepper.set_time(0.0, mcu_freq);
        }
        StepperSync {
            trapq,
            steppers,
            dispatch,
            generated_time: 0.0,
        }
    }

    pub fn steppers_mut(&mut self) -> &mut [Stepper] {
        &mut self.steppers
    }

    fn generate(&mut self, kin: &dyn Kinematics, step_gen_time: f64) -> Result<(), StepError> {
        let start = self.generated_time;
        if step_gen_time <= start {
            return Ok(());
        }
        let segments: Vec<TrapSegment> = {
            let trapq = self.trapq.lock();
            trapq.segments_in_range(start, step_gen_time).cloned().collect()
        };
        if self.generated_time == 0.0 && !segments.is_empty() {
            // First motion: anchor every step clock at the start of the
            // planned window so intervals stay small on the wire.
            let anchor = {
                let t = segments[0].print_time;
                if t <= 0.0 { 0 } else { (t * self.dispatch.mcu_freq()) as u64 }
            };
            for stepper in &mut self.steppers {
                stepper.compress.reset_clock(anchor);
            }
        }
        for seg in &segments {
            for contrib in kin.steps_for(seg) {
                let stepper = match self.steppers.get_mut(contrib.stepper) {
                    Some(s) => s,
                    None => continue,
                };
                stepper.generate_segment(seg.print_time, seg.move_t, &contrib, start, step_gen_time)?;
            }
        }
        self.generated_time = step_gen_time;
        Ok(())
    }

    fn flush_compressed(&mut self, step_gen_time: f64) -> Result<(), StepError> {
        let mcu_freq = self.dispatch.mcu_freq();
        let move_clock = if step_gen_time <= 0.0 {
            0
        } else {
            (step_gen_time * mcu_freq) as u64
        };
        let limit = self.dispatch.lead_limit_clock();
        let min_lead = self.dispatch.min_lead_clock();
        for stepper in &mut self.steppers {
            stepper.compress.flush(move_clock)?;
            let msgs = stepper.compress.take_ready(limit);
            if msgs.is_empty() {
                continue;
            }
            if msgs[0].req_clock() < min_lead {
                warn!(
                    "stepper {}: clock {} already inside the min lead window",
                    stepper.name,
                    msgs[0].req_clock()
                );
            }
            if let Err(e) = self.dispatch.dispatch(stepper.oid, &msgs) {
                stepper.compress.requeue_ready(msgs);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl MotionFlush for StepperSync {
    fn estimated_print_time(&self, host_time: f64) -> f64 {
        self.dispatch.estimated_print_time(host_time)
    }

    fn flush(&mut self, kin: &dyn Kinematics, step_gen_time: f64, _free_time: f64) -> Result<(), HostError> {
        self.generate(kin, step_gen_time)?;
        self.flush_compressed(step_gen_time)?;
        Ok(())
    }
}
