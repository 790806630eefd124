// src/kinematics/mod.rs
// Kinematics plug-in contract. Implementations translate tool-space motion
// into per-stepper joint motion; the planner borrows a kinematics handle for
// the duration of each planning pass and never owns the steppers through it.

pub mod cartesian;

use thiserror::Error;

use crate::error::MotionError;
use crate::toolhead::Move;
use crate::trapq::TrapSegment;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum KinematicsError {
    #[error("tool position unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    pub min: f64,
    pub max: f64,
    pub max_accel: f64,
}

/// One stepper's share of a trapezoid segment: joint position over the
/// segment's time span as a second-order closed form
/// `p(t) = start_pos + start_velocity·t + accel·t²/2`,
/// monotonic over `[0, move_t]`. Exact for linear kinematics; the endpoint
/// derivatives seed the step compressor's initial interval and add.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepperContribution {
    pub stepper: usize,
    pub start_pos: f64,
    pub start_velocity: f64,
    pub accel: f64,
}

impl StepperContribution {
    pub fn position_at(&self, t: f64) -> f64 {
        self.start_pos + (self.start_velocity + 0.5 * self.accel * t) * t
    }

    /// First derivative at `t` (endpoints t=0 and t=move_t are the contract
    /// points).
    pub fn velocity_at(&self, t: f64) -> f64 {
        self.start_velocity + self.accel * t
    }

    /// Second derivative; constant over the segment.
    pub fn accel_at(&self) -> f64 {
        self.accel
    }
}

pub trait Kinematics: Send {
    fn axis_count(&self) -> usize;
    fn limits(&self) -> &[AxisLimits];

    /// Joint positions -> tool position.
    fn forward(&self, joint_pos: &[f64]) -> Vec<f64>;

    /// Tool position -> joint positions.
    fn inverse(&self, tool_pos: &[f64]) -> Result<Vec<f64>, KinematicsError>;

    /// Validate a move's endpoint and clamp its speed/accel to per-axis
    /// bounds. An endpoint outside the declared limits aborts the print.
    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError>;

    /// Decompose one trapezoid segment into per-stepper contributions.
    /// Steppers that do not move during the segment are omitted.
    fn steps_for(&self, seg: &TrapSegment) -> Vec<StepperContribution>;
}
