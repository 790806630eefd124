// src/kinematics/cartesian.rs
// Cartesian kinematics: one stepper per axis, joint space equals tool space.
// Z moves get their speed and acceleration scaled down by the z component of
// the move direction.

use crate::error::MotionError;
use crate::kinematics::{AxisLimits, Kinematics, KinematicsError, StepperContribution};
use crate::toolhead::Move;
use crate::trapq::TrapSegment;

pub struct CartesianKinematics {
    limits: Vec<AxisLimits>,
    max_z_velocity: f64,
    max_z_accel: f64,
}

impl CartesianKinematics {
    pub fn new(limits: Vec<AxisLimits>, max_z_velocity: f64, max_z_accel: f64) -> Self {
        CartesianKinematics {
            limits,
            max_z_velocity,
            max_z_accel,
        }
    }

    fn check_endpoint(&self, end_pos: &[f64; 4]) -> Result<(), MotionError> {
        for (axis, limit) in self.limits.iter().enumerate() {
            let pos = end_pos[axis];
            if pos < limit.min - 1e-9 || pos > limit.max + 1e-9 {
                return Err(MotionError::OutOfBounds(format!(
                    "axis {} target {:.3} outside [{:.3}, {:.3}]",
                    axis, pos, limit.min, limit.max
                )));
            }
        }
        Ok(())
    }
}

impl Kinematics for CartesianKinematics {
    fn axis_count(&self) -> usize {
        self.limits.len()
    }

    fn limits(&self) -> &[AxisLimits] {
        &self.limits
    }

    fn forward(&self, joint_pos: &[f64]) -> Vec<f64> {
        joint_pos.to_vec()
    }

    fn inverse(&self, tool_pos: &[f64]) -> Result<Vec<f64>, KinematicsError> {
        for (axis, limit) in self.limits.iter().enumerate() {
            let pos = tool_pos[axis];
            if pos < limit.min - 1e-9 || pos > limit.max + 1e-9 {
                return Err(KinematicsError::Unreachable(format!(
                    "axis {axis} position {pos:.3} outside travel"
                )));
            }
        }
        Ok(tool_pos.to_vec())
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MotionError> {
        self.check_endpoint(&mv.end_pos)?;

        // Project each axis's acceleration bound onto the move direction.
        let mut accel = mv.accel;
        let mut speed = mv.max_cruise_v2.sqrt();
        for (axis, limit) in self.limits.iter().enumerate() {
            let r = mv.axes_r[axis].abs();
            if r > 1e-12 {
                accel = accel.min(limit.max_accel / r);
            }
        }
        if mv.axes_d[2].abs() > 1e-12 {
            let z_ratio = mv.move_d / mv.axes_d[2].abs();
            speed = speed.min(self.max_z_velocity * z_ratio);
            accel = accel.min(self.max_z_accel * z_ratio);
        }
        mv.limit_speed(speed, accel);
        Ok(())
    }

    fn steps_for(&self, seg: &TrapSegment) -> Vec<StepperContribution> {
        let axes_r = [seg.axes_r.x, seg.axes_r.y, seg.axes_r.z];
        let start = [seg.start_pos.x, seg.start_pos.y, seg.start_pos.z];
        let mut out = Vec::with_capacity(3);
        for axis in 0..self.limits.len().min(3) {
            let r = axes_r[axis];
            if r == 0.0 {
                continue;
            }
            out.push(StepperContribution {
                stepper: axis,
                start_pos: start[axis],
                start_velocity: seg.start_v * r,
                accel: 2.0 * seg.half_accel * r,
            });
        }
        out
    }
}
