// src/trapq.rs
// Queue of finalized trapezoidal move segments. Each planned move is stored
// as up to three constant-acceleration segments; steppers integrate these
// through their kinematics contribution to generate step times.

use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Coord { x, y, z }
    }
}

/// One constant-acceleration segment of a planned move.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrapSegment {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
}

impl TrapSegment {
    /// Distance along the move direction `t` seconds into the segment.
    pub fn distance_at(&self, t: f64) -> f64 {
        (self.start_v + self.half_accel * t) * t
    }

    /// Speed `t` seconds into the segment.
    pub fn velocity_at(&self, t: f64) -> f64 {
        self.start_v + 2.0 * self.half_accel * t
    }

    pub fn coord_at(&self, t: f64) -> Coord {
        let d = self.distance_at(t);
        Coord::new(
            self.start_pos.x + self.axes_r.x * d,
            self.start_pos.y + self.axes_r.y * d,
            self.start_pos.z + self.axes_r.z * d,
        )
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }
}

const HISTORY_KEEP: usize = 128;

/// Time-ordered segment queue with a bounded history of expired segments.
#[derive(Debug, Default)]
pub struct TrapQ {
    pub segments: VecDeque<TrapSegment>,
    pub history: VecDeque<TrapSegment>,
}

impl TrapQ {
    pub fn new() -> Self {
        TrapQ::default()
    }

    /// Append one planned move as accel/cruise/decel segments. Zero-length
    /// phases are elided.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: Coord,
        axes_r: Coord,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        let mut time = print_time;
        let mut pos = start_pos;
        if accel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: accel_t,
                start_v,
                half_accel: 0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            pos = seg.coord_at(accel_t);
            time += accel_t;
            self.segments.push_back(seg);
        }
        if cruise_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: cruise_t,
                start_v: cruise_v,
                half_accel: 0.0,
                start_pos: pos,
                axes_r,
            };
            pos = seg.coord_at(cruise_t);
            time += cruise_t;
            self.segments.push_back(seg);
        }
        if decel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: decel_t,
                start_v: cruise_v,
                half_accel: -0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            self.segments.push_back(seg);
        }
    }

    /// Expire every segment that ends at or before `free_time`.
    pub fn finalize_moves(&mut self, free_time: f64) {
        loop {
            match self.segments.front() {
                Some(front) if front.end_time() <= free_time => {}
                _ => break,
            }
            if let Some(seg) = self.segments.pop_front() {
                self.history.push_back(seg);
            }
            while self.history.len() > HISTORY_KEEP {
                self.history.pop_front();
            }
        }
    }

    /// Drop all pending segments and record `pos` as a zero-length marker.
    pub fn set_position(&mut self, print_time: f64, pos: Coord) {
        self.finalize_moves(f64::INFINITY);
        self.history.retain(|seg| seg.print_time < print_time);
        self.segments.push_back(TrapSegment {
            print_time,
            move_t: 0.0,
            start_v: 0.0,
            half_accel: 0.0,
            start_pos: pos,
            axes_r: Coord::default(),
        });
        self.finalize_moves(f64::INFINITY);
    }

    /// Segments overlapping `[start, end)` in time order.
    pub fn segments_in_range(&self, start: f64, end: f64) -> impl Iterator<Item = &TrapSegment> {
        self.segments
            .iter()
            .filter(move |seg| seg.end_time() > start && seg.print_time < end)
    }

    pub fn last_end_time(&self) -> Option<f64> {
        self.segments.back().map(|seg| seg.end_time())
    }
}
