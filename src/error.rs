// src/error.rs
// Error kinds shared across the host core, and the structured event emitted
// for every fatal condition.

use thiserror::Error;

/// Planner-level failures raised at or before look-ahead.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MotionError {
    /// The request itself is malformed; the queue is left unchanged.
    #[error("invalid move: {0}")]
    InvalidMove(String),
    /// Kinematics reported a position outside its declared limits. The
    /// current print is aborted and the toolhead latches until reset.
    #[error("move out of bounds: {0}")]
    OutOfBounds(String),
}

/// Step generation and compression failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Ideal step times went backwards. Valid kinematics can never produce
    /// this; it is fatal and triggers emergency stop on all sessions.
    #[error("step order violation on '{stepper}': step at clock {clock} not after {last_clock}")]
    StepOrderViolation {
        stepper: String,
        clock: u64,
        last_clock: u64,
    },
    /// The per-stepper queue hit the MCU's capacity. Soft: the planner
    /// flush gate absorbs it and retries.
    #[error("step queue backpressure on '{0}'")]
    Backpressure(String),
    /// A step landed further in the future than the clock representation
    /// allows without an intervening `reset_step_clock`.
    #[error("step on '{stepper}' too far in future (gap {gap} ticks)")]
    FarFutureStep { stepper: String, gap: u64 },
}

/// Wire-level failures. Retried up to `RETRY_MAX` per session before
/// becoming fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame crc mismatch (got {got:#06x}, want {want:#06x})")]
    BadCrc { got: u16, want: u16 },
    #[error("bad frame sequence byte {0:#04x}")]
    BadSequence(u8),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown command id {0}")]
    UnknownCommandId(u16),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("argument mismatch for '{cmd}': {reason}")]
    ArgumentMismatch { cmd: String, reason: String },
    #[error("dictionary error: {0}")]
    Dictionary(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("timeout waiting for '{0}'")]
    ResponseTimeout(String),
}

/// Session-level failures reported by or about an MCU.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum McuError {
    /// The MCU declared shutdown; the host mirrors it into a fatal state.
    #[error("mcu '{session}' shutdown: {reason}")]
    Shutdown { session: String, reason: String },
    /// Clock estimator residuals stayed out of tolerance for the sustain
    /// window.
    #[error("mcu '{session}' clock drift beyond tolerance")]
    ClockDrift { session: String },
    #[error("mcu '{session}' configuration error: {reason}")]
    Config { session: String, reason: String },
    #[error("mcu '{session}' protocol failure: {source}")]
    Protocol {
        session: String,
        source: ProtocolError,
    },
}

/// Top-level error for the host process.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Mcu(#[from] McuError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("shutdown requested: {0}")]
    Shutdown(String),
}

impl HostError {
    /// Fatal errors halt every session of the printer instance; soft errors
    /// are absorbed by their producer.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HostError::Motion(MotionError::InvalidMove(_)) | HostError::Step(StepError::Backpressure(_))
        )
    }
}

/// The single structured record produced for every fatal error. `host_time`
/// is the reactor's monotonic clock at the moment the error latched.
#[derive(Debug, Clone)]
pub struct FatalEvent {
    pub kind: &'static str,
    pub host_time: f64,
    pub session: Option<String>,
    pub cause: String,
}

impl FatalEvent {
    pub fn new(err: &HostError, host_time: f64, session: Option<String>) -> Self {
        let kind = match err {
            HostError::Motion(MotionError::InvalidMove(_)) => "invalid_move",
            HostError::Motion(MotionError::OutOfBounds(_)) => "out_of_bounds",
            HostError::Step(StepError::StepOrderViolation { .. }) => "step_order_violation",
            HostError::Step(StepError::Backpressure(_)) => "backpressure",
            HostError::Step(StepError::FarFutureStep { .. }) => "far_future_step",
            HostError::Protocol(_) => "protocol_error",
            HostError::Mcu(McuError::Shutdown { .. }) => "mcu_shutdown",
            HostError::Mcu(McuError::ClockDrift { .. }) => "clock_drift",
            HostError::Mcu(_) => "mcu_error",
            HostError::Config(_) => "config_error",
            HostError::Shutdown(_) => "shutdown",
        };
        FatalEvent {
            kind,
            host_time,
            session,
            cause: err.to_string(),
        }
    }
}

impl std::fmt::Display for FatalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session {
            Some(s) => write!(
                f,
                "fatal {} at {:.3} on {}: {}",
                self.kind, self.host_time, s, self.cause
            ),
            None => write!(f, "fatal {} at {:.3}: {}", self.kind, self.host_time, self.cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_move_is_not_fatal() {
        let err = HostError::from(MotionError::InvalidMove("nan speed".into()));
        assert!(!err.is_fatal());
    }

    #[test]
    fn step_order_violation_is_fatal() {
        let err = HostError::from(StepError::StepOrderViolation {
            stepper: "stepper_x".into(),
            clock: 100,
            last_clock: 200,
        });
        assert!(err.is_fatal());
        let ev = FatalEvent::new(&err, 12.5, Some("mcu".into()));
        assert_eq!(ev.kind, "step_order_violation");
        assert!(ev.to_string().contains("stepper_x"));
    }

    #[test]
    fn fatal_event_carries_session() {
        let err = HostError::from(McuError::ClockDrift {
            session: "mcu aux".into(),
        });
        let ev = FatalEvent::new(&err, 0.0, Some("mcu aux".into()));
        assert_eq!(ev.kind, "clock_drift");
        assert_eq!(ev.session.as_deref(), Some("mcu aux"));
    }
}
