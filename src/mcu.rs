// src/mcu.rs
// One MCU session: dictionary negotiation, the configuration phase, the
// periodic clock exchange, timed step dispatch through the clock mapping,
// and mirroring of MCU-side shutdowns. A failure on any session halts the
// whole printer instance through the shared shutdown latch.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::clocksync::ClockSync;
use crate::error::{FatalEvent, HostError, McuError, ProtocolError, StepError};
use crate::msgproto::{Command, CommandSpec, Dictionary, MsgParser, ParamType};
use crate::reactor::{monotonic, ShutdownLatch};
use crate::serialhdl::{SerialHdl, Transport};
use crate::stepcompress::StepperMsg;
use crate::stepper::StepDispatch;

/// Identify chunk size requested per exchange.
const IDENTIFY_CHUNK: i64 = 40;
/// Response wait for the blocking exchanges of session setup.
const RESPONSE_TIMEOUT: f64 = 2.0;
/// Priming exchanges for the clock estimator.
const CLOCK_PRIME_COUNT: usize = 8;
const CLOCK_PRIME_SPACING: f64 = 0.025;
/// Odd period so clock queries do not resonate with other timers.
pub const CLOCK_QUERY_PERIOD: f64 = 0.9839;

/// Dispatch gate: a triple goes on the wire once its end time is inside
/// `[now + MIN_LEAD, now + MAX_LEAD]`.
const MIN_LEAD: f64 = 0.100;
const MAX_LEAD: f64 = 2.0;

/// Commands per frame on the step dispatch path.
const DISPATCH_BATCH: usize = 4;

/// The command signatures this host requires of every MCU. The MCU assigns
/// ids; the names and parameter lists must match exactly or the session is
/// rejected at negotiation.
pub const REQUIRED_COMMANDS: &[(&str, &[(&str, ParamType)])] = &[
    ("identify", &[("offset", ParamType::U32), ("count", ParamType::U8)]),
    ("get_config", &[]),
    ("finalize_config", &[("crc", ParamType::U32)]),
    ("allocate_oids", &[("count", ParamType::U8)]),
    ("config_stepper", &[("oid", ParamType::U8), ("invert_step", ParamType::U8)]),
    (
        "queue_step",
        &[
            ("oid", ParamType::U8),
            ("interval", ParamType::U32),
            ("count", ParamType::U16),
            ("add", ParamType::I16),
        ],
    ),
    ("set_next_step_dir", &[("oid", ParamType::U8), ("dir", ParamType::U8)]),
    ("reset_step_clock", &[("oid", ParamType::U8), ("clock", ParamType::U32)]),
    ("get_clock", &[]),
    ("emergency_stop", &[]),
    ("shutdown", &[]),
];

pub const REQUIRED_RESPONSES: &[(&str, &[(&str, ParamType)])] = &[
    ("identify_response", &[("offset", ParamType::U32), ("data", ParamType::Buffer)]),
    (
        "config",
        &[("is_config", ParamType::U8), ("crc", ParamType::U32), ("move_count", ParamType::U16)],
    ),
    ("clock", &[("clock", ParamType::U32)]),
    ("stats", &[("count", ParamType::U32), ("sum", ParamType::U32), ("sumsq", ParamType::U32)]),
    ("shutdown", &[("clock", ParamType::U32), ("reason", ParamType::String)]),
    ("is_shutdown", &[("reason", ParamType::String)]),
];

/// Bootstrap table used before the dictionary is negotiated: just enough
/// to run `identify`. These two ids are fixed by convention.
pub fn bootstrap_dictionary() -> Dictionary {
    let mut commands = HashMap::new();
    commands.insert(
        "identify".to_string(),
        CommandSpec {
            id: 1,
            params: vec![
                ("offset".to_string(), ParamType::U32),
                ("count".to_string(), ParamType::U8),
            ],
        },
    );
    let mut responses = HashMap::new();
    responses.insert(
        "identify_response".to_string(),
        CommandSpec {
            id: 0,
            params: vec![
                ("offset".to_string(), ParamType::U32),
                ("data".to_string(), ParamType::Buffer),
            ],
        },
    );
    Dictionary {
        version: String::new(),
        commands,
        responses,
        config: HashMap::new(),
    }
}

/// A full dictionary with the reference id assignment. Served by the
/// simulated MCU and used in tests; a real MCU ships its own ids.
pub fn reference_dictionary(mcu_freq: f64) -> Dictionary {
    let mut commands = HashMap::new();
    for (i, (name, params)) in REQUIRED_COMMANDS.iter().enumerate() {
        let id = if *name == "identify" { 1 } else { 10 + i as u16 };
        commands.insert(
            name.to_string(),
            CommandSpec {
                id,
                params: params.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            },
        );
    }
    let mut responses = HashMap::new();
    for (i, (name, params)) in REQUIRED_RESPONSES.iter().enumerate() {
        let id = if *name == "identify_response" { 0 } else { 60 + i as u16 };
        responses.insert(
            name.to_string(),
            CommandSpec {
                id,
                params: params.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            },
        );
    }
    let mut config = HashMap::new();
    config.insert("CLOCK_FREQ".to_string(), serde_json::json!(mcu_freq));
    Dictionary {
        version: "reference-1".to_string(),
        commands,
        responses,
        config,
    }
}

fn check_signature(
    kind: &str,
    table: &HashMap<String, CommandSpec>,
    required: &[(&str, &[(&str, ParamType)])],
) -> Result<(), ProtocolError> {
    for (name, params) in required {
        let spec = table.get(*name).ok_or_else(|| {
            ProtocolError::Dictionary(format!("missing required {kind} '{name}'"))
        })?;
        let want: Vec<(String, ParamType)> =
            params.iter().map(|(n, t)| (n.to_string(), *t)).collect();
        if spec.params != want {
            return Err(ProtocolError::Dictionary(format!(
                "signature mismatch for {kind} '{name}'"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McuState {
    Startup,
    Ready,
    Shutdown(String),
}

pub struct McuSession {
    name: String,
    serial: SerialHdl,
    clocksync: ClockSync,
    latch: ShutdownLatch,
    state: McuState,
    config_crc: u32,
    oid_count: u8,
    last_stats: Option<String>,
}

impl McuSession {
    /// Open the link, negotiate the dictionary, and warm up clock sync.
    pub fn connect(
        name: &str,
        transport: Box<dyn Transport>,
        latch: ShutdownLatch,
    ) -> Result<Self, HostError> {
        let bootstrap = MsgParser::new(bootstrap_dictionary())
            .map_err(|e| HostError::Protocol(e))?;
        let mut serial = SerialHdl::connect(name, transport, bootstrap, latch.clone());

        let dict = Self::fetch_dictionary(&mut serial).map_err(|e| McuError::Protocol {
            session: name.to_string(),
            source: e,
        })?;
        check_signature("command", &dict.commands, REQUIRED_COMMANDS)
            .and_then(|_| check_signature("response", &dict.responses, REQUIRED_RESPONSES))
            .map_err(|e| McuError::Protocol { session: name.to_string(), source: e })?;
        let mcu_freq = dict.constant_f64("CLOCK_FREQ").ok_or_else(|| McuError::Config {
            session: name.to_string(),
            reason: "dictionary missing CLOCK_FREQ".to_string(),
        })?;
        info!(
            "mcu {name}: dictionary '{}' pinned, {} commands, freq {mcu_freq}",
            dict.version,
            dict.commands.len()
        );
        let parser = MsgParser::new(dict).map_err(HostError::Protocol)?;
        serial.set_msgparser(parser);

        let mut session = McuSession {
            name: name.to_string(),
            serial,
            clocksync: ClockSync::new(mcu_freq),
            latch,
            state: McuState::Startup,
            config_crc: 0,
            oid_count: 0,
            last_stats: None,
        };
        session.prime_clock()?;
        Ok(session)
    }

    fn fetch_dictionary(serial: &mut SerialHdl) -> Result<Dictionary, ProtocolError> {
        let mut blob = Vec::new();
        let mut stale = 0u32;
        loop {
            let cmd = Command::new("identify")
                .arg("offset", blob.len() as i64)
                .arg("count", IDENTIFY_CHUNK);
            let msg = serial.send_with_response(&cmd, "identify_response", RESPONSE_TIMEOUT)?;
            let offset = msg
                .command
                .get_int("offset")
                .ok_or_else(|| ProtocolError::Dictionary("identify_response missing offset".into()))?;
            let data = msg
                .command
                .get_bytes("data")
                .ok_or_else(|| ProtocolError::Dictionary("identify_response missing data".into()))?;
            if offset as usize != blob.len() {
                // Stale chunk from a retransmission; ask again.
                debug!("identify: stale offset {offset}, have {}", blob.len());
                stale += 1;
                if stale > 5 {
                    return Err(ProtocolError::Dictionary("identify offsets never aligned".into()));
                }
                continue;
            }
            blob.extend_from_slice(data);
            if data.len() < IDENTIFY_CHUNK as usize {
                break;
            }
        }
        Dictionary::from_compressed(&blob)
    }

    fn prime_clock(&mut self) -> Result<(), HostError> {
        for _ in 0..CLOCK_PRIME_COUNT {
            let msg = self
                .serial
                .send_with_response(&Command::new("get_clock"), "clock", RESPONSE_TIMEOUT)
                .map_err(|e| self.protocol_error(e))?;
            let clock = msg.command.get_int("clock").unwrap_or(0) as u32;
            self.clocksync.record_sample(clock, msg.sent_time, msg.receive_time);
            std::thread::sleep(std::time::Duration::from_secs_f64(CLOCK_PRIME_SPACING));
        }
        debug!("mcu {}: clock primed: {}", self.name, self.clocksync.dump_debug());
        Ok(())
    }

    /// Configuration phase: allocate oids and configure `inverts.len()`
    /// steppers, then pin the config with a checksum. A previously
    /// configured MCU must present the same checksum.
    pub fn configure_steppers(&mut self, inverts: &[bool]) -> Result<Vec<u8>, HostError> {
        let crc = {
            // Config identity: stepper count and inversions.
            let mut desc = Vec::new();
            desc.push(inverts.len() as u8);
            desc.extend(inverts.iter().map(|&i| i as u8));
            crate::msgproto::crc16_ccitt(&desc) as u32
        };
        let msg = self
            .serial
            .send_with_response(&Command::new("get_config"), "config", RESPONSE_TIMEOUT)
            .map_err(|e| self.protocol_error(e))?;
        let is_config = msg.command.get_int("is_config").unwrap_or(0) != 0;
        let existing_crc = msg.command.get_int("crc").unwrap_or(0) as u32;

        if is_config {
            if existing_crc != crc {
                return Err(McuError::Config {
                    session: self.name.clone(),
                    reason: format!("config crc mismatch: mcu {existing_crc:#x}, host {crc:#x}"),
                }
                .into());
            }
            info!("mcu {}: already configured, crc matches", self.name);
        } else {
            let mut cmds = vec![Command::new("allocate_oids").arg("count", inverts.len() as i64)];
            for (oid, invert) in inverts.iter().enumerate() {
                cmds.push(
                    Command::new("config_stepper")
                        .arg("oid", oid as i64)
                        .arg("invert_step", *invert as i64),
                );
            }
            cmds.push(Command::new("finalize_config").arg("crc", crc as i64));
            self.serial.send(&cmds).map_err(|e| self.protocol_error(e))?;
        }
        self.config_crc = crc;
        self.oid_count = inverts.len() as u8;
        self.state = McuState::Ready;
        Ok((0..inverts.len() as u8).collect())
    }

    pub fn state(&self) -> &McuState {
        &self.state
    }

    pub fn clocksync(&self) -> &ClockSync {
        &self.clocksync
    }

    /// Periodic clock exchange; drives the estimator and the drift watch.
    pub fn clock_tick(&mut self, now: f64) -> Result<(), HostError> {
        if matches!(self.state, McuState::Shutdown(_)) {
            return Ok(());
        }
        let msg = self
            .serial
            .send_with_response(&Command::new("get_clock"), "clock", RESPONSE_TIMEOUT)
            .map_err(|e| self.protocol_error(e))?;
        let clock = msg.command.get_int("clock").unwrap_or(0) as u32;
        self.clocksync.record_sample(clock, msg.sent_time, msg.receive_time);
        if self.clocksync.drift_exceeded(now) {
            let err = HostError::from(McuError::ClockDrift { session: self.name.clone() });
            self.fatal(&err, now);
            return Err(err);
        }
        Ok(())
    }

    /// Drain async messages: stats, shutdown notices, stragglers.
    pub fn poll_events(&mut self, now: f64) -> Result<(), HostError> {
        let msgs = match self.serial.poll() {
            Ok(msgs) => msgs,
            Err(e) => {
                let err = self.protocol_error(e);
                self.fatal(&err, now);
                return Err(err);
            }
        };
        for msg in msgs {
            match msg.command.name.as_str() {
                "stats" => {
                    let line = format_stats(&msg.command);
                    debug!("mcu {}: stats {line}", self.name);
                    self.last_stats = Some(line);
                }
                "shutdown" | "is_shutdown" => {
                    let reason = msg
                        .command
                        .get_bytes("reason")
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_else(|| "unknown".to_string());
                    let err = HostError::from(McuError::Shutdown {
                        session: self.name.clone(),
                        reason: reason.clone(),
                    });
                    self.state = McuState::Shutdown(reason);
                    self.fatal(&err, now);
                    return Err(err);
                }
                other => debug!("mcu {}: unhandled response '{other}'", self.name),
            }
        }
        Ok(())
    }

    /// Immediate halt command, sent on every fatal path.
    pub fn emergency_stop(&mut self) {
        if let Err(e) = self.serial.send(&[Command::new("emergency_stop")]) {
            warn!("mcu {}: emergency_stop send failed: {e}", self.name);
        }
    }

    /// Orderly host-initiated shutdown of the MCU.
    pub fn request_shutdown(&mut self, reason: &str) {
        info!("mcu {}: requesting shutdown: {reason}", self.name);
        let _ = self.serial.send(&[Command::new("shutdown")]);
        self.state = McuState::Shutdown(reason.to_string());
    }

    pub fn stats(&self) -> String {
        format!(
            "mcu {}: {} {}",
            self.name,
            self.clocksync.stats(),
            self.last_stats.as_deref().unwrap_or("no-stats")
        )
    }

    pub fn join(&mut self) {
        self.serial.join();
    }

    fn protocol_error(&self, e: ProtocolError) -> HostError {
        HostError::from(McuError::Protocol {
            session: self.name.clone(),
            source: e,
        })
    }

    /// Single structured record per fatal error, then the shared latch.
    fn fatal(&mut self, err: &HostError, now: f64) {
        let event = FatalEvent::new(err, now, Some(self.name.clone()));
        error!("{event}");
        self.emergency_stop();
        self.latch.trip();
    }

    fn stepper_msg_commands(&self, oid: u8, msgs: &[StepperMsg]) -> Vec<Command> {
        msgs.iter()
            .map(|msg| match msg {
                StepperMsg::Steps { mv, .. } => Command::new("queue_step")
                    .arg("oid", oid as i64)
                    .arg("interval", mv.interval as i64)
                    .arg("count", mv.count as i64)
                    .arg("add", mv.add as i64),
                StepperMsg::SetDir { dir, .. } => Command::new("set_next_step_dir")
                    .arg("oid", oid as i64)
                    .arg("dir", *dir as i64),
                StepperMsg::ResetClock { clock } => Command::new("reset_step_clock")
                    .arg("oid", oid as i64)
                    .arg("clock", (*clock & 0xffff_ffff) as i64),
            })
            .collect()
    }
}

fn format_stats(cmd: &Command) -> String {
    let count = cmd.get_int("count").unwrap_or(0);
    let sum = cmd.get_int("sum").unwrap_or(0);
    let sumsq = cmd.get_int("sumsq").unwrap_or(0);
    format!("count={count} sum={sum} sumsq={sumsq}")
}

/// Shared handle wiring a session into the stepper dispatch path.
#[derive(Clone)]
pub struct SessionHandle(pub Arc<Mutex<McuSession>>);

impl SessionHandle {
    pub fn new(session: McuSession) -> Self {
        SessionHandle(Arc::new(Mutex::new(session)))
    }
}

impl StepDispatch for SessionHandle {
    fn mcu_freq(&self) -> f64 {
        self.0.lock().clocksync.mcu_freq()
    }

    fn estimated_print_time(&self, host_time: f64) -> f64 {
        self.0.lock().clocksync.estimated_print_time(host_time)
    }

    fn lead_limit_clock(&self) -> u64 {
        self.0.lock().clocksync.host_time_to_clock(monotonic() + MAX_LEAD)
    }

    fn min_lead_clock(&self) -> u64 {
        self.0.lock().clocksync.host_time_to_clock(monotonic() + MIN_LEAD)
    }

    fn dispatch(&mut self, oid: u8, msgs: &[StepperMsg]) -> Result<(), StepError> {
        let session = self.0.lock();
        let commands = session.stepper_msg_commands(oid, msgs);
        for chunk in commands.chunks(DISPATCH_BATCH) {
            match session.serial.try_send(chunk) {
                Ok(true) => {}
                Ok(false) => return Err(StepError::Backpressure(session.name.clone())),
                Err(e) => {
                    warn!("mcu {}: step dispatch failed: {e}", session.name);
                    return Err(StepError::Backpressure(session.name.clone()));
                }
            }
        }
        Ok(())
    }
}
