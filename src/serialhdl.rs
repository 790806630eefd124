// src/serialhdl.rs
// Reliable, sequenced command channel to one MCU. The worker thread owns
// the transport handle; the control thread talks to it through bounded
// queues only. Frames carry a 4-bit sequence; the worker keeps full 64-bit
// counters and extends incoming sequences against them.
//
// Retransmission is go-back-n over a bounded window: the receiver's
// sequence field acks everything up to it, a duplicate ack with frames in
// flight is treated as a nak, and a retransmit timer runs at
// srtt + 4*rttvar (25 ms floor, Karn's rule, exponential backoff).

use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::msgproto::{
    encode_frame, parse_frame, Command, MsgParser, MESSAGE_PAYLOAD_MAX, MESSAGE_SYNC,
};
use crate::reactor::{monotonic, ShutdownLatch};

/// Max unacknowledged frames in flight.
const WINDOW: usize = 16;
/// Protocol errors tolerated per session before going fatal; also the cap
/// on retransmissions of a single frame.
const RETRY_MAX: u32 = 5;

const RTO_MIN: f64 = 0.025;
const RTO_MAX: f64 = 1.0;
const RTO_INIT: f64 = 0.250;

/// Bounded queue depths (control thread <-> worker).
const OUTBOUND_DEPTH: usize = 64;
const INBOUND_DEPTH: usize = 256;

/// Byte transport owned by the session worker. `read` returns Ok(0) on
/// timeout; `Err(TransportClosed)` ends the session.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;
}

/// In-memory duplex transport for tests and the simulated MCU.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    staged: Vec<u8>,
}

impl LoopbackTransport {
    /// Two connected ends.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (atx, arx) = crossbeam_channel::unbounded();
        let (btx, brx) = crossbeam_channel::unbounded();
        (
            LoopbackTransport { tx: atx, rx: brx, staged: Vec::new() },
            LoopbackTransport { tx: btx, rx: arx, staged: Vec::new() },
        )
    }
}

impl Transport for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        if self.staged.is_empty() {
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => self.staged = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::TransportClosed),
            }
        }
        let n = self.staged.len().min(buf.len());
        buf[..n].copy_from_slice(&self.staged[..n]);
        self.staged.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| ProtocolError::TransportClosed)
    }
}

/// Stream transport to an MCU bridge over TCP.
pub struct TcpTransport {
    stream: std::net::TcpStream,
}

impl TcpTransport {
    pub fn connect(address: &str) -> Result<Self, ProtocolError> {
        let stream = std::net::TcpStream::connect(address)
            .map_err(|e| ProtocolError::MalformedFrame(format!("connect {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ProtocolError::MalformedFrame(format!("nodelay: {e}")))?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        use std::io::Read;
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|_| ProtocolError::TransportClosed)?;
        match self.stream.read(buf) {
            Ok(0) => Err(ProtocolError::TransportClosed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(0)
            }
            Err(_) => Err(ProtocolError::TransportClosed),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        use std::io::Write;
        self.stream
            .write_all(data)
            .map_err(|_| ProtocolError::TransportClosed)
    }
}

/// A decoded message from the MCU plus its timing metadata.
#[derive(Debug, Clone)]
pub struct InboundMsg {
    pub command: Command,
    /// Host time the oldest in-flight frame was handed to the transport
    /// when this message arrived (upper bound on the request send time).
    pub sent_time: f64,
    pub receive_time: f64,
}

#[derive(Debug)]
pub enum SessionEvent {
    Msg(InboundMsg),
    Fatal(ProtocolError),
}

struct InflightFrame {
    seq: u64,
    data: Vec<u8>,
    first_sent: f64,
    last_sent: f64,
    retries: u32,
}

/// Jacobson/Karels estimator with Karn's rule.
struct RtoEstimator {
    srtt: f64,
    rttvar: f64,
    rto: f64,
}

impl RtoEstimator {
    fn new() -> Self {
        RtoEstimator { srtt: 0.0, rttvar: 0.0, rto: RTO_INIT }
    }

    fn sample(&mut self, rtt: f64) {
        if self.srtt == 0.0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2.0;
        } else {
            let err = rtt - self.srtt;
            self.srtt += err / 8.0;
            self.rttvar += (err.abs() - self.rttvar) / 4.0;
        }
        self.rto = (self.srtt + 4.0 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(RTO_MAX);
    }
}

struct Worker {
    name: String,
    transport: Box<dyn Transport>,
    parser: Arc<Mutex<MsgParser>>,
    outbound: Receiver<Vec<u8>>,
    inbound: Sender<SessionEvent>,
    shutdown: ShutdownLatch,

    send_seq: u64,
    receive_seq: u64,
    last_ack_seq: u64,
    inflight: VecDeque<InflightFrame>,
    pending_payloads: VecDeque<Vec<u8>>,
    rto: RtoEstimator,
    rx_buf: Vec<u8>,
    error_count: u32,
}

impl Worker {
    fn run(mut self) {
        info!("serial {}: worker started", self.name);
        let reason = loop {
            if self.shutdown.is_tripped() && self.inflight.is_empty() && self.pending_payloads.is_empty() {
                break None;
            }
            if let Err(e) = self.pump_outbound() {
                break Some(e);
            }
            if let Err(e) = self.pump_inbound() {
                break Some(e);
            }
            if let Err(e) = self.check_retransmit() {
                break Some(e);
            }
        };
        match reason {
            None => info!("serial {}: worker exiting cleanly", self.name),
            Some(e) => {
                error!("serial {}: fatal: {e}", self.name);
                let _ = self.inbound.send(SessionEvent::Fatal(e));
                self.shutdown.trip();
            }
        }
    }

    fn pump_outbound(&mut self) -> Result<(), ProtocolError> {
        while let Ok(payload) = self.outbound.try_recv() {
            self.pending_payloads.push_back(payload);
        }
        while self.inflight.len() < WINDOW {
            let payload = match self.pending_payloads.pop_front() {
                Some(p) => p,
                None => break,
            };
            self.send_seq += 1;
            let seq = self.send_seq;
            let data = encode_frame(seq, &payload)?;
            self.transport.write_all(&data)?;
            let now = monotonic();
            debug!("serial {}: sent seq {} ({} bytes)", self.name, seq, data.len());
            self.inflight.push_back(InflightFrame {
                seq,
                data,
                first_sent: now,
                last_sent: now,
                retries: 0,
            });
        }
        Ok(())
    }

    fn pump_inbound(&mut self) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; 256];
        let n = self.transport.read(&mut chunk, Duration::from_millis(5))?;
        if n > 0 {
            self.rx_buf.extend_from_slice(&chunk[..n]);
        }
        loop {
            match parse_frame(&self.rx_buf) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    self.rx_buf.drain(..consumed);
                    self.handle_frame(frame.seq, &frame.payload)?;
                }
                Err(e) => {
                    self.note_error(e)?;
                    self.resync();
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, seq4: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let receive_time = monotonic();
        // Extend the 4-bit wire sequence against the running counter.
        let mut rseq = (self.receive_seq & !0x0f) | seq4 as u64;
        if rseq < self.receive_seq {
            rseq += 0x10;
        }
        if rseq > self.send_seq {
            // Acking frames never sent.
            self.note_error(ProtocolError::BadSequence(seq4))?;
            return Ok(());
        }
        self.receive_seq = rseq;

        // Ack processing: everything at or below rseq is delivered.
        let mut newly_acked = false;
        while let Some(front) = self.inflight.front() {
            if front.seq > rseq {
                break;
            }
            if let Some(frame) = self.inflight.pop_front() {
                newly_acked = true;
                // Karn's rule: only un-retransmitted frames feed the
                // estimator.
                if frame.retries == 0 {
                    self.rto.sample(receive_time - frame.first_sent);
                }
            }
        }
        if !newly_acked && rseq == self.last_ack_seq && !self.inflight.is_empty() {
            // Duplicate ack with data in flight: nak, retransmit now.
            debug!("serial {}: duplicate ack {}, retransmitting", self.name, rseq);
            self.retransmit_all()?;
        }
        self.last_ack_seq = rseq;

        if payload.is_empty() {
            return Ok(());
        }
        let sent_time = self
            .inflight
            .front()
            .map(|f| f.last_sent)
            .unwrap_or(receive_time);
        let commands = {
            let parser = self.parser.lock();
            parser.decode_payload(payload)
        };
        match commands {
            Ok(commands) => {
                for command in commands {
                    let msg = SessionEvent::Msg(InboundMsg {
                        command,
                        sent_time,
                        receive_time,
                    });
                    if self.inbound.try_send(msg).is_err() {
                        warn!("serial {}: inbound queue full, dropping message", self.name);
                    }
                }
            }
            Err(e) => self.note_error(e)?,
        }
        Ok(())
    }

    fn check_retransmit(&mut self) -> Result<(), ProtocolError> {
        let now = monotonic();
        let expired = self
            .inflight
            .front()
            .is_some_and(|f| now - f.last_sent > self.rto.rto);
        if expired {
            self.rto.backoff();
            self.retransmit_all()?;
        }
        Ok(())
    }

    fn retransmit_all(&mut self) -> Result<(), ProtocolError> {
        let now = monotonic();
        for frame in self.inflight.iter_mut() {
            frame.retries += 1;
            if frame.retries > RETRY_MAX {
                return Err(ProtocolError::ResponseTimeout(format!(
                    "frame seq {} unacked after {} retries",
                    frame.seq, RETRY_MAX
                )));
            }
            frame.last_sent = now;
        }
        for data in self.inflight.iter().map(|f| f.data.clone()).collect::<Vec<_>>() {
            self.transport.write_all(&data)?;
        }
        Ok(())
    }

    fn note_error(&mut self, e: ProtocolError) -> Result<(), ProtocolError> {
        warn!("serial {}: protocol error: {e}", self.name);
        self.error_count += 1;
        if self.error_count > RETRY_MAX {
            return Err(e);
        }
        Ok(())
    }

    /// Skip to the byte after the next sync marker.
    fn resync(&mut self) {
        match self.rx_buf.iter().position(|&b| b == MESSAGE_SYNC) {
            Some(pos) => {
                self.rx_buf.drain(..=pos);
            }
            None => self.rx_buf.clear(),
        }
    }
}

/// Control-thread handle to one session's wire link.
pub struct SerialHdl {
    name: String,
    parser: Arc<Mutex<MsgParser>>,
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<SessionEvent>,
    /// Messages received while waiting for a specific response.
    deferred: VecDeque<InboundMsg>,
    worker: Option<JoinHandle<()>>,
}

impl SerialHdl {
    /// Spawn the worker thread that owns `transport`.
    pub fn connect(
        name: &str,
        transport: Box<dyn Transport>,
        parser: MsgParser,
        shutdown: ShutdownLatch,
    ) -> Self {
        let parser = Arc::new(Mutex::new(parser));
        let (out_tx, out_rx) = bounded(OUTBOUND_DEPTH);
        let (in_tx, in_rx) = bounded(INBOUND_DEPTH);
        let worker = Worker {
            name: name.to_string(),
            transport,
            parser: Arc::clone(&parser),
            outbound: out_rx,
            inbound: in_tx,
            shutdown,
            send_seq: 0,
            receive_seq: 0,
            last_ack_seq: 0,
            inflight: VecDeque::new(),
            pending_payloads: VecDeque::new(),
            rto: RtoEstimator::new(),
            rx_buf: Vec::new(),
            error_count: 0,
        };
        let handle = std::thread::Builder::new()
            .name(format!("serial-{name}"))
            .spawn(move || worker.run())
            .ok();
        SerialHdl {
            name: name.to_string(),
            parser,
            outbound: out_tx,
            inbound: in_rx,
            deferred: VecDeque::new(),
            worker: handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Swap in the negotiated dictionary parser.
    pub fn set_msgparser(&self, parser: MsgParser) {
        *self.parser.lock() = parser;
    }

    pub fn with_parser<R>(&self, f: impl FnOnce(&MsgParser) -> R) -> R {
        f(&self.parser.lock())
    }

    /// Greedily pack encoded commands into frame-sized payloads.
    fn pack(&self, cmds: &[Command]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let parser = self.parser.lock();
        let mut payloads = Vec::new();
        let mut current = Vec::new();
        for cmd in cmds {
            let encoded = parser.encode_command(cmd)?;
            if encoded.len() > MESSAGE_PAYLOAD_MAX {
                return Err(ProtocolError::MalformedFrame(format!(
                    "command '{}' exceeds frame capacity",
                    cmd.name
                )));
            }
            if current.len() + encoded.len() > MESSAGE_PAYLOAD_MAX {
                payloads.push(std::mem::take(&mut current));
            }
            current.extend(encoded);
        }
        if !current.is_empty() {
            payloads.push(current);
        }
        Ok(payloads)
    }

    /// Queue commands for transmission; blocks briefly if the outbound
    /// queue is saturated.
    pub fn send(&self, cmds: &[Command]) -> Result<(), ProtocolError> {
        for payload in self.pack(cmds)? {
            self.outbound
                .send_timeout(payload, Duration::from_secs(1))
                .map_err(|_| ProtocolError::TransportClosed)?;
        }
        Ok(())
    }

    /// Non-blocking variant for the step dispatch path; a full queue is
    /// reported so the caller can backpressure the planner. All-or-nothing:
    /// nothing is queued unless every frame fits.
    pub fn try_send(&self, cmds: &[Command]) -> Result<bool, ProtocolError> {
        let payloads = self.pack(cmds)?;
        if self.outbound.len() + payloads.len() > self.outbound.capacity().unwrap_or(usize::MAX) {
            return Ok(false);
        }
        for payload in payloads {
            match self.outbound.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Ok(false),
                Err(TrySendError::Disconnected(_)) => return Err(ProtocolError::TransportClosed),
            }
        }
        Ok(true)
    }

    /// Send `cmd` and block until a response named `response` arrives.
    /// Other messages received meanwhile are deferred for `poll`.
    pub fn send_with_response(
        &mut self,
        cmd: &Command,
        response: &str,
        timeout: f64,
    ) -> Result<InboundMsg, ProtocolError> {
        let sent_time = monotonic();
        self.send(std::slice::from_ref(cmd))?;
        let deadline = sent_time + timeout;
        loop {
            let remaining = deadline - monotonic();
            if remaining <= 0.0 {
                return Err(ProtocolError::ResponseTimeout(response.to_string()));
            }
            match self.inbound.recv_timeout(Duration::from_secs_f64(remaining)) {
                Ok(SessionEvent::Msg(mut msg)) => {
                    if msg.command.name == response {
                        // The enqueue time is a guaranteed lower bound on
                        // the request's wire send time; the true MCU read
                        // lies inside [sent_time, receive_time].
                        msg.sent_time = sent_time;
                        return Ok(msg);
                    }
                    self.deferred.push_back(msg);
                }
                Ok(SessionEvent::Fatal(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ProtocolError::ResponseTimeout(response.to_string()))
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::TransportClosed),
            }
        }
    }

    /// Drain everything received so far (deferred first), without blocking.
    pub fn poll(&mut self) -> Result<Vec<InboundMsg>, ProtocolError> {
        let mut out: Vec<InboundMsg> = self.deferred.drain(..).collect();
        loop {
            match self.inbound.try_recv() {
                Ok(SessionEvent::Msg(msg)) => out.push(msg),
                Ok(SessionEvent::Fatal(e)) => return Err(e),
                Err(_) => break,
            }
        }
        Ok(out)
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgproto::{crc16_ccitt, CommandSpec, Dictionary, ParamType};
    use std::collections::HashMap;

    fn dict() -> Dictionary {
        let mut commands = HashMap::new();
        let mut responses = HashMap::new();
        commands.insert("get_clock".to_string(), CommandSpec { id: 12, params: vec![] });
        responses.insert(
            "clock".to_string(),
            CommandSpec {
                id: 80,
                params: vec![("clock".to_string(), ParamType::U32)],
            },
        );
        Dictionary {
            version: "test".into(),
            commands,
            responses,
            config: HashMap::new(),
        }
    }

    /// Minimal scripted MCU end: acks every frame and answers get_clock.
    fn fake_mcu(mut transport: LoopbackTransport, parser: MsgParser, drop_first_n: usize) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut rx = Vec::new();
            let mut seen = 0usize;
            let mut clock = 1000u32;
            loop {
                let mut chunk = [0u8; 256];
                let n = match transport.read(&mut chunk, Duration::from_millis(50)) {
                    Ok(n) => n,
                    Err(_) => return,
                };
                if n == 0 {
                    continue;
                }
                rx.extend_from_slice(&chunk[..n]);
                while let Ok(Some((frame, consumed))) = parse_frame(&rx) {
                    rx.drain(..consumed);
                    seen += 1;
                    if seen <= drop_first_n {
                        continue; // simulate loss: no ack, no reply
                    }
                    let cmds = parser.decode_payload(&frame.payload).unwrap_or_default();
                    let mut reply = Vec::new();
                    for cmd in &cmds {
                        if cmd.name == "get_clock" {
                            clock += 5000;
                            let mut payload = Vec::new();
                            crate::msgproto::encode_vlq(&mut payload, 80);
                            crate::msgproto::encode_vlq(&mut payload, clock as i32);
                            reply.extend(payload);
                        }
                    }
                    let out = encode_frame(frame.seq as u64, &reply).unwrap();
                    if transport.write_all(&out).is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn connect_pair(drop_first_n: usize) -> (SerialHdl, JoinHandle<()>, ShutdownLatch) {
        let (host_end, mcu_end) = LoopbackTransport::pair();
        let parser = MsgParser::new(dict()).unwrap();
        let mcu = fake_mcu(mcu_end, parser.clone(), drop_first_n);
        let latch = ShutdownLatch::new();
        let hdl = SerialHdl::connect("mcu", Box::new(host_end), parser, latch.clone());
        (hdl, mcu, latch)
    }

    #[test]
    fn request_response_round_trip() {
        let (mut hdl, _mcu, latch) = connect_pair(0);
        let msg = hdl
            .send_with_response(&Command::new("get_clock"), "clock", 2.0)
            .unwrap();
        assert_eq!(msg.command.get_int("clock"), Some(6000));
        assert!(msg.receive_time >= msg.sent_time);
        latch.trip();
        hdl.join();
    }

    // The queued command stream reparses identically on the
    // other end (the fake mcu decodes with the same dictionary and echoes a
    // response per command).
    #[test]
    fn multiple_requests_stay_ordered() {
        let (mut hdl, _mcu, latch) = connect_pair(0);
        let mut clocks = Vec::new();
        for _ in 0..5 {
            let msg = hdl
                .send_with_response(&Command::new("get_clock"), "clock", 2.0)
                .unwrap();
            clocks.push(msg.command.get_int("clock").unwrap());
        }
        // Monotone replies prove in-order delivery.
        for pair in clocks.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        latch.trip();
        hdl.join();
    }

    #[test]
    fn lost_frame_is_retransmitted() {
        // First frame dropped by the MCU; the RTO path must recover.
        let (mut hdl, _mcu, latch) = connect_pair(1);
        let msg = hdl
            .send_with_response(&Command::new("get_clock"), "clock", 5.0)
            .unwrap();
        assert!(msg.command.get_int("clock").is_some());
        latch.trip();
        hdl.join();
    }

    #[test]
    fn garbage_on_wire_resyncs() {
        let (host_end, mut mcu_end) = LoopbackTransport::pair();
        let parser = MsgParser::new(dict()).unwrap();
        let latch = ShutdownLatch::new();
        let mut hdl = SerialHdl::connect("mcu", Box::new(host_end), parser.clone(), latch.clone());

        // Feed garbage, then a valid ack+response for the first request.
        mcu_end.write_all(&[0x00, 0xff, 0x13, MESSAGE_SYNC]).unwrap();
        std::thread::spawn(move || {
            let mut rx = Vec::new();
            loop {
                let mut chunk = [0u8; 128];
                let n = match mcu_end.read(&mut chunk, Duration::from_millis(50)) {
                    Ok(n) => n,
                    Err(_) => return,
                };
                rx.extend_from_slice(&chunk[..n]);
                if let Ok(Some((frame, consumed))) = parse_frame(&rx) {
                    rx.drain(..consumed);
                    let mut payload = Vec::new();
                    crate::msgproto::encode_vlq(&mut payload, 80);
                    crate::msgproto::encode_vlq(&mut payload, 777);
                    let out = encode_frame(frame.seq as u64, &payload).unwrap();
                    let _ = mcu_end.write_all(&out);
                    return;
                }
            }
        });
        let msg = hdl
            .send_with_response(&Command::new("get_clock"), "clock", 2.0)
            .unwrap();
        assert_eq!(msg.command.get_int("clock"), Some(777));
        latch.trip();
        hdl.join();
    }

    #[test]
    fn persistent_corruption_goes_fatal() {
        let (host_end, mut mcu_end) = LoopbackTransport::pair();
        let parser = MsgParser::new(dict()).unwrap();
        let latch = ShutdownLatch::new();
        let mut hdl = SerialHdl::connect("mcu", Box::new(host_end), parser, latch.clone());

        // A stream of corrupt frames exhausts the error budget.
        for _ in 0..10 {
            let mut bad = encode_frame(1, &[]).unwrap();
            let len = bad.len();
            bad[len - 3] ^= 0xff; // break the crc
            mcu_end.write_all(&bad).unwrap();
        }
        let err = hdl
            .send_with_response(&Command::new("get_clock"), "clock", 2.0)
            .unwrap_err();
        // Either the fatal event or the response timeout surfaces first;
        // the latch must trip regardless.
        let _ = err;
        for _ in 0..100 {
            if latch.is_tripped() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(latch.is_tripped());
        hdl.join();
    }

    #[test]
    fn rto_estimator_tracks_and_floors() {
        let mut est = RtoEstimator::new();
        for _ in 0..32 {
            est.sample(0.001);
        }
        // 1ms rtt floors at 25ms.
        assert!((est.rto - RTO_MIN).abs() < 1e-9);
        est.sample(0.2);
        assert!(est.rto > RTO_MIN);
        est.backoff();
        est.backoff();
        est.backoff();
        est.backoff();
        assert!(est.rto <= RTO_MAX);
    }

    #[test]
    fn frame_crc_field_layout() {
        // The crc bytes cover header + payload, big-endian on the wire.
        let frame = encode_frame(2, &[0x42]).unwrap();
        let want = crc16_ccitt(&frame[..frame.len() - 3]);
        let got = ((frame[frame.len() - 3] as u16) << 8) | frame[frame.len() - 2] as u16;
        assert_eq!(got, want);
    }
}
