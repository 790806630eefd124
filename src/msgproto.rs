// src/msgproto.rs
// Binary message protocol shared with the MCUs: framing, the variable
// length integer encoding, CRC, and the command dictionary that drives
// argument serialization. Commands are tagged values; the dictionary is the
// schema that says how to put them on the wire.

use std::collections::HashMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub const MESSAGE_MIN: usize = 5;
pub const MESSAGE_MAX: usize = 64;
pub const MESSAGE_HEADER_SIZE: usize = 2;
pub const MESSAGE_TRAILER_SIZE: usize = 3;
pub const MESSAGE_PAYLOAD_MAX: usize = MESSAGE_MAX - MESSAGE_MIN;
pub const MESSAGE_SEQ_MASK: u8 = 0x0f;
pub const MESSAGE_DEST: u8 = 0x10;
pub const MESSAGE_SYNC: u8 = 0x7e;

/// CRC-16/CCITT over the frame header and payload.
pub fn crc16_ccitt(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &b in buf {
        let mut data = b ^ (crc & 0xff) as u8;
        data ^= data << 4;
        crc = (((data as u16) << 8) | (crc >> 8)) ^ ((data >> 4) as u16) ^ ((data as u16) << 3);
    }
    crc
}

/// Encode a signed integer as the wire varint: 7 bits per byte, most
/// significant group first, high bit marks continuation.
pub fn encode_vlq(out: &mut Vec<u8>, value: i32) {
    let v = value as u32;
    if !(-(1 << 26)..(3 << 26)).contains(&value) {
        out.push(((v >> 28) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 19)..(3 << 19)).contains(&value) {
        out.push(((v >> 21) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 12)..(3 << 12)).contains(&value) {
        out.push(((v >> 14) & 0x7f) as u8 | 0x80);
    }
    if !(-(1 << 5)..(3 << 5)).contains(&value) {
        out.push(((v >> 7) & 0x7f) as u8 | 0x80);
    }
    out.push((v & 0x7f) as u8);
}

/// Decode one varint starting at `*pos`; advances `*pos` past it.
pub fn parse_vlq(data: &[u8], pos: &mut usize) -> Result<i32, ProtocolError> {
    let mut c = *data
        .get(*pos)
        .ok_or_else(|| ProtocolError::MalformedFrame("truncated varint".into()))?;
    *pos += 1;
    let mut v = (c & 0x7f) as u32;
    if (c & 0x60) == 0x60 {
        // Sign-extend a negative leading group.
        v |= !0x1f;
    }
    while c & 0x80 != 0 {
        c = *data
            .get(*pos)
            .ok_or_else(|| ProtocolError::MalformedFrame("truncated varint".into()))?;
        *pos += 1;
        v = (v << 7) | (c & 0x7f) as u32;
    }
    Ok(v as i32)
}

/// Wrap a payload of encoded commands into one wire frame.
pub fn encode_frame(seq: u64, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MESSAGE_PAYLOAD_MAX {
        return Err(ProtocolError::MalformedFrame(format!(
            "payload {} exceeds frame capacity",
            payload.len()
        )));
    }
    let len = MESSAGE_MIN + payload.len();
    let mut frame = Vec::with_capacity(len);
    frame.push(len as u8);
    frame.push(MESSAGE_DEST | (seq as u8 & MESSAGE_SEQ_MASK));
    frame.extend_from_slice(payload);
    let crc = crc16_ccitt(&frame);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xff) as u8);
    frame.push(MESSAGE_SYNC);
    Ok(frame)
}

/// One parsed frame: its 4-bit sequence and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u8,
    pub payload: Vec<u8>,
}

/// Try to parse one frame from the head of `data`. Returns the frame and
/// the bytes consumed, `Ok(None)` when more bytes are needed.
pub fn parse_frame(data: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    let len = data[0] as usize;
    if !(MESSAGE_MIN..=MESSAGE_MAX).contains(&len) {
        return Err(ProtocolError::MalformedFrame(format!("bad length byte {len}")));
    }
    if data.len() < len {
        return Ok(None);
    }
    let seq_byte = data[1];
    if seq_byte & !MESSAGE_SEQ_MASK != MESSAGE_DEST {
        return Err(ProtocolError::BadSequence(seq_byte));
    }
    let want = crc16_ccitt(&data[..len - MESSAGE_TRAILER_SIZE]);
    let got = ((data[len - 3] as u16) << 8) | data[len - 2] as u16;
    if got != want {
        return Err(ProtocolError::BadCrc { got, want });
    }
    if data[len - 1] != MESSAGE_SYNC {
        return Err(ProtocolError::MalformedFrame("missing sync byte".into()));
    }
    let frame = Frame {
        seq: seq_byte & MESSAGE_SEQ_MASK,
        payload: data[MESSAGE_HEADER_SIZE..len - MESSAGE_TRAILER_SIZE].to_vec(),
    };
    Ok(Some((frame, len)))
}

/// Wire argument types understood by the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    U32,
    I32,
    U16,
    I16,
    U8,
    String,
    Buffer,
}

impl ParamType {
    fn check_int(&self, v: i64) -> bool {
        match self {
            ParamType::U32 => (0..=u32::MAX as i64).contains(&v),
            ParamType::I32 => (i32::MIN as i64..=i32::MAX as i64).contains(&v),
            ParamType::U16 => (0..=u16::MAX as i64).contains(&v),
            ParamType::I16 => (i16::MIN as i64..=i16::MAX as i64).contains(&v),
            ParamType::U8 => (0..=u8::MAX as i64).contains(&v),
            ParamType::String | ParamType::Buffer => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub id: u16,
    pub params: Vec<(String, ParamType)>,
}

/// The negotiated id/signature tables, pinned for a session's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dictionary {
    #[serde(default)]
    pub version: String,
    pub commands: HashMap<String, CommandSpec>,
    pub responses: HashMap<String, CommandSpec>,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl Dictionary {
    /// Decompress and parse the `identify` payload.
    pub fn from_compressed(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| ProtocolError::Dictionary(format!("zlib: {e}")))?;
        let dict: Dictionary = serde_json::from_slice(&json)
            .map_err(|e| ProtocolError::Dictionary(format!("json: {e}")))?;
        dict.validate()?;
        Ok(dict)
    }

    pub fn to_compressed(&self) -> Result<Vec<u8>, ProtocolError> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;
        let json = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Dictionary(format!("json: {e}")))?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| ProtocolError::Dictionary(format!("zlib: {e}")))
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let mut seen = HashMap::new();
        for (name, spec) in self.commands.iter().chain(self.responses.iter()) {
            if let Some(other) = seen.insert(spec.id, name.clone()) {
                return Err(ProtocolError::Dictionary(format!(
                    "id {} claimed by both '{}' and '{}'",
                    spec.id, other, name
                )));
            }
        }
        Ok(())
    }

    pub fn constant_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }
}

/// A decoded or to-be-encoded argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Int(i64),
    Bytes(Vec<u8>),
}

/// A tagged command value; serialization is driven by the dictionary entry
/// matching `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<(String, ArgValue)>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Command {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: i64) -> Self {
        self.args.push((name.to_string(), ArgValue::Int(value)));
        self
    }

    pub fn arg_bytes(mut self, name: &str, value: &[u8]) -> Self {
        self.args.push((name.to_string(), ArgValue::Bytes(value.to_vec())));
        self
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.args.iter().find_map(|(n, v)| match v {
            ArgValue::Int(i) if n == name => Some(*i),
            _ => None,
        })
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.args.iter().find_map(|(n, v)| match v {
            ArgValue::Bytes(b) if n == name => Some(b.as_slice()),
            _ => None,
        })
    }
}

/// Encoder/decoder bound to one session's dictionary.
#[derive(Debug, Clone)]
pub struct MsgParser {
    dict: Dictionary,
    by_id: HashMap<u16, (String, CommandSpec)>,
}

impl MsgParser {
    pub fn new(dict: Dictionary) -> Result<Self, ProtocolError> {
        dict.validate()?;
        let mut by_id = HashMap::new();
        for (name, spec) in dict.commands.iter().chain(dict.responses.iter()) {
            by_id.insert(spec.id, (name.clone(), spec.clone()));
        }
        Ok(MsgParser { dict, by_id })
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn lookup_command(&self, name: &str) -> Result<&CommandSpec, ProtocolError> {
        self.dict
            .commands
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownCommand(name.to_string()))
    }

    pub fn encode_command(&self, cmd: &Command) -> Result<Vec<u8>, ProtocolError> {
        let spec = self.lookup_command(&cmd.name)?;
        let mut out = Vec::new();
        encode_vlq(&mut out, spec.id as i32);
        if cmd.args.len() != spec.params.len() {
            return Err(ProtocolError::ArgumentMismatch {
                cmd: cmd.name.clone(),
                reason: format!("want {} args, got {}", spec.params.len(), cmd.args.len()),
            });
        }
        for ((pname, ptype), (aname, avalue)) in spec.params.iter().zip(cmd.args.iter()) {
            if pname != aname {
                return Err(ProtocolError::ArgumentMismatch {
                    cmd: cmd.name.clone(),
                    reason: format!("want param '{pname}', got '{aname}'"),
                });
            }
            match (ptype, avalue) {
                (ParamType::String | ParamType::Buffer, ArgValue::Bytes(bytes)) => {
                    encode_vlq(&mut out, bytes.len() as i32);
                    out.extend_from_slice(bytes);
                }
                (_, ArgValue::Int(v)) if ptype.check_int(*v) => {
                    // Unsigned types ride the signed varint as wrapped
                    // 32-bit values.
                    encode_vlq(&mut out, *v as u32 as i32);
                }
                _ => {
                    return Err(ProtocolError::ArgumentMismatch {
                        cmd: cmd.name.clone(),
                        reason: format!("param '{pname}' out of range for {ptype:?}"),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Encode a batch of commands into a single frame payload.
    pub fn encode_payload(&self, cmds: &[Command]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        for cmd in cmds {
            out.extend(self.encode_command(cmd)?);
        }
        Ok(out)
    }

    /// Decode every command in a frame payload.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Vec<Command>, ProtocolError> {
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < payload.len() {
            let id = parse_vlq(payload, &mut pos)?;
            let id = u16::try_from(id).map_err(|_| ProtocolError::UnknownCommandId(id as u16))?;
            let (name, spec) = self
                .by_id
                .get(&id)
                .ok_or(ProtocolError::UnknownCommandId(id))?;
            let mut args = Vec::with_capacity(spec.params.len());
            for (pname, ptype) in &spec.params {
                let value = match ptype {
                    ParamType::String | ParamType::Buffer => {
                        let len = parse_vlq(payload, &mut pos)?;
                        let len = usize::try_from(len).map_err(|_| {
                            ProtocolError::MalformedFrame("negative byte length".into())
                        })?;
                        let end = pos + len;
                        if end > payload.len() {
                            return Err(ProtocolError::MalformedFrame("truncated bytes arg".into()));
                        }
                        let bytes = payload[pos..end].to_vec();
                        pos = end;
                        ArgValue::Bytes(bytes)
                    }
                    ParamType::U32 => ArgValue::Int(parse_vlq(payload, &mut pos)? as u32 as i64),
                    ParamType::I32 => ArgValue::Int(parse_vlq(payload, &mut pos)? as i64),
                    ParamType::U16 => {
                        let v = parse_vlq(payload, &mut pos)? as u32 as i64 & 0xffff;
                        ArgValue::Int(v)
                    }
                    ParamType::I16 => ArgValue::Int(parse_vlq(payload, &mut pos)? as i16 as i64),
                    ParamType::U8 => {
                        let v = parse_vlq(payload, &mut pos)? as u32 as i64 & 0xff;
                        ArgValue::Int(v)
                    }
                };
                args.push((pname.clone(), value));
            }
            out.push(Command {
                name: name.clone(),
                args,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_dict() -> Dictionary {
        let mut commands = HashMap::new();
        let mut responses = HashMap::new();
        commands.insert(
            "queue_step".to_string(),
            CommandSpec {
                id: 11,
                params: vec![
                    ("oid".to_string(), ParamType::U8),
                    ("interval".to_string(), ParamType::U32),
                    ("count".to_string(), ParamType::U16),
                    ("add".to_string(), ParamType::I16),
                ],
            },
        );
        commands.insert(
            "get_clock".to_string(),
            CommandSpec { id: 12, params: vec![] },
        );
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
        responses.insert(
            "clock".to_string(),
            CommandSpec {
                id: 80,
                params: vec![("clock".to_string(), ParamType::U32)],
            },
        );
        let mut config = HashMap::new();
        config.insert("CLOCK_FREQ".to_string(), serde_json::json!(16_000_000.0));
        Dictionary {
            version: "host-test".to_string(),
            commands,
            responses,
            config,
        }
    }

    #[test]
    fn vlq_single_byte_values() {
        for v in [-32i32, -1, 0, 1, 95] {
            let mut buf = Vec::new();
            encode_vlq(&mut buf, v);
            assert_eq!(buf.len(), 1, "value {v}");
            let mut pos = 0;
            assert_eq!(parse_vlq(&buf, &mut pos).unwrap(), v);
        }
    }

    #[test]
    fn vlq_boundary_values() {
        for v in [
            96,
            -33,
            (3 << 12) - 1,
            3 << 12,
            -(1 << 12),
            -(1 << 12) - 1,
            (3 << 26) - 1,
            3 << 26,
            i32::MAX,
            i32::MIN,
            1000,
            -1,
        ] {
            let mut buf = Vec::new();
            encode_vlq(&mut buf, v);
            let mut pos = 0;
            assert_eq!(parse_vlq(&buf, &mut pos).unwrap(), v, "value {v}");
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn vlq_u32_wraps_through_signed() {
        let v = 0xfffffffeu32;
        let mut buf = Vec::new();
        encode_vlq(&mut buf, v as i32);
        let mut pos = 0;
        assert_eq!(parse_vlq(&buf, &mut pos).unwrap() as u32, v);
    }

    #[test]
    fn crc_is_stable() {
        // Changing any byte changes the crc.
        let base = crc16_ccitt(&[0x07, 0x10, 0x01, 0x02]);
        assert_ne!(base, crc16_ccitt(&[0x07, 0x10, 0x01, 0x03]));
        assert_ne!(base, crc16_ccitt(&[0x07, 0x11, 0x01, 0x02]));
    }

    // Frame round trip with a queue_step and a get_clock.
    #[test]
    fn frame_round_trip_queue_step() {
        let parser = MsgParser::new(test_dict()).unwrap();
        let cmds = vec![
            Command::new("queue_step")
                .arg("oid", 3)
                .arg("interval", 1000)
                .arg("count", 5)
                .arg("add", -1),
            Command::new("get_clock"),
        ];
        let payload = parser.encode_payload(&cmds).unwrap();
        let frame = encode_frame(7, &payload).unwrap();
        assert_eq!(frame[0] as usize, frame.len());
        assert_eq!(frame[1], MESSAGE_DEST | 7);
        assert_eq!(*frame.last().unwrap(), MESSAGE_SYNC);

        let (parsed, consumed) = parse_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(parsed.seq, 7);
        let decoded = parser.decode_payload(&parsed.payload).unwrap();
        assert_eq!(decoded, cmds);
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let parser = MsgParser::new(test_dict()).unwrap();
        let payload = parser.encode_payload(&[Command::new("get_clock")]).unwrap();
        let mut frame = encode_frame(1, &payload).unwrap();
        frame[2] ^= 0xff;
        assert!(matches!(
            parse_frame(&frame),
            Err(ProtocolError::BadCrc { .. })
        ));
    }

    #[test]
    fn bad_sequence_nibble_is_rejected() {
        let payload = Vec::new();
        let mut frame = encode_frame(0, &payload).unwrap();
        frame[1] = 0x20; // wrong destination nibble
        let crc = crc16_ccitt(&frame[..2]);
        frame[2] = (crc >> 8) as u8;
        frame[3] = (crc & 0xff) as u8;
        assert!(matches!(
            parse_frame(&frame),
            Err(ProtocolError::BadSequence(0x20))
        ));
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let parser = MsgParser::new(test_dict()).unwrap();
        let payload = parser.encode_payload(&[Command::new("get_clock")]).unwrap();
        let frame = encode_frame(3, &payload).unwrap();
        assert!(parse_frame(&frame[..frame.len() - 2]).unwrap().is_none());
        assert!(parse_frame(&[]).unwrap().is_none());
    }

    #[test]
    fn unknown_command_id_is_reported() {
        let parser = MsgParser::new(test_dict()).unwrap();
        let mut payload = Vec::new();
        encode_vlq(&mut payload, 99);
        assert!(matches!(
            parser.decode_payload(&payload),
            Err(ProtocolError::UnknownCommandId(99))
        ));
    }

    #[test]
    fn argument_range_is_enforced() {
        let parser = MsgParser::new(test_dict()).unwrap();
        let cmd = Command::new("queue_step")
            .arg("oid", 300) // u8 overflow
            .arg("interval", 1000)
            .arg("count", 5)
            .arg("add", -1);
        assert!(matches!(
            parser.encode_command(&cmd),
            Err(ProtocolError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn dictionary_zlib_round_trip() {
        let dict = test_dict();
        let blob = dict.to_compressed().unwrap();
        let parsed = Dictionary::from_compressed(&blob).unwrap();
        assert_eq!(parsed.commands["queue_step"], dict.commands["queue_step"]);
        assert_eq!(parsed.constant_f64("CLOCK_FREQ"), Some(16_000_000.0));
    }

    #[test]
    fn dictionary_duplicate_id_is_fatal() {
        let mut dict = test_dict();
        dict.responses.insert(
            "stats".to_string(),
            CommandSpec { id: 11, params: vec![] },
        );
        assert!(matches!(
            MsgParser::new(dict),
            Err(ProtocolError::Dictionary(_))
        ));
    }

    #[test]
    fn buffer_args_round_trip() {
        let mut dict = test_dict();
        dict.responses.insert(
            "identify_response".to_string(),
            CommandSpec {
                id: 81,
                params: vec![
                    ("offset".to_string(), ParamType::U32),
                    ("data".to_string(), ParamType::Buffer),
                ],
            },
        );
        let parser = MsgParser::new(dict).unwrap();
        // Responses decode; encode via the command table only, so build the
        // payload by hand.
        let mut payload = Vec::new();
        encode_vlq(&mut payload, 81);
        encode_vlq(&mut payload, 64);
        let blob = [0xde, 0xad, 0xbe, 0xef];
        encode_vlq(&mut payload, blob.len() as i32);
        payload.extend_from_slice(&blob);
        let decoded = parser.decode_payload(&payload).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].get_int("offset"), Some(64));
        assert_eq!(decoded[0].get_bytes("data"), Some(&blob[..]));
    }

    proptest! {
        // Every dictionary-valid command must round-trip.
        #[test]
        fn vlq_round_trips(v in any::<i32>()) {
            let mut buf = Vec::new();
            encode_vlq(&mut buf, v);
            let mut pos = 0;
            prop_assert_eq!(parse_vlq(&buf, &mut pos).unwrap(), v);
            prop_assert_eq!(pos, buf.len());
        }

        #[test]
        fn queue_step_round_trips(
            oid in 0i64..=255,
            interval in 0i64..=u32::MAX as i64,
            count in 0i64..=65535,
            add in i16::MIN as i64..=i16::MAX as i64,
            seq in 0u64..=255,
        ) {
            let parser = MsgParser::new(test_dict()).unwrap();
            let cmds = vec![Command::new("queue_step")
                .arg("oid", oid)
                .arg("interval", interval)
                .arg("count", count)
                .arg("add", add)];
            let payload = parser.encode_payload(&cmds).unwrap();
            let frame = encode_frame(seq, &payload).unwrap();
            let (parsed, _) = parse_frame(&frame).unwrap().unwrap();
            prop_assert_eq!(parsed.seq as u64, seq & 0x0f);
            prop_assert_eq!(parser.decode_payload(&parsed.payload).unwrap(), cmds);
        }
    }
}
