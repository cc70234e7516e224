/// Request/response packet for the storage node protocol.
///
/// A packet is a 58-byte big-endian header followed by an optional result
/// message and an optional payload. The same structure travels in both
/// directions: a handler mutates the request in place and writes it back.
///
/// Header layout:
///
/// | off | size | field                                  |
/// |-----|------|----------------------------------------|
/// | 0   | 1    | magic                                  |
/// | 1   | 1    | opcode                                 |
/// | 2   | 1    | result code                            |
/// | 3   | 1    | flags                                  |
/// | 4   | 4    | CRC-32 (IEEE) of payload               |
/// | 8   | 4    | payload size                           |
/// | 12  | 4    | result message length                  |
/// | 16  | 8    | partition ID                           |
/// | 24  | 8    | extent ID                              |
/// | 32  | 8    | extent offset                          |
/// | 40  | 8    | request ID                             |
/// | 48  | 8    | start time (unix nanos)                |
/// | 56  | 2    | reserved                               |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{FLAG_FORWARDED, PACKET_HEADER_SIZE, PROTO_MAGIC};
use crate::error::{EcError, EcResult};

/// Operation selector carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    CreateExtent,
    Write,
    Read,
    ExtentInfo,
    CreateEcPartition,
    DeleteEcPartition,
}

impl Opcode {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::CreateExtent => 0x01,
            Self::Write => 0x03,
            Self::Read => 0x04,
            Self::ExtentInfo => 0x0B,
            Self::CreateEcPartition => 0x60,
            Self::DeleteEcPartition => 0x61,
        }
    }

    /// Whether this opcode addresses an existing partition.
    pub const fn is_partition_scoped(self) -> bool {
        !matches!(self, Self::CreateEcPartition | Self::DeleteEcPartition)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = EcError;

    fn try_from(raw: u8) -> EcResult<Self> {
        match raw {
            0x01 => Ok(Self::CreateExtent),
            0x03 => Ok(Self::Write),
            0x04 => Ok(Self::Read),
            0x0B => Ok(Self::ExtentInfo),
            0x60 => Ok(Self::CreateEcPartition),
            0x61 => Ok(Self::DeleteEcPartition),
            _ => Err(EcError::NoSupport),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateExtent => "CreateExtent",
            Self::Write => "Write",
            Self::Read => "Read",
            Self::ExtentInfo => "ExtentInfo",
            Self::CreateEcPartition => "CreateEcPartition",
            Self::DeleteEcPartition => "DeleteEcPartition",
        };
        f.write_str(name)
    }
}

/// Outcome of a request as carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// No handler has completed yet.
    Init,
    Ok,
    Err(EcError),
}

impl ResultCode {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Init => 0x00,
            Self::Ok => 0xF0,
            Self::Err(e) => e.to_code(),
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::Init,
            0xF0 => Self::Ok,
            other => match EcError::from_code(other) {
                Some(e) => Self::Err(e),
                None => Self::Init,
            },
        }
    }
}

/// Generate a request ID.
///
/// The high half is the process start time in seconds, the low half a
/// per-process counter, so IDs from different nodes rarely collide.
pub fn generate_request_id() -> u64 {
    static BASE: OnceLock<u64> = OnceLock::new();
    static NEXT: AtomicU64 = AtomicU64::new(1);

    let base = *BASE.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() << 32)
            .unwrap_or(0)
    });
    base | (NEXT.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF)
}

/// Current time as unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Compute the CRC-32 (IEEE) of a buffer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// A protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: u8,
    /// Raw opcode. Kept raw so unknown opcodes can still be answered.
    pub opcode: u8,
    pub result_code: ResultCode,
    pub flags: u8,
    pub crc: u32,
    /// Payload length, or the requested length for a read request.
    pub size: u32,
    pub partition_id: u64,
    pub extent_id: u64,
    pub extent_offset: u64,
    pub req_id: u64,
    pub start_time: i64,
    pub result_msg: String,
    pub data: Vec<u8>,
}

impl Packet {
    /// Build a fresh request packet.
    pub fn new_request(opcode: Opcode, partition_id: u64, extent_id: u64) -> Self {
        Self {
            magic: PROTO_MAGIC,
            opcode: opcode.to_u8(),
            result_code: ResultCode::Init,
            flags: 0,
            crc: 0,
            size: 0,
            partition_id,
            extent_id,
            extent_offset: 0,
            req_id: generate_request_id(),
            start_time: now_nanos(),
            result_msg: String::new(),
            data: Vec::new(),
        }
    }

    /// Attach a payload, setting size and CRC to match.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.set_data(data);
        self
    }

    /// Set the extent offset addressed by this packet.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.extent_offset = offset;
        self
    }

    /// Typed opcode, or `NoSupport` if the raw value is unknown.
    pub fn op(&self) -> EcResult<Opcode> {
        Opcode::try_from(self.opcode)
    }

    pub fn is_forwarded(&self) -> bool {
        self.flags & FLAG_FORWARDED != 0
    }

    /// A read request carries no payload; its size is the requested length.
    pub fn is_read_request(&self) -> bool {
        self.opcode == Opcode::Read.to_u8() && self.result_code == ResultCode::Init
    }

    /// Number of payload bytes that follow the header on the wire.
    pub fn wire_payload_len(&self) -> usize {
        if self.is_read_request() {
            0
        } else {
            self.size as usize
        }
    }

    /// Replace the payload and recompute size and CRC.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.size = data.len() as u32;
        self.crc = crc32(&data);
        self.data = data;
    }

    /// Mark the packet as successfully handled. The request payload is
    /// not echoed back.
    pub fn pack_ok(&mut self) {
        self.data.clear();
        self.size = 0;
        self.crc = 0;
        self.result_code = ResultCode::Ok;
        self.result_msg.clear();
    }

    /// Mark the packet as successfully handled with a response payload.
    pub fn pack_ok_with_data(&mut self, data: Vec<u8>) {
        self.set_data(data);
        self.result_code = ResultCode::Ok;
        self.result_msg.clear();
    }

    /// Mark the packet as failed. Any request payload is dropped so the
    /// response does not echo it back.
    pub fn pack_err(&mut self, err: EcError, msg: impl Into<String>) {
        self.result_code = ResultCode::Err(err);
        self.result_msg = msg.into();
        self.data.clear();
        self.size = 0;
        self.crc = 0;
    }

    pub fn is_ok(&self) -> bool {
        self.result_code == ResultCode::Ok
    }

    /// The handler outcome as a `Result`.
    pub fn result(&self) -> EcResult<()> {
        match self.result_code {
            ResultCode::Ok => Ok(()),
            ResultCode::Init => Err(EcError::Internal),
            ResultCode::Err(e) => Err(e),
        }
    }

    /// Human-readable result message, or the error's description when
    /// no message was set.
    pub fn get_result_msg(&self) -> String {
        if !self.result_msg.is_empty() {
            return self.result_msg.clone();
        }
        match self.result_code {
            ResultCode::Init => "init".to_string(),
            ResultCode::Ok => "ok".to_string(),
            ResultCode::Err(e) => e.to_string(),
        }
    }

    /// Copy this request for a follower: same operation, fresh request ID,
    /// marked as forwarded, result reset.
    pub fn forward_copy(&self) -> Self {
        Self {
            magic: PROTO_MAGIC,
            opcode: self.opcode,
            result_code: ResultCode::Init,
            flags: self.flags | FLAG_FORWARDED,
            crc: self.crc,
            size: self.size,
            partition_id: self.partition_id,
            extent_id: self.extent_id,
            extent_offset: self.extent_offset,
            req_id: generate_request_id(),
            start_time: now_nanos(),
            result_msg: String::new(),
            data: self.data.clone(),
        }
    }

    /// Encode the fixed header.
    pub fn encode_header(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut h = [0u8; PACKET_HEADER_SIZE];
        h[0] = self.magic;
        h[1] = self.opcode;
        h[2] = self.result_code.to_u8();
        h[3] = self.flags;
        h[4..8].copy_from_slice(&self.crc.to_be_bytes());
        h[8..12].copy_from_slice(&self.size.to_be_bytes());
        h[12..16].copy_from_slice(&(self.result_msg.len() as u32).to_be_bytes());
        h[16..24].copy_from_slice(&self.partition_id.to_be_bytes());
        h[24..32].copy_from_slice(&self.extent_id.to_be_bytes());
        h[32..40].copy_from_slice(&self.extent_offset.to_be_bytes());
        h[40..48].copy_from_slice(&self.req_id.to_be_bytes());
        h[48..56].copy_from_slice(&self.start_time.to_be_bytes());
        h
    }

    /// Encode the whole packet: header, result message, payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.wire_payload_len().min(self.data.len());
        let mut buf =
            Vec::with_capacity(PACKET_HEADER_SIZE + self.result_msg.len() + payload_len);
        buf.extend_from_slice(&self.encode_header());
        buf.extend_from_slice(self.result_msg.as_bytes());
        buf.extend_from_slice(&self.data[..payload_len]);
        buf
    }

    /// Decode a header. Returns the packet (without message or payload)
    /// and the length of the result message that follows.
    ///
    /// The magic is checked before anything else is interpreted.
    pub fn decode_header(h: &[u8]) -> EcResult<(Self, usize)> {
        if h.len() < PACKET_HEADER_SIZE {
            return Err(EcError::MalformedPacket);
        }
        if h[0] != PROTO_MAGIC {
            return Err(EcError::MalformedPacket);
        }

        let be_u32 = |off: usize| u32::from_be_bytes([h[off], h[off + 1], h[off + 2], h[off + 3]]);
        let be_u64 = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&h[off..off + 8]);
            u64::from_be_bytes(b)
        };

        let packet = Self {
            magic: h[0],
            opcode: h[1],
            result_code: ResultCode::from_u8(h[2]),
            flags: h[3],
            crc: be_u32(4),
            size: be_u32(8),
            partition_id: be_u64(16),
            extent_id: be_u64(24),
            extent_offset: be_u64(32),
            req_id: be_u64(40),
            start_time: be_u64(48) as i64,
            result_msg: String::new(),
            data: Vec::new(),
        };
        Ok((packet, be_u32(12) as usize))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op() {
            Ok(op) => op.to_string(),
            Err(_) => format!("Unknown({:#04x})", self.opcode),
        };
        write!(
            f,
            "req={} op={} pid={} eid={} off={} size={}",
            self.req_id, op, self.partition_id, self.extent_id, self.extent_offset, self.size
        )
    }
}
