//! Frame header codec.
//!
//! Every frame starts with a 24-byte common prefix (sequence, version, type,
//! ComId, topocounts, dataset length). Process data continues with a 16-byte
//! tail for a 40-byte header; message data continues with a 92-byte tail for
//! a 116-byte header. The last 4 bytes of either header are an FCS-32 over
//! all preceding header bytes. The payload follows the header, zero-padded
//! to a multiple of 4; message-data frames always close with an FCS-32 over
//! the padded payload, process-data frames only when the publisher asks for
//! it.
//!
//! All fields are big-endian and written explicitly; nothing here is
//! memory-mapped.

use crate::error::{Result, TrdpError};
use crate::wire::crc::{fcs32, FCS_SEED};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use keel::SessionUuid;
use std::io::Cursor;
use std::net::Ipv4Addr;

pub const COMMON_PREFIX_SIZE: usize = 24;
pub const PD_HEADER_SIZE: usize = 40;
pub const MD_HEADER_SIZE: usize = 116;
pub const FCS_SIZE: usize = 4;
pub const URI_SIZE: usize = 32;

/// Largest process-data payload that fits one telegram.
pub const MAX_PD_PAYLOAD: usize = 1432;
/// Largest message-data payload per frame.
pub const MAX_MD_PAYLOAD: usize = 65388;

pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

/// Wire values of the message-data reply status field.
pub mod reply_status {
    pub const OK: i32 = 0;
    pub const REPLY_TIMEOUT: i32 = -1;
    pub const CONFIRM_TIMEOUT: i32 = -2;
    pub const ABORTED: i32 = -3;
    pub const NO_REPLIER: i32 = -4;
}

/// Message type, kept as a tagged variant internally and as the literal
/// 2-ASCII code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Cyclically pushed process data.
    Pd,
    /// Process data sent in response to a pull request.
    Pp,
    /// Process-data pull request.
    Pr,
    /// Message-data notification (no reply).
    Mn,
    /// Message-data request.
    Mr,
    /// Message-data reply without confirmation.
    Mp,
    /// Message-data reply expecting confirmation.
    Mq,
    /// Message-data confirmation.
    Mc,
    /// Message-data error.
    Me,
}

impl MsgType {
    pub fn wire_code(self) -> [u8; 2] {
        match self {
            MsgType::Pd => *b"Pd",
            MsgType::Pp => *b"Pp",
            MsgType::Pr => *b"Pr",
            MsgType::Mn => *b"Mn",
            MsgType::Mr => *b"Mr",
            MsgType::Mp => *b"Mp",
            MsgType::Mq => *b"Mq",
            MsgType::Mc => *b"Mc",
            MsgType::Me => *b"Me",
        }
    }

    pub fn from_wire(code: [u8; 2]) -> Option<MsgType> {
        match &code {
            b"Pd" => Some(MsgType::Pd),
            b"Pp" => Some(MsgType::Pp),
            b"Pr" => Some(MsgType::Pr),
            b"Mn" => Some(MsgType::Mn),
            b"Mr" => Some(MsgType::Mr),
            b"Mp" => Some(MsgType::Mp),
            b"Mq" => Some(MsgType::Mq),
            b"Mc" => Some(MsgType::Mc),
            b"Me" => Some(MsgType::Me),
            _ => None,
        }
    }

    #[inline]
    pub fn is_pd(self) -> bool {
        matches!(self, MsgType::Pd | MsgType::Pp | MsgType::Pr)
    }

    #[inline]
    pub fn is_md(self) -> bool {
        !self.is_pd()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdHeader {
    pub sequence: u32,
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
    pub dataset_length: u32,
    /// ComId the pulled response shall carry; zero outside "Pr" frames.
    pub reply_com_id: u32,
    /// Address the pulled response shall go to; unspecified means "back to
    /// the requester".
    pub reply_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdHeader {
    pub sequence: u32,
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_count: u32,
    pub op_trn_topo_count: u32,
    pub dataset_length: u32,
    pub reply_status: i32,
    pub session_id: SessionUuid,
    pub reply_timeout_us: u32,
    pub source_uri: String,
    pub dest_uri: String,
}

/// A successfully decoded frame, payload borrowed from the receive buffer.
#[derive(Debug)]
pub enum Frame<'a> {
    Pd {
        header: PdHeader,
        payload: &'a [u8],
        /// False when padding bytes were not zero (logged, not rejected).
        padding_clean: bool,
    },
    Md {
        header: MdHeader,
        payload: &'a [u8],
        padding_clean: bool,
    },
}

#[inline]
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Total wire size of a process-data frame for the given payload length.
#[inline]
pub fn pd_frame_size(dataset_length: usize, with_payload_fcs: bool) -> usize {
    PD_HEADER_SIZE + align4(dataset_length) + if with_payload_fcs { FCS_SIZE } else { 0 }
}

/// Total wire size of a message-data frame; the payload FCS is always there.
#[inline]
pub fn md_frame_size(dataset_length: usize) -> usize {
    MD_HEADER_SIZE + align4(dataset_length) + FCS_SIZE
}

/// FCS over an already padded payload section, as appended to a frame.
#[inline]
pub fn payload_fcs(padded_payload: &[u8]) -> u32 {
    fcs32(padded_payload, FCS_SEED)
}

/// Checks a stored payload FCS against the padded payload section.
#[inline]
pub fn verify_payload_fcs(padded_payload: &[u8], stored: u32) -> bool {
    payload_fcs(padded_payload) == stored
}

/// Reads the dataset length out of a partially received frame and returns
/// the full message-data frame size, used as the length prefix for stream
/// reassembly. Needs the common prefix to be present.
pub fn peek_md_frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < COMMON_PREFIX_SIZE {
        return None;
    }
    let dataset_length = BigEndian::read_u32(&buf[20..24]) as usize;
    Some(md_frame_size(dataset_length))
}

fn write_common_prefix(
    out: &mut Vec<u8>,
    sequence: u32,
    msg_type: MsgType,
    com_id: u32,
    etb: u32,
    op_trn: u32,
    dataset_length: u32,
) {
    out.write_u32::<BigEndian>(sequence).unwrap();
    out.write_u8(PROTOCOL_VERSION_MAJOR).unwrap();
    out.write_u8(PROTOCOL_VERSION_MINOR).unwrap();
    out.extend_from_slice(&msg_type.wire_code());
    out.write_u32::<BigEndian>(com_id).unwrap();
    out.write_u32::<BigEndian>(etb).unwrap();
    out.write_u32::<BigEndian>(op_trn).unwrap();
    out.write_u32::<BigEndian>(dataset_length).unwrap();
}

fn append_padded_payload(out: &mut Vec<u8>, payload: &[u8], with_fcs: bool) {
    let body_start = out.len();
    out.extend_from_slice(payload);
    out.resize(body_start + align4(payload.len()), 0);
    if with_fcs {
        let fcs = fcs32(&out[body_start..], FCS_SEED);
        out.write_u32::<BigEndian>(fcs).unwrap();
    }
}

/// Encodes a complete process-data frame: header, header FCS, payload,
/// padding and, when requested, the payload FCS.
pub fn encode_pd(header: &PdHeader, payload: &[u8], with_payload_fcs: bool) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PD_PAYLOAD);
    debug_assert!(header.msg_type.is_pd());

    let mut out = Vec::with_capacity(pd_frame_size(payload.len(), with_payload_fcs));
    write_common_prefix(
        &mut out,
        header.sequence,
        header.msg_type,
        header.com_id,
        header.etb_topo_count,
        header.op_trn_topo_count,
        payload.len() as u32,
    );
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    out.write_u32::<BigEndian>(header.reply_com_id).unwrap();
    out.write_u32::<BigEndian>(u32::from(header.reply_ip)).unwrap();

    let fcs = fcs32(&out, FCS_SEED);
    out.write_u32::<BigEndian>(fcs).unwrap();

    append_padded_payload(&mut out, payload, with_payload_fcs);
    out
}

/// Encodes a complete message-data frame, payload FCS included.
pub fn encode_md(header: &MdHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_MD_PAYLOAD);
    debug_assert!(header.msg_type.is_md());

    let mut out = Vec::with_capacity(md_frame_size(payload.len()));
    write_common_prefix(
        &mut out,
        header.sequence,
        header.msg_type,
        header.com_id,
        header.etb_topo_count,
        header.op_trn_topo_count,
        payload.len() as u32,
    );
    out.write_i32::<BigEndian>(header.reply_status).unwrap();
    out.extend_from_slice(header.session_id.as_bytes());
    out.write_u32::<BigEndian>(header.reply_timeout_us).unwrap();
    write_uri(&mut out, &header.source_uri);
    write_uri(&mut out, &header.dest_uri);

    let fcs = fcs32(&out, FCS_SEED);
    out.write_u32::<BigEndian>(fcs).unwrap();

    append_padded_payload(&mut out, payload, true);
    out
}

fn write_uri(out: &mut Vec<u8>, uri: &str) {
    let bytes = uri.as_bytes();
    let take = bytes.len().min(URI_SIZE);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + URI_SIZE - take, 0);
}

fn read_uri(buf: &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let trimmed = &buf[..end];
    if !trimmed.is_ascii() {
        return Err(TrdpError::WireFormat("URI is not ASCII"));
    }
    Ok(String::from_utf8_lossy(trimmed).into_owned())
}

/// Decodes one frame, verifying version, type, length fields and both frame
/// check sequences. The payload slice borrows from `buf` and is valid only
/// as long as the receive buffer is.
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() < COMMON_PREFIX_SIZE {
        return Err(TrdpError::WireFormat("frame shorter than common prefix"));
    }
    if buf[4] != PROTOCOL_VERSION_MAJOR {
        return Err(TrdpError::WireFormat("unsupported protocol version"));
    }
    let msg_type = MsgType::from_wire([buf[6], buf[7]])
        .ok_or(TrdpError::WireFormat("unknown message type code"))?;

    let mut cursor = Cursor::new(buf);
    let sequence = cursor.read_u32::<BigEndian>().map_err(|_| TrdpError::WireFormat("header"))?;
    cursor.set_position(8);
    let com_id = cursor.read_u32::<BigEndian>().map_err(|_| TrdpError::WireFormat("header"))?;
    let etb_topo_count = cursor.read_u32::<BigEndian>().map_err(|_| TrdpError::WireFormat("header"))?;
    let op_trn_topo_count = cursor.read_u32::<BigEndian>().map_err(|_| TrdpError::WireFormat("header"))?;
    let dataset_length = cursor.read_u32::<BigEndian>().map_err(|_| TrdpError::WireFormat("header"))? as usize;

    if msg_type.is_pd() {
        decode_pd(buf, msg_type, sequence, com_id, etb_topo_count, op_trn_topo_count, dataset_length)
    } else {
        decode_md(buf, msg_type, sequence, com_id, etb_topo_count, op_trn_topo_count, dataset_length)
    }
}

fn decode_pd(
    buf: &[u8],
    msg_type: MsgType,
    sequence: u32,
    com_id: u32,
    etb_topo_count: u32,
    op_trn_topo_count: u32,
    dataset_length: usize,
) -> Result<Frame> {
    if dataset_length > MAX_PD_PAYLOAD {
        return Err(TrdpError::WireFormat("process-data payload length out of range"));
    }
    if buf.len() < PD_HEADER_SIZE {
        return Err(TrdpError::WireFormat("truncated process-data header"));
    }

    let stored = BigEndian::read_u32(&buf[36..40]);
    if fcs32(&buf[..36], FCS_SEED) != stored {
        return Err(TrdpError::CrcMismatch);
    }

    let padded_end = PD_HEADER_SIZE + align4(dataset_length);
    let with_fcs = match buf.len() {
        n if n == padded_end => false,
        n if n == padded_end + FCS_SIZE => true,
        _ => return Err(TrdpError::WireFormat("frame length does not match dataset length")),
    };

    if with_fcs {
        let stored = BigEndian::read_u32(&buf[padded_end..padded_end + FCS_SIZE]);
        if fcs32(&buf[PD_HEADER_SIZE..padded_end], FCS_SEED) != stored {
            return Err(TrdpError::CrcMismatch);
        }
    }

    let payload_end = PD_HEADER_SIZE + dataset_length;
    let padding_clean = buf[payload_end..padded_end].iter().all(|&b| b == 0);

    Ok(Frame::Pd {
        header: PdHeader {
            sequence,
            msg_type,
            com_id,
            etb_topo_count,
            op_trn_topo_count,
            dataset_length: dataset_length as u32,
            reply_com_id: BigEndian::read_u32(&buf[28..32]),
            reply_ip: Ipv4Addr::from(BigEndian::read_u32(&buf[32..36])),
        },
        payload: &buf[PD_HEADER_SIZE..payload_end],
        padding_clean,
    })
}

fn decode_md(
    buf: &[u8],
    msg_type: MsgType,
    sequence: u32,
    com_id: u32,
    etb_topo_count: u32,
    op_trn_topo_count: u32,
    dataset_length: usize,
) -> Result<Frame> {
    if dataset_length > MAX_MD_PAYLOAD {
        return Err(TrdpError::WireFormat("message-data payload length out of range"));
    }
    if buf.len() < MD_HEADER_SIZE {
        return Err(TrdpError::WireFormat("truncated message-data header"));
    }

    let stored = BigEndian::read_u32(&buf[112..116]);
    if fcs32(&buf[..112], FCS_SEED) != stored {
        return Err(TrdpError::CrcMismatch);
    }

    if buf.len() != md_frame_size(dataset_length) {
        return Err(TrdpError::WireFormat("frame length does not match dataset length"));
    }

    let padded_end = MD_HEADER_SIZE + align4(dataset_length);
    let stored = BigEndian::read_u32(&buf[padded_end..padded_end + FCS_SIZE]);
    if fcs32(&buf[MD_HEADER_SIZE..padded_end], FCS_SEED) != stored {
        return Err(TrdpError::CrcMismatch);
    }

    let mut session_bytes = [0u8; SessionUuid::SIZE];
    session_bytes.copy_from_slice(&buf[28..44]);

    let payload_end = MD_HEADER_SIZE + dataset_length;
    let padding_clean = buf[payload_end..padded_end].iter().all(|&b| b == 0);

    Ok(Frame::Md {
        header: MdHeader {
            sequence,
            msg_type,
            com_id,
            etb_topo_count,
            op_trn_topo_count,
            dataset_length: dataset_length as u32,
            reply_status: BigEndian::read_i32(&buf[24..28]),
            session_id: SessionUuid::from_bytes(session_bytes),
            reply_timeout_us: BigEndian::read_u32(&buf[44..48]),
            source_uri: read_uri(&buf[48..80])?,
            dest_uri: read_uri(&buf[80..112])?,
        },
        payload: &buf[MD_HEADER_SIZE..payload_end],
        padding_clean,
    })
}
