//! Tuya 55AA wire framing.
//! Handles packet framing, header parsing, and CRC/HMAC verification.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

pub const HEADER_LEN: usize = 16;
/// Frames larger than this are treated as garbage rather than allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const CRC_TRAILER_LEN: usize = 4 + 4;
const HMAC_TRAILER_LEN: usize = 32 + 4;

define_command_type! {
    Udp = 0x00,
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
    UdpNew = 0x13,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

type HmacSha256 = Hmac<Sha256>;

/// Tuya protocol message structure
#[derive(Debug, Clone, Default)]
pub struct TuyaMessage {
    pub seqno: u32,
    pub cmd: u32,
    /// Return code, present on device-to-client frames
    pub retcode: Option<u32>,
    /// Payload as carried on the wire (possibly encrypted)
    pub payload: Vec<u8>,
}

/// Tuya protocol header structure
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    pub seqno: u32,
    pub cmd: u32,
    /// Length field: retcode + payload + checksum + suffix
    pub payload_len: u32,
    /// Header plus body
    pub total_length: usize,
}

fn trailer_len(hmac_key: Option<&[u8]>) -> usize {
    if hmac_key.is_some() {
        HMAC_TRAILER_LEN
    } else {
        CRC_TRAILER_LEN
    }
}

/// Pack a message into a 55AA frame.
/// If hmac_key is provided, uses HMAC-SHA256; otherwise, uses CRC32.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let retcode_len = if msg.retcode.is_some() { 4 } else { 0 };
    let payload_len = retcode_len + msg.payload.len() + trailer_len(hmac_key);

    let mut data = Vec::with_capacity(HEADER_LEN + payload_len);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(payload_len as u32)?;
    if let Some(rc) = msg.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&msg.payload);

    if let Some(key) = hmac_key {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(&data);
        data.extend_from_slice(&mac.finalize().into_bytes());
    } else {
        let crc_val = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data);
        data.write_u32::<BigEndian>(crc_val)?;
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse a 55AA header from the first 16 bytes of `data`.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    if cursor.read_u32::<BigEndian>()? != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }
    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;

    let total_length = HEADER_LEN + payload_len as usize;
    if total_length > MAX_FRAME_LEN {
        return Err(TuyaError::DecodeError(format!(
            "Frame of {} bytes exceeds limit",
            total_length
        )));
    }

    Ok(TuyaHeader {
        seqno,
        cmd,
        payload_len,
        total_length,
    })
}

/// Unpack a 55AA frame, verifying its CRC or HMAC trailer.
///
/// `no_retcode`: `Some(true)` never reads a return code, `Some(false)` always
/// reads one when there is room, `None` guesses from the first payload byte.
pub fn unpack_message(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: Option<TuyaHeader>,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let header = match header {
        Some(h) => h,
        None => parse_header(data)?,
    };

    let msg_len = header.total_length;
    if data.len() < msg_len {
        return Err(TuyaError::DecodeError("Data shorter than expected".into()));
    }

    let payload_end = msg_len
        .checked_sub(trailer_len(hmac_key))
        .filter(|&end| end >= HEADER_LEN)
        .ok_or_else(|| {
            TuyaError::DecodeError(format!("Frame of {} bytes has no room for trailer", msg_len))
        })?;

    let checksum_data = &data[..payload_end];
    let footer = &data[payload_end..msg_len];

    if let Some(key) = hmac_key {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(checksum_data);
        mac.verify_slice(&footer[..32])
            .map_err(|_| TuyaError::HmacMismatch)?;
    } else {
        let calc_crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(checksum_data);
        if calc_crc != BigEndian::read_u32(&footer[..4]) {
            return Err(TuyaError::CrcMismatch);
        }
    }

    let mut payload_start = HEADER_LEN;
    let body = &data[payload_start..payload_end];
    let parse_retcode = match no_retcode {
        Some(no) => !no,
        None => body.len() >= 4 && body[0] != b'{' && body[0] != b'3',
    };

    let mut retcode = None;
    if parse_retcode && body.len() >= 4 {
        retcode = Some(BigEndian::read_u32(&body[..4]));
        payload_start += 4;
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
    })
}
