//! Frame codec
//!
//! Wraps a PDU into an ADU for one of four wire encodings and back again:
//!
//! | Encoding | Layout | Integrity |
//! |----------|--------|-----------|
//! | TCP | MBAP header (7) + PDU | length field |
//! | RTU | unit + PDU + CRC | CRC-16/MODBUS, little-endian |
//! | ASCII | `:` + hex(unit + PDU + LRC) + CR LF | LRC |
//! | Binary | `{` + unit + PDU + CRC + `}` | CRC-16/MODBUS, little-endian |
//!
//! The codec knows nothing about function semantics beyond the length of a
//! PDU, which RTU and Binary need because they carry no length field.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::trace;

use crate::constants::{
    ASCII_FRAME_END, ASCII_FRAME_START, BIN_FRAME_END, BIN_FRAME_START, DEFAULT_PROTOCOL_ID,
    DEFAULT_TRANSACTION_ID, MAX_MBAP_LENGTH, MAX_MESSAGE_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{expected_pdu_len, ModbusPdu, PduDirection};
use crate::protocol::SlaveId;

/// CRC calculator for RTU and Binary
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// `:` + hex(unit + PDU + LRC) + CR LF
const MAX_ASCII_FRAME_LEN: usize = 1 + 2 * (1 + MAX_PDU_SIZE + 1) + 2;

/// Wire encoding of an ADU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEncoding {
    Tcp,
    Rtu,
    Ascii,
    Binary,
}

impl FrameEncoding {
    /// Serial encodings carry no transaction id and allow one outstanding request
    pub fn is_serial(self) -> bool {
        !matches!(self, Self::Tcp)
    }

    /// Short tag used in packet logs
    pub fn name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Rtu => "RTU",
            Self::Ascii => "ASCII",
            Self::Binary => "BIN",
        }
    }
}

impl fmt::Display for FrameEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serial line encoding selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SerialEncoding {
    #[default]
    Ascii,
    Rtu,
    Binary,
}

impl SerialEncoding {
    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Rtu => "rtu",
            Self::Binary => "bin",
        }
    }
}

impl FromStr for SerialEncoding {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" => Ok(Self::Ascii),
            "rtu" => Ok(Self::Rtu),
            "bin" | "binary" => Ok(Self::Binary),
            other => Err(ModbusError::configuration(format!(
                "Unknown serial encoding '{}' (expected ascii, rtu or bin)",
                other
            ))),
        }
    }
}

impl fmt::Display for SerialEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SerialEncoding> for FrameEncoding {
    fn from(encoding: SerialEncoding) -> Self {
        match encoding {
            SerialEncoding::Ascii => Self::Ascii,
            SerialEncoding::Rtu => Self::Rtu,
            SerialEncoding::Binary => Self::Binary,
        }
    }
}

/// Application data unit: a PDU plus its addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// MBAP transaction id; [`DEFAULT_TRANSACTION_ID`] on serial lines
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    pub pdu: ModbusPdu,
}

impl Adu {
    pub fn new(transaction_id: u16, unit_id: SlaveId, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }
}

/// CRC-16/MODBUS over `data`
#[inline]
pub fn crc_16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Two's complement of the byte sum
#[inline]
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)).wrapping_neg()
}

fn byte_to_ascii_hex(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[(byte >> 4) as usize], DIGITS[(byte & 0x0F) as usize]]
}

fn ascii_char_to_hex(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ModbusError::frame(format!(
            "Invalid ASCII hex character: 0x{:02X}",
            c
        ))),
    }
}

/// Encode an ADU for the wire.
///
/// Serial encodings ignore `transaction_id`.
pub fn encode(encoding: FrameEncoding, adu: &Adu) -> ModbusResult<BytesMut> {
    let pdu = adu.pdu.as_slice();
    if pdu.is_empty() {
        return Err(ModbusError::frame("Cannot frame an empty PDU"));
    }

    let buf = match encoding {
        FrameEncoding::Tcp => {
            let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
            buf.put_u16(adu.transaction_id);
            buf.put_u16(DEFAULT_PROTOCOL_ID);
            buf.put_u16((pdu.len() + 1) as u16);
            buf.put_u8(adu.unit_id);
            buf.put_slice(pdu);
            buf
        }
        FrameEncoding::Rtu => {
            let mut buf = BytesMut::with_capacity(1 + pdu.len() + 2);
            buf.put_u8(adu.unit_id);
            buf.put_slice(pdu);
            let crc = crc_16(&buf);
            buf.put_u16_le(crc);
            buf
        }
        FrameEncoding::Ascii => {
            let mut raw = Vec::with_capacity(pdu.len() + 2);
            raw.push(adu.unit_id);
            raw.extend_from_slice(pdu);
            raw.push(lrc(&raw));

            let mut buf = BytesMut::with_capacity(1 + raw.len() * 2 + 2);
            buf.put_u8(ASCII_FRAME_START);
            for byte in raw {
                buf.put_slice(&byte_to_ascii_hex(byte));
            }
            buf.put_slice(&ASCII_FRAME_END);
            buf
        }
        FrameEncoding::Binary => {
            let mut buf = BytesMut::with_capacity(1 + 1 + pdu.len() + 2 + 1);
            buf.put_u8(BIN_FRAME_START);
            buf.put_u8(adu.unit_id);
            buf.put_slice(pdu);
            let crc = crc_16(&buf[1..]);
            buf.put_u16_le(crc);
            buf.put_u8(BIN_FRAME_END);
            buf
        }
    };

    Ok(buf)
}

/// Decode one complete frame
pub fn decode(encoding: FrameEncoding, frame: &[u8]) -> ModbusResult<Adu> {
    match encoding {
        FrameEncoding::Tcp => decode_tcp(frame),
        FrameEncoding::Rtu => decode_rtu(frame),
        FrameEncoding::Ascii => decode_ascii(frame),
        FrameEncoding::Binary => decode_binary(frame),
    }
}

/// Returns (transaction id, length field)
fn parse_mbap_header(head: &[u8]) -> ModbusResult<(u16, usize)> {
    let transaction_id = u16::from_be_bytes([head[0], head[1]]);
    let protocol_id = u16::from_be_bytes([head[2], head[3]]);
    let length = u16::from_be_bytes([head[4], head[5]]) as usize;

    if protocol_id != DEFAULT_PROTOCOL_ID {
        return Err(ModbusError::frame(format!(
            "Invalid protocol id {} in MBAP header",
            protocol_id
        )));
    }
    if !(2..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(ModbusError::frame(format!(
            "MBAP length {} outside 2..={}",
            length, MAX_MBAP_LENGTH
        )));
    }
    Ok((transaction_id, length))
}

fn decode_tcp(frame: &[u8]) -> ModbusResult<Adu> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(ModbusError::frame(format!(
            "TCP frame too short: {} bytes",
            frame.len()
        )));
    }
    let (transaction_id, length) = parse_mbap_header(frame)?;
    if frame.len() != MBAP_HEADER_LEN - 1 + length {
        return Err(ModbusError::frame(format!(
            "MBAP length {} does not match frame of {} bytes",
            length,
            frame.len()
        )));
    }
    Ok(Adu::new(
        transaction_id,
        frame[MBAP_HEADER_LEN - 1],
        ModbusPdu::from_slice(&frame[MBAP_HEADER_LEN..])?,
    ))
}

/// unit + PDU + CRC (little-endian); shared by RTU and Binary
fn decode_crc_body(body: &[u8], label: &str) -> ModbusResult<Adu> {
    if body.len() < 4 {
        return Err(ModbusError::frame(format!(
            "{} frame too short: {} bytes",
            label,
            body.len()
        )));
    }
    if body.len() > MAX_MESSAGE_LENGTH {
        return Err(ModbusError::frame(format!(
            "{} frame too long: {} bytes",
            label,
            body.len()
        )));
    }

    let data_len = body.len() - 2;
    let received = u16::from_le_bytes([body[data_len], body[data_len + 1]]);
    let calculated = crc_16(&body[..data_len]);
    if received != calculated {
        return Err(ModbusError::frame(format!(
            "{} CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            label, calculated, received
        )));
    }

    Ok(Adu::new(
        DEFAULT_TRANSACTION_ID,
        body[0],
        ModbusPdu::from_slice(&body[1..data_len])?,
    ))
}

fn decode_rtu(frame: &[u8]) -> ModbusResult<Adu> {
    decode_crc_body(frame, "RTU")
}

fn decode_binary(frame: &[u8]) -> ModbusResult<Adu> {
    if frame.first() != Some(&BIN_FRAME_START) {
        return Err(ModbusError::frame("Binary frame missing start marker"));
    }
    if frame.len() < 2 || frame.last() != Some(&BIN_FRAME_END) {
        return Err(ModbusError::frame("Binary frame missing end marker"));
    }
    decode_crc_body(&frame[1..frame.len() - 1], "Binary")
}

fn decode_ascii(frame: &[u8]) -> ModbusResult<Adu> {
    if frame.first() != Some(&ASCII_FRAME_START) {
        return Err(ModbusError::frame("ASCII frame missing ':' start"));
    }
    if frame.len() < 3 || frame[frame.len() - 2..] != ASCII_FRAME_END {
        return Err(ModbusError::frame("ASCII frame missing CR LF terminator"));
    }

    let hex = &frame[1..frame.len() - 2];
    if hex.len() % 2 != 0 {
        return Err(ModbusError::frame(format!(
            "ASCII frame has odd number of hex characters: {}",
            hex.len()
        )));
    }

    let raw = hex
        .chunks_exact(2)
        .map(|pair| Ok((ascii_char_to_hex(pair[0])? << 4) | ascii_char_to_hex(pair[1])?))
        .collect::<ModbusResult<Vec<u8>>>()?;

    // unit + function code + LRC
    if raw.len() < 3 {
        return Err(ModbusError::frame(format!(
            "ASCII frame too short: {} bytes",
            raw.len()
        )));
    }

    let data_len = raw.len() - 1;
    let calculated = lrc(&raw[..data_len]);
    if raw[data_len] != calculated {
        return Err(ModbusError::frame(format!(
            "ASCII LRC mismatch: expected 0x{:02X}, got 0x{:02X}",
            calculated, raw[data_len]
        )));
    }

    Ok(Adu::new(
        DEFAULT_TRANSACTION_ID,
        raw[0],
        ModbusPdu::from_slice(&raw[1..data_len])?,
    ))
}

/// Incremental decoder over a byte stream.
///
/// Each call inspects only as many header bytes as needed to learn the frame
/// length, returns `Ok(None)` until the frame is complete and then consumes
/// exactly that frame from the buffer. On a fault the bad bytes are dropped so
/// the next call starts clean; TCP and RTU have no resync marker, so for them
/// the whole buffer is dropped.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    encoding: FrameEncoding,
    direction: PduDirection,
}

impl FrameDecoder {
    /// Decoder for frames a slave receives
    pub fn request(encoding: FrameEncoding) -> Self {
        Self {
            encoding,
            direction: PduDirection::Request,
        }
    }

    /// Decoder for frames a master receives
    pub fn response(encoding: FrameEncoding) -> Self {
        Self {
            encoding,
            direction: PduDirection::Response,
        }
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    /// Take the next complete frame out of `buf`, if there is one
    pub fn decode(&mut self, buf: &mut BytesMut) -> ModbusResult<Option<Adu>> {
        match self.encoding {
            FrameEncoding::Tcp => self.decode_tcp(buf),
            FrameEncoding::Rtu => self.decode_rtu(buf),
            FrameEncoding::Ascii => self.decode_ascii(buf),
            FrameEncoding::Binary => self.decode_binary(buf),
        }
    }

    fn decode_tcp(&self, buf: &mut BytesMut) -> ModbusResult<Option<Adu>> {
        if buf.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let length = match parse_mbap_header(&buf[..MBAP_HEADER_LEN]) {
            Ok((_, length)) => length,
            Err(e) => {
                buf.clear();
                return Err(e);
            }
        };

        let total = MBAP_HEADER_LEN - 1 + length;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total);
        decode_tcp(&frame).map(Some)
    }

    /// Frame length of `unit + PDU + CRC` starting at `offset`
    fn crc_frame_len(&self, buf: &mut BytesMut, offset: usize) -> ModbusResult<Option<usize>> {
        if buf.len() < offset + 2 {
            return Ok(None);
        }
        match expected_pdu_len(self.direction, &buf[offset + 1..]) {
            Ok(len) => Ok(len.map(|pdu_len| 1 + pdu_len + 2)),
            Err(e) => {
                buf.clear();
                Err(e)
            }
        }
    }

    fn decode_rtu(&self, buf: &mut BytesMut) -> ModbusResult<Option<Adu>> {
        let Some(total) = self.crc_frame_len(buf, 0)? else {
            return Ok(None);
        };
        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total);
        decode_rtu(&frame).map(Some).inspect_err(|_| buf.clear())
    }

    fn decode_binary(&self, buf: &mut BytesMut) -> ModbusResult<Option<Adu>> {
        if !skip_to_marker(buf, BIN_FRAME_START) {
            return Ok(None);
        }
        let Some(body) = self.crc_frame_len(buf, 1)? else {
            return Ok(None);
        };
        let total = 1 + body + 1;
        if buf.len() < total {
            return Ok(None);
        }

        let frame = buf.split_to(total);
        decode_binary(&frame).map(Some)
    }

    fn decode_ascii(&self, buf: &mut BytesMut) -> ModbusResult<Option<Adu>> {
        if !skip_to_marker(buf, ASCII_FRAME_START) {
            return Ok(None);
        }

        match buf.windows(2).position(|w| w == ASCII_FRAME_END) {
            Some(end) => {
                let frame = buf.split_to(end + 2);
                decode_ascii(&frame).map(Some)
            }
            None if buf.len() >= MAX_ASCII_FRAME_LEN => {
                buf.clear();
                Err(ModbusError::frame(format!(
                    "No ASCII terminator within {} bytes",
                    MAX_ASCII_FRAME_LEN
                )))
            }
            None => Ok(None),
        }
    }
}

/// Drop noise ahead of `marker`; false when no marker is buffered yet
fn skip_to_marker(buf: &mut BytesMut, marker: u8) -> bool {
    match buf.iter().position(|&b| b == marker) {
        Some(0) => true,
        Some(n) => {
            trace!("Discarding {} bytes ahead of frame start", n);
            buf.advance(n);
            true
        }
        None => {
            if !buf.is_empty() {
                trace!("Discarding {} bytes with no frame start", buf.len());
                buf.clear();
            }
            false
        }
    }
}
