// Copyright 2020 Joyent, Inc.

//! Message type and the frame codec used on every connection.

use std::io::{Error, ErrorKind};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc16::{State, ARC};
use tokio_util::codec::{Decoder, Encoder};

/// Heartbeat probe and acknowledgement.
pub const ALIVE: &str = "ALIVE";
/// Upsert a service endpoint on a registry center.
pub const REGISTER: &str = "REGISTER";
/// Look up the endpoints of a service on a registry center.
pub const DISCOVER: &str = "DISCOVER";
/// Body of a positive acknowledgement.
pub const OK: &str = "OK";
/// Fallback entry of every command table.
pub const DEFAULT: &str = "DEFAULT";
/// Notice broadcast by a registry center when a peer disconnects.
pub const CONNECT_CLOSED: &str = "CONNECT_CLOSED";

/// The only protocol tag with a codec installed by default.
pub const JSON_PROTOC: &str = "json";

const FP_OFF_CRC: usize = 0x1;
const FP_OFF_CMDLEN: usize = 0x5;
const FP_OFF_PROTOCLEN: usize = 0x7;
const FP_OFF_DATALEN: usize = 0x9;
const FP_OFF_DATA: usize = 0xd;

/// Size of the fixed frame header.
pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// Frames announcing a body larger than this are rejected.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// The single wire-visible unit: a command, a protocol tag selecting the
/// body codec, and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub command: String,
    pub protoc: String,
    pub body: Bytes,
}

impl RpcMessage {
    pub fn new<C, P, B>(command: C, protoc: P, body: B) -> RpcMessage
    where
        C: Into<String>,
        P: Into<String>,
        B: Into<Bytes>,
    {
        RpcMessage {
            command: command.into(),
            protoc: protoc.into(),
            body: body.into(),
        }
    }

    /// A message carrying the `json` protocol tag.
    pub fn json<C, B>(command: C, body: B) -> RpcMessage
    where
        C: Into<String>,
        B: Into<Bytes>,
    {
        RpcMessage::new(command, JSON_PROTOC, body)
    }

    pub fn alive() -> RpcMessage {
        RpcMessage::json(ALIVE, Bytes::new())
    }

    /// Returns a copy of this message with the body replaced.
    pub fn with_body<B: Into<Bytes>>(&self, body: B) -> RpcMessage {
        RpcMessage {
            command: self.command.clone(),
            protoc: self.protoc.clone(),
            body: body.into(),
        }
    }

    /// Size of this message once framed.
    pub fn frame_size(&self) -> usize {
        FP_HEADER_SZ + self.command.len() + self.protoc.len() + self.body.len()
    }
}

#[derive(Debug)]
pub enum FrameParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for FrameParseError {
    fn from(error: io::Error) -> Self {
        FrameParseError::IOError(error)
    }
}

struct FrameHeader {
    crc: u32,
    cmd_len: usize,
    protoc_len: usize,
    data_len: usize,
}

impl FrameHeader {
    fn frame_len(&self) -> usize {
        FP_HEADER_SZ + self.cmd_len + self.protoc_len + self.data_len
    }
}

fn other_error(msg: &str) -> Error {
    Error::new(ErrorKind::Other, String::from(msg))
}

/// Parses one frame from the front of `buf`, returning the message and the
/// number of bytes it occupied.
pub fn parse(buf: &[u8]) -> Result<(RpcMessage, usize), FrameParseError> {
    check_buffer_size(buf)?;
    let header = parse_header(buf)?;
    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Err(FrameParseError::NotEnoughBytes(buf.len()));
    }

    let protoc_off = FP_OFF_DATA + header.cmd_len;
    let body_off = protoc_off + header.protoc_len;
    let command = parse_str(&buf[FP_OFF_DATA..protoc_off], "command")?;
    if command.is_empty() {
        return Err(other_error("Frame carries an empty command").into());
    }
    let protoc = parse_str(&buf[protoc_off..body_off], "protocol tag")?;
    let body = &buf[body_off..frame_len];
    validate_crc(body, header.crc)?;

    let msg = RpcMessage {
        command,
        protoc,
        body: Bytes::copy_from_slice(body),
    };
    Ok((msg, frame_len))
}

fn check_buffer_size(buf: &[u8]) -> Result<(), FrameParseError> {
    if buf.len() < FP_HEADER_SZ {
        Err(FrameParseError::NotEnoughBytes(buf.len()))
    } else {
        Ok(())
    }
}

fn parse_header(buf: &[u8]) -> Result<FrameHeader, io::Error> {
    if buf[0] != FP_VERSION_CURRENT {
        let msg = format!("Unsupported frame version: {}", buf[0]);
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }
    let crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
    let cmd_len =
        BigEndian::read_u16(&buf[FP_OFF_CMDLEN..FP_OFF_CMDLEN + 2]) as usize;
    let protoc_len =
        BigEndian::read_u16(&buf[FP_OFF_PROTOCLEN..FP_OFF_PROTOCLEN + 2])
            as usize;
    let data_len =
        BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

    if data_len > MAX_BODY_SIZE {
        let msg = format!("Frame body too large: {} bytes", data_len);
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }

    Ok(FrameHeader {
        crc,
        cmd_len,
        protoc_len,
        data_len,
    })
}

fn parse_str(raw: &[u8], what: &str) -> Result<String, io::Error> {
    str::from_utf8(raw).map(String::from).map_err(|_| {
        let msg = format!("Failed to parse frame {} as UTF-8", what);
        Error::new(ErrorKind::InvalidData, msg)
    })
}

fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), io::Error> {
    let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
    if crc != calculated_crc {
        let msg = "Calculated CRC does not match the provided CRC";
        Err(Error::new(ErrorKind::InvalidData, msg))
    } else {
        Ok(())
    }
}

/// Appends the framed form of `msg` to `buf`.
pub fn encode_msg(msg: &RpcMessage, buf: &mut BytesMut) -> Result<(), String> {
    if msg.command.is_empty() {
        return Err(String::from("Message command must not be empty"));
    }
    if msg.command.len() > usize::from(u16::MAX) {
        return Err(String::from("Message command too long"));
    }
    if msg.protoc.len() > usize::from(u16::MAX) {
        return Err(String::from("Message protocol tag too long"));
    }
    if msg.body.len() > MAX_BODY_SIZE {
        return Err(format!("Message body too large: {}", msg.body.len()));
    }

    buf.reserve(msg.frame_size());
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u32(u32::from(State::<ARC>::calculate(&msg.body)));
    buf.put_u16(msg.command.len() as u16);
    buf.put_u16(msg.protoc.len() as u16);
    buf.put_u32(msg.body.len() as u32);
    buf.put_slice(msg.command.as_bytes());
    buf.put_slice(msg.protoc.as_bytes());
    buf.put_slice(&msg.body);
    Ok(())
}

/// Codec turning a byte stream into [`RpcMessage`]s and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = RpcMessage;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, io::Error> {
        match parse(buf) {
            Ok((msg, frame_len)) => {
                buf.advance(frame_len);
                Ok(Some(msg))
            }
            Err(FrameParseError::NotEnoughBytes(_)) => Ok(None),
            Err(FrameParseError::IOError(e)) => Err(e),
        }
    }
}

impl Encoder<RpcMessage> for RpcCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: RpcMessage,
        buf: &mut BytesMut,
    ) -> Result<(), io::Error> {
        encode_msg(&item, buf).map_err(|e| other_error(&e))
    }
}
