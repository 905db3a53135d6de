//! Typed wrappers over [`crate::transport::Transport`]'s blocking request
//! API: `send_packet`, `get/set_value`, `get/set_object`, `get/set_mem`,
//! `get/set_leds`. Spec.md §4.1/§6.

use byteorder::{BigEndian, ByteOrder};
use bitflags::bitflags;

use std::fmt;

use crate::error::{ResponseError, TransportError};
use crate::transport::{RequestError, RequestKind, Transport};

/// Errors from a single Radio API call: either the transport failed
/// (fatal, spec.md §7) or the radio answered with an `err` response
/// (recoverable, the caller drops the operation).
#[derive(Debug)]
pub enum RadioError {
    Transport(TransportError),
    Response(ResponseError),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioError::Transport(e) => write!(f, "{e}"),
            RadioError::Response(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RadioError {}

impl From<RequestError> for RadioError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Transport(t) => RadioError::Transport(t),
            RequestError::Response => RadioError::Response(ResponseError),
        }
    }
}

/// Wire result code carried by (almost) every response, spec.md §4.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioResult {
    Ok = 0,
    NotSupported = 1,
    InvalidValue = 2,
    Error = 3,
}

impl RadioResult {
    fn from_u16(v: u16) -> Self {
        match v {
            0 => RadioResult::Ok,
            1 => RadioResult::NotSupported,
            2 => RadioResult::InvalidValue,
            _ => RadioResult::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitResult {
    Ok = 0,
    Drr = 1,
    Collision = 2,
    NoAck = 3,
}

impl TransmitResult {
    fn from_u16(v: u16) -> Self {
        match v {
            0 => TransmitResult::Ok,
            1 => TransmitResult::Drr,
            2 => TransmitResult::Collision,
            _ => TransmitResult::NoAck,
        }
    }
}

/// Radio parameter codes, spec.md §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Param {
    PowerMode = 0,
    Channel = 1,
    PanId = 2,
    ShortAddr = 3,
    RxMode = 4,
    TxMode = 5,
    TxPower = 6,
    CcaThreshold = 7,
    Rssi = 8,
    LastRssi = 9,
    LastLinkQuality = 10,
    LongAddr = 11,
    LastPacketTimestamp = 12,
    ChannelMin = 13,
    ChannelMax = 14,
    TxPowerMin = 15,
    TxPowerMax = 16,
}

bitflags! {
    /// spec.md §4.1: `rx_mode=0` disables address filter and auto-ack.
    pub struct RxMode: u16 {
        const ADDRESS_FILTER = 1;
        const AUTO_ACK = 2;
        const POLL_MODE = 4;
    }
}

bitflags! {
    /// spec.md §4.1: `tx_mode=send_on_cca(1)` enables CCA before transmit.
    pub struct TxMode: u16 {
        const SEND_ON_CCA = 1;
    }
}

/// Request kinds understood by the radio, spec.md §6.
mod request {
    pub const SEND_PACKET: u8 = 0;
    pub const GET_MEM: u8 = 1;
    pub const SET_MEM: u8 = 2;
    pub const GET_MEM_REV: u8 = 3;
    pub const SET_MEM_REV: u8 = 4;
    pub const GET_VALUE: u8 = 5;
    pub const SET_VALUE: u8 = 6;
    pub const GET_OBJECT: u8 = 7;
    pub const SET_OBJECT: u8 = 8;
    pub const GET_LEDS: u8 = 9;
    pub const SET_LEDS: u8 = 10;
}

/// Typed view over the radio's request/response surface. Thin: every method
/// is a single blocking [`Transport::request`] call.
pub struct Radio<'t> {
    transport: &'t Transport,
}

impl<'t> Radio<'t> {
    pub fn new(transport: &'t Transport) -> Self {
        Self { transport }
    }

    /// Sends a raw MAC frame and returns the radio's transmit outcome.
    pub fn send_packet(&self, frame: &[u8]) -> Result<TransmitResult, RadioError> {
        let resp = self.transport.request(RequestKind(request::SEND_PACKET), frame)?;
        if resp.len() < 2 {
            return Err(RadioError::Response(ResponseError));
        }
        Ok(TransmitResult::from_u16(BigEndian::read_u16(&resp[0..2])))
    }

    pub fn get_value(&self, param: Param) -> Result<(RadioResult, u16), RadioError> {
        let mut req = [0u8; 2];
        BigEndian::write_u16(&mut req, param as u16);
        let resp = self.transport.request(RequestKind(request::GET_VALUE), &req)?;
        if resp.len() < 4 {
            return Err(RadioError::Response(ResponseError));
        }
        let result = RadioResult::from_u16(BigEndian::read_u16(&resp[0..2]));
        let value = BigEndian::read_u16(&resp[2..4]);
        Ok((result, value))
    }

    pub fn set_value(&self, param: Param, value: u16) -> Result<RadioResult, RadioError> {
        let mut req = [0u8; 4];
        BigEndian::write_u16(&mut req[0..2], param as u16);
        BigEndian::write_u16(&mut req[2..4], value);
        let resp = self.transport.request(RequestKind(request::SET_VALUE), &req)?;
        if resp.len() < 2 {
            return Err(RadioError::Response(ResponseError));
        }
        Ok(RadioResult::from_u16(BigEndian::read_u16(&resp[0..2])))
    }

    pub fn get_object(&self, param: Param, n: u8) -> Result<(RadioResult, Vec<u8>), RadioError> {
        let mut req = [0u8; 3];
        BigEndian::write_u16(&mut req[0..2], param as u16);
        req[2] = n;
        let resp = self.transport.request(RequestKind(request::GET_OBJECT), &req)?;
        if resp.len() < 2 {
            return Err(RadioError::Response(ResponseError));
        }
        let result = RadioResult::from_u16(BigEndian::read_u16(&resp[0..2]));
        Ok((result, resp[2..].to_vec()))
    }

    pub fn set_object(&self, param: Param, data: &[u8]) -> Result<RadioResult, RadioError> {
        let mut req = Vec::with_capacity(4 + data.len());
        let mut h = [0u8; 4];
        BigEndian::write_u16(&mut h[0..2], param as u16);
        BigEndian::write_u16(&mut h[2..4], data.len() as u16);
        req.extend_from_slice(&h);
        req.extend_from_slice(data);
        let resp = self.transport.request(RequestKind(request::SET_OBJECT), &req)?;
        if resp.len() < 2 {
            return Err(RadioError::Response(ResponseError));
        }
        Ok(RadioResult::from_u16(BigEndian::read_u16(&resp[0..2])))
    }

    pub fn get_mem(&self, addr: u16, n: u8, reversed: bool) -> Result<Vec<u8>, RadioError> {
        let mut req = [0u8; 3];
        BigEndian::write_u16(&mut req[0..2], addr);
        req[2] = n;
        let kind = if reversed { request::GET_MEM_REV } else { request::GET_MEM };
        let resp = self.transport.request(RequestKind(kind), &req)?;
        Ok(resp)
    }

    pub fn set_mem(&self, addr: u16, data: &[u8], reversed: bool) -> Result<(), RadioError> {
        let mut req = Vec::with_capacity(2 + data.len());
        let mut h = [0u8; 2];
        BigEndian::write_u16(&mut h, addr);
        req.extend_from_slice(&h);
        req.extend_from_slice(data);
        let kind = if reversed { request::SET_MEM_REV } else { request::SET_MEM };
        self.transport.request(RequestKind(kind), &req)?;
        Ok(())
    }

    pub fn get_leds(&self) -> Result<u8, RadioError> {
        let resp = self.transport.request(RequestKind(request::GET_LEDS), &[])?;
        resp.first().copied().ok_or(RadioError::Response(ResponseError))
    }

    pub fn set_leds(&self, mask: u8, value: u8) -> Result<(), RadioError> {
        self.transport.request(RequestKind(request::SET_LEDS), &[mask, value])?;
        Ok(())
    }
}
