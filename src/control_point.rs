//! Control-point encoding and the request/response engine.
//!
//! Implements the secure DFU control-point wire format: requests are
//! opcode-led byte strings written to the control-point characteristic,
//! responses arrive as notifications led by the `RESPONSE` opcode, the
//! echoed request opcode, and a result code.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::config::{RECEIPT_TIMEOUT, RESPONSE_TIMEOUT};
use crate::error::{DfuError, DfuResult};
use crate::gatt::{GattAdapter, Notifications};
use uuid::Uuid;

// ============================================================================
// Wire Constants
// ============================================================================

/// Control-point request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Create a new object of a given type and size.
    Create = 0x01,
    /// Set the Packet Receipt Notification period.
    SetPrn = 0x02,
    /// Report the current offset and CRC-32.
    CalculateCrc = 0x03,
    /// Execute (commit) the current object.
    Execute = 0x04,
    /// Select the last object of a type.
    Select = 0x06,
    /// Response marker (target to host only).
    Response = 0x60,
}

/// Protocol-level object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet object.
    Command = 0x01,
    /// Firmware data object.
    Data = 0x02,
}

/// Result codes the target reports in response notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    InvalidCode = 0x00,
    Success = 0x01,
    OpcodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
}

impl ResultCode {
    /// Parse a result code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ResultCode::InvalidCode),
            0x01 => Some(ResultCode::Success),
            0x02 => Some(ResultCode::OpcodeNotSupported),
            0x03 => Some(ResultCode::InvalidParameter),
            0x04 => Some(ResultCode::InsufficientResources),
            0x05 => Some(ResultCode::InvalidObject),
            0x07 => Some(ResultCode::UnsupportedType),
            0x08 => Some(ResultCode::OperationNotPermitted),
            0x0A => Some(ResultCode::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::InvalidCode => "Invalid opcode",
            ResultCode::Success => "Operation successful",
            ResultCode::OpcodeNotSupported => "Opcode not supported",
            ResultCode::InvalidParameter => "Missing or invalid parameter",
            ResultCode::InsufficientResources => "Not enough resources for the object",
            ResultCode::InvalidObject => "Object integrity check failed",
            ResultCode::UnsupportedType => "Unsupported object type",
            ResultCode::OperationNotPermitted => "Operation not permitted in this state",
            ResultCode::OperationFailed => "Operation failed",
        }
    }
}

// ============================================================================
// Request Encoding
// ============================================================================

/// A control-point request, one variant per opcode the host issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Create { object_type: ObjectType, size: u32 },
    SetPrn { prn: u16 },
    CalculateCrc,
    Execute,
    Select { object_type: ObjectType },
}

impl Request {
    /// Opcode this request is encoded with (and its response echoes).
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::SetPrn { .. } => OpCode::SetPrn,
            Request::CalculateCrc => OpCode::CalculateCrc,
            Request::Execute => OpCode::Execute,
            Request::Select { .. } => OpCode::Select,
        }
    }

    /// Encode the request body, integers little-endian.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::Create { object_type, size } => {
                let mut frame = Vec::with_capacity(6);
                frame.push(OpCode::Create as u8);
                frame.push(object_type as u8);
                frame.extend_from_slice(&size.to_le_bytes());
                frame
            }
            Request::SetPrn { prn } => {
                let mut frame = Vec::with_capacity(3);
                frame.push(OpCode::SetPrn as u8);
                frame.extend_from_slice(&prn.to_le_bytes());
                frame
            }
            Request::CalculateCrc => vec![OpCode::CalculateCrc as u8],
            Request::Execute => vec![OpCode::Execute as u8],
            Request::Select { object_type } => {
                vec![OpCode::Select as u8, object_type as u8]
            }
        }
    }
}

// ============================================================================
// Response Decoding
// ============================================================================

/// `(offset, crc32)` pair returned by `CALCULATE_CRC` and by PRN
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResponse {
    /// Total payload bytes the target has acknowledged.
    pub offset: u32,
    /// CRC-32 of the acknowledged prefix.
    pub crc32: u32,
}

impl ChecksumResponse {
    /// Parse from a success-response body.
    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() < 8 {
            return Err(DfuError::InvalidResponse {
                reason: format!("checksum body is {} bytes, expected 8", body.len()),
            });
        }
        Ok(Self {
            offset: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            crc32: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
        })
    }
}

/// State of the last object of a type, returned by `SELECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectResponse {
    /// Largest object the target accepts for this type.
    pub max_size: u32,
    /// Total payload bytes the target has acknowledged.
    pub offset: u32,
    /// CRC-32 of the acknowledged prefix.
    pub crc32: u32,
}

impl SelectResponse {
    /// Parse from a success-response body.
    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() < 12 {
            return Err(DfuError::InvalidResponse {
                reason: format!("select body is {} bytes, expected 12", body.len()),
            });
        }
        Ok(Self {
            max_size: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            offset: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
            crc32: u32::from_le_bytes([body[8], body[9], body[10], body[11]]),
        })
    }
}

/// Decode a response notification for the given pending opcode.
///
/// Returns the success-response body. A frame that is not `RESPONSE`-led
/// or does not echo the pending opcode fails the request; a non-success
/// result code maps to `DfuError::Target`.
fn decode_response(pending: OpCode, frame: &[u8]) -> DfuResult<Vec<u8>> {
    if frame.len() < 3 {
        return Err(DfuError::InvalidResponse {
            reason: format!("notification is {} bytes, expected at least 3", frame.len()),
        });
    }
    if frame[0] != OpCode::Response as u8 {
        return Err(DfuError::InvalidResponse {
            reason: format!("notification does not start with RESPONSE: 0x{:02X}", frame[0]),
        });
    }
    if frame[1] != pending as u8 {
        return Err(DfuError::InvalidResponse {
            reason: format!(
                "response echoes opcode 0x{:02X}, expected 0x{:02X}",
                frame[1], pending as u8
            ),
        });
    }
    match ResultCode::from_byte(frame[2]) {
        Some(ResultCode::Success) => Ok(frame[3..].to_vec()),
        Some(code) => Err(DfuError::Target(code)),
        None => Err(DfuError::InvalidResponse {
            reason: format!("unknown result code 0x{:02X}", frame[2]),
        }),
    }
}

// ============================================================================
// Request/Response Engine
// ============================================================================

/// Single-outstanding-request engine for the control-point
/// characteristic.
///
/// Exclusive access (`&mut self`) guarantees a new request is never
/// issued while a previous one is pending. Notifications queued while no
/// request was pending are discarded before each request, per the
/// demultiplexing rule: only a pending request (or an armed PRN wait in
/// the object writer) may consume a notification.
pub struct ControlPointService<A> {
    adapter: Arc<A>,
    characteristic: Uuid,
    notifications: Notifications,
    response_timeout: Duration,
    receipt_timeout: Duration,
}

impl<A: GattAdapter> ControlPointService<A> {
    /// Create a service over an already-subscribed characteristic.
    pub fn new(adapter: Arc<A>, characteristic: Uuid, notifications: Notifications) -> Self {
        Self {
            adapter,
            characteristic,
            notifications,
            response_timeout: RESPONSE_TIMEOUT,
            receipt_timeout: RECEIPT_TIMEOUT,
        }
    }

    /// Override the control-point response window.
    pub fn set_response_timeout(&mut self, window: Duration) {
        self.response_timeout = window;
    }

    /// Override the PRN receipt window.
    pub fn set_receipt_timeout(&mut self, window: Duration) {
        self.receipt_timeout = window;
    }

    /// Issue a request and await its matching response notification.
    async fn request(&mut self, request: Request) -> DfuResult<Vec<u8>> {
        // Anything still queued arrived while no request was pending.
        while self.notifications.try_recv().is_ok() {}

        debug!("control point request: {:?}", request);
        self.adapter
            .write(self.characteristic, &request.encode())
            .await?;

        let frame = self.next_notification(self.response_timeout).await?;
        let body = decode_response(request.opcode(), &frame)?;
        debug!("control point response: {} byte body", body.len());
        Ok(body)
    }

    async fn next_notification(&mut self, window: Duration) -> DfuResult<Vec<u8>> {
        match timeout(window, self.notifications.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(DfuError::Gatt {
                reason: "notification stream closed".into(),
            }),
            Err(_) => Err(DfuError::NotificationTimeout),
        }
    }

    /// `CREATE` an object; success carries an empty body.
    pub async fn create(&mut self, object_type: ObjectType, size: u32) -> DfuResult<()> {
        self.request(Request::Create { object_type, size }).await?;
        Ok(())
    }

    /// `SET_PRN`: ask the target to notify `(offset, crc32)` every `prn`
    /// packets; zero disables the notifications.
    pub async fn set_prn(&mut self, prn: u16) -> DfuResult<()> {
        self.request(Request::SetPrn { prn }).await?;
        Ok(())
    }

    /// `CALCULATE_CRC`: report the target's current transfer state.
    pub async fn calculate_crc(&mut self) -> DfuResult<ChecksumResponse> {
        let body = self.request(Request::CalculateCrc).await?;
        ChecksumResponse::parse(&body)
    }

    /// `EXECUTE` the current object.
    pub async fn execute(&mut self) -> DfuResult<()> {
        self.request(Request::Execute).await?;
        Ok(())
    }

    /// `SELECT` the last object of a type.
    pub async fn select(&mut self, object_type: ObjectType) -> DfuResult<SelectResponse> {
        let body = self.request(Request::Select { object_type }).await?;
        SelectResponse::parse(&body)
    }

    /// Await a Packet Receipt Notification.
    ///
    /// A PRN is a `CALCULATE_CRC`-shaped response the target emits
    /// unprompted; it is consumed here, outside the request slot, while
    /// the object writer has it armed.
    pub async fn packet_receipt(&mut self) -> DfuResult<ChecksumResponse> {
        let frame = self.next_notification(self.receipt_timeout).await?;
        let body = decode_response(OpCode::CalculateCrc, &frame)?;
        ChecksumResponse::parse(&body)
    }
}
