//! Scripted in-memory DFU target.
//!
//! `MockGatt` implements [`GattAdapter`] and behaves like a compliant
//! secure-DFU bootloader: it answers control-point requests, accumulates
//! packet writes into the open object, emits PRN frames, and commits on
//! `EXECUTE`. Tests can preset transfer state, inject faulty responses,
//! and trip an abort flag after a packet count.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::config::{CONTROL_POINT_UUID, DFU_SERVICE_UUID, PACKET_UUID};
use crate::control_point::{ObjectType, OpCode, ResultCode};
use crate::error::{DfuError, DfuResult};
use crate::gatt::{GattAdapter, GattService, NotificationSink, Notifications};
use crate::transport::AbortHandle;
use crate::writer::TransferProgress;

/// Control-point and packet operations the target observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOp {
    Create { object_type: ObjectType, size: u32 },
    SetPrn(u16),
    CalculateCrc,
    Execute { object_type: ObjectType, offset: u32 },
    Select(ObjectType),
    Packet { len: u32 },
}

/// Scripted misbehavior for one control-point request.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Respond with a non-success result code.
    Reject(ResultCode),
    /// Swallow the request; no response notification.
    Drop,
}

struct FaultSpec {
    opcode: OpCode,
    nth: u32,
    fault: Fault,
}

#[derive(Default)]
struct ObjectSlot {
    max_size: u32,
    /// State as of the last EXECUTE.
    committed: TransferProgress,
    /// State including the open (un-executed) object.
    current: TransferProgress,
}

struct TargetState {
    sink: Option<NotificationSink>,
    command: ObjectSlot,
    data: ObjectSlot,
    active: Option<ObjectType>,
    prn: u16,
    packets_since_receipt: u16,
    receipts_sent: u32,
    ops: Vec<TargetOp>,
    faults: Vec<FaultSpec>,
    request_counts: HashMap<u8, u32>,
    skew_crc: bool,
    skew_offset: bool,
    abort_after: Option<(u32, AbortHandle)>,
    fail_subscriptions: bool,
    advertise_dfu_service: bool,
}

/// In-memory DFU target reachable through the [`GattAdapter`] trait.
pub struct MockGatt {
    state: Mutex<TargetState>,
}

impl MockGatt {
    /// Target with default object sizes (command 256, data 4096).
    pub fn new() -> Self {
        Self::with_max_sizes(256, 4096)
    }

    /// Target advertising the given per-type maximum object sizes.
    pub fn with_max_sizes(command_max: u32, data_max: u32) -> Self {
        Self {
            state: Mutex::new(TargetState {
                sink: None,
                command: ObjectSlot {
                    max_size: command_max,
                    ..ObjectSlot::default()
                },
                data: ObjectSlot {
                    max_size: data_max,
                    ..ObjectSlot::default()
                },
                active: None,
                prn: 0,
                packets_since_receipt: 0,
                receipts_sent: 0,
                ops: Vec::new(),
                faults: Vec::new(),
                request_counts: HashMap::new(),
                skew_crc: false,
                skew_offset: false,
                abort_after: None,
                fail_subscriptions: false,
                advertise_dfu_service: true,
            }),
        }
    }

    /// Set committed and current state to `(offset, crc32)`, as after a
    /// completed object boundary.
    pub fn preset_object(&self, object_type: ObjectType, offset: u32, crc32: u32) {
        let mut state = self.state.lock().unwrap();
        let slot = slot_mut(&mut state, object_type);
        slot.committed = TransferProgress::new(offset, crc32);
        slot.current = slot.committed;
    }

    /// Set only the current state, leaving the committed boundary where
    /// `preset_object` put it; models an open partial object.
    pub fn preset_current(&self, object_type: ObjectType, offset: u32, crc32: u32) {
        let mut state = self.state.lock().unwrap();
        slot_mut(&mut state, object_type).current = TransferProgress::new(offset, crc32);
    }

    /// Apply `fault` to the `nth` request carrying `opcode` (1-based).
    pub fn fail_nth(&self, opcode: OpCode, nth: u32, fault: Fault) {
        self.state.lock().unwrap().faults.push(FaultSpec {
            opcode,
            nth,
            fault,
        });
    }

    /// Corrupt the CRC in the next checksum-bearing frame (CALCULATE_CRC
    /// response or PRN).
    pub fn skew_next_crc(&self) {
        self.state.lock().unwrap().skew_crc = true;
    }

    /// Corrupt the offset in the next checksum-bearing frame.
    pub fn skew_next_offset(&self) {
        self.state.lock().unwrap().skew_offset = true;
    }

    /// Trip `handle` once `count` more packet writes have been accepted.
    pub fn abort_after_packets(&self, count: u32, handle: AbortHandle) {
        self.state.lock().unwrap().abort_after = Some((count, handle));
    }

    /// Make `start_notifications` fail.
    pub fn fail_subscriptions(&self) {
        self.state.lock().unwrap().fail_subscriptions = true;
    }

    /// Stop advertising the DFU service in `services()`.
    pub fn hide_dfu_service(&self) {
        self.state.lock().unwrap().advertise_dfu_service = false;
    }

    /// Everything the target observed, in arrival order.
    pub fn ops(&self) -> Vec<TargetOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Number of PRN frames the target emitted.
    pub fn receipts_sent(&self) -> u32 {
        self.state.lock().unwrap().receipts_sent
    }

    /// Current `(offset, crc32)` state for an object type.
    pub fn object_state(&self, object_type: ObjectType) -> TransferProgress {
        let mut state = self.state.lock().unwrap();
        slot_mut(&mut state, object_type).current
    }

    fn handle_control(&self, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let opcode = payload[0];

        let count = state.request_counts.entry(opcode).or_insert(0);
        *count += 1;
        let count = *count;

        if let Some(index) = state
            .faults
            .iter()
            .position(|spec| spec.opcode as u8 == opcode && spec.nth == count)
        {
            let spec = state.faults.remove(index);
            record_request(&mut state, payload);
            match spec.fault {
                Fault::Drop => {}
                Fault::Reject(code) => {
                    send(&state, vec![OpCode::Response as u8, opcode, code as u8]);
                }
            }
            return;
        }

        record_request(&mut state, payload);

        match opcode {
            0x01 => {
                let object_type = object_type_from(payload[1]);
                let slot = slot_mut(&mut state, object_type);
                match object_type {
                    // A new init packet always starts at offset zero.
                    ObjectType::Command => {
                        slot.committed = TransferProgress::default();
                        slot.current = TransferProgress::default();
                    }
                    // A new data object discards only the un-executed tail.
                    ObjectType::Data => slot.current = slot.committed,
                }
                state.active = Some(object_type);
                state.packets_since_receipt = 0;
                respond_success(&state, opcode, &[]);
            }
            0x02 => {
                state.prn = u16::from_le_bytes([payload[1], payload[2]]);
                state.packets_since_receipt = 0;
                respond_success(&state, opcode, &[]);
            }
            0x03 => {
                let report = checksum_report(&mut state);
                respond_success(&state, opcode, &report);
            }
            0x04 => {
                let object_type = state.active.expect("EXECUTE with no object selected");
                let slot = slot_mut(&mut state, object_type);
                slot.committed = slot.current;
                let offset = slot.committed.offset;
                if object_type == ObjectType::Command {
                    // An executed init packet starts a fresh firmware image.
                    state.data.committed = TransferProgress::default();
                    state.data.current = TransferProgress::default();
                }
                state.ops.push(TargetOp::Execute {
                    object_type,
                    offset,
                });
                respond_success(&state, opcode, &[]);
            }
            0x06 => {
                let object_type = object_type_from(payload[1]);
                state.active = Some(object_type);
                state.packets_since_receipt = 0;
                let slot = slot_mut(&mut state, object_type);
                let mut body = Vec::with_capacity(12);
                body.extend_from_slice(&slot.max_size.to_le_bytes());
                body.extend_from_slice(&slot.current.offset.to_le_bytes());
                body.extend_from_slice(&slot.current.crc32.to_le_bytes());
                respond_success(&state, opcode, &body);
            }
            other => panic!("mock target received unknown opcode 0x{:02X}", other),
        }
    }

    fn handle_packet(&self, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let object_type = state.active.expect("packet write with no object selected");
        slot_mut(&mut state, object_type).current.advance(payload);
        state.ops.push(TargetOp::Packet {
            len: payload.len() as u32,
        });

        if state.prn > 0 {
            state.packets_since_receipt += 1;
            if state.packets_since_receipt == state.prn {
                state.packets_since_receipt = 0;
                state.receipts_sent += 1;
                let report = checksum_report(&mut state);
                let mut frame = vec![
                    OpCode::Response as u8,
                    OpCode::CalculateCrc as u8,
                    ResultCode::Success as u8,
                ];
                frame.extend_from_slice(&report);
                send(&state, frame);
            }
        }

        if let Some((remaining, handle)) = state.abort_after.take() {
            if remaining <= 1 {
                handle.abort();
            } else {
                state.abort_after = Some((remaining - 1, handle));
            }
        }
    }
}

impl Default for MockGatt {
    fn default() -> Self {
        Self::new()
    }
}

impl GattAdapter for MockGatt {
    async fn services(&self) -> DfuResult<Vec<GattService>> {
        let state = self.state.lock().unwrap();
        if !state.advertise_dfu_service {
            return Ok(Vec::new());
        }
        Ok(vec![GattService {
            uuid: DFU_SERVICE_UUID,
            characteristics: vec![CONTROL_POINT_UUID, PACKET_UUID],
        }])
    }

    async fn start_notifications(&self, characteristic: Uuid) -> DfuResult<Notifications> {
        let mut state = self.state.lock().unwrap();
        if state.fail_subscriptions {
            return Err(DfuError::Gatt {
                reason: "subscription refused".into(),
            });
        }
        assert_eq!(characteristic, CONTROL_POINT_UUID);
        let (sink, notifications) = tokio::sync::mpsc::unbounded_channel();
        state.sink = Some(sink);
        Ok(notifications)
    }

    async fn stop_notifications(&self, characteristic: Uuid) -> DfuResult<()> {
        assert_eq!(characteristic, CONTROL_POINT_UUID);
        self.state.lock().unwrap().sink = None;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> DfuResult<()> {
        if characteristic == CONTROL_POINT_UUID {
            self.handle_control(payload);
            Ok(())
        } else if characteristic == PACKET_UUID {
            self.handle_packet(payload);
            Ok(())
        } else {
            Err(DfuError::Gatt {
                reason: format!("write to unknown characteristic {}", characteristic),
            })
        }
    }
}

fn slot_mut(state: &mut TargetState, object_type: ObjectType) -> &mut ObjectSlot {
    match object_type {
        ObjectType::Command => &mut state.command,
        ObjectType::Data => &mut state.data,
    }
}

fn object_type_from(byte: u8) -> ObjectType {
    match byte {
        0x01 => ObjectType::Command,
        0x02 => ObjectType::Data,
        other => panic!("mock target received unknown object type 0x{:02X}", other),
    }
}

fn record_request(state: &mut TargetState, payload: &[u8]) {
    let op = match payload[0] {
        0x01 => TargetOp::Create {
            object_type: object_type_from(payload[1]),
            size: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
        },
        0x02 => TargetOp::SetPrn(u16::from_le_bytes([payload[1], payload[2]])),
        0x03 => TargetOp::CalculateCrc,
        0x04 => return, // recorded with its committed offset in the handler
        0x06 => TargetOp::Select(object_type_from(payload[1])),
        other => panic!("mock target received unknown opcode 0x{:02X}", other),
    };
    state.ops.push(op);
}

/// Active slot's `(offset, crc32)` with any scripted skew applied.
fn checksum_report(state: &mut TargetState) -> Vec<u8> {
    let object_type = state.active.expect("checksum with no object selected");
    let progress = slot_mut(state, object_type).current;
    let mut offset = progress.offset;
    let mut crc32 = progress.crc32;
    if state.skew_offset {
        state.skew_offset = false;
        offset = offset.wrapping_add(1);
    }
    if state.skew_crc {
        state.skew_crc = false;
        crc32 ^= 1;
    }
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&offset.to_le_bytes());
    body.extend_from_slice(&crc32.to_le_bytes());
    body
}

fn respond_success(state: &TargetState, opcode: u8, body: &[u8]) {
    let mut frame = vec![OpCode::Response as u8, opcode, ResultCode::Success as u8];
    frame.extend_from_slice(body);
    send(state, frame);
}

fn send(state: &TargetState, frame: Vec<u8>) {
    if let Some(sink) = &state.sink {
        sink.send(frame).ok();
    }
}
