//! DFU transport: per-object-type protocol flows over one connected
//! device.
//!
//! Owns the control-point service and the object writer, and runs the
//! select → resume-or-create → write → validate → execute cycle for
//! init packets and firmware images, with retry and abort semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::{
    CONTROL_POINT_UUID, DFU_SERVICE_UUID, MAX_OBJECT_ATTEMPTS, PACKET_UUID, RECEIPT_TIMEOUT,
    RESPONSE_TIMEOUT,
};
use crate::control_point::{ControlPointService, ObjectType, SelectResponse};
use crate::error::{DfuError, DfuResult};
use crate::gatt::GattAdapter;
use crate::progress::{DfuEvent, EventHandler, PayloadKind, TransferStage};
use crate::writer::{crc32, ObjectWriter, TransferProgress};

/// Clonable handle that aborts a transfer in flight.
///
/// The flag is level-triggered: the writer observes it at every packet
/// boundary and fails the next write with `Aborted`. It stays set until
/// the transport is reused for another `send_*` operation.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Request the abort.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Secure DFU transport bound to one adapter and the two DFU
/// characteristics.
///
/// Created closed; the first operation that needs control-point
/// notifications opens it. `close` returns it to the closed state.
pub struct DfuTransport<A: GattAdapter> {
    adapter: Arc<A>,
    control_characteristic: Uuid,
    control: Option<ControlPointService<A>>,
    writer: ObjectWriter<A>,
    abort: Arc<AtomicBool>,
    events: Option<EventHandler>,
    response_timeout: Duration,
    receipt_timeout: Duration,
}

impl<A: GattAdapter> DfuTransport<A> {
    /// Bind a transport to an adapter and characteristic pair.
    pub fn new(adapter: Arc<A>, control_characteristic: Uuid, packet_characteristic: Uuid) -> Self {
        let abort = Arc::new(AtomicBool::new(false));
        let writer = ObjectWriter::new(
            Arc::clone(&adapter),
            packet_characteristic,
            Arc::clone(&abort),
        );
        Self {
            adapter,
            control_characteristic,
            control: None,
            writer,
            abort,
            events: None,
            response_timeout: RESPONSE_TIMEOUT,
            receipt_timeout: RECEIPT_TIMEOUT,
        }
    }

    /// Locate the DFU service on the device and bind to its
    /// characteristics.
    pub async fn discover(adapter: Arc<A>) -> DfuResult<Self> {
        let services = adapter.services().await?;
        let service = services
            .iter()
            .find(|service| service.uuid == DFU_SERVICE_UUID)
            .ok_or_else(|| DfuError::Gatt {
                reason: "DFU service not found".into(),
            })?;
        for characteristic in [CONTROL_POINT_UUID, PACKET_UUID] {
            if !service.characteristics.contains(&characteristic) {
                return Err(DfuError::Gatt {
                    reason: format!("DFU characteristic {} not found", characteristic),
                });
            }
        }
        Ok(Self::new(adapter, CONTROL_POINT_UUID, PACKET_UUID))
    }

    /// Bytes per packet write. Purely local to the writer.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.writer.set_mtu(mtu);
    }

    /// Set the PRN period on the target and the writer.
    pub async fn set_prn(&mut self, prn: u16) -> DfuResult<()> {
        self.open().await?;
        self.control_mut()?.set_prn(prn).await?;
        self.writer.set_prn(prn);
        Ok(())
    }

    /// Override the control-point response window.
    pub fn set_response_timeout(&mut self, window: Duration) {
        self.response_timeout = window;
        if let Some(control) = &mut self.control {
            control.set_response_timeout(window);
        }
    }

    /// Override the PRN receipt window.
    pub fn set_receipt_timeout(&mut self, window: Duration) {
        self.receipt_timeout = window;
        if let Some(control) = &mut self.control {
            control.set_receipt_timeout(window);
        }
    }

    /// Register a progress event callback.
    pub fn on_event(&mut self, handler: impl Fn(DfuEvent) + Send + Sync + 'static) {
        self.events = Some(Box::new(handler));
    }

    /// Request an abort; the next packet boundary raises `Aborted`.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Handle for aborting from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
        }
    }

    /// Send the init packet (`Command` flow).
    pub async fn send_init_packet(&mut self, init_packet: &[u8]) -> DfuResult<()> {
        self.abort.store(false, Ordering::SeqCst);
        self.open().await?;
        info!("sending init packet ({} bytes)", init_packet.len());

        let select = self.control_mut()?.select(ObjectType::Command).await?;
        debug!(
            "command select: max_size={} offset={} crc32=0x{:08X}",
            select.max_size, select.offset, select.crc32
        );

        if init_packet.len() > select.max_size as usize {
            return Err(DfuError::InitPacketTooLarge {
                size: init_packet.len(),
                max_size: select.max_size as usize,
            });
        }

        let offset = select.offset as usize;
        let resumable = offset > 0
            && offset <= init_packet.len()
            && select.crc32 == crc32(&init_packet[..offset]);

        if resumable {
            self.emit(DfuEvent::Progress {
                stage: TransferStage::Resuming,
                kind: PayloadKind::InitPacket,
                offset: select.offset,
            });
            let seed = TransferProgress::new(select.offset, select.crc32);
            self.write_and_execute(&init_packet[offset..], ObjectType::Command, seed)
                .await?;
        } else {
            self.emit(DfuEvent::Progress {
                stage: TransferStage::Initializing,
                kind: PayloadKind::InitPacket,
                offset: 0,
            });
            self.create_and_write(init_packet, ObjectType::Command, TransferProgress::default())
                .await?;
        }
        Ok(())
    }

    /// Send the firmware image (`Data` flow).
    pub async fn send_firmware(&mut self, firmware: &[u8]) -> DfuResult<()> {
        self.abort.store(false, Ordering::SeqCst);
        self.open().await?;
        info!("sending firmware ({} bytes)", firmware.len());

        let select = self.control_mut()?.select(ObjectType::Data).await?;
        debug!(
            "data select: max_size={} offset={} crc32=0x{:08X}",
            select.max_size, select.offset, select.crc32
        );

        let plan = plan_firmware(firmware, &select)?;
        let mut progress = plan.start;

        if plan.partial.is_empty() && plan.objects.is_empty() {
            debug!("firmware already transferred");
            return Ok(());
        }

        if !plan.partial.is_empty() {
            self.emit(DfuEvent::Progress {
                stage: TransferStage::Resuming,
                kind: PayloadKind::Firmware,
                offset: progress.offset,
            });
            progress = self
                .write_and_execute(plan.partial, ObjectType::Data, progress)
                .await?;
        } else {
            self.emit(DfuEvent::Progress {
                stage: if progress.offset > 0 {
                    TransferStage::Resuming
                } else {
                    TransferStage::Initializing
                },
                kind: PayloadKind::Firmware,
                offset: progress.offset,
            });
        }

        for object in plan.objects {
            progress = self
                .create_and_write(object, ObjectType::Data, progress)
                .await?;
        }
        Ok(())
    }

    /// Stop control-point notifications. Idempotent.
    pub async fn close(&mut self) -> DfuResult<()> {
        if self.control.take().is_some() {
            debug!("disabling control point notifications");
            self.adapter
                .stop_notifications(self.control_characteristic)
                .await
                .map_err(|error| DfuError::NotificationStop {
                    reason: error.to_string(),
                })?;
        }
        Ok(())
    }

    async fn open(&mut self) -> DfuResult<()> {
        if self.control.is_some() {
            return Ok(());
        }
        debug!("enabling control point notifications");
        let notifications = self
            .adapter
            .start_notifications(self.control_characteristic)
            .await
            .map_err(|error| DfuError::NotificationStart {
                reason: error.to_string(),
            })?;
        let mut control = ControlPointService::new(
            Arc::clone(&self.adapter),
            self.control_characteristic,
            notifications,
        );
        control.set_response_timeout(self.response_timeout);
        control.set_receipt_timeout(self.receipt_timeout);
        self.control = Some(control);
        Ok(())
    }

    fn control_mut(&mut self) -> DfuResult<&mut ControlPointService<A>> {
        self.control.as_mut().ok_or(DfuError::TransportClosed)
    }

    /// CREATE + write-object cycle with the per-object retry budget.
    async fn create_and_write(
        &mut self,
        data: &[u8],
        object_type: ObjectType,
        seed: TransferProgress,
    ) -> DfuResult<TransferProgress> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_object(data, object_type, seed).await {
                Ok(progress) => return Ok(progress),
                Err(error) if attempts < MAX_OBJECT_ATTEMPTS && error.is_retriable() => {
                    warn!(
                        "object transfer attempt {} failed: {}; retrying",
                        attempts, error
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_object(
        &mut self,
        data: &[u8],
        object_type: ObjectType,
        seed: TransferProgress,
    ) -> DfuResult<TransferProgress> {
        self.control_mut()?
            .create(object_type, data.len() as u32)
            .await?;
        self.write_and_execute(data, object_type, seed).await
    }

    /// Shared write-object procedure: stream, validate, execute.
    async fn write_and_execute(
        &mut self,
        data: &[u8],
        object_type: ObjectType,
        seed: TransferProgress,
    ) -> DfuResult<TransferProgress> {
        self.emit(DfuEvent::Progress {
            stage: TransferStage::Transferring,
            kind: payload_kind(object_type),
            offset: seed.offset,
        });

        let control = self.control.as_mut().ok_or(DfuError::TransportClosed)?;
        let progress = self
            .writer
            .write_object(control, data, object_type, seed, self.events.as_ref())
            .await?;

        let reported = control.calculate_crc().await?;
        progress.verify(reported)?;
        control.execute().await?;
        Ok(progress)
    }

    fn emit(&self, event: DfuEvent) {
        if let Some(handler) = &self.events {
            handler(event);
        }
    }
}

fn payload_kind(object_type: ObjectType) -> PayloadKind {
    match object_type {
        ObjectType::Command => PayloadKind::InitPacket,
        ObjectType::Data => PayloadKind::Firmware,
    }
}

/// How a firmware payload continues from the target's selected state.
#[derive(Debug)]
struct FirmwarePlan<'a> {
    /// Seed state for the first write.
    start: TransferProgress,
    /// Tail of the currently open object, written without a `CREATE`.
    partial: &'a [u8],
    /// Remaining full objects, each needing create-and-write.
    objects: Vec<&'a [u8]>,
}

/// Compute the resume plan for a firmware payload.
///
/// If the target holds part of an object whose CRC does not match this
/// image, the plan rolls back to that object's boundary and re-creates
/// it; a matching partial object is continued in place.
fn plan_firmware<'a>(firmware: &'a [u8], select: &SelectResponse) -> DfuResult<FirmwarePlan<'a>> {
    let max_size = select.max_size as usize;
    if max_size == 0 {
        return Err(DfuError::InvalidResponse {
            reason: "target advertises zero maximum object size".into(),
        });
    }

    let len = firmware.len();
    let offset = select.offset as usize;

    // More acknowledged bytes than this image has means a different
    // image; start over.
    if offset > len {
        return Ok(FirmwarePlan {
            start: TransferProgress::default(),
            partial: &[],
            objects: firmware.chunks(max_size).collect(),
        });
    }

    let remainder = offset % max_size;
    let mut partial: &'a [u8] = if offset != 0 && offset != len && remainder != 0 {
        &firmware[offset..(offset + max_size - remainder).min(len)]
    } else {
        &[]
    };

    let start = if !partial.is_empty() && select.crc32 != crc32(&firmware[..offset]) {
        // Open object cannot be resumed; re-create from its boundary.
        let rolled = (offset + partial.len()).saturating_sub(max_size);
        partial = &[];
        TransferProgress::new(rolled as u32, crc32(&firmware[..rolled]))
    } else {
        TransferProgress::new(select.offset, select.crc32)
    };

    let tail = &firmware[start.offset as usize + partial.len()..];
    Ok(FirmwarePlan {
        start,
        partial,
        objects: tail.chunks(max_size).collect(),
    })
}
