//! Object writer: streams one object's bytes to the packet
//! characteristic in MTU-sized packets, paced by Packet Receipt
//! Notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use crate::config::{DEFAULT_MTU, DEFAULT_PRN};
use crate::control_point::{ChecksumResponse, ControlPointService, ObjectType};
use crate::error::{DfuError, DfuResult};
use crate::gatt::GattAdapter;
use crate::progress::{DfuEvent, EventHandler};

/// CRC-32 of a whole buffer (IEEE 802.3, as the DFU target computes it).
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Rolling `(offset, crc32)` transfer state.
///
/// `offset` counts total payload bytes acknowledged by the host side;
/// `crc32` is the CRC-32 of `payload[0..offset]`, maintained as an
/// accumulator so large firmware never needs a full recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub offset: u32,
    pub crc32: u32,
}

impl TransferProgress {
    /// Seed the state, typically from a `SELECT` response.
    pub fn new(offset: u32, crc32: u32) -> Self {
        Self { offset, crc32 }
    }

    /// Fold one packet into the rolling state.
    pub fn advance(&mut self, packet: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.crc32);
        hasher.update(packet);
        self.crc32 = hasher.finalize();
        self.offset += packet.len() as u32;
    }

    /// Check a target-reported checksum against the local state.
    ///
    /// Offset is compared first; a diverged offset makes the CRC
    /// meaningless.
    pub fn verify(&self, reported: ChecksumResponse) -> DfuResult<()> {
        if reported.offset != self.offset {
            return Err(DfuError::InvalidOffset {
                expected: self.offset,
                actual: reported.offset,
            });
        }
        if reported.crc32 != self.crc32 {
            return Err(DfuError::InvalidCrc {
                expected: self.crc32,
                actual: reported.crc32,
            });
        }
        Ok(())
    }
}

/// Streams object bytes to the packet characteristic.
///
/// Writes are issued serially: the next packet goes out only after the
/// adapter has accepted the previous one. With PRN enabled the writer
/// additionally stops every `prn` packets to consume and verify the
/// target's receipt notification.
pub struct ObjectWriter<A> {
    adapter: Arc<A>,
    characteristic: Uuid,
    mtu: usize,
    prn: u16,
    abort: Arc<AtomicBool>,
}

impl<A: GattAdapter> ObjectWriter<A> {
    /// Create a writer for the packet characteristic.
    pub fn new(adapter: Arc<A>, characteristic: Uuid, abort: Arc<AtomicBool>) -> Self {
        Self {
            adapter,
            characteristic,
            mtu: DEFAULT_MTU,
            prn: DEFAULT_PRN,
            abort,
        }
    }

    /// Bytes per packet-characteristic write.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu.max(1);
    }

    /// Packet Receipt Notification period; zero disables the wait.
    ///
    /// Must match the period configured on the target via `SET_PRN`.
    pub fn set_prn(&mut self, prn: u16) {
        self.prn = prn;
    }

    /// Write one object's bytes, starting from `start`.
    ///
    /// Returns the rolled-forward `(offset, crc32)` state. The abort
    /// flag is observed at every packet boundary.
    pub async fn write_object(
        &self,
        control: &mut ControlPointService<A>,
        data: &[u8],
        object_type: ObjectType,
        start: TransferProgress,
        events: Option<&EventHandler>,
    ) -> DfuResult<TransferProgress> {
        let mut progress = start;
        let mut unacknowledged: u16 = 0;

        debug!(
            "writing {:?} object: {} bytes from offset {}",
            object_type,
            data.len(),
            progress.offset
        );

        for packet in data.chunks(self.mtu) {
            if self.abort.load(Ordering::SeqCst) {
                return Err(DfuError::Aborted);
            }

            self.adapter.write(self.characteristic, packet).await?;
            progress.advance(packet);

            if let Some(handler) = events {
                handler(DfuEvent::PacketWritten {
                    object_type,
                    offset: progress.offset,
                });
            }

            if self.prn > 0 {
                unacknowledged += 1;
                if unacknowledged == self.prn {
                    unacknowledged = 0;
                    let receipt = control.packet_receipt().await?;
                    progress.verify(receipt)?;
                }
            }
        }

        Ok(progress)
    }
}
