//! Progress events emitted during a DFU transfer.

use serde::{Deserialize, Serialize};

use crate::control_point::ObjectType;

/// Which payload of an update is being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Init packet (type `Command` on the wire).
    InitPacket,
    /// Firmware image (type `Data` on the wire).
    Firmware,
}

impl PayloadKind {
    /// Human-readable payload name used in stage messages.
    pub fn label(&self) -> &'static str {
        match self {
            PayloadKind::InitPacket => "init packet",
            PayloadKind::Firmware => "firmware",
        }
    }
}

/// Phase of a payload transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    /// Creating the first object of a fresh transfer.
    Initializing,
    /// Continuing a transfer the target already holds part of.
    Resuming,
    /// Streaming object data.
    Transferring,
}

/// Progress events for UI feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum DfuEvent {
    /// A payload transfer entered a new stage.
    Progress {
        stage: TransferStage,
        kind: PayloadKind,
        offset: u32,
    },
    /// One packet was accepted by the adapter.
    PacketWritten { object_type: ObjectType, offset: u32 },
}

impl DfuEvent {
    /// Get a human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            DfuEvent::Progress { stage, kind, .. } => match stage {
                TransferStage::Initializing => format!("Initializing {}", kind.label()),
                TransferStage::Resuming => format!("Resuming {} transfer", kind.label()),
                TransferStage::Transferring => format!("Transferring {}", kind.label()),
            },
            DfuEvent::PacketWritten { offset, .. } => {
                format!("Transferred {} bytes", offset)
            }
        }
    }
}

/// Callback invoked with every progress event.
pub type EventHandler = Box<dyn Fn(DfuEvent) + Send + Sync>;
