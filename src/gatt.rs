//! GATT adapter seam for DFU communication.
//!
//! The DFU engine never touches a BLE stack directly; it drives this
//! trait-based abstraction, enabling both real hardware adapters and
//! mock testing.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DfuResult;

/// Stream of value-changed notifications for one characteristic.
///
/// The adapter pushes each notification payload as it arrives; the DFU
/// engine consumes them at its suspension points. The channel is
/// unbounded because the protocol itself paces the target (a compliant
/// target emits at most one notification per outstanding request or PRN
/// window).
pub type Notifications = mpsc::UnboundedReceiver<Vec<u8>>;

/// Sender half handed to adapter implementations.
pub type NotificationSink = mpsc::UnboundedSender<Vec<u8>>;

/// A GATT service discovered on the connected device.
#[derive(Debug, Clone)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// UUIDs of the characteristics the service contains.
    pub characteristics: Vec<Uuid>,
}

/// Asynchronous GATT primitives the DFU engine requires.
///
/// All operations report failure as an error value. `write` resolves
/// once the stack has accepted the bytes for transmission; the engine
/// issues the next packet write only after that signal, which gives the
/// serial ordering the protocol relies on.
#[allow(async_fn_in_trait)]
pub trait GattAdapter {
    /// Enumerate services and their characteristics on the device.
    async fn services(&self) -> DfuResult<Vec<GattService>>;

    /// Enable notifications on a characteristic and return the stream
    /// of value-changed payloads.
    async fn start_notifications(&self, characteristic: Uuid) -> DfuResult<Notifications>;

    /// Disable notifications on a characteristic.
    async fn stop_notifications(&self, characteristic: Uuid) -> DfuResult<()>;

    /// Write bytes to a characteristic.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> DfuResult<()>;
}
