//! High-level DFU orchestrator.
//!
//! Drives a full update: every slot the package carries, in canonical
//! order, init packet first and firmware second, over one shared
//! transport.

use log::info;

use crate::error::DfuResult;
use crate::gatt::GattAdapter;
use crate::package::UpdatePackage;
use crate::progress::DfuEvent;
use crate::transport::{AbortHandle, DfuTransport};

/// Runs complete DFU updates over a [`DfuTransport`].
pub struct DfuController<A: GattAdapter> {
    transport: DfuTransport<A>,
}

impl<A: GattAdapter> DfuController<A> {
    /// Wrap a transport.
    pub fn new(transport: DfuTransport<A>) -> Self {
        Self { transport }
    }

    /// Register a progress event callback.
    pub fn on_event(&mut self, handler: impl Fn(DfuEvent) + Send + Sync + 'static) {
        self.transport.on_event(handler);
    }

    /// Request an abort of the transfer in flight.
    pub fn abort(&self) {
        self.transport.abort();
    }

    /// Handle for aborting from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.transport.abort_handle()
    }

    /// Apply every update in the package, in canonical slot order.
    ///
    /// The first terminal error stops the run; subsequent slots are not
    /// attempted. Teardown stays with the caller: the transport is left
    /// open for inspection or `close`.
    pub async fn run(&mut self, package: &mut UpdatePackage) -> DfuResult<()> {
        for update in package.updates()? {
            info!(
                "applying {} update ({} byte init packet, {} byte firmware)",
                update.slot,
                update.init_packet.len(),
                update.firmware.len()
            );
            self.transport.send_init_packet(&update.init_packet).await?;
            self.transport.send_firmware(&update.firmware).await?;
        }
        Ok(())
    }

    /// Stop control-point notifications on the underlying transport.
    pub async fn close(&mut self) -> DfuResult<()> {
        self.transport.close().await
    }
}
