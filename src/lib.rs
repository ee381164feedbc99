//! Secure DFU client for Nordic-style BLE bootloaders.
//!
//! This crate implements the host side of the secure DFU protocol over
//! a GATT link: it reads an update package, drives the control-point
//! state machine, streams firmware objects with CRC-32 verification,
//! and resumes interrupted transfers from the target-reported offset.
//!
//! # Protocol Overview
//!
//! Each payload (init packet, then firmware) is transferred as one or
//! more *objects* bounded by the target-advertised maximum size:
//! 1. **SELECT** - Read the target's `(max_size, offset, crc32)` state
//! 2. **Resume or CREATE** - Continue a matching partial transfer, or
//!    create a fresh object
//! 3. **Write** - Stream MTU-sized packets, paced by Packet Receipt
//!    Notifications
//! 4. **Validate** - Compare `CALCULATE_CRC` against the local rolling
//!    state
//! 5. **EXECUTE** - Commit the object
//!
//! The BLE stack itself stays outside the crate: callers supply a
//! [`GattAdapter`] implementation and the engine drives it.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use nrf_dfu::{DfuController, DfuTransport, UpdatePackage};
//!
//! let adapter = Arc::new(/* platform GATT adapter */);
//! let transport = DfuTransport::discover(adapter).await?;
//! let mut controller = DfuController::new(transport);
//! controller.on_event(|event| println!("{}", event.message()));
//!
//! let mut package = UpdatePackage::open("app_dfu_package.zip")?;
//! controller.run(&mut package).await?;
//! controller.close().await?;
//! ```

pub mod config;
pub mod control_point;
pub mod controller;
pub mod error;
pub mod gatt;
pub mod package;
pub mod progress;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod test_helpers;

// Re-export the types most callers need.

// Orchestration
pub use controller::DfuController;
pub use transport::{AbortHandle, DfuTransport};

// Adapter seam
pub use gatt::{GattAdapter, GattService, NotificationSink, Notifications};

// Wire protocol
pub use control_point::{
    ChecksumResponse, ControlPointService, ObjectType, OpCode, Request, ResultCode,
    SelectResponse,
};

// Transfer state
pub use writer::{crc32, ObjectWriter, TransferProgress};

// Packages and progress
pub use error::{DfuError, DfuResult};
pub use package::{Manifest, ManifestEntry, SizeMetadata, Update, UpdatePackage, UpdateSlot};
pub use progress::{DfuEvent, EventHandler, PayloadKind, TransferStage};
