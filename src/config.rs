//! Configuration constants for the secure DFU protocol.

use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// Secure DFU service (16-bit UUID 0xFE59, expanded to 128 bits).
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);

/// DFU control-point characteristic (requests and response notifications).
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);

/// DFU packet characteristic (object payload bytes, write-without-response).
pub const PACKET_UUID: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);

// ============================================================================
// Transfer Configuration
// ============================================================================

/// Bytes written per packet-characteristic write.
///
/// 20 bytes is the ATT payload available at the BLE default MTU of 23;
/// callers negotiating a larger MTU override this via `set_mtu`.
pub const DEFAULT_MTU: usize = 20;

/// Default Packet Receipt Notification period. Zero disables PRN and
/// relies on the adapter's write-accepted signal for flow control.
pub const DEFAULT_PRN: u16 = 0;

// ============================================================================
// Protocol Timeouts
// ============================================================================

/// Window for a control-point response notification to arrive.
///
/// EXECUTE of a full data object can block on flash for several seconds,
/// so this is generous.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Window for a Packet Receipt Notification to arrive.
///
/// A PRN follows at most `prn` link-layer writes, so it is bounded much
/// tighter than a flash-bound EXECUTE response.
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Maximum attempts for one object's create-and-write cycle.
pub const MAX_OBJECT_ATTEMPTS: u32 = 3;
