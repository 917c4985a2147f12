//! Contracts for the external drivers this crate sits on top of.
//!
//! - [`TunnelDriver`]: adapter lifecycle and whole-configuration replacement.
//! - [`NetConfigurator`]: adapter address and route assignment.
//! - [`CaptureDriver`]: network-layer packet sniffing and injection.
//!
//! Loading the driver libraries and resolving their entry points is left to
//! the implementations of these traits. In-memory implementations live in
//! [`crate::test_util`].

use chrono::{DateTime, Duration, TimeZone, Utc};
use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use tracing::{error, info, warn};

/// Native error code reported by a driver (the OS "last error" value).
pub type NativeCode = u32;

pub const ERROR_INVALID_HANDLE: NativeCode = 6;
pub const ERROR_MORE_DATA: NativeCode = 234;
pub const ERROR_TIMEOUT: NativeCode = 1460;
pub const ERROR_HOST_UNREACHABLE: NativeCode = 1232;
pub const ERROR_OPERATION_ABORTED: NativeCode = 995;

/// Opaque tunnel adapter handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterHandle(pub u64);

/// Locally unique identifier of an adapter's network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdapterLuid(pub u64);

/// Administrative adapter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Down,
    Up,
}

/// Failure of a configuration read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetConfigError {
    /// The caller's buffer is too small; `needed` bytes are required.
    MoreData { needed: usize },
    Failed(NativeCode),
}

/// Tunnel driver: adapter lifecycle and configuration.
pub trait TunnelDriver: Send + Sync {
    /// Version of the running driver, 0 when no driver is loaded.
    fn running_version(&self) -> u32;

    fn create_adapter(&self, name: &str, tunnel_type: &str) -> Result<AdapterHandle, NativeCode>;

    fn close_adapter(&self, handle: AdapterHandle);

    fn adapter_luid(&self, handle: AdapterHandle) -> AdapterLuid;

    /// Replace the adapter's whole configuration with `config`.
    fn set_configuration(&self, handle: AdapterHandle, config: &[u8]) -> Result<(), NativeCode>;

    /// Copy the live configuration into `buf`, returning the bytes written.
    fn get_configuration(
        &self,
        handle: AdapterHandle,
        buf: &mut [u8],
    ) -> Result<usize, GetConfigError>;

    fn set_adapter_state(&self, handle: AdapterHandle, state: AdapterState)
    -> Result<(), NativeCode>;
}

/// OS network configuration for adapters.
pub trait NetConfigurator: Send + Sync {
    /// Assign a unicast address with the given on-link prefix length.
    fn add_address(&self, luid: AdapterLuid, addr: Ipv4Addr, prefix_len: u8) -> io::Result<()>;

    /// Route `destination` through the adapter. An existing identical route
    /// counts as success.
    fn add_route(&self, luid: AdapterLuid, destination: Ipv4Net) -> io::Result<()>;
}

/// Size of the opaque per-packet address block handed out by the capture driver.
pub const CAPTURE_ADDRESS_SIZE: usize = 80;

/// Opaque capture metadata (interface, direction, offload state) that must
/// be passed back unchanged when reinjecting a packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CaptureAddress(pub [u8; CAPTURE_ADDRESS_SIZE]);

impl Default for CaptureAddress {
    fn default() -> Self {
        Self([0; CAPTURE_ADDRESS_SIZE])
    }
}

impl std::fmt::Debug for CaptureAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CaptureAddress(..)")
    }
}

/// Opaque capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureHandle(pub u64);

/// Capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLayer {
    Network,
    NetworkForward,
}

/// Open flags for a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureFlags(pub u64);

impl CaptureFlags {
    /// Copy packets instead of diverting them.
    pub const SNIFF: Self = Self(0x0001);
    pub const DROP: Self = Self(0x0002);
    pub const RECV_ONLY: Self = Self(0x0004);
}

/// A failed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    HostUnreachable,
    /// The handle was closed underneath the receiver.
    InvalidHandle,
    Aborted,
    Other(NativeCode),
}

/// What a receive loop should do after a [`RecvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvAction {
    Retry,
    Stop,
    Fatal,
}

impl RecvError {
    pub fn from_code(code: NativeCode) -> Self {
        match code {
            ERROR_TIMEOUT => RecvError::Timeout,
            ERROR_HOST_UNREACHABLE => RecvError::HostUnreachable,
            ERROR_INVALID_HANDLE => RecvError::InvalidHandle,
            ERROR_OPERATION_ABORTED => RecvError::Aborted,
            other => RecvError::Other(other),
        }
    }

    pub fn action(&self) -> RecvAction {
        match self {
            RecvError::Timeout | RecvError::HostUnreachable => RecvAction::Retry,
            RecvError::InvalidHandle | RecvError::Aborted => RecvAction::Stop,
            RecvError::Other(_) => RecvAction::Fatal,
        }
    }
}

/// Packet capture driver: sniff, checksum, reinject.
pub trait CaptureDriver: Send + Sync {
    fn open(
        &self,
        filter: &str,
        layer: CaptureLayer,
        priority: i16,
        flags: CaptureFlags,
    ) -> Result<CaptureHandle, NativeCode>;

    /// Block until one packet is available and copy it into `buf`.
    fn recv(
        &self,
        handle: CaptureHandle,
        buf: &mut [u8],
    ) -> Result<(usize, CaptureAddress), RecvError>;

    /// Recompute the IP and transport checksums of `packet` in place.
    fn calc_checksums(&self, packet: &mut [u8], addr: &mut CaptureAddress) -> bool;

    fn send(&self, handle: CaptureHandle, packet: &[u8], addr: &CaptureAddress) -> bool;

    /// Close the handle. A receive blocked on it returns
    /// [`RecvError::InvalidHandle`] or [`RecvError::Aborted`].
    fn close(&self, handle: CaptureHandle) -> bool;
}

/// Tunnel driver log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverLogLevel {
    Info,
    Warn,
    Err,
}

impl DriverLogLevel {
    pub fn from_raw(level: u32) -> Self {
        match level {
            1 => DriverLogLevel::Warn,
            2 => DriverLogLevel::Err,
            _ => DriverLogLevel::Info,
        }
    }
}

/// Unix epoch expressed in 100ns ticks since 1601-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Convert a driver timestamp (100ns ticks since 1601-01-01 UTC).
///
/// Returns `None` for 0, which the driver uses for "never".
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let epoch = Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).single()?;
    let micros = i64::try_from(ticks / 10).ok()?;
    epoch.checked_add_signed(Duration::microseconds(micros))
}

/// Convert a UTC time into a driver timestamp.
pub fn utc_to_filetime(time: DateTime<Utc>) -> u64 {
    let nanos = time.timestamp_nanos_opt().unwrap_or_default();
    let ticks = nanos / 100;
    (FILETIME_UNIX_EPOCH as i64 + ticks).max(0) as u64
}

/// Forward one tunnel driver log line into `tracing`.
pub fn forward_driver_log(level: u32, timestamp: u64, message: &str) {
    let at = filetime_to_utc(timestamp)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    match DriverLogLevel::from_raw(level) {
        DriverLogLevel::Info => info!(target: "tunnel_driver", at = %at, "{message}"),
        DriverLogLevel::Warn => warn!(target: "tunnel_driver", at = %at, "{message}"),
        DriverLogLevel::Err => error!(target: "tunnel_driver", at = %at, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_error_actions() {
        assert_eq!(RecvError::from_code(ERROR_TIMEOUT).action(), RecvAction::Retry);
        assert_eq!(
            RecvError::from_code(ERROR_HOST_UNREACHABLE).action(),
            RecvAction::Retry
        );
        assert_eq!(
            RecvError::from_code(ERROR_INVALID_HANDLE).action(),
            RecvAction::Stop
        );
        assert_eq!(
            RecvError::from_code(ERROR_OPERATION_ABORTED).action(),
            RecvAction::Stop
        );
        assert_eq!(RecvError::from_code(5).action(), RecvAction::Fatal);
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(filetime_to_utc(0), None);

        let unix = filetime_to_utc(FILETIME_UNIX_EPOCH).unwrap();
        assert_eq!(unix.timestamp(), 0);

        let t = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 45).unwrap();
        assert_eq!(filetime_to_utc(utc_to_filetime(t)), Some(t));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(DriverLogLevel::from_raw(0), DriverLogLevel::Info);
        assert_eq!(DriverLogLevel::from_raw(1), DriverLogLevel::Warn);
        assert_eq!(DriverLogLevel::from_raw(2), DriverLogLevel::Err);
        forward_driver_log(2, 0, "adapter vanished");
    }
}
