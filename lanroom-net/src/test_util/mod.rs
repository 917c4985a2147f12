//! Test utilities: in-memory drivers standing in for the tunnel, network
//! configuration and packet capture collaborators.

pub mod capture;
pub mod packets;
pub mod tunnel;

pub use capture::{MemoryCapture, OpenRecord};
pub use tunnel::{FAKE_DRIVER_VERSION, MemoryNetConfigurator, MemoryTunnelDriver};
