//! Virtual LAN rooms over point-to-multipoint tunnel adapters.
//!
//! A [`RoomRegistry`] owns rooms, each backed by one tunnel adapter whose
//! whole configuration is regenerated by the [`wire`] codec on every change.
//! A [`BroadcastRelay`] copies outbound broadcast packets to every peer
//! address, since the tunnel itself cannot deliver them.

pub mod addr;
pub mod config;
pub mod driver;
pub mod dump;
pub mod error;
pub mod keys;
pub mod registry;
pub mod relay;
pub mod room;
pub mod test_util;
pub mod wire;

pub use error::{NetError, Result};
pub use registry::{RoomRegistry, RoomSettings};
pub use relay::BroadcastRelay;
pub use room::{Peer, PeerOp, Room};
