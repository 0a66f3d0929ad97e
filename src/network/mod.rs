//! TCP transport: socket setup, the client link and the relay

pub mod link;
#[cfg(feature = "relay")]
pub mod relay;
pub mod socket;

pub use link::{LinkStatsSnapshot, NetworkLink};
#[cfg(feature = "relay")]
pub use relay::{PeerTable, RelayServer, RelayStatsSnapshot};
