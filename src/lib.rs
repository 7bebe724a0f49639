// glasslink: facade over the link-core engine and its protocol crates.
// Embedders depend on this crate and inject their transport, HTTP, and
// storage adapters; see link-core for the engine itself.

pub use gl_protocol as protocol;
pub use k900_core as k900;
pub use link_core::{
    BleTransport, EventBus, LinkConfig, LinkError, LinkEvent, LinkHandle, LinkManager,
    PeerIdentity, PeerKind, PeerParams, PublicState, ScanFilter, TransportError, TransportEvent,
};
