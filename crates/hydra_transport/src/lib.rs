//! Pluggable transport layer: fail-over delivery over domain fronting and
//! a local-network mesh.
//!
//! A [`TransportManager`] composes transports into a priority-ordered
//! fallback chain. Each send is attempted via the first transport that
//! works; errors are classified at the transport boundary so the manager
//! can distinguish active interference from ordinary transience.

pub mod error;
pub mod fronting;
pub mod manager;
pub mod mesh;
pub mod resolve;
pub mod transport;

pub use error::{ErrorClass, SendError};
pub use fronting::FrontingTransport;
pub use manager::TransportManager;
pub use mesh::{sanitize_peers, MeshTransport};
pub use transport::{MockTransport, Transport};
