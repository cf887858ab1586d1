//! # keyfed-group
//!
//! The three automata of the keyfed group-key protocol.
//!
//! Each automaton is a pure state machine: it is fed inbound frames (and
//! local events) by the enclosing transport loop, consumes chain links and
//! entropy words from injected collaborators, and publishes outbound frames
//! into single-slot buffers the transport drains. Nothing here blocks,
//! retries, or waits.
//!
//! ## Modules
//!
//! - [`device`] — Group member: installs and updates its intra-group key.
//! - [`server`] — Authentication Server: authenticates devices over their
//!   PUF chains and distributes intra-group key shares.
//! - [`verifier`] — Local Verifier: a device toward its upper server and a
//!   server toward its own devices, plus the cooperative construction of
//!   the federation-wide inter-group key.
//! - [`timer`] — Install-timer hook armed while confirmations are pending.
//!
//! ## Roles and key layers
//!
//! A federation is a two-level tree. The upper Authentication Server
//! installs an intra-group key across the Local Verifiers; each Local
//! Verifier installs its own intra-group key across its devices; and once
//! both layers are up, every verifier folds a fresh contribution into the
//! shared inter-group key and pushes the result down to its devices.

pub mod device;
pub mod server;
pub mod timer;
pub mod verifier;

use keyfed_types::NodeId;

pub use device::{Device, DeviceState};
pub use server::{AuthServer, ServerState};
pub use timer::{InstallTimer, NoopTimer};
pub use verifier::LocalVerifier;

/// Error types for automaton construction and dispatch contracts.
///
/// Protocol-level failures are not errors; they surface as
/// [`keyfed_types::Outcome`] codes. An `Err` here means the embedding broke
/// a contract: an oversized enrolment, or a frame the transport should
/// never have forwarded to this node.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Enrolment list exceeds the fixed capacity.
    #[error("too many enrolled devices: {count}, max {max}")]
    TooManyDevices { count: usize, max: usize },

    /// The same device id appears twice in an enrolment list.
    #[error("duplicate enrolled device id {0}")]
    DuplicateDevice(NodeId),

    /// Peer-verifier list exceeds the fixed capacity.
    #[error("too many peer verifiers: {count}, max {max}")]
    TooManyVerifiers { count: usize, max: usize },

    /// Frame too short to carry a sender identity.
    #[error("frame too short to attribute: {0} bytes")]
    RuntFrame(usize),

    /// The sender is not the upstream server, an enrolled device, or a
    /// peer verifier. The transport must not forward foreign identities.
    #[error("sender {0} is not the upstream server, an enrolled device, or a peer verifier")]
    UnknownSender(NodeId),

    /// A peer verifier sent something other than an inter-key frame.
    #[error("unexpected frame tag {tag:#04x} from peer verifier {sender}")]
    UnexpectedPeerFrame { sender: NodeId, tag: u8 },
}
