//! # keyfed-types
//!
//! Shared domain types used across the keyfed workspace.
//!
//! keyfed distributes two layers of symmetric group keys over a PHEMAP-style
//! PUF chain-of-links authentication primitive: an intra-group key between an
//! Authentication Server and its devices, and an inter-group key constructed
//! cooperatively by the federation's Local Verifiers. All key material on the
//! wire is 32-bit; node identities are 16-bit.

use serde::{Deserialize, Serialize};

/// Common type aliases.
pub type NodeId = u16;
pub type Link = u32;
pub type Key = u32;
pub type Token = u32;
pub type Nonce = u32;

/// Maximum devices enrollable under a single Authentication Server.
pub const MAX_AUTH: usize = 3000;

/// Result code of feeding one packet (or local event) to an automaton.
///
/// These are protocol outcomes, not Rust errors: a `Reinit` is a normal,
/// recoverable protocol event the caller reacts to by restarting the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Packet processed, no milestone reached.
    Ok,
    /// First install of the current layer's key completed.
    InstallOk,
    /// A rekey (join or leave) was fully confirmed.
    UpdateOk,
    /// Soft skip: wrong sender, tolerated without losing chain sync.
    ConnWait,
    /// Authentication, parse, or sequencing failure; the automaton has been
    /// reset to its initial state and the session must be restarted.
    Reinit,
    /// Peer-verifier authenticator mismatch. Distinct from [`Outcome::Reinit`]
    /// so callers can react without tearing down server/device sessions.
    AuthFailed,
}

impl Outcome {
    /// Whether this outcome marks a completed install or rekey.
    pub fn is_milestone(self) -> bool {
        matches!(self, Outcome::InstallOk | Outcome::UpdateOk)
    }
}
