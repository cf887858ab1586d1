//! PUF chain-of-links oracle contract.
//!
//! PHEMAP provisions every device with a carnet: a pre-shared sequence of
//! one-time 32-bit links derived from its Physical Unclonable Function,
//! advanced in lockstep with the verifier that enrolled it. The protocol
//! core consumes links in strict order and never looks back; cursor
//! management, chain re-provisioning, and desync recovery all live behind
//! this trait.

use keyfed_types::{Link, NodeId};

/// A synchronised chain-of-links oracle.
///
/// `next_link(id)` returns the next unconsumed link of `id`'s carnet and
/// advances the cursor. Two synchronised peers calling this for the same
/// `id` observe the same sequence; any divergence surfaces in the protocol
/// as a failed link comparison or authenticator check, never here.
pub trait PufChain {
    fn next_link(&mut self, id: NodeId) -> Link;
}

impl<C: PufChain + ?Sized> PufChain for &mut C {
    fn next_link(&mut self, id: NodeId) -> Link {
        (**self).next_link(id)
    }
}
