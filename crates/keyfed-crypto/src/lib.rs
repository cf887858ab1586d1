//! # keyfed-crypto
//!
//! The keyed packet authenticator and the collaborator traits the protocol
//! core consumes. No algorithm negotiation is permitted: every role signs
//! with the same 32-bit word fold, and fresh key material comes exclusively
//! from the two injected collaborators.
//!
//! ## Modules
//!
//! - [`sign`] — Big-endian 32-bit XOR word fold used to authenticate long frames
//! - [`chain`] — The PUF chain-of-links oracle contract
//! - [`entropy`] — Random-word source contract and the OS-backed default
//! - [`testing`] — Deterministic collaborators for tests and vector generation

pub mod chain;
pub mod entropy;
pub mod sign;
pub mod testing;

pub use chain::PufChain;
pub use entropy::{EntropySource, OsEntropy};
pub use sign::keyed_sign;
