//! Random-word source contract.
//!
//! Session nonces and secret tokens are drawn from an injected entropy
//! source so that protocol runs can be made reproducible in tests while
//! production nodes draw from the operating system.

use rand::RngCore;

/// Source of fresh 32-bit words for nonces and secret tokens.
pub trait EntropySource {
    fn next_word(&mut self) -> u32;
}

impl<E: EntropySource + ?Sized> EntropySource for &mut E {
    fn next_word(&mut self) -> u32 {
        (**self).next_word()
    }
}

/// OS-backed entropy via the thread-local CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn next_word(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }
}
