//! Integration test crate for the keyfed protocol.
//!
//! This crate has no library code; it only contains integration tests
//! that drive full multi-node scenarios across the workspace crates,
//! shuttling outbound buffer contents between nodes the way a transport
//! would.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p keyfed-integration-tests
//! ```
