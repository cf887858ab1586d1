//! # keyfed-wire
//!
//! Frame codec for the keyfed group-key protocol.
//!
//! Every frame is big-endian and fixed-size. Control frames are 7 bytes and
//! carry a chain link that doubles as the authenticator; keyed frames are 15
//! bytes and carry two encrypted 32-bit fields plus a trailing authenticator
//! over the first eleven bytes.
//!
//! ## Wire format
//!
//! ```text
//! offset 0      : message tag (u8)
//! offset 1..3   : sender id (u16 BE)
//! offset 3..7   : chain link        -- control frames end here
//! offset 3..7   : encrypted key material (u32 BE)
//! offset 7..11  : encrypted secret token (u32 BE)
//! offset 11..15 : authenticator (u32 BE)
//! ```
//!
//! Receivers tolerate trailing bytes but reject frames shorter than their
//! class length.

pub mod frame;

pub use frame::{ControlPacket, Header, KeyPacket, MsgType};

/// Length of a control (short) frame.
pub const CONTROL_FRAME_LEN: usize = 7;

/// Length of a keyed (long) frame.
pub const KEYED_FRAME_LEN: usize = 15;

/// Length of the tag + sender-id header shared by both frame classes.
pub const HEADER_LEN: usize = 3;

/// Length of the authenticated prefix of a keyed frame.
pub const SIGNED_PREFIX_LEN: usize = 11;

/// Error types for frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Frame shorter than its class requires.
    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// First byte is not a registered message tag.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// Tag belongs to the other frame class.
    #[error("message tag {0:?} does not belong to this frame class")]
    ClassMismatch(MsgType),
}
