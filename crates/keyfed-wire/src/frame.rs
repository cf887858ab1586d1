//! Frame structures and their codecs.

use keyfed_crypto::keyed_sign;
use keyfed_types::{Key, Link, NodeId};
use serde::{Deserialize, Serialize};

use crate::{WireError, CONTROL_FRAME_LEN, HEADER_LEN, KEYED_FRAME_LEN, SIGNED_PREFIX_LEN};

/// Registered message tags.
///
/// Tag values are part of the wire contract and never renumbered.
/// `InstallSec` and `SecConf` are reserved by the tag registry but carried by
/// no operation of this layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    /// Device asks its server to install (or re-join) the group key.
    StartSess = 0,
    /// Server delivers a per-recipient encrypted key share.
    StartPk = 1,
    /// Device confirms a key-share installation.
    PkConf = 2,
    /// Device leaves the group.
    EndSess = 3,
    /// Server delivers a key update to current members.
    UpdateKey = 4,
    /// Device confirms a key update.
    UpdateConf = 5,
    /// Reserved: secret installation.
    InstallSec = 6,
    /// Reserved: secret confirmation.
    SecConf = 7,
    /// Local verifier shares its inter-group key contribution with peers.
    InterKeyInstall = 8,
    /// Local verifier pushes the inter-group key down to its devices.
    LvSupKeyInstall = 9,
}

impl MsgType {
    /// Decode a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0 => Ok(MsgType::StartSess),
            1 => Ok(MsgType::StartPk),
            2 => Ok(MsgType::PkConf),
            3 => Ok(MsgType::EndSess),
            4 => Ok(MsgType::UpdateKey),
            5 => Ok(MsgType::UpdateConf),
            6 => Ok(MsgType::InstallSec),
            7 => Ok(MsgType::SecConf),
            8 => Ok(MsgType::InterKeyInstall),
            9 => Ok(MsgType::LvSupKeyInstall),
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// The wire tag value.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether this tag names a 7-byte control frame (as opposed to a
    /// 15-byte keyed frame).
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MsgType::StartSess | MsgType::PkConf | MsgType::EndSess | MsgType::UpdateConf | MsgType::SecConf
        )
    }
}

/// The tag + sender header shared by both frame classes.
///
/// Automata decode the header first to dispatch on state and sender, then
/// decode the full frame with the class the handler expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub sender: NodeId,
}

impl Header {
    /// Decode the leading three bytes of a frame.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }
        Ok(Self {
            msg_type: MsgType::from_tag(buf[0])?,
            sender: NodeId::from_be_bytes([buf[1], buf[2]]),
        })
    }
}

/// A 7-byte control frame: `tag | sender | link`.
///
/// The chain link is the authenticator: the receiver compares it against
/// its own `next_link(sender)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlPacket {
    pub msg_type: MsgType,
    pub sender: NodeId,
    pub link: Link,
}

impl ControlPacket {
    pub fn new(msg_type: MsgType, sender: NodeId, link: Link) -> Self {
        Self {
            msg_type,
            sender,
            link,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
        let mut buf = [0u8; CONTROL_FRAME_LEN];
        buf[0] = self.msg_type.tag();
        buf[1..3].copy_from_slice(&self.sender.to_be_bytes());
        buf[3..7].copy_from_slice(&self.link.to_be_bytes());
        buf
    }

    /// Decode from wire bytes. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < CONTROL_FRAME_LEN {
            return Err(WireError::Truncated {
                need: CONTROL_FRAME_LEN,
                got: buf.len(),
            });
        }
        let msg_type = MsgType::from_tag(buf[0])?;
        if !msg_type.is_control() {
            return Err(WireError::ClassMismatch(msg_type));
        }
        Ok(Self {
            msg_type,
            sender: NodeId::from_be_bytes([buf[1], buf[2]]),
            link: Link::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }
}

/// A 15-byte keyed frame: `tag | sender | key material | token material | sign`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyPacket {
    pub msg_type: MsgType,
    pub sender: NodeId,
    pub key_material: u32,
    pub token_material: u32,
    pub sign: u32,
}

impl KeyPacket {
    /// Build a frame and compute its authenticator over the encoded prefix.
    pub fn seal(
        msg_type: MsgType,
        sender: NodeId,
        key_material: u32,
        token_material: u32,
        sign_key: Key,
    ) -> Self {
        let mut pkt = Self {
            msg_type,
            sender,
            key_material,
            token_material,
            sign: 0,
        };
        pkt.sign = keyed_sign(&pkt.signed_prefix(), sign_key);
        pkt
    }

    /// Recompute the authenticator under `key` and compare.
    pub fn verify(&self, key: Key) -> bool {
        keyed_sign(&self.signed_prefix(), key) == self.sign
    }

    /// The eleven bytes the authenticator covers.
    pub fn signed_prefix(&self) -> [u8; SIGNED_PREFIX_LEN] {
        let mut buf = [0u8; SIGNED_PREFIX_LEN];
        buf[0] = self.msg_type.tag();
        buf[1..3].copy_from_slice(&self.sender.to_be_bytes());
        buf[3..7].copy_from_slice(&self.key_material.to_be_bytes());
        buf[7..11].copy_from_slice(&self.token_material.to_be_bytes());
        buf
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; KEYED_FRAME_LEN] {
        let mut buf = [0u8; KEYED_FRAME_LEN];
        buf[..SIGNED_PREFIX_LEN].copy_from_slice(&self.signed_prefix());
        buf[11..15].copy_from_slice(&self.sign.to_be_bytes());
        buf
    }

    /// Decode from wire bytes. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < KEYED_FRAME_LEN {
            return Err(WireError::Truncated {
                need: KEYED_FRAME_LEN,
                got: buf.len(),
            });
        }
        let msg_type = MsgType::from_tag(buf[0])?;
        if msg_type.is_control() {
            return Err(WireError::ClassMismatch(msg_type));
        }
        Ok(Self {
            msg_type,
            sender: NodeId::from_be_bytes([buf[1], buf[2]]),
            key_material: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            token_material: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
            sign: u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]),
        })
    }
}
