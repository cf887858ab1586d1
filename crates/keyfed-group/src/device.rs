//! Device automaton.
//!
//! A device belongs to exactly one Authentication Server. It requests a
//! session with `START_SESS`, installs the key share the server answers
//! with, confirms with `PK_CONF`, and then sits in `WaitForUpdate` applying
//! rekeys (and, under a Local Verifier, the inter-group key pushed down
//! with `LV_SUP_KEY_INSTALL`).
//!
//! Chain-link consumption is order-sensitive: the install path burns the
//! noise link, the share link, and the signing link in that order, exactly
//! mirroring the server's per-device draw, then one more link for the
//! confirmation. A device that falls out of step with its server can only
//! be recovered by the chain collaborator; the automaton just reports
//! `Reinit`.

use keyfed_crypto::PufChain;
use keyfed_types::{Key, NodeId, Outcome, Token};
use keyfed_wire::{ControlPacket, Header, KeyPacket, MsgType, CONTROL_FRAME_LEN};
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Protocol position of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// No live key; the only acceptable inbound frame is a key share.
    WaitStartPk,
    /// Key installed; waiting for rekeys and supergroup installs.
    WaitForUpdate,
}

/// Device-side state of the group-key protocol.
#[derive(Debug, Zeroize, ZeroizeOnDrop)]
pub struct Device {
    #[zeroize(skip)]
    id: NodeId,
    #[zeroize(skip)]
    as_id: NodeId,
    pk: Key,
    secret_token: Token,
    inter_group_key: Key,
    inter_group_tok: Token,
    #[zeroize(skip)]
    state: DeviceState,
    #[zeroize(skip)]
    is_pk_installed: bool,
    outbound: Option<[u8; CONTROL_FRAME_LEN]>,
}

impl Device {
    /// Create a device bound to the server it expects updates from.
    pub fn new(id: NodeId, as_id: NodeId) -> Self {
        Self {
            id,
            as_id,
            pk: 0,
            secret_token: 0,
            inter_group_key: 0,
            inter_group_tok: 0,
            state: DeviceState::WaitStartPk,
            is_pk_installed: false,
            outbound: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn as_id(&self) -> NodeId {
        self.as_id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_pk_installed(&self) -> bool {
        self.is_pk_installed
    }

    /// The live intra-group key.
    pub fn pk(&self) -> Key {
        self.pk
    }

    /// The live intra-group secret token.
    pub fn secret_token(&self) -> Token {
        self.secret_token
    }

    /// The inter-group key, populated only after a supergroup install.
    pub fn inter_group_key(&self) -> Key {
        self.inter_group_key
    }

    /// The inter-group secret token, populated with the inter-group key.
    pub fn inter_group_token(&self) -> Token {
        self.inter_group_tok
    }

    /// Whether an outbound frame is waiting for the transport.
    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Drain the single-slot outbound buffer.
    pub fn take_outbound(&mut self) -> Option<[u8; CONTROL_FRAME_LEN]> {
        self.outbound.take()
    }

    /// Ask the server to install (or re-install) the group key.
    pub fn start_session(&mut self, chain: &mut impl PufChain) {
        let pkt = ControlPacket::new(MsgType::StartSess, self.id, chain.next_link(self.id));
        self.outbound = Some(pkt.encode());
        self.state = DeviceState::WaitStartPk;
        debug!(device = self.id, server = self.as_id, "session start requested");
    }

    /// Leave the group.
    pub fn end_session(&mut self, chain: &mut impl PufChain) {
        let pkt = ControlPacket::new(MsgType::EndSess, self.id, chain.next_link(self.id));
        self.outbound = Some(pkt.encode());
        self.state = DeviceState::WaitStartPk;
        debug!(device = self.id, server = self.as_id, "session end requested");
    }

    /// Feed one inbound frame to the automaton.
    pub fn step(&mut self, chain: &mut impl PufChain, frame: &[u8]) -> Outcome {
        trace!(device = self.id, frame = %hex::encode(frame), "device rx");
        let outcome = self.dispatch(chain, frame);
        if outcome == Outcome::Reinit {
            self.state = DeviceState::WaitStartPk;
        }
        outcome
    }

    fn dispatch(&mut self, chain: &mut impl PufChain, frame: &[u8]) -> Outcome {
        let header = match Header::decode(frame) {
            Ok(header) => header,
            Err(err) => {
                warn!(device = self.id, %err, "unparseable frame");
                return Outcome::Reinit;
            }
        };
        match (self.state, header.msg_type) {
            (DeviceState::WaitStartPk, MsgType::StartPk) => self.on_key_share(chain, frame),
            (DeviceState::WaitForUpdate, MsgType::UpdateKey) => {
                self.on_key_update(chain, frame, header.sender)
            }
            (DeviceState::WaitForUpdate, MsgType::LvSupKeyInstall) => {
                self.on_supergroup_install(frame)
            }
            (state, msg_type) => {
                warn!(device = self.id, ?state, ?msg_type, "unexpected frame");
                Outcome::Reinit
            }
        }
    }

    /// Install the key share delivered by `START_PK`.
    fn on_key_share(&mut self, chain: &mut impl PufChain, frame: &[u8]) -> Outcome {
        let pkt = match KeyPacket::decode(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                warn!(device = self.id, %err, "malformed key share");
                self.is_pk_installed = false;
                return Outcome::Reinit;
            }
        };
        // The noise link blinds both the share and the token; the share link
        // is this device's own contribution the server folded in for it.
        let noise = chain.next_link(self.id);
        let share = chain.next_link(self.id);
        let sign_link = chain.next_link(self.id);
        if !pkt.verify(sign_link) {
            warn!(device = self.id, "server authentication failed during install");
            self.is_pk_installed = false;
            return Outcome::Reinit;
        }

        self.pk = pkt.key_material ^ share ^ noise;
        self.secret_token = pkt.token_material ^ noise;

        let conf = ControlPacket::new(MsgType::PkConf, self.id, chain.next_link(self.id));
        self.outbound = Some(conf.encode());
        self.state = DeviceState::WaitForUpdate;
        self.is_pk_installed = true;
        debug!(device = self.id, "intra-group key installed");
        Outcome::InstallOk
    }

    /// Apply a rekey delivered by `UPDATE_KEY`.
    ///
    /// Updates are soft for devices: no confirmation is emitted, and a
    /// failed update leaves the previously installed key flagged as live.
    fn on_key_update(&mut self, chain: &mut impl PufChain, frame: &[u8], sender: NodeId) -> Outcome {
        let pkt = match KeyPacket::decode(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                warn!(device = self.id, %err, "malformed key update");
                return Outcome::Reinit;
            }
        };
        if sender != self.as_id {
            // Skip without consuming links so the chain stays in sync.
            debug!(device = self.id, sender, "update from foreign server skipped");
            return Outcome::ConnWait;
        }
        let noise = chain.next_link(self.id);
        let auth = chain.next_link(self.id);
        if !pkt.verify(auth) {
            warn!(device = self.id, "server authentication failed during update");
            return Outcome::Reinit;
        }

        self.pk ^= pkt.key_material ^ noise;
        self.secret_token = pkt.token_material ^ noise;
        debug!(device = self.id, "intra-group key updated");
        Outcome::Ok
    }

    /// Install the inter-group key pushed down by the local verifier.
    ///
    /// The frame is signed with the intra-group secret token and blinded
    /// with the intra-group key, so no chain links are consumed.
    fn on_supergroup_install(&mut self, frame: &[u8]) -> Outcome {
        let pkt = match KeyPacket::decode(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                warn!(device = self.id, %err, "malformed supergroup install");
                return Outcome::Reinit;
            }
        };
        if !pkt.verify(self.secret_token) {
            warn!(device = self.id, "verifier authentication failed during supergroup install");
            return Outcome::Reinit;
        }

        self.inter_group_key = pkt.key_material ^ self.pk;
        self.inter_group_tok = pkt.token_material ^ self.pk;
        debug!(device = self.id, "inter-group key installed");
        Outcome::Ok
    }
}
