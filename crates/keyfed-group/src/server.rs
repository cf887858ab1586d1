//! Authentication Server automaton.
//!
//! The server owns the intra-group key of the devices enrolled under it.
//! It authenticates every request against the requester's PUF chain,
//! distributes per-recipient encrypted key shares, counts confirmations,
//! and rekeys the group on joins and leaves so that departed members can
//! not read forward and new members can not read backward.
//!
//! The group key is the XOR of every member's chain-drawn share plus a
//! session nonce: `private_key = (⊕ sr_key[member]) ⊕ session_nonce`. Joins
//! and leaves therefore rekey by XOR-ing a delta that adds or removes one
//! share and swaps the nonce.

use std::collections::{HashMap, HashSet, VecDeque};

use keyfed_crypto::{EntropySource, PufChain};
use keyfed_types::{Key, NodeId, Nonce, Outcome, Token, MAX_AUTH};
use keyfed_wire::{ControlPacket, Header, KeyPacket, MsgType, KEYED_FRAME_LEN};
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use crate::timer::{InstallTimer, NoopTimer};
use crate::GroupError;

/// Protocol position of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// No live group; waiting for a session-start request.
    WaitStartReq,
    /// Key shares are out; waiting for confirmations.
    WaitStartConf,
    /// Group is live; waiting for joins, leaves, and update confirmations.
    WaitForUpdates,
}

/// Server-side state of the group-key protocol.
pub struct AuthServer<T: InstallTimer = NoopTimer> {
    as_id: NodeId,
    /// Enrolled devices, in enrolment order.
    auth_devs: Vec<NodeId>,
    /// Devices currently holding the live key.
    group_members: HashSet<NodeId>,
    /// Devices whose confirmation is awaited.
    pending_conf: HashSet<NodeId>,
    /// Last key share drawn for each device, kept to compute leave deltas.
    sr_key: HashMap<NodeId, Key>,
    session_nonce: Nonce,
    secret_token: Token,
    private_key: Key,
    /// First-install latch: distinguishes the first `InstallOk` from later
    /// `UpdateOk` milestones.
    pk_installed: bool,
    state: ServerState,
    /// One outbound slot per destination; the queue records destinations in
    /// emission order.
    unicast_slots: HashMap<NodeId, [u8; KEYED_FRAME_LEN]>,
    unicast_queue: VecDeque<NodeId>,
    broadcast: Option<[u8; KEYED_FRAME_LEN]>,
    timer: T,
}

impl AuthServer<NoopTimer> {
    /// Create a server over the given enrolment list, without deadline
    /// handling.
    pub fn new(as_id: NodeId, enrolled: &[NodeId]) -> Result<Self, GroupError> {
        Self::with_timer(as_id, enrolled, NoopTimer)
    }
}

impl<T: InstallTimer> AuthServer<T> {
    /// Create a server over the given enrolment list with an install timer.
    pub fn with_timer(as_id: NodeId, enrolled: &[NodeId], timer: T) -> Result<Self, GroupError> {
        if enrolled.len() > MAX_AUTH {
            return Err(GroupError::TooManyDevices {
                count: enrolled.len(),
                max: MAX_AUTH,
            });
        }
        let mut seen = HashSet::with_capacity(enrolled.len());
        for &dev in enrolled {
            if !seen.insert(dev) {
                return Err(GroupError::DuplicateDevice(dev));
            }
        }
        Ok(Self {
            as_id,
            auth_devs: enrolled.to_vec(),
            group_members: HashSet::new(),
            pending_conf: HashSet::new(),
            sr_key: HashMap::new(),
            session_nonce: 0,
            secret_token: 0,
            private_key: 0,
            pk_installed: false,
            state: ServerState::WaitStartReq,
            unicast_slots: HashMap::new(),
            unicast_queue: VecDeque::new(),
            broadcast: None,
            timer,
        })
    }

    pub fn as_id(&self) -> NodeId {
        self.as_id
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn pk_installed(&self) -> bool {
        self.pk_installed
    }

    /// The live group key.
    pub fn private_key(&self) -> Key {
        self.private_key
    }

    pub fn session_nonce(&self) -> Nonce {
        self.session_nonce
    }

    pub fn secret_token(&self) -> Token {
        self.secret_token
    }

    /// Enrolled devices in enrolment order.
    pub fn enrolled(&self) -> &[NodeId] {
        &self.auth_devs
    }

    pub fn is_enrolled(&self, id: NodeId) -> bool {
        self.auth_devs.contains(&id)
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.group_members.contains(&id)
    }

    /// Number of devices currently holding the live key.
    pub fn member_count(&self) -> usize {
        self.group_members.len()
    }

    /// Number of confirmations still awaited.
    pub fn pending_count(&self) -> usize {
        self.pending_conf.len()
    }

    /// Whether an install or rekey is still collecting confirmations.
    ///
    /// Embeddings poll this before scheduling a new update so that two
    /// rekeys never overlap.
    pub fn has_pending_confirmations(&self) -> bool {
        !self.pending_conf.is_empty()
    }

    /// The key share last drawn for `id`, if any.
    pub fn share_of(&self, id: NodeId) -> Option<Key> {
        self.sr_key.get(&id).copied()
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Drain the next queued unicast frame, with its destination.
    pub fn pop_unicast(&mut self) -> Option<(NodeId, [u8; KEYED_FRAME_LEN])> {
        while let Some(dest) = self.unicast_queue.pop_front() {
            if let Some(frame) = self.unicast_slots.remove(&dest) {
                return Some((dest, frame));
            }
        }
        None
    }

    /// Drain the broadcast slot.
    pub fn take_broadcast(&mut self) -> Option<[u8; KEYED_FRAME_LEN]> {
        self.broadcast.take()
    }

    /// Whether any outbound unicast is waiting for the transport.
    pub fn has_unicasts(&self) -> bool {
        !self.unicast_slots.is_empty()
    }

    /// Reset to the initial state, dropping pending confirmations.
    ///
    /// This is the timer-expiry upcall: an install that never completes is
    /// abandoned and the session must be restarted.
    pub fn reset(&mut self) {
        self.pending_conf.clear();
        self.state = ServerState::WaitStartReq;
        self.timer.disarm();
        debug!(server = self.as_id, "reset to initial state");
    }

    /// Feed one inbound frame to the automaton.
    pub fn step(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Outcome {
        trace!(server = self.as_id, frame = %hex::encode(frame), "server rx");
        let outcome = self.dispatch(chain, entropy, frame);
        if outcome == Outcome::Reinit {
            self.state = ServerState::WaitStartReq;
            self.timer.disarm();
        }
        outcome
    }

    fn dispatch(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Outcome {
        let header = match Header::decode(frame) {
            Ok(header) => header,
            Err(err) => {
                warn!(server = self.as_id, %err, "unparseable frame");
                return Outcome::Reinit;
            }
        };
        match (self.state, header.msg_type) {
            (ServerState::WaitStartReq, MsgType::StartSess) => {
                self.on_start_request(chain, entropy, frame)
            }
            (ServerState::WaitStartConf, MsgType::PkConf) => {
                self.on_confirmation(chain, frame, header.msg_type)
            }
            (ServerState::WaitForUpdates, MsgType::StartSess) => {
                self.on_join(chain, entropy, frame)
            }
            (ServerState::WaitForUpdates, MsgType::EndSess) => {
                self.on_leave(chain, entropy, frame)
            }
            (ServerState::WaitForUpdates, MsgType::UpdateConf) => {
                self.on_confirmation(chain, frame, header.msg_type)
            }
            (state, msg_type) => {
                warn!(server = self.as_id, ?state, ?msg_type, "unexpected frame");
                Outcome::Reinit
            }
        }
    }

    /// Decode a control frame and authenticate its sender: the requester
    /// must be enrolled and its carried link must match our next draw of
    /// its chain.
    fn verify_requester(&self, chain: &mut impl PufChain, frame: &[u8]) -> Option<NodeId> {
        let pkt = match ControlPacket::decode(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                warn!(server = self.as_id, %err, "malformed request");
                return None;
            }
        };
        if !self.is_enrolled(pkt.sender) {
            warn!(server = self.as_id, requester = pkt.sender, "requester not enrolled");
            return None;
        }
        let expected = chain.next_link(pkt.sender);
        if expected != pkt.link {
            warn!(
                server = self.as_id,
                requester = pkt.sender,
                "requester chain link mismatch"
            );
            return None;
        }
        Some(pkt.sender)
    }

    /// `START_SESS` in `WaitStartReq`: authenticate and bootstrap.
    fn on_start_request(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Outcome {
        let Some(requester) = self.verify_requester(chain, frame) else {
            return Outcome::Reinit;
        };
        debug!(server = self.as_id, requester, "bootstrapping group key");
        self.begin_install(chain, entropy);
        Outcome::Ok
    }

    /// Draw fresh key material and send every enrolled device its share.
    ///
    /// Callable directly by the embedding as well as from the `START_SESS`
    /// path, for deployments where the server drives installation.
    pub fn begin_install(&mut self, chain: &mut impl PufChain, entropy: &mut impl EntropySource) {
        self.pk_installed = false;
        self.private_key = 0;

        // Three links per device, consumed in enrolment order: blinding
        // noise, the device's key share, and the share's signing link. The
        // same noise blinds both the share and the secret token.
        let mut draws = Vec::with_capacity(self.auth_devs.len());
        for &dev in &self.auth_devs {
            let noise = chain.next_link(dev);
            let share = chain.next_link(dev);
            let sign_link = chain.next_link(dev);
            self.sr_key.insert(dev, share);
            self.private_key ^= share;
            draws.push((dev, noise, share, sign_link));
        }
        self.session_nonce = entropy.next_word();
        self.private_key ^= self.session_nonce;
        self.secret_token = entropy.next_word();

        self.pending_conf.clear();
        for (dev, noise, share, sign_link) in draws {
            let offer = KeyPacket::seal(
                MsgType::StartPk,
                self.as_id,
                noise ^ self.private_key ^ share,
                noise ^ self.secret_token,
                sign_link,
            );
            self.push_unicast(dev, offer);
            self.pending_conf.insert(dev);
        }
        self.state = ServerState::WaitStartConf;
        self.timer.arm();
        debug!(
            server = self.as_id,
            devices = self.auth_devs.len(),
            "key shares published"
        );
    }

    /// `PK_CONF` / `UPDATE_CONF`: authenticate, count, and settle.
    fn on_confirmation(
        &mut self,
        chain: &mut impl PufChain,
        frame: &[u8],
        msg_type: MsgType,
    ) -> Outcome {
        let Some(requester) = self.verify_requester(chain, frame) else {
            return Outcome::Reinit;
        };
        if !self.pending_conf.remove(&requester) {
            warn!(server = self.as_id, requester, "confirmation was not pending");
            return Outcome::Reinit;
        }
        if msg_type == MsgType::PkConf {
            self.group_members.insert(requester);
        }

        if !self.pending_conf.is_empty() {
            return Outcome::Ok;
        }
        if self.group_members.is_empty() {
            // Everyone confirmed out of the group.
            self.state = ServerState::WaitStartReq;
            return Outcome::UpdateOk;
        }
        self.state = ServerState::WaitForUpdates;
        self.timer.disarm();
        if !self.pk_installed {
            self.pk_installed = true;
            debug!(
                server = self.as_id,
                members = self.group_members.len(),
                "intra-group key installed"
            );
            Outcome::InstallOk
        } else {
            debug!(
                server = self.as_id,
                members = self.group_members.len(),
                "rekey confirmed"
            );
            Outcome::UpdateOk
        }
    }

    /// `START_SESS` in `WaitForUpdates`: rekey the group and offer the
    /// joiner its share.
    fn on_join(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Outcome {
        let Some(requester) = self.verify_requester(chain, frame) else {
            return Outcome::Reinit;
        };
        if self.group_members.contains(&requester) {
            warn!(server = self.as_id, requester, "join from a current member");
            return Outcome::Reinit;
        }

        let share_noise = chain.next_link(requester);
        let share = chain.next_link(requester);
        let mac_key = chain.next_link(requester);
        self.sr_key.insert(requester, share);

        let old_nonce = self.session_nonce;
        self.session_nonce = entropy.next_word();
        let key_update = self.session_nonce ^ old_nonce ^ share;
        let old_key = self.private_key;
        self.private_key ^= key_update;
        let old_secret_token = self.secret_token;
        self.secret_token = entropy.next_word();

        // Rekey broadcast for current members, blinded with the outgoing
        // key and signed with the outgoing secret token.
        let update = KeyPacket::seal(
            MsgType::UpdateKey,
            self.as_id,
            old_key ^ self.private_key,
            old_key ^ self.secret_token,
            old_secret_token,
        );
        self.broadcast = Some(update.encode());

        // Key share for the joiner, blinded and signed with its own links.
        let offer = KeyPacket::seal(
            MsgType::StartPk,
            self.as_id,
            self.private_key ^ share ^ share_noise,
            self.secret_token ^ share_noise,
            mac_key,
        );
        self.push_unicast(requester, offer);
        self.pending_conf.insert(requester);
        self.state = ServerState::WaitStartConf;
        self.timer.arm();
        debug!(server = self.as_id, joiner = requester, "group rekeyed for join");
        Outcome::Ok
    }

    /// `END_SESS`: remove the leaver and rekey the remaining members.
    fn on_leave(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Outcome {
        let Some(requester) = self.verify_requester(chain, frame) else {
            return Outcome::Reinit;
        };
        if !self.group_members.remove(&requester) {
            warn!(server = self.as_id, requester, "leave from a non-member");
            return Outcome::Reinit;
        }

        let old_nonce = self.session_nonce;
        self.session_nonce = entropy.next_word();
        self.secret_token = entropy.next_word();
        let leaver_share = self.sr_key.get(&requester).copied().unwrap_or(0);
        let key_update = leaver_share ^ old_nonce ^ self.session_nonce;
        self.private_key ^= key_update;

        // Per-member unicast updates, each blinded with a fresh noise link
        // and signed with the link after it.
        let recipients: Vec<NodeId> = self
            .auth_devs
            .iter()
            .copied()
            .filter(|dev| *dev != requester && self.group_members.contains(dev))
            .collect();
        for member in recipients {
            let noise = chain.next_link(member);
            let auth = chain.next_link(member);
            let update = KeyPacket::seal(
                MsgType::UpdateKey,
                self.as_id,
                noise ^ key_update,
                noise ^ self.secret_token,
                auth,
            );
            self.push_unicast(member, update);
        }

        if self.group_members.is_empty() {
            self.state = ServerState::WaitStartReq;
            debug!(server = self.as_id, leaver = requester, "last member left, group dissolved");
        } else {
            debug!(
                server = self.as_id,
                leaver = requester,
                members = self.group_members.len(),
                "group rekeyed for leave"
            );
        }
        Outcome::Ok
    }

    fn push_unicast(&mut self, dest: NodeId, pkt: KeyPacket) {
        // Single-slot per destination: an undrained frame is overwritten.
        self.unicast_slots.insert(dest, pkt.encode());
        self.unicast_queue.push_back(dest);
    }
}

impl<T: InstallTimer> Drop for AuthServer<T> {
    fn drop(&mut self) {
        self.private_key.zeroize();
        self.session_nonce.zeroize();
        self.secret_token.zeroize();
        for share in self.sr_key.values_mut() {
            share.zeroize();
        }
    }
}
