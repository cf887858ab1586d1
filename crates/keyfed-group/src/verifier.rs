//! Local Verifier automaton.
//!
//! A Local Verifier is both sides of the hierarchy at once: toward the
//! upper Authentication Server it is a device installing the upper
//! intra-group key, and toward its own devices it is an Authentication
//! Server distributing the lower one. On top of that it cooperates with
//! its peer verifiers: once both of its intra keys are live it folds a
//! fresh contribution into the federation-wide inter-group key, shares the
//! contribution with its peers, and pushes the settled key down to its
//! devices.
//!
//! Inbound frames are routed by the sender's class: upstream server,
//! enrolled device, or peer verifier. The transport must never hand a
//! verifier a frame from any other identity.

use keyfed_crypto::{EntropySource, PufChain};
use keyfed_types::{Key, NodeId, Nonce, Outcome, Token, MAX_AUTH};
use keyfed_wire::{KeyPacket, MsgType, CONTROL_FRAME_LEN, HEADER_LEN, KEYED_FRAME_LEN};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::device::Device;
use crate::server::AuthServer;
use crate::timer::{InstallTimer, NoopTimer};
use crate::GroupError;

/// Composite verifier state: an upstream device role, a downstream server
/// role, and the federation-wide inter-group key shared with peers.
pub struct LocalVerifier<T: InstallTimer = NoopTimer> {
    device: Device,
    server: AuthServer<T>,
    peer_lvs: Vec<NodeId>,
    inter_group_key: Key,
    inter_sess_nonce: Nonce,
    group_secret_token: Token,
    /// Contributions (our own included) not yet folded in.
    pending_shares: usize,
    is_inter_installed: bool,
    /// Broadcast slot toward peer verifiers.
    peers_broadcast: Option<[u8; KEYED_FRAME_LEN]>,
    /// Broadcast slot toward our own devices.
    devices_broadcast: Option<[u8; KEYED_FRAME_LEN]>,
    inter_timer: T,
}

impl LocalVerifier<NoopTimer> {
    /// Create a verifier without deadline handling.
    ///
    /// `id` is this verifier's federation identity, used both as its device
    /// identity toward `upstream` and as its server identity toward
    /// `devices`. `peers` lists the other verifiers of the federation.
    pub fn new(
        id: NodeId,
        upstream: NodeId,
        devices: &[NodeId],
        peers: &[NodeId],
    ) -> Result<Self, GroupError> {
        Self::with_timers(id, upstream, devices, peers, NoopTimer, NoopTimer)
    }
}

impl<T: InstallTimer> LocalVerifier<T> {
    /// Create a verifier with an install timer for the downstream server
    /// role and one for the inter-group installation.
    pub fn with_timers(
        id: NodeId,
        upstream: NodeId,
        devices: &[NodeId],
        peers: &[NodeId],
        install_timer: T,
        inter_timer: T,
    ) -> Result<Self, GroupError> {
        if peers.len() > MAX_AUTH {
            return Err(GroupError::TooManyVerifiers {
                count: peers.len(),
                max: MAX_AUTH,
            });
        }
        Ok(Self {
            device: Device::new(id, upstream),
            server: AuthServer::with_timer(id, devices, install_timer)?,
            peer_lvs: peers.to_vec(),
            inter_group_key: 0,
            inter_sess_nonce: 0,
            group_secret_token: 0,
            // One share per federation verifier, our own included.
            pending_shares: peers.len() + 1,
            is_inter_installed: false,
            peers_broadcast: None,
            devices_broadcast: None,
            inter_timer,
        })
    }

    pub fn id(&self) -> NodeId {
        self.device.id()
    }

    /// The upstream device role.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The downstream server role.
    pub fn server(&self) -> &AuthServer<T> {
        &self.server
    }

    pub fn inter_group_key(&self) -> Key {
        self.inter_group_key
    }

    pub fn group_secret_token(&self) -> Token {
        self.group_secret_token
    }

    pub fn inter_sess_nonce(&self) -> Nonce {
        self.inter_sess_nonce
    }

    pub fn is_inter_installed(&self) -> bool {
        self.is_inter_installed
    }

    /// Contributions still missing from the inter-group key.
    pub fn pending_shares(&self) -> usize {
        self.pending_shares
    }

    pub fn is_peer(&self, id: NodeId) -> bool {
        self.peer_lvs.contains(&id)
    }

    /// Ask the upstream server to install our intra-group key.
    pub fn start_upstream_session(&mut self, chain: &mut impl PufChain) {
        self.device.start_session(chain);
    }

    /// Leave the upstream group.
    pub fn end_upstream_session(&mut self, chain: &mut impl PufChain) {
        self.device.end_session(chain);
    }

    /// Timer-expiry upcall for the downstream server role.
    pub fn reset_downstream(&mut self) {
        self.server.reset();
    }

    /// Drain the upstream unicast slot (device role).
    pub fn take_upstream_frame(&mut self) -> Option<[u8; CONTROL_FRAME_LEN]> {
        self.device.take_outbound()
    }

    /// Drain the next downstream unicast frame (server role).
    pub fn pop_downstream_unicast(&mut self) -> Option<(NodeId, [u8; KEYED_FRAME_LEN])> {
        self.server.pop_unicast()
    }

    /// Drain the downstream rekey broadcast slot (server role).
    pub fn take_downstream_broadcast(&mut self) -> Option<[u8; KEYED_FRAME_LEN]> {
        self.server.take_broadcast()
    }

    /// Drain the broadcast slot toward peer verifiers.
    pub fn take_peers_broadcast(&mut self) -> Option<[u8; KEYED_FRAME_LEN]> {
        self.peers_broadcast.take()
    }

    /// Drain the broadcast slot toward our own devices.
    pub fn take_devices_broadcast(&mut self) -> Option<[u8; KEYED_FRAME_LEN]> {
        self.devices_broadcast.take()
    }

    /// Feed one inbound frame, routed by the sender's class.
    ///
    /// # Errors
    ///
    /// Returns [`GroupError::RuntFrame`] or [`GroupError::UnknownSender`]
    /// when the transport hands us a frame it never should have; both are
    /// contract violations, not protocol events.
    pub fn step(
        &mut self,
        chain: &mut impl PufChain,
        entropy: &mut impl EntropySource,
        frame: &[u8],
    ) -> Result<Outcome, GroupError> {
        if frame.len() < HEADER_LEN {
            return Err(GroupError::RuntFrame(frame.len()));
        }
        let sender = NodeId::from_be_bytes([frame[1], frame[2]]);

        if sender == self.device.as_id() {
            let outcome = self.device.step(chain, frame);
            if outcome == Outcome::InstallOk && self.server.pk_installed() {
                self.contribute(entropy);
            }
            Ok(outcome)
        } else if self.server.is_enrolled(sender) {
            let outcome = self.server.step(chain, entropy, frame);
            if outcome == Outcome::InstallOk && self.device.is_pk_installed() {
                self.contribute(entropy);
            }
            Ok(outcome)
        } else if self.peer_lvs.contains(&sender) {
            self.on_peer_frame(sender, frame)
        } else {
            Err(GroupError::UnknownSender(sender))
        }
    }

    /// Fold a peer verifier's contribution into the inter-group key.
    fn on_peer_frame(&mut self, sender: NodeId, frame: &[u8]) -> Result<Outcome, GroupError> {
        if frame[0] != MsgType::InterKeyInstall.tag() {
            return Err(GroupError::UnexpectedPeerFrame {
                sender,
                tag: frame[0],
            });
        }
        let pkt = match KeyPacket::decode(frame) {
            Ok(pkt) => pkt,
            Err(err) => {
                // Peer frames never tear down the intra sessions.
                debug!(verifier = self.id(), peer = sender, %err, "short peer frame skipped");
                return Ok(Outcome::ConnWait);
            }
        };
        if !pkt.verify(self.device.secret_token()) {
            warn!(
                verifier = self.id(),
                peer = sender,
                "peer contribution failed authentication"
            );
            return Ok(Outcome::AuthFailed);
        }

        // Contributions are blinded with the upper intra-group key, which
        // every verifier of the federation shares.
        self.inter_group_key ^= pkt.key_material ^ self.device.pk();
        self.group_secret_token ^= pkt.token_material ^ self.device.pk();

        if self.is_inter_installed {
            // A rekey from a peer: propagate downward immediately.
            self.push_to_devices();
        } else {
            self.pending_shares = self.pending_shares.saturating_sub(1);
            debug!(
                verifier = self.id(),
                peer = sender,
                pending = self.pending_shares,
                "peer contribution folded in"
            );
            if self.pending_shares == 0 {
                self.settle_inter_key();
            }
        }
        Ok(Outcome::Ok)
    }

    /// Generate and publish our contribution to the inter-group key.
    ///
    /// Runs once, when the second of the two intra installations completes.
    fn contribute(&mut self, entropy: &mut impl EntropySource) {
        let token = entropy.next_word();
        let nonce = entropy.next_word();
        let key_part = token ^ self.server.private_key();
        self.inter_sess_nonce = nonce;
        self.inter_group_key ^= key_part;
        self.group_secret_token ^= token;

        let pkt = KeyPacket::seal(
            MsgType::InterKeyInstall,
            self.device.id(),
            key_part ^ self.device.pk(),
            self.group_secret_token ^ self.device.pk(),
            self.device.secret_token(),
        );
        self.peers_broadcast = Some(pkt.encode());

        self.pending_shares = self.pending_shares.saturating_sub(1);
        debug!(
            verifier = self.id(),
            pending = self.pending_shares,
            "inter-group contribution published"
        );
        if self.pending_shares == 0 {
            self.settle_inter_key();
        } else {
            self.inter_timer.arm();
        }
    }

    /// All contributions are in: mark the key installed and push it down.
    fn settle_inter_key(&mut self) {
        self.is_inter_installed = true;
        self.inter_timer.disarm();
        debug!(verifier = self.id(), "inter-group key installed");
        self.push_to_devices();
    }

    /// Publish the inter-group key to our devices, blinded with the
    /// downstream intra-group key and signed with its secret token.
    fn push_to_devices(&mut self) {
        let pkt = KeyPacket::seal(
            MsgType::LvSupKeyInstall,
            self.device.id(),
            self.inter_group_key ^ self.server.private_key(),
            self.group_secret_token ^ self.server.private_key(),
            self.server.secret_token(),
        );
        self.devices_broadcast = Some(pkt.encode());
        debug!(verifier = self.id(), "inter-group key pushed to devices");
    }

    /// Fold a downstream rekey into the inter-group key and republish it.
    ///
    /// Called by the embedding after a downstream leave settles, with the
    /// downstream key as it was before the rekey. Swaps the inter session
    /// nonce, refreshes the group secret token, and publishes the updated
    /// key both to peers and to our devices.
    pub fn refresh_inter_key(&mut self, entropy: &mut impl EntropySource, old_downstream_key: Key) {
        let old_nonce = self.inter_sess_nonce;
        self.inter_sess_nonce = entropy.next_word();
        self.group_secret_token ^= entropy.next_word();
        let key_update =
            old_downstream_key ^ self.server.private_key() ^ old_nonce ^ self.inter_sess_nonce;
        self.inter_group_key ^= key_update;

        let down = KeyPacket::seal(
            MsgType::LvSupKeyInstall,
            self.device.id(),
            self.server.private_key() ^ self.inter_group_key,
            self.server.private_key() ^ self.group_secret_token,
            self.server.secret_token(),
        );
        self.devices_broadcast = Some(down.encode());

        let peers = KeyPacket::seal(
            MsgType::InterKeyInstall,
            self.device.id(),
            self.device.pk() ^ self.inter_group_key,
            self.device.pk() ^ self.group_secret_token,
            self.device.secret_token(),
        );
        self.peers_broadcast = Some(peers.encode());
        debug!(verifier = self.id(), "inter-group key refreshed after downstream rekey");
    }
}

impl<T: InstallTimer> Drop for LocalVerifier<T> {
    fn drop(&mut self) {
        self.inter_group_key.zeroize();
        self.inter_sess_nonce.zeroize();
        self.group_secret_token.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use keyfed_crypto::testing::{ConstantChain, FixedEntropy};
    use keyfed_wire::ControlPacket;

    use super::*;

    const LINK: u32 = 0xEF00_00AC;
    const NONCE: u32 = 0x00CA_FE00;

    /// Install both intra layers of a verifier with one local device.
    ///
    /// The upstream share frame is forged the way the upper server would
    /// build it over the same constant chain.
    fn installed_verifier(id: NodeId, peer: NodeId) -> (LocalVerifier, ConstantChain, FixedEntropy)
    {
        let mut chain = ConstantChain(LINK);
        let mut entropy = FixedEntropy(NONCE);
        let mut lv = LocalVerifier::new(id, 1, &[100], &[peer]).expect("verifier");

        // Downstream device asks in; the server role bootstraps.
        let req = ControlPacket::new(MsgType::StartSess, 100, LINK).encode();
        assert_eq!(
            lv.step(&mut chain, &mut entropy, &req).expect("step"),
            Outcome::Ok
        );
        let conf = ControlPacket::new(MsgType::PkConf, 100, LINK).encode();
        assert_eq!(
            lv.step(&mut chain, &mut entropy, &conf).expect("step"),
            Outcome::InstallOk
        );
        // Only one intra layer is up: no contribution yet.
        assert!(lv.take_peers_broadcast().is_none());

        // Upstream share arrives; the device role installs.
        let upper_key = LINK ^ NONCE;
        let share = KeyPacket::seal(
            MsgType::StartPk,
            1,
            LINK ^ upper_key ^ LINK,
            LINK ^ NONCE,
            LINK,
        )
        .encode();
        assert_eq!(
            lv.step(&mut chain, &mut entropy, &share).expect("step"),
            Outcome::InstallOk
        );
        (lv, chain, entropy)
    }

    #[test]
    fn test_contribution_after_both_installs() {
        let (mut lv, _, _) = installed_verifier(2, 3);

        assert_eq!(lv.pending_shares(), 1);
        assert!(!lv.is_inter_installed());

        let frame = lv.take_peers_broadcast().expect("contribution");
        let pkt = KeyPacket::decode(&frame).expect("decode");
        assert_eq!(pkt.msg_type, MsgType::InterKeyInstall);
        assert_eq!(pkt.sender, 2);
        assert!(pkt.verify(lv.device().secret_token()));
        // key_part = token ^ downstream key, blinded with the upstream key.
        let key_part = NONCE ^ lv.server().private_key();
        assert_eq!(pkt.key_material, key_part ^ lv.device().pk());
        assert_eq!(lv.inter_group_key(), key_part);

        // Not yet settled: nothing pushed to devices.
        assert!(lv.take_devices_broadcast().is_none());
    }

    #[test]
    fn test_peer_contribution_settles_key() {
        let (mut lv_a, mut chain, mut entropy) = installed_verifier(2, 3);
        let (mut lv_b, _, _) = installed_verifier(3, 2);

        let from_b = lv_b.take_peers_broadcast().expect("b contribution");
        assert_eq!(
            lv_a.step(&mut chain, &mut entropy, &from_b).expect("step"),
            Outcome::Ok
        );
        assert!(lv_a.is_inter_installed());
        assert_eq!(lv_a.pending_shares(), 0);

        // Both verifiers converge on the same inter-group key.
        let from_a = lv_a.take_peers_broadcast().expect("a contribution");
        let mut chain_b = ConstantChain(LINK);
        let mut entropy_b = FixedEntropy(NONCE);
        lv_b.step(&mut chain_b, &mut entropy_b, &from_a).expect("step");
        assert!(lv_b.is_inter_installed());
        assert_eq!(lv_a.inter_group_key(), lv_b.inter_group_key());
        assert_eq!(lv_a.group_secret_token(), lv_b.group_secret_token());

        // The settled key is pushed down, decodable by the local device.
        let down = lv_a.take_devices_broadcast().expect("downstream install");
        let pkt = KeyPacket::decode(&down).expect("decode");
        assert_eq!(pkt.msg_type, MsgType::LvSupKeyInstall);
        assert!(pkt.verify(lv_a.server().secret_token()));
        assert_eq!(
            pkt.key_material ^ lv_a.server().private_key(),
            lv_a.inter_group_key()
        );
    }

    #[test]
    fn test_peer_bad_sign_is_auth_failed() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);
        let key_before = lv.inter_group_key();

        let mut forged = KeyPacket::seal(MsgType::InterKeyInstall, 3, 1, 2, 0xBAD0_BAD0).encode();
        forged[14] ^= 0xFF;
        assert_eq!(
            lv.step(&mut chain, &mut entropy, &forged).expect("step"),
            Outcome::AuthFailed
        );
        assert_eq!(lv.inter_group_key(), key_before);
        assert_eq!(lv.pending_shares(), 1);
    }

    #[test]
    fn test_short_peer_frame_soft_skipped() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);

        let frame = [MsgType::InterKeyInstall.tag(), 0x00, 0x03, 0xAA];
        assert_eq!(
            lv.step(&mut chain, &mut entropy, &frame).expect("step"),
            Outcome::ConnWait
        );
    }

    #[test]
    fn test_unknown_sender_is_fatal() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);

        let frame = ControlPacket::new(MsgType::StartSess, 999, LINK).encode();
        let err = lv.step(&mut chain, &mut entropy, &frame).expect_err("err");
        assert!(matches!(err, GroupError::UnknownSender(999)));
    }

    #[test]
    fn test_runt_frame_is_fatal() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);
        let err = lv.step(&mut chain, &mut entropy, &[0x00]).expect_err("err");
        assert!(matches!(err, GroupError::RuntFrame(1)));
    }

    #[test]
    fn test_wrong_tag_from_peer_is_fatal() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);

        let frame = KeyPacket::seal(MsgType::UpdateKey, 3, 0, 0, 0).encode();
        let err = lv.step(&mut chain, &mut entropy, &frame).expect_err("err");
        assert!(matches!(
            err,
            GroupError::UnexpectedPeerFrame { sender: 3, tag: 4 }
        ));
    }

    #[test]
    fn test_peer_rekey_after_install_propagates_down() {
        let (mut lv_a, mut chain, mut entropy) = installed_verifier(2, 3);
        let (mut lv_b, _, _) = installed_verifier(3, 2);

        let from_b = lv_b.take_peers_broadcast().expect("b contribution");
        lv_a.step(&mut chain, &mut entropy, &from_b).expect("step");
        lv_a.take_devices_broadcast().expect("initial push");

        // A later peer frame is a rekey: folded in and pushed down again.
        let rekey = KeyPacket::seal(
            MsgType::InterKeyInstall,
            3,
            0x5555_5555 ^ lv_a.device().pk(),
            0x6666_6666 ^ lv_a.device().pk(),
            lv_a.device().secret_token(),
        )
        .encode();
        let key_before = lv_a.inter_group_key();
        assert_eq!(
            lv_a.step(&mut chain, &mut entropy, &rekey).expect("step"),
            Outcome::Ok
        );
        assert_eq!(lv_a.inter_group_key(), key_before ^ 0x5555_5555);
        assert!(lv_a.take_devices_broadcast().is_some());
    }

    #[test]
    fn test_refresh_inter_key_publishes_both_frames() {
        let (mut lv, mut chain, mut entropy) = installed_verifier(2, 3);
        let (mut lv_b, _, _) = installed_verifier(3, 2);
        let from_b = lv_b.take_peers_broadcast().expect("b contribution");
        lv.step(&mut chain, &mut entropy, &from_b).expect("step");
        lv.take_peers_broadcast();
        lv.take_devices_broadcast();

        let old_downstream_key = lv.server().private_key();
        lv.refresh_inter_key(&mut entropy, old_downstream_key);

        let down = lv.take_devices_broadcast().expect("devices frame");
        let pkt = KeyPacket::decode(&down).expect("decode");
        assert_eq!(pkt.msg_type, MsgType::LvSupKeyInstall);
        assert!(pkt.verify(lv.server().secret_token()));
        assert_eq!(
            pkt.key_material ^ lv.server().private_key(),
            lv.inter_group_key()
        );

        let peers = lv.take_peers_broadcast().expect("peers frame");
        let pkt = KeyPacket::decode(&peers).expect("decode");
        assert_eq!(pkt.msg_type, MsgType::InterKeyInstall);
        assert!(pkt.verify(lv.device().secret_token()));
    }
}
