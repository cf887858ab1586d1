//! Integration test: single-device install and wire-trace determinism.
//!
//! Drives a device and its server against separate oracle instances that
//! replay identical per-id link sequences, the way two provisioned PUF
//! carnets would, and checks the exact key material the mock defaults
//! produce.

use keyfed_crypto::testing::{ConstantChain, CountingChain, FixedEntropy, ScriptedEntropy};
use keyfed_group::{AuthServer, Device, DeviceState, ServerState};
use keyfed_types::Outcome;
use keyfed_wire::KeyPacket;

/// The chain link every mock oracle returns (the provisioning default).
const MOCK_LINK: u32 = 0xEF00_00AC;

/// The word the mock entropy source returns.
const MOCK_NONCE: u32 = 0x00CA_FE00;

#[test]
fn single_device_install() {
    let mut server_chain = ConstantChain(MOCK_LINK);
    let mut device_chain = ConstantChain(MOCK_LINK);
    let mut entropy = FixedEntropy(MOCK_NONCE);
    let mut server = AuthServer::new(1, &[10]).expect("server");
    let mut device = Device::new(10, 1);

    device.start_session(&mut device_chain);
    let request = device.take_outbound().expect("request frame");
    assert_eq!(
        server.step(&mut server_chain, &mut entropy, &request),
        Outcome::Ok
    );
    assert_eq!(server.state(), ServerState::WaitStartConf);

    let (dest, share) = server.pop_unicast().expect("share frame");
    assert_eq!(dest, 10);
    let pkt = KeyPacket::decode(&share).expect("decode");
    // share field = noise ^ group_key ^ device_share over the mock defaults.
    assert_eq!(
        pkt.key_material,
        MOCK_LINK ^ (MOCK_LINK ^ MOCK_NONCE) ^ MOCK_LINK
    );

    assert_eq!(device.step(&mut device_chain, &share), Outcome::InstallOk);
    assert_eq!(device.pk(), MOCK_LINK ^ MOCK_NONCE);
    assert_eq!(device.state(), DeviceState::WaitForUpdate);

    let confirmation = device.take_outbound().expect("confirmation frame");
    assert_eq!(
        server.step(&mut server_chain, &mut entropy, &confirmation),
        Outcome::InstallOk
    );
    assert_eq!(server.state(), ServerState::WaitForUpdates);

    // An installed device holds exactly the server's key material.
    assert_eq!(device.pk(), server.private_key());
    assert_eq!(device.secret_token(), server.secret_token());
}

#[test]
fn group_key_is_xor_of_member_shares() {
    // Distinct links per draw: the invariant has to hold structurally, not
    // by constant-folding luck.
    let mut server_chain = CountingChain::new(0x5EED_0000);
    let mut dev_chains = [
        CountingChain::new(0x5EED_0000),
        CountingChain::new(0x5EED_0000),
    ];
    let mut entropy = ScriptedEntropy::new(&[0x1111_1111, 0x2222_2222]);
    let mut server = AuthServer::new(1, &[10, 20]).expect("server");
    let mut devices = [Device::new(10, 1), Device::new(20, 1)];

    devices[0].start_session(&mut dev_chains[0]);
    let request = devices[0].take_outbound().expect("request frame");
    server.step(&mut server_chain, &mut entropy, &request);

    while let Some((dest, share)) = server.pop_unicast() {
        let idx = if dest == 10 { 0 } else { 1 };
        assert_eq!(
            devices[idx].step(&mut dev_chains[idx], &share),
            Outcome::InstallOk
        );
        let confirmation = devices[idx].take_outbound().expect("confirmation frame");
        server.step(&mut server_chain, &mut entropy, &confirmation);
    }
    assert_eq!(server.state(), ServerState::WaitForUpdates);

    let mut expected = server.session_nonce();
    for &dev in server.enrolled() {
        expected ^= server.share_of(dev).expect("share");
    }
    assert_eq!(server.private_key(), expected);
    assert_eq!(devices[0].pk(), server.private_key());
    assert_eq!(devices[1].pk(), server.private_key());
}

/// Run a two-device install followed by a leave, collecting every frame
/// that crosses the wire.
fn run_install_and_leave() -> Vec<Vec<u8>> {
    let mut trace = Vec::new();
    let mut server_chain = CountingChain::new(0x5EED_0000);
    let mut dev_chains = [
        CountingChain::new(0x5EED_0000),
        CountingChain::new(0x5EED_0000),
    ];
    let mut entropy = ScriptedEntropy::new(&[0xAAAA_0001, 0xBBBB_0002, 0xCCCC_0003, 0xDDDD_0004]);
    let mut server = AuthServer::new(1, &[10, 20]).expect("server");
    let mut devices = [Device::new(10, 1), Device::new(20, 1)];

    devices[0].start_session(&mut dev_chains[0]);
    let request = devices[0].take_outbound().expect("request frame");
    trace.push(request.to_vec());
    server.step(&mut server_chain, &mut entropy, &request);

    while let Some((dest, share)) = server.pop_unicast() {
        trace.push(share.to_vec());
        let idx = if dest == 10 { 0 } else { 1 };
        devices[idx].step(&mut dev_chains[idx], &share);
        let confirmation = devices[idx].take_outbound().expect("confirmation frame");
        trace.push(confirmation.to_vec());
        server.step(&mut server_chain, &mut entropy, &confirmation);
    }

    devices[0].end_session(&mut dev_chains[0]);
    let goodbye = devices[0].take_outbound().expect("end frame");
    trace.push(goodbye.to_vec());
    server.step(&mut server_chain, &mut entropy, &goodbye);

    let (dest, update) = server.pop_unicast().expect("rekey unicast");
    assert_eq!(dest, 20);
    trace.push(update.to_vec());
    devices[1].step(&mut dev_chains[1], &update);

    trace
}

#[test]
fn identical_collaborators_produce_identical_traces() {
    let first = run_install_and_leave();
    let second = run_install_and_leave();

    assert_eq!(first.len(), second.len());
    for (idx, (a, b)) in first.iter().zip(second.iter()).enumerate() {
        assert_eq!(
            hex::encode(a),
            hex::encode(b),
            "trace diverged at frame {idx}"
        );
    }
}
