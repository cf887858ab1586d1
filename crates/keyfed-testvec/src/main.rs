//! Test vector generator for the keyfed protocol.
//!
//! Generates `test_vectors.json` with authenticator-fold vectors, frame
//! encodings, and a scripted single-device install trace. The vectors are
//! the ground truth for wire interoperability with other implementations.
//!
//! Usage:
//!   keyfed-testvec             # Generate test_vectors.json
//!   keyfed-testvec --stdout    # Print vectors instead of writing the file

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keyfed_crypto::keyed_sign;
use keyfed_crypto::testing::{ConstantChain, FixedEntropy};
use keyfed_group::{AuthServer, Device};
use keyfed_wire::{ControlPacket, KeyPacket, MsgType};

/// The chain link every mock oracle returns.
const MOCK_LINK: u32 = 0xEF00_00AC;

/// The word the mock entropy source returns.
const MOCK_NONCE: u32 = 0x00CA_FE00;

#[derive(Serialize, Deserialize)]
struct TestVectors {
    version: String,
    generated_by: String,
    vectors: BTreeMap<String, TestVector>,
}

#[derive(Serialize, Deserialize)]
struct TestVector {
    description: String,
    inputs: BTreeMap<String, String>,
    outputs: BTreeMap<String, String>,
}

fn generate_sign_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    let prefix: [u8; 11] = [
        0x01, 0x00, 0x0A, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33,
    ];
    let sign = keyed_sign(&prefix, 0xCAFE_BABE);
    vectors.insert(
        "keyed_sign_frame_prefix".to_string(),
        TestVector {
            description: "keyed_sign over an 11-byte frame prefix; the trailing partial word is \
                          zero-padded on the right"
                .to_string(),
            inputs: BTreeMap::from([
                ("buffer".to_string(), hex::encode(prefix)),
                ("key".to_string(), "cafebabe".to_string()),
            ]),
            outputs: BTreeMap::from([("sign".to_string(), format!("{sign:08x}"))]),
        },
    );

    let sign = keyed_sign(&[0u8; 8], 0x1234_5678);
    vectors.insert(
        "keyed_sign_even_word_count".to_string(),
        TestVector {
            description: "keyed_sign over eight zero bytes; the key cancels itself on even word \
                          counts"
                .to_string(),
            inputs: BTreeMap::from([
                ("buffer".to_string(), hex::encode([0u8; 8])),
                ("key".to_string(), "12345678".to_string()),
            ]),
            outputs: BTreeMap::from([("sign".to_string(), format!("{sign:08x}"))]),
        },
    );

    vectors
}

fn generate_frame_vectors() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    let control = ControlPacket::new(MsgType::StartSess, 10, MOCK_LINK);
    vectors.insert(
        "control_frame_start_sess".to_string(),
        TestVector {
            description: "7-byte START_SESS frame from device 10".to_string(),
            inputs: BTreeMap::from([
                ("sender".to_string(), "10".to_string()),
                ("link".to_string(), format!("{MOCK_LINK:08x}")),
            ]),
            outputs: BTreeMap::from([("frame".to_string(), hex::encode(control.encode()))]),
        },
    );

    let keyed = KeyPacket::seal(MsgType::UpdateKey, 1, 0xDEAD_BEEF, 0x0BAD_F00D, MOCK_LINK);
    vectors.insert(
        "keyed_frame_update_key".to_string(),
        TestVector {
            description: "15-byte UPDATE_KEY frame from server 1, signed over the 11-byte prefix"
                .to_string(),
            inputs: BTreeMap::from([
                ("sender".to_string(), "1".to_string()),
                ("key_material".to_string(), "deadbeef".to_string()),
                ("token_material".to_string(), "0badf00d".to_string()),
                ("sign_key".to_string(), format!("{MOCK_LINK:08x}")),
            ]),
            outputs: BTreeMap::from([("frame".to_string(), hex::encode(keyed.encode()))]),
        },
    );

    vectors
}

fn generate_install_trace() -> BTreeMap<String, TestVector> {
    let mut vectors = BTreeMap::new();

    let mut chain = ConstantChain(MOCK_LINK);
    let mut entropy = FixedEntropy(MOCK_NONCE);
    let mut server = AuthServer::new(1, &[10]).expect("server");
    let mut device = Device::new(10, 1);

    device.start_session(&mut chain);
    let request = device.take_outbound().expect("request frame");
    server.step(&mut chain, &mut entropy, &request);
    let (_, share) = server.pop_unicast().expect("share frame");
    device.step(&mut chain, &share);
    let confirmation = device.take_outbound().expect("confirmation frame");
    server.step(&mut chain, &mut entropy, &confirmation);

    vectors.insert(
        "single_device_install_trace".to_string(),
        TestVector {
            description: "Full install of one device over a constant chain and fixed entropy"
                .to_string(),
            inputs: BTreeMap::from([
                ("chain_link".to_string(), format!("{MOCK_LINK:08x}")),
                ("entropy_word".to_string(), format!("{MOCK_NONCE:08x}")),
                ("server_id".to_string(), "1".to_string()),
                ("device_id".to_string(), "10".to_string()),
            ]),
            outputs: BTreeMap::from([
                ("start_sess".to_string(), hex::encode(request)),
                ("start_pk".to_string(), hex::encode(share)),
                ("pk_conf".to_string(), hex::encode(confirmation)),
                ("group_key".to_string(), format!("{:08x}", server.private_key())),
                ("device_pk".to_string(), format!("{:08x}", device.pk())),
                (
                    "secret_token".to_string(),
                    format!("{:08x}", device.secret_token()),
                ),
            ]),
        },
    );

    vectors
}

fn generate_all_vectors() -> TestVectors {
    let mut vectors = BTreeMap::new();
    vectors.extend(generate_sign_vectors());
    vectors.extend(generate_frame_vectors());
    vectors.extend(generate_install_trace());
    TestVectors {
        version: "1".to_string(),
        generated_by: "keyfed-testvec".to_string(),
        vectors,
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let vectors = generate_all_vectors();
    let json = serde_json::to_string_pretty(&vectors).expect("serialize");

    if args.iter().any(|a| a == "--stdout") {
        println!("{json}");
        return;
    }

    let path = "tests/fixtures/test_vectors.json";
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).expect("create dirs");
    }
    std::fs::write(path, &json).expect("write file");
    eprintln!("Generated {} test vectors to {path}", vectors.vectors.len());
}
