//! State contract bindings against an in-process fake Ethereum node.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use issuer_chain::abi::selector;
use issuer_chain::{
    tx_hash, ChainError, EthClient, EthStateContract, Fees, GasSettings, StateContract,
    Transactor, TransitStateArgs, TreeStoreContract, UnsignedTx,
};
use issuer_crypto::zk::ProofData;
use issuer_crypto::{poseidon, Hash};
use issuer_kms::{KeyProvider, Kms};
use issuer_types::{Blockchain, Did, DidMethod, KeyKind, NetworkId};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHAIN_ID: u64 = 80002;
const CONTRACT: [u8; 20] = [0x13; 20];

#[derive(Default)]
struct Node {
    raw_txs: Vec<Vec<u8>>,
    estimate_data: Vec<String>,
    revert_estimates: bool,
    calls: Vec<String>,
}

type Shared = Arc<Mutex<Node>>;

fn word(n: u64) -> String {
    format!("{n:064x}")
}

async fn rpc(State(node): State<Shared>, Json(req): Json<Value>) -> Json<Value> {
    let id = req["id"].clone();
    let method = req["method"].as_str().unwrap_or_default().to_string();
    let params = req["params"].clone();
    let mut node = node.lock().expect("lock");

    let result = match method.as_str() {
        "eth_chainId" => json!(format!("0x{CHAIN_ID:x}")),
        "eth_blockNumber" => json!("0x2a"),
        "eth_getTransactionCount" => json!("0x7"),
        "eth_maxPriorityFeePerGas" => json!("0x77359400"),
        "eth_getBlockByNumber" => json!({ "number": "0x2a", "baseFeePerGas": "0x2540be400" }),
        "eth_estimateGas" => {
            if node.revert_estimates {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": 3, "message": "execution reverted: Old state does not match" }
                }));
            }
            let data = params[0]["data"].as_str().unwrap_or_default().to_string();
            node.estimate_data.push(data);
            json!("0x5208")
        }
        "eth_sendRawTransaction" => {
            let raw_hex = params[0].as_str().unwrap_or_default();
            let raw = hex::decode(raw_hex.trim_start_matches("0x")).expect("raw hex");
            let hash = format!("0x{}", hex::encode(Keccak256::digest(&raw)));
            node.raw_txs.push(raw);
            json!(hash)
        }
        "eth_getTransactionReceipt" => {
            let tx = params[0].as_str().unwrap_or_default();
            if tx == "0xpending" {
                Value::Null
            } else {
                json!({ "transactionHash": tx, "status": "0x1", "blockNumber": "0x2b" })
            }
        }
        "eth_call" => {
            let data = params[0]["data"].as_str().unwrap_or_default().to_string();
            node.calls.push(data.clone());
            let state_info = hex::encode(selector("getStateInfoById(uint256)"));
            if data.starts_with(&format!("0x{state_info}")) {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": 3, "message": "execution reverted: Identity does not exist" }
                }));
            }
            let words: String = [11u64, 0, 1_700_000_000, 0, 40, 0]
                .iter()
                .map(|n| word(*n))
                .collect();
            json!(format!("0x{words}"))
        }
        _ => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            }))
        }
    };
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn serve(node: Shared) -> String {
    let app = Router::new().route("/", post(rpc)).with_state(node);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn did() -> Did {
    let genesis = poseidon::hash(&[Hash::from_u64(1)]).expect("poseidon");
    Did::from_genesis_state(
        DidMethod::PolygonId,
        Blockchain::Polygon,
        NetworkId::Amoy,
        genesis.as_le_bytes(),
    )
    .expect("did")
}

fn proof() -> ProofData {
    let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
    ProofData {
        pi_a: s(&["1", "2", "1"]),
        pi_b: vec![s(&["3", "4"]), s(&["5", "6"]), s(&["1", "0"])],
        pi_c: s(&["7", "8", "1"]),
        protocol: "groth16".into(),
        curve: "bn128".into(),
    }
}

struct Fixture {
    node: Shared,
    kms: Kms,
    rpc: Arc<EthClient>,
    transactor: Arc<Transactor>,
}

async fn fixture(gas: GasSettings) -> Fixture {
    let node: Shared = Arc::default();
    let url = serve(node.clone()).await;
    let kms = Kms::in_memory();
    let rpc = Arc::new(EthClient::new(url, Duration::from_secs(5)).expect("client"));
    let transactor = Arc::new(Transactor::new(rpc.clone(), kms.clone(), CHAIN_ID, gas));
    Fixture {
        node,
        kms,
        rpc,
        transactor,
    }
}

#[tokio::test]
async fn transit_state_sends_signed_eip1559_transaction() {
    let f = fixture(GasSettings::default()).await;
    let key = f.kms.create(KeyKind::Secp256k1).await.expect("key");
    let contract = EthStateContract::new(f.transactor.clone(), CONTRACT);

    let tx = contract
        .transit_state(
            &key,
            &TransitStateArgs {
                id: did(),
                old_state: Hash::from_u64(1),
                new_state: Hash::from_u64(2),
                is_old_state_genesis: true,
                proof: proof(),
            },
        )
        .await
        .expect("transit");

    let (raw, data) = {
        let node = f.node.lock().expect("lock");
        (node.raw_txs[0].clone(), node.estimate_data[0].clone())
    };
    assert_eq!(raw[0], 0x02);
    assert_eq!(tx, tx_hash(&raw));

    // Rebuild what the transactor should have signed and check the signer.
    let expected = UnsignedTx {
        chain_id: CHAIN_ID,
        nonce: 7,
        to: CONTRACT,
        value: 0,
        data: hex::decode(data.trim_start_matches("0x")).expect("data"),
        gas_limit: 21_000 + 4_200,
        fees: Fees::Eip1559 {
            max_priority_fee: 2_000_000_000,
            max_fee: 22_000_000_000,
        },
    };
    let digest = expected.signing_hash();
    let sig = f.kms.sign(&key, &digest).await.expect("sign");
    assert_eq!(expected.encode_signed(&sig).expect("encode"), raw);

    let recovered = VerifyingKey::recover_from_prehash(
        &digest,
        &Signature::from_slice(&sig[..64]).expect("sig"),
        RecoveryId::from_byte(sig[64]).expect("recid"),
    )
    .expect("recover");
    let point = recovered.to_encoded_point(false);
    let address = issuer_kms::ethereum_address(point.as_bytes()).expect("address");
    assert_eq!(address, f.kms.eth_address(&key).await.expect("address"));
}

#[tokio::test]
async fn estimate_revert_surfaces_as_reverted() {
    let f = fixture(GasSettings::default()).await;
    f.node.lock().expect("lock").revert_estimates = true;
    let key = f.kms.create(KeyKind::Secp256k1).await.expect("key");
    let contract = EthStateContract::new(f.transactor.clone(), CONTRACT);

    let err = contract
        .transit_state(
            &key,
            &TransitStateArgs {
                id: did(),
                old_state: Hash::from_u64(1),
                new_state: Hash::from_u64(2),
                is_old_state_genesis: true,
                proof: proof(),
            },
        )
        .await
        .expect_err("reverted");
    assert!(matches!(err, ChainError::Reverted(_)));
    assert!(f.node.lock().expect("lock").raw_txs.is_empty());
}

#[tokio::test]
async fn gas_less_sends_legacy_zero_price() {
    let f = fixture(GasSettings {
        gas_less: true,
        gas_limit: Some(500_000),
        ..GasSettings::default()
    })
    .await;
    let key = f.kms.create(KeyKind::Secp256k1).await.expect("key");
    let store = TreeStoreContract::new(f.transactor.clone(), CONTRACT);

    store
        .save_nodes(&key, &[vec![Hash::from_u64(1), Hash::from_u64(2)]])
        .await
        .expect("save");

    let node = f.node.lock().expect("lock");
    let raw = &node.raw_txs[0];
    // Legacy envelopes are plain RLP lists.
    assert!(raw[0] >= 0xc0);
    // Fixed gas limit skips estimation.
    assert!(node.estimate_data.is_empty());
}

#[tokio::test]
async fn views_decode_contract_state() {
    let f = fixture(GasSettings::default()).await;
    let contract = EthStateContract::new(f.transactor.clone(), CONTRACT);

    let info = contract
        .gist_root_info(&Hash::from_u64(11))
        .await
        .expect("root info");
    assert_eq!(info.root, Hash::from_u64(11));
    assert_eq!(info.created_at_timestamp, 1_700_000_000);
    assert_eq!(info.created_at_block, 40);

    assert_eq!(contract.latest_state(&did()).await.expect("state"), None);
    assert_eq!(contract.block_number().await.expect("block"), 42);
    assert_eq!(f.rpc.chain_id().await.expect("chain id"), CHAIN_ID);

    let receipt = contract
        .receipt("0xabc")
        .await
        .expect("receipt")
        .expect("mined");
    assert!(receipt.status);
    assert_eq!(receipt.block_number, 43);
    assert!(contract.receipt("0xpending").await.expect("receipt").is_none());
    assert_eq!(f.node.lock().expect("lock").calls.len(), 2);
}

#[tokio::test]
async fn unreachable_node_is_a_backend_error() {
    let rpc = EthClient::new("http://127.0.0.1:9", Duration::from_millis(500)).expect("client");
    let err = rpc.block_number().await.expect_err("unreachable");
    assert_eq!(err.kind(), issuer_types::ErrorKind::BackendError);
}
