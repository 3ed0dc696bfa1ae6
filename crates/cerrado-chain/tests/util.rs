//! Shared helpers for the integration tests: a throwaway-difficulty
//! parameter set, deterministic keys and a tiny block builder/miner.

use cerrado_common::Hash160;
use cerrado_common::Hash256;
use cerrado_chain::block::coinbase_subsidy;
use cerrado_chain::block::merkle_root;
use cerrado_chain::block::Block;
use cerrado_chain::block::BlockHeader;
use cerrado_chain::chainparams::ChainParams;
use cerrado_chain::chainparams::Network;
use cerrado_chain::keys::hash_type;
use cerrado_chain::keys::PrivateKey;
use cerrado_chain::script::p2pkh_lock_script;
use cerrado_chain::script::p2pkh_unlock_script;
use cerrado_chain::transaction::OutPoint;
use cerrado_chain::transaction::Transaction;
use cerrado_chain::transaction::TxInput;
use cerrado_chain::transaction::TxOutput;

/// A target so easy a handful of nonces finds a block.
pub const EASY_BITS: u32 = 0x207fffff;

/// Fixed base timestamp for test chains.
pub const BASE_TIME: u32 = 1_600_000_000;

pub fn test_key(tag: u8) -> PrivateKey {
    let mut bytes = [0x11u8; 32];
    bytes[31] = tag.wrapping_add(1);
    PrivateKey::from_bytes(&bytes).expect("valid key bytes")
}

pub fn key_hash(tag: u8) -> Hash160 {
    test_key(tag).public_key().hash()
}

/// A coinbase for `height` paying `amount` to the key behind `tag`. The
/// tag also lands in the script so same-height coinbases on different
/// chains get distinct txids.
pub fn coinbase(height: u32, tag: u8, amount: i64) -> Transaction {
    let mut script = vec![0x04];
    script.extend_from_slice(&height.to_le_bytes());
    script.push(0x01);
    script.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            outpoint: OutPoint::coinbase(),
            script,
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            amount,
            script: p2pkh_lock_script(&key_hash(tag)),
        }],
        lock_time: 0,
    }
}

/// Assemble and mine a block at the easy target.
pub fn build_block(
    prev_hash: Hash256,
    height: u32,
    time: u32,
    tag: u8,
    extra_txs: Vec<Transaction>,
) -> Block {
    let subsidy = coinbase_subsidy(height, 210_000);
    let mut transactions = vec![coinbase(height, tag, subsidy)];
    transactions.extend(extra_txs);

    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
    let mut header = BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: merkle_root(&txids),
        time,
        target_bits: EASY_BITS,
        nonce: 0,
    };
    while !header.has_proof_of_work() {
        header.nonce += 1;
    }
    Block {
        header,
        transactions,
    }
}

/// Parameters with trivial difficulty, cash rules active from genesis
/// and the rolling-window difficulty gate held shut.
pub fn test_params() -> ChainParams {
    let mut params = ChainParams::from(Network::Mainnet);
    params.max_target_bits = EASY_BITS;
    params.cash_activation_height = 0;
    params.daa_median_time_threshold = u32::MAX;

    let mut genesis = build_block(Hash256::ZERO, 0, BASE_TIME, 0, Vec::new());
    // Deterministic genesis: re-mine only if the defaults didn't hold
    while !genesis.header.has_proof_of_work() {
        genesis.header.nonce += 1;
    }
    params.genesis = genesis;
    params
}

/// A signed P2PKH spend of `(funding_txid, vout)`, paying `out_amount`
/// to the key behind `to_tag`. `owner_tag` must control the funding
/// output; signatures carry ALL | FORKID.
pub fn spend_p2pkh(
    funding_txid: Hash256,
    vout: u32,
    funding_amount: i64,
    owner_tag: u8,
    to_tag: u8,
    out_amount: i64,
) -> Transaction {
    let key = test_key(owner_tag);
    let lock = p2pkh_lock_script(&key.public_key().hash());

    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxInput {
            outpoint: OutPoint {
                txid: funding_txid,
                index: vout,
            },
            script: Vec::new(),
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            amount: out_amount,
            script: p2pkh_lock_script(&key_hash(to_tag)),
        }],
        lock_time: 0,
    };

    let sig_hash_type = hash_type::ALL | hash_type::FORKID;
    let digest = tx.signature_hash(0, &lock, funding_amount, sig_hash_type, true);
    let signature = key.sign(&digest, sig_hash_type);
    tx.inputs[0].script = p2pkh_unlock_script(&signature, &key.public_key().serialize());
    tx
}
