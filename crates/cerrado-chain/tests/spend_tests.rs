//! Script spend scenarios run through the full interpreter: pay to
//! public key hash with good and swapped keys, pay to script hash with
//! the redeem script actually executing, bare multisig, and the
//! time-lock opcodes.

mod util;

use cerrado_common::hash160;
use cerrado_chain::keys::hash_type;
use cerrado_chain::script::interpreter::verify_input;
use cerrado_chain::script::num::arithmetic_write;
use cerrado_chain::script::opcodes::*;
use cerrado_chain::script::p2pkh_lock_script;
use cerrado_chain::script::p2pkh_unlock_script;
use cerrado_chain::script::p2sh_lock_script;
use cerrado_chain::script::p2sh_unlock_script;
use cerrado_chain::script::write_push_data;
use cerrado_chain::script::ScriptFlags;
use cerrado_chain::transaction::OutPoint;
use cerrado_chain::transaction::Transaction;
use cerrado_chain::transaction::TxInput;
use cerrado_chain::transaction::TxOutput;
use util::key_hash;
use util::test_key;

const AMOUNT: i64 = 51_000;

fn cash_flags() -> ScriptFlags {
    ScriptFlags {
        cash_active: true,
        ..Default::default()
    }
}

fn unsigned_spend() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            outpoint: OutPoint {
                txid: cerrado_common::double_sha256(b"funding"),
                index: 0,
            },
            script: Vec::new(),
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            amount: 50_000,
            script: p2pkh_lock_script(&key_hash(2)),
        }],
        lock_time: 0,
    }
}

#[test]
fn p2pkh_round_trip() {
    let key = test_key(1);
    let lock = p2pkh_lock_script(&key.public_key().hash());
    let sig_hash_type = hash_type::ALL | hash_type::FORKID;

    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, sig_hash_type, true);
    let signature = key.sign(&digest, sig_hash_type);
    tx.inputs[0].script = p2pkh_unlock_script(&signature, &key.public_key().serialize());

    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(true));
}

#[test]
fn p2pkh_with_swapped_key_does_not_verify() {
    // Signed by key 2 but presenting key 1's public key: the scripts
    // run fine and the spend simply fails to verify
    let owner = test_key(1);
    let imposter = test_key(2);
    let lock = p2pkh_lock_script(&owner.public_key().hash());
    let sig_hash_type = hash_type::ALL | hash_type::FORKID;

    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, sig_hash_type, true);
    let signature = imposter.sign(&digest, sig_hash_type);
    tx.inputs[0].script = p2pkh_unlock_script(&signature, &owner.public_key().serialize());

    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));
}

#[test]
fn p2pkh_wrong_hash_does_not_verify() {
    // Key 2 signs and presents itself, but the output pays key 1
    let imposter = test_key(2);
    let lock = p2pkh_lock_script(&key_hash(1));
    let sig_hash_type = hash_type::ALL | hash_type::FORKID;

    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, sig_hash_type, true);
    let signature = imposter.sign(&digest, sig_hash_type);
    tx.inputs[0].script = p2pkh_unlock_script(&signature, &imposter.public_key().serialize());

    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));
}

#[test]
fn forkid_is_mandatory_after_the_fork() {
    let key = test_key(1);
    let lock = p2pkh_lock_script(&key.public_key().hash());

    // Signed the legacy way: refused under cash rules
    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, hash_type::ALL, false);
    let signature = key.sign(&digest, hash_type::ALL);
    tx.inputs[0].script = p2pkh_unlock_script(&signature, &key.public_key().serialize());
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));

    // And accepted before the fork
    let legacy_flags = ScriptFlags::default();
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &legacy_flags), Ok(true));
}

#[test]
fn p2sh_executes_the_redeem_script() {
    // Redeem script: OP_5 OP_EQUAL; the unlock supplies the five
    let redeem = vec![OP_5, OP_EQUAL];
    let lock = p2sh_lock_script(&hash160(&redeem));

    let mut tx = unsigned_spend();
    tx.inputs[0].script = p2sh_unlock_script(&[&arithmetic_write(5)], &redeem);
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(true));

    // A wrong argument makes the redeem script come up false
    let mut tx = unsigned_spend();
    tx.inputs[0].script = p2sh_unlock_script(&[&arithmetic_write(4)], &redeem);
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));

    // A redeem script with the wrong hash never gets executed
    let mut tx = unsigned_spend();
    tx.inputs[0].script = p2sh_unlock_script(&[&arithmetic_write(5)], &[OP_6, OP_EQUAL]);
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));
}

#[test]
fn p2sh_wrapped_p2pkh() {
    let key = test_key(3);
    let redeem = p2pkh_lock_script(&key.public_key().hash());
    let lock = p2sh_lock_script(&hash160(&redeem));
    let sig_hash_type = hash_type::ALL | hash_type::FORKID;

    let mut tx = unsigned_spend();
    // The signature covers the redeem script, which is the subscript
    // once it executes
    let digest = tx.signature_hash(0, &redeem, AMOUNT, sig_hash_type, true);
    let signature = key.sign(&digest, sig_hash_type);
    tx.inputs[0].script = p2sh_unlock_script(
        &[&signature, &key.public_key().serialize()],
        &redeem,
    );

    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(true));
}

#[test]
fn p2sh_unlock_must_be_push_only() {
    let redeem = vec![OP_5, OP_EQUAL];
    let lock = p2sh_lock_script(&hash160(&redeem));

    let mut tx = unsigned_spend();
    let mut unlock = vec![OP_5, OP_DUP, OP_DROP];
    write_push_data(&mut unlock, &redeem);
    tx.inputs[0].script = unlock;
    assert!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()).is_err());
}

#[test]
fn bare_multisig_two_of_three() {
    let keys = [test_key(5), test_key(6), test_key(7)];
    let sig_hash_type = hash_type::ALL | hash_type::FORKID;

    let mut lock = vec![OP_2];
    for key in keys.iter() {
        write_push_data(&mut lock, &key.public_key().serialize());
    }
    lock.push(OP_3);
    lock.push(OP_CHECKMULTISIG);

    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, sig_hash_type, true);

    // Keys 5 and 7 sign, in key order
    let mut unlock = vec![OP_0]; // the extra value the protocol bug eats
    write_push_data(&mut unlock, &keys[0].sign(&digest, sig_hash_type));
    write_push_data(&mut unlock, &keys[2].sign(&digest, sig_hash_type));
    tx.inputs[0].script = unlock;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(true));

    // Signatures out of key order fail: keys are never revisited
    let mut tx = unsigned_spend();
    let digest = tx.signature_hash(0, &lock, AMOUNT, sig_hash_type, true);
    let mut unlock = vec![OP_0];
    write_push_data(&mut unlock, &keys[2].sign(&digest, sig_hash_type));
    write_push_data(&mut unlock, &keys[0].sign(&digest, sig_hash_type));
    tx.inputs[0].script = unlock;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &cash_flags()), Ok(false));
}

#[test]
fn check_lock_time_verify() {
    let flags = ScriptFlags {
        enabled_version: 4,
        block_version: 4,
        cash_active: true,
        ..Default::default()
    };

    let mut lock = Vec::new();
    write_push_data(&mut lock, &arithmetic_write(500));
    lock.extend_from_slice(&[OP_CHECKLOCKTIMEVERIFY, OP_DROP, OP_1]);

    // Lock time has passed and the sequence is not final: verified
    let mut tx = unsigned_spend();
    tx.lock_time = 600;
    tx.inputs[0].sequence = 0xffff_fffe;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(true));

    // Lock time not yet reached
    tx.lock_time = 400;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // A final sequence disables the check's protection
    tx.lock_time = 600;
    tx.inputs[0].sequence = 0xffff_ffff;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // Mixing a height value with a time lock is refused
    tx.lock_time = 500_000_001;
    tx.inputs[0].sequence = 0xffff_fffe;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // Below version 4 the opcode is still a NOP
    let nop_flags = ScriptFlags {
        enabled_version: 3,
        block_version: 4,
        cash_active: true,
        ..Default::default()
    };
    tx.lock_time = 400;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &nop_flags), Ok(true));
}

#[test]
fn check_sequence_verify() {
    let flags = ScriptFlags {
        bip112_active: true,
        cash_active: true,
        ..Default::default()
    };

    let mut lock = Vec::new();
    write_push_data(&mut lock, &arithmetic_write(16));
    lock.extend_from_slice(&[OP_CHECKSEQUENCEVERIFY, OP_DROP, OP_1]);

    // Input has aged enough blocks
    let mut tx = unsigned_spend();
    tx.version = 2;
    tx.inputs[0].sequence = 32;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(true));

    // Not aged enough
    tx.inputs[0].sequence = 8;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // Version 1 transactions can't use relative locks
    tx.version = 1;
    tx.inputs[0].sequence = 32;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // Type mismatch: script asks blocks, input is time-based
    tx.version = 2;
    tx.inputs[0].sequence = 32 | 0x0040_0000;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &flags), Ok(false));

    // Inactive deployment leaves it a NOP
    let nop_flags = ScriptFlags {
        cash_active: true,
        ..Default::default()
    };
    tx.version = 1;
    tx.inputs[0].sequence = 8;
    assert_eq!(verify_input(&tx, 0, &lock, AMOUNT, &nop_flags), Ok(true));
}
