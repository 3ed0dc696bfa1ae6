//! The two-stack script machine. One instance validates one input: run
//! the unlock script, then the referenced output's lock script, and for
//! pay-to-script-hash also the revealed redeem script.

use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::Digest;
use sha2::Sha256;

use cerrado_common::double_sha256;
use cerrado_common::hash160;
use cerrado_common::sha256;

use super::num::arithmetic_read;
use super::num::arithmetic_write;
use super::num::is_truthy;
use super::opcodes::*;
use super::parse_output_script;
use super::remove_code_separators;
use super::ScriptError;
use super::ScriptType;
use crate::keys::hash_type;
use crate::keys::PublicKey;
use crate::keys::Signature;
use crate::transaction::Transaction;
use crate::transaction::LOCKTIME_THRESHOLD;
use crate::transaction::SEQUENCE_DISABLE;
use crate::transaction::SEQUENCE_LOCKTIME_MASK;
use crate::transaction::SEQUENCE_TYPE;

/// Most values the main stack may hold.
const MAX_STACK_SIZE: usize = 1000;

/// Deepest allowed conditional nesting.
const MAX_IF_STACK: usize = 20;

/// Most public keys a single CHECKMULTISIG may name.
const MAX_MULTISIG_KEYS: i64 = 20;

/// Everything the interpreter needs to know about the chain context it
/// runs in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptFlags {
    /// Signatures must be strictly DER encoded (BIP-66).
    pub strict_der: bool,
    /// The highest block version the network has activated. Gates
    /// CHECKLOCKTIMEVERIFY below 4.
    pub enabled_version: u32,
    /// Version of the block containing the spending transaction.
    pub block_version: i32,
    /// The cash fork has activated: FORKID signatures are mandatory.
    pub cash_active: bool,
    /// BIP-112 reached ACTIVE: CHECKSEQUENCEVERIFY enforced.
    pub bip112_active: bool,
}

pub struct Interpreter<'a> {
    stack: Vec<Vec<u8>>,
    alt_stack: Vec<Vec<u8>>,
    if_stack: Vec<bool>,
    verified: bool,
    transaction: Option<&'a Transaction>,
    input_index: usize,
    input_sequence: u32,
    output_amount: i64,
}

impl<'a> Default for Interpreter<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Interpreter<'a> {
    pub fn new() -> Self {
        Interpreter {
            stack: Vec::new(),
            alt_stack: Vec::new(),
            if_stack: Vec::new(),
            verified: true,
            transaction: None,
            input_index: 0,
            input_sequence: 0xffff_ffff,
            output_amount: 0,
        }
    }

    /// Attach the spending transaction so signature and lock-time
    /// opcodes have their context.
    pub fn set_transaction(&mut self, tx: &'a Transaction, input_index: usize, amount: i64) {
        self.input_sequence = tx.inputs[input_index].sequence;
        self.transaction = Some(tx);
        self.input_index = input_index;
        self.output_amount = amount;
    }

    /// The run completed without anything marking it unverified, and the
    /// top of the stack is a true value.
    pub fn is_verified(&self) -> bool {
        self.verified && self.stack.last().map(|top| is_truthy(top)).unwrap_or(false)
    }

    pub fn stack(&self) -> &[Vec<u8>] {
        &self.stack
    }

    pub fn pop_value(&mut self) -> Option<Vec<u8>> {
        self.stack.pop()
    }

    fn executing(&self) -> bool {
        self.if_stack.iter().all(|branch| *branch)
    }

    fn push(&mut self, value: Vec<u8>) {
        self.stack.push(value);
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(if value { vec![1] } else { Vec::new() });
    }

    fn pop(&mut self, opcode: u8) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::StackUnderflow(opcode))
    }

    fn pop_number(&mut self, opcode: u8) -> Result<i64, ScriptError> {
        let value = self.pop(opcode)?;
        arithmetic_read(&value)
    }

    fn need(&self, depth: usize, opcode: u8) -> Result<(), ScriptError> {
        if self.stack.len() < depth {
            return Err(ScriptError::StackUnderflow(opcode));
        }
        Ok(())
    }

    /// Run one script. `Err` means the input is invalid outright; an
    /// `Ok` return with `verified` cleared means the scripts ran but the
    /// spend does not verify.
    pub fn execute(&mut self, script: &[u8], flags: &ScriptFlags) -> Result<(), ScriptError> {
        if !self.verified {
            // A previous script in this run already failed to verify
            return Ok(());
        }

        let mut cursor = 0usize;
        // Where the subscript covered by signatures begins
        let mut sig_start = 0usize;

        while cursor < script.len() {
            if self.stack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackOverflow);
            }
            if self.if_stack.len() > MAX_IF_STACK {
                return Err(ScriptError::IfStackOverflow);
            }

            let opcode = script[cursor];
            cursor += 1;

            // Push opcodes; their lengths advance the cursor even inside
            // an unexecuted branch
            if opcode == OP_0 {
                if self.executing() {
                    self.push(Vec::new());
                }
                continue;
            }
            if (1..=MAX_SINGLE_BYTE_PUSH).contains(&opcode) {
                let len = opcode as usize;
                if len > script.len() - cursor {
                    return Err(ScriptError::PushPastEnd);
                }
                if self.executing() {
                    self.push(script[cursor..cursor + len].to_vec());
                }
                cursor += len;
                continue;
            }
            if opcode == OP_PUSHDATA1 || opcode == OP_PUSHDATA2 || opcode == OP_PUSHDATA4 {
                let prefix = match opcode {
                    OP_PUSHDATA1 => 1,
                    OP_PUSHDATA2 => 2,
                    _ => 4,
                };
                if prefix > script.len() - cursor {
                    return Err(ScriptError::PushPastEnd);
                }
                let mut len = 0usize;
                for (i, byte) in script[cursor..cursor + prefix].iter().enumerate() {
                    len |= (*byte as usize) << (8 * i);
                }
                cursor += prefix;
                if len > script.len() - cursor {
                    return Err(ScriptError::PushPastEnd);
                }
                if self.executing() {
                    self.push(script[cursor..cursor + len].to_vec());
                }
                cursor += len;
                continue;
            }

            // Conditionals run even when the branch is off; everything
            // else is skipped
            match opcode {
                OP_IF => {
                    if self.executing() {
                        let top = self.pop(opcode)?;
                        self.if_stack.push(is_truthy(&top));
                    } else {
                        self.if_stack.push(true);
                    }
                    continue;
                }
                OP_NOTIF => {
                    if self.executing() {
                        let top = self.pop(opcode)?;
                        self.if_stack.push(!is_truthy(&top));
                    } else {
                        self.if_stack.push(true);
                    }
                    continue;
                }
                OP_ELSE => {
                    let branch = self
                        .if_stack
                        .last_mut()
                        .ok_or(ScriptError::ElseWithoutIf)?;
                    *branch = !*branch;
                    continue;
                }
                OP_ENDIF => {
                    self.if_stack.pop().ok_or(ScriptError::EndIfWithoutIf)?;
                    continue;
                }
                _ => {}
            }

            if !self.executing() {
                // Reserved opcodes are tolerated inside a dead branch
                continue;
            }

            if is_disabled(opcode) {
                return Err(ScriptError::DisabledOpcode(opcode));
            }
            if is_reserved(opcode) {
                return Err(ScriptError::ReservedOpcode(opcode));
            }

            match opcode {
                OP_NOP | OP_NOP1 | OP_NOP4 | OP_NOP5 | OP_NOP6 | OP_NOP7 | OP_NOP8 | OP_NOP9
                | OP_NOP10 => {}

                OP_1NEGATE => self.push(arithmetic_write(-1)),
                OP_1..=OP_16 => self.push(vec![opcode - OP_1 + 1]),

                OP_VERIFY => {
                    self.need(1, opcode)?;
                    if is_truthy(self.stack.last().expect("checked")) {
                        self.stack.pop();
                    } else {
                        self.verified = false;
                        return Ok(());
                    }
                }
                OP_RETURN => {
                    self.verified = false;
                    return Ok(());
                }

                OP_TOALTSTACK => {
                    let top = self.pop(opcode)?;
                    self.alt_stack.push(top);
                }
                OP_FROMALTSTACK => {
                    let top = self
                        .alt_stack
                        .pop()
                        .ok_or(ScriptError::StackUnderflow(opcode))?;
                    self.push(top);
                }
                OP_2DROP => {
                    self.need(2, opcode)?;
                    self.stack.pop();
                    self.stack.pop();
                }
                OP_2DUP => {
                    self.need(2, opcode)?;
                    let len = self.stack.len();
                    let a = self.stack[len - 2].clone();
                    let b = self.stack[len - 1].clone();
                    self.push(a);
                    self.push(b);
                }
                OP_3DUP => {
                    self.need(3, opcode)?;
                    let len = self.stack.len();
                    for i in 0..3 {
                        let value = self.stack[len - 3 + i].clone();
                        self.push(value);
                    }
                }
                OP_2OVER => {
                    self.need(4, opcode)?;
                    let len = self.stack.len();
                    let a = self.stack[len - 4].clone();
                    let b = self.stack[len - 3].clone();
                    self.push(a);
                    self.push(b);
                }
                OP_2ROT => {
                    self.need(6, opcode)?;
                    let len = self.stack.len();
                    let a = self.stack.remove(len - 6);
                    let b = self.stack.remove(len - 6);
                    self.push(a);
                    self.push(b);
                }
                OP_2SWAP => {
                    self.need(4, opcode)?;
                    let len = self.stack.len();
                    self.stack.swap(len - 4, len - 2);
                    self.stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    self.need(1, opcode)?;
                    let top = self.stack.last().expect("checked").clone();
                    if is_truthy(&top) {
                        self.push(top);
                    }
                }
                OP_DEPTH => {
                    let depth = self.stack.len() as i64;
                    self.push(arithmetic_write(depth));
                }
                OP_DROP => {
                    self.pop(opcode)?;
                }
                OP_DUP => {
                    self.need(1, opcode)?;
                    let top = self.stack.last().expect("checked").clone();
                    self.push(top);
                }
                OP_NIP => {
                    self.need(2, opcode)?;
                    let len = self.stack.len();
                    self.stack.remove(len - 2);
                }
                OP_OVER => {
                    self.need(2, opcode)?;
                    let value = self.stack[self.stack.len() - 2].clone();
                    self.push(value);
                }
                OP_PICK | OP_ROLL => {
                    let index = self.pop_number(opcode)?;
                    if index < 0 || index as usize >= self.stack.len() {
                        return Err(ScriptError::BadStackIndex(index));
                    }
                    let position = self.stack.len() - 1 - index as usize;
                    let value = if opcode == OP_ROLL {
                        self.stack.remove(position)
                    } else {
                        self.stack[position].clone()
                    };
                    self.push(value);
                }
                OP_ROT => {
                    self.need(3, opcode)?;
                    let len = self.stack.len();
                    let value = self.stack.remove(len - 3);
                    self.push(value);
                }
                OP_SWAP => {
                    self.need(2, opcode)?;
                    let len = self.stack.len();
                    self.stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    self.need(2, opcode)?;
                    let top = self.stack.last().expect("checked").clone();
                    let len = self.stack.len();
                    self.stack.insert(len - 2, top);
                }
                OP_SIZE => {
                    self.need(1, opcode)?;
                    let size = self.stack.last().expect("checked").len() as i64;
                    self.push(arithmetic_write(size));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = self.pop(opcode)?;
                    let a = self.pop(opcode)?;
                    let matching = a == b;
                    if opcode == OP_EQUAL {
                        self.push_bool(matching);
                    } else if !matching {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let value = self.pop_number(opcode)?;
                    let result = match opcode {
                        OP_1ADD => value + 1,
                        OP_1SUB => value - 1,
                        OP_NEGATE => -value,
                        OP_ABS => value.abs(),
                        OP_NOT => (value == 0) as i64,
                        _ => (value != 0) as i64,
                    };
                    self.push(arithmetic_write(result));
                }

                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMNOTEQUAL
                | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL
                | OP_MIN | OP_MAX => {
                    let b = self.pop_number(opcode)?;
                    let a = self.pop_number(opcode)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    self.push(arithmetic_write(result));
                }
                OP_NUMEQUALVERIFY => {
                    let b = self.pop_number(opcode)?;
                    let a = self.pop_number(opcode)?;
                    if a != b {
                        self.verified = false;
                        return Ok(());
                    }
                }
                OP_WITHIN => {
                    let max = self.pop_number(opcode)?;
                    let min = self.pop_number(opcode)?;
                    let x = self.pop_number(opcode)?;
                    self.push_bool(min <= x && x < max);
                }

                OP_RIPEMD160 => {
                    let top = self.pop(opcode)?;
                    let digest = Ripemd160::new().chain_update(&top).finalize();
                    self.push(digest.to_vec());
                }
                OP_SHA1 => {
                    let top = self.pop(opcode)?;
                    let digest = Sha1::new().chain_update(&top).finalize();
                    self.push(digest.to_vec());
                }
                OP_SHA256 => {
                    let top = self.pop(opcode)?;
                    self.push(sha256(&top).as_bytes().to_vec());
                }
                OP_HASH160 => {
                    let top = self.pop(opcode)?;
                    self.push(hash160(&top).as_bytes().to_vec());
                }
                OP_HASH256 => {
                    let top = self.pop(opcode)?;
                    self.push(double_sha256(&top).as_bytes().to_vec());
                }

                OP_CODESEPARATOR => {
                    sig_start = cursor;
                }

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let key = self.pop(opcode)?;
                    let signature = self.pop(opcode)?;
                    let good = self.check_signature(&signature, &key, script, sig_start, flags);
                    if opcode == OP_CHECKSIG {
                        self.push_bool(good);
                    } else if !good {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let key_count = self.pop_number(opcode)?;
                    if !(0..=MAX_MULTISIG_KEYS).contains(&key_count) {
                        return Err(ScriptError::BadMultisigCount(key_count));
                    }
                    self.need(key_count as usize, opcode)?;
                    let mut keys = Vec::with_capacity(key_count as usize);
                    for _ in 0..key_count {
                        keys.push(self.pop(opcode)?);
                    }

                    let sig_count = self.pop_number(opcode)?;
                    if !(0..=key_count).contains(&sig_count) {
                        return Err(ScriptError::BadMultisigCount(sig_count));
                    }
                    let mut signatures = Vec::with_capacity(sig_count as usize);
                    for _ in 0..sig_count {
                        signatures.push(self.pop(opcode)?);
                    }

                    // The original protocol bug: one extra value is
                    // consumed from the stack
                    self.pop(opcode)?;

                    // Each signature must match a key; keys are tried in
                    // order and never revisited
                    let mut key_offset = 0usize;
                    let mut all_verified = true;
                    for signature in signatures.iter() {
                        let mut this_verified = false;
                        while key_offset < keys.len() {
                            let key = &keys[key_offset];
                            key_offset += 1;
                            if self.check_signature(signature, key, script, sig_start, flags) {
                                this_verified = true;
                                break;
                            }
                        }
                        if !this_verified {
                            all_verified = false;
                            break;
                        }
                    }

                    if opcode == OP_CHECKMULTISIG {
                        self.push_bool(all_verified);
                    } else if !all_verified {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKLOCKTIMEVERIFY => {
                    if flags.block_version < 4 || flags.enabled_version < 4 {
                        // Still a NOP before BIP-65
                        continue;
                    }
                    self.need(1, opcode)?;
                    let value = arithmetic_read(self.stack.last().expect("checked"))?;
                    if value < 0 {
                        return Err(ScriptError::NegativeLockTime);
                    }
                    let Some(tx) = self.transaction else {
                        self.verified = false;
                        return Ok(());
                    };
                    if self.input_sequence == 0xffff_ffff {
                        self.verified = false;
                        return Ok(());
                    }
                    // Both values must be the same kind: height or time
                    let value_is_height = (value as u64) < LOCKTIME_THRESHOLD as u64;
                    let lock_is_height = tx.lock_time < LOCKTIME_THRESHOLD;
                    if value_is_height != lock_is_height || value as u64 > tx.lock_time as u64 {
                        self.verified = false;
                        return Ok(());
                    }
                }

                OP_CHECKSEQUENCEVERIFY => {
                    if !flags.bip112_active {
                        continue;
                    }
                    self.need(1, opcode)?;
                    let value = arithmetic_read(self.stack.last().expect("checked"))?;
                    if value < 0 {
                        return Err(ScriptError::NegativeSequence);
                    }
                    if value & SEQUENCE_DISABLE as i64 == 0 {
                        let Some(tx) = self.transaction else {
                            self.verified = false;
                            return Ok(());
                        };
                        let sequence = self.input_sequence;
                        if tx.version < 2
                            || sequence & SEQUENCE_DISABLE != 0
                            || (value & SEQUENCE_TYPE as i64) as u32
                                != sequence & SEQUENCE_TYPE
                            || (value & SEQUENCE_LOCKTIME_MASK as i64) as u32
                                > sequence & SEQUENCE_LOCKTIME_MASK
                        {
                            self.verified = false;
                            return Ok(());
                        }
                    }
                }

                other => return Err(ScriptError::UndefinedOpcode(other)),
            }
        }

        if !self.if_stack.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn check_signature(
        &self,
        signature: &[u8],
        key: &[u8],
        script: &[u8],
        sig_start: usize,
        flags: &ScriptFlags,
    ) -> bool {
        let Some(tx) = self.transaction else {
            return false;
        };
        let Ok(signature) = Signature::from_stack_item(signature, flags.strict_der) else {
            return false;
        };

        let uses_forkid = signature.hash_type() & hash_type::FORKID != 0;
        if flags.cash_active != uses_forkid {
            // FORKID is mandatory after the fork and forbidden before
            return false;
        }

        let subscript = remove_code_separators(&script[sig_start..]);
        let digest = tx.signature_hash(
            self.input_index,
            &subscript,
            self.output_amount,
            signature.hash_type(),
            uses_forkid,
        );

        let Ok(key) = PublicKey::from_bytes(key) else {
            return false;
        };
        signature.verify(&key, &digest)
    }
}

/// Validate one input of `tx` against the lock script of the output it
/// spends. `Ok(true)` means the spend verifies; `Ok(false)` means the
/// scripts ran but did not verify; `Err` means the scripts are invalid.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    lock_script: &[u8],
    amount: i64,
    flags: &ScriptFlags,
) -> Result<bool, ScriptError> {
    let unlock_script = &tx.inputs[input_index].script;

    let mut interpreter = Interpreter::new();
    interpreter.set_transaction(tx, input_index, amount);
    interpreter.execute(unlock_script, flags)?;

    // For P2SH the unlock script must be pushes only; remember the
    // redeem script it revealed before the lock script consumes it
    let redeem_script = match parse_output_script(lock_script) {
        ScriptType::P2SH { .. } => {
            if !super::is_push_only(unlock_script) {
                return Err(ScriptError::UnlockNotPushOnly);
            }
            interpreter.stack().last().cloned()
        }
        _ => None,
    };

    interpreter.execute(lock_script, flags)?;

    if let Some(redeem_script) = redeem_script {
        if !interpreter.is_verified() {
            return Ok(false);
        }
        // Drop the equality result and run the revealed script
        interpreter.pop_value();
        interpreter.execute(&redeem_script, flags)?;
    }

    Ok(interpreter.is_verified())
}
