//! Bitcoin Script: parsing helpers, standard output templates and the
//! two-stack interpreter that validates every spending input.

pub mod interpreter;
pub mod num;
pub mod opcodes;

use core::fmt;

use cerrado_common::Hash160;

pub use interpreter::Interpreter;
pub use interpreter::ScriptFlags;

use opcodes::*;

/// Things that terminate script execution as `Invalid` (as opposed to
/// merely unverified).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Push length runs past the end of the script.
    PushPastEnd,
    StackUnderflow(u8),
    /// Main stack grew past 1000 values.
    StackOverflow,
    /// More than 20 nested conditionals.
    IfStackOverflow,
    ElseWithoutIf,
    EndIfWithoutIf,
    /// An unexecuted OP_IF branch was never closed.
    UnbalancedConditional,
    DisabledOpcode(u8),
    ReservedOpcode(u8),
    UndefinedOpcode(u8),
    NumberTooLong(usize),
    NegativeLockTime,
    NegativeSequence,
    /// OP_PICK/OP_ROLL index outside the stack.
    BadStackIndex(i64),
    /// Multisig key or signature count outside 0..=20.
    BadMultisigCount(i64),
    /// P2SH spend whose unlock script isn't push-only.
    UnlockNotPushOnly,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::PushPastEnd => write!(f, "push data size more than remaining script"),
            ScriptError::StackUnderflow(op) => {
                write!(f, "stack not large enough for opcode {op:02x}")
            }
            ScriptError::StackOverflow => write!(f, "stack overflow"),
            ScriptError::IfStackOverflow => write!(f, "if stack overflow"),
            ScriptError::ElseWithoutIf => write!(f, "no if before else"),
            ScriptError::EndIfWithoutIf => write!(f, "no if before endif"),
            ScriptError::UnbalancedConditional => write!(f, "unbalanced conditional"),
            ScriptError::DisabledOpcode(op) => write!(f, "disabled opcode {op:02x}"),
            ScriptError::ReservedOpcode(op) => write!(f, "reserved opcode {op:02x}"),
            ScriptError::UndefinedOpcode(op) => write!(f, "undefined opcode {op:02x}"),
            ScriptError::NumberTooLong(len) => {
                write!(f, "arithmetic read of {len} bytes")
            }
            ScriptError::NegativeLockTime => write!(f, "negative lock time value"),
            ScriptError::NegativeSequence => write!(f, "negative sequence value"),
            ScriptError::BadStackIndex(index) => write!(f, "stack index {index} out of range"),
            ScriptError::BadMultisigCount(count) => {
                write!(f, "multisig count {count} out of range")
            }
            ScriptError::UnlockNotPushOnly => {
                write!(f, "pay-to-script-hash unlock script isn't push only")
            }
        }
    }
}

/// Classification of an output's locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptType {
    /// Pay to public key hash.
    P2PKH { hash: Hash160 },
    /// Pay to script hash.
    P2SH { hash: Hash160 },
    /// Pay directly to a public key.
    P2PK { public_key: Vec<u8> },
    /// Bare multisig, m required of n provided.
    MultiSig { required: u8, total: u8 },
    /// Provably unspendable data carrier.
    NullData,
    NonStandard,
}

/// One parsed element of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Push(Vec<u8>),
    Opcode(u8),
}

/// Iterate over a script's elements, decoding push lengths. Stops by
/// returning `None`; a push running past the end yields `Err`.
pub struct ElementIter<'a> {
    script: &'a [u8],
    cursor: usize,
}

impl<'a> ElementIter<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        ElementIter { script, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        if len > self.script.len() - self.cursor {
            return Err(ScriptError::PushPastEnd);
        }
        let data = &self.script[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(data)
    }
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<Element, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.cursor];
        self.cursor += 1;

        let result = match opcode {
            OP_0 => Ok(Element::Push(Vec::new())),
            1..=MAX_SINGLE_BYTE_PUSH => {
                self.take(opcode as usize).map(|d| Element::Push(d.to_vec()))
            }
            OP_PUSHDATA1 => self
                .take(1)
                .map(|len| len[0] as usize)
                .and_then(|len| self.take(len))
                .map(|d| Element::Push(d.to_vec())),
            OP_PUSHDATA2 => self
                .take(2)
                .map(|len| u16::from_le_bytes([len[0], len[1]]) as usize)
                .and_then(|len| self.take(len))
                .map(|d| Element::Push(d.to_vec())),
            OP_PUSHDATA4 => self
                .take(4)
                .map(|len| u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize)
                .and_then(|len| self.take(len))
                .map(|d| Element::Push(d.to_vec())),
            opcode => Ok(Element::Opcode(opcode)),
        };
        Some(result)
    }
}

pub fn is_small_integer(opcode: u8) -> bool {
    opcode == OP_0 || (OP_1..=OP_16).contains(&opcode)
}

pub fn small_integer_value(opcode: u8) -> u8 {
    if opcode == OP_0 {
        0
    } else {
        opcode - OP_1 + 1
    }
}

/// True when the script contains only pushes (including OP_0 and the
/// small integer opcodes).
pub fn is_push_only(script: &[u8]) -> bool {
    for element in ElementIter::new(script) {
        match element {
            Ok(Element::Push(_)) => continue,
            Ok(Element::Opcode(op)) if is_small_integer(op) || op == OP_1NEGATE => continue,
            _ => return false,
        }
    }
    true
}

/// Append a push of `data` using the shortest encoding.
pub fn write_push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len == 0 {
        script.push(OP_0);
        return;
    }
    if len <= MAX_SINGLE_BYTE_PUSH as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// The subscript signatures cover: everything from the most recent
/// OP_CODESEPARATOR on, with any remaining separator bytes removed.
pub fn remove_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut iter = ElementIter::new(script);
    let mut emitted = 0;
    loop {
        let before = iter.cursor;
        match iter.next() {
            Some(Ok(Element::Opcode(OP_CODESEPARATOR))) => {
                out.extend_from_slice(&script[emitted..before]);
                emitted = iter.cursor;
            }
            Some(Ok(_)) => {}
            // Malformed tails are copied through untouched
            Some(Err(_)) | None => break,
        }
    }
    out.extend_from_slice(&script[emitted..]);
    out
}

/// Classify a locking script into the standard templates.
pub fn parse_output_script(script: &[u8]) -> ScriptType {
    let mut elements = Vec::new();
    for element in ElementIter::new(script) {
        match element {
            Ok(element) => elements.push(element),
            Err(_) => return ScriptType::NonStandard,
        }
    }

    match elements.as_slice() {
        [Element::Opcode(OP_RETURN), rest @ ..] => {
            if rest.iter().all(|e| matches!(e, Element::Push(_))) {
                ScriptType::NullData
            } else {
                ScriptType::NonStandard
            }
        }
        [Element::Opcode(OP_DUP), Element::Opcode(OP_HASH160), Element::Push(hash), Element::Opcode(OP_EQUALVERIFY), Element::Opcode(OP_CHECKSIG)] => {
            match Hash160::from_slice(hash) {
                Some(hash) => ScriptType::P2PKH { hash },
                None => ScriptType::NonStandard,
            }
        }
        [Element::Opcode(OP_HASH160), Element::Push(hash), Element::Opcode(OP_EQUAL)] => {
            match Hash160::from_slice(hash) {
                Some(hash) => ScriptType::P2SH { hash },
                None => ScriptType::NonStandard,
            }
        }
        [Element::Push(key), Element::Opcode(OP_CHECKSIG)]
            if (33..=65).contains(&key.len()) =>
        {
            ScriptType::P2PK {
                public_key: key.clone(),
            }
        }
        [Element::Opcode(m), middle @ .., Element::Opcode(n), Element::Opcode(OP_CHECKMULTISIG)]
            if is_small_integer(*m) && is_small_integer(*n) =>
        {
            let required = small_integer_value(*m);
            let total = small_integer_value(*n);
            let keys_ok = middle
                .iter()
                .all(|e| matches!(e, Element::Push(key) if (33..=65).contains(&key.len())));
            if required == 0
                || total == 0
                || required > total
                || middle.len() != total as usize
                || !keys_ok
            {
                return ScriptType::NonStandard;
            }
            ScriptType::MultiSig { required, total }
        }
        _ => ScriptType::NonStandard,
    }
}

/// Lock script paying the given public key hash.
pub fn p2pkh_lock_script(hash: &Hash160) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    write_push_data(&mut script, hash.as_bytes());
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Lock script paying the hash of a redeem script.
pub fn p2sh_lock_script(hash: &Hash160) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    write_push_data(&mut script, hash.as_bytes());
    script.push(OP_EQUAL);
    script
}

/// Unlock script for a P2PKH output: a signature push then the key push.
pub fn p2pkh_unlock_script(signature: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(signature.len() + public_key.len() + 2);
    write_push_data(&mut script, signature);
    write_push_data(&mut script, public_key);
    script
}

/// Unlock script for a P2SH output: pushes of the redeem script's inputs
/// followed by the serialized redeem script itself.
pub fn p2sh_unlock_script(pushes: &[&[u8]], redeem_script: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    for push in pushes {
        write_push_data(&mut script, push);
    }
    write_push_data(&mut script, redeem_script);
    script
}
