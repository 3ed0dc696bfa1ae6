//! Transactions: wire codec, txid computation, signature preimages and
//! validation against the UTXO set.

use std::io::Read;
use std::io::Write;

use cerrado_common::double_sha256;
use cerrado_common::Hash256;
use log::warn;

use crate::error::BlockValidationError;
use crate::error::WireError;
use crate::forks::Forks;
use crate::keys::hash_type;
use crate::script;
use crate::script::interpreter::verify_input;
use crate::script::num::arithmetic_read;
use crate::script::Element;
use crate::script::ElementIter;
use crate::script::ScriptFlags;
use crate::utxoset::UtxoEntry;
use crate::utxoset::UtxoSet;
use crate::wire::*;

/// Lock-time values below this are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence bit that disables relative lock-time for an input.
pub const SEQUENCE_DISABLE: u32 = 1 << 31;
/// Sequence bit selecting time-based (set) or height-based (clear) locks.
pub const SEQUENCE_TYPE: u32 = 1 << 22;
/// Low bits holding the relative lock-time value.
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0xffff;

/// Outpoint index marking a coinbase input.
pub const COINBASE_INDEX: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub outpoint: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: i64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Writable for OutPoint {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.txid.write(writer)?;
        writer.write_all(&self.index.to_le_bytes())
    }
}

impl Readable for OutPoint {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        Ok(OutPoint {
            txid: Hash256::read(reader)?,
            index: read_u32(reader)?,
        })
    }
}

impl Writable for TxInput {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.outpoint.write(writer)?;
        write_var_bytes(writer, &self.script)?;
        writer.write_all(&self.sequence.to_le_bytes())
    }
}

impl Readable for TxInput {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        Ok(TxInput {
            outpoint: OutPoint::read(reader)?,
            script: read_var_bytes(reader)?,
            sequence: read_u32(reader)?,
        })
    }
}

impl Writable for TxOutput {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.amount.to_le_bytes())?;
        write_var_bytes(writer, &self.script)
    }
}

impl Readable for TxOutput {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        Ok(TxOutput {
            amount: read_i64(reader)?,
            script: read_var_bytes(reader)?,
        })
    }
}

impl Writable for Transaction {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.version.to_le_bytes())?;
        write_compact_int(writer, self.inputs.len() as u64)?;
        for input in self.inputs.iter() {
            input.write(writer)?;
        }
        write_compact_int(writer, self.outputs.len() as u64)?;
        for output in self.outputs.iter() {
            output.write(writer)?;
        }
        writer.write_all(&self.lock_time.to_le_bytes())
    }
}

impl Readable for Transaction {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let version = read_u32(reader)?;
        let input_count = read_compact_int(reader)?;
        if input_count > MAX_ALLOCATION {
            return Err(WireError::OversizedAllocation(input_count));
        }
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::read(reader)?);
        }
        let output_count = read_compact_int(reader)?;
        if output_count > MAX_ALLOCATION {
            return Err(WireError::OversizedAllocation(output_count));
        }
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::read(reader)?);
        }
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time: read_u32(reader)?,
        })
    }
}

impl OutPoint {
    /// The null outpoint only coinbase inputs carry.
    pub fn coinbase() -> Self {
        OutPoint {
            txid: Hash256::ZERO,
            index: COINBASE_INDEX,
        }
    }
}

impl Transaction {
    /// Double-SHA-256 of the canonical serialization.
    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].outpoint.index == COINBASE_INDEX
    }

    /// The height a BIP-34 coinbase pushes as its first script element.
    pub fn coinbase_height(&self) -> Option<u32> {
        let input = self.inputs.first()?;
        match ElementIter::new(&input.script).next()? {
            Ok(Element::Push(bytes)) => {
                let height = arithmetic_read(&bytes).ok()?;
                u32::try_from(height).ok()
            }
            Ok(Element::Opcode(op)) if script::is_small_integer(op) => {
                Some(script::small_integer_value(op) as u32)
            }
            _ => None,
        }
    }

    /// Build the byte string signatures cover for one input. `forkid`
    /// selects the post-fork format that commits to the spent amount.
    pub fn signature_preimage(
        &self,
        input_index: usize,
        subscript: &[u8],
        amount: i64,
        sig_hash_type: u8,
    ) -> Vec<u8> {
        if sig_hash_type & hash_type::FORKID != 0 {
            self.forkid_preimage(input_index, subscript, amount, sig_hash_type)
        } else {
            self.legacy_preimage(input_index, subscript, sig_hash_type)
        }
    }

    /// The digest ECDSA signatures actually cover.
    pub fn signature_hash(
        &self,
        input_index: usize,
        subscript: &[u8],
        amount: i64,
        sig_hash_type: u8,
        forkid: bool,
    ) -> Hash256 {
        let preimage = if forkid {
            self.forkid_preimage(input_index, subscript, amount, sig_hash_type)
        } else {
            self.legacy_preimage(input_index, subscript, sig_hash_type)
        };
        double_sha256(&preimage)
    }

    /// Pre-fork preimage: the transaction re-serialized with scripts and
    /// sequences doctored per the hash type, plus the type itself.
    fn legacy_preimage(&self, input_index: usize, subscript: &[u8], sig_hash_type: u8) -> Vec<u8> {
        let anyone_can_pay = sig_hash_type & hash_type::ANYONECANPAY != 0;
        let base = hash_type::base(sig_hash_type);

        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());

        // Inputs: all of them, or just ours with ANYONECANPAY
        let input_count = if anyone_can_pay { 1 } else { self.inputs.len() };
        write_compact_int(&mut out, input_count as u64).expect("vec write");
        for (i, input) in self.inputs.iter().enumerate() {
            if anyone_can_pay && i != input_index {
                continue;
            }
            input.outpoint.write(&mut out).expect("vec write");
            if i == input_index {
                write_var_bytes(&mut out, subscript).expect("vec write");
                out.extend_from_slice(&input.sequence.to_le_bytes());
            } else {
                write_compact_int(&mut out, 0).expect("vec write");
                // NONE and SINGLE zero the other inputs' sequences
                let sequence = if base == hash_type::ALL { input.sequence } else { 0 };
                out.extend_from_slice(&sequence.to_le_bytes());
            }
        }

        // Outputs per the base type
        match base {
            hash_type::NONE => {
                write_compact_int(&mut out, 0).expect("vec write");
            }
            hash_type::SINGLE => {
                // Only the output at our index; earlier ones are blanked
                // to (-1, empty), missing ones to (0, empty)
                write_compact_int(&mut out, input_index as u64 + 1).expect("vec write");
                for i in 0..=input_index {
                    match self.outputs.get(i) {
                        Some(output) if i == input_index => {
                            output.write(&mut out).expect("vec write");
                        }
                        Some(_) => {
                            out.extend_from_slice(&(-1i64).to_le_bytes());
                            write_compact_int(&mut out, 0).expect("vec write");
                        }
                        None => {
                            out.extend_from_slice(&0i64.to_le_bytes());
                            write_compact_int(&mut out, 0).expect("vec write");
                        }
                    }
                }
            }
            _ => {
                write_compact_int(&mut out, self.outputs.len() as u64).expect("vec write");
                for output in self.outputs.iter() {
                    output.write(&mut out).expect("vec write");
                }
            }
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out.extend_from_slice(&(sig_hash_type as u32).to_le_bytes());
        out
    }

    /// Post-fork preimage: fixed-layout digest commitments over
    /// prevouts, sequences and outputs, plus the amount being spent.
    fn forkid_preimage(
        &self,
        input_index: usize,
        subscript: &[u8],
        amount: i64,
        sig_hash_type: u8,
    ) -> Vec<u8> {
        let anyone_can_pay = sig_hash_type & hash_type::ANYONECANPAY != 0;
        let base = hash_type::base(sig_hash_type);
        let input = &self.inputs[input_index];

        let hash_prevouts = if anyone_can_pay {
            Hash256::ZERO
        } else {
            let mut buf = Vec::new();
            for input in self.inputs.iter() {
                input.outpoint.write(&mut buf).expect("vec write");
            }
            double_sha256(&buf)
        };

        let hash_sequence = if anyone_can_pay || base != hash_type::ALL {
            Hash256::ZERO
        } else {
            let mut buf = Vec::new();
            for input in self.inputs.iter() {
                buf.extend_from_slice(&input.sequence.to_le_bytes());
            }
            double_sha256(&buf)
        };

        let hash_outputs = match base {
            hash_type::SINGLE => match self.outputs.get(input_index) {
                Some(output) => double_sha256(&output.serialize()),
                None => Hash256::ZERO,
            },
            hash_type::NONE => Hash256::ZERO,
            _ => {
                let mut buf = Vec::new();
                for output in self.outputs.iter() {
                    output.write(&mut buf).expect("vec write");
                }
                double_sha256(&buf)
            }
        };

        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        hash_prevouts.write(&mut out).expect("vec write");
        hash_sequence.write(&mut out).expect("vec write");
        input.outpoint.write(&mut out).expect("vec write");
        write_var_bytes(&mut out, subscript).expect("vec write");
        out.extend_from_slice(&amount.to_le_bytes());
        out.extend_from_slice(&input.sequence.to_le_bytes());
        hash_outputs.write(&mut out).expect("vec write");
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out.extend_from_slice(&(sig_hash_type as u32).to_le_bytes());
        out
    }

    /// Validate this transaction against the UTXO set and apply its
    /// effects tentatively. Returns the fee (zero for a coinbase). On
    /// error the caller must revert the set's tentative changes.
    pub fn process(
        &self,
        utxos: &UtxoSet,
        height: u32,
        coinbase: bool,
        block_version: i32,
        forks: &Forks,
        allow_duplicate_outputs: bool,
    ) -> Result<i64, BlockValidationError> {
        let txid = self.txid();
        let mut input_total: i64 = 0;

        if coinbase {
            for input in self.inputs.iter() {
                if input.outpoint.index != COINBASE_INDEX {
                    return Err(BlockValidationError::BadCoinbaseInput { txid });
                }
            }
            if forks.bip34_active() && self.coinbase_height() != Some(height) {
                warn!("coinbase {txid} doesn't commit to height {height}");
                return Err(BlockValidationError::BadCoinbaseHeight {
                    txid,
                    expected: height,
                });
            }
        } else {
            let flags = ScriptFlags {
                strict_der: block_version >= 3 && forks.enabled_version() >= 3,
                enabled_version: forks.enabled_version(),
                block_version,
                cash_active: forks.cash_active(),
                bip112_active: forks.bip112_active(),
            };

            for (index, input) in self.inputs.iter().enumerate() {
                let Some(entry) =
                    utxos.find_unspent(&input.outpoint.txid, input.outpoint.index)
                else {
                    return Err(BlockValidationError::UnknownOutpoint {
                        txid,
                        index: input.outpoint.index,
                    });
                };
                utxos.spend(&input.outpoint.txid, input.outpoint.index, height);

                match verify_input(self, index, &entry.script, entry.amount, &flags) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(BlockValidationError::ScriptNotVerified {
                            txid,
                            input: index as u32,
                        })
                    }
                    Err(error) => {
                        return Err(BlockValidationError::ScriptFailed {
                            txid,
                            input: index as u32,
                            error,
                        })
                    }
                }

                input_total += entry.amount;
            }
        }

        let mut output_total: i64 = 0;
        for (index, output) in self.outputs.iter().enumerate() {
            if output.amount < 0 {
                return Err(BlockValidationError::NegativeOutput { txid });
            }
            output_total += output.amount;
            if !coinbase && output_total > input_total {
                return Err(BlockValidationError::NotEnoughFunds { txid });
            }
            let added = utxos.add(
                UtxoEntry {
                    txid,
                    index: index as u32,
                    amount: output.amount,
                    script: output.script.clone(),
                    height,
                },
                allow_duplicate_outputs,
            );
            if !added {
                return Err(BlockValidationError::DuplicateOutput {
                    txid,
                    index: index as u32,
                });
            }
        }

        if coinbase {
            return Ok(0);
        }
        Ok(input_total - output_total)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::script::p2pkh_lock_script;
    use crate::script::p2pkh_unlock_script;
    use crate::keys::PrivateKey;

    fn test_key() -> PrivateKey {
        let bytes =
            hex::decode("d68e0869df44615cc57f196208a896653e969f69960c6435f38ae47f6b6d082d")
                .unwrap();
        PrivateKey::from_bytes(&bytes).unwrap()
    }

    fn spend_skeleton() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                outpoint: OutPoint {
                    txid: double_sha256(b"funding tx"),
                    index: 0,
                },
                script: Vec::new(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                amount: 50_000,
                script: p2pkh_lock_script(&test_key().public_key().hash()),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn round_trip() {
        let tx = spend_skeleton();
        let bytes = tx.serialize();
        assert_eq!(Transaction::deserialize(&bytes).unwrap(), tx);
    }

    #[test]
    fn txid_is_stable_over_reserialization() {
        let tx = spend_skeleton();
        let txid = tx.txid();
        let parsed = Transaction::deserialize(&tx.serialize()).unwrap();
        assert_eq!(parsed.txid(), txid);
    }

    #[test]
    fn coinbase_detection() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                outpoint: OutPoint::coinbase(),
                script: vec![0x01, 0x2a],
                sequence: 0xffff_ffff,
            }],
            outputs: Vec::new(),
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.coinbase_height(), Some(42));
        assert!(!spend_skeleton().is_coinbase());
    }

    #[test]
    fn coinbase_height_small_integer() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                outpoint: OutPoint::coinbase(),
                script: vec![crate::script::opcodes::OP_16],
                sequence: 0xffff_ffff,
            }],
            outputs: Vec::new(),
            lock_time: 0,
        };
        assert_eq!(coinbase.coinbase_height(), Some(16));
    }

    #[test]
    fn legacy_preimage_single_pads_earlier_outputs() {
        let mut tx = spend_skeleton();
        tx.inputs.push(tx.inputs[0].clone());
        tx.inputs[1].outpoint.index = 1;
        tx.outputs.push(TxOutput {
            amount: 1_000,
            script: vec![],
        });

        let preimage = tx.legacy_preimage(1, b"sub", hash_type::SINGLE);
        // (-1, empty) padding for output 0 must appear verbatim
        let pad = (-1i64).to_le_bytes();
        assert!(preimage
            .windows(pad.len() + 1)
            .any(|w| w[..8] == pad[..] && w[8] == 0));
    }

    #[test]
    fn forkid_preimage_commits_to_amount() {
        let tx = spend_skeleton();
        let with_50k = tx.signature_hash(0, b"sub", 50_000, hash_type::ALL | hash_type::FORKID, true);
        let with_60k = tx.signature_hash(0, b"sub", 60_000, hash_type::ALL | hash_type::FORKID, true);
        assert_ne!(with_50k, with_60k);

        // The legacy preimage does not commit to the amount
        let legacy_a = tx.signature_hash(0, b"sub", 50_000, hash_type::ALL, false);
        let legacy_b = tx.signature_hash(0, b"sub", 60_000, hash_type::ALL, false);
        assert_eq!(legacy_a, legacy_b);
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let mut tx = spend_skeleton();
        tx.inputs.push(TxInput {
            outpoint: OutPoint {
                txid: double_sha256(b"other funding"),
                index: 3,
            },
            script: Vec::new(),
            sequence: 0xffff_ffff,
        });

        let hash_type_acp = hash_type::ALL | hash_type::ANYONECANPAY | hash_type::FORKID;
        let before = tx.signature_hash(0, b"sub", 1, hash_type_acp, true);
        tx.inputs[1].outpoint.index = 4;
        let after = tx.signature_hash(0, b"sub", 1, hash_type_acp, true);
        assert_eq!(before, after);

        let hash_type_all = hash_type::ALL | hash_type::FORKID;
        let strict_before = tx.signature_hash(0, b"sub", 1, hash_type_all, true);
        tx.inputs[1].outpoint.index = 5;
        let strict_after = tx.signature_hash(0, b"sub", 1, hash_type_all, true);
        assert_ne!(strict_before, strict_after);
    }

    #[test]
    fn signed_spend_verifies_end_to_end() {
        let key = test_key();
        let lock = p2pkh_lock_script(&key.public_key().hash());
        let mut tx = spend_skeleton();

        let digest = tx.signature_hash(0, &lock, 51_000, hash_type::ALL | hash_type::FORKID, true);
        let signature = key.sign(&digest, hash_type::ALL | hash_type::FORKID);
        tx.inputs[0].script = p2pkh_unlock_script(&signature, &key.public_key().serialize());

        let flags = ScriptFlags {
            cash_active: true,
            ..Default::default()
        };
        assert_eq!(verify_input(&tx, 0, &lock, 51_000, &flags), Ok(true));

        // Wrong amount breaks the forkid digest
        assert_eq!(verify_input(&tx, 0, &lock, 51_001, &flags), Ok(false));
    }
}
