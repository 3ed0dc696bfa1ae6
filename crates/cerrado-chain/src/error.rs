use core::fmt;
use core::fmt::Display;
use core::fmt::Formatter;

use cerrado_common::impl_error_from;
use cerrado_common::Hash256;

use crate::script::ScriptError;

#[derive(Debug)]
pub enum BlockchainError {
    /// Malformed bytes. The offending message is rejected without
    /// touching any state.
    WireFormat(WireError),
    /// A block hash above its own claimed target. The hash gets
    /// black-listed.
    ProofOfWork(Hash256),
    /// A script, transaction or block rule failure. Tentative state is
    /// reverted and the hash black-listed.
    BlockValidation(BlockValidationError),
    /// A header whose parent is neither on the chain nor near the tip.
    UnknownParent(Hash256),
    /// We already have this block. Idempotent no-op for callers.
    AlreadyHave(Hash256),
    /// The hash or its requesting node was black-listed earlier.
    BlackListed(Hash256),
    /// I/O or checksum failure. The current operation aborts before any
    /// in-memory commit; the next tick retries.
    Storage(std::io::Error),
    /// A stop was requested; the operation unwound cleanly.
    Cancelled,
    /// The block is not in our store.
    BlockNotFound,
    ChainNotInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnexpectedEnd,
    /// A length field larger than any valid message could carry.
    OversizedAllocation(u64),
    InvalidValue(&'static str),
}

#[derive(Debug)]
pub enum BlockValidationError {
    BadMerkleRoot {
        block: Hash256,
    },
    /// The header's target bits don't match the value required by the
    /// difficulty algorithm at this height.
    BadTargetBits {
        block: Hash256,
        expected: u32,
        actual: u32,
    },
    NotEnoughPow {
        block: Hash256,
    },
    /// The network has moved past this block version.
    OutdatedVersion {
        block: Hash256,
        version: i32,
        required: u32,
    },
    EmptyBlock {
        block: Hash256,
    },
    FirstTxNotCoinbase {
        block: Hash256,
    },
    /// A coinbase input without the 0xffffffff outpoint index.
    BadCoinbaseInput {
        txid: Hash256,
    },
    /// BIP-34 is active and the coinbase doesn't push the block height.
    BadCoinbaseHeight {
        txid: Hash256,
        expected: u32,
    },
    /// Coinbase outputs claim more than subsidy plus fees.
    BadCoinbaseAmount {
        block: Hash256,
    },
    UnknownOutpoint {
        txid: Hash256,
        index: u32,
    },
    /// An output collides with an existing unspent entry (BIP-30).
    DuplicateOutput {
        txid: Hash256,
        index: u32,
    },
    NegativeOutput {
        txid: Hash256,
    },
    /// A transaction spends more than its inputs provide.
    NotEnoughFunds {
        txid: Hash256,
    },
    /// An input's scripts ran to completion but did not verify.
    ScriptNotVerified {
        txid: Hash256,
        input: u32,
    },
    ScriptFailed {
        txid: Hash256,
        input: u32,
        error: ScriptError,
    },
}

impl Display for BlockValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockValidationError::BadMerkleRoot { block } => {
                write!(f, "block {block} has a wrong merkle root")
            }
            BlockValidationError::BadTargetBits {
                block,
                expected,
                actual,
            } => write!(
                f,
                "block {block} target bits {actual:08x} don't match required {expected:08x}"
            ),
            BlockValidationError::NotEnoughPow { block } => {
                write!(f, "block {block} doesn't have enough proof-of-work")
            }
            BlockValidationError::OutdatedVersion {
                block,
                version,
                required,
            } => {
                write!(
                    f,
                    "block {block} carries version {version}, network requires {required}"
                )
            }
            BlockValidationError::EmptyBlock { block } => {
                write!(f, "block {block} has no transactions")
            }
            BlockValidationError::FirstTxNotCoinbase { block } => {
                write!(f, "first transaction of block {block} isn't a coinbase")
            }
            BlockValidationError::BadCoinbaseInput { txid } => {
                write!(f, "coinbase {txid} has an input with a real outpoint index")
            }
            BlockValidationError::BadCoinbaseHeight { txid, expected } => {
                write!(f, "coinbase {txid} doesn't push block height {expected}")
            }
            BlockValidationError::BadCoinbaseAmount { block } => {
                write!(f, "coinbase of block {block} claims more than subsidy plus fees")
            }
            BlockValidationError::UnknownOutpoint { txid, index } => {
                write!(f, "transaction {txid} input spends unknown outpoint index {index}")
            }
            BlockValidationError::DuplicateOutput { txid, index } => {
                write!(f, "output {txid}:{index} collides with an unspent entry")
            }
            BlockValidationError::NegativeOutput { txid } => {
                write!(f, "transaction {txid} has a negative output amount")
            }
            BlockValidationError::NotEnoughFunds { txid } => {
                write!(f, "transaction {txid} outputs exceed its inputs")
            }
            BlockValidationError::ScriptNotVerified { txid, input } => {
                write!(f, "input {input} of {txid} did not verify")
            }
            BlockValidationError::ScriptFailed { txid, input, error } => {
                write!(f, "input {input} of {txid} failed script execution: {error}")
            }
        }
    }
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnexpectedEnd => write!(f, "unexpected end of data"),
            WireError::OversizedAllocation(len) => {
                write!(f, "length field {len} exceeds any valid message")
            }
            WireError::InvalidValue(what) => write!(f, "invalid value for {what}"),
        }
    }
}

impl Display for BlockchainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::WireFormat(e) => write!(f, "wire format: {e}"),
            BlockchainError::ProofOfWork(hash) => {
                write!(f, "block {hash} hash is above its target")
            }
            BlockchainError::BlockValidation(e) => write!(f, "{e}"),
            BlockchainError::UnknownParent(hash) => {
                write!(f, "block {hash} builds on an unknown parent")
            }
            BlockchainError::AlreadyHave(hash) => write!(f, "already have block {hash}"),
            BlockchainError::BlackListed(hash) => write!(f, "block {hash} is black-listed"),
            BlockchainError::Storage(e) => write!(f, "storage: {e}"),
            BlockchainError::Cancelled => write!(f, "stop requested"),
            BlockchainError::BlockNotFound => write!(f, "block not in our store"),
            BlockchainError::ChainNotInitialized => write!(f, "chain is not initialized"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl_error_from!(BlockchainError, WireError, WireFormat);
impl_error_from!(BlockchainError, BlockValidationError, BlockValidation);
impl_error_from!(BlockchainError, std::io::Error, Storage);
