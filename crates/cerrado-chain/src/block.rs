//! Blocks: the 80-byte header, merkle trees and whole-block validation.

use std::io::Read;
use std::io::Write;

use cerrado_common::double_sha256;
use cerrado_common::Hash256;
use log::warn;

use crate::error::BlockValidationError;
use crate::error::WireError;
use crate::forks::Forks;
use crate::target::Uint256;
use crate::utxoset::UtxoSet;
use crate::transaction::Transaction;
use crate::wire::*;

/// Value of one coin in satoshis.
pub const COIN_VALUE: i64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub target_bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Writable for BlockHeader {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.version.to_le_bytes())?;
        self.prev_hash.write(writer)?;
        self.merkle_root.write(writer)?;
        writer.write_all(&self.time.to_le_bytes())?;
        writer.write_all(&self.target_bits.to_le_bytes())?;
        writer.write_all(&self.nonce.to_le_bytes())
    }
}

impl Readable for BlockHeader {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        Ok(BlockHeader {
            version: read_i32(reader)?,
            prev_hash: Hash256::read(reader)?,
            merkle_root: Hash256::read(reader)?,
            time: read_u32(reader)?,
            target_bits: read_u32(reader)?,
            nonce: read_u32(reader)?,
        })
    }
}

impl Writable for Block {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.header.write(writer)?;
        write_compact_int(writer, self.transactions.len() as u64)?;
        for tx in self.transactions.iter() {
            tx.write(writer)?;
        }
        Ok(())
    }
}

impl Readable for Block {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let header = BlockHeader::read(reader)?;
        let tx_count = read_compact_int(reader)?;
        if tx_count > MAX_ALLOCATION {
            return Err(WireError::OversizedAllocation(tx_count));
        }
        let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::read(reader)?);
        }
        Ok(Block {
            header,
            transactions,
        })
    }
}

impl BlockHeader {
    /// Double-SHA-256 of the 80 serialized bytes.
    pub fn block_hash(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }

    /// The hash, read as a 256-bit number, is at or below the target the
    /// header itself claims.
    pub fn has_proof_of_work(&self) -> bool {
        let target = Uint256::from_compact(self.target_bits);
        !target.is_zero() && Uint256::from_hash(&self.block_hash()) <= target
    }

    /// Work this header contributes to its chain.
    pub fn work(&self) -> Uint256 {
        Uint256::from_compact(self.target_bits).work()
    }
}

impl Block {
    pub fn block_hash(&self) -> Hash256 {
        self.header.block_hash()
    }

    /// A header-only entry, as used in the pending queue before the
    /// body is downloaded.
    pub fn from_header(header: BlockHeader) -> Self {
        Block {
            header,
            transactions: Vec::new(),
        }
    }

    pub fn is_header_only(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Merkle root of this block's transactions.
    pub fn merkle_root(&self) -> Hash256 {
        merkle_root(&self.transactions.iter().map(|tx| tx.txid()).collect::<Vec<_>>())
    }

    /// Validate the block's contents at `height` and tentatively apply
    /// its transactions to the UTXO set. On error the caller reverts the
    /// set. Returns the total fees collected.
    pub fn process(
        &self,
        utxos: &UtxoSet,
        height: u32,
        forks: &Forks,
        subsidy: i64,
        bip30_exception: bool,
    ) -> Result<i64, BlockValidationError> {
        let hash = self.block_hash();

        if self.transactions.is_empty() {
            return Err(BlockValidationError::EmptyBlock { block: hash });
        }
        if self.merkle_root() != self.header.merkle_root {
            return Err(BlockValidationError::BadMerkleRoot { block: hash });
        }
        if !self.transactions[0].is_coinbase() {
            return Err(BlockValidationError::FirstTxNotCoinbase { block: hash });
        }

        let mut fees: i64 = 0;
        for (i, tx) in self.transactions.iter().enumerate() {
            let coinbase = i == 0;
            if !coinbase && tx.is_coinbase() {
                return Err(BlockValidationError::FirstTxNotCoinbase { block: hash });
            }
            let fee = tx.process(
                utxos,
                height,
                coinbase,
                self.header.version,
                forks,
                coinbase && bip30_exception,
            )?;
            if !coinbase {
                fees += fee;
            }
        }

        // The coinbase may claim at most subsidy plus the fees the other
        // transactions left on the table
        let coinbase_out: i64 = self.transactions[0].outputs.iter().map(|o| o.amount).sum();
        if coinbase_out > subsidy + fees {
            warn!(
                "block {hash} coinbase claims {coinbase_out} with subsidy {subsidy} and fees {fees}"
            );
            return Err(BlockValidationError::BadCoinbaseAmount { block: hash });
        }

        Ok(fees)
    }
}

/// Subsidy for a block at `height`: 50 coins, halved at every interval.
pub fn coinbase_subsidy(height: u32, halving_interval: u32) -> i64 {
    let halvings = height / halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN_VALUE) >> halvings
}

/// Pairwise double-SHA-256 merkle root. Odd levels duplicate their last
/// element; a single txid is its own root.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = *pair.last().expect("chunks are non-empty");
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(left.as_bytes());
            buf[32..].copy_from_slice(right.as_bytes());
            next.push(double_sha256(&buf));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod test {
    use super::*;
    use cerrado_common::sha256;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: sha256(b"root"),
            time: 1231006505,
            target_bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn header_round_trip() {
        let bytes = header().serialize();
        assert_eq!(bytes.len(), 80);
        assert_eq!(BlockHeader::deserialize(&bytes).unwrap(), header());
    }

    #[test]
    fn merkle_single_is_identity() {
        let txid = sha256(b"only");
        assert_eq!(merkle_root(&[txid]), txid);
    }

    #[test]
    fn merkle_duplicates_odd_tail() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");

        // Three leaves behave as [a b c c]
        let ab = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(a.as_bytes());
            buf[32..].copy_from_slice(b.as_bytes());
            double_sha256(&buf)
        };
        let cc = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(c.as_bytes());
            buf[32..].copy_from_slice(c.as_bytes());
            double_sha256(&buf)
        };
        let root = {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(ab.as_bytes());
            buf[32..].copy_from_slice(cc.as_bytes());
            double_sha256(&buf)
        };
        assert_eq!(merkle_root(&[a, b, c]), root);
    }

    #[test]
    fn subsidy_halves() {
        assert_eq!(coinbase_subsidy(0, 210_000), 50 * COIN_VALUE);
        assert_eq!(coinbase_subsidy(209_999, 210_000), 50 * COIN_VALUE);
        assert_eq!(coinbase_subsidy(210_000, 210_000), 25 * COIN_VALUE);
        assert_eq!(coinbase_subsidy(420_000, 210_000), 1_250_000_000);
        // Shifted to nothing eventually
        assert_eq!(coinbase_subsidy(64 * 210_000, 210_000), 0);
    }

    #[test]
    fn proof_of_work_uses_claimed_target() {
        // At trivial difficulty a valid nonce turns up within a few tries
        let mut easy = header();
        easy.target_bits = 0x207fffff;
        while !easy.has_proof_of_work() {
            easy.nonce += 1;
            assert!(easy.nonce - header().nonce < 10_000, "no nonce found");
        }

        // That same hash never satisfies a mantissa of zero
        easy.target_bits = 0x20000000;
        assert!(!easy.has_proof_of_work());
    }
}
