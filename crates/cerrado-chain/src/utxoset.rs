//! The unspent transaction output set, sharded on disk by a 16-bit
//! bucket of the owning txid. Spends and additions made while a block
//! validates are tentative: a commit makes them durable, a revert puts
//! the set back exactly as it was.
//!
//! Spent entries are not erased at commit. They keep the height they
//! were spent at so a reorg can resurrect them, and an age-based purge
//! drops them once no plausible reorg could reach back that far.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use cerrado_common::Hash256;
use log::info;
use log::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::BlockchainError;
use crate::error::WireError;
use crate::transaction::Transaction;
use crate::wire::*;

/// Number of shards; one per 16-bit txid bucket.
const SHARD_COUNT: usize = 0x10000;

/// Spent entries older than this many blocks can never be needed by a
/// reorg again and are dropped when their shard is flushed.
const SPENT_RETENTION_BLOCKS: u32 = 1000;

const SHARD_MAGIC: u32 = 0x78_74_75_63; // "cutx" backwards
const SHARD_VERSION: u32 = 0;

/// An unspent output as the rest of the system sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub txid: Hash256,
    pub index: u32,
    pub amount: i64,
    pub script: Vec<u8>,
    pub height: u32,
}

/// On-disk form: one output of a transaction, possibly already spent.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredOutput {
    index: u32,
    amount: i64,
    script: Vec<u8>,
    height: u32,
    spent_at: Option<u32>,
}

#[derive(Debug, Default)]
struct Shard {
    outputs: HashMap<Hash256, Vec<StoredOutput>>,
    dirty: bool,
    last_access: Option<Instant>,
}

/// One tentative mutation, undone in reverse order by a revert.
#[derive(Debug, Clone, Copy)]
enum TentativeOp {
    Spend { txid: Hash256, index: u32 },
    Add { txid: Hash256, index: u32 },
}

pub struct UtxoSet {
    dir: PathBuf,
    shards: Vec<Mutex<Option<Shard>>>,
    tentative: Mutex<Vec<TentativeOp>>,
    height: Mutex<u32>,
}

impl UtxoSet {
    pub fn new(dir: &Path) -> Result<Self, BlockchainError> {
        fs::create_dir_all(dir)?;
        let set = UtxoSet {
            dir: dir.to_path_buf(),
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(None)).collect(),
            tentative: Mutex::new(Vec::new()),
            height: Mutex::new(0),
        };
        let height_path = set.height_path();
        if height_path.exists() {
            let bytes = fs::read(height_path)?;
            let mut reader = bytes.as_slice();
            *set.height.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                read_u32(&mut reader).map_err(BlockchainError::WireFormat)?;
        }
        Ok(set)
    }

    fn height_path(&self) -> PathBuf {
        self.dir.join("height")
    }

    fn shard_path(&self, bucket: u16) -> PathBuf {
        self.dir.join(format!("{bucket:04x}.dat"))
    }

    /// The height the durable set corresponds to.
    pub fn height(&self) -> u32 {
        *self.height.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock a shard, reading it from disk on first touch.
    fn shard(&self, bucket: u16) -> MutexGuard<'_, Option<Shard>> {
        let mut guard = self.shards[bucket as usize]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(self.read_shard(bucket));
        }
        if let Some(shard) = guard.as_mut() {
            shard.last_access = Some(Instant::now());
        }
        guard
    }

    fn read_shard(&self, bucket: u16) -> Shard {
        let path = self.shard_path(bucket);
        if !path.exists() {
            return Shard::default();
        }
        match self.parse_shard(&path) {
            Ok(shard) => shard,
            Err(error) => {
                // A damaged shard surfaces later as a height mismatch
                // and gets rebuilt by the recovery walk
                warn!("utxo shard {bucket:04x} is unreadable: {error}");
                Shard::default()
            }
        }
    }

    fn parse_shard(&self, path: &Path) -> Result<Shard, BlockchainError> {
        let bytes = fs::read(path)?;
        if bytes.len() < 16 {
            return Err(BlockchainError::WireFormat(WireError::UnexpectedEnd));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().expect("sized"));
        let version = u32::from_le_bytes(bytes[4..8].try_into().expect("sized"));
        let checksum = u64::from_le_bytes(bytes[8..16].try_into().expect("sized"));
        let body = &bytes[16..];
        if magic != SHARD_MAGIC || version != SHARD_VERSION || xxh3_64(body) != checksum {
            return Err(BlockchainError::WireFormat(WireError::InvalidValue(
                "utxo shard header",
            )));
        }

        let mut reader = body;
        let group_count = read_u32(&mut reader).map_err(BlockchainError::WireFormat)?;
        let mut outputs = HashMap::with_capacity(group_count.min(1 << 20) as usize);
        for _ in 0..group_count {
            let txid = Hash256::read(&mut reader).map_err(BlockchainError::WireFormat)?;
            let entry_count = read_u32(&mut reader).map_err(BlockchainError::WireFormat)?;
            let mut entries = Vec::with_capacity(entry_count.min(1 << 16) as usize);
            for _ in 0..entry_count {
                entries.push(Self::read_output(&mut reader)?);
            }
            outputs.insert(txid, entries);
        }
        Ok(Shard {
            outputs,
            dirty: false,
            last_access: None,
        })
    }

    fn read_output(reader: &mut impl Read) -> Result<StoredOutput, BlockchainError> {
        let index = read_u32(reader).map_err(BlockchainError::WireFormat)?;
        let amount = read_i64(reader).map_err(BlockchainError::WireFormat)?;
        let height = read_u32(reader).map_err(BlockchainError::WireFormat)?;
        let spent_raw = read_u32(reader).map_err(BlockchainError::WireFormat)?;
        let script = read_var_bytes(reader).map_err(BlockchainError::WireFormat)?;
        Ok(StoredOutput {
            index,
            amount,
            script,
            height,
            spent_at: (spent_raw != u32::MAX).then_some(spent_raw),
        })
    }

    fn write_shard(&self, bucket: u16, shard: &Shard) -> Result<(), BlockchainError> {
        let mut body = Vec::new();
        body.extend_from_slice(&(shard.outputs.len() as u32).to_le_bytes());
        for (txid, entries) in shard.outputs.iter() {
            body.extend_from_slice(txid.as_bytes());
            body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for output in entries.iter() {
                body.extend_from_slice(&output.index.to_le_bytes());
                body.extend_from_slice(&output.amount.to_le_bytes());
                body.extend_from_slice(&output.height.to_le_bytes());
                body.extend_from_slice(&output.spent_at.unwrap_or(u32::MAX).to_le_bytes());
                write_var_bytes(&mut body, &output.script)?;
            }
        }

        let mut file = Vec::with_capacity(body.len() + 16);
        file.extend_from_slice(&SHARD_MAGIC.to_le_bytes());
        file.extend_from_slice(&SHARD_VERSION.to_le_bytes());
        file.extend_from_slice(&xxh3_64(&body).to_le_bytes());
        file.extend_from_slice(&body);
        fs::write(self.shard_path(bucket), file)?;
        Ok(())
    }

    /// Whether any output of `txid` is known, spent or not.
    pub fn contains_tx(&self, txid: &Hash256) -> bool {
        let mut guard = self.shard(txid.bucket16());
        let shard = guard.as_mut().expect("shard loaded");
        shard.outputs.contains_key(txid)
    }

    /// Look up an output, returning it only while unspent.
    pub fn find_unspent(&self, txid: &Hash256, index: u32) -> Option<UtxoEntry> {
        let mut guard = self.shard(txid.bucket16());
        let shard = guard.as_mut().expect("shard loaded");
        let entries = shard.outputs.get(txid)?;
        entries
            .iter()
            .find(|output| output.index == index && output.spent_at.is_none())
            .map(|output| UtxoEntry {
                txid: *txid,
                index,
                amount: output.amount,
                script: output.script.clone(),
                height: output.height,
            })
    }

    /// Tentatively mark an output spent at `height`. Idempotent within
    /// one block: spending an output twice is caught by the lookup
    /// before this call.
    pub fn spend(&self, txid: &Hash256, index: u32, height: u32) {
        let mut guard = self.shard(txid.bucket16());
        let shard = guard.as_mut().expect("shard loaded");
        if let Some(entries) = shard.outputs.get_mut(txid) {
            for output in entries.iter_mut() {
                if output.index == index && output.spent_at.is_none() {
                    output.spent_at = Some(height);
                    shard.dirty = true;
                    self.tentative
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(TentativeOp::Spend { txid: *txid, index });
                    return;
                }
            }
        }
    }

    /// Tentatively insert a new unspent output. Returns false on a
    /// collision with an existing unspent entry unless `allow_replace`
    /// (the BIP-30 exception blocks) is set.
    pub fn add(&self, entry: UtxoEntry, allow_replace: bool) -> bool {
        let mut guard = self.shard(entry.txid.bucket16());
        let shard = guard.as_mut().expect("shard loaded");
        let entries = shard.outputs.entry(entry.txid).or_default();

        if let Some(position) = entries
            .iter()
            .position(|output| output.index == entry.index && output.spent_at.is_none())
        {
            if !allow_replace {
                return false;
            }
            // The overwritten output is gone for good, as it was on the
            // historical chain
            entries.remove(position);
        }

        entries.push(StoredOutput {
            index: entry.index,
            amount: entry.amount,
            script: entry.script,
            height: entry.height,
            spent_at: None,
        });
        shard.dirty = true;
        self.tentative
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(TentativeOp::Add {
                txid: entry.txid,
                index: entry.index,
            });
        true
    }

    /// Make the current tentative changes durable as the state for
    /// `height`.
    pub fn commit(&self, height: u32) {
        self.tentative.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
        *self.height.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = height;
    }

    /// Undo every tentative change since the last commit, newest first.
    pub fn revert_tentative(&self) {
        let ops: Vec<TentativeOp> = {
            let mut tentative = self.tentative.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tentative.drain(..).collect()
        };
        for op in ops.iter().rev() {
            match op {
                TentativeOp::Spend { txid, index } => {
                    let mut guard = self.shard(txid.bucket16());
                    let shard = guard.as_mut().expect("shard loaded");
                    if let Some(entries) = shard.outputs.get_mut(txid) {
                        for output in entries.iter_mut() {
                            if output.index == *index && output.spent_at.is_some() {
                                output.spent_at = None;
                            }
                        }
                        shard.dirty = true;
                    }
                }
                TentativeOp::Add { txid, index } => {
                    let mut guard = self.shard(txid.bucket16());
                    let shard = guard.as_mut().expect("shard loaded");
                    if let Some(entries) = shard.outputs.get_mut(txid) {
                        entries.retain(|output| {
                            !(output.index == *index && output.spent_at.is_none())
                        });
                        if entries.is_empty() {
                            shard.outputs.remove(txid);
                        }
                        shard.dirty = true;
                    }
                }
            }
        }
    }

    /// Undo a committed block: remove the outputs its transactions
    /// created and resurrect the ones they spent. `height` is the block
    /// being detached; the marker moves to the block below.
    pub fn revert_block(&self, transactions: &[Transaction], height: u32) {
        for tx in transactions.iter().rev() {
            let txid = tx.txid();
            {
                let mut guard = self.shard(txid.bucket16());
                let shard = guard.as_mut().expect("shard loaded");
                if let Some(entries) = shard.outputs.get_mut(&txid) {
                    entries.retain(|output| output.height != height);
                    if entries.is_empty() {
                        shard.outputs.remove(&txid);
                    }
                    shard.dirty = true;
                }
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in tx.inputs.iter() {
                let mut guard = self.shard(input.outpoint.txid.bucket16());
                let shard = guard.as_mut().expect("shard loaded");
                if let Some(entries) = shard.outputs.get_mut(&input.outpoint.txid) {
                    for output in entries.iter_mut() {
                        if output.index == input.outpoint.index
                            && output.spent_at == Some(height)
                        {
                            output.spent_at = None;
                        }
                    }
                    shard.dirty = true;
                }
            }
        }
        *self.height.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = height.saturating_sub(1);
    }

    /// Walk blocks downward from the durable height to `new_height`,
    /// reverting each; recovery tooling for a set that ran ahead of a
    /// truncated block corpus. The caller supplies the block reader so
    /// the store stays decoupled from the block files.
    pub fn bulk_revert<F>(&self, new_height: u32, mut read_block: F) -> Result<(), BlockchainError>
    where
        F: FnMut(u32) -> Result<Vec<Transaction>, BlockchainError>,
    {
        let mut height = self.height();
        while height > new_height {
            let transactions = read_block(height)?;
            self.revert_block(&transactions, height);
            height -= 1;
        }
        Ok(())
    }

    /// Flush dirty shards and drop from memory those untouched for
    /// `max_age`. Spent entries beyond the retention window are dropped
    /// as their shard is written out.
    pub fn purge(&self, max_age: Duration) -> Result<(), BlockchainError> {
        let height = self.height();
        let horizon = height.saturating_sub(SPENT_RETENTION_BLOCKS);
        let mut flushed = 0usize;
        let mut evicted = 0usize;
        for bucket in 0..SHARD_COUNT {
            let mut guard = self.shards[bucket]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(shard) = guard.as_mut() else {
                continue;
            };
            if shard.dirty {
                Self::drop_stale_spent(shard, horizon);
                self.write_shard(bucket as u16, shard)?;
                shard.dirty = false;
                flushed += 1;
            }
            let stale = shard
                .last_access
                .map(|touched| touched.elapsed() >= max_age)
                .unwrap_or(true);
            if stale {
                *guard = None;
                evicted += 1;
            }
        }
        if flushed > 0 || evicted > 0 {
            info!("utxo purge: {flushed} shards flushed, {evicted} evicted");
        }
        Ok(())
    }

    fn drop_stale_spent(shard: &mut Shard, horizon: u32) {
        shard.outputs.retain(|_, entries| {
            entries.retain(|output| match output.spent_at {
                Some(spent) => spent >= horizon,
                None => true,
            });
            !entries.is_empty()
        });
    }

    /// Write every dirty shard and the height marker.
    pub fn save(&self) -> Result<(), BlockchainError> {
        let height = self.height();
        let horizon = height.saturating_sub(SPENT_RETENTION_BLOCKS);
        for bucket in 0..SHARD_COUNT {
            let mut guard = self.shards[bucket]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(shard) = guard.as_mut() {
                if shard.dirty {
                    Self::drop_stale_spent(shard, horizon);
                    self.write_shard(bucket as u16, shard)?;
                    shard.dirty = false;
                }
            }
        }
        fs::write(self.height_path(), height.to_le_bytes())?;
        Ok(())
    }

    /// Count unspent entries across all shards. Loads everything; meant
    /// for tooling and tests.
    pub fn unspent_count(&self) -> usize {
        let mut count = 0;
        for bucket in 0..SHARD_COUNT as u32 {
            let mut guard = self.shard(bucket as u16);
            let shard = guard.as_mut().expect("shard loaded");
            count += shard
                .outputs
                .values()
                .flat_map(|entries| entries.iter())
                .filter(|output| output.spent_at.is_none())
                .count();
        }
        count
    }
}
