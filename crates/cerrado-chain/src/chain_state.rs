//! The chain state machine. One [Chain] owns the authoritative block
//! index, the pending queue of headers and bodies on their way in, any
//! side branches, the UTXO set and the block files, and drives block
//! validation, tip advancement and reorgs.

use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use cerrado_common::Hash256;
use log::info;
use log::trace;
use log::warn;
use spin::RwLock;

use crate::block::coinbase_subsidy;
use crate::block::Block;
use crate::block::BlockHeader;
use crate::blockstore::BlockStore;
use crate::blockstore::MAX_BLOCKS_PER_FILE;
use crate::chainparams::ChainParams;
use crate::difficulty::required_target_bits;
use crate::error::BlockValidationError;
use crate::error::BlockchainError;
use crate::forks::Forks;
use crate::stats::BlockStats;
use crate::target::Uint256;
use crate::utxoset::UtxoSet;
use crate::wire::Readable;
use crate::wire::Writable;

/// Seconds before an unanswered block request may be handed to another
/// node.
const REQUEST_TIMEOUT: u32 = 360;

/// Most black-listed hashes we bother remembering.
const BLACK_LIST_LIMIT: usize = 1000;

/// A branch that never connects within this many blocks of the tip is
/// not worth keeping.
const BRANCH_ATTACH_WINDOW: u32 = 100;

/// Modules wanting finished blocks (announcers, indexers) implement
/// this and subscribe; they are called only after a block is durably
/// attached.
pub trait BlockConsumer: Send + Sync + 'static {
    fn consume_block(&self, block: &Block, height: u32);
}

/// Admission verdict for an announced hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    AlreadyHave,
    NeedHeader,
    NeedBlock,
    BlackListed,
}

/// A header we asked a node for and haven't seen yet.
struct PendingHeaderData {
    hash: Hash256,
    requesting_node: u32,
    requested_time: u32,
}

/// A pending chain extension: a bare header until the body arrives.
struct PendingBlockData {
    block: Block,
    requested_time: u32,
    update_time: u32,
    requesting_node: u32,
}

impl PendingBlockData {
    fn new(block: Block) -> Self {
        PendingBlockData {
            block,
            requested_time: 0,
            update_time: 0,
            requesting_node: 0,
        }
    }

    fn is_full(&self) -> bool {
        !self.block.is_header_only()
    }

    fn size(&self) -> usize {
        self.block.serialized_size()
    }

    fn timed_out(&self, now: u32) -> bool {
        // Download progress counts as much as the original request
        let last_activity = self.requested_time.max(self.update_time);
        now.saturating_sub(last_activity) > REQUEST_TIMEOUT
    }
}

/// A side chain anchored below the tip, held until it either out-works
/// the main chain or goes stale.
struct Branch {
    /// Height the first branch block would occupy.
    height: u32,
    pending: Vec<PendingBlockData>,
    accumulated_work: Uint256,
}

impl Branch {
    fn new(fork_height: u32, work_at_fork: Uint256) -> Self {
        Branch {
            height: fork_height + 1,
            pending: Vec::new(),
            accumulated_work: work_at_fork,
        }
    }

    fn add_block(&mut self, block: Block) {
        self.accumulated_work = self.accumulated_work.wrapping_add(block.header.work());
        self.pending.push(PendingBlockData::new(block));
    }

    fn last_hash(&self) -> Option<Hash256> {
        self.pending.last().map(|pending| pending.block.block_hash())
    }

    fn tip_height(&self) -> u32 {
        self.height + self.pending.len() as u32 - 1
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.pending
            .iter()
            .any(|pending| pending.block.block_hash() == *hash)
    }
}

/// One entry of the block index.
struct BlockInfo {
    hash: Hash256,
    file_id: u32,
    height: u32,
}

/// The index: an arena ordered by height plus 65,536 hash-prefix
/// buckets of arena positions, each bucket behind its own lock.
struct BlockIndex {
    arena: RwLock<Vec<BlockInfo>>,
    buckets: Vec<RwLock<Vec<u32>>>,
}

impl BlockIndex {
    fn new() -> Self {
        BlockIndex {
            arena: RwLock::new(Vec::new()),
            buckets: (0..0x10000).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn insert(&self, hash: Hash256, height: u32) {
        let mut arena = self.arena.write();
        debug_assert_eq!(arena.len() as u32, height);
        arena.push(BlockInfo {
            hash,
            file_id: height / MAX_BLOCKS_PER_FILE,
            height,
        });
        self.buckets[hash.bucket16() as usize].write().push(height);
    }

    fn height_of(&self, hash: &Hash256) -> Option<u32> {
        let bucket = self.buckets[hash.bucket16() as usize].read();
        let arena = self.arena.read();
        bucket
            .iter()
            .find(|position| arena[**position as usize].hash == *hash)
            .map(|position| arena[*position as usize].height)
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.height_of(hash).is_some()
    }

    fn file_id_of(&self, hash: &Hash256) -> Option<u32> {
        let height = self.height_of(hash)?;
        let arena = self.arena.read();
        Some(arena[height as usize].file_id)
    }

    fn hash_at(&self, height: u32) -> Option<Hash256> {
        self.arena.read().get(height as usize).map(|info| info.hash)
    }

    fn len(&self) -> u32 {
        self.arena.read().len() as u32
    }

    /// Drop every entry above `height`.
    fn truncate_to(&self, height: u32) {
        let mut arena = self.arena.write();
        while arena.len() as u32 > height + 1 {
            let info = arena.pop().expect("checked len");
            self.buckets[info.hash.bucket16() as usize]
                .write()
                .retain(|position| *position != info.height);
        }
    }
}

/// The pending queue: the contiguous run of headers and bodies expected
/// to extend the main tip, plus header-request accounting.
#[derive(Default)]
struct PendingState {
    queue: VecDeque<PendingBlockData>,
    headers_requested: Vec<PendingHeaderData>,
    last_pending_hash: Option<Hash256>,
    /// Main-chain work plus the work of everything queued.
    accumulated_work: Uint256,
    total_size: usize,
    full_count: usize,
}

impl PendingState {
    fn position_of(&self, hash: &Hash256) -> Option<usize> {
        self.queue
            .iter()
            .position(|pending| pending.block.block_hash() == *hash)
    }

    fn clear(&mut self, tip_work: Uint256) {
        self.queue.clear();
        self.headers_requested.clear();
        self.last_pending_hash = None;
        self.accumulated_work = tip_work;
        self.total_size = 0;
        self.full_count = 0;
    }
}

/// Everything describing the authoritative chain itself.
struct ChainInner {
    next_height: u32,
    last_block_hash: Hash256,
    current_target_bits: u32,
    stats: BlockStats,
    forks: Forks,
    branches: Vec<Branch>,
    black_listed_blocks: VecDeque<Hash256>,
    black_listed_nodes: Vec<u32>,
    subscribers: Vec<Arc<dyn BlockConsumer>>,
    is_in_sync: bool,
}

impl ChainInner {
    fn tip_height(&self) -> u32 {
        self.next_height.saturating_sub(1)
    }

    fn is_black_listed(&self, hash: &Hash256) -> bool {
        self.black_listed_blocks.contains(hash)
    }

    fn black_list(&mut self, hash: Hash256) {
        warn!("black-listing block {hash}");
        if self.black_listed_blocks.len() >= BLACK_LIST_LIMIT {
            self.black_listed_blocks.pop_front();
        }
        self.black_listed_blocks.push_back(hash);
    }
}

pub struct Chain {
    params: ChainParams,
    data_dir: PathBuf,
    store: BlockStore,
    utxos: UtxoSet,
    index: BlockIndex,
    inner: RwLock<ChainInner>,
    pending: RwLock<PendingState>,
    /// Serializes everything that moves the tip.
    process_lock: Mutex<()>,
    stop: AtomicBool,
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

impl Chain {
    /// Open (or create) a chain under `data_dir`, replaying whatever the
    /// disk already holds and processing the genesis block on first run.
    pub fn new(params: ChainParams, data_dir: &Path) -> Result<Self, BlockchainError> {
        let store = BlockStore::new(&data_dir.join("blocks"))?;
        let utxos = UtxoSet::new(&data_dir.join("outputs"))?;

        let chain = Chain {
            store,
            utxos,
            index: BlockIndex::new(),
            inner: RwLock::new(ChainInner {
                next_height: 0,
                last_block_hash: Hash256::ZERO,
                current_target_bits: params.max_target_bits,
                stats: BlockStats::new(),
                forks: Forks::new(),
                branches: Vec::new(),
                black_listed_blocks: VecDeque::new(),
                black_listed_nodes: Vec::new(),
                subscribers: Vec::new(),
                is_in_sync: false,
            }),
            pending: RwLock::new(PendingState::default()),
            process_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            data_dir: data_dir.to_path_buf(),
            params,
        };
        chain.load()?;
        Ok(chain)
    }

    fn load(&self) -> Result<(), BlockchainError> {
        let hashes = self.store.load()?;
        for (height, hash) in hashes.iter().enumerate() {
            self.index.insert(*hash, height as u32);
        }

        {
            let mut inner = self.inner.write();
            inner.next_height = hashes.len() as u32;
            inner.last_block_hash = hashes.last().copied().unwrap_or(Hash256::ZERO);

            inner.stats = BlockStats::load(&self.data_dir.join("stats/state"))?;
            if inner.stats.len() != hashes.len() {
                info!("rebuilding block stats from headers");
                inner.stats = BlockStats::new();
                for height in 0..hashes.len() as u32 {
                    let header = self.store.read_header(height)?;
                    inner
                        .stats
                        .add(header.version, header.time, header.target_bits);
                }
            }

            inner.forks = Forks::load(&self.data_dir.join("forks/state"))?;

            let next_height = inner.next_height;
            inner.current_target_bits =
                required_target_bits(&self.params, &inner.stats, next_height);
        }

        // Bring a lagging UTXO set up to the stored tip, replaying fork
        // state alongside so scripts validate under the right rules
        self.catch_up_outputs()?;

        if self.index.len() == 0 {
            info!("creating genesis block");
            let genesis = self.params.genesis.clone();
            let _guard = self.process_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.process_block(&genesis)?;
        }

        self.load_pending()?;
        Ok(())
    }

    fn catch_up_outputs(&self) -> Result<(), BlockchainError> {
        let tip_height = {
            let inner = self.inner.read();
            if inner.next_height == 0 {
                return Ok(());
            }
            inner.tip_height()
        };
        if self.utxos.height() >= tip_height {
            return Ok(());
        }

        info!(
            "updating unspent outputs from height {} to {tip_height}",
            self.utxos.height()
        );
        // A marker of zero is ambiguous: a fresh set, or one holding
        // only the genesis coinbase
        let genesis_applied = self
            .utxos
            .contains_tx(&self.params.genesis.transactions[0].txid());

        let mut forks = Forks::new();
        let inner = self.inner.read();
        for height in 0..=tip_height {
            if self.stop.load(Ordering::Relaxed) {
                return Err(BlockchainError::Cancelled);
            }
            let applied = height < self.utxos.height()
                || (height == self.utxos.height() && (height > 0 || genesis_applied));
            if !applied {
                let block = self.store.read_block(height)?;
                let subsidy = coinbase_subsidy(height, self.params.halving_interval);
                let exception = self.params.bip30_exceptions.contains(&block.block_hash());
                if let Err(error) =
                    block.process(&self.utxos, height, &forks, subsidy, exception)
                {
                    self.utxos.revert_tentative();
                    return Err(error.into());
                }
                self.utxos.commit(height);
            }
            forks.process(&inner.stats, height, &self.params);
        }
        drop(inner);
        self.utxos.save()?;
        Ok(())
    }

    // ---- admission -----------------------------------------------------

    /// Classify an announced hash and remember who to ask for a header.
    pub fn add_pending_hash(&self, hash: Hash256, node_id: u32) -> HashStatus {
        {
            let inner = self.inner.read();
            if inner.is_black_listed(&hash) {
                return HashStatus::BlackListed;
            }
            if inner.branches.iter().any(|branch| branch.contains(&hash)) {
                return HashStatus::AlreadyHave;
            }
        }
        if self.index.contains(&hash) {
            return HashStatus::AlreadyHave;
        }

        let mut pending = self.pending.write();
        if let Some(position) = pending.position_of(&hash) {
            if pending.queue[position].is_full() {
                return HashStatus::AlreadyHave;
            }
            return HashStatus::NeedBlock;
        }

        if !pending
            .headers_requested
            .iter()
            .any(|header| header.hash == hash)
        {
            pending.headers_requested.push(PendingHeaderData {
                hash,
                requesting_node: node_id,
                requested_time: unix_time(),
            });
        }
        HashStatus::NeedHeader
    }

    /// Accept a header or a full block: attach it to the pending queue,
    /// to a branch, or open a new branch. The proof-of-work the header
    /// claims is checked here; full validation happens on attach.
    pub fn add_pending_block(&self, block: Block) -> Result<bool, BlockchainError> {
        let hash = block.block_hash();

        {
            let inner = self.inner.read();
            if inner.is_black_listed(&hash) {
                return Err(BlockchainError::BlackListed(hash));
            }
        }

        let claimed = Uint256::from_compact(block.header.target_bits);
        if claimed > Uint256::from_compact(self.params.max_target_bits)
            || !block.header.has_proof_of_work()
        {
            self.inner.write().black_list(hash);
            return Err(BlockchainError::ProofOfWork(hash));
        }

        // Lock order is inner before pending throughout; read the tip
        // before touching the queue
        let (tip_hash, tip_work) = {
            let inner = self.inner.read();
            (inner.last_block_hash, inner.stats.chain_work())
        };

        let mut pending = self.pending.write();

        // A body for a header already queued
        if let Some(position) = pending.position_of(&hash) {
            if pending.queue[position].is_full() {
                return Ok(false);
            }
            if block.is_header_only() {
                return Ok(false);
            }
            let entry = &mut pending.queue[position];
            let old_size = entry.size();
            entry.block = block;
            let new_size = entry.size();
            pending.total_size = pending.total_size - old_size + new_size;
            pending.full_count += 1;
            trace!("pending block received: {hash}");
            return Ok(true);
        }

        let expected_prev = pending.last_pending_hash.unwrap_or(tip_hash);

        // Extends the pending chain
        if block.header.prev_hash == expected_prev {
            if pending.queue.is_empty() {
                pending.accumulated_work = tip_work;
            }
            pending.accumulated_work =
                pending.accumulated_work.wrapping_add(block.header.work());
            pending.last_pending_hash = Some(hash);
            pending.total_size += block.serialized_size();
            if !block.is_header_only() {
                pending.full_count += 1;
            }
            pending
                .headers_requested
                .retain(|header| header.hash != hash);
            pending.queue.push_back(PendingBlockData::new(block));
            trace!("added pending header {hash}");
            return Ok(true);
        }

        drop(pending);

        // Extends one of the branches
        let mut inner = self.inner.write();
        for branch in inner.branches.iter_mut() {
            if branch.last_hash() == Some(block.header.prev_hash) {
                branch.add_block(block);
                trace!("added block {hash} to branch");
                return Ok(true);
            }
        }

        // Starts a new branch off a recent main-chain block
        if let Some(fork_height) = self.index.height_of(&block.header.prev_hash) {
            if self.index.contains(&hash) {
                return Ok(false);
            }
            if fork_height + BRANCH_ATTACH_WINDOW >= inner.next_height {
                let work_at_fork = inner.stats.accumulated_work(fork_height);
                let mut branch = Branch::new(fork_height, work_at_fork);
                branch.add_block(block);
                inner.branches.push(branch);
                info!("opened a branch at height {} for {hash}", fork_height + 1);
                return Ok(true);
            }
            warn!("block {hash} forks too far below the tip");
            return Err(BlockchainError::UnknownParent(hash));
        }

        if self.index.contains(&hash) {
            return Ok(false);
        }
        trace!("block {hash} has an unknown parent");
        Err(BlockchainError::UnknownParent(hash))
    }

    // ---- downloader accounting -----------------------------------------

    /// Hashes whose bodies should be requested next. With `reduce_only`
    /// set, only a block that will immediately unblock the front of the
    /// queue qualifies; that's the back-pressure mode used when pending
    /// bytes run past the budget.
    pub fn get_blocks_needed(&self, count: usize, reduce_only: bool) -> Vec<Hash256> {
        let now = unix_time();
        let pending = self.pending.read();
        let mut needed = Vec::new();

        if reduce_only {
            let mut first_empty = None;
            let mut full_after = false;
            for entry in pending.queue.iter() {
                if entry.is_full() {
                    if first_empty.is_some() {
                        full_after = true;
                        break;
                    }
                } else if first_empty.is_none() {
                    first_empty = Some(entry);
                }
            }
            // Only useful if a downloaded body is waiting right behind
            if let (Some(entry), true) = (first_empty, full_after) {
                if entry.timed_out(now) {
                    needed.push(entry.block.block_hash());
                }
            }
            return needed;
        }

        for entry in pending.queue.iter() {
            if needed.len() >= count {
                break;
            }
            if !entry.is_full() && entry.timed_out(now) {
                needed.push(entry.block.block_hash());
            }
        }
        needed
    }

    /// Record that `node_id` was asked for these blocks.
    pub fn mark_blocks_for_node(&self, hashes: &[Hash256], node_id: u32) {
        let now = unix_time();
        let mut pending = self.pending.write();
        for entry in pending.queue.iter_mut() {
            if hashes.contains(&entry.block.block_hash()) {
                entry.requested_time = now;
                entry.requesting_node = node_id;
            }
        }
    }

    /// Download progress arrived for a block; push its timeout out.
    pub fn update_block_progress(&self, hash: &Hash256, node_id: u32, time: u32) {
        let mut pending = self.pending.write();
        if let Some(position) = pending.position_of(hash) {
            let entry = &mut pending.queue[position];
            if entry.requesting_node == node_id {
                entry.update_time = time;
            }
        }
    }

    /// A node went away: put everything it was asked for back up for
    /// grabs.
    pub fn release_blocks_for_node(&self, node_id: u32) {
        let mut pending = self.pending.write();
        for entry in pending.queue.iter_mut() {
            if entry.requesting_node == node_id {
                entry.requested_time = 0;
                entry.update_time = 0;
            }
        }
        pending
            .headers_requested
            .retain(|header| header.requesting_node != node_id);
    }

    /// Whether the tip needs a fresh round of header requests.
    pub fn headers_needed(&self) -> bool {
        let now = unix_time();
        let pending = self.pending.read();
        pending
            .headers_requested
            .iter()
            .all(|header| now.saturating_sub(header.requested_time) > REQUEST_TIMEOUT)
    }

    /// Whether any queued header still lacks its body.
    pub fn blocks_needed(&self) -> bool {
        let pending = self.pending.read();
        pending.full_count < pending.queue.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().queue.len()
    }

    pub fn pending_block_count(&self) -> usize {
        self.pending.read().full_count
    }

    pub fn pending_size(&self) -> usize {
        self.pending.read().total_size
    }

    /// True when pending bytes run past the configured budget and block
    /// requests should switch to `reduce_only`.
    pub fn pending_over_budget(&self) -> bool {
        self.pending_size() > self.params.max_pending_size
    }

    // ---- processing ----------------------------------------------------

    /// Drain the pending queue: validate and attach every full block
    /// sitting at the front, then see whether any branch now out-works
    /// the main chain.
    pub fn process(&self) -> Result<(), BlockchainError> {
        let _guard = self.process_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.run_queue()
    }

    /// Re-evaluate branches against the main chain, reorganizing if one
    /// has accumulated more work.
    pub fn check_branches(&self) -> Result<(), BlockchainError> {
        let _guard = self.process_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.promote_best_branch()? {
            self.run_queue()?;
        } else {
            self.prune_stale_branches();
        }
        Ok(())
    }

    fn run_queue(&self) -> Result<(), BlockchainError> {
        let mut first_failure = None;
        loop {
            if let Err(error) = self.drain_pending() {
                if matches!(error, BlockchainError::Cancelled | BlockchainError::Storage(_)) {
                    return Err(error);
                }
                first_failure.get_or_insert(error);
            }
            if !self.promote_best_branch()? {
                break;
            }
        }
        self.prune_stale_branches();
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Attach full blocks from the front of the queue until it runs dry
    /// or a block fails. A failure black-lists the block and the node
    /// that fed it to us, and throws away the whole queue: everything
    /// behind the bad block was building on it.
    fn drain_pending(&self) -> Result<(), BlockchainError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(BlockchainError::Cancelled);
            }

            let front = {
                let pending = self.pending.read();
                match pending.queue.front() {
                    Some(entry) if entry.is_full() => Some(entry.block.clone()),
                    _ => None,
                }
            };
            let Some(block) = front else {
                return Ok(());
            };

            match self.process_block(&block) {
                Ok(height) => {
                    let mut pending = self.pending.write();
                    if let Some(entry) = pending.queue.pop_front() {
                        pending.total_size -= entry.size();
                        pending.full_count -= 1;
                    }
                    if pending.queue.is_empty() {
                        pending.last_pending_hash = None;
                    }
                    drop(pending);
                    self.notify(&block, height);
                }
                Err(error) => {
                    let hash = block.block_hash();
                    warn!("failed to attach block {hash}: {error}");

                    if matches!(error, BlockchainError::Storage(_)) {
                        // Nothing wrong with the block; retry next tick
                        return Err(error);
                    }

                    let requesting_node = {
                        let pending = self.pending.read();
                        pending.queue.front().map(|entry| entry.requesting_node)
                    };

                    let tip_work = {
                        let mut inner = self.inner.write();
                        inner.black_list(hash);
                        if let Some(node) = requesting_node {
                            if node != 0 && !inner.black_listed_nodes.contains(&node) {
                                inner.black_listed_nodes.push(node);
                            }
                        }
                        inner.stats.chain_work()
                    };

                    // The queue extended a block that turned out bad
                    info!("clearing all pending blocks and headers");
                    self.pending.write().clear(tip_work);
                    return Err(error);
                }
            }
        }
    }

    /// Validate `block` as the next block of the main chain and attach
    /// it. On success the tip, the UTXO set, the stats, the fork state
    /// and the block files all advance together.
    fn process_block(&self, block: &Block) -> Result<u32, BlockchainError> {
        let hash = block.block_hash();
        let mut inner = self.inner.write();
        let height = inner.next_height;

        if height == 0 {
            if !block.header.prev_hash.is_zero() {
                return Err(BlockchainError::UnknownParent(hash));
            }
        } else if block.header.prev_hash != inner.last_block_hash {
            return Err(BlockchainError::UnknownParent(hash));
        }

        if (block.header.version.max(0) as u32) < inner.forks.required_version() {
            return Err(BlockValidationError::OutdatedVersion {
                block: hash,
                version: block.header.version,
                required: inner.forks.required_version(),
            }
            .into());
        }

        // The header must carry exactly the bits the difficulty
        // algorithm requires at this height
        let expected_bits = required_target_bits(&self.params, &inner.stats, height);
        if block.header.target_bits != expected_bits {
            // TestNet blocks twenty minutes in the making may fall back
            // to minimum difficulty
            let min_difficulty_ok = self.params.allow_min_difficulty
                && height > 0
                && block.header.time > inner.stats.time(height - 1) + 1200
                && block.header.target_bits == self.params.max_target_bits;
            if !min_difficulty_ok {
                return Err(BlockValidationError::BadTargetBits {
                    block: hash,
                    expected: expected_bits,
                    actual: block.header.target_bits,
                }
                .into());
            }
        }

        if !block.header.has_proof_of_work() {
            return Err(BlockValidationError::NotEnoughPow { block: hash }.into());
        }

        let subsidy = coinbase_subsidy(height, self.params.halving_interval);
        let bip30_exception = self.params.bip30_exceptions.contains(&hash);
        if let Err(error) =
            block.process(&self.utxos, height, &inner.forks, subsidy, bip30_exception)
        {
            self.utxos.revert_tentative();
            return Err(error.into());
        }

        self.utxos.commit(height);

        if let Err(error) = self.store.add_block(height, block) {
            // Storage must not advance the chain: take the commit back
            self.utxos.revert_block(&block.transactions, height);
            return Err(error);
        }

        self.index.insert(hash, height);
        inner.stats.add(
            block.header.version,
            block.header.time,
            block.header.target_bits,
        );
        let stats_height = height;
        let (stats, forks) = {
            let inner = &mut *inner;
            (&inner.stats, &mut inner.forks)
        };
        forks.process(stats, stats_height, &self.params);

        inner.next_height = height + 1;
        inner.last_block_hash = hash;
        inner.current_target_bits =
            required_target_bits(&self.params, &inner.stats, height + 1);

        info!(
            "new tip: hash={hash} height={height} tx_count={}",
            block.transactions.len()
        );
        Ok(height)
    }

    fn notify(&self, block: &Block, height: u32) {
        let subscribers: Vec<Arc<dyn BlockConsumer>> =
            self.inner.read().subscribers.clone();
        for subscriber in subscribers {
            subscriber.consume_block(block, height);
        }
    }

    /// If a branch holds more accumulated work than the main chain,
    /// revert to its fork point, park the orphaned main suffix (plus the
    /// now moot pending queue) as a branch of its own, and promote the
    /// winner's blocks into the pending queue. Returns whether a switch
    /// happened; the caller then drains the queue.
    fn promote_best_branch(&self) -> Result<bool, BlockchainError> {
        let winner = {
            let inner = self.inner.read();
            let main_work = inner.stats.chain_work();
            inner
                .branches
                .iter()
                .enumerate()
                .filter(|(_, branch)| branch.accumulated_work > main_work)
                .max_by_key(|(_, branch)| branch.accumulated_work)
                .map(|(position, _)| position)
        };
        let Some(position) = winner else {
            return Ok(false);
        };

        let branch = self.inner.write().branches.remove(position);
        let fork_height = branch.height - 1;
        info!(
            "branch at height {} out-works the main chain, reorganizing",
            branch.height
        );

        // Capture the suffix being orphaned before the files truncate
        let tip_height = self.inner.read().tip_height();
        let mut orphaned = Vec::new();
        for height in branch.height..=tip_height {
            orphaned.push(self.store.read_block(height)?);
        }

        self.revert_to(fork_height)?;

        let mut inner = self.inner.write();
        let mut old_main = Branch::new(fork_height, inner.stats.accumulated_work(fork_height));
        for block in orphaned {
            old_main.add_block(block);
        }

        let mut pending = self.pending.write();
        // Anything that was pending extended the orphaned tip
        for entry in pending.queue.drain(..) {
            old_main.pending.push(entry);
        }
        if !old_main.pending.is_empty() {
            inner.branches.push(old_main);
        }

        pending.clear(inner.stats.chain_work());
        for entry in branch.pending {
            pending.accumulated_work = pending
                .accumulated_work
                .wrapping_add(entry.block.header.work());
            pending.last_pending_hash = Some(entry.block.block_hash());
            pending.total_size += entry.size();
            if entry.is_full() {
                pending.full_count += 1;
            }
            pending.queue.push_back(entry);
        }

        Ok(true)
    }

    fn prune_stale_branches(&self) {
        let mut inner = self.inner.write();
        let horizon = inner
            .next_height
            .saturating_sub(self.params.branch_depth_limit);
        let before = inner.branches.len();
        inner
            .branches
            .retain(|branch| branch.tip_height() + 1 > horizon);
        let dropped = before - inner.branches.len();
        if dropped > 0 {
            info!("pruned {dropped} stale branches");
        }
    }

    /// Undo the main chain down to `height`: UTXO set first, then fork
    /// state, then stats, then the target, with the block files
    /// truncated to match.
    pub fn revert(&self, height: u32) -> Result<(), BlockchainError> {
        let _guard = self.process_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.revert_to(height)
    }

    fn revert_to(&self, height: u32) -> Result<(), BlockchainError> {
        let mut inner = self.inner.write();
        let tip = inner.tip_height();
        if height >= tip {
            return Ok(());
        }
        info!("reverting main chain from {tip} to {height}");

        for h in ((height + 1)..=tip).rev() {
            if self.stop.load(Ordering::Relaxed) {
                return Err(BlockchainError::Cancelled);
            }
            let block = self.store.read_block(h)?;
            self.utxos.revert_block(&block.transactions, h);
        }
        inner.forks.revert(height, &self.params);
        inner.stats.revert_to(height);
        inner.next_height = height + 1;
        inner.current_target_bits =
            required_target_bits(&self.params, &inner.stats, height + 1);

        self.index.truncate_to(height);
        self.store.remove_blocks_above(height)?;
        inner.last_block_hash = self
            .index
            .hash_at(height)
            .ok_or(BlockchainError::BlockNotFound)?;
        Ok(())
    }

    // ---- queries -------------------------------------------------------

    pub fn height(&self) -> u32 {
        self.inner.read().tip_height()
    }

    pub fn last_block_hash(&self) -> Hash256 {
        self.inner.read().last_block_hash
    }

    pub fn current_target_bits(&self) -> u32 {
        self.inner.read().current_target_bits
    }

    pub fn accumulated_work(&self) -> Uint256 {
        self.inner.read().stats.chain_work()
    }

    pub fn pending_accumulated_work(&self) -> Uint256 {
        let tip_work = self.accumulated_work();
        let pending = self.pending.read();
        if pending.queue.is_empty() {
            tip_work
        } else {
            pending.accumulated_work
        }
    }

    pub fn utxo_height(&self) -> u32 {
        self.utxos.height()
    }

    pub fn outputs(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn block_in_chain(&self, hash: &Hash256) -> bool {
        self.index.contains(hash)
    }

    /// Whether we already have this header anywhere: chain or pending.
    pub fn header_available(&self, hash: &Hash256) -> bool {
        if self.index.contains(hash) {
            return true;
        }
        self.pending.read().position_of(hash).is_some()
    }

    pub fn header_in_branch(&self, hash: &Hash256) -> bool {
        self.inner
            .read()
            .branches
            .iter()
            .any(|branch| branch.contains(hash))
    }

    pub fn branch_count(&self) -> usize {
        self.inner.read().branches.len()
    }

    /// Height for a hash: on the chain, or implied by queue position.
    pub fn block_height(&self, hash: &Hash256) -> Option<u32> {
        if let Some(height) = self.index.height_of(hash) {
            return Some(height);
        }
        let next_height = self.inner.read().next_height;
        let position = self.pending.read().position_of(hash)?;
        Some(next_height + position as u32)
    }

    pub fn get_block(&self, height: u32) -> Result<Block, BlockchainError> {
        self.store.read_block(height)
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Block, BlockchainError> {
        let height = self
            .index
            .height_of(hash)
            .ok_or(BlockchainError::BlockNotFound)?;
        self.store.read_block(height)
    }

    pub fn get_header(&self, height: u32) -> Result<BlockHeader, BlockchainError> {
        self.store.read_header(height)
    }

    pub fn get_block_hash(&self, height: u32) -> Option<Hash256> {
        self.index.hash_at(height)
    }

    /// Up to `count` block hashes starting at `start` (the tip of the
    /// requester's knowledge), oldest first. An all-zero start begins at
    /// the genesis block.
    pub fn get_block_hashes(&self, start: &Hash256, count: usize) -> Vec<Hash256> {
        let first = if start.is_zero() {
            0
        } else {
            match self.index.height_of(start) {
                Some(height) => height,
                None => return Vec::new(),
            }
        };
        let top = self.inner.read().tip_height();
        (first..=top)
            .take(count)
            .filter_map(|height| self.index.hash_at(height))
            .collect()
    }

    /// Headers from `start` up to `stop` or `count`, whichever is first.
    pub fn get_block_headers(
        &self,
        start: &Hash256,
        stop: &Hash256,
        count: usize,
    ) -> Result<Vec<BlockHeader>, BlockchainError> {
        let Some(first) = self.index.height_of(start) else {
            return Ok(Vec::new());
        };
        let top = self.inner.read().tip_height();
        let mut headers = Vec::new();
        for height in first..=top {
            if headers.len() >= count {
                break;
            }
            let header = self.store.read_header(height)?;
            headers.push(header);
            if header.block_hash() == *stop {
                break;
            }
        }
        Ok(headers)
    }

    /// Coarse reverse locator: the last hash of each full block file,
    /// newest first.
    pub fn get_reverse_block_hashes(&self, count: usize) -> Vec<Hash256> {
        let tip = self.inner.read().tip_height();
        let last_file = tip / MAX_BLOCKS_PER_FILE;
        self.store.reverse_hashes(last_file, count)
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn subscribe(&self, subscriber: Arc<dyn BlockConsumer>) {
        self.inner.write().subscribers.push(subscriber);
    }

    pub fn is_in_sync(&self) -> bool {
        self.inner.read().is_in_sync
    }

    pub fn set_in_sync(&self, in_sync: bool) {
        self.inner.write().is_in_sync = in_sync;
    }

    /// Nodes that fed us invalid blocks since the last call. Draining
    /// them is the caller's cue to drop those connections.
    pub fn take_black_listed_nodes(&self) -> Vec<u32> {
        std::mem::take(&mut self.inner.write().black_listed_nodes)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Persist everything that isn't already durable: pending queue,
    /// stats, fork state and dirty UTXO shards.
    pub fn save(&self) -> Result<(), BlockchainError> {
        self.save_pending()?;
        {
            let inner = self.inner.read();
            inner.stats.save(&self.data_dir.join("stats/state"))?;
            inner.forks.save(&self.data_dir.join("forks/state"))?;
        }
        self.utxos.save()
    }

    fn save_pending(&self) -> Result<(), BlockchainError> {
        let pending = self.pending.read();
        let path = self.data_dir.join("pending");
        if pending.queue.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in pending.queue.iter() {
            entry.block.write(&mut buf)?;
        }
        std::fs::write(path, buf)?;
        info!(
            "saved {} pending blocks/headers",
            pending.queue.len()
        );
        Ok(())
    }

    fn load_pending(&self) -> Result<(), BlockchainError> {
        let path = self.data_dir.join("pending");
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        let mut reader = bytes.as_slice();

        let tip_work = self.inner.read().stats.chain_work();
        let mut pending = self.pending.write();
        pending.clear(tip_work);
        while !reader.is_empty() {
            let Ok(block) = Block::read(&mut reader) else {
                warn!("pending file is damaged, discarding the rest");
                pending.clear(tip_work);
                return Ok(());
            };
            pending.accumulated_work = pending
                .accumulated_work
                .wrapping_add(block.header.work());
            pending.last_pending_hash = Some(block.block_hash());
            pending.total_size += block.serialized_size();
            if !block.is_header_only() {
                pending.full_count += 1;
            }
            pending.queue.push_back(PendingBlockData::new(block));
        }
        info!("loaded {} pending blocks/headers", pending.queue.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn block_index_round_trip() {
        let index = BlockIndex::new();
        let hashes: Vec<Hash256> = (0..5u8)
            .map(|tag| cerrado_common::double_sha256(&[tag]))
            .collect();
        for (height, hash) in hashes.iter().enumerate() {
            index.insert(*hash, height as u32);
        }

        assert_eq!(index.len(), 5);
        assert_eq!(index.height_of(&hashes[3]), Some(3));
        assert_eq!(index.hash_at(4), Some(hashes[4]));
        assert_eq!(index.file_id_of(&hashes[2]), Some(0));
        assert!(!index.contains(&cerrado_common::double_sha256(b"absent")));

        index.truncate_to(1);
        assert_eq!(index.len(), 2);
        assert!(!index.contains(&hashes[3]));
        assert_eq!(index.height_of(&hashes[1]), Some(1));
    }

    #[test]
    fn branch_work_accumulates() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 0,
            target_bits: 0x207fffff,
            nonce: 0,
        };
        let mut branch = Branch::new(9, Uint256::from_u64(1000));
        branch.add_block(Block::from_header(header));
        assert_eq!(branch.height, 10);
        assert_eq!(branch.tip_height(), 10);
        assert!(branch.accumulated_work > Uint256::from_u64(1000));
    }
}
