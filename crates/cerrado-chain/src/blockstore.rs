//! Append-only block files. Each file holds up to [MAX_BLOCKS_PER_FILE]
//! blocks: a fixed header carrying a magic, a version and a checksum,
//! then a table of contents of (hash, offset) pairs, then the block
//! bodies. The checksum covers the table region so a torn write is
//! caught on the next startup and the damaged tail dropped.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use cerrado_common::Hash256;
use log::info;
use log::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::block::Block;
use crate::block::BlockHeader;
use crate::error::BlockchainError;
use crate::wire::Readable;
use crate::wire::Writable;

/// Blocks per file; height maps to `(height / 100, height % 100)`.
pub const MAX_BLOCKS_PER_FILE: u32 = 100;

/// "cblk" backwards, so hex dumps on little-endian machines read right.
const BLOCK_FILE_MAGIC: u32 = 0x6b_6c_62_63;

const BLOCK_FILE_VERSION: u32 = 0;

/// magic + version + checksum + count
const FILE_HEADER_SIZE: u64 = 20;
/// hash + data offset
const TOC_ENTRY_SIZE: u64 = 36;
const TOC_SIZE: u64 = TOC_ENTRY_SIZE * MAX_BLOCKS_PER_FILE as u64;
const DATA_START: u64 = FILE_HEADER_SIZE + TOC_SIZE;

/// Independent mutexes guarding file access, keyed by file id.
const FILE_LOCKS: usize = 64;

fn io_error(kind: std::io::ErrorKind, message: String) -> BlockchainError {
    BlockchainError::Storage(std::io::Error::new(kind, message))
}

/// One block file: its id and in-memory table of contents.
pub struct BlockFile {
    id: u32,
    path: PathBuf,
    toc: Vec<(Hash256, u32)>,
}

impl BlockFile {
    /// Create an empty block file with a valid (empty) table.
    pub fn create(id: u32, path: PathBuf) -> Result<Self, BlockchainError> {
        let block_file = BlockFile {
            id,
            path,
            toc: Vec::new(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&block_file.path)?;
        block_file.write_header_and_toc(&mut file)?;
        file.set_len(DATA_START)?;
        Ok(block_file)
    }

    /// Open and verify an existing block file.
    pub fn open(id: u32, path: PathBuf) -> Result<Self, BlockchainError> {
        let mut file = File::open(&path)?;
        let mut fixed = [0u8; FILE_HEADER_SIZE as usize];
        file.read_exact(&mut fixed)?;

        let magic = u32::from_le_bytes(fixed[0..4].try_into().expect("sized"));
        let version = u32::from_le_bytes(fixed[4..8].try_into().expect("sized"));
        let checksum = u64::from_le_bytes(fixed[8..16].try_into().expect("sized"));
        let count = u32::from_le_bytes(fixed[16..20].try_into().expect("sized"));

        if magic != BLOCK_FILE_MAGIC {
            return Err(io_error(
                std::io::ErrorKind::InvalidData,
                format!("block file {id:08x} has a bad magic"),
            ));
        }
        if version != BLOCK_FILE_VERSION || count > MAX_BLOCKS_PER_FILE {
            return Err(io_error(
                std::io::ErrorKind::InvalidData,
                format!("block file {id:08x} has a bad header"),
            ));
        }

        let mut toc_bytes = vec![0u8; TOC_SIZE as usize];
        file.read_exact(&mut toc_bytes)?;
        if xxh3_64(&toc_bytes) != checksum {
            return Err(io_error(
                std::io::ErrorKind::InvalidData,
                format!("block file {id:08x} failed its checksum"),
            ));
        }

        let mut toc = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let entry = &toc_bytes[i * TOC_ENTRY_SIZE as usize..];
            let hash = Hash256::from_slice(&entry[..32]).expect("sized");
            let offset = u32::from_le_bytes(entry[32..36].try_into().expect("sized"));
            toc.push((hash, offset));
        }

        Ok(BlockFile { id, path, toc })
    }

    pub fn block_count(&self) -> u32 {
        self.toc.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.block_count() >= MAX_BLOCKS_PER_FILE
    }

    pub fn hashes(&self) -> Vec<Hash256> {
        self.toc.iter().map(|(hash, _)| *hash).collect()
    }

    pub fn last_hash(&self) -> Option<Hash256> {
        self.toc.last().map(|(hash, _)| *hash)
    }

    pub fn hash_at(&self, index: u32) -> Option<Hash256> {
        self.toc.get(index as usize).map(|(hash, _)| *hash)
    }

    /// Append a block. Returns false when the file is already full.
    pub fn add_block(&mut self, block: &Block) -> Result<bool, BlockchainError> {
        if self.is_full() {
            return Ok(false);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let body = block.serialize();
        file.write_all(&body)?;

        self.toc.push((block.block_hash(), offset as u32));
        self.write_header_and_toc(&mut file)?;
        file.sync_data()?;
        Ok(true)
    }

    /// Read the block at `index`; header-only when `with_txs` is false.
    pub fn read_block(&self, index: u32, with_txs: bool) -> Result<Block, BlockchainError> {
        let (_, offset) = *self
            .toc
            .get(index as usize)
            .ok_or(BlockchainError::BlockNotFound)?;
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(offset as u64))?;
        if with_txs {
            Ok(Block::read(&mut reader).map_err(BlockchainError::WireFormat)?)
        } else {
            let header = BlockHeader::read(&mut reader).map_err(BlockchainError::WireFormat)?;
            Ok(Block::from_header(header))
        }
    }

    /// Drop every block at `index` and above, truncating the data region.
    pub fn remove_blocks_above(&mut self, index: u32) -> Result<(), BlockchainError> {
        if index as usize >= self.toc.len() {
            return Ok(());
        }
        let offset = self.toc[index as usize].1 as u64;
        self.toc.truncate(index as usize);

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(offset)?;
        self.write_header_and_toc(&mut file)?;
        file.sync_data()?;
        Ok(())
    }

    fn write_header_and_toc(&self, file: &mut File) -> Result<(), BlockchainError> {
        let mut toc_bytes = vec![0u8; TOC_SIZE as usize];
        for (i, (hash, offset)) in self.toc.iter().enumerate() {
            let entry = &mut toc_bytes[i * TOC_ENTRY_SIZE as usize..];
            entry[..32].copy_from_slice(hash.as_bytes());
            entry[32..36].copy_from_slice(&offset.to_le_bytes());
        }

        let mut fixed = [0u8; FILE_HEADER_SIZE as usize];
        fixed[0..4].copy_from_slice(&BLOCK_FILE_MAGIC.to_le_bytes());
        fixed[4..8].copy_from_slice(&BLOCK_FILE_VERSION.to_le_bytes());
        fixed[8..16].copy_from_slice(&xxh3_64(&toc_bytes).to_le_bytes());
        fixed[16..20].copy_from_slice(&(self.toc.len() as u32).to_le_bytes());

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&fixed)?;
        file.write_all(&toc_bytes)?;
        Ok(())
    }
}

/// The store: block files under one directory, addressed by height.
pub struct BlockStore {
    dir: PathBuf,
    locks: Vec<Mutex<()>>,
}

impl BlockStore {
    pub fn new(dir: &Path) -> Result<Self, BlockchainError> {
        fs::create_dir_all(dir)?;
        Ok(BlockStore {
            dir: dir.to_path_buf(),
            locks: (0..FILE_LOCKS).map(|_| Mutex::new(())).collect(),
        })
    }

    fn lock_file(&self, file_id: u32) -> MutexGuard<'_, ()> {
        let lock = &self.locks[file_id as usize % FILE_LOCKS];
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{file_id:08x}"))
    }

    fn split_height(height: u32) -> (u32, u32) {
        (height / MAX_BLOCKS_PER_FILE, height % MAX_BLOCKS_PER_FILE)
    }

    /// Scan files in ascending id order and return every stored block
    /// hash. A file that fails verification is removed along with any
    /// later files; the chain rebuilds from the shortened corpus.
    pub fn load(&self) -> Result<Vec<Hash256>, BlockchainError> {
        let mut hashes = Vec::new();
        let mut file_id = 0u32;
        loop {
            let path = self.file_path(file_id);
            if !path.exists() {
                break;
            }
            let _guard = self.lock_file(file_id);
            match BlockFile::open(file_id, path.clone()) {
                Ok(file) => {
                    let count = file.block_count();
                    hashes.extend(file.hashes());
                    if count < MAX_BLOCKS_PER_FILE {
                        // A short file must be the last one
                        break;
                    }
                }
                Err(error) => {
                    warn!("dropping block file {file_id:08x} and later: {error}");
                    drop(_guard);
                    self.remove_files_from(file_id)?;
                    break;
                }
            }
            file_id += 1;
        }
        info!("block store holds {} blocks", hashes.len());
        Ok(hashes)
    }

    /// Append the block for `height`. Heights must arrive in order.
    pub fn add_block(&self, height: u32, block: &Block) -> Result<(), BlockchainError> {
        let (file_id, index) = Self::split_height(height);
        let _guard = self.lock_file(file_id);

        let path = self.file_path(file_id);
        let mut file = if path.exists() {
            BlockFile::open(file_id, path)?
        } else {
            info!("starting block file {file_id:08x}");
            BlockFile::create(file_id, path)?
        };

        if file.block_count() != index {
            return Err(io_error(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "block file {file_id:08x} holds {} blocks, expected {index}",
                    file.block_count()
                ),
            ));
        }
        if !file.add_block(block)? {
            return Err(io_error(
                std::io::ErrorKind::Other,
                format!("block file {file_id:08x} is full"),
            ));
        }
        Ok(())
    }

    pub fn read_block(&self, height: u32) -> Result<Block, BlockchainError> {
        let (file_id, index) = Self::split_height(height);
        let _guard = self.lock_file(file_id);
        BlockFile::open(file_id, self.file_path(file_id))?.read_block(index, true)
    }

    pub fn read_header(&self, height: u32) -> Result<BlockHeader, BlockchainError> {
        let (file_id, index) = Self::split_height(height);
        let _guard = self.lock_file(file_id);
        Ok(BlockFile::open(file_id, self.file_path(file_id))?
            .read_block(index, false)?
            .header)
    }

    pub fn hash_at(&self, height: u32) -> Result<Hash256, BlockchainError> {
        let (file_id, index) = Self::split_height(height);
        let _guard = self.lock_file(file_id);
        BlockFile::open(file_id, self.file_path(file_id))?
            .hash_at(index)
            .ok_or(BlockchainError::BlockNotFound)
    }

    /// All hashes in one file, lowest height first.
    pub fn file_hashes(&self, file_id: u32) -> Result<Vec<Hash256>, BlockchainError> {
        let path = self.file_path(file_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock_file(file_id);
        Ok(BlockFile::open(file_id, path)?.hashes())
    }

    /// The last hash of each file from `last_file_id` downwards, the
    /// newest file excluded; used for coarse reverse locators.
    pub fn reverse_hashes(&self, last_file_id: u32, count: usize) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(count);
        let mut file_id = last_file_id;
        while file_id > 0 && hashes.len() < count {
            file_id -= 1;
            let _guard = self.lock_file(file_id);
            if let Ok(file) = BlockFile::open(file_id, self.file_path(file_id)) {
                if let Some(hash) = file.last_hash() {
                    hashes.push(hash);
                }
            }
        }
        hashes
    }

    /// Remove every stored block above `height`.
    pub fn remove_blocks_above(&self, height: u32) -> Result<(), BlockchainError> {
        let (file_id, index) = Self::split_height(height + 1);
        {
            let _guard = self.lock_file(file_id);
            let path = self.file_path(file_id);
            if path.exists() {
                BlockFile::open(file_id, path)?.remove_blocks_above(index)?;
            }
        }
        self.remove_files_from(file_id + 1)
    }

    fn remove_files_from(&self, first_id: u32) -> Result<(), BlockchainError> {
        let mut file_id = first_id;
        loop {
            let path = self.file_path(file_id);
            if !path.exists() {
                return Ok(());
            }
            let _guard = self.lock_file(file_id);
            fs::remove_file(path)?;
            file_id += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chainparams::genesis_block;
    use crate::chainparams::Network;
    use crate::transaction::OutPoint;
    use crate::transaction::TxInput;

    /// Distinct dummy blocks; contents only need to round-trip.
    fn dummy_block(tag: u32) -> Block {
        let mut block = genesis_block(Network::Mainnet);
        block.transactions[0].inputs[0] = TxInput {
            outpoint: OutPoint::coinbase(),
            script: tag.to_le_bytes().to_vec(),
            sequence: 0xffff_ffff,
        };
        block.header.merkle_root = block.transactions[0].txid();
        block
    }

    #[test]
    fn add_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();

        for height in 0..5u32 {
            store.add_block(height, &dummy_block(height)).unwrap();
        }

        let block = store.read_block(3).unwrap();
        assert_eq!(block, dummy_block(3));
        assert_eq!(store.hash_at(3).unwrap(), dummy_block(3).block_hash());

        let header_only = store.read_header(2).unwrap();
        assert_eq!(header_only, dummy_block(2).header);

        assert_eq!(store.load().unwrap().len(), 5);
    }

    #[test]
    fn out_of_order_heights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        store.add_block(0, &dummy_block(0)).unwrap();
        assert!(store.add_block(2, &dummy_block(2)).is_err());
    }

    #[test]
    fn remove_blocks_above_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        for height in 0..10u32 {
            store.add_block(height, &dummy_block(height)).unwrap();
        }

        store.remove_blocks_above(6).unwrap();
        assert_eq!(store.load().unwrap().len(), 7);
        assert!(store.read_block(7).is_err());
        assert_eq!(store.hash_at(6).unwrap(), dummy_block(6).block_hash());

        // The file accepts appends again at the truncated height
        store.add_block(7, &dummy_block(77)).unwrap();
        assert_eq!(store.hash_at(7).unwrap(), dummy_block(77).block_hash());
    }

    #[test]
    fn corrupt_toc_is_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        for height in 0..3u32 {
            store.add_block(height, &dummy_block(height)).unwrap();
        }

        // Flip a byte inside the table region
        let path = dir.path().join("00000000");
        let mut bytes = fs::read(&path).unwrap();
        bytes[FILE_HEADER_SIZE as usize + 5] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert_eq!(store.load().unwrap().len(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn blocks_spill_into_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::new(dir.path()).unwrap();
        for height in 0..MAX_BLOCKS_PER_FILE + 2 {
            store.add_block(height, &dummy_block(height)).unwrap();
        }
        assert!(dir.path().join("00000001").exists());
        assert_eq!(
            store.load().unwrap().len() as u32,
            MAX_BLOCKS_PER_FILE + 2
        );
        assert_eq!(
            store.hash_at(MAX_BLOCKS_PER_FILE + 1).unwrap(),
            dummy_block(MAX_BLOCKS_PER_FILE + 1).block_hash()
        );

        // Reverse hashes walk the full files below the newest
        let reverse = store.reverse_hashes(1, 10);
        assert_eq!(reverse, vec![dummy_block(99).block_hash()]);
    }
}
