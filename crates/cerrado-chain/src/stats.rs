//! Per-height block statistics: the (version, time, bits) triples the
//! fork logic and difficulty algorithms read, plus cumulative work for
//! comparing chain strength.

use std::io::Read;
use std::io::Write;
use std::path::Path;

use cerrado_common::Hash256;

use crate::error::BlockchainError;
use crate::error::WireError;
use crate::target::Uint256;
use crate::wire::*;

/// Window for the median-past-time rule: this many trailing blocks.
pub const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub version: i32,
    pub time: u32,
    pub target_bits: u32,
    /// Sum of per-block work up to and including this height.
    pub accumulated_work: Uint256,
}

/// Append-only vector of per-height stats, indexed by block height.
#[derive(Debug, Default)]
pub struct BlockStats {
    stats: Vec<BlockStat>,
}

impl Writable for BlockStat {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.time.to_le_bytes())?;
        writer.write_all(&self.target_bits.to_le_bytes())?;
        writer.write_all(&self.accumulated_work.to_le_bytes())
    }
}

impl Readable for BlockStat {
    fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        Ok(BlockStat {
            version: read_i32(reader)?,
            time: read_u32(reader)?,
            target_bits: read_u32(reader)?,
            accumulated_work: Uint256::from_hash(&Hash256::read(reader)?),
        })
    }
}

impl BlockStats {
    pub fn new() -> Self {
        BlockStats { stats: Vec::new() }
    }

    /// Height of the newest recorded block, `None` while empty.
    pub fn height(&self) -> Option<u32> {
        (!self.stats.is_empty()).then(|| self.stats.len() as u32 - 1)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn get(&self, height: u32) -> Option<&BlockStat> {
        self.stats.get(height as usize)
    }

    pub fn time(&self, height: u32) -> u32 {
        self.get(height).map(|s| s.time).unwrap_or(0)
    }

    pub fn version(&self, height: u32) -> i32 {
        self.get(height).map(|s| s.version).unwrap_or(0)
    }

    pub fn target_bits(&self, height: u32) -> u32 {
        self.get(height).map(|s| s.target_bits).unwrap_or(0)
    }

    pub fn accumulated_work(&self, height: u32) -> Uint256 {
        self.get(height)
            .map(|s| s.accumulated_work)
            .unwrap_or(Uint256::ZERO)
    }

    /// Work on the chain tip.
    pub fn chain_work(&self) -> Uint256 {
        self.stats
            .last()
            .map(|s| s.accumulated_work)
            .unwrap_or(Uint256::ZERO)
    }

    /// Record the next block's stats; heights are implicit and strictly
    /// sequential.
    pub fn add(&mut self, version: i32, time: u32, target_bits: u32) {
        let work = Uint256::from_compact(target_bits).work();
        let accumulated = self.chain_work().wrapping_add(work);
        self.stats.push(BlockStat {
            version,
            time,
            target_bits,
            accumulated_work: accumulated,
        });
    }

    /// Drop all stats above `height`.
    pub fn revert_to(&mut self, height: u32) {
        self.stats.truncate(height as usize + 1);
    }

    /// Median of the timestamps of the last eleven blocks ending at
    /// `height`. With fewer blocks available the window shrinks.
    pub fn median_past_time(&self, height: u32) -> u32 {
        let end = height as usize;
        if end >= self.stats.len() {
            return 0;
        }
        let start = (end + 1).saturating_sub(MEDIAN_TIME_SPAN);
        let mut times: Vec<u32> = self.stats[start..=end].iter().map(|s| s.time).collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Of the three consecutive blocks ending at `height`, pick the one
    /// with the median timestamp. The replacement difficulty algorithm
    /// anchors both ends of its window this way.
    pub fn suitable_block(&self, height: u32) -> (u32, Uint256) {
        let end = height as usize;
        debug_assert!(end >= 2 && end < self.stats.len());
        let mut window = [
            &self.stats[end - 2],
            &self.stats[end - 1],
            &self.stats[end],
        ];
        window.sort_by_key(|s| s.time);
        let median = window[1];
        (median.time, median.accumulated_work)
    }

    pub fn save(&self, path: &Path) -> Result<(), BlockchainError> {
        let mut buf = Vec::with_capacity(self.stats.len() * 44 + 4);
        buf.extend_from_slice(&(self.stats.len() as u32).to_le_bytes());
        for stat in self.stats.iter() {
            stat.write(&mut buf)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, buf)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BlockchainError> {
        if !path.exists() {
            return Ok(BlockStats::new());
        }
        let bytes = std::fs::read(path)?;
        let mut reader = bytes.as_slice();
        let count = read_u32(&mut reader)?;
        let mut stats = Vec::with_capacity(count.min(1 << 24) as usize);
        for _ in 0..count {
            stats.push(BlockStat::read(&mut reader)?);
        }
        Ok(BlockStats { stats })
    }
}

impl Writable for Uint256 {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
}
