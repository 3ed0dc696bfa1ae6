//! Soft-fork activation tracking: version-threshold upgrades (BIP-34,
//! BIP-66, BIP-65), the version-bits deployment covering BIP-68/112/113,
//! and the hard-fork cash activation height.

use std::io::Read;
use std::io::Write;
use std::path::Path;

use log::info;

use crate::chainparams::ChainParams;
use crate::error::BlockchainError;
use crate::error::WireError;
use crate::stats::BlockStats;
use crate::wire::*;

/// Window over which block versions are counted.
const VERSION_WINDOW: usize = 1000;
/// Versions seen in this many of the window's blocks activate the rule.
const VERSION_ACTIVATE: usize = 750;
/// Versions seen in this many of the window's blocks become mandatory.
const VERSION_REQUIRE: usize = 950;

/// Version-bits window length, one retarget period.
const BIT_WINDOW: u32 = 2016;
/// Blocks in a window that must signal for lock-in.
const BIT_THRESHOLD: u32 = 1916;

/// Top bits marking a version-bits signalling block.
const VERSION_BITS_MASK: i32 = 0xe000_0000u32 as i32;
const VERSION_BITS_TAG: i32 = 0x2000_0000;

/// The "csv" deployment: bit 0, BIP-68 + BIP-112 + BIP-113 together.
const CSV_BIT: i32 = 1;
const CSV_START_TIME: u32 = 1_462_060_800; // May 1st 2016
const CSV_TIMEOUT: u32 = 1_493_596_800; // May 1st 2017

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftForkState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl SoftForkState {
    fn to_byte(self) -> u8 {
        match self {
            SoftForkState::Defined => 0,
            SoftForkState::Started => 1,
            SoftForkState::LockedIn => 2,
            SoftForkState::Active => 3,
            SoftForkState::Failed => 4,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WireError> {
        Ok(match byte {
            0 => SoftForkState::Defined,
            1 => SoftForkState::Started,
            2 => SoftForkState::LockedIn,
            3 => SoftForkState::Active,
            4 => SoftForkState::Failed,
            _ => return Err(WireError::InvalidValue("soft fork state")),
        })
    }
}

/// A change of activation state, kept so reverts can walk backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionEvent {
    height: u32,
    enabled_version: u32,
    required_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CsvEvent {
    height: u32,
    state: SoftForkState,
}

#[derive(Debug)]
pub struct Forks {
    /// Highest block version whose rules are active. Starts at 1,
    /// reaches 2 (BIP-34), 3 (BIP-66) and 4 (BIP-65).
    enabled_version: u32,
    /// Blocks below this version are no longer accepted.
    required_version: u32,
    version_events: Vec<VersionEvent>,

    csv_state: SoftForkState,
    csv_events: Vec<CsvEvent>,

    cash_active: bool,
}

impl Default for Forks {
    fn default() -> Self {
        Self::new()
    }
}

impl Forks {
    pub fn new() -> Self {
        Forks {
            enabled_version: 1,
            required_version: 1,
            version_events: Vec::new(),
            csv_state: SoftForkState::Defined,
            csv_events: Vec::new(),
            cash_active: false,
        }
    }

    pub fn enabled_version(&self) -> u32 {
        self.enabled_version
    }

    pub fn required_version(&self) -> u32 {
        self.required_version
    }

    pub fn bip34_active(&self) -> bool {
        self.enabled_version >= 2
    }

    pub fn bip66_active(&self) -> bool {
        self.enabled_version >= 3
    }

    pub fn bip65_active(&self) -> bool {
        self.enabled_version >= 4
    }

    /// BIP-112 (and its siblings 68 and 113) share one deployment.
    pub fn bip112_active(&self) -> bool {
        self.csv_state == SoftForkState::Active
    }

    pub fn csv_state(&self) -> SoftForkState {
        self.csv_state
    }

    pub fn cash_active(&self) -> bool {
        self.cash_active
    }

    /// Advance fork state for the block just recorded at `height`.
    /// `stats` must already include that block.
    pub fn process(&mut self, stats: &BlockStats, height: u32, params: &ChainParams) {
        self.update_version_thresholds(stats, height);
        self.update_csv(stats, height);

        if !self.cash_active && height >= params.cash_activation_height {
            info!("cash rules active at height {height}");
            self.cash_active = true;
        }
    }

    fn update_version_thresholds(&mut self, stats: &BlockStats, height: u32) {
        let end = height as usize;
        let start = (end + 1).saturating_sub(VERSION_WINDOW);

        let mut version2_or_higher = 0usize;
        let mut version3_or_higher = 0usize;
        let mut version4_or_higher = 0usize;
        for h in start..=end {
            let version = stats.version(h as u32);
            if version >= 4 {
                version4_or_higher += 1;
            }
            if version >= 3 {
                version3_or_higher += 1;
            }
            if version >= 2 {
                version2_or_higher += 1;
            }
        }

        let mut enabled = self.enabled_version;
        let mut required = self.required_version;
        for (version, count) in [
            (2u32, version2_or_higher),
            (3, version3_or_higher),
            (4, version4_or_higher),
        ] {
            if count >= VERSION_ACTIVATE && enabled < version {
                enabled = version;
            }
            if count >= VERSION_REQUIRE && required < version {
                required = version;
            }
        }

        if enabled != self.enabled_version || required != self.required_version {
            info!(
                "block version thresholds at height {height}: enabled {enabled}, required {required}"
            );
            self.version_events.push(VersionEvent {
                height,
                enabled_version: self.enabled_version,
                required_version: self.required_version,
            });
            self.enabled_version = enabled;
            self.required_version = required;
        }
    }

    fn update_csv(&mut self, stats: &BlockStats, height: u32) {
        // State machine steps once per window, at its final block
        if (height + 1) % BIT_WINDOW != 0 {
            return;
        }

        let median_time = stats.median_past_time(height);
        let next = match self.csv_state {
            SoftForkState::Defined => {
                if median_time >= CSV_TIMEOUT {
                    SoftForkState::Failed
                } else if median_time >= CSV_START_TIME {
                    SoftForkState::Started
                } else {
                    return;
                }
            }
            SoftForkState::Started => {
                let start = height + 1 - BIT_WINDOW;
                let mut signalling = 0u32;
                for h in start..=height {
                    let version = stats.version(h);
                    if version & VERSION_BITS_MASK == VERSION_BITS_TAG && version & CSV_BIT != 0 {
                        signalling += 1;
                    }
                }
                if signalling >= BIT_THRESHOLD {
                    SoftForkState::LockedIn
                } else if median_time >= CSV_TIMEOUT {
                    SoftForkState::Failed
                } else {
                    return;
                }
            }
            SoftForkState::LockedIn => SoftForkState::Active,
            SoftForkState::Active | SoftForkState::Failed => return,
        };

        info!("csv deployment {next:?} at height {height}");
        self.csv_events.push(CsvEvent {
            height,
            state: self.csv_state,
        });
        self.csv_state = next;
    }

    /// Roll activation state back to what it was at `height`.
    pub fn revert(&mut self, height: u32, params: &ChainParams) {
        while let Some(event) = self.version_events.last().copied() {
            if event.height <= height {
                break;
            }
            self.enabled_version = event.enabled_version;
            self.required_version = event.required_version;
            self.version_events.pop();
        }
        while let Some(event) = self.csv_events.last().copied() {
            if event.height <= height {
                break;
            }
            self.csv_state = event.state;
            self.csv_events.pop();
        }
        self.cash_active = height >= params.cash_activation_height;
    }

    pub fn save(&self, path: &Path) -> Result<(), BlockchainError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.enabled_version.to_le_bytes());
        buf.extend_from_slice(&self.required_version.to_le_bytes());
        buf.push(self.csv_state.to_byte());
        buf.push(self.cash_active as u8);
        write_compact_int(&mut buf, self.version_events.len() as u64)?;
        for event in self.version_events.iter() {
            buf.extend_from_slice(&event.height.to_le_bytes());
            buf.extend_from_slice(&event.enabled_version.to_le_bytes());
            buf.extend_from_slice(&event.required_version.to_le_bytes());
        }
        write_compact_int(&mut buf, self.csv_events.len() as u64)?;
        for event in self.csv_events.iter() {
            buf.extend_from_slice(&event.height.to_le_bytes());
            buf.push(event.state.to_byte());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, buf)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BlockchainError> {
        if !path.exists() {
            return Ok(Forks::new());
        }
        let bytes = std::fs::read(path)?;
        let mut reader = bytes.as_slice();

        let enabled_version = read_u32(&mut reader)?;
        let required_version = read_u32(&mut reader)?;
        let csv_state = SoftForkState::from_byte(read_u8(&mut reader)?)?;
        let cash_active = read_u8(&mut reader)? != 0;

        let count = read_compact_int(&mut reader)?;
        let mut version_events = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            version_events.push(VersionEvent {
                height: read_u32(&mut reader)?,
                enabled_version: read_u32(&mut reader)?,
                required_version: read_u32(&mut reader)?,
            });
        }
        let count = read_compact_int(&mut reader)?;
        let mut csv_events = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            csv_events.push(CsvEvent {
                height: read_u32(&mut reader)?,
                state: SoftForkState::from_byte(read_u8(&mut reader)?)?,
            });
        }

        Ok(Forks {
            enabled_version,
            required_version,
            version_events,
            csv_state,
            csv_events,
            cash_active,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chainparams::Network;

    fn params() -> ChainParams {
        ChainParams::from(Network::Mainnet)
    }

    fn stats_with_versions(versions: &[i32]) -> BlockStats {
        let mut stats = BlockStats::new();
        for (i, version) in versions.iter().enumerate() {
            stats.add(*version, i as u32 * 600, 0x207fffff);
        }
        stats
    }

    #[test]
    fn version_2_activates_at_750_of_1000() {
        let params = params();
        // 749 version-2 blocks in the window: not yet
        let mut versions = vec![1i32; 251];
        versions.extend(vec![2i32; 749]);
        let stats = stats_with_versions(&versions);
        let mut forks = Forks::new();
        forks.process(&stats, 999, &params);
        assert_eq!(forks.enabled_version(), 1);
        assert!(!forks.bip34_active());

        // One more tips it over
        let mut versions = vec![1i32; 250];
        versions.extend(vec![2i32; 750]);
        let stats = stats_with_versions(&versions);
        let mut forks = Forks::new();
        forks.process(&stats, 999, &params);
        assert!(forks.bip34_active());
        assert_eq!(forks.required_version(), 1);
    }

    #[test]
    fn version_required_at_950() {
        let params = params();
        let mut versions = vec![1i32; 50];
        versions.extend(vec![4i32; 950]);
        let stats = stats_with_versions(&versions);
        let mut forks = Forks::new();
        forks.process(&stats, 999, &params);
        assert_eq!(forks.enabled_version(), 4);
        assert_eq!(forks.required_version(), 4);
        assert!(forks.bip65_active());
    }

    #[test]
    fn version_revert_restores_previous_levels() {
        let params = params();
        let mut versions = vec![1i32; 250];
        versions.extend(vec![3i32; 750]);
        let stats = stats_with_versions(&versions);
        let mut forks = Forks::new();
        forks.process(&stats, 999, &params);
        assert!(forks.bip66_active());

        forks.revert(998, &params);
        assert_eq!(forks.enabled_version(), 1);
    }

    #[test]
    fn csv_lifecycle() {
        let params = params();
        let mut forks = Forks::new();

        // A full window of signalling blocks with a started deployment
        let signalling = (VERSION_BITS_TAG | CSV_BIT) as i32;
        let mut stats = BlockStats::new();
        for i in 0..BIT_WINDOW * 3 {
            stats.add(signalling, CSV_START_TIME + i * 600, 0x207fffff);
        }

        forks.process(&stats, BIT_WINDOW - 1, &params);
        assert_eq!(forks.csv_state(), SoftForkState::Started);

        forks.process(&stats, 2 * BIT_WINDOW - 1, &params);
        assert_eq!(forks.csv_state(), SoftForkState::LockedIn);
        assert!(!forks.bip112_active());

        forks.process(&stats, 3 * BIT_WINDOW - 1, &params);
        assert!(forks.bip112_active());

        // Roll back to the middle of the last window
        forks.revert(3 * BIT_WINDOW - 10, &params);
        assert_eq!(forks.csv_state(), SoftForkState::LockedIn);
    }

    #[test]
    fn cash_activation_follows_height() {
        let params = params();
        let stats = stats_with_versions(&[1]);
        let mut forks = Forks::new();
        forks.process(&stats, params.cash_activation_height, &params);
        assert!(forks.cash_active());

        forks.revert(params.cash_activation_height - 1, &params);
        assert!(!forks.cash_active());
    }

    #[test]
    fn save_load_round_trip() {
        let params = params();
        let mut versions = vec![1i32; 250];
        versions.extend(vec![2i32; 750]);
        let stats = stats_with_versions(&versions);
        let mut forks = Forks::new();
        forks.process(&stats, 999, &params);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        forks.save(&path).unwrap();

        let loaded = Forks::load(&path).unwrap();
        assert_eq!(loaded.enabled_version(), forks.enabled_version());
        assert_eq!(loaded.csv_state(), forks.csv_state());

        // And reverts still work after a reload
        let mut loaded = loaded;
        loaded.revert(500, &params);
        assert_eq!(loaded.enabled_version(), 1);
    }
}
