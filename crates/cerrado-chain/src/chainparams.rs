//! Chain parameters. One [ChainParams] value is threaded into the chain
//! at construction; nothing here is process-global.

use cerrado_common::bhash;
use cerrado_common::Hash256;

use crate::block::Block;
use crate::block::BlockHeader;
use crate::block::COIN_VALUE;
use crate::script::opcodes::OP_CHECKSIG;
use crate::script::write_push_data;
use crate::transaction::OutPoint;
use crate::transaction::Transaction;
use crate::transaction::TxInput;
use crate::transaction::TxOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,

    /// The network's first block.
    pub genesis: Block,

    /// Easiest target the network accepts, in compact form.
    pub max_target_bits: u32,

    /// Blocks between halvings of the block reward.
    pub halving_interval: u32,

    /// Blocks between classic difficulty retargets.
    pub retarget_interval: u32,

    /// Seconds the retarget window is expected to span: two weeks.
    pub retarget_timespan: u32,

    /// Height at which the cash fork rules activate. From there FORKID
    /// signatures are mandatory and the difficulty algorithm changes.
    pub cash_activation_height: u32,

    /// Median-past-time gate for the replacement difficulty algorithm.
    pub daa_median_time_threshold: u32,

    /// TestNet lets a block fall back to the minimum difficulty when 20
    /// minutes pass without one.
    pub allow_min_difficulty: bool,

    /// Blocks that legitimately overwrote an earlier coinbase before
    /// duplicate txids were outlawed (BIP-30).
    pub bip30_exceptions: [Hash256; 2],

    /// Budget for pending headers and block bodies, in bytes. Past it,
    /// block requests are restricted to ones that drain the queue.
    pub max_pending_size: usize,

    /// Branches this many blocks below the tip are pruned.
    pub branch_depth_limit: u32,
}

impl From<Network> for ChainParams {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => ChainParams {
                network,
                genesis: genesis_block(network),
                max_target_bits: 0x1d00ffff,
                halving_interval: 210_000,
                retarget_interval: 2016,
                retarget_timespan: 14 * 24 * 60 * 60,
                cash_activation_height: 478_559,
                daa_median_time_threshold: 1_510_600_000,
                allow_min_difficulty: false,
                bip30_exceptions: [
                    bhash!("00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
                    bhash!("00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
                ],
                max_pending_size: 100 * 1024 * 1024,
                branch_depth_limit: 144,
            },
            Network::Testnet => ChainParams {
                network,
                genesis: genesis_block(network),
                max_target_bits: 0x1d00ffff,
                halving_interval: 210_000,
                retarget_interval: 2016,
                retarget_timespan: 14 * 24 * 60 * 60,
                cash_activation_height: 1_155_876,
                daa_median_time_threshold: 1_510_600_000,
                allow_min_difficulty: true,
                bip30_exceptions: [Hash256::ZERO, Hash256::ZERO],
                max_pending_size: 100 * 1024 * 1024,
                branch_depth_limit: 144,
            },
        }
    }
}

/// The timestamped headline in the genesis coinbase.
const GENESIS_COINBASE_TEXT: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// The uncompressed key the genesis output pays.
const GENESIS_OUTPUT_KEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

/// Construct the genesis block for a network, reproducing the canonical
/// raw bytes exactly.
pub fn genesis_block(network: Network) -> Block {
    let mut coinbase_script = Vec::with_capacity(77);
    // The target in compact form, then "4" as an extra nonce
    write_push_data(&mut coinbase_script, &[0xff, 0xff, 0x00, 0x1d]);
    write_push_data(&mut coinbase_script, &[0x04]);
    write_push_data(&mut coinbase_script, GENESIS_COINBASE_TEXT);

    let mut output_script = Vec::with_capacity(67);
    write_push_data(&mut output_script, &GENESIS_OUTPUT_KEY);
    output_script.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            outpoint: OutPoint::coinbase(),
            script: coinbase_script,
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            amount: 50 * COIN_VALUE,
            script: output_script,
        }],
        lock_time: 0,
    };

    let (time, nonce) = match network {
        Network::Mainnet => (1231006505, 2083236893),
        Network::Testnet => (1296688602, 414098458),
    };

    let header = BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: coinbase.txid(),
        time,
        target_bits: 0x1d00ffff,
        nonce,
    };

    Block {
        header,
        transactions: vec![coinbase],
    }
}
