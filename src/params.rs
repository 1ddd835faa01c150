//! Network parameters.
//!
//! Everything height- or time-keyed that distinguishes mainnet from the
//! test networks lives here: proof-of-work bounds, retarget cadence,
//! upgrade activations, the ASERT anchor, BIP9 deployments, checkpoints,
//! and the coinbase-rule payout scripts.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::BlockHash;

use crate::pow::{compact_to_target, U256};
use crate::script::{opcodes, ScriptBuilder};

/// A BIP9 versionbits deployment.
#[derive(Debug, Clone)]
pub struct Bip9Deployment {
    pub name: &'static str,
    pub bit: u8,
    pub start_time: u64,
    pub timeout: u64,
}

/// Reference block anchoring the ASERT schedule.
#[derive(Debug, Clone, Copy)]
pub struct AsertAnchor {
    pub height: u32,
    pub bits: u32,
    /// Timestamp of the anchor's ancestor (the block before it).
    pub parent_time: u64,
}

/// Consensus parameters for one chain.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: &'static str,
    pub pow_limit_bits: u32,
    pub pow_limit: U256,
    pub target_spacing: u64,
    pub target_timespan: u64,
    pub retarget_interval: u32,
    /// Regtest never retargets.
    pub no_retargeting: bool,
    pub halving_interval: u32,
    pub coinbase_maturity: u32,

    pub miner_window: u32,
    pub rule_change_threshold: u32,
    pub csv_deployment: Bip9Deployment,

    pub bip16_time: u64,
    pub bip34_height: u32,
    pub bip66_height: u32,
    pub bip65_height: u32,
    pub uahf_height: u32,
    pub daa_height: u32,
    pub magnetic_anomaly_height: u32,
    pub great_wall_height: u32,
    pub graviton_height: u32,
    pub phonon_height: u32,
    pub axion_height: u32,

    pub asert_activation_time: u64,
    pub asert_anchor: AsertAnchor,
    pub tachyon_time: u64,
    pub selectron_time: u64,
    pub gluon_time: u64,
    pub jefferson_time: u64,
    pub wellington_time: u64,

    pub checkpoints: BTreeMap<u32, BlockHash>,
    pub last_checkpoint: u32,
    /// Scripts the coinbase rule pays into while it is in force.
    pub coinbase_rule_scripts: Vec<Vec<u8>>,
}

fn hash(hex: &str) -> BlockHash {
    BlockHash::from_str(hex).expect("hardcoded checkpoint hash")
}

impl Network {
    pub fn main() -> Network {
        let pow_limit_bits = 0x1d00_ffff;
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(
            11111,
            hash("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
        );
        checkpoints.insert(
            478559,
            hash("000000000000000000651ef99cb9fcbe0dadde1d424bd9f15ff20136191a5eec"),
        );

        // The post-Axion coinbase rule pays into this P2SH output.
        let miner_fund = ScriptBuilder::new()
            .push_opcode(opcodes::OP_HASH160)
            .push_data(&[
                0x26, 0x06, 0x17, 0xeb, 0xf6, 0x68, 0xc9, 0x10, 0x2f, 0x71, 0xce, 0x24, 0xab,
                0xa9, 0x7f, 0xca, 0xaf, 0x9c, 0x66, 0x6a,
            ])
            .push_opcode(opcodes::OP_EQUAL)
            .into_script();

        Network {
            name: "main",
            pow_limit_bits,
            pow_limit: compact_to_target(pow_limit_bits).expect("valid limit"),
            target_spacing: 600,
            target_timespan: 2016 * 600,
            retarget_interval: 2016,
            no_retargeting: false,
            halving_interval: 210_000,
            coinbase_maturity: 100,

            miner_window: 2016,
            rule_change_threshold: 1916,
            csv_deployment: Bip9Deployment {
                name: "csv",
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },

            bip16_time: 1_333_238_400,
            bip34_height: 227_931,
            bip66_height: 363_725,
            bip65_height: 388_381,
            uahf_height: 478_559,
            daa_height: 504_032,
            magnetic_anomaly_height: 556_767,
            great_wall_height: 582_680,
            graviton_height: 609_136,
            phonon_height: 635_259,
            axion_height: 661_648,

            asert_activation_time: 1_605_441_600,
            asert_anchor: AsertAnchor {
                height: 661_647,
                bits: 0x1804_dafe,
                parent_time: 1_605_447_844,
            },
            tachyon_time: 1_621_080_000,
            selectron_time: 1_637_064_000,
            gluon_time: 1_652_616_000,
            jefferson_time: 1_684_152_000,
            wellington_time: 1_715_774_400,

            last_checkpoint: 478_559,
            checkpoints,
            coinbase_rule_scripts: vec![miner_fund.to_bytes()],
        }
    }

    pub fn testnet() -> Network {
        let pow_limit_bits = 0x1d00_ffff;
        Network {
            name: "testnet",
            pow_limit_bits,
            pow_limit: compact_to_target(pow_limit_bits).expect("valid limit"),
            target_spacing: 600,
            target_timespan: 2016 * 600,
            retarget_interval: 2016,
            no_retargeting: false,
            halving_interval: 210_000,
            coinbase_maturity: 100,

            miner_window: 2016,
            rule_change_threshold: 1512,
            csv_deployment: Bip9Deployment {
                name: "csv",
                bit: 0,
                start_time: 1_456_790_400,
                timeout: 1_493_596_800,
            },

            bip16_time: 1_333_238_400,
            bip34_height: 21_111,
            bip66_height: 330_776,
            bip65_height: 581_885,
            uahf_height: 1_155_876,
            daa_height: 1_188_698,
            magnetic_anomaly_height: 1_267_997,
            great_wall_height: 1_303_885,
            graviton_height: 1_341_712,
            phonon_height: 1_378_461,
            axion_height: 1_421_482,

            asert_activation_time: 1_605_441_600,
            asert_anchor: AsertAnchor {
                height: 1_421_481,
                bits: 0x1d00_ffff,
                parent_time: 1_605_445_400,
            },
            tachyon_time: 1_621_080_000,
            selectron_time: 1_637_064_000,
            gluon_time: 1_652_616_000,
            jefferson_time: 1_684_152_000,
            wellington_time: 1_715_774_400,

            checkpoints: BTreeMap::new(),
            last_checkpoint: 0,
            coinbase_rule_scripts: Vec::new(),
        }
    }

    /// Local testing chain: trivial proof of work, no retargeting, every
    /// upgrade active from genesis.
    pub fn regtest() -> Network {
        let pow_limit_bits = 0x207f_ffff;
        Network {
            name: "regtest",
            pow_limit_bits,
            pow_limit: compact_to_target(pow_limit_bits).expect("valid limit"),
            target_spacing: 600,
            target_timespan: 2016 * 600,
            retarget_interval: 2016,
            no_retargeting: true,
            halving_interval: 150,
            coinbase_maturity: 100,

            miner_window: 144,
            rule_change_threshold: 108,
            csv_deployment: Bip9Deployment { name: "csv", bit: 0, start_time: 0, timeout: u64::MAX },

            bip16_time: 0,
            bip34_height: 0,
            bip66_height: 0,
            bip65_height: 0,
            uahf_height: 0,
            daa_height: 0,
            magnetic_anomaly_height: 0,
            great_wall_height: 0,
            graviton_height: 0,
            phonon_height: 0,
            axion_height: 0,

            asert_activation_time: 0,
            asert_anchor: AsertAnchor { height: 0, bits: pow_limit_bits, parent_time: 0 },
            tachyon_time: 0,
            selectron_time: 0,
            gluon_time: 0,
            jefferson_time: 0,
            wellington_time: 0,

            checkpoints: BTreeMap::new(),
            last_checkpoint: 0,
            coinbase_rule_scripts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_limits_parse() {
        let network = Network::main();
        assert!(!network.pow_limit.is_zero());
        assert_eq!(network.checkpoints.len(), 2);
        assert!(network.checkpoints.contains_key(&network.last_checkpoint));
    }

    #[test]
    fn regtest_activates_everything_at_genesis() {
        let network = Network::regtest();
        assert!(network.no_retargeting);
        assert_eq!(network.uahf_height, 0);
        assert_eq!(network.wellington_time, 0);
    }
}
