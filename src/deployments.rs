//! Consensus deployment state.
//!
//! [`DeploymentState`] is an immutable snapshot of the rules in force at
//! one block height, derived from the parent entry and median-time-past.
//! Height- and MTP-based activations are monotonic; BIP9 deployments run
//! the windowed DEFINED → STARTED → LOCKED_IN → ACTIVE machine with a
//! per-(bit, window-start) cache in the chain database.

use log::info;

use crate::chaindb::{median_time_past, ChainDB, ChainEntry};
use crate::params::{Bip9Deployment, Network};
use crate::{
    VERIFY_CHECKDATASIG, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_CLEANSTACK,
    VERIFY_DERSIG, VERIFY_LOW_S, VERIFY_MINIMALDATA, VERIFY_NULLFAIL, VERIFY_P2SH,
    VERIFY_REPORT_SIGCHECKS, VERIFY_SCHNORR, VERIFY_SCHNORR_MULTISIG, VERIFY_SIGHASH_FORKID,
    VERIFY_SIGPUSHONLY, VERIFY_STRICTENC,
};

/// Sequence locks are enforced.
pub const LOCK_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Finality and lock evaluation use median-time-past, not block time.
pub const LOCK_MEDIAN_TIME_PAST: u32 = 1 << 1;

/// Pre-fork block size ceiling.
pub const MAX_BLOCK_SIZE_LEGACY: u64 = 2_000_000;
/// Post-fork block size ceiling.
pub const MAX_BLOCK_SIZE_FORK: u64 = 32_000_000;

/// BIP9 versionbits threshold states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Immutable snapshot of active consensus rules.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DeploymentState {
    pub flags: u32,
    pub lock_flags: u32,
    pub bip34: bool,
    pub daa: bool,
    pub magnetic_anomaly: bool,
    pub great_wall: bool,
    pub graviton: bool,
    pub phonon: bool,
    pub asert: bool,
    pub axion: bool,
    pub tachyon: bool,
    pub selectron: bool,
    pub gluon: bool,
    pub jefferson: bool,
    pub wellington: bool,
}

impl DeploymentState {
    /// Block size ceiling under this state.
    pub fn max_block_size(&self) -> u64 {
        if self.flags & VERIFY_SIGHASH_FORKID != 0 {
            MAX_BLOCK_SIZE_FORK
        } else {
            MAX_BLOCK_SIZE_LEGACY
        }
    }

    pub fn has_csv(&self) -> bool {
        self.flags & VERIFY_CHECKSEQUENCEVERIFY != 0
    }

    /// Logs every activation present in `self` but not in `prev`.
    /// Transitions are monotonic, so each fires exactly once per run.
    pub fn log_activations(&self, prev: &DeploymentState, height: u32) {
        let steps: [(&str, bool, bool); 14] = [
            ("bip34", prev.bip34, self.bip34),
            ("forkid", prev.flags & VERIFY_SIGHASH_FORKID != 0, self.flags & VERIFY_SIGHASH_FORKID != 0),
            ("daa", prev.daa, self.daa),
            ("magnetic anomaly", prev.magnetic_anomaly, self.magnetic_anomaly),
            ("great wall", prev.great_wall, self.great_wall),
            ("graviton", prev.graviton, self.graviton),
            ("phonon", prev.phonon, self.phonon),
            ("asert", prev.asert, self.asert),
            ("axion", prev.axion, self.axion),
            ("tachyon", prev.tachyon, self.tachyon),
            ("selectron", prev.selectron, self.selectron),
            ("gluon", prev.gluon, self.gluon),
            ("jefferson", prev.jefferson, self.jefferson),
            ("wellington", prev.wellington, self.wellington),
        ];
        for (name, before, after) in steps {
            if after && !before {
                info!("{name} rules activated at height {height}");
            }
        }
    }
}

/// Derives the deployment state for the block following `prev`.
///
/// `time` is the candidate block's timestamp, used only for the
/// time-based P2SH activation; everything else keys off the height
/// `prev.height + 1` or the parent's median-time-past.
pub fn get_deployments(
    db: &mut dyn ChainDB,
    network: &Network,
    time: u64,
    prev: &ChainEntry,
) -> DeploymentState {
    let height = prev.height + 1;
    let mtp = median_time_past(db, prev);

    let mut state = DeploymentState::default();

    if time >= network.bip16_time {
        state.flags |= VERIFY_P2SH;
    }
    if height >= network.bip34_height {
        state.bip34 = true;
    }
    if height >= network.bip66_height {
        state.flags |= VERIFY_DERSIG;
    }
    if height >= network.bip65_height {
        state.flags |= VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if bip9_state(db, network, prev, &network.csv_deployment) == ThresholdState::Active {
        state.flags |= VERIFY_CHECKSEQUENCEVERIFY;
        state.lock_flags |= LOCK_VERIFY_SEQUENCE | LOCK_MEDIAN_TIME_PAST;
    }
    if height >= network.uahf_height {
        state.flags |= VERIFY_STRICTENC | VERIFY_SIGHASH_FORKID;
    }
    if height >= network.daa_height {
        state.daa = true;
        state.flags |= VERIFY_LOW_S | VERIFY_NULLFAIL;
    }
    if height >= network.magnetic_anomaly_height {
        state.magnetic_anomaly = true;
        state.flags |= VERIFY_CHECKDATASIG | VERIFY_SIGPUSHONLY | VERIFY_CLEANSTACK;
    }
    if height >= network.great_wall_height {
        state.great_wall = true;
        state.flags |= VERIFY_SCHNORR;
    }
    if height >= network.graviton_height {
        state.graviton = true;
        state.flags |= VERIFY_SCHNORR_MULTISIG | VERIFY_MINIMALDATA;
    }
    if height >= network.phonon_height {
        state.phonon = true;
        state.flags |= VERIFY_REPORT_SIGCHECKS;
    }
    if mtp >= network.asert_activation_time {
        state.asert = true;
    }
    if height >= network.axion_height {
        state.axion = true;
    }
    if mtp >= network.tachyon_time {
        state.tachyon = true;
    }
    if mtp >= network.selectron_time {
        state.selectron = true;
    }
    if mtp >= network.gluon_time {
        state.gluon = true;
    }
    if mtp >= network.jefferson_time {
        state.jefferson = true;
    }
    if mtp >= network.wellington_time {
        state.wellington = true;
    }

    state
}

/// Computes the BIP9 threshold state of `deployment` as of `prev`.
///
/// Walks back window-aligned ancestors until a cached or DEFINED state
/// is found, then replays transitions forward, caching each window.
pub fn bip9_state(
    db: &mut dyn ChainDB,
    network: &Network,
    prev: &ChainEntry,
    deployment: &Bip9Deployment,
) -> ThresholdState {
    let window = network.miner_window;

    // Align on the last block of the prior window.
    let mut entry = {
        let back = (prev.height + 1) % window;
        if prev.height + 1 < window {
            None
        } else {
            db.get_ancestor(prev, prev.height - back)
        }
    };

    let mut pending: Vec<ChainEntry> = Vec::new();
    let mut state = ThresholdState::Defined;
    while let Some(current) = entry.clone() {
        if let Some(cached) = db.state_get(deployment.bit, &current.hash) {
            state = cached;
            break;
        }
        let mtp = median_time_past(db, &current);
        if mtp < deployment.start_time {
            db.state_set(deployment.bit, current.hash, ThresholdState::Defined);
            state = ThresholdState::Defined;
            break;
        }
        pending.push(current.clone());
        entry = if current.height + 1 < window {
            None
        } else {
            db.get_ancestor(&current, current.height + 1 - window)
                .and_then(|boundary| db.get_previous(&boundary))
        };
    }

    // Replay forward, oldest window first.
    while let Some(current) = pending.pop() {
        state = match state {
            ThresholdState::Defined => {
                let mtp = median_time_past(db, &current);
                if mtp >= deployment.timeout {
                    ThresholdState::Failed
                } else if mtp >= deployment.start_time {
                    ThresholdState::Started
                } else {
                    ThresholdState::Defined
                }
            }
            ThresholdState::Started => {
                let mtp = median_time_past(db, &current);
                if mtp >= deployment.timeout {
                    ThresholdState::Failed
                } else {
                    let mut count = 0u32;
                    let mut walker = Some(current.clone());
                    for _ in 0..window {
                        let Some(block) = walker else { break };
                        let version = block.version as u32;
                        if version & 0xe000_0000 == 0x2000_0000
                            && version >> deployment.bit & 1 == 1
                        {
                            count += 1;
                        }
                        walker = db.get_previous(&block);
                    }
                    if count >= network.rule_change_threshold {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
            }
            ThresholdState::LockedIn => ThresholdState::Active,
            terminal => terminal,
        };
        db.state_set(deployment.bit, current.hash, state);
    }

    state
}
