//! Chain acceptance, fork resolution, and reorganization.
//!
//! `Chain` owns the database collaborator and serializes every mutating
//! operation through `&mut self`; a per-hash pending set collapses
//! duplicate submissions of the same block. Events are buffered until
//! the mutating call returns and are drained by the caller, so an event
//! handler replying with more blocks can never re-enter a half-applied
//! state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, OutPoint, Transaction};
use log::{debug, info, warn};

use crate::chaindb::{median_time_past, ChainDB, ChainEntry};
use crate::coins::{Coin, CoinView};
use crate::deployments::{get_deployments, DeploymentState, LOCK_VERIFY_SEQUENCE};
use crate::error::{ChainError, DbError, VerifyError, VerifyKind};
use crate::interpreter;
use crate::params::Network;
use crate::pow::{
    asert_target, check_proof_of_work, daa_target, eda_ease_bits, legacy_retarget,
    target_to_compact, ASERT_HALF_LIFE,
};
use crate::script::Script;
use crate::tx::{
    check_transaction, coinbase_height, get_block_subsidy, is_final, tx_sigops, txid_order_key,
    MAX_BLOCK_SIGOPS_PER_MB, MAX_TX_SIGOPS, MIN_TX_SIZE,
};
use crate::{VERIFY_BODY, VERIFY_POW};

/// Accepted clock skew on incoming block timestamps.
const MAX_FUTURE_DRIFT: u64 = 2 * 3600;
/// Orphans older than this are evicted first.
const ORPHAN_EXPIRY: u64 = 3600;
/// Bound on the invalid-hash cache.
const INVALID_CACHE_SIZE: usize = 100;
/// Default bound on the orphan pool.
pub const DEFAULT_MAX_ORPHANS: usize = 20;

const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_MASK: u32 = 0x0000_ffff;
const SEQUENCE_GRANULARITY: u32 = 9;

/// Heights excused from the BIP30 overwrite check.
const BIP30_EXCEPTIONS: [u32; 2] = [91_842, 91_880];

/// A block whose parent is not yet known.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub block: Block,
    pub flags: u32,
    pub peer: u32,
    pub received: u64,
}

/// Chain notifications, buffered during a mutating call.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Tip(ChainEntry),
    Block(Block, ChainEntry),
    Connect(ChainEntry, Block, CoinView),
    Disconnect(ChainEntry, Block, CoinView),
    Reconnect(ChainEntry, Block),
    Reorganize { old_tip: ChainEntry, new_tip: ChainEntry },
    Competitor(Block, ChainEntry),
    Orphan(Block),
    BadOrphan { error: VerifyError, peer: u32 },
    Checkpoint(BlockHash, u32),
    Full,
    Reset(ChainEntry),
}

/// Bounded insertion-ordered hash set for invalid-block tracking.
struct LruSet {
    set: HashSet<BlockHash>,
    order: VecDeque<BlockHash>,
    capacity: usize,
}

impl LruSet {
    fn new(capacity: usize) -> Self {
        Self { set: HashSet::new(), order: VecDeque::new(), capacity }
    }

    fn insert(&mut self, hash: BlockHash) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.set.contains(hash)
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

/// Chain construction options.
pub struct ChainOptions {
    pub network: Network,
    /// Header-only validation: `verify_context` returns an empty view.
    pub spv: bool,
    /// Enforce the hardcoded checkpoints.
    pub checkpoints: bool,
    pub max_orphans: usize,
    /// Fixed clock for tests.
    pub mock_time: Option<u64>,
}

impl ChainOptions {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            spv: false,
            checkpoints: true,
            max_orphans: DEFAULT_MAX_ORPHANS,
            mock_time: None,
        }
    }
}

/// Block acceptor, fork resolver, and reorganization engine.
pub struct Chain {
    db: Box<dyn ChainDB>,
    options: ChainOptions,
    tip: ChainEntry,
    state: DeploymentState,
    orphans: HashMap<BlockHash, Orphan>,
    orphan_prev: HashMap<BlockHash, BlockHash>,
    invalid: LruSet,
    pending: HashSet<BlockHash>,
    events: Vec<ChainEvent>,
    synced: bool,
}

impl Chain {
    pub fn new(db: Box<dyn ChainDB>, options: ChainOptions) -> Self {
        Self {
            db,
            options,
            tip: ChainEntry {
                hash: crate::chaindb::zero_hash(),
                prev: crate::chaindb::zero_hash(),
                height: 0,
                version: 0,
                time: 0,
                bits: 0,
                nonce: 0,
                chainwork: crate::pow::U256::ZERO,
            },
            state: DeploymentState::default(),
            orphans: HashMap::new(),
            orphan_prev: HashMap::new(),
            invalid: LruSet::new(INVALID_CACHE_SIZE),
            pending: HashSet::new(),
            events: Vec::new(),
            synced: false,
        }
    }

    /// Loads the tip and computes the current deployment state.
    pub fn open(&mut self) -> Result<(), ChainError> {
        self.db.open()?;
        let tip = self.db.tip().ok_or(DbError::Corrupt("store has no tip"))?;
        info!("chain open: height={} hash={}", tip.height, tip.hash);
        self.tip = tip;
        self.refresh_state()?;
        self.maybe_sync();
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), ChainError> {
        self.db.close()?;
        Ok(())
    }

    pub fn tip(&self) -> &ChainEntry {
        &self.tip
    }

    pub fn height(&self) -> u32 {
        self.tip.height
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    pub fn get_entry(&self, hash: &BlockHash) -> Option<ChainEntry> {
        self.db.get_entry(hash)
    }

    pub fn get_entry_by_height(&self, height: u32) -> Option<ChainEntry> {
        self.db.get_entry_by_height(height)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.db.get_block(hash)
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.db.read_coin(outpoint)
    }

    pub fn has_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Takes the events buffered since the last drain, in emission
    /// order.
    pub fn drain_events(&mut self) -> Vec<ChainEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: ChainEvent) {
        self.events.push(event);
    }

    fn now(&self) -> u64 {
        match self.options.mock_time {
            Some(time) => time,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        }
    }

    fn refresh_state(&mut self) -> Result<(), ChainError> {
        let tip = self.tip.clone();
        let state = match self.db.get_previous(&tip) {
            Some(prev) => {
                get_deployments(&mut *self.db, &self.options.network, tip.time as u64, &prev)
            }
            None => get_deployments(&mut *self.db, &self.options.network, tip.time as u64, &tip),
        };
        self.state = state;
        Ok(())
    }

    fn maybe_sync(&mut self) {
        if !self.synced && self.tip.time as u64 + MAX_FUTURE_DRIFT >= self.now() {
            self.synced = true;
            self.emit(ChainEvent::Full);
        }
    }

    fn set_invalid(&mut self, hash: BlockHash) {
        warn!("marking block invalid: {hash}");
        self.invalid.insert(hash);
    }

    fn has_invalid(&self, block: &Block) -> bool {
        self.invalid.contains(&block.block_hash())
            || self.invalid.contains(&block.header.prev_blockhash)
    }

    /// Primary entry point: accepts a block from `peer` under `flags`.
    ///
    /// Returns the connected entry, or `None` when the block was stored
    /// as an orphan awaiting its parent.
    pub fn add(
        &mut self,
        block: Block,
        flags: u32,
        peer: u32,
    ) -> Result<Option<ChainEntry>, ChainError> {
        let hash = block.block_hash();

        if self.db.get_hash(0) == Some(hash) {
            return Err(ChainError::duplicate());
        }
        if self.pending.contains(&hash) || self.has_orphan(&hash) || self.db.has_entry(&hash) {
            return Err(ChainError::duplicate());
        }
        if self.has_invalid(&block) {
            self.set_invalid(hash);
            return Err(VerifyError::new(VerifyKind::Duplicate, "duplicate", 100).into());
        }

        self.pending.insert(hash);
        let result = self.add_locked(block, flags, peer);
        self.pending.remove(&hash);

        match result {
            Ok(Some(entry)) => {
                self.handle_orphans(entry.clone(), peer)?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(ChainError::Verify(error)) => {
                if !error.malleated {
                    self.set_invalid(hash);
                }
                Err(error.into())
            }
            Err(error) => Err(error),
        }
    }

    fn add_locked(
        &mut self,
        block: Block,
        flags: u32,
        peer: u32,
    ) -> Result<Option<ChainEntry>, ChainError> {
        if flags & VERIFY_POW != 0 {
            let hash = block.block_hash();
            let bits = block.header.bits.to_consensus();
            if !check_proof_of_work(hash.to_byte_array(), bits, &self.options.network.pow_limit) {
                return Err(VerifyError::new(VerifyKind::Invalid, "high-hash", 50).into());
            }
        }

        let Some(prev) = self.db.get_entry(&block.header.prev_blockhash) else {
            self.store_orphan(block, flags, peer);
            return Ok(None);
        };

        self.connect(prev, block, flags).map(Some)
    }

    /// Builds the entry and routes the block to the best chain or the
    /// alternates by cumulative chainwork.
    fn connect(
        &mut self,
        prev: ChainEntry,
        block: Block,
        flags: u32,
    ) -> Result<ChainEntry, ChainError> {
        let entry = ChainEntry::from_header(&block.header, Some(&prev));

        if entry.chainwork <= self.tip.chainwork {
            self.save_alternate(entry.clone(), block, prev, flags)?;
        } else {
            self.set_best_chain(entry.clone(), block, prev, flags)?;
        }
        Ok(entry)
    }

    /// Verifies and persists a block that does not beat the current tip.
    /// Inputs are not connected; a later reorganization re-verifies.
    fn save_alternate(
        &mut self,
        entry: ChainEntry,
        block: Block,
        prev: ChainEntry,
        flags: u32,
    ) -> Result<(), ChainError> {
        let result = self.verify(&block, &prev, flags);
        if let Err(ChainError::Verify(ref error)) = result {
            if error.kind == VerifyKind::Checkpoint {
                warn!("checkpoint conflict at height {}: purging orphans", entry.height);
                self.purge_orphans();
            }
        }
        result?;

        self.db.save(&entry, &block, None)?;
        warn!(
            "heads up: competing chain at height {}: {} vs {}",
            entry.height, entry.hash, self.tip.hash
        );
        self.emit(ChainEvent::Competitor(block, entry));
        Ok(())
    }

    /// Extends (or reorganizes to) the chain of greatest work.
    fn set_best_chain(
        &mut self,
        entry: ChainEntry,
        block: Block,
        prev: ChainEntry,
        flags: u32,
    ) -> Result<(), ChainError> {
        if entry.prev != self.tip.hash {
            self.reorganize(&entry, flags)?;
        }

        let (view, state) = match self.verify_context(&block, &prev, flags) {
            Ok(success) => success,
            Err(ChainError::Verify(error)) => {
                if !error.malleated {
                    self.set_invalid(entry.hash);
                }
                warn!("tried to connect invalid block: {} ({})", entry.hash, error.reason);
                return Err(error.into());
            }
            Err(error) => return Err(error),
        };

        self.db.save(&entry, &block, Some(&view))?;

        state.log_activations(&self.state, entry.height);
        self.tip = entry.clone();
        self.state = state;

        self.emit(ChainEvent::Tip(entry.clone()));
        self.emit(ChainEvent::Block(block.clone(), entry.clone()));
        self.emit(ChainEvent::Connect(entry, block, view));
        self.maybe_sync();
        Ok(())
    }

    /// Switches the main chain to the branch ending in `competitor`.
    ///
    /// Disconnects from the tip down to the fork, then reconnects the
    /// branch up to the competitor's parent; the competitor itself is
    /// connected by the enclosing `set_best_chain`. Alternate blocks
    /// were never input-verified, so each reconnect re-verifies. On
    /// failure the error propagates and the chain is left at the last
    /// consistent tip.
    fn reorganize(&mut self, competitor: &ChainEntry, flags: u32) -> Result<(), ChainError> {
        let old_tip = self.tip.clone();
        let fork = self.find_fork(&old_tip, competitor)?;

        info!(
            "reorganizing chain: fork={} old={} new={}",
            fork.height, old_tip.hash, competitor.hash
        );

        // Disconnect tip..fork, exclusive of the fork itself.
        let mut cursor = old_tip.clone();
        while cursor.hash != fork.hash {
            let block = self.db.get_block(&cursor.hash).ok_or(DbError::NotFound("block body"))?;
            let view = self.db.disconnect(&cursor, &block)?;
            let prev = self.db.get_previous(&cursor).ok_or(DbError::NotFound("prev entry"))?;
            self.tip = prev.clone();
            self.emit(ChainEvent::Disconnect(cursor, block, view));
            cursor = prev;
        }

        self.emit(ChainEvent::Reorganize { old_tip, new_tip: competitor.clone() });

        // Collect fork+1..competitor-1, root first.
        let mut branch = Vec::new();
        let mut cursor = self
            .db
            .get_entry(&competitor.prev)
            .ok_or(DbError::NotFound("competitor parent"))?;
        while cursor.hash != fork.hash {
            branch.push(cursor.clone());
            cursor = self.db.get_previous(&cursor).ok_or(DbError::NotFound("branch entry"))?;
        }
        branch.reverse();

        for entry in branch {
            let block = self.db.get_block(&entry.hash).ok_or(DbError::NotFound("block body"))?;
            let prev = self.db.get_previous(&entry).ok_or(DbError::NotFound("prev entry"))?;
            let (view, state) = match self.verify_context(&block, &prev, flags) {
                Ok(success) => success,
                Err(ChainError::Verify(error)) => {
                    if !error.malleated {
                        self.set_invalid(entry.hash);
                    }
                    self.refresh_state()?;
                    return Err(error.into());
                }
                Err(error) => return Err(error),
            };
            self.db.reconnect(&entry, &block, &view)?;
            state.log_activations(&self.state, entry.height);
            self.tip = entry.clone();
            self.state = state;
            self.emit(ChainEvent::Reconnect(entry.clone(), block.clone()));
            self.emit(ChainEvent::Connect(entry, block, view));
        }

        Ok(())
    }

    /// Lowest common ancestor of two entries.
    fn find_fork(&self, a: &ChainEntry, b: &ChainEntry) -> Result<ChainEntry, ChainError> {
        let mut a = a.clone();
        let mut b = b.clone();
        while a.height > b.height {
            a = self.db.get_previous(&a).ok_or(DbError::NotFound("fork walk"))?;
        }
        while b.height > a.height {
            b = self.db.get_previous(&b).ok_or(DbError::NotFound("fork walk"))?;
        }
        while a.hash != b.hash {
            a = self.db.get_previous(&a).ok_or(DbError::NotFound("fork walk"))?;
            b = self.db.get_previous(&b).ok_or(DbError::NotFound("fork walk"))?;
        }
        Ok(a)
    }

    /// Contextual verification plus input connection.
    fn verify_context(
        &mut self,
        block: &Block,
        prev: &ChainEntry,
        flags: u32,
    ) -> Result<(CoinView, DeploymentState), ChainError> {
        let state = self.verify(block, prev, flags)?;
        let height = prev.height + 1;

        if self.options.spv {
            return Ok((CoinView::new(), state));
        }

        if self.options.checkpoints && height <= self.options.network.last_checkpoint {
            // Deep in the checkpointed zone the scripts are history;
            // only the UTXO bookkeeping is replayed.
            let view = self.update_inputs(block, height)?;
            return Ok((view, state));
        }

        if !state.bip34 {
            self.verify_duplicates(block, height)?;
        }

        let view = self.verify_inputs(block, prev, &state)?;
        Ok((view, state))
    }

    /// Contextual checks that need no UTXO access.
    fn verify(
        &mut self,
        block: &Block,
        prev: &ChainEntry,
        flags: u32,
    ) -> Result<DeploymentState, ChainError> {
        let hash = block.block_hash();
        let height = prev.height + 1;
        let header = &block.header;

        if header.prev_blockhash != prev.hash {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-prevblk", 0).into());
        }

        if self.options.checkpoints {
            if let Some(expected) = self.options.network.checkpoints.get(&height).copied() {
                if expected != hash {
                    self.purge_orphans();
                    return Err(VerifyError::new(
                        VerifyKind::Checkpoint,
                        "checkpoint mismatch",
                        100,
                    )
                    .into());
                }
                self.emit(ChainEvent::Checkpoint(hash, height));
            }
        }

        let state =
            get_deployments(&mut *self.db, &self.options.network, header.time as u64, prev);

        if flags & VERIFY_POW != 0 {
            let expected = self.get_target(prev)?;
            if header.bits.to_consensus() != expected {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-diffbits", 100).into());
            }
        }

        let mtp = median_time_past(&*self.db, prev);
        if (header.time as u64) <= mtp {
            return Err(VerifyError::new(VerifyKind::Invalid, "time-too-old", 0).into());
        }
        if header.time as u64 > self.now() + MAX_FUTURE_DRIFT {
            return Err(VerifyError::malleated(VerifyKind::Invalid, "time-too-new", 0).into());
        }

        let version = header.version.to_consensus();
        if (version < 2 && height >= self.options.network.bip34_height)
            || (version < 3 && height >= self.options.network.bip66_height)
            || (version < 4 && height >= self.options.network.bip65_height)
        {
            return Err(VerifyError::new(VerifyKind::Obsolete, "bad-version", 0).into());
        }

        if flags & VERIFY_BODY != 0 {
            self.check_body(block)?;
        }

        let lock_time = if state.has_csv() { mtp } else { header.time as u64 };
        let mut last_key = None;
        for (index, tx) in block.txdata.iter().enumerate() {
            if state.magnetic_anomaly {
                if index > 0 && tx.total_size() < MIN_TX_SIZE {
                    return Err(
                        VerifyError::new(VerifyKind::Invalid, "bad-txns-undersize", 100).into()
                    );
                }
                if index > 0 {
                    let key = txid_order_key(tx);
                    if let Some(prev_key) = last_key {
                        if key <= prev_key {
                            return Err(
                                VerifyError::new(VerifyKind::Invalid, "tx-ordering", 100).into()
                            );
                        }
                    }
                    last_key = Some(key);
                }
            }
            if state.wellington && !(1..=2).contains(&tx.version.0) {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-version", 100).into());
            }
            if !is_final(tx, height, lock_time) {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-nonfinal", 10).into());
            }
        }

        if state.bip34 {
            let coinbase = block.txdata.first();
            let committed = coinbase.and_then(coinbase_height);
            if committed != Some(height as i64) {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-cb-height", 100).into());
            }
        }

        if block.total_size() as u64 > state.max_block_size() {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-blk-length", 100).into());
        }

        Ok(state)
    }

    /// Non-contextual body sanity.
    fn check_body(&self, block: &Block) -> Result<(), ChainError> {
        if block.txdata.is_empty() {
            return Err(VerifyError::new(VerifyKind::Malformed, "bad-blk-length", 100).into());
        }
        if !block.txdata[0].is_coinbase() {
            return Err(VerifyError::new(VerifyKind::Malformed, "bad-cb-missing", 100).into());
        }
        if block.txdata.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(VerifyError::new(VerifyKind::Malformed, "bad-cb-multiple", 100).into());
        }
        match block.compute_merkle_root() {
            Some(root) if root == block.header.merkle_root => {}
            // A mutated merkle tree is a malleability artifact; the real
            // block may still be valid under the same hash.
            _ => {
                return Err(
                    VerifyError::malleated(VerifyKind::Malformed, "bad-txnmrklroot", 100).into()
                )
            }
        }
        for tx in &block.txdata {
            check_transaction(tx)?;
        }
        Ok(())
    }

    /// BIP30: a new transaction must not overwrite unspent outputs of an
    /// earlier one. Only consulted while BIP34 is inactive.
    fn verify_duplicates(&self, block: &Block, height: u32) -> Result<(), ChainError> {
        for tx in &block.txdata {
            if self.db.has_coins(&tx.compute_txid()) && !BIP30_EXCEPTIONS.contains(&height) {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-BIP30", 100).into());
            }
        }
        Ok(())
    }

    /// UTXO bookkeeping without script checks, for the checkpoint zone.
    fn update_inputs(&mut self, block: &Block, height: u32) -> Result<CoinView, ChainError> {
        let mut view = CoinView::new();
        for (index, tx) in block.txdata.iter().enumerate() {
            if index > 0 {
                for input in &tx.input {
                    let db = &self.db;
                    if view
                        .spend(&input.previous_output, |outpoint| db.read_coin(outpoint))
                        .is_none()
                    {
                        return Err(VerifyError::new(
                            VerifyKind::Invalid,
                            "bad-txns-inputs-missingorspent",
                            100,
                        )
                        .into());
                    }
                }
            }
            view.add_tx(tx, height);
        }
        Ok(view)
    }

    /// Full input verification: spends, locks, sigops, scripts, fees,
    /// and the coinbase amount rules.
    fn verify_inputs(
        &mut self,
        block: &Block,
        prev: &ChainEntry,
        state: &DeploymentState,
    ) -> Result<CoinView, ChainError> {
        if block.txdata.is_empty() {
            return Err(VerifyError::new(VerifyKind::Malformed, "bad-blk-length", 100).into());
        }

        let height = prev.height + 1;
        let network = &self.options.network;
        let mut view = CoinView::new();

        // Transaction ordering no longer implies topological order, so
        // every output joins the view before any spend.
        if state.magnetic_anomaly {
            for tx in &block.txdata {
                view.add_tx(tx, height);
            }
        }

        let block_sigops_limit = {
            let mb = (block.total_size() as u64 + 999_999) / 1_000_000;
            mb.max(1) as u32 * MAX_BLOCK_SIGOPS_PER_MB
        };
        let mut block_sigops: u32 = 0;
        let mut fees: u64 = 0;
        let mut jobs: Vec<(usize, usize, Script, Script, u64)> = Vec::new();

        for (index, tx) in block.txdata.iter().enumerate() {
            let mut spent: HashMap<OutPoint, Coin> = HashMap::new();

            if index > 0 {
                let mut value_in: u64 = 0;
                for input in &tx.input {
                    let db = &self.db;
                    let Some(coin) = view
                        .spend(&input.previous_output, |outpoint| db.read_coin(outpoint))
                    else {
                        return Err(VerifyError::new(
                            VerifyKind::Invalid,
                            "bad-txns-inputs-missingorspent",
                            100,
                        )
                        .into());
                    };
                    if coin.coinbase && height - coin.height < network.coinbase_maturity {
                        return Err(VerifyError::new(
                            VerifyKind::Invalid,
                            "bad-txns-premature-spend-of-coinbase",
                            0,
                        )
                        .into());
                    }
                    value_in = value_in.saturating_add(coin.value());
                    spent.insert(input.previous_output, coin);
                }

                if state.lock_flags & LOCK_VERIFY_SEQUENCE != 0
                    && tx.version.0 >= 2
                    && !self.verify_locks(prev, tx, &spent)?
                {
                    return Err(
                        VerifyError::new(VerifyKind::Invalid, "bad-txns-nonfinal", 100).into()
                    );
                }

                let value_out: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
                if value_out > value_in {
                    return Err(
                        VerifyError::new(VerifyKind::Invalid, "bad-txns-in-belowout", 100).into()
                    );
                }
                fees = fees.saturating_add(value_in - value_out);

                for (input_index, input) in tx.input.iter().enumerate() {
                    let coin = &spent[&input.previous_output];
                    jobs.push((
                        index,
                        input_index,
                        Script::from_bytes(input.script_sig.as_bytes()),
                        Script::from_bytes(coin.output.script_pubkey.as_bytes()),
                        coin.value(),
                    ));
                }
            }

            let sigops = tx_sigops(tx, |outpoint| spent.get(outpoint).cloned());
            if sigops > MAX_TX_SIGOPS {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-txn-sigops", 100).into());
            }
            block_sigops = block_sigops.saturating_add(sigops);
            if !state.phonon && block_sigops > block_sigops_limit {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-blk-sigops", 100).into());
            }

            if !state.magnetic_anomaly {
                view.add_tx(tx, height);
            }
        }

        // Independent script jobs; a worker pool may run them in
        // parallel, the block is verified once all of them pass.
        for (tx_index, input_index, input_script, output_script, value) in jobs {
            let tx = &block.txdata[tx_index];
            if let Err(error) =
                interpreter::verify(&input_script, &output_script, tx, input_index, value, state.flags)
            {
                debug!(
                    "script failure in {} input {}: {}",
                    tx.compute_txid(),
                    input_index,
                    error
                );
                return Err(VerifyError::new(
                    VerifyKind::Invalid,
                    "mandatory-script-verify-flag-failed",
                    100,
                )
                .into());
            }
        }

        let coinbase = &block.txdata[0];
        let claimed: u64 = coinbase.output.iter().map(|o| o.value.to_sat()).sum();
        let reward = get_block_subsidy(height, network.halving_interval).saturating_add(fees);
        if claimed > reward {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-cb-amount", 100).into());
        }

        // The coinbase rule directs a share of the coinbase value to the
        // designated scripts from its activation until it was retired.
        if state.axion && !state.wellington && !network.coinbase_rule_scripts.is_empty() {
            let required = claimed * 8 / 100;
            let paid: u64 = coinbase
                .output
                .iter()
                .filter(|output| {
                    network
                        .coinbase_rule_scripts
                        .iter()
                        .any(|script| script.as_slice() == output.script_pubkey.as_bytes())
                })
                .map(|output| output.value.to_sat())
                .sum();
            if paid < required {
                return Err(VerifyError::new(VerifyKind::Invalid, "bad-cb-minerfund", 100).into());
            }
        }

        Ok(view)
    }

    /// BIP68 relative lock evaluation for one transaction.
    fn verify_locks(
        &self,
        prev: &ChainEntry,
        tx: &Transaction,
        spent: &HashMap<OutPoint, Coin>,
    ) -> Result<bool, ChainError> {
        let mut min_height: i64 = -1;
        let mut min_time: i64 = -1;

        for input in &tx.input {
            let sequence = input.sequence.to_consensus_u32();
            if sequence & SEQUENCE_DISABLE_FLAG != 0 {
                continue;
            }
            let coin_height = match spent.get(&input.previous_output) {
                Some(coin) => coin.height,
                None => prev.height + 1,
            };
            let locked = (sequence & SEQUENCE_MASK) as i64;
            if sequence & SEQUENCE_TYPE_FLAG != 0 {
                let anchor_height = coin_height.saturating_sub(1);
                let anchor = self
                    .db
                    .get_ancestor(prev, anchor_height)
                    .ok_or(DbError::NotFound("lock ancestor"))?;
                let anchor_time = median_time_past(&*self.db, &anchor) as i64;
                min_time = min_time.max(anchor_time + (locked << SEQUENCE_GRANULARITY) - 1);
            } else {
                min_height = min_height.max(coin_height as i64 + locked - 1);
            }
        }

        let height = prev.height as i64 + 1;
        if min_height >= height {
            return Ok(false);
        }
        if min_time >= 0 {
            let mtp = median_time_past(&*self.db, prev) as i64;
            if min_time >= mtp {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Expected compact bits for the block following `prev`, selected by
    /// activation state: legacy + emergency adjustment, the 144-block
    /// algorithm, or the anchored exponential schedule.
    pub fn get_target(&self, prev: &ChainEntry) -> Result<u32, ChainError> {
        let network = &self.options.network;
        if network.no_retargeting {
            return Ok(prev.bits);
        }

        let mtp = median_time_past(&*self.db, prev);
        if mtp >= network.asert_activation_time && prev.height >= network.asert_anchor.height {
            let anchor = network.asert_anchor;
            let target = asert_target(
                anchor.bits,
                anchor.height,
                anchor.parent_time,
                prev.height,
                prev.time as u64,
                network.target_spacing,
                ASERT_HALF_LIFE,
                &network.pow_limit,
            );
            return Ok(target_to_compact(target));
        }

        if prev.height + 1 >= network.daa_height && prev.height >= 146 {
            let last = self.get_suitable_block(prev)?;
            let first_anchor = self
                .db
                .get_ancestor(prev, prev.height - 144)
                .ok_or(DbError::NotFound("retarget ancestor"))?;
            let first = self.get_suitable_block(&first_anchor)?;
            let work = last.chainwork.wrapping_sub(first.chainwork);
            let timespan = (last.time as u64).saturating_sub(first.time as u64);
            let target =
                daa_target(work, timespan, network.target_spacing, &network.pow_limit);
            return Ok(target_to_compact(target));
        }

        let height = prev.height + 1;
        if height % network.retarget_interval != 0 {
            // Emergency adjustment between the fork and the 144-block
            // algorithm: a 12-hour gap over six blocks eases the target.
            if height >= network.uahf_height && prev.height >= 6 {
                let six = self
                    .db
                    .get_ancestor(prev, prev.height - 6)
                    .ok_or(DbError::NotFound("retarget ancestor"))?;
                let span = mtp.saturating_sub(median_time_past(&*self.db, &six));
                if span >= 12 * 3600 {
                    return Ok(eda_ease_bits(prev.bits, &network.pow_limit));
                }
            }
            return Ok(prev.bits);
        }

        let first = self
            .db
            .get_ancestor(prev, height - network.retarget_interval)
            .ok_or(DbError::NotFound("retarget ancestor"))?;
        Ok(legacy_retarget(
            prev.bits,
            first.time as u64,
            prev.time as u64,
            network.target_timespan,
            &network.pow_limit,
        ))
    }

    /// Median-of-three by timestamp over an entry and its two parents.
    fn get_suitable_block(&self, entry: &ChainEntry) -> Result<ChainEntry, ChainError> {
        let parent = self.db.get_previous(entry).ok_or(DbError::NotFound("suitable parent"))?;
        let grandparent =
            self.db.get_previous(&parent).ok_or(DbError::NotFound("suitable parent"))?;
        let mut candidates = [entry.clone(), parent, grandparent];
        candidates.sort_by_key(|candidate| candidate.time);
        Ok(candidates[1].clone())
    }

    // ----- orphan pool -----

    fn store_orphan(&mut self, block: Block, flags: u32, peer: u32) {
        let hash = block.block_hash();
        let prev = block.header.prev_blockhash;

        // A competing orphan on the same parent evicts the earlier one.
        if let Some(old_hash) = self.orphan_prev.get(&prev).copied() {
            self.orphans.remove(&old_hash);
            self.orphan_prev.remove(&prev);
        }
        self.limit_orphans();

        debug!("storing orphan {hash} (prev {prev})");
        self.orphan_prev.insert(prev, hash);
        self.orphans
            .insert(hash, Orphan { block: block.clone(), flags, peer, received: self.now() });
        self.emit(ChainEvent::Orphan(block));
    }

    fn limit_orphans(&mut self) {
        while self.orphans.len() >= self.options.max_orphans {
            let now = self.now();
            let victim = self
                .orphans
                .iter()
                .find(|(_, orphan)| orphan.received + ORPHAN_EXPIRY <= now)
                .or_else(|| self.orphans.iter().min_by_key(|(_, orphan)| orphan.received))
                .map(|(hash, _)| *hash);
            let Some(hash) = victim else { break };
            if let Some(orphan) = self.orphans.remove(&hash) {
                debug!("evicting orphan {hash}");
                self.orphan_prev.remove(&orphan.block.header.prev_blockhash);
            }
        }
    }

    fn purge_orphans(&mut self) {
        if !self.orphans.is_empty() {
            info!("purging {} orphans", self.orphans.len());
        }
        self.orphans.clear();
        self.orphan_prev.clear();
    }

    /// Connects every orphan waiting on a newly attached entry, chasing
    /// the chain of resolutions until no orphan fits.
    fn handle_orphans(&mut self, mut entry: ChainEntry, _peer: u32) -> Result<(), ChainError> {
        while let Some(hash) = self.orphan_prev.remove(&entry.hash) {
            let Some(orphan) = self.orphans.remove(&hash) else { break };
            match self.connect(entry.clone(), orphan.block, orphan.flags) {
                Ok(next) => entry = next,
                Err(ChainError::Verify(error)) => {
                    if !error.malleated {
                        self.set_invalid(hash);
                    }
                    warn!("bad orphan from peer {}: {}", orphan.peer, error.reason);
                    self.emit(ChainEvent::BadOrphan { error, peer: orphan.peer });
                    break;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    // ----- administrative operations -----

    /// Rolls the chain back to `height`, dropping everything above it.
    pub fn reset(&mut self, height: u32) -> Result<(), ChainError> {
        let tip = self.db.reset(height)?;
        self.tip = tip.clone();
        self.refresh_state()?;
        self.purge_orphans();
        self.invalid.clear();
        info!("chain reset to height {}", height);
        self.emit(ChainEvent::Reset(tip));
        Ok(())
    }

    /// Marks a block invalid and, when it is on the main chain, rewinds
    /// to its parent.
    pub fn invalidate(&mut self, hash: &BlockHash) -> Result<(), ChainError> {
        self.set_invalid(*hash);
        if let Some(entry) = self.db.get_entry(hash) {
            if self.db.is_main_chain(hash) && entry.height > 0 {
                let target = entry.height - 1;
                let tip = self.db.reset(target)?;
                self.tip = tip.clone();
                self.refresh_state()?;
                self.purge_orphans();
                self.emit(ChainEvent::Reset(tip));
            }
        }
        Ok(())
    }

    /// Rewinds to `height` and revalidates the main chain above it from
    /// the stored blocks.
    pub fn replay(&mut self, height: u32) -> Result<(), ChainError> {
        let tip_height = self.tip.height;
        let mut blocks = Vec::new();
        for replay_height in height + 1..=tip_height {
            let hash = self.db.get_hash(replay_height).ok_or(DbError::NotFound("replay hash"))?;
            blocks.push(self.db.get_block(&hash).ok_or(DbError::NotFound("replay block"))?);
        }
        self.reset(height)?;
        for block in blocks {
            self.add(block, VERIFY_BODY, 0)?;
        }
        Ok(())
    }

    /// Drops stored block bodies below `height`.
    pub fn prune(&mut self, height: u32) -> Result<(), ChainError> {
        self.db.prune(height)?;
        Ok(())
    }

    /// Walks the main chain from `start`, invoking `callback` until it
    /// returns false or the tip is reached.
    pub fn scan(
        &self,
        start: u32,
        callback: &mut dyn FnMut(&ChainEntry, &Block) -> bool,
    ) -> Result<(), ChainError> {
        for height in start..=self.tip.height {
            let entry =
                self.db.get_entry_by_height(height).ok_or(DbError::NotFound("scan entry"))?;
            let block = self.db.get_block(&entry.hash).ok_or(DbError::NotFound("scan block"))?;
            if !callback(&entry, &block) {
                break;
            }
        }
        Ok(())
    }

    /// Block locator: dense near the tip, exponentially sparse towards
    /// genesis, genesis always included.
    pub fn get_locator(&self, from: Option<&BlockHash>) -> Vec<BlockHash> {
        let start = from
            .and_then(|hash| self.db.get_entry(hash))
            .unwrap_or_else(|| self.tip.clone());

        let mut hashes = Vec::new();
        let mut height = start.height as i64;
        let mut step = 1i64;
        loop {
            let Some(entry) = self.db.get_ancestor(&start, height as u32) else { break };
            hashes.push(entry.hash);
            if height == 0 {
                break;
            }
            if hashes.len() > 10 {
                step *= 2;
            }
            height = (height - step).max(0);
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaindb::MemChainDB;
    use crate::params::Network;
    use crate::script::ScriptBuilder;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::{Header, Version as BlockVersion};
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, CompactTarget, ScriptBuf, Sequence, TxIn, TxMerkleNode, TxOut, Witness};

    const REGTEST_BITS: u32 = 0x207f_ffff;
    const GENESIS_TIME: u32 = 1_600_000_000;

    fn coinbase(height: u32, value: u64) -> Transaction {
        let script = ScriptBuilder::new()
            .push_num(height as i64)
            .push_data(&[0u8; 60])
            .into_script();
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(script.to_bytes()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    fn build_block(prev: BlockHash, height: u32, time: u32, nonce: u32) -> Block {
        let txdata = vec![coinbase(height, 50 * crate::tx::COIN)];
        let mut block = Block {
            header: Header {
                version: BlockVersion::from_consensus(4),
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time,
                bits: CompactTarget::from_consensus(REGTEST_BITS),
                nonce,
            },
            txdata,
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        block
    }

    fn genesis() -> Block {
        build_block(BlockHash::all_zeros(), 0, GENESIS_TIME, 0)
    }

    fn test_chain() -> Chain {
        let db = MemChainDB::with_genesis(genesis());
        let mut options = ChainOptions::new(Network::regtest());
        options.mock_time = Some(GENESIS_TIME as u64 + 100_000);
        let mut chain = Chain::new(Box::new(db), options);
        chain.open().unwrap();
        chain
    }

    #[test]
    fn extends_the_main_chain() {
        let mut chain = test_chain();
        let genesis_hash = chain.tip().hash;
        let block = build_block(genesis_hash, 1, GENESIS_TIME + 600, 1);
        let entry = chain.add(block, VERIFY_BODY, 0).unwrap().unwrap();
        assert_eq!(entry.height, 1);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.get_entry(&entry.hash).unwrap().height, 1);
        assert!(entry.chainwork > chain.get_entry_by_height(0).unwrap().chainwork);
    }

    #[test]
    fn duplicate_blocks_are_rejected() {
        let mut chain = test_chain();
        let block = build_block(chain.tip().hash, 1, GENESIS_TIME + 600, 1);
        chain.add(block.clone(), VERIFY_BODY, 0).unwrap();
        assert_eq!(chain.add(block, VERIFY_BODY, 0), Err(ChainError::duplicate()));
    }

    #[test]
    fn orphans_wait_for_their_parent() {
        let mut chain = test_chain();
        let genesis_hash = chain.tip().hash;
        let first = build_block(genesis_hash, 1, GENESIS_TIME + 600, 1);
        let second = build_block(first.block_hash(), 2, GENESIS_TIME + 1200, 2);

        assert_eq!(chain.add(second.clone(), VERIFY_BODY, 7).unwrap(), None);
        assert!(chain.has_orphan(&second.block_hash()));

        // The parent arrives; both connect.
        chain.add(first, VERIFY_BODY, 7).unwrap().unwrap();
        assert_eq!(chain.height(), 2);
        assert!(!chain.has_orphan(&second.block_hash()));
    }

    #[test]
    fn orphan_pool_is_bounded() {
        let mut chain = test_chain();
        chain.options.max_orphans = 3;
        for i in 0..5u32 {
            let missing_parent = BlockHash::from_byte_array([i as u8 + 1; 32]);
            let orphan = build_block(missing_parent, 1, GENESIS_TIME + 600 + i, i);
            chain.add(orphan, VERIFY_BODY, 0).unwrap();
        }
        assert!(chain.orphans.len() <= 3);
    }

    #[test]
    fn locator_heights_strictly_decrease() {
        let mut chain = test_chain();
        let mut prev = chain.tip().hash;
        for height in 1..=40u32 {
            let block = build_block(prev, height, GENESIS_TIME + 600 * height, height);
            prev = block.block_hash();
            chain.add(block, VERIFY_BODY, 0).unwrap();
        }

        let locator = chain.get_locator(None);
        let heights: Vec<u32> =
            locator.iter().map(|hash| chain.get_entry(hash).unwrap().height).collect();
        assert_eq!(heights[0], 40);
        assert_eq!(*heights.last().unwrap(), 0);
        assert!(heights.windows(2).all(|pair| pair[0] > pair[1]));
        assert!(locator.len() <= 20);
    }

    #[test]
    fn events_fire_in_tip_block_connect_order() {
        let mut chain = test_chain();
        let block = build_block(chain.tip().hash, 1, GENESIS_TIME + 600, 1);
        chain.add(block, VERIFY_BODY, 0).unwrap();

        let events = chain.drain_events();
        let names: Vec<&str> = events
            .iter()
            .map(|event| match event {
                ChainEvent::Tip(_) => "tip",
                ChainEvent::Block(_, _) => "block",
                ChainEvent::Connect(_, _, _) => "connect",
                _ => "other",
            })
            .collect();
        assert_eq!(names, ["tip", "block", "connect"]);
        assert!(matches!(&events[0], ChainEvent::Tip(entry) if entry.height == 1));
        assert!(chain.drain_events().is_empty());
    }

    #[test]
    fn invalid_block_is_cached() {
        let mut chain = test_chain();
        // Wrong coinbase height commitment.
        let mut block = build_block(chain.tip().hash, 5, GENESIS_TIME + 600, 1);
        block.txdata[0] = coinbase(9, 50 * crate::tx::COIN);
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        let hash = block.block_hash();

        let error = chain.add(block.clone(), VERIFY_BODY, 0).unwrap_err();
        assert!(matches!(error, ChainError::Verify(ref e) if e.reason == "bad-cb-height"));
        // Resubmission is cut off by the invalid cache.
        let error = chain.add(block, VERIFY_BODY, 0).unwrap_err();
        assert!(matches!(error, ChainError::Verify(ref e) if e.kind == VerifyKind::Duplicate));
        assert!(chain.invalid.contains(&hash));
    }
}
