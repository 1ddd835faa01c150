//! Chain storage collaborator.
//!
//! The chain talks to its store exclusively through [`ChainDB`], so a
//! durable backend can replace the in-memory one without touching the
//! validation logic. [`MemChainDB`] keeps per-block undo journals so
//! disconnects and reorganizations restore the UTXO set exactly.

use std::collections::HashMap;

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, OutPoint, Txid};

use crate::coins::{Coin, CoinView};
use crate::deployments::ThresholdState;
use crate::error::DbError;
use crate::pow::{work_from_bits, U256};

/// One header's worth of index state. Entries form a tree rooted at
/// genesis; the main chain is the path of greatest cumulative chainwork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: BlockHash,
    pub prev: BlockHash,
    pub height: u32,
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub chainwork: U256,
}

impl ChainEntry {
    /// Builds the entry for `header` on top of `prev` (`None` for
    /// genesis), accumulating chainwork.
    pub fn from_header(header: &Header, prev: Option<&ChainEntry>) -> ChainEntry {
        let bits = header.bits.to_consensus();
        let parent_work = prev.map(|p| p.chainwork).unwrap_or(U256::ZERO);
        ChainEntry {
            hash: header.block_hash(),
            prev: header.prev_blockhash,
            height: prev.map(|p| p.height + 1).unwrap_or(0),
            version: header.version.to_consensus(),
            time: header.time,
            bits,
            nonce: header.nonce,
            chainwork: parent_work.saturating_add(work_from_bits(bits)),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

/// Storage contract the chain validates against.
pub trait ChainDB {
    fn open(&mut self) -> Result<(), DbError>;
    fn close(&mut self) -> Result<(), DbError>;

    fn tip(&self) -> Option<ChainEntry>;
    fn get_entry(&self, hash: &BlockHash) -> Option<ChainEntry>;
    fn get_entry_by_height(&self, height: u32) -> Option<ChainEntry>;
    fn get_hash(&self, height: u32) -> Option<BlockHash>;
    fn has_entry(&self, hash: &BlockHash) -> bool;
    fn is_main_chain(&self, hash: &BlockHash) -> bool;
    fn get_previous(&self, entry: &ChainEntry) -> Option<ChainEntry>;
    fn get_next_hash(&self, hash: &BlockHash) -> Option<BlockHash>;
    fn get_ancestor(&self, entry: &ChainEntry, height: u32) -> Option<ChainEntry>;

    fn get_block(&self, hash: &BlockHash) -> Option<Block>;
    fn read_coin(&self, outpoint: &OutPoint) -> Option<Coin>;
    /// True when any output of `txid` is currently unspent.
    fn has_coins(&self, txid: &Txid) -> bool;

    /// Persists an entry and block. With a view the block joins the main
    /// chain (coins applied, undo recorded, tip advanced); without one it
    /// is stored as an alternate.
    fn save(&mut self, entry: &ChainEntry, block: &Block, view: Option<&CoinView>)
        -> Result<(), DbError>;
    /// Reattaches a previously disconnected block during a reorg.
    fn reconnect(&mut self, entry: &ChainEntry, block: &Block, view: &CoinView)
        -> Result<(), DbError>;
    /// Detaches the tip block, restoring its spent coins from the undo
    /// journal. Returns the view of restored state.
    fn disconnect(&mut self, entry: &ChainEntry, block: &Block) -> Result<CoinView, DbError>;
    /// Rolls the main chain back to `height`, returning the new tip.
    fn reset(&mut self, height: u32) -> Result<ChainEntry, DbError>;
    /// Drops block bodies below `height`; index entries survive.
    fn prune(&mut self, height: u32) -> Result<(), DbError>;

    /// BIP9 per-(bit, window-start) state cache.
    fn state_get(&self, bit: u8, hash: &BlockHash) -> Option<ThresholdState>;
    fn state_set(&mut self, bit: u8, hash: BlockHash, state: ThresholdState);
}

/// Median of the 11 preceding timestamps (the entry's own included).
pub fn median_time_past(db: &dyn ChainDB, entry: &ChainEntry) -> u64 {
    let mut times = Vec::with_capacity(11);
    let mut cursor = Some(entry.clone());
    while let Some(current) = cursor {
        times.push(current.time as u64);
        if times.len() == 11 || current.is_genesis() {
            break;
        }
        cursor = db.get_previous(&current);
    }
    times.sort_unstable();
    times[times.len() / 2]
}

/// In-memory chain store with full undo support.
#[derive(Default)]
pub struct MemChainDB {
    entries: HashMap<BlockHash, ChainEntry>,
    blocks: HashMap<BlockHash, Block>,
    main: Vec<BlockHash>,
    next: HashMap<BlockHash, BlockHash>,
    coins: HashMap<OutPoint, Coin>,
    undo: HashMap<BlockHash, Vec<(OutPoint, Coin)>>,
    state_cache: HashMap<(u8, BlockHash), ThresholdState>,
}

impl MemChainDB {
    /// Creates a store seeded with a genesis block.
    pub fn with_genesis(genesis: Block) -> Self {
        let mut db = MemChainDB::default();
        let entry = ChainEntry::from_header(&genesis.header, None);
        let mut view = CoinView::new();
        for tx in &genesis.txdata {
            view.add_tx(tx, 0);
        }
        db.main.push(entry.hash);
        db.apply_view(&view);
        db.undo.insert(entry.hash, Vec::new());
        db.blocks.insert(entry.hash, genesis);
        db.entries.insert(entry.hash, entry);
        db
    }

    fn apply_view(&mut self, view: &CoinView) -> Vec<(OutPoint, Coin)> {
        let mut undo = Vec::new();
        for (outpoint, coin) in view.spent() {
            self.coins.remove(outpoint);
            undo.push((*outpoint, coin.clone()));
        }
        for (outpoint, coin) in view.created() {
            self.coins.insert(*outpoint, coin.clone());
        }
        undo
    }

    fn attach(&mut self, entry: &ChainEntry, view: &CoinView) -> Result<(), DbError> {
        if entry.height as usize != self.main.len() {
            return Err(DbError::Corrupt("attach out of order"));
        }
        let undo = self.apply_view(view);
        self.undo.insert(entry.hash, undo);
        self.next.insert(entry.prev, entry.hash);
        self.main.push(entry.hash);
        Ok(())
    }
}

impl ChainDB for MemChainDB {
    fn open(&mut self) -> Result<(), DbError> {
        if self.main.is_empty() {
            return Err(DbError::Corrupt("no genesis"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn tip(&self) -> Option<ChainEntry> {
        self.main.last().and_then(|hash| self.entries.get(hash).cloned())
    }

    fn get_entry(&self, hash: &BlockHash) -> Option<ChainEntry> {
        self.entries.get(hash).cloned()
    }

    fn get_entry_by_height(&self, height: u32) -> Option<ChainEntry> {
        self.main.get(height as usize).and_then(|hash| self.entries.get(hash).cloned())
    }

    fn get_hash(&self, height: u32) -> Option<BlockHash> {
        self.main.get(height as usize).copied()
    }

    fn has_entry(&self, hash: &BlockHash) -> bool {
        self.entries.contains_key(hash)
    }

    fn is_main_chain(&self, hash: &BlockHash) -> bool {
        self.entries
            .get(hash)
            .map(|entry| self.main.get(entry.height as usize) == Some(hash))
            .unwrap_or(false)
    }

    fn get_previous(&self, entry: &ChainEntry) -> Option<ChainEntry> {
        if entry.is_genesis() {
            return None;
        }
        self.entries.get(&entry.prev).cloned()
    }

    fn get_next_hash(&self, hash: &BlockHash) -> Option<BlockHash> {
        self.next.get(hash).copied()
    }

    fn get_ancestor(&self, entry: &ChainEntry, height: u32) -> Option<ChainEntry> {
        if height > entry.height {
            return None;
        }
        // Fast path along the main chain.
        if self.is_main_chain(&entry.hash) {
            return self.get_entry_by_height(height);
        }
        let mut cursor = entry.clone();
        while cursor.height > height {
            cursor = self.get_previous(&cursor)?;
        }
        Some(cursor)
    }

    fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        self.blocks.get(hash).cloned()
    }

    fn read_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(outpoint).cloned()
    }

    fn has_coins(&self, txid: &Txid) -> bool {
        self.coins.keys().any(|outpoint| outpoint.txid == *txid)
    }

    fn save(&mut self, entry: &ChainEntry, block: &Block, view: Option<&CoinView>)
        -> Result<(), DbError> {
        self.entries.insert(entry.hash, entry.clone());
        self.blocks.insert(entry.hash, block.clone());
        if let Some(view) = view {
            self.attach(entry, view)?;
        }
        Ok(())
    }

    fn reconnect(&mut self, entry: &ChainEntry, block: &Block, view: &CoinView)
        -> Result<(), DbError> {
        if !self.entries.contains_key(&entry.hash) {
            return Err(DbError::NotFound("reconnect entry"));
        }
        self.blocks.insert(entry.hash, block.clone());
        self.attach(entry, view)
    }

    fn disconnect(&mut self, entry: &ChainEntry, block: &Block) -> Result<CoinView, DbError> {
        if self.main.last() != Some(&entry.hash) {
            return Err(DbError::Corrupt("disconnect of non-tip"));
        }
        let undo = self.undo.remove(&entry.hash).ok_or(DbError::NotFound("undo data"))?;

        for tx in &block.txdata {
            let txid = tx.compute_txid();
            for vout in 0..tx.output.len() {
                self.coins.remove(&OutPoint { txid, vout: vout as u32 });
            }
        }
        let mut view = CoinView::new();
        for (outpoint, coin) in undo {
            self.coins.insert(outpoint, coin.clone());
            view.spend(&outpoint, |_| Some(coin.clone()));
        }
        self.main.pop();
        self.next.remove(&entry.prev);
        Ok(view)
    }

    fn reset(&mut self, height: u32) -> Result<ChainEntry, DbError> {
        while self.main.len() as u32 > height + 1 {
            let hash = *self.main.last().ok_or(DbError::Corrupt("empty chain"))?;
            let entry = self.get_entry(&hash).ok_or(DbError::NotFound("tip entry"))?;
            let block = self.get_block(&hash).ok_or(DbError::NotFound("tip block"))?;
            self.disconnect(&entry, &block)?;
            self.entries.remove(&hash);
            self.blocks.remove(&hash);
        }
        self.tip().ok_or(DbError::Corrupt("reset past genesis"))
    }

    fn prune(&mut self, height: u32) -> Result<(), DbError> {
        for hash in self.main.iter().take(height as usize).skip(1) {
            self.blocks.remove(hash);
        }
        Ok(())
    }

    fn state_get(&self, bit: u8, hash: &BlockHash) -> Option<ThresholdState> {
        self.state_cache.get(&(bit, *hash)).copied()
    }

    fn state_set(&mut self, bit: u8, hash: BlockHash, state: ThresholdState) {
        self.state_cache.insert((bit, hash), state);
    }
}

/// A null hash marks "no block".
pub fn zero_hash() -> BlockHash {
    BlockHash::all_zeros()
}
