//! Unspent outputs and the per-block coin view.

use std::collections::HashMap;

use bitcoin::{OutPoint, Transaction, TxOut};

/// One unspent transaction output with its creation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub coinbase: bool,
}

impl Coin {
    pub fn value(&self) -> u64 {
        self.output.value.to_sat()
    }
}

/// In-memory overlay of UTXO changes for one block (or one reorg step).
///
/// Spends read through to the backing store; outputs created and spent
/// within the same view never touch the store and leave no undo record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinView {
    created: HashMap<OutPoint, Coin>,
    spent: HashMap<OutPoint, Coin>,
}

impl CoinView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every output of `tx` to the view.
    pub fn add_tx(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.compute_txid();
        let coinbase = tx.is_coinbase();
        for (vout, output) in tx.output.iter().enumerate() {
            let outpoint = OutPoint { txid, vout: vout as u32 };
            self.created.insert(outpoint, Coin { output: output.clone(), height, coinbase });
        }
    }

    /// Spends `outpoint`, reading through `read_store` when the output
    /// was not created inside this view. Returns the spent coin, or
    /// `None` when it is missing or already spent.
    pub fn spend(
        &mut self,
        outpoint: &OutPoint,
        read_store: impl Fn(&OutPoint) -> Option<Coin>,
    ) -> Option<Coin> {
        if let Some(coin) = self.created.remove(outpoint) {
            return Some(coin);
        }
        if self.spent.contains_key(outpoint) {
            return None;
        }
        let coin = read_store(outpoint)?;
        self.spent.insert(*outpoint, coin.clone());
        Some(coin)
    }

    /// Reads a coin without spending it.
    pub fn peek(
        &self,
        outpoint: &OutPoint,
        read_store: impl Fn(&OutPoint) -> Option<Coin>,
    ) -> Option<Coin> {
        if let Some(coin) = self.created.get(outpoint) {
            return Some(coin.clone());
        }
        if self.spent.contains_key(outpoint) {
            return None;
        }
        read_store(outpoint)
    }

    /// Outputs the view creates in the backing store.
    pub fn created(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.created.iter()
    }

    /// Store-backed coins the view spends, with their prior state: the
    /// undo journal for a disconnect.
    pub fn spent(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.spent.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.spent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, Witness};

    fn coin(value: u64) -> Coin {
        Coin {
            output: TxOut { value: Amount::from_sat(value), script_pubkey: ScriptBuf::new() },
            height: 1,
            coinbase: false,
        }
    }

    fn dummy_tx() -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(7), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn spend_reads_through_and_records_undo() {
        let mut view = CoinView::new();
        let outpoint = OutPoint { txid: bitcoin::Txid::from_byte_array([9; 32]), vout: 0 };
        let store = |op: &OutPoint| if *op == outpoint { Some(coin(50)) } else { None };

        let spent = view.spend(&outpoint, store).unwrap();
        assert_eq!(spent.value(), 50);
        // Double spend within the view fails.
        assert!(view.spend(&outpoint, store).is_none());
        assert_eq!(view.spent().count(), 1);
    }

    #[test]
    fn same_view_outputs_leave_no_undo() {
        let mut view = CoinView::new();
        let tx = dummy_tx();
        view.add_tx(&tx, 5);
        let outpoint = OutPoint { txid: tx.compute_txid(), vout: 0 };
        let spent = view.spend(&outpoint, |_| None).unwrap();
        assert_eq!(spent.value(), 7);
        assert_eq!(view.spent().count(), 0);
        assert_eq!(view.created().count(), 0);
    }

    #[test]
    fn missing_coin_is_none() {
        let mut view = CoinView::new();
        let outpoint = OutPoint::default();
        assert!(view.spend(&outpoint, |_| None).is_none());
    }
}
