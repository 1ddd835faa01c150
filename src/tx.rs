//! Transaction-level consensus checks and helpers.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Transaction};

use crate::coins::Coin;
use crate::error::{VerifyError, VerifyKind};
use crate::pow::U256;
use crate::script::{Opcode, Script};
use crate::scriptnum::ScriptNum;

/// One coin in satoshis.
pub const COIN: u64 = 100_000_000;
/// Total money supply cap.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;
/// Minimum serialized transaction size once transaction ordering is in
/// force.
pub const MIN_TX_SIZE: usize = 100;
/// Signature operation cap per transaction.
pub const MAX_TX_SIGOPS: u32 = 20_000;
/// Signature operation budget per megabyte of block.
pub const MAX_BLOCK_SIGOPS_PER_MB: u32 = 20_000;
/// Locktime values at or above this are timestamps, not heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Miner reward before fees at `height`.
pub fn get_block_subsidy(height: u32, halving_interval: u32) -> u64 {
    let halvings = height / halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

/// Whether `tx` is final with respect to a block at `height` whose
/// effective time is `time` (median-time-past once CSV locks are live).
pub fn is_final(tx: &Transaction, height: u32, time: u64) -> bool {
    let locktime = tx.lock_time.to_consensus_u32();
    if locktime == 0 {
        return true;
    }
    let threshold_value =
        if locktime < LOCKTIME_THRESHOLD { height as u64 } else { time };
    if (locktime as u64) < threshold_value {
        return true;
    }
    tx.input.iter().all(|input| input.sequence.to_consensus_u32() == u32::MAX)
}

/// Context-free transaction sanity.
pub fn check_transaction(tx: &Transaction) -> Result<(), VerifyError> {
    if tx.input.is_empty() {
        return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-vin-empty", 100));
    }
    if tx.output.is_empty() {
        return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-vout-empty", 100));
    }

    let mut total: u64 = 0;
    for output in &tx.output {
        let value = output.value.to_sat();
        if value > MAX_MONEY {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-vout-toolarge", 100));
        }
        total = total.saturating_add(value);
        if total > MAX_MONEY {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-txouttotal-toolarge", 100));
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(tx.input.len());
    for input in &tx.input {
        if !seen.insert(input.previous_output) {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-inputs-duplicate", 100));
        }
    }

    if tx.is_coinbase() {
        let len = tx.input[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(VerifyError::new(VerifyKind::Invalid, "bad-cb-length", 100));
        }
    } else if tx.input.iter().any(|input| input.previous_output == OutPoint::null()) {
        return Err(VerifyError::new(VerifyKind::Invalid, "bad-txns-prevout-null", 100));
    }

    Ok(())
}

/// The height committed in a coinbase script, per BIP34.
pub fn coinbase_height(tx: &Transaction) -> Option<i64> {
    let script = Script::from_bytes(tx.input.first()?.script_sig.as_bytes());
    match script.ops().first()? {
        Opcode::Push { data, .. } => ScriptNum::decode(data, false, 6).ok().map(|num| num.value()),
        op @ Opcode::Code(byte) if op.is_push() => match *byte {
            0x00 => Some(0),
            0x4f => Some(-1),
            byte => Some((byte - 0x50) as i64),
        },
        _ => None,
    }
}

/// Counts the signature operations `tx` contributes to its block,
/// including P2SH redeem scripts resolved through the spent coins.
pub fn tx_sigops(tx: &Transaction, spent: impl Fn(&OutPoint) -> Option<Coin>) -> u32 {
    let mut total: u32 = 0;
    for output in &tx.output {
        total = total.saturating_add(Script::from_bytes(output.script_pubkey.as_bytes()).sigops(false));
    }
    if tx.is_coinbase() {
        return total;
    }
    for input in &tx.input {
        let script_sig = Script::from_bytes(input.script_sig.as_bytes());
        total = total.saturating_add(script_sig.sigops(false));
        if let Some(coin) = spent(&input.previous_output) {
            let script_pubkey = Script::from_bytes(coin.output.script_pubkey.as_bytes());
            if script_pubkey.is_p2sh() {
                total = total.saturating_add(script_pubkey.p2sh_sigops(&script_sig));
            }
        }
    }
    total
}

/// Numeric value of a txid for transaction-ordering comparisons.
pub fn txid_order_key(tx: &Transaction) -> U256 {
    U256::from_le_bytes(tx.compute_txid().to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{opcodes, ScriptBuilder};
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn tx_with(locktime: u32, sequence: u32) -> Transaction {
        Transaction {
            version: Version(1),
            lock_time: LockTime::from_consensus(locktime),
            input: vec![TxIn {
                previous_output: OutPoint { txid: bitcoin::Txid::from_byte_array([1; 32]), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence(sequence),
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn subsidy_halves_on_schedule() {
        assert_eq!(get_block_subsidy(0, 210_000), 50 * COIN);
        assert_eq!(get_block_subsidy(209_999, 210_000), 50 * COIN);
        assert_eq!(get_block_subsidy(210_000, 210_000), 25 * COIN);
        assert_eq!(get_block_subsidy(210_000 * 64, 210_000), 0);
    }

    #[test]
    fn finality_rules() {
        assert!(is_final(&tx_with(0, 0), 100, 0));
        // Height lock not yet reached, sequence allows replacement.
        assert!(!is_final(&tx_with(100, 0), 100, 0));
        assert!(is_final(&tx_with(100, 0), 101, 0));
        // Max sequences make any locktime final.
        assert!(is_final(&tx_with(100, u32::MAX), 100, 0));
        // Time locks compare against the effective time.
        assert!(!is_final(&tx_with(LOCKTIME_THRESHOLD + 10, 0), 0, LOCKTIME_THRESHOLD as u64));
        assert!(is_final(&tx_with(LOCKTIME_THRESHOLD + 10, 0), 0, LOCKTIME_THRESHOLD as u64 + 11));
    }

    #[test]
    fn sanity_rejects_duplicates_and_empties() {
        let mut tx = tx_with(0, 0);
        tx.input.push(tx.input[0].clone());
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-inputs-duplicate");

        let mut tx = tx_with(0, 0);
        tx.input.clear();
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-vin-empty");

        let mut tx = tx_with(0, 0);
        tx.output.clear();
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-vout-empty");
    }

    #[test]
    fn coinbase_height_reads_first_push() {
        let mut tx = tx_with(0, 0);
        tx.input[0].previous_output = OutPoint::null();
        tx.input[0].script_sig = ScriptBuf::from_bytes(
            ScriptBuilder::new().push_num(227_931).push_data(&[0u8; 8]).into_script().to_bytes(),
        );
        assert!(tx.is_coinbase());
        assert_eq!(coinbase_height(&tx), Some(227_931));

        tx.input[0].script_sig =
            ScriptBuf::from_bytes(vec![opcodes::OP_3, opcodes::OP_0, opcodes::OP_0]);
        assert_eq!(coinbase_height(&tx), Some(3));
    }

    #[test]
    fn sigops_resolve_p2sh_redeems() {
        let redeem = ScriptBuilder::new()
            .push_opcode(opcodes::OP_2)
            .push_data(&[0x02; 33])
            .push_data(&[0x03; 33])
            .push_opcode(opcodes::OP_2)
            .push_opcode(opcodes::OP_CHECKMULTISIG)
            .into_script();
        let hash = bitcoin::hashes::hash160::Hash::hash(redeem.as_bytes()).to_byte_array();
        let p2sh = ScriptBuilder::new()
            .push_opcode(opcodes::OP_HASH160)
            .push_data(&hash)
            .push_opcode(opcodes::OP_EQUAL)
            .into_script();

        let mut tx = tx_with(0, 0);
        tx.input[0].script_sig =
            ScriptBuf::from_bytes(ScriptBuilder::new().push_data(redeem.as_bytes()).into_script().to_bytes());

        let coin = Coin {
            output: TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::from_bytes(p2sh.to_bytes()),
            },
            height: 1,
            coinbase: false,
        };
        assert_eq!(tx_sigops(&tx, |_| Some(coin.clone())), 2);
        assert_eq!(tx_sigops(&tx, |_| None), 0);
    }
}
