//! Transaction signature hashing.
//!
//! Two digest algorithms coexist: the original Satoshi algorithm for
//! signatures without the fork id, and the BIP143-style digest that the
//! fork made mandatory for fork-id signatures. The BIP143 intermediate
//! hashes are cached per transaction, since every input reuses them.

use bitcoin::consensus::{self, encode::VarInt, Encodable};
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::sighash::SighashCache;
use bitcoin::Transaction;

use crate::error::ScriptError;

/// Sign all outputs.
pub const SIGHASH_ALL: u32 = 0x01;
/// Sign no outputs.
pub const SIGHASH_NONE: u32 = 0x02;
/// Sign only the output paired with the signed input.
pub const SIGHASH_SINGLE: u32 = 0x03;
/// Fork id bit marking a replay-protected signature.
pub const SIGHASH_FORKID: u32 = 0x40;
/// Sign only this input.
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Mask selecting the base hash type.
const SIGHASH_OUTPUT_MASK: u32 = 0x1f;

/// Per-transaction signature hash state.
pub struct SigHasher<'t> {
    tx: &'t Transaction,
    hash_prevouts: Option<sha256d::Hash>,
    hash_sequence: Option<sha256d::Hash>,
    hash_outputs: Option<sha256d::Hash>,
}

impl<'t> SigHasher<'t> {
    pub fn new(tx: &'t Transaction) -> Self {
        Self { tx, hash_prevouts: None, hash_sequence: None, hash_outputs: None }
    }

    pub fn tx(&self) -> &Transaction {
        self.tx
    }

    /// Computes the digest a signature with `hashtype` commits to.
    ///
    /// `use_forkid` is the caller's decision that the fork-id algorithm
    /// applies (hashtype carries the bit and the fork-id flag is active);
    /// otherwise the legacy algorithm is used, including its
    /// SIGHASH_SINGLE out-of-range quirk.
    pub fn signature_hash(
        &mut self,
        input_index: usize,
        script_code: &[u8],
        value: u64,
        hashtype: u32,
        use_forkid: bool,
    ) -> Result<[u8; 32], ScriptError> {
        if input_index >= self.tx.input.len() {
            return Err(ScriptError::UnknownError);
        }
        if use_forkid {
            Ok(self.forkid_hash(input_index, script_code, value, hashtype))
        } else {
            let cache = SighashCache::new(self.tx);
            let script = bitcoin::Script::from_bytes(script_code);
            let hash = cache
                .legacy_signature_hash(input_index, script, hashtype)
                .map_err(|_| ScriptError::UnknownError)?;
            Ok(hash.to_byte_array())
        }
    }

    fn forkid_hash(&mut self, input_index: usize, script_code: &[u8], value: u64, hashtype: u32) -> [u8; 32] {
        let base = hashtype & SIGHASH_OUTPUT_MASK;
        let anyone_can_pay = hashtype & SIGHASH_ANYONECANPAY != 0;
        let input = &self.tx.input[input_index];

        let zero = [0u8; 32];
        let mut engine = sha256d::Hash::engine();
        engine.input(&self.tx.version.0.to_le_bytes());

        if anyone_can_pay {
            engine.input(&zero);
        } else {
            let hash = *self.hash_prevouts.get_or_insert_with(|| {
                hash_serialized(self.tx.input.iter().map(|txin| &txin.previous_output))
            });
            engine.input(hash.as_byte_array());
        }

        if !anyone_can_pay && base == SIGHASH_ALL {
            let hash = *self
                .hash_sequence
                .get_or_insert_with(|| hash_serialized(self.tx.input.iter().map(|txin| &txin.sequence)));
            engine.input(hash.as_byte_array());
        } else {
            engine.input(&zero);
        }

        engine.input(&consensus::serialize(&input.previous_output));
        engine.input(&consensus::serialize(&VarInt(script_code.len() as u64)));
        engine.input(script_code);
        engine.input(&value.to_le_bytes());
        engine.input(&input.sequence.to_consensus_u32().to_le_bytes());

        match base {
            SIGHASH_SINGLE if input_index < self.tx.output.len() => {
                let hash = hash_serialized(std::iter::once(&self.tx.output[input_index]));
                engine.input(hash.as_byte_array());
            }
            SIGHASH_NONE | SIGHASH_SINGLE => engine.input(&zero),
            _ => {
                let hash = *self
                    .hash_outputs
                    .get_or_insert_with(|| hash_serialized(self.tx.output.iter()));
                engine.input(hash.as_byte_array());
            }
        }

        engine.input(&self.tx.lock_time.to_consensus_u32().to_le_bytes());
        engine.input(&hashtype.to_le_bytes());

        sha256d::Hash::from_engine(engine).to_byte_array()
    }
}

fn hash_serialized<'a, I, T>(items: I) -> sha256d::Hash
where
    I: IntoIterator<Item = &'a T>,
    T: Encodable + 'a,
{
    let mut engine = sha256d::Hash::engine();
    for item in items {
        engine.input(&consensus::serialize(item));
    }
    sha256d::Hash::from_engine(engine)
}
