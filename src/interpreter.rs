//! Script interpreter.
//!
//! Executes a script against a stack under a flag mask, resolving
//! signature and locktime checks against a transaction context. Errors
//! are deterministic and surfaced verbatim; nothing here recovers.

use std::sync::OnceLock;

use bitcoin::hashes::{hash160, ripemd160, sha1, sha256, sha256d, Hash};
use bitcoin::secp256k1::{self, ecdsa, schnorr, Message, PublicKey, Secp256k1};
use bitcoin::Transaction;

use crate::error::ScriptError;
use crate::script::opcodes::*;
use crate::script::{Opcode, Script, MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG};
use crate::scriptnum::{ScriptNum, MAX_NUM_LEN, MAX_NUM_LEN_LOCKTIME};
use crate::sighash::{SigHasher, SIGHASH_ANYONECANPAY, SIGHASH_FORKID, SIGHASH_SINGLE};
use crate::stack::{cast_to_bool, Stack, MAX_ELEMENT_SIZE, MAX_STACK_DEPTH};
use crate::{
    VERIFY_CHECKDATASIG, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_CLEANSTACK,
    VERIFY_COMPRESSED_PUBKEYTYPE, VERIFY_DERSIG, VERIFY_DISALLOW_SEGWIT_RECOVERY,
    VERIFY_DISCOURAGE_UPGRADABLE_NOPS, VERIFY_INPUT_SIGCHECKS, VERIFY_LOW_S, VERIFY_MINIMALDATA,
    VERIFY_MINIMALIF, VERIFY_NULLDUMMY, VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_REPORT_SIGCHECKS,
    VERIFY_SCHNORR, VERIFY_SCHNORR_MULTISIG, VERIFY_SIGHASH_FORKID, VERIFY_SIGPUSHONLY,
    VERIFY_STRICTENC,
};

/// Locktime values at or above this are interpreted as unix timestamps.
const LOCKTIME_THRESHOLD: i64 = 500_000_000;

const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_MASK: u32 = 0x0000_ffff;

/// A Schnorr signature plus the hashtype byte.
const SCHNORR_SIG_WITH_TYPE_LEN: usize = 65;
/// A bare Schnorr signature, as consumed by CHECKDATASIG.
const SCHNORR_SIG_LEN: usize = 64;

/// Cost model linking signature checks to input script size:
/// `input_script.len() >= 43 * sigchecks - 60`.
const SIGCHECKS_DENSITY_FACTOR: i64 = 43;
const SIGCHECKS_DENSITY_OFFSET: i64 = 60;

fn secp() -> &'static Secp256k1<secp256k1::VerifyOnly> {
    static SECP256K1: OnceLock<Secp256k1<secp256k1::VerifyOnly>> = OnceLock::new();
    SECP256K1.get_or_init(Secp256k1::verification_only)
}

/// The transaction being spent from, as seen by one input's scripts.
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Value of the output being spent, in satoshis.
    pub value: u64,
}

impl<'a> TxContext<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, value: u64) -> Self {
        Self { tx, input_index, value }
    }
}

/// Executes `script` against `stack` under `flags`.
///
/// Returns the number of signature checks performed. Repeat execution of
/// the same script, stack, and flags yields an identical result.
pub fn execute(
    script: &Script,
    stack: &mut Stack,
    flags: u32,
    ctx: Option<&TxContext<'_>>,
) -> Result<u32, ScriptError> {
    let mut interp = Interpreter::new(flags, ctx);
    interp.run(script, stack)?;
    Ok(interp.sigchecks)
}

/// Top-level input validator: runs the input script, the output script,
/// and (under P2SH) the redeem script, per the fork's verify protocol.
///
/// Returns the signature check count when REPORT_SIGCHECKS is set, zero
/// otherwise.
pub fn verify(
    input_script: &Script,
    output_script: &Script,
    tx: &Transaction,
    input_index: usize,
    value: u64,
    mut flags: u32,
) -> Result<u32, ScriptError> {
    if flags & VERIFY_SIGHASH_FORKID != 0 {
        flags |= VERIFY_STRICTENC;
    }
    if flags & VERIFY_SIGPUSHONLY != 0 && !input_script.is_push_only() {
        return Err(ScriptError::SigPushOnly);
    }

    let ctx = TxContext::new(tx, input_index, value);
    let mut interp = Interpreter::new(flags, Some(&ctx));
    let mut stack = Stack::new();

    interp.run(input_script, &mut stack)?;
    let snapshot = if flags & VERIFY_P2SH != 0 { Some(stack.clone()) } else { None };
    interp.run(output_script, &mut stack)?;
    if stack.is_empty() || !cast_to_bool(stack.top(0)?) {
        return Err(ScriptError::EvalFalse);
    }

    if flags & VERIFY_P2SH != 0 && output_script.is_p2sh() {
        if !input_script.is_push_only() {
            return Err(ScriptError::SigPushOnly);
        }
        let mut redeem_stack = snapshot.expect("P2SH flag implies a snapshot");
        if redeem_stack.is_empty() {
            return Err(ScriptError::EvalFalse);
        }
        let redeem_bytes = redeem_stack.pop()?;
        let redeem = Script::from_bytes(&redeem_bytes);

        // A spender is permitted to sweep an output mistakenly sent to a
        // witness program on this chain without satisfying the program.
        let recovery = flags & VERIFY_DISALLOW_SEGWIT_RECOVERY == 0
            && redeem_stack.is_empty()
            && redeem.is_witness_program();
        if !recovery {
            interp.run(&redeem, &mut redeem_stack)?;
            if redeem_stack.is_empty() || !cast_to_bool(redeem_stack.top(0)?) {
                return Err(ScriptError::EvalFalse);
            }
            if flags & VERIFY_CLEANSTACK != 0 && redeem_stack.len() != 1 {
                return Err(ScriptError::CleanStack);
            }
        }
    } else if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        // CLEANSTACK is only meaningful together with P2SH.
        return Err(ScriptError::CleanStack);
    }

    if flags & VERIFY_INPUT_SIGCHECKS != 0 {
        let needed = SIGCHECKS_DENSITY_FACTOR * interp.sigchecks as i64 - SIGCHECKS_DENSITY_OFFSET;
        if (input_script.len() as i64) < needed {
            return Err(ScriptError::InputSigchecks);
        }
    }

    if flags & VERIFY_REPORT_SIGCHECKS != 0 {
        Ok(interp.sigchecks)
    } else {
        Ok(0)
    }
}

/// Per-invocation execution state. The sigcheck accumulator lives here
/// and spans the input/output/redeem runs of one `verify`.
struct Interpreter<'a> {
    flags: u32,
    ctx: Option<&'a TxContext<'a>>,
    hasher: Option<SigHasher<'a>>,
    sigchecks: u32,
}

impl<'a> Interpreter<'a> {
    fn new(flags: u32, ctx: Option<&'a TxContext<'a>>) -> Self {
        let hasher = ctx.map(|c| SigHasher::new(c.tx));
        Self { flags, ctx, hasher, sigchecks: 0 }
    }

    fn flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    fn run(&mut self, script: &Script, stack: &mut Stack) -> Result<(), ScriptError> {
        script.check_size()?;

        let require_minimal = self.flag(VERIFY_MINIMALDATA);
        let mut altstack = Stack::new();
        let mut cond: Vec<bool> = Vec::new();
        let mut negate = 0usize;
        let mut op_count = 0usize;
        let mut last_codesep = 0usize;

        for (ip, op) in script.ops().iter().enumerate() {
            if op.value() < 0 {
                return Err(ScriptError::BadOpcode);
            }
            if matches!(op, Opcode::Code(OP_VERIF) | Opcode::Code(OP_VERNOTIF)) {
                return Err(ScriptError::BadOpcode);
            }
            if let Some(data) = op.push_data() {
                if data.len() > MAX_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
            }
            if op.value() > OP_16 as i32 {
                op_count += 1;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }
            }
            if op.is_disabled() {
                return Err(ScriptError::DisabledOpcode);
            }

            let executing = negate == 0;
            if executing || op.is_branch() {
                match op {
                    Opcode::Push { data, .. } => {
                        if require_minimal && !op.is_minimal() {
                            return Err(ScriptError::MinimalData);
                        }
                        stack.push(data.clone());
                    }
                    Opcode::Code(byte) => {
                        self.execute_opcode(
                            *byte,
                            script,
                            ip,
                            stack,
                            &mut altstack,
                            &mut cond,
                            &mut negate,
                            &mut op_count,
                            &mut last_codesep,
                        )?;
                    }
                    Opcode::Malformed(_) => unreachable!("sentinel handled above"),
                }
            }

            if stack.len() + altstack.len() > MAX_STACK_DEPTH {
                return Err(ScriptError::StackSize);
            }
        }

        if !cond.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_opcode(
        &mut self,
        byte: u8,
        script: &Script,
        ip: usize,
        stack: &mut Stack,
        altstack: &mut Stack,
        cond: &mut Vec<bool>,
        negate: &mut usize,
        op_count: &mut usize,
        last_codesep: &mut usize,
    ) -> Result<(), ScriptError> {
        let require_minimal = self.flag(VERIFY_MINIMALDATA);
        let executing = *negate == 0;

        match byte {
            // Constants.
            OP_0 => stack.push(Vec::new()),
            OP_1NEGATE => stack.push_num(ScriptNum(-1)),
            OP_1..=OP_16 => stack.push_num(ScriptNum((byte - OP_1 + 1) as i64)),

            // Flow control.
            OP_NOP => {}
            OP_IF | OP_NOTIF => {
                let mut value = false;
                if executing {
                    let condition = stack.pop().map_err(|_| ScriptError::UnbalancedConditional)?;
                    if self.flag(VERIFY_MINIMALIF)
                        && !(condition.is_empty() || condition == [1])
                    {
                        return Err(ScriptError::MinimalIf);
                    }
                    value = cast_to_bool(&condition);
                    if byte == OP_NOTIF {
                        value = !value;
                    }
                }
                cond.push(value);
                if !value {
                    *negate += 1;
                }
            }
            OP_ELSE => {
                let top = cond.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                if *top {
                    *negate += 1;
                } else {
                    *negate -= 1;
                }
                *top = !*top;
            }
            OP_ENDIF => {
                let top = cond.pop().ok_or(ScriptError::UnbalancedConditional)?;
                if !top {
                    *negate -= 1;
                }
            }
            OP_VERIFY => {
                if !stack.pop_bool()? {
                    return Err(ScriptError::Verify);
                }
            }
            OP_RETURN => return Err(ScriptError::OpReturn),

            // Alt stack.
            OP_TOALTSTACK => {
                let item = stack.pop()?;
                altstack.push(item);
            }
            OP_FROMALTSTACK => {
                let item = altstack.pop().map_err(|_| ScriptError::InvalidAltstackOperation)?;
                stack.push(item);
            }

            // Stack manipulation.
            OP_2DROP => {
                stack.pop()?;
                stack.pop()?;
            }
            OP_2DUP => {
                let b = stack.from_top(0)?;
                let a = stack.from_top(1)?;
                stack.push(a);
                stack.push(b);
            }
            OP_3DUP => {
                let c = stack.from_top(0)?;
                let b = stack.from_top(1)?;
                let a = stack.from_top(2)?;
                stack.push(a);
                stack.push(b);
                stack.push(c);
            }
            OP_2OVER => {
                let b = stack.from_top(2)?;
                let a = stack.from_top(3)?;
                stack.push(a);
                stack.push(b);
            }
            OP_2ROT => {
                let a = stack.erase_from_top(5)?;
                let b = stack.erase_from_top(4)?;
                stack.push(a);
                stack.push(b);
            }
            OP_2SWAP => {
                stack.swap_top(0, 2)?;
                stack.swap_top(1, 3)?;
            }
            OP_IFDUP => {
                let top = stack.from_top(0)?;
                if cast_to_bool(&top) {
                    stack.push(top);
                }
            }
            OP_DEPTH => stack.push_num(ScriptNum(stack.len() as i64)),
            OP_DROP => {
                stack.pop()?;
            }
            OP_DUP => {
                let top = stack.from_top(0)?;
                stack.push(top);
            }
            OP_NIP => {
                stack.erase_from_top(1)?;
            }
            OP_OVER => {
                let item = stack.from_top(1)?;
                stack.push(item);
            }
            OP_PICK | OP_ROLL => {
                let depth = stack.pop_num(require_minimal, MAX_NUM_LEN)?.to_index()?;
                let item = if byte == OP_PICK {
                    stack.from_top(depth)?
                } else {
                    stack.erase_from_top(depth)?
                };
                stack.push(item);
            }
            OP_ROT => {
                let item = stack.erase_from_top(2)?;
                stack.push(item);
            }
            OP_SWAP => stack.swap_top(0, 1)?,
            OP_TUCK => {
                let top = stack.from_top(0)?;
                stack.insert_from_top(2, top)?;
            }

            // Byte strings.
            OP_CAT => {
                let b = stack.pop()?;
                let mut a = stack.pop()?;
                if a.len() + b.len() > MAX_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                a.extend_from_slice(&b);
                stack.push(a);
            }
            OP_SPLIT => {
                let at = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                let data = stack.pop()?;
                if at < 0 || at as usize > data.len() {
                    return Err(ScriptError::InvalidSplitRange);
                }
                let at = at as usize;
                stack.push(data[..at].to_vec());
                stack.push(data[at..].to_vec());
            }
            OP_NUM2BIN => {
                let size = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                if size < 0 || size as usize > MAX_ELEMENT_SIZE {
                    return Err(ScriptError::PushSize);
                }
                let size = size as usize;
                let mut data = ScriptNum::minimize(&stack.pop()?);
                if data.len() > size {
                    return Err(ScriptError::ImpossibleEncoding);
                }
                if data.len() < size {
                    let sign = data.last().map(|b| b & 0x80).unwrap_or(0);
                    if let Some(last) = data.last_mut() {
                        *last &= 0x7f;
                    }
                    data.resize(size, 0);
                    let idx = data.len() - 1;
                    data[idx] |= sign;
                }
                stack.push(data);
            }
            OP_BIN2NUM => {
                let data = ScriptNum::minimize(&stack.pop()?);
                if data.len() > MAX_NUM_LEN {
                    return Err(ScriptError::InvalidNumberRange);
                }
                stack.push(data);
            }
            OP_SIZE => {
                let len = stack.top(0)?.len();
                stack.push_num(ScriptNum(len as i64));
            }
            OP_REVERSEBYTES => {
                let mut data = stack.pop()?;
                data.reverse();
                stack.push(data);
            }

            // Bitwise logic on equal-length operands.
            OP_AND | OP_OR | OP_XOR => {
                let b = stack.pop()?;
                let mut a = stack.pop()?;
                if a.len() != b.len() {
                    return Err(ScriptError::InvalidOperandSize);
                }
                for (lhs, rhs) in a.iter_mut().zip(b.iter()) {
                    match byte {
                        OP_AND => *lhs &= rhs,
                        OP_OR => *lhs |= rhs,
                        _ => *lhs ^= rhs,
                    }
                }
                stack.push(a);
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                let equal = a == b;
                if byte == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push_bool(equal);
                }
            }

            // Arithmetic.
            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let num = stack.pop_num(require_minimal, MAX_NUM_LEN)?;
                let result = match byte {
                    OP_1ADD => ScriptNum(num.value() + 1),
                    OP_1SUB => ScriptNum(num.value() - 1),
                    OP_NEGATE => num.neg(),
                    OP_ABS => num.abs(),
                    OP_NOT => ScriptNum((num.value() == 0) as i64),
                    _ => ScriptNum((num.value() != 0) as i64),
                };
                stack.push_num(result);
            }
            OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
            | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
            | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                let a = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                let result = match byte {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_DIV => {
                        if b == 0 {
                            return Err(ScriptError::DivByZero);
                        }
                        a / b
                    }
                    OP_MOD => {
                        if b == 0 {
                            return Err(ScriptError::ModByZero);
                        }
                        a % b
                    }
                    OP_BOOLAND => (a != 0 && b != 0) as i64,
                    OP_BOOLOR => (a != 0 || b != 0) as i64,
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                    OP_NUMNOTEQUAL => (a != b) as i64,
                    OP_LESSTHAN => (a < b) as i64,
                    OP_GREATERTHAN => (a > b) as i64,
                    OP_LESSTHANOREQUAL => (a <= b) as i64,
                    OP_GREATERTHANOREQUAL => (a >= b) as i64,
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if byte == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push_num(ScriptNum(result));
                }
            }
            OP_WITHIN => {
                let max = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                let min = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                let x = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
                stack.push_bool(x >= min && x < max);
            }

            // Crypto.
            OP_RIPEMD160 => {
                let data = stack.pop()?;
                stack.push(ripemd160::Hash::hash(&data).to_byte_array().to_vec());
            }
            OP_SHA1 => {
                let data = stack.pop()?;
                stack.push(sha1::Hash::hash(&data).to_byte_array().to_vec());
            }
            OP_SHA256 => {
                let data = stack.pop()?;
                stack.push(sha256::Hash::hash(&data).to_byte_array().to_vec());
            }
            OP_HASH160 => {
                let data = stack.pop()?;
                stack.push(hash160::Hash::hash(&data).to_byte_array().to_vec());
            }
            OP_HASH256 => {
                let data = stack.pop()?;
                stack.push(sha256d::Hash::hash(&data).to_byte_array().to_vec());
            }
            OP_CODESEPARATOR => *last_codesep = ip + 1,
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let key = stack.pop()?;
                let sig = stack.pop()?;
                let result = self.check_sig(&sig, &key, script, *last_codesep)?;
                if !result && self.flag(VERIFY_NULLFAIL) && !sig.is_empty() {
                    return Err(ScriptError::NullFail);
                }
                if byte == OP_CHECKSIGVERIFY {
                    if !result {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push_bool(result);
                }
            }
            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                if !self.flag(VERIFY_CHECKDATASIG) {
                    return Err(ScriptError::BadOpcode);
                }
                let key = stack.pop()?;
                let msg = stack.pop()?;
                let sig = stack.pop()?;
                let result = self.check_data_sig(&sig, &msg, &key)?;
                if !result && self.flag(VERIFY_NULLFAIL) && !sig.is_empty() {
                    return Err(ScriptError::NullFail);
                }
                if byte == OP_CHECKDATASIGVERIFY {
                    if !result {
                        return Err(ScriptError::CheckDataSigVerify);
                    }
                } else {
                    stack.push_bool(result);
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let result = self.check_multisig(stack, script, *last_codesep, op_count)?;
                if byte == OP_CHECKMULTISIGVERIFY {
                    if !result {
                        return Err(ScriptError::CheckMultiSigVerify);
                    }
                } else {
                    stack.push_bool(result);
                }
            }

            // Locktimes.
            OP_CHECKLOCKTIMEVERIFY => {
                if !self.flag(VERIFY_CHECKLOCKTIMEVERIFY) {
                    if self.flag(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    let locktime = ScriptNum::decode(
                        stack.top(0)?,
                        require_minimal,
                        MAX_NUM_LEN_LOCKTIME,
                    )?;
                    if locktime.value() < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    self.check_locktime(locktime.value())?;
                }
            }
            OP_CHECKSEQUENCEVERIFY => {
                if !self.flag(VERIFY_CHECKSEQUENCEVERIFY) {
                    if self.flag(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                } else {
                    let sequence = ScriptNum::decode(
                        stack.top(0)?,
                        require_minimal,
                        MAX_NUM_LEN_LOCKTIME,
                    )?;
                    if sequence.value() < 0 {
                        return Err(ScriptError::NegativeLocktime);
                    }
                    self.check_sequence(sequence.value())?;
                }
            }
            OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                if self.flag(VERIFY_DISCOURAGE_UPGRADABLE_NOPS) {
                    return Err(ScriptError::DiscourageUpgradableNops);
                }
            }

            _ => return Err(ScriptError::BadOpcode),
        }

        Ok(())
    }

    /// Whether `hashtype` selects the fork-id digest under the current
    /// flags. A signature without the bit (or with the fork-id flag off)
    /// is hashed with the legacy algorithm and is subject to
    /// findAndDelete stripping.
    fn uses_forkid(&self, hashtype: u32) -> bool {
        hashtype & SIGHASH_FORKID != 0 && self.flag(VERIFY_SIGHASH_FORKID)
    }

    fn subscript_for_sig(&self, script: &Script, last_codesep: usize, sig: &[u8]) -> Script {
        let subscript = script.subscript(last_codesep);
        if sig.is_empty() {
            return subscript;
        }
        let hashtype = *sig.last().expect("non-empty") as u32;
        if self.uses_forkid(hashtype) {
            subscript
        } else {
            subscript.find_and_delete(sig).0
        }
    }

    fn check_sig(
        &mut self,
        sig: &[u8],
        key: &[u8],
        script: &Script,
        last_codesep: usize,
    ) -> Result<bool, ScriptError> {
        self.check_signature_encoding(sig)?;
        self.check_pubkey_encoding(key)?;
        if sig.is_empty() {
            return Ok(false);
        }
        let ctx = self.ctx.ok_or(ScriptError::UnknownError)?;
        self.sigchecks += 1;

        let hashtype = *sig.last().expect("non-empty") as u32;
        let body = &sig[..sig.len() - 1];
        let subscript = self.subscript_for_sig(script, last_codesep, sig);
        let hash = self
            .hasher
            .as_mut()
            .expect("hasher present with context")
            .signature_hash(
                ctx.input_index,
                subscript.as_bytes(),
                ctx.value,
                hashtype,
                hashtype & SIGHASH_FORKID != 0 && self.flags & VERIFY_SIGHASH_FORKID != 0,
            )?;

        if self.flag(VERIFY_SCHNORR) && body.len() == SCHNORR_SIG_LEN {
            Ok(schnorr_verify(&hash, body, key))
        } else {
            Ok(ecdsa_verify(&hash, body, key, self.strict_der()))
        }
    }

    fn check_data_sig(&mut self, sig: &[u8], msg: &[u8], key: &[u8]) -> Result<bool, ScriptError> {
        self.check_data_signature_encoding(sig)?;
        self.check_pubkey_encoding(key)?;
        if sig.is_empty() {
            return Ok(false);
        }
        self.sigchecks += 1;

        let hash = sha256::Hash::hash(msg).to_byte_array();
        if self.flag(VERIFY_SCHNORR) && sig.len() == SCHNORR_SIG_LEN {
            Ok(schnorr_verify(&hash, sig, key))
        } else {
            Ok(ecdsa_verify(&hash, sig, key, self.strict_der()))
        }
    }

    fn check_multisig(
        &mut self,
        stack: &mut Stack,
        script: &Script,
        last_codesep: usize,
        op_count: &mut usize,
    ) -> Result<bool, ScriptError> {
        let require_minimal = self.flag(VERIFY_MINIMALDATA);
        let n_keys = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
        if n_keys < 0 || n_keys as usize > MAX_PUBKEYS_PER_MULTISIG {
            return Err(ScriptError::PubkeyCount);
        }
        let n_keys = n_keys as usize;
        *op_count += n_keys;
        if *op_count > MAX_OPS_PER_SCRIPT {
            return Err(ScriptError::OpCount);
        }

        // Keys and signatures come off the stack top-first; reverse them
        // so index 0 is script order, matching the bitfield numbering.
        let mut keys = Vec::with_capacity(n_keys);
        for _ in 0..n_keys {
            keys.push(stack.pop()?);
        }
        keys.reverse();

        let n_sigs = stack.pop_num(require_minimal, MAX_NUM_LEN)?.value();
        if n_sigs < 0 || n_sigs as usize > n_keys {
            return Err(ScriptError::SigCount);
        }
        let n_sigs = n_sigs as usize;

        let mut sigs = Vec::with_capacity(n_sigs);
        for _ in 0..n_sigs {
            sigs.push(stack.pop()?);
        }
        sigs.reverse();

        // The off-by-one dummy under the signatures.
        let dummy = stack.pop()?;

        if self.flag(VERIFY_SCHNORR_MULTISIG) && !dummy.is_empty() {
            self.check_multisig_schnorr(&dummy, &keys, &sigs, script, last_codesep)
        } else {
            self.check_multisig_legacy(&dummy, &keys, &sigs, script, last_codesep)
        }
    }

    /// Bitfield-selected Schnorr multisig: the dummy names which keys the
    /// signatures pair with, in key order.
    fn check_multisig_schnorr(
        &mut self,
        dummy: &[u8],
        keys: &[Vec<u8>],
        sigs: &[Vec<u8>],
        script: &Script,
        last_codesep: usize,
    ) -> Result<bool, ScriptError> {
        let field = decode_bitfield(dummy, keys.len())?;
        if field.count_ones() as usize != sigs.len() {
            return Err(ScriptError::InvalidBitCount);
        }

        let ctx = self.ctx.ok_or(ScriptError::UnknownError)?;
        let mut success = true;
        let mut sig_index = 0usize;
        for (key_index, key) in keys.iter().enumerate() {
            if field >> key_index & 1 == 0 {
                continue;
            }
            if sig_index >= sigs.len() {
                return Err(ScriptError::InvalidBitRange);
            }
            let sig = &sigs[sig_index];
            sig_index += 1;

            if sig.len() != SCHNORR_SIG_WITH_TYPE_LEN {
                return Err(ScriptError::SigNonSchnorr);
            }
            self.check_signature_encoding(sig)?;
            self.check_pubkey_encoding(key)?;

            let hashtype = *sig.last().expect("fixed length") as u32;
            let body = &sig[..SCHNORR_SIG_LEN];
            let subscript = self.subscript_for_sig(script, last_codesep, sig);
            let hash = self
                .hasher
                .as_mut()
                .expect("hasher present with context")
                .signature_hash(
                    ctx.input_index,
                    subscript.as_bytes(),
                    ctx.value,
                    hashtype,
                    self.flags & VERIFY_SIGHASH_FORKID != 0 && hashtype & SIGHASH_FORKID != 0,
                )?;
            if !schnorr_verify(&hash, body, key) {
                success = false;
                break;
            }
        }

        if !sigs.is_empty() {
            self.sigchecks += sigs.len() as u32;
        }
        if !success && self.flag(VERIFY_NULLFAIL) {
            return Err(ScriptError::NullFail);
        }
        Ok(success)
    }

    /// The original key sweep: each signature is tried against the
    /// remaining keys in order; a miss discards the key, never the
    /// signature.
    fn check_multisig_legacy(
        &mut self,
        dummy: &[u8],
        keys: &[Vec<u8>],
        sigs: &[Vec<u8>],
        script: &Script,
        last_codesep: usize,
    ) -> Result<bool, ScriptError> {
        if self.flag(VERIFY_NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::NullFail);
        }

        // Strip every signature from the subscript before hashing.
        let mut subscript = script.subscript(last_codesep);
        for sig in sigs {
            if sig.is_empty() {
                continue;
            }
            let hashtype = *sig.last().expect("non-empty") as u32;
            if !self.uses_forkid(hashtype) {
                subscript = subscript.find_and_delete(sig).0;
            }
        }

        let mut success = true;
        let mut sig_index = 0usize;
        let mut key_index = 0usize;
        while success && sig_index < sigs.len() {
            if keys.len() - key_index < sigs.len() - sig_index {
                success = false;
                break;
            }
            let sig = &sigs[sig_index];
            let key = &keys[key_index];

            if self.flag(VERIFY_SCHNORR)
                && !sig.is_empty()
                && sig.len() - 1 == SCHNORR_SIG_LEN
            {
                // Schnorr signatures may only enter multisig through the
                // bitfield path.
                return Err(ScriptError::SigBadLength);
            }
            self.check_signature_encoding(sig)?;
            self.check_pubkey_encoding(key)?;

            let valid = if sig.is_empty() {
                false
            } else {
                let ctx = self.ctx.ok_or(ScriptError::UnknownError)?;
                let hashtype = *sig.last().expect("non-empty") as u32;
                let body = &sig[..sig.len() - 1];
                let hash = self
                    .hasher
                    .as_mut()
                    .expect("hasher present with context")
                    .signature_hash(
                        ctx.input_index,
                        subscript.as_bytes(),
                        ctx.value,
                        hashtype,
                        self.flags & VERIFY_SIGHASH_FORKID != 0 && hashtype & SIGHASH_FORKID != 0,
                    )?;
                ecdsa_verify(&hash, body, key, self.strict_der())
            };
            if valid {
                sig_index += 1;
            }
            key_index += 1;
        }

        if sigs.iter().any(|sig| !sig.is_empty()) {
            self.sigchecks += keys.len() as u32;
        }

        if !success && self.flag(VERIFY_NULLFAIL) {
            if sigs.iter().any(|sig| !sig.is_empty()) || !dummy.is_empty() {
                return Err(ScriptError::NullFail);
            }
        }
        Ok(success)
    }

    fn strict_der(&self) -> bool {
        self.flags & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0
    }

    fn check_signature_encoding(&self, sig: &[u8]) -> Result<(), ScriptError> {
        if sig.is_empty() {
            return Ok(());
        }
        if self.flag(VERIFY_SCHNORR) && sig.len() == SCHNORR_SIG_WITH_TYPE_LEN {
            if self.flag(VERIFY_STRICTENC) {
                self.check_hashtype(*sig.last().expect("non-empty") as u32)?;
            }
            return Ok(());
        }

        let body = &sig[..sig.len() - 1];
        if self.strict_der() && !is_valid_der_signature(body) {
            return Err(ScriptError::SigDer);
        }
        if self.flag(VERIFY_LOW_S) && !is_low_s_signature(body) {
            return Err(ScriptError::SigHighS);
        }
        if self.flag(VERIFY_STRICTENC) {
            self.check_hashtype(*sig.last().expect("non-empty") as u32)?;
        }
        Ok(())
    }

    /// CHECKDATASIG signatures carry no hashtype byte.
    fn check_data_signature_encoding(&self, sig: &[u8]) -> Result<(), ScriptError> {
        if sig.is_empty() {
            return Ok(());
        }
        if self.flag(VERIFY_SCHNORR) && sig.len() == SCHNORR_SIG_LEN {
            return Ok(());
        }
        if self.strict_der() && !is_valid_der_signature(sig) {
            return Err(ScriptError::SigDer);
        }
        if self.flag(VERIFY_LOW_S) && !is_low_s_signature(sig) {
            return Err(ScriptError::SigHighS);
        }
        Ok(())
    }

    fn check_hashtype(&self, hashtype: u32) -> Result<(), ScriptError> {
        let base = hashtype & !(SIGHASH_ANYONECANPAY | SIGHASH_FORKID);
        if !(0x01..=SIGHASH_SINGLE).contains(&base) {
            return Err(ScriptError::SigHashType);
        }
        let has_forkid = hashtype & SIGHASH_FORKID != 0;
        if has_forkid && !self.flag(VERIFY_SIGHASH_FORKID) {
            return Err(ScriptError::IllegalForkid);
        }
        if !has_forkid && self.flag(VERIFY_SIGHASH_FORKID) {
            return Err(ScriptError::MustUseForkid);
        }
        Ok(())
    }

    fn check_pubkey_encoding(&self, key: &[u8]) -> Result<(), ScriptError> {
        if self.flag(VERIFY_STRICTENC) && !is_valid_pubkey_encoding(key) {
            return Err(ScriptError::PubkeyType);
        }
        if self.flag(VERIFY_COMPRESSED_PUBKEYTYPE) && !is_compressed_pubkey(key) {
            return Err(ScriptError::NoncompressedPubkey);
        }
        Ok(())
    }

    fn check_locktime(&self, locktime: i64) -> Result<(), ScriptError> {
        let ctx = self.ctx.ok_or(ScriptError::UnsatisfiedLocktime)?;
        let tx_locktime = ctx.tx.lock_time.to_consensus_u32() as i64;
        if (tx_locktime < LOCKTIME_THRESHOLD) != (locktime < LOCKTIME_THRESHOLD) {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if tx_locktime < locktime {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let sequence = ctx.tx.input[ctx.input_index].sequence.to_consensus_u32();
        if sequence == u32::MAX {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }

    fn check_sequence(&self, sequence: i64) -> Result<(), ScriptError> {
        let ctx = self.ctx.ok_or(ScriptError::UnsatisfiedLocktime)?;
        let required = sequence as u32;
        if required & SEQUENCE_DISABLE_FLAG != 0 {
            return Ok(());
        }
        if ctx.tx.version.0 < 2 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        let tx_sequence = ctx.tx.input[ctx.input_index].sequence.to_consensus_u32();
        if tx_sequence & SEQUENCE_DISABLE_FLAG != 0 {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if tx_sequence & SEQUENCE_TYPE_FLAG != required & SEQUENCE_TYPE_FLAG {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        if tx_sequence & SEQUENCE_MASK < required & SEQUENCE_MASK {
            return Err(ScriptError::UnsatisfiedLocktime);
        }
        Ok(())
    }
}

/// Decodes the multisig dummy as a bitfield over `n_keys` keys; bit `k`
/// of the big-endian integer selects key `k`.
fn decode_bitfield(dummy: &[u8], n_keys: usize) -> Result<u32, ScriptError> {
    let expected = (n_keys + 7) / 8;
    if dummy.len() != expected {
        return Err(ScriptError::InvalidBitfieldSize);
    }
    if dummy.len() > 4 {
        return Err(ScriptError::BitfieldSize);
    }
    let mut field = 0u32;
    for &byte in dummy {
        field = field << 8 | byte as u32;
    }
    if n_keys < 32 && field >> n_keys != 0 {
        return Err(ScriptError::BitRange);
    }
    Ok(field)
}

fn ecdsa_verify(msg32: &[u8; 32], der: &[u8], key: &[u8], strict: bool) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(key) else {
        return false;
    };
    let parsed = if strict {
        ecdsa::Signature::from_der(der)
    } else {
        ecdsa::Signature::from_der_lax(der)
    };
    let Ok(mut signature) = parsed else {
        return false;
    };
    signature.normalize_s();
    let message = Message::from_digest(*msg32);
    secp().verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

fn schnorr_verify(msg32: &[u8; 32], sig64: &[u8], key: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(key) else {
        return false;
    };
    let Ok(signature) = schnorr::Signature::from_slice(sig64) else {
        return false;
    };
    let (xonly, _parity) = pubkey.x_only_public_key();
    let message = Message::from_digest(*msg32);
    secp().verify_schnorr(&signature, &message, &xonly).is_ok()
}

/// Strict DER validation of a signature body (hashtype byte removed).
fn is_valid_der_signature(sig: &[u8]) -> bool {
    if sig.len() < 8 || sig.len() > 72 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 2 {
        return false;
    }
    if sig[2] != 0x02 {
        return false;
    }
    let len_r = sig[3] as usize;
    if len_r == 0 || 5 + len_r >= sig.len() {
        return false;
    }
    if sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[4 + len_r] != 0x02 {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_s == 0 || len_r + len_s + 6 != sig.len() {
        return false;
    }
    if sig[6 + len_r] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[6 + len_r] == 0x00 && sig[7 + len_r] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_s_signature(sig: &[u8]) -> bool {
    let Ok(signature) = ecdsa::Signature::from_der(sig) else {
        return false;
    };
    let mut normalized = signature;
    normalized.normalize_s();
    normalized == signature
}

fn is_valid_pubkey_encoding(key: &[u8]) -> bool {
    match key.len() {
        33 => matches!(key[0], 0x02 | 0x03),
        65 => key[0] == 0x04,
        _ => false,
    }
}

fn is_compressed_pubkey(key: &[u8]) -> bool {
    key.len() == 33 && matches!(key[0], 0x02 | 0x03)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptBuilder;
    use crate::{VERIFY_NONE, VERIFY_P2SH};

    fn run(script: &Script, flags: u32) -> Result<Stack, ScriptError> {
        let mut stack = Stack::new();
        execute(script, &mut stack, flags, None)?;
        Ok(stack)
    }

    #[test]
    fn repeated_execution_is_deterministic() {
        let script = ScriptBuilder::new()
            .push_num(5)
            .push_num(3)
            .push_opcode(OP_SUB)
            .into_script();
        let a = run(&script, VERIFY_NONE).unwrap();
        let b = run(&script, VERIFY_NONE).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.items(), &[vec![2u8]]);
    }

    #[test]
    fn conditionals_select_branches() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_1)
            .push_opcode(OP_IF)
            .push_num(7)
            .push_opcode(OP_ELSE)
            .push_num(9)
            .push_opcode(OP_ENDIF)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![7u8]]);

        let script = ScriptBuilder::new()
            .push_opcode(OP_0)
            .push_opcode(OP_NOTIF)
            .push_num(7)
            .push_opcode(OP_ENDIF)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![7u8]]);
    }

    #[test]
    fn nested_skipped_branches_do_not_execute() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_0)
            .push_opcode(OP_IF)
            .push_opcode(OP_IF)
            .push_opcode(OP_RETURN)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_RETURN)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_1)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![1u8]]);
    }

    #[test]
    fn unbalanced_conditional_is_detected() {
        let script = ScriptBuilder::new().push_opcode(OP_1).push_opcode(OP_IF).into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::UnbalancedConditional));
        let script = ScriptBuilder::new().push_opcode(OP_ENDIF).into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn minimalif_requires_canonical_condition() {
        let script = ScriptBuilder::new()
            .push_data(&[2])
            .push_opcode(OP_IF)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_1)
            .into_script();
        assert_eq!(run(&script, VERIFY_MINIMALIF), Err(ScriptError::MinimalIf));
        assert!(run(&script, VERIFY_NONE).is_ok());
    }

    #[test]
    fn disabled_opcodes_fail_even_unexecuted() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_0)
            .push_opcode(OP_IF)
            .push_opcode(OP_2MUL)
            .push_opcode(OP_ENDIF)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::DisabledOpcode));
    }

    #[test]
    fn op_return_rejects() {
        let script = ScriptBuilder::new().push_opcode(OP_1).push_opcode(OP_RETURN).into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::OpReturn));
    }

    #[test]
    fn cat_split_roundtrip() {
        let script = ScriptBuilder::new()
            .push_data(&[0xaa, 0xbb])
            .push_data(&[0xcc])
            .push_opcode(OP_CAT)
            .push_num(2)
            .push_opcode(OP_SPLIT)
            .into_script();
        let stack = run(&script, VERIFY_NONE).unwrap();
        assert_eq!(stack.items(), &[vec![0xaa, 0xbb], vec![0xcc]]);
    }

    #[test]
    fn split_out_of_range() {
        let script = ScriptBuilder::new()
            .push_data(&[0xaa])
            .push_num(2)
            .push_opcode(OP_SPLIT)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::InvalidSplitRange));
    }

    #[test]
    fn cat_overflow_is_push_size() {
        let script = ScriptBuilder::new()
            .push_data(&[0x11; 300])
            .push_data(&[0x22; 300])
            .push_opcode(OP_CAT)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::PushSize));
    }

    #[test]
    fn num2bin_pads_and_preserves_sign() {
        let script = ScriptBuilder::new()
            .push_num(-1)
            .push_num(4)
            .push_opcode(OP_NUM2BIN)
            .into_script();
        let stack = run(&script, VERIFY_NONE).unwrap();
        assert_eq!(stack.items(), &[vec![0x01, 0x00, 0x00, 0x80]]);
    }

    #[test]
    fn num2bin_too_small_is_impossible_encoding() {
        let script = ScriptBuilder::new()
            .push_data(&[0x12, 0x34, 0x56])
            .push_num(2)
            .push_opcode(OP_NUM2BIN)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::ImpossibleEncoding));
    }

    #[test]
    fn bin2num_minimizes() {
        let script = ScriptBuilder::new()
            .push_data(&[0x02, 0x00, 0x00, 0x00])
            .push_opcode(OP_BIN2NUM)
            .into_script();
        let stack = run(&script, VERIFY_NONE).unwrap();
        assert_eq!(stack.items(), &[vec![0x02]]);

        let script = ScriptBuilder::new()
            .push_data(&[0x01, 0x02, 0x03, 0x04, 0x05])
            .push_opcode(OP_BIN2NUM)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::InvalidNumberRange));
    }

    #[test]
    fn reversebytes_reverses_in_place() {
        let script = ScriptBuilder::new()
            .push_data(&[0x01, 0x02, 0x03])
            .push_opcode(OP_REVERSEBYTES)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![0x03, 0x02, 0x01]]);
    }

    #[test]
    fn bitwise_requires_equal_lengths() {
        let script = ScriptBuilder::new()
            .push_data(&[0x0f, 0xf0])
            .push_data(&[0xff])
            .push_opcode(OP_AND)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::InvalidOperandSize));

        let script = ScriptBuilder::new()
            .push_data(&[0x0f, 0xf0])
            .push_data(&[0xff, 0x0f])
            .push_opcode(OP_XOR)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![0xf0, 0xff]]);
    }

    #[test]
    fn division_and_modulo() {
        let script = ScriptBuilder::new()
            .push_num(7)
            .push_num(-2)
            .push_opcode(OP_DIV)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[ScriptNum(-3).encode()]);

        let script = ScriptBuilder::new()
            .push_num(7)
            .push_num(0)
            .push_opcode(OP_MOD)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::ModByZero));
    }

    #[test]
    fn minimaldata_rejects_padded_operands_and_pushes() {
        // A padded numeric operand fails when decoded.
        let script = Script::from_bytes(&[0x02, 0x01, 0x00, OP_1ADD]);
        assert_eq!(run(&script, VERIFY_MINIMALDATA), Err(ScriptError::InvalidNumberRange));
        // A single-byte push of 1 must use the dedicated opcode.
        let script = Script::from_bytes(&[0x01, 0x01]);
        assert_eq!(run(&script, VERIFY_MINIMALDATA), Err(ScriptError::MinimalData));
    }

    #[test]
    fn op_count_limit_enforced() {
        let mut ops = Vec::new();
        for _ in 0..202 {
            ops.push(Opcode::Code(OP_NOP));
        }
        let script = Script::from_ops(ops);
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::OpCount));
    }

    #[test]
    fn stack_depth_limit_enforced() {
        let mut ops = vec![Opcode::Code(OP_1)];
        for _ in 0..1000 {
            ops.push(Opcode::Code(OP_DUP));
        }
        let script = Script::from_ops(ops);
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::StackSize));
    }

    #[test]
    fn altstack_roundtrip_and_underflow() {
        let script = ScriptBuilder::new()
            .push_num(5)
            .push_opcode(OP_TOALTSTACK)
            .push_opcode(OP_FROMALTSTACK)
            .into_script();
        assert_eq!(run(&script, VERIFY_NONE).unwrap().items(), &[vec![5u8]]);

        let script = ScriptBuilder::new().push_opcode(OP_FROMALTSTACK).into_script();
        assert_eq!(run(&script, VERIFY_NONE), Err(ScriptError::InvalidAltstackOperation));
    }

    #[test]
    fn verify_accepts_trivial_spend() {
        let tx = test_tx();
        let input = Script::new();
        let output = ScriptBuilder::new().push_opcode(OP_1).into_script();
        assert_eq!(verify(&input, &output, &tx, 0, 0, VERIFY_NONE), Ok(0));
    }

    #[test]
    fn verify_rejects_false_result() {
        let tx = test_tx();
        let input = Script::new();
        let output = ScriptBuilder::new().push_opcode(OP_0).into_script();
        assert_eq!(verify(&input, &output, &tx, 0, 0, VERIFY_NONE), Err(ScriptError::EvalFalse));
    }

    #[test]
    fn cleanstack_requires_single_element() {
        let tx = test_tx();
        let input = ScriptBuilder::new().push_num(5).into_script();
        let output = ScriptBuilder::new().push_opcode(OP_1).into_script();
        assert_eq!(
            verify(&input, &output, &tx, 0, 0, VERIFY_P2SH | VERIFY_CLEANSTACK),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn p2sh_redeem_script_executes() {
        let tx = test_tx();
        let redeem = ScriptBuilder::new().push_opcode(OP_1).into_script();
        let hash = hash160::Hash::hash(redeem.as_bytes()).to_byte_array();
        let output = ScriptBuilder::new()
            .push_opcode(OP_HASH160)
            .push_data(&hash)
            .push_opcode(OP_EQUAL)
            .into_script();
        let input = ScriptBuilder::new().push_data(redeem.as_bytes()).into_script();
        assert_eq!(verify(&input, &output, &tx, 0, 0, VERIFY_P2SH), Ok(0));
    }

    #[test]
    fn segwit_recovery_skips_redeem_execution() {
        let tx = test_tx();
        // Redeem script is a v0 witness program; spending it would
        // otherwise fail since it leaves a non-true stack.
        let redeem = ScriptBuilder::new().push_opcode(OP_0).push_data(&[0x11; 20]).into_script();
        let hash = hash160::Hash::hash(redeem.as_bytes()).to_byte_array();
        let output = ScriptBuilder::new()
            .push_opcode(OP_HASH160)
            .push_data(&hash)
            .push_opcode(OP_EQUAL)
            .into_script();
        let input = ScriptBuilder::new().push_data(redeem.as_bytes()).into_script();
        assert_eq!(verify(&input, &output, &tx, 0, 0, VERIFY_P2SH), Ok(0));
        assert_eq!(
            verify(&input, &output, &tx, 0, 0, VERIFY_P2SH | VERIFY_DISALLOW_SEGWIT_RECOVERY),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn sigpushonly_rejects_operators_in_input() {
        let tx = test_tx();
        let input = ScriptBuilder::new().push_opcode(OP_1).push_opcode(OP_DUP).into_script();
        let output = ScriptBuilder::new().push_opcode(OP_1).into_script();
        assert_eq!(
            verify(&input, &output, &tx, 0, 0, VERIFY_SIGPUSHONLY),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn bitfield_decoding() {
        assert_eq!(decode_bitfield(&[0b0000_0101], 3).unwrap(), 0b101);
        assert_eq!(decode_bitfield(&[0b0000_0101], 8).unwrap(), 0b101);
        assert_eq!(decode_bitfield(&[0x01, 0x01], 9).unwrap(), 0x0101);
        assert_eq!(decode_bitfield(&[], 3), Err(ScriptError::InvalidBitfieldSize));
        assert_eq!(decode_bitfield(&[0b1000], 3), Err(ScriptError::BitRange));
    }

    fn test_tx() -> Transaction {
        use bitcoin::absolute::LockTime;
        use bitcoin::transaction::Version;
        use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(0), script_pubkey: ScriptBuf::new() }],
        }
    }
}
