//! Pure-Rust consensus core for Bitcoin-Cash-family chains.
//!
//! The crate implements the two consensus-critical subsystems of a full
//! node: the script interpreter (a stack-based bytecode VM with the
//! fork's opcode set, signature algorithms, and flag-gated upgrade
//! behavior) and the chain validator (contextual block checks,
//! difficulty retargeting including the anchored exponential schedule,
//! deployment-state derivation, and the reorganization engine over a
//! pluggable [`chaindb::ChainDB`] store).
//!
//! Networking, mempool policy, wallets, and RPC are out of scope; the
//! chain reports progress through buffered [`chain::ChainEvent`]s and
//! reads blocks and coins through the database trait.
//!
//! ```
//! use cash_consensus::{interpreter, script::{Script, ScriptBuilder, opcodes}, VERIFY_NONE};
//! use cash_consensus::stack::Stack;
//!
//! let script = ScriptBuilder::new()
//!     .push_num(2)
//!     .push_num(3)
//!     .push_opcode(opcodes::OP_ADD)
//!     .into_script();
//! let mut stack = Stack::new();
//! interpreter::execute(&script, &mut stack, VERIFY_NONE, None).unwrap();
//! assert_eq!(stack.top(0).unwrap(), &[5]);
//! ```

pub mod chain;
pub mod chaindb;
pub mod coins;
pub mod deployments;
pub mod error;
pub mod interpreter;
pub mod params;
pub mod pow;
pub mod script;
pub mod scriptnum;
pub mod sighash;
pub mod stack;
pub mod tx;

pub use chain::{Chain, ChainEvent, ChainOptions};
pub use chaindb::{ChainDB, ChainEntry, MemChainDB};
pub use coins::{Coin, CoinView};
pub use deployments::DeploymentState;
pub use error::{ChainError, DbError, ScriptError, VerifyError, VerifyKind};
pub use interpreter::{execute, verify, TxContext};
pub use params::Network;
pub use script::{Opcode, Script, ScriptBuilder};
pub use scriptnum::ScriptNum;
pub use stack::Stack;

/// Do not enable any verification.
pub const VERIFY_NONE: u32 = 0;
/// Evaluate pay-to-script-hash subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict signature and public key encodings.
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER signatures.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Require signatures to use the low-S form.
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// Require the legacy multisig dummy to be empty.
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require input scripts to be push-only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Require minimal push encodings and minimal numbers.
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Reject the upgradable NOP opcodes.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Require exactly one stack element after evaluation.
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
/// Enable CHECKLOCKTIMEVERIFY.
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// Enable CHECKSEQUENCEVERIFY.
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
/// Require minimal IF/NOTIF arguments.
pub const VERIFY_MINIMALIF: u32 = 1 << 11;
/// A failed signature check must leave an empty signature.
pub const VERIFY_NULLFAIL: u32 = 1 << 12;
/// Require compressed public keys.
pub const VERIFY_COMPRESSED_PUBKEYTYPE: u32 = 1 << 13;
/// Signatures commit with the fork id replay protection.
pub const VERIFY_SIGHASH_FORKID: u32 = 1 << 14;
/// Enable CHECKDATASIG and CHECKDATASIGVERIFY.
pub const VERIFY_CHECKDATASIG: u32 = 1 << 15;
/// Accept 64-byte Schnorr signatures in CHECKSIG and CHECKDATASIG.
pub const VERIFY_SCHNORR: u32 = 1 << 16;
/// Enable the bitfield Schnorr path of CHECKMULTISIG.
pub const VERIFY_SCHNORR_MULTISIG: u32 = 1 << 17;
/// Refuse the P2SH segwit-recovery exemption.
pub const VERIFY_DISALLOW_SEGWIT_RECOVERY: u32 = 1 << 18;
/// Enforce the input-size to signature-check density rule.
pub const VERIFY_INPUT_SIGCHECKS: u32 = 1 << 19;
/// Report the per-verify signature check count to the caller.
pub const VERIFY_REPORT_SIGCHECKS: u32 = 1 << 20;
/// Count no signature operations for this script (template slots).
pub const VERIFY_ZERO_SIGOPS: u32 = 1 << 21;
/// Check block proof of work on submission.
pub const VERIFY_POW: u32 = 1 << 22;
/// Check non-contextual block body sanity on submission.
pub const VERIFY_BODY: u32 = 1 << 23;

/// Consensus-mandatory script flags on the current network upgrade.
pub const MANDATORY_VERIFY_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_SIGHASH_FORKID
    | VERIFY_LOW_S
    | VERIFY_NULLFAIL
    | VERIFY_MINIMALDATA
    | VERIFY_CHECKDATASIG
    | VERIFY_SCHNORR
    | VERIFY_SCHNORR_MULTISIG
    | VERIFY_SIGPUSHONLY
    | VERIFY_CLEANSTACK
    | VERIFY_REPORT_SIGCHECKS;

/// Standardness flags applied on top of the mandatory set.
pub const STANDARD_VERIFY_FLAGS: u32 = MANDATORY_VERIFY_FLAGS
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_MINIMALIF
    | VERIFY_COMPRESSED_PUBKEYTYPE
    | VERIFY_DISALLOW_SEGWIT_RECOVERY
    | VERIFY_INPUT_SIGCHECKS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_are_distinct() {
        let flags = [
            VERIFY_P2SH,
            VERIFY_STRICTENC,
            VERIFY_DERSIG,
            VERIFY_LOW_S,
            VERIFY_NULLDUMMY,
            VERIFY_SIGPUSHONLY,
            VERIFY_MINIMALDATA,
            VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
            VERIFY_CLEANSTACK,
            VERIFY_CHECKLOCKTIMEVERIFY,
            VERIFY_CHECKSEQUENCEVERIFY,
            VERIFY_MINIMALIF,
            VERIFY_NULLFAIL,
            VERIFY_COMPRESSED_PUBKEYTYPE,
            VERIFY_SIGHASH_FORKID,
            VERIFY_CHECKDATASIG,
            VERIFY_SCHNORR,
            VERIFY_SCHNORR_MULTISIG,
            VERIFY_DISALLOW_SEGWIT_RECOVERY,
            VERIFY_INPUT_SIGCHECKS,
            VERIFY_REPORT_SIGCHECKS,
            VERIFY_ZERO_SIGOPS,
            VERIFY_POW,
            VERIFY_BODY,
        ];
        let mut seen = 0u32;
        for flag in flags {
            assert_eq!(flag.count_ones(), 1);
            assert_eq!(seen & flag, 0);
            seen |= flag;
        }
    }

    #[test]
    fn standard_includes_mandatory() {
        assert_eq!(STANDARD_VERIFY_FLAGS & MANDATORY_VERIFY_FLAGS, MANDATORY_VERIFY_FLAGS);
    }
}
