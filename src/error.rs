//! Error types shared by the interpreter and the chain.

use thiserror::Error;

/// Script interpreter failure, one identifier per condition.
///
/// Interpreter errors are local and deterministic: they are surfaced
/// verbatim to the caller and never trigger recovery inside the VM.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script is larger than the maximum script size")]
    ScriptSize,
    #[error("pushed element exceeds the maximum element size")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("combined stack depth limit exceeded")]
    StackSize,
    #[error("undecodable or reserved opcode")]
    BadOpcode,
    #[error("opcode is disabled")]
    DisabledOpcode,
    #[error("push is not minimally encoded")]
    MinimalData,
    #[error("IF/NOTIF argument must be minimal")]
    MinimalIf,
    #[error("VERIFY failed")]
    Verify,
    #[error("EQUALVERIFY failed")]
    EqualVerify,
    #[error("NUMEQUALVERIFY failed")]
    NumEqualVerify,
    #[error("CHECKSIGVERIFY failed")]
    CheckSigVerify,
    #[error("CHECKDATASIGVERIFY failed")]
    CheckDataSigVerify,
    #[error("CHECKMULTISIGVERIFY failed")]
    CheckMultiSigVerify,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("invalid stack operation")]
    InvalidStackOperation,
    #[error("invalid altstack operation")]
    InvalidAltstackOperation,
    #[error("negative locktime operand")]
    NegativeLocktime,
    #[error("locktime requirement not satisfied")]
    UnsatisfiedLocktime,
    #[error("upgradable NOP used while discouraged")]
    DiscourageUpgradableNops,
    #[error("division by zero")]
    DivByZero,
    #[error("modulo by zero")]
    ModByZero,
    #[error("SPLIT position out of range")]
    InvalidSplitRange,
    #[error("bitwise operands differ in size")]
    InvalidOperandSize,
    #[error("number does not fit the requested encoding")]
    ImpossibleEncoding,
    #[error("number is out of range or not minimally encoded")]
    InvalidNumberRange,
    #[error("public key is not correctly encoded")]
    PubkeyType,
    #[error("public key must be compressed")]
    NoncompressedPubkey,
    #[error("signature is not strict DER")]
    SigDer,
    #[error("signature S value is too high")]
    SigHighS,
    #[error("signature hash type is invalid")]
    SigHashType,
    #[error("signature has an illegal length")]
    SigBadLength,
    #[error("only Schnorr signatures allowed in this context")]
    SigNonSchnorr,
    #[error("input script must be push-only")]
    SigPushOnly,
    #[error("signature uses the fork id illegally")]
    IllegalForkid,
    #[error("signature must use the fork id")]
    MustUseForkid,
    #[error("failed signature must be empty")]
    NullFail,
    #[error("invalid public key count")]
    PubkeyCount,
    #[error("invalid signature count")]
    SigCount,
    #[error("multisig dummy has an invalid bitfield size")]
    InvalidBitfieldSize,
    #[error("bitfield is too wide to decode")]
    BitfieldSize,
    #[error("bitfield sets a bit outside the key range")]
    BitRange,
    #[error("bitfield bit count does not match the signature count")]
    InvalidBitCount,
    #[error("bitfield selects keys out of order")]
    InvalidBitRange,
    #[error("stack is not clean after evaluation")]
    CleanStack,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("input script too small for its signature checks")]
    InputSigchecks,
    #[error("unknown script error")]
    UnknownError,
}

/// Classification of a chain-level rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyKind {
    Invalid,
    Obsolete,
    Checkpoint,
    Malformed,
    Duplicate,
}

/// Block or transaction rejection with a stable reason identifier.
///
/// A non-malleated error marks the block hash in the chain's invalid set
/// so the same block is never revalidated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification failed: {reason} (score {score})")]
pub struct VerifyError {
    pub kind: VerifyKind,
    pub reason: &'static str,
    pub score: u8,
    pub malleated: bool,
}

impl VerifyError {
    pub fn new(kind: VerifyKind, reason: &'static str, score: u8) -> Self {
        Self { kind, reason, score, malleated: false }
    }

    pub fn malleated(kind: VerifyKind, reason: &'static str, score: u8) -> Self {
        Self { kind, reason, score, malleated: true }
    }
}

/// Failure reported by the chain database collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("entry not found: {0}")]
    NotFound(&'static str),
    #[error("database state is corrupt: {0}")]
    Corrupt(&'static str),
}

/// Top-level failure of a chain operation. Database errors propagate
/// unchanged; verification errors terminate only the offending block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl ChainError {
    /// Duplicate-submission rejection used by `Chain::add`.
    pub fn duplicate() -> Self {
        ChainError::Verify(VerifyError::new(VerifyKind::Duplicate, "duplicate", 0))
    }
}
