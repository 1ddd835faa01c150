//! Scripts and opcodes.
//!
//! A [`Script`] owns its decoded opcode sequence together with the
//! canonical serialization. Decoding never fails: a truncated push at
//! the tail of a malformed script becomes the [`Opcode::Malformed`]
//! sentinel, and every scan stops there.

use crate::error::ScriptError;
use crate::scriptnum::ScriptNum;

/// Consensus bound on a serialized script.
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Consensus bound on non-push operations per script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Consensus bound on keys in a CHECKMULTISIG.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// The fork's opcode byte table.
#[rustfmt::skip]
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_2: u8 = 0x52;
    pub const OP_3: u8 = 0x53;
    pub const OP_4: u8 = 0x54;
    pub const OP_5: u8 = 0x55;
    pub const OP_6: u8 = 0x56;
    pub const OP_7: u8 = 0x57;
    pub const OP_8: u8 = 0x58;
    pub const OP_9: u8 = 0x59;
    pub const OP_10: u8 = 0x5a;
    pub const OP_11: u8 = 0x5b;
    pub const OP_12: u8 = 0x5c;
    pub const OP_13: u8 = 0x5d;
    pub const OP_14: u8 = 0x5e;
    pub const OP_15: u8 = 0x5f;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SPLIT: u8 = 0x7f;
    pub const OP_NUM2BIN: u8 = 0x80;
    pub const OP_BIN2NUM: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP5: u8 = 0xb4;
    pub const OP_NOP6: u8 = 0xb5;
    pub const OP_NOP7: u8 = 0xb6;
    pub const OP_NOP8: u8 = 0xb7;
    pub const OP_NOP9: u8 = 0xb8;
    pub const OP_NOP10: u8 = 0xb9;
    pub const OP_CHECKDATASIG: u8 = 0xba;
    pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;
    pub const OP_REVERSEBYTES: u8 = 0xbc;
    pub const OP_INVALIDOPCODE: u8 = 0xff;
}

use opcodes::*;

/// Push length encoding of a data push.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PushOp {
    /// Length byte 1..=75 directly encodes the push size.
    Direct,
    Data1,
    Data2,
    Data4,
}

impl PushOp {
    /// The shortest push form for `len` bytes of data.
    pub fn minimal_for(len: usize) -> PushOp {
        if len <= 75 {
            PushOp::Direct
        } else if len <= 0xff {
            PushOp::Data1
        } else if len <= 0xffff {
            PushOp::Data2
        } else {
            PushOp::Data4
        }
    }
}

/// One decoded script element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    /// A bare opcode byte (including OP_0..OP_16 and OP_1NEGATE).
    Code(u8),
    /// A data push with its length encoding.
    Push { op: PushOp, data: Vec<u8> },
    /// Truncated push at the tail of a malformed script. Scans stop here.
    Malformed(Vec<u8>),
}

impl Opcode {
    /// Builds the dedicated small-integer opcode for -1..=16.
    pub fn from_small(value: i8) -> Opcode {
        debug_assert!((-1..=16).contains(&value));
        match value {
            -1 => Opcode::Code(OP_1NEGATE),
            0 => Opcode::Code(OP_0),
            n => Opcode::Code(OP_1 + (n as u8) - 1),
        }
    }

    /// Builds the minimal encoding of `data` as a push: the dedicated
    /// opcode for empty, -1, and 1..=16, the shortest push form
    /// otherwise.
    pub fn from_push(data: &[u8]) -> Opcode {
        if data.is_empty() {
            return Opcode::Code(OP_0);
        }
        if data.len() == 1 {
            let byte = data[0];
            if byte == 0x81 {
                return Opcode::Code(OP_1NEGATE);
            }
            if (1..=16).contains(&byte) {
                return Opcode::Code(OP_1 + byte - 1);
            }
        }
        Opcode::Push { op: PushOp::minimal_for(data.len()), data: data.to_vec() }
    }

    /// Builds the minimal encoding of a number, using the dedicated
    /// opcodes for -1..=16.
    pub fn from_num(num: ScriptNum) -> Opcode {
        if (-1..=16).contains(&num.value()) {
            Opcode::from_small(num.value() as i8)
        } else {
            Opcode::from_push(&num.encode())
        }
    }

    /// The shortest *pure* push form of `data`, never folding small
    /// integers into their dedicated opcodes. Signatures reserialized
    /// for findAndDelete use this form, matching how they appear in
    /// input scripts.
    fn raw_push(data: &[u8]) -> Opcode {
        Opcode::Push { op: PushOp::minimal_for(data.len()), data: data.to_vec() }
    }

    /// The opcode byte as seen by the VM, or -1 for the sentinel.
    pub fn value(&self) -> i32 {
        match self {
            Opcode::Code(byte) => *byte as i32,
            Opcode::Push { op, data } => match op {
                PushOp::Direct => data.len() as i32,
                PushOp::Data1 => OP_PUSHDATA1 as i32,
                PushOp::Data2 => OP_PUSHDATA2 as i32,
                PushOp::Data4 => OP_PUSHDATA4 as i32,
            },
            Opcode::Malformed(_) => -1,
        }
    }

    /// Push payload, if this is a data push.
    pub fn push_data(&self) -> Option<&[u8]> {
        match self {
            Opcode::Push { data, .. } => Some(data),
            _ => None,
        }
    }

    /// True for anything a push-only script may contain (up to OP_16).
    pub fn is_push(&self) -> bool {
        match self {
            Opcode::Code(byte) => *byte <= OP_16,
            Opcode::Push { .. } => true,
            Opcode::Malformed(_) => false,
        }
    }

    /// True iff this push uses the shortest possible encoding and, for
    /// the values -1..=16 and empty, the dedicated opcode.
    pub fn is_minimal(&self) -> bool {
        let Opcode::Push { op, data } = self else {
            return true;
        };
        if data.is_empty() {
            return false; // must be OP_0
        }
        if data.len() == 1 {
            let byte = data[0];
            if byte == 0x81 || (1..=16).contains(&byte) {
                return false; // must be OP_1NEGATE / OP_1..OP_16
            }
        }
        *op == PushOp::minimal_for(data.len())
    }

    /// Permanently disabled opcodes.
    pub fn is_disabled(&self) -> bool {
        matches!(
            self,
            Opcode::Code(OP_INVERT)
                | Opcode::Code(OP_2MUL)
                | Opcode::Code(OP_2DIV)
                | Opcode::Code(OP_MUL)
                | Opcode::Code(OP_LSHIFT)
                | Opcode::Code(OP_RSHIFT)
        )
    }

    /// Conditional-flow opcodes, handled even inside a skipped branch.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Code(OP_IF) | Opcode::Code(OP_NOTIF) | Opcode::Code(OP_ELSE) | Opcode::Code(OP_ENDIF)
        )
    }

    /// Serialized size in bytes.
    pub fn serialized_len(&self) -> usize {
        match self {
            Opcode::Code(_) => 1,
            Opcode::Push { op, data } => {
                let header = match op {
                    PushOp::Direct => 1,
                    PushOp::Data1 => 2,
                    PushOp::Data2 => 3,
                    PushOp::Data4 => 5,
                };
                header + data.len()
            }
            Opcode::Malformed(tail) => tail.len(),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Opcode::Code(byte) => out.push(*byte),
            Opcode::Push { op, data } => {
                match op {
                    PushOp::Direct => out.push(data.len() as u8),
                    PushOp::Data1 => {
                        out.push(OP_PUSHDATA1);
                        out.push(data.len() as u8);
                    }
                    PushOp::Data2 => {
                        out.push(OP_PUSHDATA2);
                        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    }
                    PushOp::Data4 => {
                        out.push(OP_PUSHDATA4);
                        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    }
                }
                out.extend_from_slice(data);
            }
            Opcode::Malformed(tail) => out.extend_from_slice(tail),
        }
    }
}

/// An ordered opcode sequence plus its canonical serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    ops: Vec<Opcode>,
    raw: Vec<u8>,
}

impl Script {
    pub fn new() -> Script {
        Script::default()
    }

    /// Decodes a raw script. Never fails: a truncated push leaves the
    /// remaining bytes behind the sentinel.
    pub fn from_bytes(bytes: &[u8]) -> Script {
        let mut ops = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let start = cursor;
            let opcode = bytes[cursor];
            cursor += 1;
            match opcode {
                0x01..=0x4b => {
                    let len = opcode as usize;
                    if cursor + len > bytes.len() {
                        ops.push(Opcode::Malformed(bytes[start..].to_vec()));
                        break;
                    }
                    ops.push(Opcode::Push {
                        op: PushOp::Direct,
                        data: bytes[cursor..cursor + len].to_vec(),
                    });
                    cursor += len;
                }
                OP_PUSHDATA1 | OP_PUSHDATA2 | OP_PUSHDATA4 => {
                    let (push_op, width) = match opcode {
                        OP_PUSHDATA1 => (PushOp::Data1, 1),
                        OP_PUSHDATA2 => (PushOp::Data2, 2),
                        _ => (PushOp::Data4, 4),
                    };
                    if cursor + width > bytes.len() {
                        ops.push(Opcode::Malformed(bytes[start..].to_vec()));
                        break;
                    }
                    let mut len = 0usize;
                    for i in 0..width {
                        len |= (bytes[cursor + i] as usize) << (8 * i);
                    }
                    cursor += width;
                    if cursor + len > bytes.len() {
                        ops.push(Opcode::Malformed(bytes[start..].to_vec()));
                        break;
                    }
                    ops.push(Opcode::Push { op: push_op, data: bytes[cursor..cursor + len].to_vec() });
                    cursor += len;
                }
                _ => ops.push(Opcode::Code(opcode)),
            }
        }
        Script { ops, raw: bytes.to_vec() }
    }

    /// Builds a script from opcodes, compiling the serialization.
    pub fn from_ops(ops: Vec<Opcode>) -> Script {
        let mut script = Script { ops, raw: Vec::new() };
        script.compile();
        script
    }

    /// Recomputes the canonical serialization from the opcode sequence.
    pub fn compile(&mut self) {
        let mut raw = Vec::with_capacity(self.ops.iter().map(Opcode::serialized_len).sum());
        for op in &self.ops {
            op.write_to(&mut raw);
        }
        self.raw = raw;
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.raw.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn ops(&self) -> &[Opcode] {
        &self.ops
    }

    /// The subscript starting at opcode index `start`: the portion from
    /// the most recent OP_CODESEPARATOR onward when hashing signatures.
    pub fn subscript(&self, start: usize) -> Script {
        Script::from_ops(self.ops[start.min(self.ops.len())..].to_vec())
    }

    /// Removes every opcode that serializes identically to the minimal
    /// push of `data`. Returns the filtered script and the removal count.
    /// Only whole opcodes match; the malformed tail is left untouched.
    pub fn find_and_delete(&self, data: &[u8]) -> (Script, usize) {
        if data.is_empty() {
            return (self.clone(), 0);
        }
        let mut pattern = Vec::new();
        Opcode::raw_push(data).write_to(&mut pattern);

        let mut kept = Vec::with_capacity(self.ops.len());
        let mut removed = 0usize;
        let mut scratch = Vec::new();
        for op in &self.ops {
            if !matches!(op, Opcode::Malformed(_)) {
                scratch.clear();
                op.write_to(&mut scratch);
                if scratch == pattern {
                    removed += 1;
                    continue;
                }
            }
            kept.push(op.clone());
        }
        (Script::from_ops(kept), removed)
    }

    /// True iff every element is a push (up to OP_16) and the script
    /// decodes cleanly.
    pub fn is_push_only(&self) -> bool {
        self.ops.iter().all(Opcode::is_push)
    }

    /// The exact pay-to-script-hash template:
    /// `OP_HASH160 <20 bytes> OP_EQUAL`.
    pub fn is_p2sh(&self) -> bool {
        self.raw.len() == 23
            && self.raw[0] == OP_HASH160
            && self.raw[1] == 0x14
            && self.raw[22] == OP_EQUAL
    }

    /// A witness-program template: version byte (OP_0 or OP_1..OP_16)
    /// followed by a single 2..40 byte push spanning the whole script.
    /// The fork never validates these; the spender of a mis-sent output
    /// is allowed to recover it.
    pub fn is_witness_program(&self) -> bool {
        if self.raw.len() < 4 || self.raw.len() > 42 {
            return false;
        }
        if self.raw[0] != OP_0 && !(OP_1..=OP_16).contains(&self.raw[0]) {
            return false;
        }
        self.raw[1] as usize == self.raw.len() - 2
    }

    /// Counts signature operations. With `accurate`, a CHECKMULTISIG
    /// preceded by a small-integer key count contributes that count;
    /// otherwise the multisig maximum. The scan stops at the sentinel.
    pub fn sigops(&self, accurate: bool) -> u32 {
        let mut total = 0u32;
        let mut last: Option<&Opcode> = None;
        for op in &self.ops {
            match op {
                Opcode::Code(OP_CHECKSIG) | Opcode::Code(OP_CHECKSIGVERIFY) => total += 1,
                Opcode::Code(OP_CHECKDATASIG) | Opcode::Code(OP_CHECKDATASIGVERIFY) => total += 1,
                Opcode::Code(OP_CHECKMULTISIG) | Opcode::Code(OP_CHECKMULTISIGVERIFY) => {
                    total += match last {
                        Some(Opcode::Code(byte)) if (OP_1..=OP_16).contains(byte) && accurate => {
                            (*byte - OP_1 + 1) as u32
                        }
                        _ => MAX_PUBKEYS_PER_MULTISIG as u32,
                    };
                }
                Opcode::Malformed(_) => break,
                _ => {}
            }
            last = Some(op);
        }
        total
    }

    /// Sigops contributed by the redeem script of a P2SH spend. `self`
    /// is the output script; `input` must be push-only with the redeem
    /// script as its final push.
    pub fn p2sh_sigops(&self, input: &Script) -> u32 {
        if !self.is_p2sh() || !input.is_push_only() {
            return 0;
        }
        match input.ops.last() {
            Some(Opcode::Push { data, .. }) => Script::from_bytes(data).sigops(true),
            _ => 0,
        }
    }

    /// Rejects scripts over the consensus size bound. Checked by the
    /// interpreter before execution.
    pub fn check_size(&self) -> Result<(), ScriptError> {
        if self.raw.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }
        Ok(())
    }
}

/// Incremental script builder used by tests and template construction.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    ops: Vec<Opcode>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_opcode(mut self, byte: u8) -> Self {
        self.ops.push(Opcode::Code(byte));
        self
    }

    pub fn push_data(mut self, data: &[u8]) -> Self {
        self.ops.push(Opcode::from_push(data));
        self
    }

    pub fn push_num(mut self, value: i64) -> Self {
        self.ops.push(Opcode::from_num(ScriptNum(value)));
        self
    }

    pub fn into_script(self) -> Script {
        Script::from_ops(self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_well_formed_scripts() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![OP_1],
            vec![OP_DUP, OP_HASH160, 0x02, 0xaa, 0xbb, OP_EQUALVERIFY, OP_CHECKSIG],
            {
                let mut script = vec![OP_PUSHDATA1, 76];
                script.extend(std::iter::repeat(0x42).take(76));
                script
            },
        ];
        for raw in cases {
            let script = Script::from_bytes(&raw);
            assert_eq!(script.to_bytes(), raw);
            assert_eq!(Script::from_bytes(&script.to_bytes()), script);
        }
    }

    #[test]
    fn truncated_push_becomes_sentinel() {
        let script = Script::from_bytes(&[OP_1, 0x05, 0xaa, 0xbb]);
        assert_eq!(script.ops().len(), 2);
        assert_eq!(script.ops()[1].value(), -1);
        assert!(matches!(&script.ops()[1], Opcode::Malformed(tail) if tail == &[0x05, 0xaa, 0xbb]));
        // Round-trip still holds through the sentinel.
        assert_eq!(script.to_bytes(), vec![OP_1, 0x05, 0xaa, 0xbb]);
    }

    #[test]
    fn from_push_is_minimal_for_all_sizes() {
        for len in [0usize, 1, 75, 76, 255, 256, 520] {
            let data = vec![0xabu8; len];
            let op = Opcode::from_push(&data);
            assert!(op.is_minimal(), "len {len}");
        }
    }

    #[test]
    fn small_integer_pushes_are_not_minimal_as_data() {
        assert!(!Opcode::Push { op: PushOp::Direct, data: vec![0x01] }.is_minimal());
        assert!(!Opcode::Push { op: PushOp::Direct, data: vec![0x10] }.is_minimal());
        assert!(!Opcode::Push { op: PushOp::Direct, data: vec![0x81] }.is_minimal());
        assert!(Opcode::Push { op: PushOp::Direct, data: vec![0x11] }.is_minimal());
        assert!(!Opcode::Push { op: PushOp::Data1, data: vec![0x42; 75] }.is_minimal());
    }

    #[test]
    fn from_num_uses_dedicated_opcodes() {
        assert_eq!(Opcode::from_num(ScriptNum(0)), Opcode::Code(OP_0));
        assert_eq!(Opcode::from_num(ScriptNum(-1)), Opcode::Code(OP_1NEGATE));
        assert_eq!(Opcode::from_num(ScriptNum(16)), Opcode::Code(OP_16));
        assert!(matches!(Opcode::from_num(ScriptNum(17)), Opcode::Push { .. }));
    }

    #[test]
    fn find_and_delete_matches_whole_opcodes_only() {
        let sig = vec![0x02, 0x03];
        let script = ScriptBuilder::new()
            .push_data(&sig)
            .push_opcode(OP_ADD)
            .push_data(&sig)
            .into_script();
        let (filtered, removed) = script.find_and_delete(&sig);
        assert_eq!(removed, 2);
        assert_eq!(filtered.to_bytes(), vec![OP_ADD]);

        // A byte-level substring of a larger push must not match.
        let script = ScriptBuilder::new().push_data(&[0x02, 0x03, 0x04]).into_script();
        let (filtered, removed) = script.find_and_delete(&sig);
        assert_eq!(removed, 0);
        assert_eq!(filtered, script);
    }

    #[test]
    fn p2sh_template_is_exact() {
        let hash = [0x11u8; 20];
        let script = ScriptBuilder::new()
            .push_opcode(OP_HASH160)
            .push_data(&hash)
            .push_opcode(OP_EQUAL)
            .into_script();
        assert!(script.is_p2sh());

        let longer = ScriptBuilder::new()
            .push_opcode(OP_HASH160)
            .push_data(&hash)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOP)
            .into_script();
        assert!(!longer.is_p2sh());
    }

    #[test]
    fn witness_program_detection() {
        let program = ScriptBuilder::new().push_opcode(OP_0).push_data(&[0u8; 20]).into_script();
        assert!(program.is_witness_program());
        let v1 = ScriptBuilder::new().push_opcode(OP_1).push_data(&[0u8; 32]).into_script();
        assert!(v1.is_witness_program());
        let not = ScriptBuilder::new().push_opcode(OP_0).push_data(&[0u8; 1]).into_script();
        assert!(!not.is_witness_program());
    }

    #[test]
    fn sigop_counting_accurate_and_legacy() {
        let script = ScriptBuilder::new()
            .push_opcode(OP_2)
            .push_data(&[0x02; 33])
            .push_data(&[0x03; 33])
            .push_opcode(OP_2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_CHECKDATASIG)
            .into_script();
        assert_eq!(script.sigops(true), 4);
        assert_eq!(script.sigops(false), MAX_PUBKEYS_PER_MULTISIG as u32 + 2);
    }

    #[test]
    fn push_only_rejects_sentinel_and_operators() {
        assert!(Script::from_bytes(&[OP_0, OP_1, 0x01, 0xaa]).is_push_only());
        assert!(!Script::from_bytes(&[OP_DUP]).is_push_only());
        assert!(!Script::from_bytes(&[0x05, 0xaa]).is_push_only());
    }
}
