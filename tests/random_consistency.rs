//! Randomized invariants: encoding round-trips and deterministic
//! execution.

use proptest::prelude::*;

use cash_consensus::interpreter;
use cash_consensus::script::{Opcode, Script};
use cash_consensus::scriptnum::ScriptNum;
use cash_consensus::stack::Stack;
use cash_consensus::VERIFY_NONE;

proptest! {
    // Every interpreter-domain integer survives encode/decode with the
    // minimality requirement on.
    #[test]
    fn scriptnum_roundtrip(value in -(i32::MAX as i64)..=(i32::MAX as i64)) {
        let encoded = ScriptNum(value).encode();
        prop_assert!(encoded.len() <= 4);
        prop_assert!(ScriptNum::is_minimal(&encoded));
        let decoded = ScriptNum::decode(&encoded, true, 4).unwrap();
        prop_assert_eq!(decoded.value(), value);
    }

    // Decoding never loses bytes, malformed tails included.
    #[test]
    fn script_decoding_preserves_raw_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let script = Script::from_bytes(&bytes);
        prop_assert_eq!(script.to_bytes(), bytes);
    }

    // A script rebuilt from its decoded opcodes is the same script.
    #[test]
    fn decoded_opcodes_recompile_identically(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let script = Script::from_bytes(&bytes);
        let recompiled = Script::from_ops(script.ops().to_vec());
        prop_assert_eq!(recompiled.to_bytes(), script.to_bytes());
    }

    // fromPush always produces the minimal encoding.
    #[test]
    fn push_construction_is_minimal(data in proptest::collection::vec(any::<u8>(), 0..520)) {
        prop_assert!(Opcode::from_push(&data).is_minimal());
    }

    // Execution is a pure function of script, stack, and flags.
    #[test]
    fn execution_is_deterministic(
        pushes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..32),
    ) {
        let ops: Vec<Opcode> = pushes.iter().map(|data| Opcode::from_push(data)).collect();
        let script = Script::from_ops(ops);

        let mut first = Stack::new();
        let mut second = Stack::new();
        let result_a = interpreter::execute(&script, &mut first, VERIFY_NONE, None);
        let result_b = interpreter::execute(&script, &mut second, VERIFY_NONE, None);
        prop_assert_eq!(result_a, result_b);
        prop_assert_eq!(first, second);
    }
}
