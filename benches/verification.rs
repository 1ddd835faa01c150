use criterion::{criterion_group, criterion_main, Criterion};

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use cash_consensus::interpreter;
use cash_consensus::script::{opcodes::*, Script, ScriptBuilder};
use cash_consensus::sighash::{SigHasher, SIGHASH_ALL, SIGHASH_FORKID};
use cash_consensus::{VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_SCHNORR, VERIFY_SCHNORR_MULTISIG, VERIFY_SIGHASH_FORKID};

const VALUE: u64 = 10_000_000;

fn spending_tx() -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: bitcoin::Txid::from_byte_array([0xcc; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(VALUE - 1000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

fn p2pkh_case() -> (Script, Script, Transaction) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let pubkey = secret.public_key(&secp).serialize();
    let pubkey_hash = hash160::Hash::hash(&pubkey).to_byte_array();

    let output = ScriptBuilder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_data(&pubkey_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script();

    let tx = spending_tx();
    let hashtype = SIGHASH_ALL | SIGHASH_FORKID;
    let digest = SigHasher::new(&tx)
        .signature_hash(0, output.as_bytes(), VALUE, hashtype, true)
        .unwrap();
    let mut sig = secp
        .sign_ecdsa(&Message::from_digest(digest), &secret)
        .serialize_der()
        .to_vec();
    sig.push(hashtype as u8);

    let input = ScriptBuilder::new().push_data(&sig).push_data(&pubkey).into_script();
    (input, output, tx)
}

fn schnorr_multisig_case() -> (Script, Script, Transaction) {
    let secp = Secp256k1::new();
    let secrets: Vec<SecretKey> =
        (1u8..=3).map(|byte| SecretKey::from_slice(&[byte; 32]).unwrap()).collect();
    let pubkeys: Vec<[u8; 33]> =
        secrets.iter().map(|secret| secret.public_key(&secp).serialize()).collect();

    let mut builder = ScriptBuilder::new().push_opcode(OP_2);
    for pubkey in &pubkeys {
        builder = builder.push_data(pubkey);
    }
    let output = builder.push_opcode(OP_3).push_opcode(OP_CHECKMULTISIG).into_script();

    let tx = spending_tx();
    let hashtype = SIGHASH_ALL | SIGHASH_FORKID;
    let digest = SigHasher::new(&tx)
        .signature_hash(0, output.as_bytes(), VALUE, hashtype, true)
        .unwrap();

    let mut input = ScriptBuilder::new().push_data(&[0b0000_0101]);
    for secret in [&secrets[0], &secrets[2]] {
        let keypair = Keypair::from_secret_key(&secp, secret);
        let mut sig = secp
            .sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair)
            .serialize()
            .to_vec();
        sig.push(hashtype as u8);
        input = input.push_data(&sig);
    }
    (input.into_script(), output, tx)
}

fn bench_verification(c: &mut Criterion) {
    let flags = VERIFY_P2SH | VERIFY_SIGHASH_FORKID | VERIFY_NULLFAIL;

    let (input, output, tx) = p2pkh_case();
    c.bench_function("verify_p2pkh_ecdsa", |b| {
        b.iter(|| interpreter::verify(&input, &output, &tx, 0, VALUE, flags).unwrap())
    });

    let schnorr_flags = flags | VERIFY_SCHNORR | VERIFY_SCHNORR_MULTISIG;
    let (input, output, tx) = schnorr_multisig_case();
    c.bench_function("verify_schnorr_multisig_2of3", |b| {
        b.iter(|| interpreter::verify(&input, &output, &tx, 0, VALUE, schnorr_flags).unwrap())
    });
}

criterion_group!(benches, bench_verification);
criterion_main!(benches);
