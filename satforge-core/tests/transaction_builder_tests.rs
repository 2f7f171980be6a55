mod common;

use bdk::FeeRate;
use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use satforge_core::config::Config;
use satforge_core::error::SatForgeError;
use satforge_core::fee_estimation::DraftOutput;
use satforge_core::providers::{Deadline, MockChainSource, MockSigner, Signer};
use satforge_core::transaction_builder::{
    assemble_psbt, extract_hex, psbt_from_bytes, BuildRequest, FeeConvergingBuilder, FundingInput,
};
use satforge_core::types::{AddressKind, UnspentOutput};
use std::time::Duration;

use common::{p2pkh, p2shwpkh, p2tr, p2wpkh, pubkey, setup, spend_source, utxo, utxo_with_confirmations, xonly};

fn rate(sat_per_vb: f32) -> FeeRate {
    FeeRate::from_sat_per_vb(sat_per_vb)
}

fn send_request(amount: u64, fee_rate: f32) -> BuildRequest {
    BuildRequest::new(
        spend_source(AddressKind::NativeSegwit, 3),
        vec![DraftOutput::to_address(&p2wpkh(9), amount)],
        amount,
        rate(fee_rate),
    )
}

fn smallest_first() -> Config {
    let mut config = Config::default();
    config.spend.utxo_sort_greatest_to_least = false;
    config
}

/// A funding transaction paying `value` to `script` at output 0
fn previous_transaction(script: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(common::txid(99), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value, script_pubkey: script }],
    }
}

#[test]
fn test_single_input_send_converges_in_one_round() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 100_000));
    let builder = FeeConvergingBuilder::new(&chain);

    let built = builder.build(send_request(4_540, 10.0), &Deadline::none()).unwrap();

    assert_eq!(built.vsize, 141);
    assert_eq!(built.fee, 1_410);
    assert_eq!(built.change, 94_050);
    assert_eq!(built.iterations, 1);
    assert_eq!(built.inputs.len(), 1);

    let tx = built.unsigned_tx();
    assert_eq!(tx.version, 2);
    assert_eq!(tx.lock_time, LockTime::ZERO);
    assert!(tx.input.iter().all(|input| input.sequence == Sequence::ENABLE_RBF_NO_LOCKTIME));
    assert_eq!(tx.output.len(), 2);
    assert_eq!(tx.output[0].value, 4_540);
    assert_eq!(built.change_vout(), Some(1));
    assert_eq!(tx.output[1].script_pubkey, p2wpkh(3).script_pubkey());

    let witness_utxo = built.psbt.inputs[0].witness_utxo.as_ref().unwrap();
    assert_eq!(witness_utxo.value, 100_000);
}

#[test]
fn test_change_goes_to_requested_address() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 100_000));
    let builder = FeeConvergingBuilder::new(&chain);

    let request = send_request(4_540, 10.0).with_change_address(p2tr(4));
    let built = builder.build(request, &Deadline::none()).unwrap();

    let change_vout = built.change_vout().unwrap();
    assert_eq!(built.unsigned_tx().output[change_vout].script_pubkey, p2tr(4).script_pubkey());
}

#[test]
fn test_build_is_deterministic() {
    setup();
    let chain = MockChainSource::new()
        .with_unspent(utxo(&p2wpkh(3), 1, 0, 60_000))
        .with_unspent(utxo(&p2wpkh(3), 2, 1, 40_000));
    let builder = FeeConvergingBuilder::new(&chain);

    let first = builder.build(send_request(70_000, 5.0), &Deadline::none()).unwrap();
    let second = builder.build(send_request(70_000, 5.0), &Deadline::none()).unwrap();

    assert_eq!(first.unsigned_tx().txid(), second.unsigned_tx().txid());
    assert_eq!(first.to_bytes(), second.to_bytes());
}

#[test]
fn test_psbt_encodings_round_trip() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 100_000));
    let built = FeeConvergingBuilder::new(&chain)
        .build(send_request(10_000, 2.0), &Deadline::none())
        .unwrap();

    let decoded = psbt_from_bytes(&built.to_bytes()).unwrap();
    assert_eq!(decoded, built.psbt);

    assert_eq!(base64::decode(built.to_base64()).unwrap(), built.to_bytes());
    assert_eq!(hex::decode(built.to_hex()).unwrap(), built.to_bytes());
}

#[test]
fn test_sub_dust_change_is_left_to_the_fee() {
    setup();
    let address = p2wpkh(3);
    let chain = MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 3_000))
        .with_unspent(utxo(&address, 2, 0, 4_000))
        .with_unspent(utxo(&address, 3, 0, 20_000));
    let builder = FeeConvergingBuilder::from_config(&chain, &smallest_first());

    let built = builder.build(send_request(4_540, 10.0), &Deadline::none()).unwrap();

    // 7000 in, 4540 out, 2090 fee: 370 left, below dust
    assert_eq!(built.inputs.len(), 2);
    assert_eq!(built.change, 0);
    assert_eq!(built.change_vout(), None);
    assert_eq!(built.unsigned_tx().output.len(), 1);
    assert_eq!(built.fee, 2_460);
}

#[test]
fn test_fee_growth_pulls_in_more_inputs() {
    setup();
    let address = p2wpkh(3);
    let chain = MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 2_000))
        .with_unspent(utxo(&address, 2, 0, 3_000))
        .with_unspent(utxo(&address, 3, 0, 30_000));
    let builder = FeeConvergingBuilder::from_config(&chain, &smallest_first());

    let built = builder.build(send_request(4_540, 10.0), &Deadline::none()).unwrap();

    assert_eq!(built.iterations, 2);
    assert_eq!(built.inputs.len(), 3);
    assert_eq!(built.vsize, 277);
    assert_eq!(built.fee, 2_770);
    assert_eq!(built.change, 27_690);

    let inputs: u64 = built.inputs.iter().map(|input| input.utxo.value).sum();
    let outputs: u64 = built.unsigned_tx().output.iter().map(|output| output.value).sum();
    assert_eq!(inputs - outputs, built.fee);
}

#[test]
fn test_iteration_bound_reports_insufficient_funds() {
    setup();
    let address = p2wpkh(3);
    let chain = MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 2_000))
        .with_unspent(utxo(&address, 2, 0, 3_000))
        .with_unspent(utxo(&address, 3, 0, 30_000));
    let builder = FeeConvergingBuilder::from_config(&chain, &smallest_first()).with_max_iterations(1);

    let result = builder.build(send_request(4_540, 10.0), &Deadline::none());
    assert!(matches!(
        result,
        Err(SatForgeError::InsufficientFunds { needed: 6_630, .. })
    ));
}

#[test]
fn test_insufficient_funds_reports_needed_and_available() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 5_000));
    let builder = FeeConvergingBuilder::new(&chain);

    match builder.build(send_request(4_540, 10.0), &Deadline::none()) {
        Err(SatForgeError::InsufficientFunds { needed, available, shortfall }) => {
            assert_eq!(needed, 5_950);
            assert_eq!(available, 5_000);
            assert_eq!(shortfall, 950);
        }
        other => panic!("expected InsufficientFunds, got {:?}", other),
    }
}

#[test]
fn test_empty_address_fails_before_any_round() {
    setup();
    let chain = MockChainSource::new();
    let result = FeeConvergingBuilder::new(&chain).build(send_request(10_000, 1.0), &Deadline::none());
    assert!(matches!(
        result,
        Err(SatForgeError::InsufficientFunds { needed: 10_000, available: 0, .. })
    ));
}

#[test]
fn test_unconfirmed_outputs_only_when_allowed() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo_with_confirmations(&p2wpkh(3), 1, 0, 100_000, 0));

    let strict = FeeConvergingBuilder::new(&chain);
    assert!(matches!(
        strict.build(send_request(10_000, 1.0), &Deadline::none()),
        Err(SatForgeError::InsufficientFunds { .. })
    ));

    let relaxed = FeeConvergingBuilder::new(&chain).with_insist_confirmed(false);
    assert!(relaxed.build(send_request(10_000, 1.0), &Deadline::none()).is_ok());
}

#[test]
fn test_dust_outputs_are_rejected() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 100_000));
    let result = FeeConvergingBuilder::new(&chain).build(send_request(100, 1.0), &Deadline::none());
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));
}

#[test]
fn test_expired_deadline_times_out() {
    setup();
    let chain = MockChainSource::new().with_unspent(utxo(&p2wpkh(3), 1, 0, 100_000));
    let deadline = Deadline::after(Duration::ZERO);

    let result = FeeConvergingBuilder::new(&chain).build(send_request(10_000, 1.0), &deadline);
    assert!(matches!(result, Err(SatForgeError::Timeout { .. })));
    assert_eq!(chain.list_calls(), 0);
}

#[test]
fn test_signed_size_matches_estimate() {
    setup();
    let address = p2wpkh(3);
    let chain = MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 30_000))
        .with_unspent(utxo(&address, 2, 0, 30_000));
    let built = FeeConvergingBuilder::new(&chain)
        .build(send_request(45_000, 3.0), &Deadline::none())
        .unwrap();

    let signed = MockSigner::new().sign_all_inputs(built.psbt.clone(), true).unwrap();
    let (tx, raw) = extract_hex(signed);

    assert_eq!(tx.vsize(), built.vsize);
    assert_eq!(tx.txid(), built.unsigned_tx().txid());
    assert!(!raw.is_empty());
}

#[test]
fn test_legacy_input_carries_previous_transaction() {
    setup();
    let address = p2pkh(1);
    let previous = previous_transaction(address.script_pubkey(), 50_000);
    let funding = UnspentOutput::new(previous.txid(), 0, 50_000, address.script_pubkey(), address.to_string(), 3);
    let chain = MockChainSource::new()
        .with_unspent(funding)
        .with_transaction(previous.clone());

    let request = BuildRequest::new(
        spend_source(AddressKind::Legacy, 1),
        vec![DraftOutput::to_address(&p2wpkh(9), 10_000)],
        10_000,
        rate(2.0),
    );
    let built = FeeConvergingBuilder::new(&chain).build(request, &Deadline::none()).unwrap();

    assert_eq!(built.psbt.inputs[0].non_witness_utxo.as_ref(), Some(&previous));
    assert!(built.psbt.inputs[0].witness_utxo.is_none());
}

#[test]
fn test_legacy_input_without_previous_transaction_is_invalid() {
    setup();
    let chain = MockChainSource::new();
    let input = FundingInput::new(utxo(&p2pkh(1), 1, 0, 50_000), AddressKind::Legacy, Some(pubkey(1)));

    let result = assemble_psbt(
        &chain,
        &[input],
        &[DraftOutput::to_address(&p2wpkh(9), 10_000)],
        &Deadline::none(),
    );
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));
}

#[test]
fn test_nested_segwit_input_needs_public_key() {
    setup();
    let chain = MockChainSource::new();
    let outputs = [DraftOutput::to_address(&p2wpkh(9), 10_000)];
    let funding = utxo(&p2shwpkh(2), 1, 0, 50_000);

    let missing = FundingInput::new(funding.clone(), AddressKind::NestedSegwit, None);
    let result = assemble_psbt(&chain, &[missing], &outputs, &Deadline::none());
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));

    let present = FundingInput::new(funding, AddressKind::NestedSegwit, Some(pubkey(2)));
    let psbt = assemble_psbt(&chain, &[present], &outputs, &Deadline::none()).unwrap();
    let expected = ScriptBuf::new_v0_p2wpkh(&pubkey(2).wpubkey_hash().unwrap());
    assert_eq!(psbt.inputs[0].redeem_script.as_ref(), Some(&expected));
    assert!(psbt.inputs[0].witness_utxo.is_some());
}

#[test]
fn test_taproot_input_carries_internal_key() {
    setup();
    let chain = MockChainSource::new();
    let input = FundingInput::from_source(utxo(&p2tr(4), 1, 0, 50_000), &spend_source(AddressKind::Taproot, 4));

    let psbt = assemble_psbt(
        &chain,
        &[input],
        &[DraftOutput::to_address(&p2wpkh(9), 10_000)],
        &Deadline::none(),
    )
    .unwrap();

    assert_eq!(psbt.inputs[0].tap_internal_key, Some(xonly(4)));
    assert_eq!(psbt.inputs[0].witness_utxo.as_ref().map(|out| out.value), Some(50_000));
}

#[test]
fn test_duplicate_inputs_are_rejected() {
    setup();
    let chain = MockChainSource::new();
    let funding = utxo(&p2wpkh(3), 1, 0, 50_000);
    let input = FundingInput::from_source(funding, &spend_source(AddressKind::NativeSegwit, 3));

    let result = assemble_psbt(
        &chain,
        &[input.clone(), input],
        &[DraftOutput::to_address(&p2wpkh(9), 10_000)],
        &Deadline::none(),
    );
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));
}

#[test]
fn test_additional_sources_fund_the_shortfall() {
    setup();
    let chain = MockChainSource::new()
        .with_unspent(utxo(&p2shwpkh(2), 1, 0, 3_500))
        .with_unspent(utxo(&p2tr(4), 2, 0, 40_000));
    let request = BuildRequest::from_sources(
        vec![spend_source(AddressKind::NestedSegwit, 2), spend_source(AddressKind::Taproot, 4)],
        vec![DraftOutput::to_address(&p2wpkh(9), 3_000)],
        3_000,
        rate(5.0),
    )
    .unwrap();

    let built = FeeConvergingBuilder::new(&chain).build(request, &Deadline::none()).unwrap();

    let kinds: Vec<AddressKind> = built.inputs.iter().map(|input| input.kind).collect();
    assert_eq!(kinds, vec![AddressKind::NestedSegwit, AddressKind::Taproot]);
    assert!(built.psbt.inputs[0].redeem_script.is_some());
    assert_eq!(built.psbt.inputs[1].tap_internal_key, Some(xonly(4)));

    // Change defaults to the first source
    let change_vout = built.change_vout().unwrap();
    assert_eq!(built.unsigned_tx().output[change_vout].script_pubkey, p2shwpkh(2).script_pubkey());
}

#[test]
fn test_request_needs_a_source() {
    setup();
    let result = BuildRequest::from_sources(Vec::new(), vec![DraftOutput::to_address(&p2wpkh(9), 3_000)], 3_000, rate(1.0));
    assert!(matches!(
        result,
        Err(SatForgeError::InsufficientFunds { needed: 3_000, available: 0, .. })
    ));

    // The spend address is not listed twice
    let request = send_request(3_000, 1.0).with_additional_sources(vec![
        spend_source(AddressKind::NativeSegwit, 3),
        spend_source(AddressKind::Taproot, 4),
    ]);
    let kinds: Vec<AddressKind> = request.funding_sources().iter().map(|source| source.kind).collect();
    assert_eq!(kinds, vec![AddressKind::NativeSegwit, AddressKind::Taproot]);
}
