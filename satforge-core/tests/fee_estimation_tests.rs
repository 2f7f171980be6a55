mod common;

use bdk::FeeRate;
use bitcoin::OutPoint;
use rust_decimal_macros::dec;
use satforge_core::error::SatForgeError;
use satforge_core::config::Config;
use satforge_core::fee_estimation::{
    resolve_fee_rate, DraftInput, DraftOutput, DraftTransaction, FeeEstimator, FeeRatePolicy,
};
use satforge_core::providers::MockChainSource;
use satforge_core::types::AddressKind;

use common::{p2pkh, p2tr, p2wpkh, setup, txid};

fn input(kind: AddressKind, n: u8) -> DraftInput {
    DraftInput::new(OutPoint::new(txid(n), 0), 100_000, kind)
}

#[test]
fn test_native_segwit_one_in_two_out() {
    setup();
    let draft = DraftTransaction::new(
        vec![input(AddressKind::NativeSegwit, 1)],
        vec![
            DraftOutput::to_address(&p2wpkh(5), 4_540),
            DraftOutput::to_address(&p2wpkh(3), 0),
        ],
    );

    let quote = FeeEstimator::default()
        .estimate(&draft, FeeRate::from_sat_per_vb(10.0))
        .unwrap();

    assert_eq!(quote.weight, 562);
    assert_eq!(quote.vsize, 141);
    assert_eq!(quote.fee, 1_410);
}

#[test]
fn test_fee_floor_applies_at_low_rates() {
    setup();
    let draft = DraftTransaction::new(
        vec![input(AddressKind::Taproot, 1)],
        vec![DraftOutput::to_address(&p2tr(5), 10_000)],
    );

    let quote = FeeEstimator::default()
        .estimate(&draft, FeeRate::from_sat_per_vb(1.0))
        .unwrap();
    assert!(quote.vsize < 250);
    assert_eq!(quote.fee, 250);

    let quote = FeeEstimator::with_floor(0)
        .estimate(&draft, FeeRate::from_sat_per_vb(1.0))
        .unwrap();
    assert_eq!(quote.fee, quote.vsize as u64);
}

#[test]
fn test_fractional_rates_round_up() {
    setup();
    let draft = DraftTransaction::new(
        vec![input(AddressKind::NativeSegwit, 1)],
        vec![
            DraftOutput::to_address(&p2wpkh(5), 4_540),
            DraftOutput::to_address(&p2wpkh(3), 0),
        ],
    );

    // 141 vB × 2.5 = 352.5
    let quote = FeeEstimator::default()
        .estimate(&draft, FeeRate::from_sat_per_vb(2.5))
        .unwrap();
    assert_eq!(quote.fee, 353);
}

#[test]
fn test_kinds_order_by_virtual_size() {
    setup();
    let vsize = |kind: AddressKind| {
        let draft = DraftTransaction::new(vec![input(kind, 1)], vec![DraftOutput::to_address(&p2wpkh(5), 10_000)]);
        FeeEstimator::default()
            .estimate(&draft, FeeRate::from_sat_per_vb(1.0))
            .unwrap()
            .vsize
    };

    let legacy = vsize(AddressKind::Legacy);
    let nested = vsize(AddressKind::NestedSegwit);
    let native = vsize(AddressKind::NativeSegwit);
    let taproot = vsize(AddressKind::Taproot);

    assert!(legacy > nested);
    assert!(nested > native);
    assert!(native > taproot);
}

#[test]
fn test_legacy_input_in_segwit_transaction_counts_empty_witness() {
    setup();
    let output = vec![DraftOutput::to_address(&p2pkh(5), 10_000)];
    let legacy_only = DraftTransaction::new(vec![input(AddressKind::Legacy, 1)], output.clone());
    let mixed = DraftTransaction::new(
        vec![input(AddressKind::Legacy, 1), input(AddressKind::NativeSegwit, 2)],
        output,
    );

    let (_, witness) = legacy_only.sizes();
    assert_eq!(witness, 0);

    // marker + flag, empty stack for the legacy input, then the p2wpkh stack
    let (_, witness) = mixed.sizes();
    assert_eq!(witness, 2 + 1 + 108);
}

#[test]
fn test_explicit_witness_replaces_default_estimate() {
    setup();
    let output = vec![DraftOutput::to_address(&p2tr(5), 10_000)];
    let default = DraftTransaction::new(vec![input(AddressKind::Taproot, 1)], output.clone());
    let explicit = DraftTransaction::new(
        vec![input(AddressKind::Taproot, 1).with_witness(vec![vec![0; 64], vec![0; 300], vec![0; 33]])],
        output,
    );

    let (base_default, witness_default) = default.sizes();
    let (base_explicit, witness_explicit) = explicit.sizes();

    assert_eq!(base_default, base_explicit);
    assert_eq!(witness_default, 2 + 66);
    // count + (1 + 64) + (3 + 300) + (1 + 33)
    assert_eq!(witness_explicit, 2 + 1 + 65 + 303 + 34);
}

#[test]
fn test_empty_drafts_are_invalid() {
    setup();
    let estimator = FeeEstimator::default();
    let rate = FeeRate::from_sat_per_vb(1.0);

    let no_inputs = DraftTransaction::new(vec![], vec![DraftOutput::to_address(&p2wpkh(5), 1_000)]);
    assert!(matches!(estimator.estimate(&no_inputs, rate), Err(SatForgeError::InvalidDraft(_))));

    let no_outputs = DraftTransaction::new(vec![input(AddressKind::NativeSegwit, 1)], vec![]);
    assert!(matches!(estimator.estimate(&no_outputs, rate), Err(SatForgeError::InvalidDraft(_))));
}

#[test]
fn test_explicit_fee_rate_wins() {
    setup();
    let source = MockChainSource::new();
    let rate = resolve_fee_rate(Some(FeeRate::from_sat_per_vb(42.0)), &source, 1).unwrap();
    assert_eq!(rate.as_sat_per_vb(), 42.0);
}

#[test]
fn test_source_rate_for_target_or_next_longer() {
    setup();
    let source = MockChainSource::new().with_fee_rate(3, dec!(12.5));

    assert_eq!(resolve_fee_rate(None, &source, 3).unwrap().as_sat_per_vb(), 12.5);
    // No estimate for 4 blocks; the 6-block estimate applies
    assert_eq!(resolve_fee_rate(None, &source, 4).unwrap().as_sat_per_vb(), 5.0);
    // Beyond the longest target, the longest one applies
    assert_eq!(resolve_fee_rate(None, &source, 144).unwrap().as_sat_per_vb(), 1.0);
}

#[test]
fn test_missing_estimates_is_a_source_error() {
    setup();
    let source = MockChainSource::new().without_fee_rates();
    let result = resolve_fee_rate(None, &source, 1);
    assert!(matches!(result, Err(SatForgeError::Source { .. })));
}

#[test]
fn test_invalid_explicit_rate_is_rejected() {
    setup();
    let source = MockChainSource::new();
    let result = resolve_fee_rate(Some(FeeRate::from_sat_per_vb(0.0)), &source, 1);
    assert!(matches!(result, Err(SatForgeError::Validation(_))));
}

#[test]
fn test_fee_rate_policy_lookup_order() {
    setup();
    let source = MockChainSource::new();
    let explicit = Some(FeeRate::from_sat_per_vb(42.0));

    let bare = FeeRatePolicy::default();
    assert!(matches!(bare.resolve(None), Err(SatForgeError::Validation(_))));
    assert_eq!(bare.resolve(explicit).unwrap().as_sat_per_vb(), 42.0);

    let mut config = Config::default();
    config.fees.confirmation_target = 6;
    let policy = FeeRatePolicy::default().with_source(&source).with_config(&config);
    assert_eq!(policy.target_blocks(), 6);
    assert_eq!(policy.resolve(None).unwrap().as_sat_per_vb(), 5.0);

    config.fees.default_fee_rate = Some(3.0);
    let policy = FeeRatePolicy::from_config(&config).with_source(&source);
    assert_eq!(policy.resolve(None).unwrap().as_sat_per_vb(), 3.0);
    assert_eq!(policy.resolve(explicit).unwrap().as_sat_per_vb(), 42.0);
    assert!(policy.resolve(Some(FeeRate::from_sat_per_vb(0.0))).is_err());
}
