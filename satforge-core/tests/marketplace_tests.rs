mod common;

use bdk::FeeRate;
use satforge_core::config::Config;
use satforge_core::error::SatForgeError;
use satforge_core::marketplace::{AffordabilityPolicy, Marketplace, MarketplaceOffer, MarketplacePolicy};
use satforge_core::providers::{Deadline, MockChainSource};
use satforge_core::transaction_builder::FeeConvergingBuilder;
use satforge_core::types::AddressKind;

use common::{account, p2tr, p2wpkh, setup, spend_source, utxo, utxo_with_confirmations};

fn rate(sat_per_vb: f32) -> FeeRate {
    FeeRate::from_sat_per_vb(sat_per_vb)
}

fn unisat(price: u64) -> MarketplaceOffer {
    MarketplaceOffer::new(Marketplace::Unisat, price)
}

fn okx(price: u64) -> MarketplaceOffer {
    MarketplaceOffer::new(Marketplace::Okx, price)
}

/// 20k confirmed, 30k in the mempool, two padding outputs
fn bidder_chain() -> MockChainSource {
    let address = p2tr(4);
    MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 20_000))
        .with_unspent(utxo_with_confirmations(&address, 2, 0, 30_000, 0))
        .with_unspent(utxo(&address, 3, 0, 600))
        .with_unspent(utxo(&address, 4, 0, 600))
}

#[test]
fn test_bid_cost_adds_per_offer_allowance() {
    setup();
    let policy = AffordabilityPolicy::default();

    assert_eq!(policy.estimate_bid_cost(&[unisat(10_000), okx(5_000)], rate(10.0)).unwrap(), 24_640);
    assert_eq!(policy.estimate_bid_cost(&[okx(1_000)], rate(1.5)).unwrap(), 1_723);
    // 482 × 2.25 = 1084.5, halves round up
    assert_eq!(policy.estimate_bid_cost(&[okx(0)], rate(2.25)).unwrap(), 1_085);
    assert_eq!(policy.estimate_bid_cost(&[], rate(10.0)).unwrap(), 0);
}

#[test]
fn test_confirmed_funds_needed_only_when_every_offer_enforces() {
    setup();
    let policy = AffordabilityPolicy::default();

    assert!(policy.insist_confirmed(&[unisat(1), unisat(2)]));
    assert!(!policy.insist_confirmed(&[unisat(1), okx(2)]));
    assert!(!policy.insist_confirmed(&[okx(1)]));
    assert!(policy.insist_confirmed(&[]));
}

#[test]
fn test_enforcing_set_comes_from_config() {
    setup();
    let mut config = Config::default();
    config.marketplace.confirmed_enforcing = vec![Marketplace::Okx, Marketplace::MagicEden];

    let policy = AffordabilityPolicy::from_config(&config);
    assert!(policy.insist_confirmed(&[okx(1), MarketplaceOffer::new(Marketplace::MagicEden, 2)]));
    assert!(!policy.insist_confirmed(&[unisat(1)]));
}

#[test]
fn test_enforcing_offers_only_count_confirmed_funds() {
    setup();
    let chain = bidder_chain();
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());
    let address = p2tr(4);

    assert!(market.can_afford(&address, &[unisat(10_000)], Some(rate(1.0)), &Deadline::none()).unwrap());
    assert!(!market.can_afford(&address, &[unisat(25_000)], Some(rate(1.0)), &Deadline::none()).unwrap());
}

#[test]
fn test_one_tolerant_offer_relaxes_the_check() {
    setup();
    let chain = bidder_chain();
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());
    let address = p2tr(4);

    assert!(market.can_afford(&address, &[okx(25_000)], Some(rate(1.0)), &Deadline::none()).unwrap());
    assert!(market
        .can_afford(&address, &[unisat(12_000), okx(12_000)], Some(rate(1.0)), &Deadline::none())
        .unwrap());
}

#[test]
fn test_padding_outputs_never_fund_bids() {
    setup();
    let address = p2tr(4);
    let chain = MockChainSource::new()
        .with_unspent(utxo(&address, 1, 0, 600))
        .with_unspent(utxo(&address, 2, 0, 600))
        .with_unspent(utxo(&address, 3, 0, 600));
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());

    // 482 sats would be covered by any single padding output
    assert!(!market.can_afford(&address, &[okx(0)], Some(rate(1.0)), &Deadline::none()).unwrap());
    assert_eq!(market.padding_outputs(&address, &Deadline::none()).unwrap(), 3);
}

#[test]
fn test_empty_offer_list() {
    setup();
    let chain = bidder_chain();
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());

    assert!(market.can_afford(&p2tr(4), &[], Some(rate(5.0)), &Deadline::none()).unwrap());
    assert!(!market.can_afford(&p2wpkh(3), &[], Some(rate(5.0)), &Deadline::none()).unwrap());
}

#[test]
fn test_spend_address_prefers_taproot() {
    setup();
    let chain = bidder_chain().with_unspent(utxo(&p2wpkh(3), 9, 0, 100_000));
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());

    let source = market
        .select_spend_address(&account(), &[unisat(5_000)], Some(rate(1.0)), &Deadline::none())
        .unwrap();
    assert_eq!(source.kind, AddressKind::Taproot);

    // Taproot only has 20k confirmed; native segwit takes over
    let source = market
        .select_spend_address(&account(), &[unisat(50_000)], Some(rate(1.0)), &Deadline::none())
        .unwrap();
    assert_eq!(source.kind, AddressKind::NativeSegwit);
    assert_eq!(source.address, p2wpkh(3));
}

#[test]
fn test_spend_address_shortfall_reports_cost() {
    setup();
    let chain = bidder_chain();
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());

    let result = market.select_spend_address(&account(), &[unisat(500_000)], Some(rate(2.0)), &Deadline::none());
    assert!(matches!(
        result,
        Err(SatForgeError::InsufficientFunds { needed: 500_964, available: 0, .. })
    ));
}

#[test]
fn test_prepare_padding_outputs_tops_up() {
    setup();
    let chain = bidder_chain().with_unspent(utxo(&p2tr(4), 5, 0, 50_000));
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());
    let builder = FeeConvergingBuilder::new(&chain);
    let source = spend_source(AddressKind::Taproot, 4);

    let existing = market
        .prepare_padding_outputs(&builder, &source, 2, Some(rate(2.0)), &Deadline::none())
        .unwrap();
    assert!(existing.is_none());

    let built = market
        .prepare_padding_outputs(&builder, &source, 3, Some(rate(2.0)), &Deadline::none())
        .unwrap()
        .expect("padding transaction");
    let tx = built.unsigned_tx();
    assert_eq!(tx.output.len(), 4);
    assert!(tx.output[..3]
        .iter()
        .all(|output| output.value == 600 && output.script_pubkey == p2tr(4).script_pubkey()));
    assert_eq!(built.change_vout(), Some(3));
}

#[test]
fn test_affordability_without_rate_uses_fee_source() {
    setup();
    let chain = bidder_chain();
    let deadline = Deadline::none();

    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default());
    let result = market.can_afford(&p2tr(4), &[unisat(10_000)], None, &deadline);
    assert!(matches!(result, Err(SatForgeError::Validation(_))));

    // 20 sat/vB from the source: 482 vB cost 9_640 per offer
    let market = MarketplacePolicy::new(&chain, AffordabilityPolicy::default()).with_fee_source(&chain);
    assert!(market.can_afford(&p2tr(4), &[unisat(10_000)], None, &deadline).unwrap());
    assert!(!market.can_afford(&p2tr(4), &[unisat(10_500)], None, &deadline).unwrap());
}
