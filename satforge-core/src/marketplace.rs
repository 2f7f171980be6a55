//! Marketplace bid affordability
//!
//! Before bidding on marketplace offers the wallet checks that one of its
//! addresses can cover every offer's price plus a per-offer fee allowance.
//!
//! # Confirmation strictness
//!
//! Some marketplaces reject bids funded by unconfirmed outputs. Confirmed funds
//! are required only when *every* offer comes from such a marketplace: a single
//! offer from a tolerant marketplace relaxes the check for the whole batch.
//!
//! Padding outputs (600 sats) are reserved for building the marketplace PSBTs
//! themselves and never count towards affordability.

use bdk::FeeRate;
use bitcoin::{Address, OutPoint};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;

use crate::config::Config;
use crate::error::{SatForgeError, SatForgeResult};
use crate::fee_estimation::{DraftOutput, FeeRatePolicy};
use crate::logging::{self, LogLevel};
use crate::math;
use crate::providers::{ChainSource, Deadline, FeeRateSource};
use crate::transaction_builder::{BuildRequest, BuiltPsbt, FeeConvergingBuilder};
use crate::types::{Account, AddressKind, SpendSource, OFFER_TX_VBYTES, PADDING_UTXO_VALUE};
use crate::utxo_management::{Inventory, InventoryPolicy};
use crate::utxo_selection::{CoinSelector, SelectionPolicy};

/// Marketplaces offers can come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Unisat,
    Okx,
    MagicEden,
    OrdinalsWallet,
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Marketplace::Unisat => "unisat",
            Marketplace::Okx => "okx",
            Marketplace::MagicEden => "magiceden",
            Marketplace::OrdinalsWallet => "ordinalswallet",
        };
        f.write_str(name)
    }
}

/// One offer being bid on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceOffer {
    pub marketplace: Marketplace,
    /// Price in satoshis
    pub price: u64,
}

impl MarketplaceOffer {
    pub fn new(marketplace: Marketplace, price: u64) -> Self {
        Self { marketplace, price }
    }
}

/// Parameters of the affordability rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffordabilityPolicy {
    pub confirmed_enforcing: HashSet<Marketplace>,
    /// Fee allowance per offer, in vbytes
    pub offer_vbytes: u64,
    /// Value of reserved padding outputs
    pub padding_value: u64,
}

impl Default for AffordabilityPolicy {
    fn default() -> Self {
        Self {
            confirmed_enforcing: [Marketplace::Unisat].into_iter().collect(),
            offer_vbytes: OFFER_TX_VBYTES,
            padding_value: PADDING_UTXO_VALUE,
        }
    }
}

impl AffordabilityPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confirmed_enforcing: config.confirmed_enforcing(),
            offer_vbytes: config.marketplace.offer_vbytes,
            padding_value: config.marketplace.padding_value,
        }
    }

    /// Whether the offers require confirmed funding
    ///
    /// True only if every offer's marketplace enforces confirmations; vacuously
    /// true for no offers.
    pub fn insist_confirmed(&self, offers: &[MarketplaceOffer]) -> bool {
        offers
            .iter()
            .all(|offer| self.confirmed_enforcing.contains(&offer.marketplace))
    }

    /// `Σ(price + round(offer_vbytes × rate))`
    pub fn estimate_bid_cost(&self, offers: &[MarketplaceOffer], fee_rate: FeeRate) -> SatForgeResult<u64> {
        let allowance = math::rounded_fee(self.offer_vbytes, fee_rate).ok_or_else(|| {
            SatForgeError::validation(format!("unusable fee rate {}", fee_rate.as_sat_per_vb()))
        })?;

        offers.iter().try_fold(0u64, |total, offer| {
            total
                .checked_add(offer.price)
                .and_then(|total| total.checked_add(allowance))
                .ok_or_else(|| SatForgeError::validation("bid cost overflows"))
        })
    }
}

/// Affordability checks and marketplace preparation against one chain source
pub struct MarketplacePolicy<'a> {
    chain: &'a dyn ChainSource,
    policy: AffordabilityPolicy,
    selection: SelectionPolicy,
    fee_rates: FeeRatePolicy<'a>,
}

impl<'a> MarketplacePolicy<'a> {
    pub fn new(chain: &'a dyn ChainSource, policy: AffordabilityPolicy) -> Self {
        Self {
            chain,
            policy,
            selection: SelectionPolicy::default(),
            fee_rates: FeeRatePolicy::default(),
        }
    }

    pub fn from_config(chain: &'a dyn ChainSource, config: &Config) -> Self {
        Self {
            chain,
            policy: AffordabilityPolicy::from_config(config),
            selection: SelectionPolicy::new(config.selection.overshoot),
            fee_rates: FeeRatePolicy::from_config(config),
        }
    }

    /// Ask `source` for a rate whenever a check is given none
    pub fn with_fee_source(mut self, source: &'a dyn FeeRateSource) -> Self {
        self.fee_rates = self.fee_rates.with_source(source);
        self
    }

    pub fn policy(&self) -> &AffordabilityPolicy {
        &self.policy
    }

    fn affords(
        &self,
        address: &Address,
        cost: u64,
        insist_confirmed: bool,
        deadline: &Deadline,
    ) -> SatForgeResult<bool> {
        let inventory = Inventory::new(self.chain).with_deadline(*deadline);
        let candidates = inventory.list_spendable(address, &InventoryPolicy::default().confirmed(false))?;

        let padding: HashSet<OutPoint> = candidates
            .iter()
            .filter(|utxo| utxo.value == self.policy.padding_value)
            .map(|utxo| utxo.outpoint())
            .collect();

        let selection = CoinSelector::new(self.selection).select(&candidates, cost, &padding, insist_confirmed);
        Ok(!selection.is_empty())
    }

    /// Whether `address` can fund bids on all of `offers`
    pub fn can_afford(
        &self,
        address: &Address,
        offers: &[MarketplaceOffer],
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<bool> {
        let fee_rate = self.fee_rates.resolve(fee_rate)?;
        let cost = self.policy.estimate_bid_cost(offers, fee_rate)?;
        let insist_confirmed = self.policy.insist_confirmed(offers);
        let affordable = self.affords(address, cost, insist_confirmed, deadline)?;

        logging::log_marketplace(
            LogLevel::Debug,
            "affordability check",
            Some(json!({
                "address": address.to_string(),
                "offers": offers.len(),
                "cost": cost,
                "insist_confirmed": insist_confirmed,
                "affordable": affordable,
            })),
        );
        Ok(affordable)
    }

    /// Pick the account address that pays for `offers`
    ///
    /// Tries the taproot address, then native segwit.
    ///
    /// # Errors
    /// * `InsufficientFunds` carrying the estimated cost when neither can afford it
    pub fn select_spend_address(
        &self,
        account: &Account,
        offers: &[MarketplaceOffer],
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<SpendSource> {
        let fee_rate = self.fee_rates.resolve(fee_rate)?;
        let cost = self.policy.estimate_bid_cost(offers, fee_rate)?;
        let insist_confirmed = self.policy.insist_confirmed(offers);

        for kind in [AddressKind::Taproot, AddressKind::NativeSegwit] {
            if account.address(kind).is_none() {
                continue;
            }
            let source = account.spend_source(kind)?;
            if self.affords(&source.address, cost, insist_confirmed, deadline)? {
                logging::log_marketplace(
                    LogLevel::Info,
                    "selected spend address",
                    Some(json!({ "kind": kind, "cost": cost })),
                );
                return Ok(source);
            }
        }

        Err(SatForgeError::insufficient_funds(cost, 0))
    }

    /// Count the padding outputs `address` already holds
    pub fn padding_outputs(&self, address: &Address, deadline: &Deadline) -> SatForgeResult<usize> {
        let inventory = Inventory::new(self.chain).with_deadline(*deadline);
        let candidates = inventory.list_spendable(address, &InventoryPolicy::default().confirmed(false))?;
        Ok(candidates
            .iter()
            .filter(|utxo| utxo.value == self.policy.padding_value)
            .count())
    }

    /// Build a transaction creating `count` padding outputs back to `source`
    ///
    /// Returns `None` when the address already holds that many.
    pub fn prepare_padding_outputs(
        &self,
        builder: &FeeConvergingBuilder<'_>,
        source: &SpendSource,
        count: usize,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<Option<BuiltPsbt>> {
        if self.padding_outputs(&source.address, deadline)? >= count {
            return Ok(None);
        }
        let fee_rate = self.fee_rates.resolve(fee_rate)?;

        let outputs: Vec<DraftOutput> = (0..count)
            .map(|_| DraftOutput::to_address(&source.address, self.policy.padding_value))
            .collect();
        let spend_amount = self.policy.padding_value.saturating_mul(count as u64);

        let built = builder.build(
            BuildRequest::new(source.clone(), outputs, spend_amount, fee_rate),
            deadline,
        )?;

        logging::log_marketplace(
            LogLevel::Info,
            "built padding outputs",
            Some(json!({ "count": count, "fee": built.fee })),
        );
        Ok(Some(built))
    }
}
