//! UTXO inventory
//!
//! Canonical, filtered views over what a [`ChainSource`] reports for an
//! address or a whole account. The inventory never mutates outputs; every view
//! is a fresh, owned list the caller can hand to the selector.
//!
//! Filtering rules for general-purpose spending:
//! - outputs of 546 sats or less are left alone (inscription postage)
//! - outputs carrying inscriptions, runes or alkanes are left alone unless asked for
//! - unconfirmed outputs are skipped when the policy insists on confirmations

use serde_json::json;
use std::collections::HashMap;

use crate::error::{SatForgeError, SatForgeResult};
use crate::logging::{self, LogLevel};
use crate::providers::{ChainSource, Deadline};
use crate::types::{Account, AttachmentKey, SpendSource, UnspentOutput, DUST_THRESHOLD};
use bitcoin::{Address, OutPoint};

/// Whether attachment-carrying outputs are part of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentFilter {
    Exclude,
    Include,
}

/// Filtering and ordering for a spendable view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryPolicy {
    pub insist_confirmed: bool,
    /// Largest first when true, smallest first otherwise
    pub greatest_to_least: bool,
    pub attachments: AttachmentFilter,
}

impl Default for InventoryPolicy {
    fn default() -> Self {
        Self {
            insist_confirmed: true,
            greatest_to_least: true,
            attachments: AttachmentFilter::Exclude,
        }
    }
}

impl InventoryPolicy {
    pub fn confirmed(mut self, insist_confirmed: bool) -> Self {
        self.insist_confirmed = insist_confirmed;
        self
    }

    pub fn sorted(mut self, greatest_to_least: bool) -> Self {
        self.greatest_to_least = greatest_to_least;
        self
    }

    pub fn with_attachments(mut self, attachments: AttachmentFilter) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Spendable outputs gathered across several addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpendableSet {
    pub utxos: Vec<UnspentOutput>,
    pub total: u64,
    /// Addresses walked, in order
    pub sources: Vec<SpendSource>,
    owners: HashMap<OutPoint, usize>,
}

impl SpendableSet {
    /// The address an output in this set was listed under
    pub fn source_of(&self, outpoint: &OutPoint) -> Option<&SpendSource> {
        self.owners.get(outpoint).and_then(|index| self.sources.get(*index))
    }
}

/// Outputs carrying a fungible asset, picked until the asset target is met
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentSelection {
    pub utxos: Vec<UnspentOutput>,
    /// Asset units carried by `utxos`
    pub asset_total: u128,
    /// Satoshis carried by `utxos`
    pub sats_total: u64,
}

/// Read-only views over a chain source
pub struct Inventory<'a> {
    chain: &'a dyn ChainSource,
    deadline: Deadline,
}

impl<'a> Inventory<'a> {
    pub fn new(chain: &'a dyn ChainSource) -> Self {
        Self {
            chain,
            deadline: Deadline::none(),
        }
    }

    /// Fail fetches with `Timeout` once `deadline` passes
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    fn fetch(&self, address: &Address) -> SatForgeResult<Vec<UnspentOutput>> {
        self.deadline.check("fetching unspent outputs")?;
        self.chain.list_unspent(address)
    }

    /// Spendable outputs of one address
    ///
    /// # Errors
    /// Chain source failures and an expired deadline propagate unchanged.
    pub fn list_spendable(&self, address: &Address, policy: &InventoryPolicy) -> SatForgeResult<Vec<UnspentOutput>> {
        let reported = self.fetch(address)?;
        let reported_count = reported.len();

        let mut spendable: Vec<UnspentOutput> = reported
            .into_iter()
            .filter(|utxo| utxo.value > DUST_THRESHOLD)
            .filter(|utxo| !policy.insist_confirmed || utxo.is_confirmed())
            .filter(|utxo| policy.attachments == AttachmentFilter::Include || !utxo.has_attachments())
            .collect();

        if policy.greatest_to_least {
            spendable.sort_by(|a, b| b.value.cmp(&a.value));
        } else {
            spendable.sort_by(|a, b| a.value.cmp(&b.value));
        }

        logging::log_selection(
            LogLevel::Trace,
            "listed spendable outputs",
            Some(json!({
                "address": address.to_string(),
                "reported": reported_count,
                "spendable": spendable.len(),
            })),
        );

        Ok(spendable)
    }

    /// Spendable outputs across an account, in its address order
    ///
    /// Each address contributes its own sorted view. With a `spend_amount`, the
    /// walk stops at the first address that brings the total to that amount.
    pub fn account_spendable(&self, account: &Account, spend_amount: Option<u64>) -> SatForgeResult<SpendableSet> {
        let policy = InventoryPolicy::default().sorted(account.spend_strategy.utxo_sort_greatest_to_least);
        self.sources_spendable(&account.spend_sources(), &policy, spend_amount)
    }

    /// Spendable outputs of `sources`, walked in order
    pub fn sources_spendable(
        &self,
        sources: &[SpendSource],
        policy: &InventoryPolicy,
        spend_amount: Option<u64>,
    ) -> SatForgeResult<SpendableSet> {
        let mut set = SpendableSet::default();

        for source in sources {
            let utxos = self.list_spendable(&source.address, policy)?;
            let index = set.sources.len();
            set.sources.push(source.clone());
            for utxo in utxos {
                set.total = set.total.saturating_add(utxo.value);
                set.owners.insert(utxo.outpoint(), index);
                set.utxos.push(utxo);
            }

            logging::log_selection(
                LogLevel::Trace,
                "walked spend address",
                Some(json!({ "kind": source.kind, "running_total": set.total })),
            );

            if matches!(spend_amount, Some(amount) if set.total >= amount) {
                break;
            }
        }

        Ok(set)
    }

    /// Outputs carrying `asset`, largest holdings first, until `target` units are covered
    ///
    /// Postage-sized outputs are kept: assets usually sit on them.
    ///
    /// # Errors
    /// * `InsufficientFunds` in asset units when the address holds too little
    pub fn attachment_utxos(
        &self,
        address: &Address,
        asset: AttachmentKey,
        target: u128,
    ) -> SatForgeResult<AttachmentSelection> {
        let mut carrying: Vec<UnspentOutput> = self
            .fetch(address)?
            .into_iter()
            .filter(|utxo| utxo.attachment_amount(&asset) > 0)
            .collect();
        carrying.sort_by(|a, b| b.attachment_amount(&asset).cmp(&a.attachment_amount(&asset)));

        let mut selection = AttachmentSelection::default();
        for utxo in carrying {
            if selection.asset_total >= target && !selection.utxos.is_empty() {
                break;
            }
            selection.asset_total = selection.asset_total.saturating_add(utxo.attachment_amount(&asset));
            selection.sats_total = selection.sats_total.saturating_add(utxo.value);
            selection.utxos.push(utxo);
        }

        if selection.asset_total < target || selection.utxos.is_empty() {
            return Err(SatForgeError::insufficient_funds(
                saturate(target),
                saturate(selection.asset_total),
            ));
        }

        logging::log_selection(
            LogLevel::Debug,
            "selected asset-carrying outputs",
            Some(json!({
                "asset": asset.to_string(),
                "target": target.to_string(),
                "asset_total": selection.asset_total.to_string(),
                "inputs": selection.utxos.len(),
            })),
        );

        Ok(selection)
    }
}

fn saturate(amount: u128) -> u64 {
    u64::try_from(amount).unwrap_or(u64::MAX)
}
