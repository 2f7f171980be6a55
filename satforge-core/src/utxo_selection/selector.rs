//! Greedy coin selector
//!
//! One pass over the caller's ordering. The selector never reorders: sorting is
//! the inventory's job, so the same snapshot always yields the same picks.
//!
//! # Usage
//!
//! ```
//! use satforge_core::utxo_selection::{CoinSelector, SelectionPolicy};
//! use std::collections::HashSet;
//!
//! let selector = CoinSelector::new(SelectionPolicy::default());
//! let selection = selector.select(&[], 0, &HashSet::new(), true);
//! assert!(selection.is_empty());
//! assert_eq!(selection.total, 0);
//! ```

use bitcoin::OutPoint;
use serde_json::json;
use std::collections::HashSet;

use crate::logging::{self, LogLevel};
use crate::types::UnspentOutput;
use crate::utxo_selection::types::{Selection, SelectionPolicy};

/// Picks outputs in order until their sum covers a target
#[derive(Debug, Clone, Copy, Default)]
pub struct CoinSelector {
    policy: SelectionPolicy,
}

impl CoinSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Select outputs covering `target`
    ///
    /// # Arguments
    /// * `utxos` - Candidates, already in consumption order
    /// * `target` - Amount to cover, in satoshis
    /// * `excluded` - Outpoints the caller already holds
    /// * `insist_confirmed` - Skip outputs with no confirmations
    ///
    /// # Returns
    /// * The picked outputs and their sum, or an empty selection when every
    ///   eligible output together still falls short
    pub fn select(
        &self,
        utxos: &[UnspentOutput],
        target: u64,
        excluded: &HashSet<OutPoint>,
        insist_confirmed: bool,
    ) -> Selection {
        let mut selection = Selection::empty();

        for utxo in utxos.iter().skip(self.policy.skip_leading) {
            if excluded.contains(&utxo.outpoint()) {
                continue;
            }
            if insist_confirmed && !utxo.is_confirmed() {
                continue;
            }

            selection.total = selection.total.saturating_add(utxo.value);
            selection.utxos.push(utxo.clone());

            if self.policy.overshoot.is_satisfied(selection.total, target) {
                logging::log_selection(
                    LogLevel::Debug,
                    "selection covered target",
                    Some(json!({
                        "target": target,
                        "total": selection.total,
                        "inputs": selection.len(),
                    })),
                );
                return selection;
            }
        }

        logging::log_selection(
            LogLevel::Debug,
            "selection fell short",
            Some(json!({
                "target": target,
                "eligible_total": selection.total,
                "candidates": utxos.len(),
            })),
        );
        Selection::empty()
    }
}
