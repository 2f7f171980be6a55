//! Core types for coin selection

use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use crate::types::UnspentOutput;

/// When the running sum counts as enough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overshoot {
    /// Stop once the sum is strictly greater than the target
    #[default]
    Strict,
    /// Stop once the sum meets or exceeds the target
    Inclusive,
}

impl Overshoot {
    /// Whether `sum` satisfies `target` under this rule
    pub fn is_satisfied(&self, sum: u64, target: u64) -> bool {
        match self {
            Overshoot::Strict => sum > target,
            Overshoot::Inclusive => sum >= target,
        }
    }
}

/// Knobs for a single selection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectionPolicy {
    #[serde(default)]
    pub overshoot: Overshoot,

    /// Ignore this many outputs at the head of the list
    ///
    /// For callers that exclude what they already hold by position rather than
    /// by outpoint.
    #[serde(default)]
    pub skip_leading: usize,
}

impl SelectionPolicy {
    pub fn new(overshoot: Overshoot) -> Self {
        Self {
            overshoot,
            skip_leading: 0,
        }
    }

    pub fn skipping(mut self, skip_leading: usize) -> Self {
        self.skip_leading = skip_leading;
        self
    }
}

/// Outputs picked by one selection pass, in pick order
///
/// Either covers the target or is empty; there is no partial result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub utxos: Vec<UnspentOutput>,
    /// Sum of `utxos` in satoshis
    pub total: u64,
}

impl Selection {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(UnspentOutput::outpoint).collect()
    }
}
