//! Common data types for SatForge
//!
//! These types describe the values that flow through selection, fee estimation
//! and PSBT construction. They are plain data: serializable, cheap to clone and
//! free of private key material.
//!
//! # Security Boundaries
//!
//! These types are designed to be safely passed across security boundaries:
//! - Between the chain source and the selection engine
//! - Between the builder and the external signer
//!
//! IMPORTANT: These types MUST NOT contain private keys, seeds, or other sensitive material.

use bitcoin::{Address, Network, OutPoint, PublicKey, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SatForgeError, SatForgeResult};
use crate::validation;

// Constants for Bitcoin-specific values

/// Constant for dust threshold (minimum output value)
pub const DUST_THRESHOLD: u64 = 546;

/// Minimum fee in satoshis for any transaction built here
pub const FEE_FLOOR: u64 = 250;

/// Value of the padding ("dummy") outputs marketplace PSBTs expect
pub const PADDING_UTXO_VALUE: u64 = 600;

/// Per-offer vbyte allowance used when costing marketplace bids
pub const OFFER_TX_VBYTES: u64 = 482;

/// Constant for satoshis per Bitcoin
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Constant for maximum Bitcoin supply in satoshis
pub const MAX_BITCOIN_SUPPLY: u64 = 21_000_000 * SATS_PER_BTC;

/// Address/script kinds an account can expose
///
/// The kind drives both fee sizing (each kind carries its own base and witness
/// weight) and how a PSBT input is populated for the signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// Pay to Public Key Hash
    Legacy,
    /// P2WPKH wrapped in P2SH
    NestedSegwit,
    /// Pay to Witness Public Key Hash
    NativeSegwit,
    /// Pay to Taproot, key path
    Taproot,
}

impl AddressKind {
    /// All kinds, in declaration order
    pub const ALL: [AddressKind; 4] = [
        AddressKind::Legacy,
        AddressKind::NestedSegwit,
        AddressKind::NativeSegwit,
        AddressKind::Taproot,
    ];

    /// Classify an output script
    ///
    /// Bare P2SH is assumed to wrap P2WPKH; that is the only P2SH form an
    /// account exposes.
    pub fn from_script(script: &bitcoin::Script) -> Option<Self> {
        if script.is_p2pkh() {
            Some(AddressKind::Legacy)
        } else if script.is_p2sh() {
            Some(AddressKind::NestedSegwit)
        } else if script.is_v0_p2wpkh() {
            Some(AddressKind::NativeSegwit)
        } else if script.is_v1_p2tr() {
            Some(AddressKind::Taproot)
        } else {
            None
        }
    }

    /// Whether spending this kind places data in the witness
    pub fn is_segwit(&self) -> bool {
        !matches!(self, AddressKind::Legacy)
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressKind::Legacy => "Legacy (P2PKH)",
            AddressKind::NestedSegwit => "Nested SegWit (P2SH-P2WPKH)",
            AddressKind::NativeSegwit => "Native SegWit (P2WPKH)",
            AddressKind::Taproot => "Taproot (P2TR)",
        };
        f.write_str(name)
    }
}

/// How a logical account spends across its addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendStrategy {
    /// Address kinds to consult, in order
    #[serde(default = "default_address_order")]
    pub address_order: Vec<AddressKind>,

    /// Consume the largest UTXOs first (true) or the smallest first (false)
    #[serde(default = "default_true")]
    pub utxo_sort_greatest_to_least: bool,

    /// Which address kind receives change
    #[serde(default = "default_change_kind")]
    pub change_kind: AddressKind,
}

impl Default for SpendStrategy {
    fn default() -> Self {
        Self {
            address_order: default_address_order(),
            utxo_sort_greatest_to_least: default_true(),
            change_kind: default_change_kind(),
        }
    }
}

impl SpendStrategy {
    /// Check the order is total over the kinds an account exposes
    ///
    /// Every exposed kind must appear exactly once, no kind may repeat, and the
    /// change kind must be one the account exposes.
    pub fn validate_for(&self, exposed: &[AddressKind]) -> SatForgeResult<()> {
        let mut seen = Vec::with_capacity(self.address_order.len());
        for kind in &self.address_order {
            if seen.contains(kind) {
                return Err(SatForgeError::validation(format!(
                    "address order lists {} more than once",
                    kind
                )));
            }
            seen.push(*kind);
        }

        if let Some(missing) = exposed.iter().find(|kind| !self.address_order.contains(kind)) {
            return Err(SatForgeError::validation(format!(
                "address order does not cover {}",
                missing
            )));
        }

        if !exposed.contains(&self.change_kind) {
            return Err(SatForgeError::validation(format!(
                "change kind {} is not exposed by the account",
                self.change_kind
            )));
        }

        Ok(())
    }
}

fn default_address_order() -> Vec<AddressKind> {
    vec![
        AddressKind::Legacy,
        AddressKind::Taproot,
        AddressKind::NativeSegwit,
        AddressKind::NestedSegwit,
    ]
}

fn default_change_kind() -> AddressKind {
    AddressKind::NativeSegwit
}

fn default_true() -> bool {
    true
}

/// Identifier of a rune or alkane: the block and transaction index of its creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId {
    pub block: u128,
    pub tx: u128,
}

impl AssetId {
    pub fn new(block: u128, tx: u128) -> Self {
        Self { block, tx }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.tx)
    }
}

impl FromStr for AssetId {
    type Err = SatForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (block, tx) = s
            .split_once(':')
            .ok_or_else(|| SatForgeError::validation(format!("asset id '{}' is not block:tx", s)))?;
        let block = block
            .trim()
            .parse::<u128>()
            .map_err(|e| SatForgeError::validation(format!("invalid asset block '{}': {}", block, e)))?;
        let tx = tx
            .trim()
            .parse::<u128>()
            .map_err(|e| SatForgeError::validation(format!("invalid asset tx '{}': {}", tx, e)))?;
        Ok(Self { block, tx })
    }
}

/// Meta-protocol data an indexer reports on an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attachment {
    /// An inscription (collectible) sitting on the output
    Inscription { id: String },
    /// A rune balance
    Rune { id: AssetId, amount: u128 },
    /// An alkane balance
    Alkane { id: AssetId, amount: u128 },
}

impl Attachment {
    /// Amount of `asset` carried by this attachment, if it is that asset
    pub fn amount_of(&self, asset: &AttachmentKey) -> Option<u128> {
        match (self, asset) {
            (Attachment::Rune { id, amount }, AttachmentKey::Rune(want)) if id == want => Some(*amount),
            (Attachment::Alkane { id, amount }, AttachmentKey::Alkane(want)) if id == want => {
                Some(*amount)
            }
            _ => None,
        }
    }
}

/// A fungible asset an attachment-targeted selection looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKey {
    Rune(AssetId),
    Alkane(AssetId),
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentKey::Rune(id) => write!(f, "rune {}", id),
            AttachmentKey::Alkane(id) => write!(f, "alkane {}", id),
        }
    }
}

/// A spendable output as reported by the chain source
///
/// Immutable once observed. The selection engine never mutates these, it only
/// orders, filters and copies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub address: String,
    /// 0 for mempool outputs
    pub confirmations: u32,
    pub attachments: Vec<Attachment>,
}

impl UnspentOutput {
    /// Create an output with no attachments
    pub fn new(
        txid: Txid,
        vout: u32,
        value: u64,
        script_pubkey: ScriptBuf,
        address: impl Into<String>,
        confirmations: u32,
    ) -> Self {
        Self {
            txid,
            vout,
            value,
            script_pubkey,
            address: address.into(),
            confirmations,
            attachments: Vec::new(),
        }
    }

    /// Add an attachment to this output
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Script kind of the owning output, if it is one an account can spend
    pub fn kind(&self) -> Option<AddressKind> {
        AddressKind::from_script(&self.script_pubkey)
    }

    /// Total amount of `asset` carried by this output
    pub fn attachment_amount(&self, asset: &AttachmentKey) -> u128 {
        self.attachments
            .iter()
            .filter_map(|attachment| attachment.amount_of(asset))
            .sum()
    }
}

/// Wire form of an unspent output, as a chain source serves it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnspentRecord {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// Hex-encoded output script
    pub script_pubkey: String,
    pub address: String,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TryFrom<UnspentRecord> for UnspentOutput {
    type Error = SatForgeError;

    fn try_from(record: UnspentRecord) -> Result<Self, Self::Error> {
        let txid = Txid::from_str(&record.txid).map_err(|e| {
            SatForgeError::validation(format!("invalid txid '{}': {}", record.txid, e))
        })?;
        let script = hex::decode(&record.script_pubkey).map_err(|e| {
            SatForgeError::validation(format!("invalid script hex for {}:{}: {}", record.txid, record.vout, e))
        })?;

        Ok(Self {
            txid,
            vout: record.vout,
            value: record.value,
            script_pubkey: ScriptBuf::from(script),
            address: record.address,
            confirmations: record.confirmations,
            attachments: record.attachments,
        })
    }
}

impl From<&UnspentOutput> for UnspentRecord {
    fn from(utxo: &UnspentOutput) -> Self {
        Self {
            txid: utxo.txid.to_string(),
            vout: utxo.vout,
            value: utxo.value,
            script_pubkey: hex::encode(utxo.script_pubkey.as_bytes()),
            address: utxo.address.clone(),
            confirmations: utxo.confirmations,
            attachments: utxo.attachments.clone(),
        }
    }
}

impl Serialize for UnspentOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        UnspentRecord::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for UnspentOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let record = UnspentRecord::deserialize(deserializer)?;
        UnspentOutput::try_from(record).map_err(serde::de::Error::custom)
    }
}

/// One address of an account together with the key that controls it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAddress {
    pub address: Address,
    pub pubkey: PublicKey,
}

/// Everything a build needs to draw funds from one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendSource {
    pub address: Address,
    pub pubkey: PublicKey,
    pub kind: AddressKind,
}

/// A logical account: up to one address per kind plus its spend strategy
#[derive(Debug, Clone)]
pub struct Account {
    pub network: Network,
    pub spend_strategy: SpendStrategy,
    legacy: Option<AccountAddress>,
    nested_segwit: Option<AccountAddress>,
    native_segwit: Option<AccountAddress>,
    taproot: Option<AccountAddress>,
}

impl Account {
    /// Create an account with no addresses
    pub fn new(network: Network, spend_strategy: SpendStrategy) -> Self {
        Self {
            network,
            spend_strategy,
            legacy: None,
            nested_segwit: None,
            native_segwit: None,
            taproot: None,
        }
    }

    /// Attach an address of the given kind
    ///
    /// # Errors
    /// Fails when the address belongs to another network or is not of `kind`.
    pub fn with_address(mut self, kind: AddressKind, address: Address, pubkey: PublicKey) -> SatForgeResult<Self> {
        if address.network != self.network {
            return Err(SatForgeError::validation(format!(
                "address belongs to {}, account is on {}",
                address.network, self.network
            )));
        }
        let actual = validation::address_kind(&address)?;
        if actual != kind {
            return Err(SatForgeError::validation(format!(
                "address is {} but was registered as {}",
                actual, kind
            )));
        }

        let slot = Some(AccountAddress { address, pubkey });
        match kind {
            AddressKind::Legacy => self.legacy = slot,
            AddressKind::NestedSegwit => self.nested_segwit = slot,
            AddressKind::NativeSegwit => self.native_segwit = slot,
            AddressKind::Taproot => self.taproot = slot,
        }
        Ok(self)
    }

    pub fn address(&self, kind: AddressKind) -> Option<&AccountAddress> {
        match kind {
            AddressKind::Legacy => self.legacy.as_ref(),
            AddressKind::NestedSegwit => self.nested_segwit.as_ref(),
            AddressKind::NativeSegwit => self.native_segwit.as_ref(),
            AddressKind::Taproot => self.taproot.as_ref(),
        }
    }

    /// Kinds this account has an address for
    pub fn exposed_kinds(&self) -> Vec<AddressKind> {
        AddressKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.address(*kind).is_some())
            .collect()
    }

    /// Check the spend strategy is total over the exposed kinds
    pub fn validate(&self) -> SatForgeResult<()> {
        self.spend_strategy.validate_for(&self.exposed_kinds())
    }

    /// Addresses in spend-strategy order, skipping kinds the account lacks
    pub fn ordered_addresses(&self) -> Vec<(AddressKind, &AccountAddress)> {
        self.spend_strategy
            .address_order
            .iter()
            .filter_map(|kind| self.address(*kind).map(|entry| (*kind, entry)))
            .collect()
    }

    /// Spend sources in spend-strategy order
    pub fn spend_sources(&self) -> Vec<SpendSource> {
        self.ordered_addresses()
            .into_iter()
            .map(|(kind, entry)| SpendSource {
                address: entry.address.clone(),
                pubkey: entry.pubkey,
                kind,
            })
            .collect()
    }

    /// `first`, then the rest of the account in spend-strategy order
    pub fn spend_sources_from(&self, first: &SpendSource) -> Vec<SpendSource> {
        let mut sources = vec![first.clone()];
        sources.extend(
            self.spend_sources()
                .into_iter()
                .filter(|source| source.address != first.address),
        );
        sources
    }

    pub fn spend_source(&self, kind: AddressKind) -> SatForgeResult<SpendSource> {
        let entry = self
            .address(kind)
            .ok_or_else(|| SatForgeError::validation(format!("account has no {} address", kind)))?;
        Ok(SpendSource {
            address: entry.address.clone(),
            pubkey: entry.pubkey,
            kind,
        })
    }

    pub fn change_address(&self) -> SatForgeResult<&Address> {
        self.address(self.spend_strategy.change_kind)
            .map(|entry| &entry.address)
            .ok_or_else(|| {
                SatForgeError::validation(format!(
                    "account has no {} address for change",
                    self.spend_strategy.change_kind
                ))
            })
    }
}
