//! Wallet operations on top of the fee-converging builder
//!
//! # Security Model
//!
//! Each operation produces an *unsigned* PSBT. Signing and broadcast stay with
//! the caller, who passes the result through a [`crate::providers::Signer`] and
//! [`crate::providers::broadcast_checked`].
//!
//! ## Security Considerations
//!
//! - Destination addresses are checked against the account's network
//! - Outputs carrying inscriptions or assets are never picked as fee funding
//! - Change always returns to the account's configured change address
//!
//! # Funding
//!
//! Fees and amounts are drawn from the whole account: its addresses are walked
//! in spend-strategy order and a single build may mix input kinds. When no fee
//! rate is passed, the configured default or the fee-rate source decides.
//!
//! # Operations
//!
//! - [`WalletOperations::send_btc`]: plain transfer
//! - [`WalletOperations::send_collectible`]: move an inscription-carrying output
//! - [`WalletOperations::execute_alkane`]: contract call via protostone
//! - [`WalletOperations::send_alkane`]: asset transfer via protostone edict

use bdk::FeeRate;
use bitcoin::{Address, PublicKey};
use serde_json::json;

use crate::config::Config;
use crate::error::{SatForgeError, SatForgeResult};
use crate::fee_estimation::{DraftOutput, FeeRatePolicy};
use crate::logging::{self, LogLevel};
use crate::math;
use crate::protostone::{self, Edict, Protostone, Runestone, ALKANES_PROTOCOL_TAG};
use crate::providers::{ChainSource, Deadline, FeeRateSource};
use crate::transaction_builder::{BuildRequest, BuiltPsbt, FeeConvergingBuilder, FundingInput};
use crate::types::{Account, AddressKind, AssetId, AttachmentKey, SpendSource, UnspentOutput, DUST_THRESHOLD};
use crate::utxo_management::Inventory;

/// Builds the wallet's everyday transactions
pub struct WalletOperations<'a> {
    chain: &'a dyn ChainSource,
    builder: FeeConvergingBuilder<'a>,
    fee_rates: FeeRatePolicy<'a>,
}

impl<'a> WalletOperations<'a> {
    pub fn new(chain: &'a dyn ChainSource) -> Self {
        Self {
            chain,
            builder: FeeConvergingBuilder::new(chain),
            fee_rates: FeeRatePolicy::default(),
        }
    }

    pub fn from_config(chain: &'a dyn ChainSource, config: &Config) -> Self {
        Self {
            chain,
            builder: FeeConvergingBuilder::from_config(chain, config),
            fee_rates: FeeRatePolicy::from_config(config),
        }
    }

    /// Ask `source` for a rate whenever an operation is given none
    pub fn with_fee_source(mut self, source: &'a dyn FeeRateSource) -> Self {
        self.fee_rates = self.fee_rates.with_source(source);
        self
    }

    pub fn builder(&self) -> &FeeConvergingBuilder<'a> {
        &self.builder
    }

    fn check_destination(account: &Account, to: &Address) -> SatForgeResult<()> {
        if to.network != account.network {
            return Err(SatForgeError::invalid_address(format!(
                "destination is on {}, account is on {}",
                to.network, account.network
            )));
        }
        Ok(())
    }

    fn build_for_account(
        &self,
        account: &Account,
        request: BuildRequest,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        let change = account.change_address()?.clone();
        self.builder.build(request.with_change_address(change), deadline)
    }

    /// Send `amount` sats to `to`
    pub fn send_btc(
        &self,
        account: &Account,
        to: &Address,
        amount: u64,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        Self::check_destination(account, to)?;
        if math::is_dust_amount(amount) {
            return Err(SatForgeError::invalid_draft(format!(
                "cannot send {} sats, minimum is {}",
                amount, DUST_THRESHOLD
            )));
        }

        let fee_rate = self.fee_rates.resolve(fee_rate)?;
        let outputs = vec![DraftOutput::to_address(to, amount)];
        let request = BuildRequest::from_sources(account.spend_sources(), outputs, amount, fee_rate)?;
        let built = self.build_for_account(account, request, deadline)?;

        logging::log_build(
            LogLevel::Info,
            "built BTC transfer",
            Some(json!({ "to": to.to_string(), "amount": amount, "fee": built.fee })),
        );
        Ok(built)
    }

    /// Move the output carrying a collectible to `to`, paying fees from `fee_source`
    ///
    /// The collectible is the first input and its full value goes to the first
    /// output, so the inscription lands on the recipient. When `fee_source`
    /// runs short, the rest of the account chips in.
    ///
    /// # Arguments
    /// * `collectible` - The output holding the inscription
    /// * `owner_pubkey` - Key controlling `collectible`; needed for nested segwit and taproot
    pub fn send_collectible(
        &self,
        account: &Account,
        collectible: &UnspentOutput,
        owner_pubkey: Option<PublicKey>,
        to: &Address,
        fee_source: &SpendSource,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        Self::check_destination(account, to)?;
        let fee_rate = self.fee_rates.resolve(fee_rate)?;
        let kind = collectible
            .kind()
            .ok_or_else(|| SatForgeError::invalid_draft("collectible sits on an unsupported script"))?;

        let inputs = vec![FundingInput::new(collectible.clone(), kind, owner_pubkey)];
        let outputs = vec![DraftOutput::to_address(to, collectible.value)];
        let request = BuildRequest::from_sources(account.spend_sources_from(fee_source), outputs, 0, fee_rate)?
            .with_inputs(inputs, 0);
        let built = self.build_for_account(account, request, deadline)?;

        logging::log_build(
            LogLevel::Info,
            "built collectible transfer",
            Some(json!({ "collectible": collectible.outpoint().to_string(), "fee": built.fee })),
        );
        Ok(built)
    }

    /// Call an alkanes contract with `calldata`
    ///
    /// Outputs: `receiver` (546 sats), the protostone runestone, then change.
    pub fn execute_alkane(
        &self,
        account: &Account,
        calldata: &[u128],
        receiver: &Address,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        Self::check_destination(account, receiver)?;
        let fee_rate = self.fee_rates.resolve(fee_rate)?;

        let outputs = vec![
            DraftOutput::to_address(receiver, DUST_THRESHOLD),
            DraftOutput::raw(protostone::alkanes_call_script(calldata)?, 0),
        ];
        let request = BuildRequest::from_sources(account.spend_sources(), outputs, DUST_THRESHOLD, fee_rate)?;
        let built = self.build_for_account(account, request, deadline)?;

        logging::log_protocol(
            LogLevel::Info,
            "built alkanes call",
            Some(json!({ "calldata_len": calldata.len(), "fee": built.fee })),
        );
        Ok(built)
    }

    /// Transfer `amount` units of alkane `id` from the account's taproot address to `to`
    ///
    /// Outputs: `to` (546 sats), the runestone, an asset change output back to
    /// the taproot address when the inputs carry more than `amount`, then BTC
    /// change. The protostone edict moves `amount` to output 0 and points the
    /// remainder at the asset change output.
    pub fn send_alkane(
        &self,
        account: &Account,
        id: AssetId,
        amount: u128,
        to: &Address,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<BuiltPsbt> {
        Self::check_destination(account, to)?;
        if amount == 0 {
            return Err(SatForgeError::invalid_draft("cannot send zero units"));
        }
        let fee_rate = self.fee_rates.resolve(fee_rate)?;

        let holder = account.spend_source(AddressKind::Taproot)?;
        let carriers = Inventory::new(self.chain)
            .with_deadline(*deadline)
            .attachment_utxos(&holder.address, AttachmentKey::Alkane(id), amount)?;

        let has_remainder = carriers.asset_total > amount;
        let pointer = if has_remainder { 2 } else { 0 };
        let stone = Protostone::transfer(
            ALKANES_PROTOCOL_TAG,
            vec![Edict { id, amount, output: 0 }],
            pointer,
        );

        let mut outputs = vec![
            DraftOutput::to_address(to, DUST_THRESHOLD),
            DraftOutput::raw(Runestone::with_protostones(&[stone]).encipher()?, 0),
        ];
        if has_remainder {
            outputs.push(DraftOutput::to_address(&holder.address, DUST_THRESHOLD));
        }
        let spend_amount: u64 = outputs.iter().map(|output| output.value).sum();

        let inputs: Vec<FundingInput> = carriers
            .utxos
            .into_iter()
            .map(|utxo| FundingInput::from_source(utxo, &holder))
            .collect();

        let request = BuildRequest::from_sources(account.spend_sources(), outputs, spend_amount, fee_rate)?
            .with_inputs(inputs, carriers.sats_total);
        let built = self.build_for_account(account, request, deadline)?;

        logging::log_protocol(
            LogLevel::Info,
            "built alkane transfer",
            Some(json!({
                "alkane": id.to_string(),
                "amount": amount.to_string(),
                "fee": built.fee,
            })),
        );
        Ok(built)
    }
}
