//! Two-phase commit/reveal transactions
//!
//! A commit transaction funds a taproot output whose key commits to an
//! envelope script carrying the payload. The reveal transaction spends that
//! output through the script path, exposing the payload in its witness, and
//! carries the protocol calldata in a runestone output.
//!
//! ```text
//! Committed --reveal--> Revealed
//! ```
//!
//! There is no rollback: once the commit is broadcast its output is spendable
//! only by the reveal (or by the internal key, outside this crate).
//! [`CommitRevealBuilder::reveal`] consumes the [`Committed`] it spends and
//! hands it back inside [`Revealed`].
//!
//! # Security Considerations
//!
//! - Reveal parameters are checked against the commit before anything is signed
//! - The commit output is re-read from the chain source; a missing or altered
//!   output fails with `StaleCommit` instead of producing an unspendable reveal
//! - Both phases go through test-accept before broadcast

use bdk::FeeRate;
use bitcoin::psbt::PartiallySignedTransaction;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::taproot::LeafVersion;
use bitcoin::{Address, OutPoint, ScriptBuf, TxOut, Txid};
use serde_json::json;
use std::thread;

use crate::config::{CommitRevealConfig, Config};
use crate::envelope::{CommitPayload, EnvelopeSpend};
use crate::error::{SatForgeError, SatForgeResult};
use crate::fee_estimation::{DraftInput, DraftOutput, DraftTransaction, FeeEstimator, FeeRatePolicy};
use crate::logging::{self, LogLevel};
use crate::protostone;
use crate::providers::{self, Broadcaster, ChainSource, Deadline, FeeRateSource, Signer};
use crate::transaction_builder::{self, BuildRequest, FeeConvergingBuilder};
use crate::types::{AddressKind, SpendSource, DUST_THRESHOLD};

/// Calldata opcode for deploying a contract from a reserved slot
pub const DEPLOY_OPCODE: u128 = 3;

/// Trailing calldata argument of a deployment
pub const DEPLOY_TRAILER: u128 = 100;

/// Index of the envelope output in the commit transaction
const COMMIT_VOUT: u32 = 0;

/// Calldata for deploying into `reserve_number`
pub fn deploy_calldata(reserve_number: u128) -> Vec<u128> {
    vec![DEPLOY_OPCODE, reserve_number, DEPLOY_TRAILER]
}

/// What to commit and who pays for it
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub payload: CommitPayload,
    /// Key the envelope is checked against and the tree is built on
    pub internal_key: XOnlyPublicKey,
    /// Funds the commit
    pub spend: SpendSource,
    /// Calldata the reveal is expected to carry, used to price it up front
    pub expected_calldata: Vec<u128>,
    /// Falls back to the builder's fee-rate policy when unset
    pub fee_rate: Option<FeeRate>,
}

/// A broadcast commit transaction
#[derive(Debug, Clone)]
pub struct Committed {
    pub txid: Txid,
    pub vout: u32,
    /// Value of the envelope output: reveal fee plus the dust anchor
    pub value: u64,
    pub envelope: EnvelopeSpend,
    /// Fee the commit transaction paid
    pub fee: u64,
}

impl Committed {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// Parameters for revealing this commit with `calldata`
    pub fn reveal_parameters(&self, calldata: Vec<u128>) -> RevealParameters {
        RevealParameters {
            commit_txid: self.txid,
            vout: self.vout,
            script: self.envelope.script.clone(),
            calldata,
        }
    }
}

/// What a reveal spends and carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealParameters {
    pub commit_txid: Txid,
    pub vout: u32,
    pub script: ScriptBuf,
    pub calldata: Vec<u128>,
}

/// A broadcast reveal transaction, together with the commit it spent
#[derive(Debug, Clone)]
pub struct Revealed {
    pub txid: Txid,
    pub committed: Committed,
    pub fee: u64,
    pub vsize: usize,
}

impl Revealed {
    pub fn commit_outpoint(&self) -> OutPoint {
        self.committed.outpoint()
    }
}

/// Builds, signs and broadcasts both phases
pub struct CommitRevealBuilder<'a> {
    chain: &'a dyn ChainSource,
    broadcaster: &'a dyn Broadcaster,
    signer: &'a dyn Signer,
    builder: FeeConvergingBuilder<'a>,
    estimator: FeeEstimator,
    polling: CommitRevealConfig,
    fee_rates: FeeRatePolicy<'a>,
}

impl<'a> CommitRevealBuilder<'a> {
    pub fn new(chain: &'a dyn ChainSource, broadcaster: &'a dyn Broadcaster, signer: &'a dyn Signer) -> Self {
        Self {
            chain,
            broadcaster,
            signer,
            builder: FeeConvergingBuilder::new(chain),
            estimator: FeeEstimator::default(),
            polling: CommitRevealConfig::default(),
            fee_rates: FeeRatePolicy::default(),
        }
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.builder = FeeConvergingBuilder::from_config(self.chain, config);
        self.estimator = FeeEstimator::with_floor(config.fees.fee_floor);
        self.polling = config.commit_reveal.clone();
        self.fee_rates = self.fee_rates.with_config(config);
        self
    }

    /// Ask `source` for a rate whenever a phase is given none
    pub fn with_fee_source(mut self, source: &'a dyn FeeRateSource) -> Self {
        self.fee_rates = self.fee_rates.with_source(source);
        self
    }

    /// Fee of a reveal spending `envelope` to a taproot receiver with `calldata`
    ///
    /// Sized with the exact reveal witness, so the payload bytes are priced in.
    pub fn estimate_reveal_fee(
        &self,
        envelope: &EnvelopeSpend,
        calldata: &[u128],
        fee_rate: FeeRate,
    ) -> SatForgeResult<u64> {
        let input = DraftInput::new(OutPoint::null(), 0, AddressKind::Taproot)
            .with_witness(envelope.witness_template());
        let draft = DraftTransaction::new(
            vec![input],
            vec![
                // Receiver not known yet; a taproot output is the largest standard one
                DraftOutput::raw(envelope.script_pubkey(), DUST_THRESHOLD),
                DraftOutput::raw(protostone::alkanes_call_script(calldata)?, 0),
            ],
        );
        Ok(self.estimator.estimate(&draft, fee_rate)?.fee)
    }

    /// Build, sign, test-accept and broadcast the commit transaction
    ///
    /// # Errors
    /// * `InsufficientFunds` if the spend address cannot fund the envelope
    /// * `BroadcastRejected` if the node refuses it; nothing is broadcast
    pub fn commit(&self, request: CommitRequest, deadline: &Deadline) -> SatForgeResult<Committed> {
        let fee_rate = self.fee_rates.resolve(request.fee_rate)?;
        let envelope = EnvelopeSpend::new(request.internal_key, &request.payload, request.spend.address.network)?;
        let reveal_fee = self.estimate_reveal_fee(&envelope, &request.expected_calldata, fee_rate)?;
        // reveal fee + payload + anchor: the payload bytes are already in
        // reveal_fee, which is sized with the full reveal witness
        let value = reveal_fee + DUST_THRESHOLD;

        let outputs = vec![DraftOutput::raw(envelope.script_pubkey(), value)];
        let built = self
            .builder
            .build(BuildRequest::new(request.spend, outputs, value, fee_rate), deadline)?;

        let signed = self.signer.sign_all_inputs(built.psbt, true)?;
        let (tx, _) = transaction_builder::extract_hex(signed);
        deadline.check("broadcasting commit")?;
        let txid = providers::broadcast_checked(self.broadcaster, &tx)?;

        logging::log_protocol(
            LogLevel::Info,
            "commit broadcast",
            Some(json!({
                "txid": txid.to_string(),
                "value": value,
                "reveal_fee": reveal_fee,
                "payload_bytes": request.payload.body.len(),
            })),
        );

        Ok(Committed {
            txid,
            vout: COMMIT_VOUT,
            value,
            envelope,
            fee: built.fee,
        })
    }

    /// Wait until the chain source reports the commit transaction
    ///
    /// # Errors
    /// * `Timeout` if `deadline` passes first
    /// * `StaleCommit` if every poll attempt misses it
    pub fn wait_for_commit(&self, committed: &Committed, deadline: &Deadline) -> SatForgeResult<()> {
        for attempt in 0..self.polling.poll_attempts {
            if attempt > 0 {
                let pause = match deadline.remaining() {
                    Some(left) => left.min(self.polling.poll_interval()),
                    None => self.polling.poll_interval(),
                };
                thread::sleep(pause);
            }
            deadline.check("waiting for commit transaction")?;

            if self.chain.transaction(&committed.txid)?.is_some() {
                logging::log_protocol(
                    LogLevel::Debug,
                    "commit observed",
                    Some(json!({ "txid": committed.txid.to_string(), "attempt": attempt + 1 })),
                );
                return Ok(());
            }
        }

        Err(SatForgeError::StaleCommit {
            txid: committed.txid,
            vout: committed.vout,
        })
    }

    /// Re-read the commit output and check it is the one being revealed
    fn observed_commit_output(&self, committed: &Committed, deadline: &Deadline) -> SatForgeResult<TxOut> {
        deadline.check("fetching commit transaction")?;
        let stale = || SatForgeError::StaleCommit {
            txid: committed.txid,
            vout: committed.vout,
        };

        let tx = self.chain.transaction(&committed.txid)?.ok_or_else(stale)?;
        let output = tx.output.get(committed.vout as usize).cloned().ok_or_else(stale)?;

        if output.value != committed.value || output.script_pubkey != committed.envelope.script_pubkey() {
            return Err(stale());
        }
        Ok(output)
    }

    /// Build, sign, test-accept and broadcast the reveal transaction
    ///
    /// Outputs: `receiver` (546 sats), the protostone runestone, then change
    /// back to `receiver` when more than 546 sats are left over.
    ///
    /// # Errors
    /// * `InvalidDraft` when `params` does not match `committed`
    /// * `StaleCommit` when the commit output cannot be observed as committed
    /// * `BroadcastRejected` if the node refuses the reveal
    pub fn reveal(
        &self,
        committed: Committed,
        params: &RevealParameters,
        receiver: &Address,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<Revealed> {
        let fee_rate = self.fee_rates.resolve(fee_rate)?;
        if params.script != committed.envelope.script {
            return Err(SatForgeError::invalid_draft("reveal script does not match the committed envelope"));
        }
        if params.commit_txid != committed.txid || params.vout != committed.vout {
            return Err(SatForgeError::invalid_draft(format!(
                "reveal references {}:{}, commit is {}",
                params.commit_txid,
                params.vout,
                committed.outpoint()
            )));
        }

        let commit_output = self.observed_commit_output(&committed, deadline)?;
        let outpoint = committed.outpoint();

        let input = DraftInput::new(outpoint, commit_output.value, AddressKind::Taproot)
            .with_witness(committed.envelope.witness_template());
        let outputs = vec![
            DraftOutput::to_address(receiver, DUST_THRESHOLD),
            DraftOutput::raw(protostone::alkanes_call_script(&params.calldata)?, 0),
        ];
        let plan = transaction_builder::plan_fixed_inputs(
            &self.estimator,
            &[input],
            outputs,
            receiver.script_pubkey(),
            fee_rate,
        )?;

        let tx = transaction_builder::unsigned_transaction([outpoint], &plan.outputs);
        let mut psbt = PartiallySignedTransaction::from_unsigned_tx(tx)?;
        {
            let envelope = &committed.envelope;
            let slot = &mut psbt.inputs[0];
            slot.witness_utxo = Some(commit_output.clone());
            slot.tap_internal_key = Some(envelope.internal_key);
            slot.tap_merkle_root = envelope.spend_info.merkle_root();
            slot.tap_scripts.insert(
                envelope.control_block.clone(),
                (envelope.script.clone(), LeafVersion::TapScript),
            );
        }

        let signed = self.signer.sign_reveal_input(psbt, 0)?;
        let (tx, _) = transaction_builder::extract_hex(signed);
        if tx.input.len() != 1 || tx.input[0].previous_output != outpoint {
            return Err(SatForgeError::invalid_draft("signer altered the reveal inputs"));
        }

        deadline.check("broadcasting reveal")?;
        let txid = providers::broadcast_checked(self.broadcaster, &tx)?;
        let fee = commit_output
            .value
            .saturating_sub(plan.outputs.iter().map(|output| output.value).sum());

        logging::log_protocol(
            LogLevel::Info,
            "reveal broadcast",
            Some(json!({
                "txid": txid.to_string(),
                "commit": outpoint.to_string(),
                "fee": fee,
                "vsize": plan.quote.vsize,
            })),
        );

        Ok(Revealed {
            txid,
            committed,
            fee,
            vsize: plan.quote.vsize,
        })
    }

    /// Commit a contract binary, wait for it, then reveal a deployment call
    ///
    /// The reveal carries calldata `[3, reserve_number, 100]`. Both phases use
    /// the same fee rate.
    #[allow(clippy::too_many_arguments)]
    pub fn deploy_contract(
        &self,
        contract: CommitPayload,
        internal_key: XOnlyPublicKey,
        spend: SpendSource,
        receiver: &Address,
        reserve_number: u128,
        fee_rate: Option<FeeRate>,
        deadline: &Deadline,
    ) -> SatForgeResult<Revealed> {
        let fee_rate = Some(self.fee_rates.resolve(fee_rate)?);
        let calldata = deploy_calldata(reserve_number);
        let committed = self.commit(
            CommitRequest {
                payload: contract,
                internal_key,
                spend,
                expected_calldata: calldata.clone(),
                fee_rate,
            },
            deadline,
        )?;

        self.wait_for_commit(&committed, deadline)?;

        let params = committed.reveal_parameters(calldata);
        self.reveal(committed, &params, receiver, fee_rate, deadline)
    }
}
