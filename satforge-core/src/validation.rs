//! Input validation at the boundaries of the builder
//!
//! Addresses, fee rates and draft outputs come from callers and from external
//! indexers. Everything is checked here before it reaches selection or PSBT
//! assembly.
//!
//! ## Security Considerations
//!
//! - All address validation must verify the correct network type
//! - OP_RETURN outputs must never carry value
//! - Fee rates are bounded to catch unit mistakes (sat/kvB passed as sat/vB)

use bitcoin::address::{AddressType, NetworkUnchecked};
use bitcoin::{Address, Network, Transaction};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{SatForgeError, SatForgeResult};
use crate::fee_estimation::DraftOutput;
use crate::math;
use crate::types::{AddressKind, DUST_THRESHOLD};

/// Highest fee rate accepted without complaint, in sat/vB
pub const MAX_REASONABLE_FEE_RATE: f32 = 5_000.0;

// Bitcoin address validation functions
//-------------------------------------

/// Parse an address string and require it to belong to `network`
pub fn parse_address(address: &str, network: Network) -> SatForgeResult<Address> {
    let unchecked = Address::<NetworkUnchecked>::from_str(address)
        .map_err(|e| SatForgeError::invalid_address(format!("failed to parse '{}': {}", address, e)))?;

    if !unchecked.is_valid_for_network(network) {
        return Err(SatForgeError::invalid_address(format!(
            "address {} is for network {}, expected {}",
            address, unchecked.network, network
        )));
    }

    Ok(unchecked.assume_checked())
}

/// Determine the spend kind of an address
///
/// P2WSH and unknown witness programs are rejected: nothing in this crate can
/// size or populate inputs for them.
pub fn address_kind(address: &Address) -> SatForgeResult<AddressKind> {
    match address.address_type() {
        Some(AddressType::P2pkh) => Ok(AddressKind::Legacy),
        Some(AddressType::P2sh) => Ok(AddressKind::NestedSegwit),
        Some(AddressType::P2wpkh) => Ok(AddressKind::NativeSegwit),
        Some(AddressType::P2tr) => Ok(AddressKind::Taproot),
        other => Err(SatForgeError::invalid_address(format!(
            "unsupported address type {:?} for {}",
            other, address
        ))),
    }
}

// Amount and fee validation functions
//------------------------------------

/// Validate a fee rate in sat/vB
pub fn validate_fee_rate(rate: f32) -> SatForgeResult<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SatForgeError::validation(format!(
            "fee rate must be a positive number, got {}",
            rate
        )));
    }
    if rate > MAX_REASONABLE_FEE_RATE {
        return Err(SatForgeError::validation(format!(
            "fee rate {} sat/vB exceeds the {} sat/vB ceiling",
            rate, MAX_REASONABLE_FEE_RATE
        )));
    }
    Ok(())
}

/// Validate the outputs of a draft before it is sized or assembled
///
/// OP_RETURN outputs must be zero-valued; every other output must clear the
/// dust threshold.
pub fn validate_outputs(outputs: &[DraftOutput]) -> SatForgeResult<()> {
    for (i, output) in outputs.iter().enumerate() {
        if output.script_pubkey.is_op_return() {
            if output.value > 0 {
                return Err(SatForgeError::invalid_draft(format!(
                    "OP_RETURN output {} carries {} sats",
                    i, output.value
                )));
            }
        } else if math::is_dust_amount(output.value) {
            return Err(SatForgeError::invalid_draft(format!(
                "output {} is dust: {} sats (minimum is {} sats)",
                i, output.value, DUST_THRESHOLD
            )));
        }
    }
    Ok(())
}

// Transaction validation functions
//--------------------------------

/// Structural checks on an assembled, unsigned transaction
pub fn validate_transaction(tx: &Transaction) -> SatForgeResult<()> {
    if tx.input.is_empty() {
        return Err(SatForgeError::invalid_draft("transaction has no inputs"));
    }
    if tx.output.is_empty() {
        return Err(SatForgeError::invalid_draft("transaction has no outputs"));
    }

    let mut seen = HashSet::with_capacity(tx.input.len());
    for input in &tx.input {
        if !seen.insert(input.previous_output) {
            return Err(SatForgeError::invalid_draft(format!(
                "duplicate input {}",
                input.previous_output
            )));
        }
    }

    Ok(())
}
