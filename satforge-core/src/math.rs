//! Size and fee arithmetic
//!
//! Structural transaction sizing: every input and output kind has a fixed base
//! (non-witness) size and witness size, so a fee can be quoted before anything
//! is signed. Weight follows BIP141 (`3 × base + total`), virtual size is the
//! weight divided by four and rounded up.
//!
//! Fee products are computed with `rust_decimal` so fractional sat/vB rates
//! round the same way on every platform.

use bdk::FeeRate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{AddressKind, DUST_THRESHOLD};

/// Version (4) + locktime (4)
pub const TX_FIXED_OVERHEAD: usize = 8;

/// Segwit marker and flag bytes, counted as witness data
pub const SEGWIT_MARKER_SIZE: usize = 2;

/// Outpoint (36) + sequence (4)
const TXIN_FIXED: usize = 40;

/// Size of a BIP340 signature as it appears in a taproot witness
pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

/// Base and witness bytes contributed by one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub base: usize,
    pub witness: usize,
}

/// Determines if an amount is considered dust
pub fn is_dust_amount(amount_sats: u64) -> bool {
    amount_sats < DUST_THRESHOLD
}

/// Length of a Bitcoin CompactSize encoding of `n`
pub fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Typical input size for a key-spend of the given kind
///
/// | kind    | base                       | witness                    |
/// |---------|----------------------------|----------------------------|
/// | legacy  | 40 + 1 + 107 scriptSig     | none                       |
/// | nested  | 40 + 1 + 23 redeem push    | count + sig 73 + key 34    |
/// | native  | 40 + 1 empty scriptSig     | count + sig 73 + key 34    |
/// | taproot | 40 + 1 empty scriptSig     | count + schnorr sig 65     |
pub fn get_input_size(kind: AddressKind) -> InputSize {
    match kind {
        AddressKind::Legacy => InputSize { base: TXIN_FIXED + 1 + 107, witness: 0 },
        AddressKind::NestedSegwit => InputSize { base: TXIN_FIXED + 1 + 23, witness: 1 + 73 + 34 },
        AddressKind::NativeSegwit => InputSize { base: TXIN_FIXED + 1, witness: 1 + 73 + 34 },
        AddressKind::Taproot => InputSize { base: TXIN_FIXED + 1, witness: 1 + 1 + SCHNORR_SIGNATURE_SIZE },
    }
}

/// Input size when the exact witness stack is known
///
/// The witness replaces the kind's default estimate byte for byte.
pub fn get_input_size_with_witness(kind: AddressKind, witness: &[Vec<u8>]) -> InputSize {
    InputSize {
        base: get_input_size(kind).base,
        witness: witness_size(witness),
    }
}

/// Serialized size of a witness stack: item count plus length-prefixed items
pub fn witness_size(witness: &[Vec<u8>]) -> usize {
    varint_len(witness.len())
        + witness
            .iter()
            .map(|item| varint_len(item.len()) + item.len())
            .sum::<usize>()
}

/// Serialized size of an output with the given script length
///
/// value (8) + script length prefix + script. P2PKH = 34, P2SH = 32,
/// P2WPKH = 31, P2TR = 43.
pub fn get_output_size(script_len: usize) -> usize {
    8 + varint_len(script_len) + script_len
}

/// Calculates the transaction weight according to BIP141
///
/// # Arguments
/// * `base_size` - The size of non-witness data in bytes
/// * `witness_size` - The size of witness data in bytes
pub fn calculate_tx_weight(base_size: usize, witness_size: usize) -> usize {
    3 * base_size + (base_size + witness_size)
}

/// Converts transaction weight to virtual size (vsize), rounding up
pub fn weight_to_vsize(weight: usize) -> usize {
    (weight + 3) / 4
}

/// Fee for `vsize` vbytes at `fee_rate`, rounded up to whole satoshis
///
/// Returns `None` if the rate cannot be represented (NaN or infinite).
pub fn fee_for_vsize(vsize: usize, fee_rate: FeeRate) -> Option<u64> {
    let rate = Decimal::from_f32(fee_rate.as_sat_per_vb())?;
    let fee = (Decimal::from(vsize as u64) * rate).ceil();
    fee.to_u64()
}

/// `round(vbytes × rate)`, halves rounding away from zero
pub fn rounded_fee(vbytes: u64, fee_rate: FeeRate) -> Option<u64> {
    let rate = Decimal::from_f32(fee_rate.as_sat_per_vb())?;
    (Decimal::from(vbytes) * rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
}
