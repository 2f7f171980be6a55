//! Shared fixtures for the integration tests
//!
//! Keys are derived from fixed secrets so addresses are stable across runs.
//! Everything lives on regtest.

#![allow(dead_code)]

use bitcoin::secp256k1::{Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::{Address, Network, PublicKey, Txid};
use satforge_core::logging::{self, LogConfig, LogLevel};
use satforge_core::types::{Account, AddressKind, SpendSource, SpendStrategy, UnspentOutput};
use std::str::FromStr;
use std::sync::Once;

pub const NETWORK: Network = Network::Regtest;

static INIT_LOGGER: Once = Once::new();

pub fn setup() {
    INIT_LOGGER.call_once(|| {
        // Configure minimal logging for tests
        let config = LogConfig {
            level: LogLevel::Error,
            log_file: None,
            include_timestamps: false,
            include_source_location: false,
            console_logging: false,
            json_format: false,
        };

        let _ = logging::init(&config);
    });
}

pub fn pubkey(seed: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("valid secret key");
    PublicKey::new(secret.public_key(&secp))
}

pub fn xonly(seed: u8) -> XOnlyPublicKey {
    XOnlyPublicKey::from(pubkey(seed).inner)
}

pub fn p2wpkh(seed: u8) -> Address {
    Address::p2wpkh(&pubkey(seed), NETWORK).expect("compressed key")
}

pub fn p2shwpkh(seed: u8) -> Address {
    Address::p2shwpkh(&pubkey(seed), NETWORK).expect("compressed key")
}

pub fn p2pkh(seed: u8) -> Address {
    Address::p2pkh(&pubkey(seed), NETWORK)
}

pub fn p2tr(seed: u8) -> Address {
    let secp = Secp256k1::verification_only();
    Address::p2tr(&secp, xonly(seed), None, NETWORK)
}

pub fn address_of(kind: AddressKind, seed: u8) -> Address {
    match kind {
        AddressKind::Legacy => p2pkh(seed),
        AddressKind::NestedSegwit => p2shwpkh(seed),
        AddressKind::NativeSegwit => p2wpkh(seed),
        AddressKind::Taproot => p2tr(seed),
    }
}

pub fn spend_source(kind: AddressKind, seed: u8) -> SpendSource {
    SpendSource {
        address: address_of(kind, seed),
        pubkey: pubkey(seed),
        kind,
    }
}

/// An account exposing all four kinds; key seeds 1 (legacy) to 4 (taproot)
pub fn account() -> Account {
    account_with(SpendStrategy::default())
}

pub fn account_with(strategy: SpendStrategy) -> Account {
    Account::new(NETWORK, strategy)
        .with_address(AddressKind::Legacy, p2pkh(1), pubkey(1))
        .and_then(|account| account.with_address(AddressKind::NestedSegwit, p2shwpkh(2), pubkey(2)))
        .and_then(|account| account.with_address(AddressKind::NativeSegwit, p2wpkh(3), pubkey(3)))
        .and_then(|account| account.with_address(AddressKind::Taproot, p2tr(4), pubkey(4)))
        .expect("valid account")
}

pub fn txid(n: u8) -> Txid {
    Txid::from_str(&format!("{:02x}", n).repeat(32)).expect("valid txid")
}

/// A confirmed output of `value` sats on `address`
pub fn utxo(address: &Address, n: u8, vout: u32, value: u64) -> UnspentOutput {
    utxo_with_confirmations(address, n, vout, value, 6)
}

pub fn utxo_with_confirmations(
    address: &Address,
    n: u8,
    vout: u32,
    value: u64,
    confirmations: u32,
) -> UnspentOutput {
    UnspentOutput::new(
        txid(n),
        vout,
        value,
        address.script_pubkey(),
        address.to_string(),
        confirmations,
    )
}
