mod common;

use bitcoin::blockdata::opcodes::all::OP_RETURN;
use bitcoin::blockdata::script::Builder;
use bitcoin::{Network, OutPoint, ScriptBuf};
use satforge_core::error::SatForgeError;
use satforge_core::fee_estimation::DraftOutput;
use satforge_core::providers::{Broadcaster, MockChainSource};
use satforge_core::transaction_builder::{extract_hex, unsigned_transaction};
use satforge_core::types::{AddressKind, AssetId, Attachment, UnspentOutput};
use satforge_core::validation::{
    address_kind, parse_address, validate_fee_rate, validate_outputs, validate_transaction,
};

use common::{p2pkh, p2shwpkh, p2tr, p2wpkh, setup, txid, utxo, NETWORK};

#[test]
fn test_parse_address_checks_network() {
    setup();
    let address = p2wpkh(3);

    let parsed = parse_address(&address.to_string(), NETWORK).unwrap();
    assert_eq!(parsed, address);

    let result = parse_address(&address.to_string(), Network::Bitcoin);
    assert!(matches!(result, Err(SatForgeError::InvalidAddress(_))));

    let result = parse_address("not-an-address", NETWORK);
    assert!(matches!(result, Err(SatForgeError::InvalidAddress(_))));
}

#[test]
fn test_address_kinds() {
    setup();
    assert_eq!(address_kind(&p2pkh(1)).unwrap(), AddressKind::Legacy);
    assert_eq!(address_kind(&p2shwpkh(2)).unwrap(), AddressKind::NestedSegwit);
    assert_eq!(address_kind(&p2wpkh(3)).unwrap(), AddressKind::NativeSegwit);
    assert_eq!(address_kind(&p2tr(4)).unwrap(), AddressKind::Taproot);
}

#[test]
fn test_fee_rate_bounds() {
    setup();
    assert!(validate_fee_rate(1.0).is_ok());
    assert!(validate_fee_rate(0.5).is_ok());
    assert!(validate_fee_rate(0.0).is_err());
    assert!(validate_fee_rate(-3.0).is_err());
    assert!(validate_fee_rate(f32::INFINITY).is_err());
    assert!(validate_fee_rate(10_000.0).is_err());
}

#[test]
fn test_output_rules() {
    setup();
    let op_return = Builder::new().push_opcode(OP_RETURN).into_script();

    assert!(validate_outputs(&[
        DraftOutput::to_address(&p2wpkh(9), 546),
        DraftOutput::raw(op_return.clone(), 0),
    ])
    .is_ok());

    let result = validate_outputs(&[DraftOutput::to_address(&p2wpkh(9), 545)]);
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));

    let result = validate_outputs(&[DraftOutput::raw(op_return, 1)]);
    assert!(matches!(result, Err(SatForgeError::InvalidDraft(_))));
}

#[test]
fn test_transaction_structure() {
    setup();
    let outputs = vec![DraftOutput::to_address(&p2wpkh(9), 1_000)];
    let outpoint = OutPoint::new(txid(1), 0);

    assert!(validate_transaction(&unsigned_transaction([outpoint], &outputs)).is_ok());
    assert!(validate_transaction(&unsigned_transaction(Vec::<OutPoint>::new(), &outputs)).is_err());
    assert!(validate_transaction(&unsigned_transaction([outpoint], &[])).is_err());
    assert!(validate_transaction(&unsigned_transaction([outpoint, outpoint], &outputs)).is_err());
}

#[test]
fn test_local_decode_of_raw_transactions() {
    setup();
    let chain = MockChainSource::new();
    let outputs = vec![DraftOutput::to_address(&p2wpkh(9), 1_000)];
    let tx = unsigned_transaction([OutPoint::new(txid(1), 0)], &outputs);
    let psbt = bitcoin::psbt::PartiallySignedTransaction::from_unsigned_tx(tx.clone()).unwrap();
    let (_, raw_hex) = extract_hex(psbt);

    let decoded = chain.decode_raw_transaction(&raw_hex).unwrap();
    assert_eq!(decoded.txid, tx.txid());
    assert_eq!(decoded.weight, tx.weight().to_wu() as usize);
    assert_eq!(decoded.vsize, tx.vsize());

    assert!(chain.decode_raw_transaction("zz").is_err());
    assert!(chain.decode_raw_transaction("00").is_err());
}

#[test]
fn test_unspent_output_wire_format() {
    setup();
    let original = utxo(&p2tr(4), 5, 2, 546).with_attachment(Attachment::Alkane {
        id: AssetId::new(2, 1),
        amount: 400,
    });

    let json = serde_json::to_value(&original).unwrap();
    assert_eq!(json["txid"], serde_json::json!(txid(5).to_string()));
    assert_eq!(json["script_pubkey"], serde_json::json!(hex::encode(p2tr(4).script_pubkey().as_bytes())));

    let decoded: UnspentOutput = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, original);

    let bad = serde_json::json!({
        "txid": "xyz",
        "vout": 0,
        "value": 1000,
        "script_pubkey": "",
        "address": "",
    });
    assert!(serde_json::from_value::<UnspentOutput>(bad).is_err());

    // Missing confirmations and attachments default to none
    let minimal = serde_json::json!({
        "txid": txid(6).to_string(),
        "vout": 1,
        "value": 1000,
        "script_pubkey": hex::encode(ScriptBuf::new().as_bytes()),
        "address": "bcrt1q",
    });
    let decoded: UnspentOutput = serde_json::from_value(minimal).unwrap();
    assert!(!decoded.is_confirmed());
    assert!(!decoded.has_attachments());
}
