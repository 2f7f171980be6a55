//! Taproot envelope for commit/reveal payloads
//!
//! The commit output's key commits to a single tapscript leaf:
//!
//! ```text
//! <internal key> OP_CHECKSIG
//! OP_FALSE OP_IF
//!   <protocol id> OP_0 <body chunk> <body chunk> ...
//! OP_ENDIF
//! ```
//!
//! The `OP_FALSE OP_IF` branch never executes; it only makes the payload part of
//! the witness when the leaf is revealed. Body chunks are at most 520 bytes, the
//! consensus limit for a single push.

use bitcoin::blockdata::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF, OP_PUSHBYTES_0};
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Network, ScriptBuf};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{SatForgeError, SatForgeResult};
use crate::math::SCHNORR_SIGNATURE_SIZE;

/// Protocol id alkanes contract deployments are tagged with
pub const ALKANES_PROTOCOL_ID: &[u8] = b"BIN";

const MAX_CHUNK: usize = 520;

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// An opaque payload and the protocol id it is filed under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub protocol_id: Vec<u8>,
    pub body: Vec<u8>,
}

impl CommitPayload {
    pub fn new(protocol_id: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            body: body.into(),
        }
    }

    /// A contract binary for deployment
    pub fn alkanes_contract(wasm: impl Into<Vec<u8>>) -> Self {
        Self::new(ALKANES_PROTOCOL_ID, wasm)
    }
}

fn push(bytes: &[u8]) -> SatForgeResult<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| SatForgeError::invalid_draft(format!("envelope push too large: {}", e)))
}

/// Build the leaf script for `payload`, checked against `internal_key`
pub fn envelope_script(internal_key: &XOnlyPublicKey, payload: &CommitPayload) -> SatForgeResult<ScriptBuf> {
    if payload.protocol_id.len() > MAX_CHUNK {
        return Err(SatForgeError::invalid_draft("protocol id exceeds a single push"));
    }

    let mut builder = Builder::new()
        .push_x_only_key(internal_key)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_PUSHBYTES_0)
        .push_opcode(OP_IF)
        .push_slice(push(&payload.protocol_id)?)
        .push_opcode(OP_PUSHBYTES_0);

    for chunk in payload.body.chunks(MAX_CHUNK) {
        builder = builder.push_slice(push(chunk)?);
    }

    Ok(builder.push_opcode(OP_ENDIF).into_script())
}

/// Everything needed to fund and later spend an envelope
#[derive(Debug, Clone)]
pub struct EnvelopeSpend {
    pub internal_key: XOnlyPublicKey,
    pub script: ScriptBuf,
    pub spend_info: TaprootSpendInfo,
    pub control_block: ControlBlock,
    /// Address the commit transaction pays to
    pub address: Address,
}

impl EnvelopeSpend {
    /// Commit `payload` to a single-leaf tree under `internal_key`
    pub fn new(internal_key: XOnlyPublicKey, payload: &CommitPayload, network: Network) -> SatForgeResult<Self> {
        let script = envelope_script(&internal_key, payload)?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, script.clone())
            .map_err(|e| SatForgeError::invalid_draft(format!("taproot leaf: {}", e)))?
            .finalize(&SECP, internal_key)
            .map_err(|_| SatForgeError::invalid_draft("taproot tree could not be finalized"))?;

        let control_block = spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| SatForgeError::invalid_draft("envelope leaf missing from its own tree"))?;

        let address = Address::p2tr_tweaked(spend_info.output_key(), network);

        Ok(Self {
            internal_key,
            script,
            spend_info,
            control_block,
            address,
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Witness stack shape of the reveal input, with a placeholder signature
    ///
    /// Used to price the reveal before it is signed.
    pub fn witness_template(&self) -> Vec<Vec<u8>> {
        vec![
            vec![0u8; SCHNORR_SIGNATURE_SIZE],
            self.script.to_bytes(),
            self.control_block.serialize(),
        ]
    }
}
