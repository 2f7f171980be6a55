//! Runestone and protostone encoding
//!
//! Protocol messages ride in a zero-value output:
//!
//! ```text
//! OP_RETURN OP_13 <LEB128 tag/value pairs, pushed in 520-byte chunks>
//! ```
//!
//! Protostones are nested inside the runestone's protocol field (tag 16383).
//! Each protostone becomes `[protocol_tag, payload_len, payload...]`; the
//! integers of all protostones are LEB128-encoded into one byte string, which is
//! cut into 15-byte little-endian chunks, one `u128` per protocol entry.
//!
//! Contract calldata is "enciphered" as the concatenated LEB128 encoding of its
//! integers and carried in the protostone message field (tag 81), again as
//! 15-byte chunks.

use bitcoin::blockdata::opcodes::all::{OP_PUSHNUM_13, OP_RETURN};
use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::error::{SatForgeError, SatForgeResult};
use crate::types::AssetId;

/// Protocol tag for alkanes
pub const ALKANES_PROTOCOL_TAG: u128 = 1;

/// Bytes per `u128` chunk; the top byte stays clear
const CHUNK_BYTES: usize = 15;

/// Largest single script push
const MAX_PUSH_BYTES: usize = 520;

/// Target block, target tx and opcode lead every contract call
const CALL_HEAD_LEN: usize = 3;

mod tag {
    pub const BODY: u128 = 0;
    pub const MINT: u128 = 20;
    pub const POINTER: u128 = 22;
    pub const PROTOCOL: u128 = 16383;

    pub const MESSAGE: u128 = 81;
    pub const BURN: u128 = 83;
    pub const POINTER_PROTO: u128 = 91;
    pub const REFUND: u128 = 93;
}

// LEB128
//-------

/// Append the unsigned LEB128 encoding of `n`
pub fn encode_varint(mut n: u128, out: &mut Vec<u8>) {
    while n >> 7 > 0 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Decode one unsigned LEB128 integer, returning it and the bytes consumed
pub fn decode_varint(bytes: &[u8]) -> SatForgeResult<(u128, usize)> {
    let mut n: u128 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i > 18 {
            return Err(SatForgeError::validation("varint overflows u128"));
        }
        let value = u128::from(byte & 0x7f);
        if i == 18 && value > 0b11 {
            return Err(SatForgeError::validation("varint overflows u128"));
        }
        n |= value << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
    }
    Err(SatForgeError::validation("truncated varint"))
}

fn encode_varints(values: &[u128]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for value in values {
        encode_varint(*value, &mut out);
    }
    out
}

fn decode_varints(mut bytes: &[u8]) -> SatForgeResult<Vec<u128>> {
    let mut values = Vec::new();
    while !bytes.is_empty() {
        let (value, used) = decode_varint(bytes)?;
        values.push(value);
        bytes = &bytes[used..];
    }
    Ok(values)
}

/// LEB128-encode contract calldata
pub fn encipher_calldata(calldata: &[u128]) -> Vec<u8> {
    encode_varints(calldata)
}

/// Decode calldata produced by [`encipher_calldata`]
pub fn decipher_calldata(bytes: &[u8]) -> SatForgeResult<Vec<u128>> {
    decode_varints(bytes)
}

/// Drop the zero padding of a message's final chunk
///
/// A chunk is only emitted for at least one byte, so padding never exceeds
/// `CHUNK_BYTES - 1` bytes and zeros in earlier chunks are always data.
fn trim_chunk_padding(mut bytes: Vec<u8>) -> Vec<u8> {
    let keep = bytes.len().saturating_sub(CHUNK_BYTES - 1);
    while bytes.len() > keep && bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

fn to_chunks(bytes: &[u8]) -> Vec<u128> {
    bytes
        .chunks(CHUNK_BYTES)
        .map(|chunk| {
            let mut buf = [0u8; 16];
            buf[..chunk.len()].copy_from_slice(chunk);
            u128::from_le_bytes(buf)
        })
        .collect()
}

fn from_chunks(values: &[u128]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|value| value.to_le_bytes()[..CHUNK_BYTES].to_vec())
        .collect()
}

// Edicts
//-------

/// Move `amount` of asset `id` to output `output`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edict {
    pub id: AssetId,
    pub amount: u128,
    pub output: u128,
}

/// Sort by id and delta-encode: block delta, tx (delta within a block), amount, output
fn encode_edicts(edicts: &[Edict], out: &mut Vec<u128>) {
    let mut sorted = edicts.to_vec();
    sorted.sort_by_key(|edict| edict.id);

    let mut previous = AssetId::new(0, 0);
    for edict in sorted {
        let block_delta = edict.id.block - previous.block;
        let tx_delta = if block_delta == 0 {
            edict.id.tx - previous.tx
        } else {
            edict.id.tx
        };
        out.extend([block_delta, tx_delta, edict.amount, edict.output]);
        previous = edict.id;
    }
}

fn decode_edicts(values: &[u128]) -> SatForgeResult<Vec<Edict>> {
    if values.len() % 4 != 0 {
        return Err(SatForgeError::validation("edict body is not a multiple of four integers"));
    }

    let mut edicts = Vec::with_capacity(values.len() / 4);
    let mut previous = AssetId::new(0, 0);
    for group in values.chunks(4) {
        let block = previous
            .block
            .checked_add(group[0])
            .ok_or_else(|| SatForgeError::validation("edict block overflows"))?;
        let tx = if group[0] == 0 {
            previous
                .tx
                .checked_add(group[1])
                .ok_or_else(|| SatForgeError::validation("edict tx overflows"))?
        } else {
            group[1]
        };
        let id = AssetId::new(block, tx);
        edicts.push(Edict {
            id,
            amount: group[2],
            output: group[3],
        });
        previous = id;
    }
    Ok(edicts)
}

// Protostones
//------------

/// A sub-protocol message nested in a runestone
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Protostone {
    pub protocol_tag: u128,
    pub burn: Option<u128>,
    /// Output receiving leftover assets
    pub pointer: Option<u32>,
    /// Output receiving assets if the message fails
    pub refund: Option<u32>,
    pub edicts: Vec<Edict>,
    /// Enciphered calldata
    pub message: Vec<u8>,
}

impl Protostone {
    /// A contract call carrying `calldata`
    pub fn message(protocol_tag: u128, calldata: &[u128], pointer: u32, refund: u32) -> Self {
        Self {
            protocol_tag,
            pointer: Some(pointer),
            refund: Some(refund),
            message: encipher_calldata(calldata),
            ..Default::default()
        }
    }

    /// An asset transfer
    pub fn transfer(protocol_tag: u128, edicts: Vec<Edict>, pointer: u32) -> Self {
        Self {
            protocol_tag,
            pointer: Some(pointer),
            refund: Some(pointer),
            edicts,
            ..Default::default()
        }
    }

    /// `[protocol_tag, payload_len, payload...]`
    pub fn to_integers(&self) -> Vec<u128> {
        let mut payload = Vec::new();

        if let Some(burn) = self.burn {
            payload.extend([tag::BURN, burn]);
        }
        if let Some(pointer) = self.pointer {
            payload.extend([tag::POINTER_PROTO, u128::from(pointer)]);
        }
        if let Some(refund) = self.refund {
            payload.extend([tag::REFUND, u128::from(refund)]);
        }
        for chunk in to_chunks(&self.message) {
            payload.extend([tag::MESSAGE, chunk]);
        }
        if !self.edicts.is_empty() {
            payload.push(tag::BODY);
            encode_edicts(&self.edicts, &mut payload);
        }

        let mut integers = Vec::with_capacity(payload.len() + 2);
        integers.push(self.protocol_tag);
        integers.push(payload.len() as u128);
        integers.extend(payload);
        integers
    }

    fn from_payload(protocol_tag: u128, payload: &[u128]) -> SatForgeResult<Self> {
        let mut stone = Protostone {
            protocol_tag,
            ..Default::default()
        };
        let mut message_chunks = Vec::new();

        let mut i = 0;
        while i < payload.len() {
            let field = payload[i];
            if field == tag::BODY {
                stone.edicts = decode_edicts(&payload[i + 1..])?;
                break;
            }
            let value = *payload
                .get(i + 1)
                .ok_or_else(|| SatForgeError::validation(format!("protostone field {} has no value", field)))?;
            match field {
                tag::BURN => stone.burn = Some(value),
                tag::POINTER_PROTO => stone.pointer = Some(output_index(value)?),
                tag::REFUND => stone.refund = Some(output_index(value)?),
                tag::MESSAGE => message_chunks.push(value),
                other => {
                    return Err(SatForgeError::validation(format!("unknown protostone field {}", other)))
                }
            }
            i += 2;
        }

        stone.message = trim_chunk_padding(from_chunks(&message_chunks));
        Ok(stone)
    }

    /// Calldata carried in the message field
    ///
    /// Zero-valued arguments at the very end of a message read from a script
    /// cannot be told apart from chunk padding. The call head (target and
    /// opcode) is restored in full, so an opcode-0 call keeps its opcode;
    /// zeros beyond it come back absent.
    pub fn calldata(&self) -> SatForgeResult<Vec<u128>> {
        let mut calldata = decipher_calldata(&self.message)?;
        if !self.message.is_empty() && calldata.len() < CALL_HEAD_LEN {
            calldata.resize(CALL_HEAD_LEN, 0);
        }
        Ok(calldata)
    }
}

fn output_index(value: u128) -> SatForgeResult<u32> {
    u32::try_from(value).map_err(|_| SatForgeError::validation(format!("output index {} out of range", value)))
}

/// Pack protostones into runestone protocol values
pub fn encode_protostones(stones: &[Protostone]) -> Vec<u128> {
    let integers: Vec<u128> = stones.iter().flat_map(Protostone::to_integers).collect();
    to_chunks(&encode_varints(&integers))
}

/// Unpack runestone protocol values into protostones
///
/// A zero protocol tag marks the end (chunk padding decodes as zeros).
pub fn decode_protostones(protocol: &[u128]) -> SatForgeResult<Vec<Protostone>> {
    let integers = decode_varints(&from_chunks(protocol))?;

    let mut stones = Vec::new();
    let mut i = 0;
    while i < integers.len() {
        let protocol_tag = integers[i];
        if protocol_tag == 0 {
            break;
        }
        let len = integers
            .get(i + 1)
            .and_then(|len| usize::try_from(*len).ok())
            .ok_or_else(|| SatForgeError::validation("protostone length missing"))?;
        let start = i + 2;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= integers.len())
            .ok_or_else(|| SatForgeError::validation("protostone payload truncated"))?;
        stones.push(Protostone::from_payload(protocol_tag, &integers[start..end])?);
        i = end;
    }
    Ok(stones)
}

// Runestones
//-----------

/// The runestone fields this crate writes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Runestone {
    pub edicts: Vec<Edict>,
    pub mint: Option<AssetId>,
    pub pointer: Option<u32>,
    pub protocol: Option<Vec<u128>>,
}

impl Runestone {
    /// A runestone carrying only `stones`
    pub fn with_protostones(stones: &[Protostone]) -> Self {
        Self {
            protocol: Some(encode_protostones(stones)),
            ..Default::default()
        }
    }

    fn integers(&self) -> Vec<u128> {
        let mut integers = Vec::new();

        if let Some(mint) = self.mint {
            integers.extend([tag::MINT, mint.block, tag::MINT, mint.tx]);
        }
        if let Some(pointer) = self.pointer {
            integers.extend([tag::POINTER, u128::from(pointer)]);
        }
        if let Some(protocol) = &self.protocol {
            for value in protocol {
                integers.extend([tag::PROTOCOL, *value]);
            }
        }
        if !self.edicts.is_empty() {
            integers.push(tag::BODY);
            encode_edicts(&self.edicts, &mut integers);
        }
        integers
    }

    /// `OP_RETURN OP_13 <payload>`
    pub fn encipher(&self) -> SatForgeResult<ScriptBuf> {
        let payload = encode_varints(&self.integers());

        let mut builder = Builder::new().push_opcode(OP_RETURN).push_opcode(OP_PUSHNUM_13);
        for chunk in payload.chunks(MAX_PUSH_BYTES) {
            let push = PushBytesBuf::try_from(chunk.to_vec())
                .map_err(|e| SatForgeError::invalid_draft(format!("runestone push: {}", e)))?;
            builder = builder.push_slice(push);
        }
        Ok(builder.into_script())
    }

    /// Parse a runestone script; `None` if the script is not one
    pub fn decipher(script: &Script) -> SatForgeResult<Option<Self>> {
        let mut instructions = script.instructions();

        match instructions.next() {
            Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
            _ => return Ok(None),
        }
        match instructions.next() {
            Some(Ok(Instruction::Op(op))) if op == OP_PUSHNUM_13 => {}
            _ => return Ok(None),
        }

        let mut payload = Vec::new();
        for instruction in instructions {
            match instruction {
                Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
                Ok(Instruction::Op(_)) => {
                    return Err(SatForgeError::validation("runestone payload contains an opcode"))
                }
                Err(e) => return Err(SatForgeError::validation(format!("malformed runestone: {}", e))),
            }
        }

        let integers = decode_varints(&payload)?;
        let mut runestone = Runestone::default();
        let mut mint = Vec::new();
        let mut protocol = Vec::new();

        let mut i = 0;
        while i < integers.len() {
            let field = integers[i];
            if field == tag::BODY {
                runestone.edicts = decode_edicts(&integers[i + 1..])?;
                break;
            }
            let value = *integers
                .get(i + 1)
                .ok_or_else(|| SatForgeError::validation(format!("runestone field {} has no value", field)))?;
            match field {
                tag::MINT => mint.push(value),
                tag::POINTER => runestone.pointer = Some(output_index(value)?),
                tag::PROTOCOL => protocol.push(value),
                // Fields this crate never writes are skipped
                _ => {}
            }
            i += 2;
        }

        if let [block, tx] = mint[..] {
            runestone.mint = Some(AssetId::new(block, tx));
        }
        if !protocol.is_empty() {
            runestone.protocol = Some(protocol);
        }
        Ok(Some(runestone))
    }

    /// Protostones carried in the protocol field
    pub fn protostones(&self) -> SatForgeResult<Vec<Protostone>> {
        match &self.protocol {
            Some(protocol) => decode_protostones(protocol),
            None => Ok(Vec::new()),
        }
    }
}

/// Output script for a single alkanes contract call
///
/// Pointer and refund both target output 0, the receiver.
pub fn alkanes_call_script(calldata: &[u128]) -> SatForgeResult<ScriptBuf> {
    let stone = Protostone::message(ALKANES_PROTOCOL_TAG, calldata, 0, 0);
    Runestone::with_protostones(&[stone]).encipher()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_known_encodings() {
        let mut out = Vec::new();
        encode_varint(0, &mut out);
        encode_varint(127, &mut out);
        encode_varint(128, &mut out);
        encode_varint(300, &mut out);
        assert_eq!(out, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
        assert_eq!(decode_varints(&out).unwrap(), vec![0, 127, 128, 300]);
    }

    #[test]
    fn test_varint_max_value() {
        let mut out = Vec::new();
        encode_varint(u128::MAX, &mut out);
        assert_eq!(out.len(), 19);
        assert_eq!(decode_varint(&out).unwrap(), (u128::MAX, 19));
    }

    #[test]
    fn test_varint_rejects_truncation() {
        assert!(decode_varint(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_chunks_keep_top_byte_clear() {
        let bytes: Vec<u8> = (1..=20).collect();
        let chunks = to_chunks(&bytes);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk >> 120 == 0));
        assert_eq!(&from_chunks(&chunks)[..20], &bytes[..]);
    }

    #[test]
    fn test_padding_trim_stays_in_final_chunk() {
        let mut bytes = vec![0u8; 15];
        bytes[0] = 5;
        bytes.extend([7, 0, 0]);
        let padded = from_chunks(&to_chunks(&bytes));
        assert_eq!(padded.len(), 30);

        // The zeros inside the first chunk are data
        assert_eq!(trim_chunk_padding(padded), bytes[..16].to_vec());
        assert_eq!(trim_chunk_padding(vec![0u8; 15]), vec![0u8]);
    }

    #[test]
    fn test_edict_delta_encoding() {
        let edicts = vec![
            Edict { id: AssetId::new(2, 5), amount: 10, output: 1 },
            Edict { id: AssetId::new(2, 1), amount: 7, output: 0 },
            Edict { id: AssetId::new(4, 3), amount: 1, output: 2 },
        ];
        let mut out = Vec::new();
        encode_edicts(&edicts, &mut out);
        assert_eq!(out, vec![2, 1, 7, 0, 0, 4, 10, 1, 2, 3, 1, 2]);

        let decoded = decode_edicts(&out).unwrap();
        assert_eq!(decoded[0].id, AssetId::new(2, 1));
        assert_eq!(decoded[1].id, AssetId::new(2, 5));
        assert_eq!(decoded[2].id, AssetId::new(4, 3));
    }
}
