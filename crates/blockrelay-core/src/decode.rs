//! Log decoding and normalization.
//!
//! A [`LogDecoder`] turns a [`RawLog`] into a typed [`EventPayload`], checking
//! that the log really carries the topics and data words the event requires.
//! [`NormalizedEvent`] is the record forwarded to the sink.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::types::{topic_to_address, RawLog};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

const WORD: usize = 32;

/// Fields of a hive registry link/unlink event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetLink {
    pub by: String,
    pub token_address: String,
    pub token_id: u64,
    pub hive_id: u64,
    pub category: u64,
    pub timestamp: u64,
}

/// Decoded event fields, one variant per supported event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventPayload {
    /// ERC-20 (`value` set) or ERC-721 (`token_id` set) transfer.
    #[serde(rename_all = "camelCase")]
    Transfer {
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_id: Option<String>,
    },
    AssetLinked(AssetLink),
    AssetUnlinked(AssetLink),
}

/// The normalized record forwarded downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub event_type: String,
    pub contract_address: String,
    pub chain_id: u32,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u32,
    pub payload: EventPayload,
}

impl NormalizedEvent {
    /// Attach the log's provenance to a decoded payload.
    pub fn from_log(log: &RawLog, chain_id: u32, event_type: &str, payload: EventPayload) -> Self {
        Self {
            event_type: event_type.to_string(),
            contract_address: log.address.to_ascii_lowercase(),
            chain_id,
            block_number: log.block_number_u64(),
            transaction_hash: log.tx_hash.clone(),
            log_index: log.log_index_u32(),
            payload,
        }
    }
}

/// Decodes raw logs into typed payloads.
pub trait LogDecoder: Send + Sync {
    /// Decode `log` as the event named `event_name`.
    fn decode(&self, log: &RawLog, event_name: &str) -> Result<EventPayload, IngestError>;
}

/// Decoder for the events this service ships handlers for:
/// `Transfer`, `AssetLinked` and `AssetUnlinked`.
///
/// Layouts:
/// - `Transfer(address indexed from, address indexed to, uint256 value)` (ERC-20)
/// - `Transfer(address indexed from, address indexed to, uint256 indexed tokenId)` (ERC-721)
/// - `AssetLinked(address indexed by, address tokenAddress, uint256 tokenId,
///   uint256 hiveId, uint256 category, uint256 timestamp)` (same for `AssetUnlinked`)
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl LogDecoder for StandardDecoder {
    fn decode(&self, log: &RawLog, event_name: &str) -> Result<EventPayload, IngestError> {
        match event_name {
            "Transfer" => decode_transfer(log),
            "AssetLinked" => decode_asset_link(log, event_name).map(EventPayload::AssetLinked),
            "AssetUnlinked" => decode_asset_link(log, event_name).map(EventPayload::AssetUnlinked),
            other => Err(IngestError::decode(other, "unsupported event type")),
        }
    }
}

fn decode_transfer(log: &RawLog) -> Result<EventPayload, IngestError> {
    let from = topic_address(log, 1, "Transfer")?;
    let to = topic_address(log, 2, "Transfer")?;
    match log.topics.len() {
        3 => {
            let words = data_words(log, 1, "Transfer")?;
            Ok(EventPayload::Transfer {
                from,
                to,
                value: Some(word_to_u256(&words[0]).to_string()),
                token_id: None,
            })
        }
        4 => {
            let token_id = topic_u256(&log.topics[3], "Transfer")?;
            Ok(EventPayload::Transfer {
                from,
                to,
                value: None,
                token_id: Some(token_id.to_string()),
            })
        }
        n => Err(IngestError::decode(
            "Transfer",
            format!("expected 3 or 4 topics, got {n}"),
        )),
    }
}

fn decode_asset_link(log: &RawLog, event: &str) -> Result<AssetLink, IngestError> {
    if log.topics.len() != 2 {
        return Err(IngestError::decode(
            event,
            format!("expected 2 topics, got {}", log.topics.len()),
        ));
    }
    let by = topic_address(log, 1, event)?;
    let words = data_words(log, 5, event)?;
    Ok(AssetLink {
        by,
        token_address: word_to_address(&words[0]),
        token_id: word_to_u64(&words[1], event, "tokenId")?,
        hive_id: word_to_u64(&words[2], event, "hiveId")?,
        category: word_to_u64(&words[3], event, "category")?,
        timestamp: word_to_u64(&words[4], event, "timestamp")?,
    })
}

fn topic_address(log: &RawLog, index: usize, event: &str) -> Result<String, IngestError> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| IngestError::decode(event, format!("missing topic {index}")))?;
    topic_to_address(topic)
        .ok_or_else(|| IngestError::decode(event, format!("topic {index} is not a 32-byte word")))
}

fn topic_u256(topic: &str, event: &str) -> Result<U256, IngestError> {
    let bytes = hex::decode(topic.strip_prefix("0x").unwrap_or(topic))
        .map_err(|e| IngestError::decode(event, format!("bad topic hex: {e}")))?;
    if bytes.len() != WORD {
        return Err(IngestError::decode(event, "topic is not a 32-byte word"));
    }
    Ok(U256::from_be_slice(&bytes))
}

/// Split `log.data` into exactly `expected` 32-byte words.
fn data_words(log: &RawLog, expected: usize, event: &str) -> Result<Vec<[u8; WORD]>, IngestError> {
    let raw = log.data.strip_prefix("0x").unwrap_or(&log.data);
    let bytes =
        hex::decode(raw).map_err(|e| IngestError::decode(event, format!("bad data hex: {e}")))?;
    if bytes.len() != expected * WORD {
        return Err(IngestError::decode(
            event,
            format!("expected {} data bytes, got {}", expected * WORD, bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(WORD)
        .map(|chunk| {
            let mut word = [0u8; WORD];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

fn word_to_u256(word: &[u8; WORD]) -> U256 {
    U256::from_be_slice(word)
}

fn word_to_u64(word: &[u8; WORD], event: &str, field: &str) -> Result<u64, IngestError> {
    u64::try_from(word_to_u256(word))
        .map_err(|_| IngestError::decode(event, format!("field '{field}' overflows u64")))
}

fn word_to_address(word: &[u8; WORD]) -> String {
    format!("0x{}", hex::encode(&word[12..]))
}
