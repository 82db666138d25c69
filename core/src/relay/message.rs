// Message, reaction, delivery-status, link and packet normalization

use super::{rmpv_to_json, value_text, RelayError};
use crate::event::{
    field_ids, now_millis, AttachmentEntry, DeliveryMethod, DeliveryStatusEvent, FieldMap,
    FieldValue, LinkEvent, MessageEvent, PacketEvent, ReactionEvent,
};
use crate::runtime::RawEvent;
use rmpv::Value;

/// A raw message is either a chat message or a reaction carried in field 16
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Message(MessageEvent),
    Reaction(ReactionEvent),
}

pub fn parse_message(raw: &RawEvent) -> Result<ParsedMessage, RelayError> {
    let message_hash = raw
        .bytes("message_hash")
        .ok_or_else(|| RelayError::Parse("message without message_hash".to_string()))?;
    let source_hash = raw
        .bytes("source_hash")
        .ok_or_else(|| RelayError::Parse("message without source_hash".to_string()))?;
    let timestamp = raw.int("timestamp").unwrap_or_else(now_millis);

    let raw_fields = match raw.get("fields") {
        None => Vec::new(),
        Some(Value::Map(entries)) => entries.clone(),
        Some(other) => {
            return Err(RelayError::Parse(format!(
                "message fields must be a map, got {}",
                other
            )))
        }
    };

    let mut fields = FieldMap::new();
    let mut extensions: Option<Vec<(Value, Value)>> = None;
    for (key, value) in raw_fields {
        let Some(id) = key.as_u64().and_then(|k| u8::try_from(k).ok()) else {
            tracing::debug!("Skipping non-numeric field key {}", key);
            continue;
        };
        if id == field_ids::APP_EXTENSIONS {
            if let Value::Map(entries) = &value {
                extensions = Some(entries.clone());
            }
        }
        fields.insert(id, normalize_field(id, value));
    }

    if let (Some(target), Some(emoji)) = (
        extension(&extensions, "reaction_to").and_then(hash_text),
        extension(&extensions, "emoji").and_then(value_text),
    ) {
        return Ok(ParsedMessage::Reaction(ReactionEvent {
            message_hash,
            reaction_to: target,
            emoji,
            source_hash,
            timestamp,
        }));
    }

    let reply_to = extension(&extensions, "reply_to").and_then(hash_text);
    let method = match raw.get("method") {
        Some(Value::String(s)) => s.as_str().and_then(DeliveryMethod::parse),
        Some(v) => v.as_i64().and_then(DeliveryMethod::from_code),
        None => None,
    };

    Ok(ParsedMessage::Message(MessageEvent {
        content: raw.text("content").unwrap_or_default(),
        destination_hash: raw.bytes("destination_hash").unwrap_or_default(),
        public_key: raw.bytes("public_key"),
        message_hash,
        source_hash,
        timestamp,
        fields,
        reply_to,
        method,
    }))
}

/// Shape one LXMF field into a [`FieldValue`]
pub fn normalize_field(id: u8, value: Value) -> FieldValue {
    match (id, value) {
        (field_ids::FILE_ATTACHMENTS, Value::Array(items)) => {
            match items.iter().map(attachment_entry).collect::<Option<Vec<_>>>() {
                Some(entries) => FieldValue::Attachments(entries),
                None => FieldValue::Json(rmpv_to_json(&Value::Array(items))),
            }
        }
        (field_ids::IMAGE | field_ids::AUDIO, Value::Array(items)) => {
            if let [format, Value::Binary(data)] = items.as_slice() {
                return FieldValue::Bytes {
                    format: value_text(format),
                    data: data.clone(),
                };
            }
            FieldValue::Json(rmpv_to_json(&Value::Array(items)))
        }
        (_, Value::Binary(data)) => FieldValue::Bytes { format: None, data },
        (_, other) => FieldValue::Json(rmpv_to_json(&other)),
    }
}

/// `[filename, bytes]`
fn attachment_entry(item: &Value) -> Option<AttachmentEntry> {
    let Value::Array(pair) = item else {
        return None;
    };
    match pair.as_slice() {
        [name, Value::Binary(data)] => Some(AttachmentEntry::Inline {
            filename: value_text(name)?,
            data: data.clone(),
        }),
        _ => None,
    }
}

pub fn parse_delivery_status(raw: &RawEvent) -> Result<DeliveryStatusEvent, RelayError> {
    Ok(DeliveryStatusEvent {
        message_hash: raw
            .bytes("message_hash")
            .ok_or_else(|| RelayError::Parse("delivery status without message_hash".to_string()))?,
        status: raw
            .text("status")
            .ok_or_else(|| RelayError::Parse("delivery status without status".to_string()))?,
        timestamp: raw.int("timestamp").unwrap_or_else(now_millis),
    })
}

pub fn parse_link_event(raw: &RawEvent) -> Result<LinkEvent, RelayError> {
    let link_id = raw
        .bytes("link_id")
        .ok_or_else(|| RelayError::Parse("link event without link_id".to_string()))?;
    Ok(LinkEvent {
        link_id,
        destination_hash: raw.bytes("destination_hash"),
        status: raw.text("status").unwrap_or_else(|| "unknown".to_string()),
        timestamp: raw.int("timestamp").unwrap_or_else(now_millis),
        extra: extra_fields(raw, &["link_id", "destination_hash", "status", "timestamp"]),
    })
}

pub fn parse_packet(raw: &RawEvent) -> Result<PacketEvent, RelayError> {
    Ok(PacketEvent {
        destination_hash: raw
            .bytes("destination_hash")
            .ok_or_else(|| RelayError::Parse("packet without destination_hash".to_string()))?,
        data: raw.bytes("data").unwrap_or_default(),
        timestamp: raw.int("timestamp").unwrap_or_else(now_millis),
        extra: extra_fields(raw, &["destination_hash", "data", "timestamp"]),
    })
}

fn extra_fields(raw: &RawEvent, known: &[&str]) -> serde_json::Map<String, serde_json::Value> {
    raw.keys()
        .filter(|k| !known.contains(k))
        .filter_map(|k| raw.get(k).map(|v| (k.to_string(), rmpv_to_json(v))))
        .collect()
}

fn extension<'a>(extensions: &'a Option<Vec<(Value, Value)>>, name: &str) -> Option<&'a Value> {
    extensions
        .as_ref()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(name))
        .map(|(_, v)| v)
}

/// Hashes travel either as raw bytes or as hex text
fn hash_text(value: &Value) -> Option<String> {
    match value {
        Value::Binary(b) => Some(hex::encode(b)),
        Value::String(s) => s.as_str().map(|s| s.to_ascii_lowercase()),
        _ => None,
    }
}
