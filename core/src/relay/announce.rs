// Announce normalization
//
// App data is interpreted per aspect. LXMF delivery and propagation announces
// carry msgpack; a few older aspects carry a bare UTF-8 name. Text decoding is
// only attempted where text is a valid encoding for the aspect.

use super::{rmpv_to_json, value_text, RelayError};
use crate::event::{now_millis, AnnounceEvent, NodeType};
use crate::runtime::RawEvent;
use rmpv::Value;

pub const ASPECT_LXMF_DELIVERY: &str = "lxmf.delivery";
pub const ASPECT_LXMF_PROPAGATION: &str = "lxmf.propagation";
pub const ASPECT_NOMAD_NODE: &str = "nomadnetwork.node";
pub const ASPECT_CALL_AUDIO: &str = "call.audio";
pub const ASPECT_TELEPHONY: &str = "lxst.telephony";
pub const ASPECT_MAP_SERVER: &str = "rmsp.maps";

const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Propagation metadata map key holding the node name
const PN_META_NAME: u64 = 0x01;

const KNOWN_KEYS: &[&str] = &[
    "destination_hash",
    "identity_hash",
    "public_key",
    "app_data",
    "hops",
    "timestamp",
    "aspect",
    "interface",
    "display_name",
    "stamp_cost",
    "stamp_cost_flexibility",
    "peering_cost",
    "node_type",
];

/// Metadata recovered from aspect-specific app data
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AspectMetadata {
    pub display_name: Option<String>,
    pub stamp_cost: Option<u32>,
    pub stamp_cost_flexibility: Option<u32>,
    pub peering_cost: Option<u32>,
}

pub fn node_type_for(aspect: Option<&str>) -> NodeType {
    match aspect {
        Some(ASPECT_LXMF_DELIVERY) => NodeType::Peer,
        Some(ASPECT_LXMF_PROPAGATION) => NodeType::PropagationNode,
        Some(ASPECT_NOMAD_NODE) => NodeType::NomadNode,
        Some(ASPECT_CALL_AUDIO) | Some(ASPECT_TELEPHONY) => NodeType::Telephony,
        Some(ASPECT_MAP_SERVER) => NodeType::MapServer,
        _ => NodeType::Unknown,
    }
}

pub fn parse_announce(raw: &RawEvent) -> Result<AnnounceEvent, RelayError> {
    let destination_hash = raw
        .bytes("destination_hash")
        .ok_or_else(|| RelayError::Parse("announce without destination_hash".to_string()))?;
    let aspect = raw.text("aspect");
    let app_data = raw.bytes("app_data").unwrap_or_default();
    let metadata = parse_aspect_metadata(aspect.as_deref(), &app_data);

    let display_name = raw
        .text("display_name")
        .and_then(|n| normalize_display_name(&n))
        .or_else(|| metadata.display_name.clone())
        .or_else(|| text_display_name(aspect.as_deref(), &app_data))
        .unwrap_or_else(|| fallback_display_name(&destination_hash));

    let mut extensions = serde_json::Map::new();
    for key in raw_keys(raw) {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(value) = raw.get(&key) {
            extensions.insert(key, rmpv_to_json(value));
        }
    }

    Ok(AnnounceEvent {
        identity_hash: raw.bytes("identity_hash").unwrap_or_default(),
        public_key: raw.bytes("public_key").unwrap_or_default(),
        hops: raw
            .int("hops")
            .and_then(|h| u32::try_from(h).ok())
            .unwrap_or(0),
        timestamp: raw.int("timestamp").unwrap_or_else(now_millis),
        interface: raw.text("interface"),
        node_type: node_type_for(aspect.as_deref()),
        display_name: Some(display_name),
        stamp_cost: metadata.stamp_cost.or_else(|| raw_u32(raw, "stamp_cost")),
        stamp_cost_flexibility: metadata
            .stamp_cost_flexibility
            .or_else(|| raw_u32(raw, "stamp_cost_flexibility")),
        peering_cost: metadata.peering_cost.or_else(|| raw_u32(raw, "peering_cost")),
        aspect,
        app_data,
        destination_hash,
        extensions,
    })
}

fn raw_keys(raw: &RawEvent) -> Vec<String> {
    let mut keys: Vec<String> = raw.keys().map(str::to_string).collect();
    keys.sort();
    keys
}

/// Msgpack metadata parser for the LXMF aspects; never treats app data as text
pub fn parse_aspect_metadata(aspect: Option<&str>, app_data: &[u8]) -> AspectMetadata {
    if app_data.is_empty() || !is_msgpack_array_prefix(app_data[0]) {
        return AspectMetadata::default();
    }
    let Some(Value::Array(items)) = decode_msgpack(app_data) else {
        return AspectMetadata::default();
    };
    match aspect {
        Some(ASPECT_LXMF_DELIVERY) => delivery_metadata(&items),
        Some(ASPECT_LXMF_PROPAGATION) => propagation_metadata(&items),
        _ => AspectMetadata::default(),
    }
}

/// `[display_name, stamp_cost]`
fn delivery_metadata(items: &[Value]) -> AspectMetadata {
    AspectMetadata {
        display_name: items
            .first()
            .and_then(value_text)
            .and_then(|n| normalize_display_name(&n)),
        stamp_cost: items.get(1).and_then(value_u32),
        ..Default::default()
    }
}

/// Index 5 holds `[stamp_cost, flexibility, peering_cost]`, index 6 the
/// metadata map keyed by small integers.
fn propagation_metadata(items: &[Value]) -> AspectMetadata {
    let mut metadata = AspectMetadata::default();
    if let Some(Value::Array(costs)) = items.get(5) {
        metadata.stamp_cost = costs.first().and_then(value_u32);
        metadata.stamp_cost_flexibility = costs.get(1).and_then(value_u32);
        metadata.peering_cost = costs.get(2).and_then(value_u32);
    }
    if let Some(Value::Map(entries)) = items.get(6) {
        metadata.display_name = entries
            .iter()
            .find(|(k, _)| k.as_u64() == Some(PN_META_NAME))
            .and_then(|(_, v)| value_text(v))
            .and_then(|n| normalize_display_name(&n));
    }
    metadata
}

fn text_display_name(aspect: Option<&str>, app_data: &[u8]) -> Option<String> {
    if app_data.is_empty() {
        return None;
    }
    let text_allowed = match aspect {
        None => true,
        Some(ASPECT_LXMF_DELIVERY) => !is_msgpack_array_prefix(app_data[0]),
        Some(ASPECT_NOMAD_NODE) => true,
        Some(_) => false,
    };
    if !text_allowed {
        return None;
    }
    std::str::from_utf8(app_data)
        .ok()
        .and_then(normalize_display_name)
}

pub fn fallback_display_name(destination_hash: &[u8]) -> String {
    let hex = hex::encode(destination_hash);
    format!("Peer {}", &hex[..hex.len().min(8)].to_uppercase())
}

/// Trim, strip control characters and cap the length; `None` when nothing is left
pub fn normalize_display_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn is_msgpack_array_prefix(byte: u8) -> bool {
    (0x90..=0x9f).contains(&byte) || byte == 0xdc || byte == 0xdd
}

fn decode_msgpack(data: &[u8]) -> Option<Value> {
    let mut cursor = data;
    rmpv::decode::read_value(&mut cursor).ok()
}

fn raw_u32(raw: &RawEvent, key: &str) -> Option<u32> {
    raw.int(key).and_then(|v| u32::try_from(v).ok())
}

fn value_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    fn raw(aspect: &str, app_data: Vec<u8>) -> RawEvent {
        RawEvent::new()
            .with("destination_hash", vec![0xde_u8, 0xad, 0xbe, 0xef, 0x01])
            .with("identity_hash", vec![1_u8; 16])
            .with("public_key", vec![2_u8; 64])
            .with("app_data", app_data)
            .with("aspect", aspect)
            .with("hops", 2_i64)
            .with("timestamp", 1_700_000_000_000_i64)
    }

    #[test]
    fn test_delivery_msgpack_name_and_cost() {
        let app_data = encode(&Value::Array(vec![
            Value::Binary(b"Alice".to_vec()),
            Value::from(8),
        ]));
        let event = parse_announce(&raw(ASPECT_LXMF_DELIVERY, app_data)).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Alice"));
        assert_eq!(event.stamp_cost, Some(8));
        assert_eq!(event.node_type, NodeType::Peer);
        assert_eq!(event.hops, 2);
    }

    #[test]
    fn test_delivery_legacy_utf8() {
        let event = parse_announce(&raw(ASPECT_LXMF_DELIVERY, b"  Bob\n".to_vec())).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Bob"));
        assert_eq!(event.stamp_cost, None);
    }

    #[test]
    fn test_propagation_metadata() {
        let meta = Value::Map(vec![(Value::from(1), Value::Binary(b"Relay One".to_vec()))]);
        let app_data = encode(&Value::Array(vec![
            Value::Boolean(false),
            Value::from(1_700_000_000),
            Value::Boolean(true),
            Value::from(256),
            Value::from(10240),
            Value::Array(vec![Value::from(16), Value::from(3), Value::from(18)]),
            meta,
        ]));
        let event = parse_announce(&raw(ASPECT_LXMF_PROPAGATION, app_data)).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Relay One"));
        assert_eq!(event.stamp_cost, Some(16));
        assert_eq!(event.stamp_cost_flexibility, Some(3));
        assert_eq!(event.peering_cost, Some(18));
        assert_eq!(event.node_type, NodeType::PropagationNode);
    }

    #[test]
    fn test_propagation_never_decoded_as_text() {
        let event = parse_announce(&raw(ASPECT_LXMF_PROPAGATION, b"NotAName".to_vec())).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Peer DEADBEEF"));
    }

    #[test]
    fn test_explicit_display_name_wins() {
        let app_data = encode(&Value::Array(vec![Value::from("Alice"), Value::Nil]));
        let raw = raw(ASPECT_LXMF_DELIVERY, app_data).with("display_name", "Explicit");
        let event = parse_announce(&raw).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Explicit"));
    }

    #[test]
    fn test_telephony_falls_back() {
        let event = parse_announce(&raw(ASPECT_CALL_AUDIO, b"caller".to_vec())).unwrap();
        assert_eq!(event.display_name.as_deref(), Some("Peer DEADBEEF"));
        assert_eq!(event.node_type, NodeType::Telephony);
    }

    #[test]
    fn test_unknown_keys_become_extensions() {
        let raw = raw("rmsp.maps", Vec::new()).with("coverage", "tiles/12");
        let event = parse_announce(&raw).unwrap();
        assert_eq!(event.extensions["coverage"], serde_json::json!("tiles/12"));
        assert_eq!(event.node_type, NodeType::MapServer);
    }

    #[test]
    fn test_typed_keys_never_duplicated_as_extensions() {
        let raw = raw(ASPECT_LXMF_DELIVERY, b"Bob".to_vec())
            .with("stamp_cost", 12_i64)
            .with("peering_cost", 4_i64)
            .with("node_type", "peer");
        let event = parse_announce(&raw).unwrap();
        assert!(event.extensions.is_empty());
        assert_eq!(event.stamp_cost, Some(12));
        assert_eq!(event.peering_cost, Some(4));

        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json.matches("\"stamp_cost\"").count(), 1);
        assert_eq!(json.matches("\"node_type\"").count(), 1);
    }

    #[test]
    fn test_missing_destination_is_parse_error() {
        let raw = RawEvent::new().with("aspect", ASPECT_LXMF_DELIVERY);
        assert!(matches!(parse_announce(&raw), Err(RelayError::Parse(_))));
    }

    #[test]
    fn test_normalize_display_name() {
        assert_eq!(normalize_display_name(" \u{7}Ali\nce "), Some("Alice".to_string()));
        assert_eq!(normalize_display_name("   "), None);
        assert_eq!(
            normalize_display_name(&"x".repeat(100)).map(|n| n.len()),
            Some(MAX_DISPLAY_NAME_CHARS)
        );
    }
}
