//! Federation wire types: the transaction envelope and its EDU payloads.
//!
//! PDUs are carried as raw JSON: they were signed by the core when first
//! persisted and must not be re-serialised through a lossy intermediate type.

use serde::Serialize;
use serde_json::Value;

/// An Ephemeral Data Unit: transient federation payload (presence, typing,
/// to-device, device-list update). Never persisted on either side.
#[derive(Debug, Clone, Serialize)]
pub struct Edu {
    pub edu_type: String,
    pub content: Value,
}

/// The transaction envelope sent via `PUT /_matrix/federation/v1/send/{txnId}/`.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub origin: String,
    pub destination: String,
    /// Unix millisecond timestamp on the origin server.
    pub origin_server_ts: i64,
    /// Persistent Data Units (room events), in stream order.
    pub pdus: Vec<Value>,
    /// Ephemeral Data Units, in insertion order (keyed EDUs deduplicated).
    pub edus: Vec<Edu>,
}

/// Format a persisted event for the wire according to the room's
/// event-format version: v1/v2 rooms carry an explicit `event_id`, later
/// versions derive it from the event hash and must not include the field.
pub fn format_pdu(event_json: &Value, room_version: &str) -> Value {
    let mut pdu = event_json.clone();
    if !matches!(room_version, "1" | "2") {
        if let Some(obj) = pdu.as_object_mut() {
            obj.remove("event_id");
        }
    }
    pdu
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v1_pdus_keep_event_id() {
        let event = json!({"event_id": "$abc:hs", "type": "m.room.message"});
        let pdu = format_pdu(&event, "1");
        assert_eq!(pdu["event_id"], "$abc:hs");
    }

    #[test]
    fn modern_pdus_drop_event_id() {
        let event = json!({"event_id": "$abc", "type": "m.room.message"});
        let pdu = format_pdu(&event, "6");
        assert!(pdu.get("event_id").is_none());
        assert_eq!(pdu["type"], "m.room.message");
    }

    #[test]
    fn transaction_serialises_with_edu_envelopes() {
        let txn = Transaction {
            transaction_id: "1700000000001".into(),
            origin: "hearth.example".into(),
            destination: "remote.example".into(),
            origin_server_ts: 1_700_000_000_000,
            pdus: vec![],
            edus: vec![Edu { edu_type: "m.typing".into(), content: json!({"typing": true}) }],
        };
        let wire = serde_json::to_value(&txn).unwrap();
        assert_eq!(wire["edus"][0]["edu_type"], "m.typing");
        assert_eq!(wire["transaction_id"], "1700000000001");
    }
}
