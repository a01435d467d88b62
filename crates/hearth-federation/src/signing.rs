//! Canonical JSON and federation request signing.
//!
//! Every outbound transaction carries a signed Authorization header:
//!
//! ```text
//! Authorization: X-Matrix origin=hearth.example.com,
//!                key="ed25519:3f9a2c0d11ee",
//!                sig="<base64-signature>"
//! ```
//!
//! The signed content is the canonical JSON of a request object:
//!
//! ```json
//! {
//!   "content":     { ... },
//!   "destination": "remote.example",
//!   "method":      "PUT",
//!   "origin":      "hearth.example.com",
//!   "uri":         "/_matrix/federation/v1/send/12345/"
//! }
//! ```
//!
//! Canonical JSON sorts all object keys lexicographically (recursing into
//! arrays without reordering them) and serialises with no extra whitespace,
//! so signing the same logical object always produces the same bytes.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::keys::SigningKeyPair;

/// A signed request authorization, ready to be serialised into an HTTP
/// `Authorization` header.
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub origin: String,
    pub key_id: String,
    pub sig: String,
}

impl RequestAuth {
    /// Build the `Authorization: X-Matrix …` header value.
    pub fn to_header(&self) -> String {
        format!(
            r#"X-Matrix origin={},key="{}",sig="{}""#,
            self.origin, self.key_id, self.sig,
        )
    }
}

/// Sign an outbound federation request and return the [`RequestAuth`].
///
/// * `kp`          — this server's signing key pair
/// * `origin`      — this server's name
/// * `destination` — remote server's name
/// * `method`      — HTTP method, uppercase (e.g. `"PUT"`)
/// * `uri`         — request path (e.g. `"/_matrix/federation/v1/send/1/"`)
/// * `content`     — request body (`None` for GET requests)
pub fn sign_request(
    kp: &SigningKeyPair,
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> RequestAuth {
    let canonical = build_signing_object(origin, destination, method, uri, content);
    let sig = kp.sign_bytes(canonical.as_bytes());
    RequestAuth { origin: origin.to_owned(), key_id: kp.key_id.clone(), sig }
}

/// Produce a detached signature over the canonical form of `payload`,
/// ignoring any `signatures`/`unsigned` fields it already carries.
///
/// Returns `(key_id, signature)`.
pub fn sign_json(kp: &SigningKeyPair, payload: &Value) -> (String, String) {
    let canonical = signable_json(payload);
    (kp.key_id.clone(), kp.sign_bytes(canonical.as_bytes()))
}

/// Canonical JSON of `payload` with `signatures` and `unsigned` stripped:
/// the exact bytes a signature covers.
pub fn signable_json(payload: &Value) -> String {
    let mut signing = payload.clone();
    if let Some(obj) = signing.as_object_mut() {
        obj.remove("signatures");
        obj.remove("unsigned");
    }
    canonical_json(&signing)
}

/// Produce canonical JSON (sorted keys, no extra whitespace), following the
/// Matrix canonical JSON rules.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect::<BTreeMap<_, _>>()
                .into_iter()
                .collect();
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Build the canonical JSON object that is signed for an HTTP request.
fn build_signing_object(
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> String {
    let mut map = serde_json::Map::new();
    map.insert("method".into(), Value::String(method.to_uppercase()));
    map.insert("uri".into(), Value::String(uri.to_owned()));
    map.insert("origin".into(), Value::String(origin.to_owned()));
    map.insert("destination".into(), Value::String(destination.to_owned()));
    if let Some(body) = content {
        map.insert("content".into(), body.clone());
    }
    canonical_json(&Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({
            "b": {"z": 1, "a": 2},
            "a": [{"y": 1, "x": 2}, 3, "s"],
        });
        assert_eq!(canonical_json(&value), r#"{"a":[{"x":2,"y":1},3,"s"],"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let value = json!({"list": [3, 1, 2]});
        assert_eq!(canonical_json(&value), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn signable_json_strips_signatures_and_unsigned() {
        let value = json!({
            "content": {"body": "hi"},
            "signatures": {"hearth.example": {"ed25519:abc": "sig"}},
            "unsigned": {"age": 100},
        });
        assert_eq!(signable_json(&value), r#"{"content":{"body":"hi"}}"#);
    }

    #[test]
    fn sign_json_is_deterministic_regardless_of_key_order() {
        let kp = SigningKeyPair::generate();
        let a = json!({"alpha": 1, "beta": {"c": true, "b": false}});
        let b = json!({"beta": {"b": false, "c": true}, "alpha": 1});

        assert_eq!(signable_json(&a), signable_json(&b));
        assert_eq!(sign_json(&kp, &a), sign_json(&kp, &b));
    }

    #[test]
    fn auth_header_has_expected_shape() {
        let kp = SigningKeyPair::generate();
        let body = json!({"edus": [], "pdus": []});
        let auth = sign_request(
            &kp,
            "hearth.example",
            "remote.example",
            "PUT",
            "/_matrix/federation/v1/send/1/",
            Some(&body),
        );

        let header = auth.to_header();
        assert!(header.starts_with("X-Matrix origin=hearth.example,"));
        assert!(header.contains(&format!(r#"key="{}""#, kp.key_id)));
        assert!(header.contains(r#"sig=""#));
    }

    #[test]
    fn request_signature_covers_method_uri_and_content() {
        let kp = SigningKeyPair::generate();
        let body = json!({"pdus": []});

        let a = sign_request(&kp, "o", "d", "PUT", "/send/1/", Some(&body));
        let b = sign_request(&kp, "o", "d", "PUT", "/send/2/", Some(&body));
        assert_ne!(a.sig, b.sig);

        let c = sign_request(&kp, "o", "d", "PUT", "/send/1/", Some(&body));
        assert_eq!(a.sig, c.sig);
    }
}
