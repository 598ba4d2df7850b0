//! Topic Resolver
//!
//! Derives the broker topic and broker connection options from an inbound
//! WebSocket upgrade request:
//!
//! ```text
//! ws://bridge:8080/sensors%2Fkitchen?clientId=dash-1&qos=1
//!                  └──── topic ────┘ └──── options ────┘
//! ```
//!
//! The path (minus its leading `/`) is percent-decoded into the topic.
//! Query parameters are passed through untouched as options; validating
//! them is the broker client's job. Resolution is pure and never opens a
//! connection.

mod validation;

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::error::BridgeError;

pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_name, MAX_TOPIC_LEN,
};

/// Broker connection options taken from the request query string
///
/// Keys keep their original spelling; a repeated key keeps its last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions(BTreeMap<String, String>);

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `application/x-www-form-urlencoded` query string
    pub fn from_query(query: &str) -> Self {
        let map = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Outcome of topic resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTopic {
    /// Broker topic (may be a filter)
    pub topic: String,
    /// Options forwarded to the broker client
    pub options: ConnectionOptions,
}

/// Resolve a topic from a request path and optional query string
pub fn resolve(path: &str, query: Option<&str>) -> Result<ResolvedTopic, BridgeError> {
    let encoded = path.strip_prefix('/').unwrap_or(path);

    let topic = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|_| {
            BridgeError::MalformedRequest(format!("path '{}' is not valid UTF-8", path))
        })?
        .into_owned();

    if topic.is_empty() {
        return Err(BridgeError::MalformedRequest(
            "empty topic in request path".to_string(),
        ));
    }

    validate_topic_filter(&topic).map_err(|reason| {
        BridgeError::MalformedRequest(format!("invalid topic '{}': {}", topic, reason))
    })?;

    let options = query.map(ConnectionOptions::from_query).unwrap_or_default();

    Ok(ResolvedTopic { topic, options })
}

/// Resolve a topic from a WebSocket handshake request
pub fn resolve_request(request: &Request) -> Result<ResolvedTopic, BridgeError> {
    resolve(request.uri().path(), request.uri().query())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_resolve_plain_path() {
        let resolved = resolve("/sensors/1", None).unwrap();
        assert_eq!(resolved.topic, "sensors/1");
        assert!(resolved.options.is_empty());
    }

    #[test]
    fn test_resolve_percent_encoded_path() {
        let resolved = resolve("/sensors%2Fkitchen%20east", None).unwrap();
        assert_eq!(resolved.topic, "sensors/kitchen east");
    }

    #[test]
    fn test_resolve_strips_only_one_separator() {
        let resolved = resolve("//absolute/topic", None).unwrap();
        assert_eq!(resolved.topic, "/absolute/topic");
    }

    #[test]
    fn test_resolve_wildcard_filter() {
        assert_eq!(resolve("/sensors/%23", None).unwrap().topic, "sensors/#");
        assert_eq!(resolve("/sensors/+/temp", None).unwrap().topic, "sensors/+/temp");
    }

    #[test]
    fn test_resolve_passes_query_through() {
        let resolved = resolve("/t", Some("clientId=foo&username=u%40x&custom=1")).unwrap();
        assert_eq!(resolved.options.get("clientId"), Some("foo"));
        assert_eq!(resolved.options.get("username"), Some("u@x"));
        assert_eq!(resolved.options.get("custom"), Some("1"));
        assert_eq!(resolved.options.len(), 3);
    }

    #[test]
    fn test_resolve_repeated_option_keeps_last() {
        let resolved = resolve("/t", Some("qos=0&qos=1")).unwrap();
        assert_eq!(resolved.options.get("qos"), Some("1"));
    }

    #[test_case("" ; "no path")]
    #[test_case("/" ; "root path")]
    #[test_case("/%FF%FE" ; "invalid utf8")]
    #[test_case("/a/%23/b" ; "hash not last")]
    #[test_case("/a%00b" ; "nul byte")]
    fn test_resolve_rejects(path: &str) {
        let err = resolve(path, None).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedRequest(_)), "{:?}", err);
    }

    #[test]
    fn test_resolve_request_uses_uri() {
        let request = Request::builder()
            .uri("ws://localhost:8080/room%201?clientId=abc")
            .body(())
            .unwrap();
        let resolved = resolve_request(&request).unwrap();
        assert_eq!(resolved.topic, "room 1");
        assert_eq!(resolved.options.get("clientId"), Some("abc"));
    }
}
