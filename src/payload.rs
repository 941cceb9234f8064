//! Inbound message bodies, parsed when possible and delivered raw otherwise.
//!
//! 入站消息体：能解析则解析，否则原样交付。

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// The body of an inbound message as handed to a subscriber.
///
/// Parsing never fails outward: a body that is not valid JSON is delivered
/// as [`Payload::Raw`] instead of being dropped.
///
/// 交给订阅者的入站消息体。解析失败不会向外传播：非法 JSON 以 [`Payload::Raw`] 交付。
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The body parsed as structured JSON.
    /// 已解析为结构化 JSON 的消息体。
    Parsed(Value),
    /// The original body, which did not parse.
    /// 未能解析的原始消息体。
    Raw(String),
}

impl Payload {
    /// Parses a frame body, falling back to the raw text.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Payload::Parsed(value),
            Err(error) => {
                debug!(%error, len = body.len(), "Message body is not JSON, delivering raw");
                Payload::Raw(body.to_owned())
            }
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Parsed(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Parsed(_) => None,
            Payload::Raw(raw) => Some(raw),
        }
    }

    /// Deserializes a parsed payload into `T`. Raw payloads and shape
    /// mismatches yield `None`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Option<T> {
        self.as_value()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u64,
    }

    #[test]
    fn json_body_is_parsed() {
        let payload = Payload::from_body("{\"id\":42}");
        assert_eq!(payload, Payload::Parsed(json!({ "id": 42 })));
        assert_eq!(payload.deserialize::<Order>(), Some(Order { id: 42 }));
    }

    #[test]
    fn malformed_body_degrades_to_raw() {
        let payload = Payload::from_body("{\"id\":");
        assert_eq!(payload.as_raw(), Some("{\"id\":"));
        assert!(payload.as_value().is_none());
        assert_eq!(payload.deserialize::<Order>(), None);
    }

    #[test]
    fn plain_text_is_raw_and_json_scalars_are_parsed() {
        assert_eq!(Payload::from_body("hello"), Payload::Raw("hello".into()));
        assert_eq!(Payload::from_body("7"), Payload::Parsed(json!(7)));
        assert_eq!(Payload::from_body(""), Payload::Raw(String::new()));
    }
}
