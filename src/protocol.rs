//! JSON text frames exchanged on a subscription channel.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

#[derive(Debug, Serialize)]
struct SubscribeBody<'a> {
    sparql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    subscribe: SubscribeBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UnsubscribeBody<'a> {
    spuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UnsubscribeFrame<'a> {
    unsubscribe: UnsubscribeBody<'a>,
}

/// `{"subscribe": {"sparql", "authorization"?}, "alias"?}`
pub fn subscribe_frame(sparql: &str, alias: Option<&str>, authorization: Option<&str>) -> Result<String> {
    let frame = SubscribeFrame { subscribe: SubscribeBody { sparql, authorization }, alias };
    Ok(serde_json::to_string(&frame)?)
}

/// `{"unsubscribe": {"spuid", "authorization"?}}`
pub fn unsubscribe_frame(spuid: &str, authorization: Option<&str>) -> Result<String> {
    let frame = UnsubscribeFrame { unsubscribe: UnsubscribeBody { spuid, authorization } };
    Ok(serde_json::to_string(&frame)?)
}

/// A result-set delta, or the confirmation when `sequence` is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub spuid: String,
    pub sequence: String,
    pub alias: Option<String>,
    pub added_results: Value,
    pub removed_results: Value,
}

impl Notification {
    pub fn is_confirmation(&self) -> bool {
        self.sequence == "0"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Notification(Notification),
    Unsubscribed { spuid: String },
    Error(Value),
    Unknown(Value),
}

fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Sorts an inbound frame by its top-level key. Only malformed JSON is an error,
/// shapes that are not understood come back as [`Inbound::Unknown`].
pub fn classify(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)?;
    Ok(value.as_object().and_then(known).unwrap_or(Inbound::Unknown(value)))
}

fn known(message: &Map<String, Value>) -> Option<Inbound> {
    if let Some(Value::Object(notification)) = message.get("notification") {
        return Some(Inbound::Notification(Notification {
            spuid: text_field(notification, "spuid")?,
            sequence: text_field(notification, "sequence")?,
            alias: text_field(notification, "alias").or_else(|| text_field(message, "alias")),
            added_results: notification.get("addedResults").cloned().unwrap_or(Value::Null),
            removed_results: notification.get("removedResults").cloned().unwrap_or(Value::Null),
        }));
    }
    if let Some(error) = message.get("error") {
        return Some(Inbound::Error(error.clone()));
    }
    match message.get("unsubscribed") {
        Some(Value::Object(unsubscribed)) => Some(Inbound::Unsubscribed { spuid: text_field(unsubscribed, "spuid")? }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_fields_are_left_out() {
        let plain: Value = serde_json::from_str(&subscribe_frame("SELECT * {}", None, None).unwrap()).unwrap();
        assert_eq!(plain, json!({"subscribe": {"sparql": "SELECT * {}"}}));
        let full: Value = serde_json::from_str(&subscribe_frame("Q", Some("a1"), Some("jwt")).unwrap()).unwrap();
        assert_eq!(full, json!({"subscribe": {"sparql": "Q", "authorization": "jwt"}, "alias": "a1"}));
        let unsubscribe: Value = serde_json::from_str(&unsubscribe_frame("s1", Some("jwt")).unwrap()).unwrap();
        assert_eq!(unsubscribe, json!({"unsubscribe": {"spuid": "s1", "authorization": "jwt"}}));
    }

    #[test]
    fn numeric_and_textual_sequences_confirm() {
        for frame in [
            r#"{"notification": {"sequence": "0", "spuid": "s1"}}"#,
            r#"{"notification": {"sequence": 0, "spuid": "s1"}}"#,
        ] {
            match classify(frame).unwrap() {
                Inbound::Notification(n) => assert!(n.is_confirmation()),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn deltas_keep_their_results() {
        let frame = r#"{"notification": {"sequence": "3", "spuid": "s1", "addedResults": [1], "removedResults": []}}"#;
        let Inbound::Notification(n) = classify(frame).unwrap() else { panic!("not a notification") };
        assert!(!n.is_confirmation());
        assert_eq!(n.added_results, json!([1]));
        assert_eq!(n.removed_results, json!([]));
    }

    #[test]
    fn other_shapes() {
        assert_eq!(
            classify(r#"{"unsubscribed": {"spuid": "s1"}}"#).unwrap(),
            Inbound::Unsubscribed { spuid: "s1".into() }
        );
        assert_eq!(classify(r#"{"error": {"status": 400}}"#).unwrap(), Inbound::Error(json!({"status": 400})));
        assert!(matches!(classify(r#"{"ping": 1}"#).unwrap(), Inbound::Unknown(_)));
        assert!(matches!(classify(r#"{"notification": {"sequence": "1"}}"#).unwrap(), Inbound::Unknown(_)));
        assert!(classify("not json").is_err());
    }
}
