//! The four client-to-relay verbs and five relay-to-client verbs of spec §6,
//! framed as JSON arrays over WebSocket text frames.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::subid::SubscriptionId;

/// Messages a [`crate::RelayAgent`] sends to its relay.
#[derive(Clone)]
pub enum ClientMessage {
    Req {
        sub_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: SubscriptionId,
    },
    Event(Event),
}

impl ClientMessage {
    pub fn req(sub_id: SubscriptionId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: SubscriptionId) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn event(event: Event) -> Self {
        ClientMessage::Event(event)
    }

    pub fn to_json(&self) -> Result<String> {
        match self {
            ClientMessage::Req { sub_id, filters } => {
                let mut parts = Vec::with_capacity(filters.len() + 2);
                parts.push(serde_json::to_value("REQ")?);
                parts.push(serde_json::to_value(sub_id.as_str())?);
                for filter in filters {
                    parts.push(serde_json::to_value(filter)?);
                }
                Ok(Value::Array(parts).to_string())
            }
            ClientMessage::Close { sub_id } => {
                Ok(serde_json::json!(["CLOSE", sub_id.as_str()]).to_string())
            }
            ClientMessage::Event(event) => Ok(serde_json::json!(["EVENT", event]).to_string()),
        }
    }
}

/// Messages a relay sends back to a [`crate::RelayAgent`].
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        sub_id: SubscriptionId,
        event: Box<Event>,
    },
    Eose {
        sub_id: SubscriptionId,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Closed {
        sub_id: SubscriptionId,
        reason: String,
    },
}

impl RelayMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::DecodeError("empty message".into()));
        }

        let value: Value = serde_json::from_str(raw)?;
        let arr = value
            .as_array()
            .ok_or_else(|| Error::DecodeError("message is not a JSON array".into()))?;

        let verb = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::DecodeError("missing verb".into()))?;

        match verb {
            "EVENT" => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeError("EVENT missing sub_id".into()))?;
                let event_value = arr
                    .get(2)
                    .ok_or_else(|| Error::DecodeError("EVENT missing event".into()))?;
                let event: Event = serde_json::from_value(event_value.clone())?;
                Ok(RelayMessage::Event {
                    sub_id: SubscriptionId::new(sub_id),
                    event: Box::new(event),
                })
            }
            "EOSE" => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeError("EOSE missing sub_id".into()))?;
                Ok(RelayMessage::Eose {
                    sub_id: SubscriptionId::new(sub_id),
                })
            }
            "OK" => {
                let event_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeError("OK missing event_id".into()))?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::DecodeError("OK missing status".into()))?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id: event_id.to_string(),
                    accepted,
                    message,
                })
            }
            "NOTICE" => {
                let message = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeError("NOTICE missing message".into()))?;
                Ok(RelayMessage::Notice {
                    message: message.to_string(),
                })
            }
            "CLOSED" => {
                let sub_id = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::DecodeError("CLOSED missing sub_id".into()))?;
                let reason = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Closed {
                    sub_id: SubscriptionId::new(sub_id),
                    reason,
                })
            }
            other => Err(Error::DecodeError(format!("unrecognized verb: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Pubkey};

    fn sample_event() -> Event {
        Event {
            id: EventId::new([1u8; 32]),
            pubkey: Pubkey::from("a".repeat(64)),
            created_at: 100,
            kind: 1,
            tags: vec![],
            content: "hi".into(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn req_encodes_all_filters() {
        let msg = ClientMessage::req(
            SubscriptionId::new("s1"),
            vec![Filter::new().kinds([1]), Filter::new().kinds([2])],
        );
        let json = msg.to_json().unwrap();
        assert!(json.starts_with(r#"["REQ","s1","#));
        assert!(json.contains("\"kinds\":[1]"));
        assert!(json.contains("\"kinds\":[2]"));
    }

    #[test]
    fn close_encodes_sub_id() {
        let msg = ClientMessage::close(SubscriptionId::new("s1"));
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","s1"]"#);
    }

    #[test]
    fn event_roundtrips_through_relay_message() {
        let ev = sample_event();
        let client_json = ClientMessage::event(ev.clone()).to_json().unwrap();
        assert!(client_json.starts_with(r#"["EVENT","#));

        let relay_json = format!(
            r#"["EVENT","s1",{}]"#,
            serde_json::to_string(&ev).unwrap()
        );
        match RelayMessage::from_json(&relay_json).unwrap() {
            RelayMessage::Event { sub_id, event } => {
                assert_eq!(sub_id.as_str(), "s1");
                assert_eq!(event.id, ev.id);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_eose() {
        match RelayMessage::from_json(r#"["EOSE","s1"]"#).unwrap() {
            RelayMessage::Eose { sub_id } => assert_eq!(sub_id.as_str(), "s1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_ok_true_and_false() {
        match RelayMessage::from_json(r#"["OK","deadbeef",true,""]"#).unwrap() {
            RelayMessage::Ok { accepted, .. } => assert!(accepted),
            other => panic!("unexpected: {other:?}"),
        }
        match RelayMessage::from_json(r#"["OK","deadbeef",false,"blocked: spam"]"#).unwrap() {
            RelayMessage::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert_eq!(message, "blocked: spam");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_notice_and_closed() {
        assert!(matches!(
            RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap(),
            RelayMessage::Notice { .. }
        ));
        match RelayMessage::from_json(r#"["CLOSED","s1","restarted"]"#).unwrap() {
            RelayMessage::Closed { sub_id, reason } => {
                assert_eq!(sub_id.as_str(), "s1");
                assert_eq!(reason, "restarted");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_and_unrecognized() {
        assert!(RelayMessage::from_json("").is_err());
        assert!(RelayMessage::from_json(r#"["PING"]"#).is_err());
    }
}

impl std::fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMessage::Req { sub_id, filters } => f
                .debug_struct("Req")
                .field("sub_id", sub_id)
                .field("filters", &filters.len())
                .finish(),
            ClientMessage::Close { sub_id } => f.debug_struct("Close").field("sub_id", sub_id).finish(),
            ClientMessage::Event(ev) => f.debug_struct("Event").field("id", &ev.id).finish(),
        }
    }
}
