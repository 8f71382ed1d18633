//! Line-oriented Action/Event framing for the switch management channel.
//!
//! Wire shape: a block of `Key: Value` lines terminated by a blank line.
//! Requests carry `Action:` + a freshly minted `ActionID:`; responses echo
//! the `ActionID`; asynchronous notifications carry `Event:` instead of
//! `Action:`/`Response:`.

use std::collections::HashMap;
use std::fmt::Write as _;

/// A single `Key: Value` block, order-preserving for duplicate keys
/// (originate requests carry repeated `Variable:` fields).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// First value for `key`, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in wire order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> HashMap<String, String> {
        self.0.iter().cloned().collect()
    }

    fn encode(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.0 {
            let _ = writeln!(out, "{k}: {v}");
        }
        out.push('\n');
        out
    }

    fn decode_block(block: &str) -> Self {
        let mut fields = Vec::new();
        for line in block.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some((k, v)) = line.split_once(':') {
                fields.push((k.trim().to_string(), v.trim().to_string()));
            }
        }
        Fields(fields)
    }
}

/// An outbound request: `Action: <name>` plus arbitrary fields.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub action_id: String,
    pub fields: Fields,
}

impl Action {
    pub fn new(name: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: action_id.into(),
            fields: Fields::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(key, value);
        self
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Action: {}", self.name);
        let _ = writeln!(out, "ActionID: {}", self.action_id);
        out.push_str(&self.fields.encode());
        out
    }
}

/// A response block correlated to an `Action` by `ActionID`.
#[derive(Debug, Clone)]
pub struct Response {
    pub action_id: String,
    /// `Success`, `Error`, or a switch-specific status string.
    pub status: String,
    pub fields: Fields,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

/// An asynchronous, unsolicited notification (`Event:` header).
#[derive(Debug, Clone)]
pub struct SwitchEvent {
    pub name: String,
    pub fields: Fields,
}

impl SwitchEvent {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }
}

/// One parsed frame: either a response to a prior `Send`, or a fan-out event.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Response),
    Event(SwitchEvent),
}

/// Parses a single `\n\n`-terminated block into a [`Frame`].
///
/// Returns `None` for a block with neither an `Event:` nor `Response:`
/// header — malformed input we don't recognize, logged and dropped by
/// the caller rather than treated as fatal.
pub fn parse_block(block: &str) -> Option<Frame> {
    let fields = Fields::decode_block(block);
    if let Some(name) = fields.get("Event") {
        return Some(Frame::Event(SwitchEvent {
            name: name.to_string(),
            fields,
        }));
    }
    if let Some(status) = fields.get("Response") {
        let action_id = fields.get("ActionID").unwrap_or_default().to_string();
        return Some(Frame::Response(Response {
            action_id,
            status: status.to_string(),
            fields,
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_action_with_repeated_variables() {
        let action = Action::new("Originate", "42")
            .with("Channel", "SIP/sbc233/3000000001")
            .with("Variable", "corr_id=abc")
            .with("Variable", "project_id=937");
        let wire = action.encode();
        assert!(wire.contains("Action: Originate\n"));
        assert!(wire.contains("ActionID: 42\n"));
        assert_eq!(wire.matches("Variable:").count(), 2);
    }

    #[test]
    fn parses_response_block() {
        let block = "Response: Success\nActionID: 42\nMessage: Originate successfully queued\n";
        match parse_block(block) {
            Some(Frame::Response(r)) => {
                assert!(r.is_success());
                assert_eq!(r.action_id, "42");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn parses_event_block() {
        let block = "Event: Hangup\nChannel: SIP/sbc233-001\nCause: 17\nCause-txt: Busy\n";
        match parse_block(block) {
            Some(Frame::Event(e)) => {
                assert_eq!(e.name, "Hangup");
                assert_eq!(e.get("Cause"), Some("17"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn ignores_block_without_event_or_response() {
        let block = "Ping: pong\n";
        assert!(parse_block(block).is_none());
    }
}
