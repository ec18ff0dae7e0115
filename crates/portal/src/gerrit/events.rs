//! Gerrit stream-events decoding and Redmine cross-references

use crate::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Event kinds the change-event feed subscribes to
pub const SUBSCRIBED_EVENTS: [&str; 2] = ["patchset-created", "change-merged"];

static BUG_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^Bug-Id:\s*(\d+)").expect("Bug-Id pattern is valid"));

/// The change an event refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Change {
    /// Change URL on the review server
    #[serde(default)]
    pub url: String,
    /// Full commit message
    #[serde(default, rename = "commitMessage")]
    pub commit_message: String,
}

/// One line of `gerrit stream-events`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChangeEvent {
    /// Event type, e.g. `patchset-created`
    #[serde(rename = "type")]
    pub kind: String,
    /// The change
    #[serde(default)]
    pub change: Change,
}

impl ChangeEvent {
    /// Decode one JSON line
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Ticket ids referenced by `Bug-Id:` lines, in order of appearance
    pub fn bug_ids(&self) -> Vec<String> {
        bug_ids(&self.change.commit_message)
    }

    /// One annotation per referenced ticket
    pub fn annotations(&self) -> Vec<RedmineAnnotation> {
        let ids = self.bug_ids();
        if ids.is_empty() {
            return Vec::new();
        }
        let note = format!(
            "{} {}\n\n{}",
            self.kind,
            self.change.url,
            indent(&self.change.commit_message)
        );
        ids.into_iter()
            .map(|ticket| RedmineAnnotation {
                ticket,
                note: note.clone(),
            })
            .collect()
    }
}

/// A note to attach to an issue-tracker ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedmineAnnotation {
    /// Ticket id (digits)
    pub ticket: String,
    /// Note text
    pub note: String,
}

/// Every case-insensitive, line-anchored `Bug-Id: <digits>` in `message`
pub fn bug_ids(message: &str) -> Vec<String> {
    BUG_ID
        .captures_iter(message)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Indent every line by four spaces
pub fn indent(message: &str) -> String {
    message
        .split('\n')
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_case_and_spacing() {
        let message = "Fix login loop\n\nBug-Id: 42\nbug-id:   7\n";
        assert_eq!(bug_ids(message), vec!["42", "7"]);
    }

    #[test]
    fn test_no_marker() {
        assert!(bug_ids("Refactor parser\n\nSee Bug-Id: 9 inline").is_empty());
        assert!(bug_ids("").is_empty());
    }

    #[test]
    fn test_marker_must_start_the_line() {
        assert_eq!(bug_ids("Title\n Bug-Id: 3\nBug-Id: 4"), vec!["4"]);
    }

    #[test]
    fn test_parse_event() {
        let line = r#"{"type":"change-merged","change":{"project":"app","url":"http://review/c/app/+/12","commitMessage":"Title\n\nBug-Id: 5\n"},"eventCreatedOn":1}"#;
        let event = ChangeEvent::parse(line).unwrap();
        assert_eq!(event.kind, "change-merged");
        assert_eq!(event.change.url, "http://review/c/app/+/12");
        assert_eq!(event.bug_ids(), vec!["5"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(ChangeEvent::parse("not json"), Err(Error::Decode(_))));
        assert!(matches!(ChangeEvent::parse(r#"{"change":{}}"#), Err(Error::Decode(_))));
    }

    #[test]
    fn test_annotation_note() {
        let event = ChangeEvent {
            kind: "patchset-created".to_string(),
            change: Change {
                url: "http://review/c/app/+/3".to_string(),
                commit_message: "Title\n\nBug-Id: 42".to_string(),
            },
        };
        let annotations = event.annotations();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].ticket, "42");
        assert_eq!(
            annotations[0].note,
            "patchset-created http://review/c/app/+/3\n\n    Title\n    \n    Bug-Id: 42"
        );
    }
}
