//! Session and work-item data model shared by the engine.
//!
//! These types are the persisted contract between the engine, the session
//! store, and external observers. They carry no behavior beyond small
//! accessors; transitions live in [`crate::core::state_update`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run state of a session (and of the controller driving it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Error,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Error => "error",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the item's counterparty is already connected to the acting identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    Unknown,
    Related,
    Unrelated,
}

/// Status of one pipeline step on a work item.
///
/// `Pending` serializes as the empty string so stored records read as
/// "not yet attempted".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[default]
    #[serde(rename = "")]
    Pending,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "failed")]
    Failed,
}

impl StepStatus {
    pub fn is_pending(self) -> bool {
        self == StepStatus::Pending
    }
}

/// The four atomic steps, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Classify,
    Primary,
    Response,
    Secondary,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Classify => "classify",
            StepKind::Primary => "primary",
            StepKind::Response => "response",
            StepKind::Secondary => "secondary",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step failure counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepCounters {
    pub classify: u32,
    pub primary: u32,
    pub response: u32,
    pub secondary: u32,
}

impl StepCounters {
    pub fn get(&self, step: StepKind) -> u32 {
        match step {
            StepKind::Classify => self.classify,
            StepKind::Primary => self.primary,
            StepKind::Response => self.response,
            StepKind::Secondary => self.secondary,
        }
    }

    pub fn get_mut(&mut self, step: StepKind) -> &mut u32 {
        match step {
            StepKind::Classify => &mut self.classify,
            StepKind::Primary => &mut self.primary,
            StepKind::Response => &mut self.response,
            StepKind::Secondary => &mut self.secondary,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemTimestamps {
    pub queued_at: Option<DateTime<Utc>>,
    pub classified_at: Option<DateTime<Utc>>,
    pub primary_at: Option<DateTime<Utc>>,
    pub response_at: Option<DateTime<Utc>>,
    pub secondary_at: Option<DateTime<Utc>>,
}

impl ItemTimestamps {
    pub fn completion_mut(&mut self, step: StepKind) -> &mut Option<DateTime<Utc>> {
        match step {
            StepKind::Classify => &mut self.classified_at,
            StepKind::Primary => &mut self.primary_at,
            StepKind::Response => &mut self.response_at,
            StepKind::Secondary => &mut self.secondary_at,
        }
    }
}

/// One unit of engagement tracked through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Link to the counterparty's identity; the secondary step derives its
    /// target handle from it.
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub origin_relation: Relation,
    #[serde(default)]
    pub primary_status: StepStatus,
    #[serde(default)]
    pub response_status: StepStatus,
    #[serde(default)]
    pub secondary_status: StepStatus,
    #[serde(default)]
    pub attempts: StepCounters,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub timestamps: ItemTimestamps,
    #[serde(default)]
    pub generated_response: Option<String>,
    #[serde(default)]
    pub generated_secondary_message: Option<String>,
}

impl WorkItem {
    /// Fresh item with every step pending and the relation unknown.
    pub fn new(item_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Status of a status-bearing step. Classify has no status field; it is
    /// reported as pending until the relation is known.
    pub fn status(&self, step: StepKind) -> StepStatus {
        match step {
            StepKind::Classify => {
                if self.origin_relation == Relation::Unknown {
                    StepStatus::Pending
                } else {
                    StepStatus::Done
                }
            }
            StepKind::Primary => self.primary_status,
            StepKind::Response => self.response_status,
            StepKind::Secondary => self.secondary_status,
        }
    }

    pub(crate) fn status_mut(&mut self, step: StepKind) -> Option<&mut StepStatus> {
        match step {
            StepKind::Classify => None,
            StepKind::Primary => Some(&mut self.primary_status),
            StepKind::Response => Some(&mut self.response_status),
            StepKind::Secondary => Some(&mut self.secondary_status),
        }
    }
}

/// Persisted state for one engagement target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Text of the source the items were discovered on, offered to prompts.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub run_state: RunState,
    #[serde(default)]
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn item(&self, item_id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|item| item.item_id == item_id)
    }

    /// Append items whose ids are not yet present, stamping `queued_at`.
    ///
    /// Returns the number of items appended. Existing items are never
    /// replaced or reordered.
    pub fn append_items(&mut self, items: Vec<WorkItem>, now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for mut item in items {
            if self.item(&item.item_id).is_some() {
                continue;
            }
            if item.timestamps.queued_at.is_none() {
                item.timestamps.queued_at = Some(now);
            }
            self.items.push(item);
            added += 1;
        }
        added
    }
}

/// Derive a session id from a source URL.
///
/// Query string, fragment, and trailing slashes are dropped so the same
/// target always maps to the same session.
pub fn session_id_for_url(url: &str) -> String {
    let trimmed = url.trim();
    let end = trimmed.find(['?', '#']).unwrap_or(trimmed.len());
    trimmed[..end].trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_status_serializes_as_empty_string() {
        let item = WorkItem::new("c1", "hello");
        let value = serde_json::to_value(&item).expect("serialize");
        assert_eq!(value["primary_status"], "");
        assert_eq!(value["origin_relation"], "unknown");

        let parsed: StepStatus = serde_json::from_str("\"failed\"").expect("parse");
        assert_eq!(parsed, StepStatus::Failed);
    }

    #[test]
    fn append_items_skips_known_ids_and_keeps_order() {
        let now = Utc::now();
        let mut session = Session::new("s");
        session.append_items(vec![WorkItem::new("a", ""), WorkItem::new("b", "")], now);
        let added = session.append_items(
            vec![WorkItem::new("b", "dup"), WorkItem::new("c", "")],
            now,
        );

        assert_eq!(added, 1);
        let ids: Vec<&str> = session.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(session.items[1].content, "");
        assert_eq!(session.items[2].timestamps.queued_at, Some(now));
    }

    #[test]
    fn session_id_for_url_drops_query_and_trailing_slash() {
        assert_eq!(
            session_id_for_url("https://example.com/posts/42/?utm=x#top"),
            "https://example.com/posts/42"
        );
        assert_eq!(
            session_id_for_url(" https://example.com/posts/42 "),
            "https://example.com/posts/42"
        );
    }
}
