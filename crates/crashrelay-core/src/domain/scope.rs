//! Scope: contextual data merged into outgoing events
//!
//! Subordinate processes send partial [`ScopeUpdate`]s; the coordinator
//! folds them into a single [`Scope`] and persists a [`ScopeSnapshot`] so a
//! crash found on the next launch can be reported with the context that
//! existed before it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::Attachment;

/// Default breadcrumb bound
pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

/// Attachment as carried in a scope update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAttachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "attachmentType")]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

impl From<ScopeAttachment> for Attachment {
    fn from(a: ScopeAttachment) -> Self {
        Attachment {
            filename: a.filename,
            content_type: a.content_type,
            attachment_type: a.attachment_type,
            data: a.data.into_bytes(),
        }
    }
}

/// Partial scope sent by a subordinate process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeUpdate {
    #[serde(default)]
    pub user: Option<Map<String, Value>>,
    #[serde(default)]
    pub tags: Option<Map<String, Value>>,
    #[serde(default)]
    pub extra: Option<Map<String, Value>>,
    #[serde(default)]
    pub breadcrumbs: Vec<Value>,
    #[serde(default)]
    pub attachments: Vec<ScopeAttachment>,
}

/// Merged scope owned by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Map<String, Value>>,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub contexts: Map<String, Value>,
    #[serde(default)]
    pub breadcrumbs: Vec<Value>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

impl Scope {
    /// Folds a subordinate update into this scope.
    ///
    /// Empty `user`/`tags`/`extra` maps are ignored. Only the most recent
    /// breadcrumb of the update is appended; the list is then trimmed from the
    /// front to `max_breadcrumbs`.
    pub fn apply_update(&mut self, update: ScopeUpdate, max_breadcrumbs: usize) {
        if let Some(user) = update.user.filter(|u| !u.is_empty()) {
            self.user = Some(user);
        }
        if let Some(tags) = update.tags.filter(|t| !t.is_empty()) {
            self.tags.extend(tags);
        }
        if let Some(extra) = update.extra.filter(|e| !e.is_empty()) {
            self.extra.extend(extra);
        }
        self.attachments
            .extend(update.attachments.into_iter().map(Attachment::from));

        if let Some(breadcrumb) = update.breadcrumbs.into_iter().last() {
            self.add_breadcrumb(breadcrumb, max_breadcrumbs);
        }
    }

    /// Appends a breadcrumb, dropping the oldest beyond `max`
    pub fn add_breadcrumb(&mut self, breadcrumb: Value, max: usize) {
        if max == 0 {
            return;
        }
        self.breadcrumbs.push(breadcrumb);
        if self.breadcrumbs.len() > max {
            let excess = self.breadcrumbs.len() - max;
            self.breadcrumbs.drain(..excess);
        }
    }

    /// Merges this scope into an event. Values already on the event win.
    pub fn apply_to_event(&self, event: &mut Value) {
        let Some(obj) = event.as_object_mut() else {
            return;
        };

        if let Some(user) = &self.user {
            obj.entry("user")
                .or_insert_with(|| Value::Object(user.clone()));
        }
        merge_under(obj, "tags", &self.tags);
        merge_under(obj, "extra", &self.extra);
        merge_under(obj, "contexts", &self.contexts);

        if !self.breadcrumbs.is_empty() {
            let entry = obj
                .entry("breadcrumbs")
                .or_insert_with(|| Value::Array(Vec::new()));
            // Events may carry `{"values": [...]}` or a bare array
            let list = match entry {
                Value::Object(map) => map
                    .entry("values")
                    .or_insert_with(|| Value::Array(Vec::new())),
                other => other,
            };
            if let Value::Array(existing) = list {
                let mut merged = self.breadcrumbs.clone();
                merged.append(existing);
                *existing = merged;
            }
        }
    }
}

/// Inserts every key of `source` into `obj[key]` that is not already present
fn merge_under(obj: &mut Map<String, Value>, key: &str, source: &Map<String, Value>) {
    if source.is_empty() {
        return;
    }
    let target = obj
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(target) = target {
        for (k, v) in source {
            target.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Scope plus the release identity of the run that produced it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ScopeSnapshot {
    /// Applies the snapshot to an event, overriding release and environment
    pub fn apply_to_event(&self, event: &mut Value) {
        self.scope.apply_to_event(event);
        if let Some(obj) = event.as_object_mut() {
            if let Some(release) = &self.release {
                obj.insert("release".into(), Value::String(release.clone()));
            }
            if let Some(environment) = &self.environment {
                obj.insert("environment".into(), Value::String(environment.clone()));
            }
        }
    }
}
