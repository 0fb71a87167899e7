//! Event and log shaping helpers
//!
//! Events travel through the pipeline as `serde_json::Value` objects; these
//! helpers add the coordinator's identity and the crash context fields that
//! the ingestion service indexes.

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::envelope::{Envelope, EnvelopeHeader, EnvelopeItem};
use super::newtypes::EventId;

/// SDK name reported on logs and events produced by the coordinator
pub const SDK_NAME: &str = "crashrelay";

/// SDK version reported on logs and events produced by the coordinator
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Release identity stamped onto outgoing telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub release: Option<String>,
    pub environment: Option<String>,
}

impl ReleaseInfo {
    /// Fills `release`/`environment` on an event where they are absent
    pub fn apply_to_event(&self, event: &mut Value) {
        let Some(obj) = event.as_object_mut() else {
            return;
        };
        if let Some(release) = &self.release {
            obj.entry("release")
                .or_insert_with(|| Value::String(release.clone()));
        }
        if let Some(environment) = &self.environment {
            obj.entry("environment")
                .or_insert_with(|| Value::String(environment.clone()));
        }
    }
}

/// Builds the `fatal` native-platform event sent alongside a minidump
pub fn native_crash_event(process: &str, exit_reason: Option<&str>, crashed_url: Option<&str>) -> Value {
    let mut tags = Map::new();
    tags.insert("event.environment".into(), json!("native"));
    tags.insert("event.process".into(), json!(process));
    tags.insert("event_type".into(), json!("native"));
    if let Some(reason) = exit_reason {
        tags.insert("exit.reason".into(), json!(reason));
    }

    let mut electron = Map::new();
    electron.insert("crashed_process".into(), json!(process));
    if let Some(url) = crashed_url {
        electron.insert("crashed_url".into(), json!(url));
    }

    json!({
        "event_id": EventId::new().to_string(),
        "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
        "level": "fatal",
        "platform": "native",
        "tags": tags,
        "contexts": { "electron": electron },
    })
}

/// Builds the event reported when a process stops answering status checks
pub fn anr_event(process: &str, blocked_ms: u64) -> Value {
    json!({
        "event_id": EventId::new().to_string(),
        "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
        "level": "error",
        "exception": {
            "values": [{
                "type": "ApplicationNotResponding",
                "value": format!("Application Not Responding for at least {blocked_ms} ms"),
                "mechanism": { "type": "ANR" },
            }],
        },
        "tags": { "event.process": process },
    })
}

/// Reads the `event.process` tag of an event
pub fn event_process(event: &Value) -> Option<&str> {
    event.pointer("/tags/event.process").and_then(Value::as_str)
}

/// Prepares an event received from a subordinate process.
///
/// Strips environment and SDK identity so the coordinator's values win,
/// tags the event with the process name, and adds the crash context when the
/// event carries an exception.
pub fn prepare_subordinate_event(event: &mut Value, process: &str, url: Option<&str>) {
    let Some(obj) = event.as_object_mut() else {
        return;
    };
    obj.remove("environment");
    obj.remove("sdk");
    obj.remove("sdkProcessingMetadata");

    let tags = obj
        .entry("tags")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(tags) = tags {
        tags.insert("event.process".into(), json!(process));
    }

    if obj.contains_key("exception") {
        let contexts = obj
            .entry("contexts")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(contexts) = contexts {
            let mut electron = Map::new();
            electron.insert("crashed_process".into(), json!(process));
            if let Some(url) = url {
                electron.insert("crashed_url".into(), json!(url));
            }
            contexts.insert("electron".into(), Value::Object(electron));
        }
    }
}

/// Adds release and SDK attributes to a structured log record
pub fn enrich_log(log: &mut Value, release: &ReleaseInfo) {
    let Some(obj) = log.as_object_mut() else {
        return;
    };
    let attributes = obj
        .entry("attributes")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(attributes) = attributes else {
        return;
    };

    let string_attr = |v: &str| json!({ "value": v, "type": "string" });
    if let Some(r) = &release.release {
        attributes.insert("sentry.release".into(), string_attr(r));
    }
    if let Some(e) = &release.environment {
        attributes.insert("sentry.environment".into(), string_attr(e));
    }
    attributes.insert("sentry.sdk.name".into(), string_attr(SDK_NAME));
    attributes.insert("sentry.sdk.version".into(), string_attr(SDK_VERSION));
}

/// Wraps log records into a single `log` envelope item
pub fn log_envelope(logs: Vec<Value>) -> Envelope {
    let count = logs.len();
    let mut item = EnvelopeItem::json("log", json!({ "items": logs }));
    item.header.extra.insert("item_count".into(), json!(count));
    item.header.extra.insert(
        "content_type".into(),
        json!("application/vnd.sentry.items.log+json"),
    );

    let mut envelope = Envelope::new(EnvelopeHeader {
        sent_at: Some(Utc::now()),
        ..EnvelopeHeader::default()
    });
    envelope.add_item(item);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::ItemKind;

    #[test]
    fn test_native_crash_event_tags() {
        let event = native_crash_event("renderer", Some("crashed"), Some("app://index.html"));
        assert_eq!(event["level"], "fatal");
        assert_eq!(event["platform"], "native");
        assert_eq!(event["tags"]["event.environment"], "native");
        assert_eq!(event["tags"]["exit.reason"], "crashed");
        assert_eq!(event["contexts"]["electron"]["crashed_url"], "app://index.html");
        assert_eq!(event_process(&event), Some("renderer"));
    }

    #[test]
    fn test_anr_event() {
        let event = anr_event("renderer", 5000);
        assert_eq!(event["level"], "error");
        assert_eq!(event["exception"]["values"][0]["type"], "ApplicationNotResponding");
        assert_eq!(
            event["exception"]["values"][0]["value"],
            "Application Not Responding for at least 5000 ms"
        );
        assert_eq!(event["exception"]["values"][0]["mechanism"]["type"], "ANR");
        assert_eq!(event_process(&event), Some("renderer"));
    }

    #[test]
    fn test_prepare_subordinate_event_strips_identity() {
        let mut event = json!({
            "environment": "dev",
            "sdk": {"name": "js"},
            "exception": {"values": []}
        });
        prepare_subordinate_event(&mut event, "renderer", Some("app://main"));

        assert!(event.get("environment").is_none());
        assert!(event.get("sdk").is_none());
        assert_eq!(event["tags"]["event.process"], "renderer");
        assert_eq!(event["contexts"]["electron"]["crashed_process"], "renderer");
    }

    #[test]
    fn test_prepare_subordinate_event_without_exception() {
        let mut event = json!({"message": "hi"});
        prepare_subordinate_event(&mut event, "renderer", None);
        assert!(event.get("contexts").is_none());
    }

    #[test]
    fn test_release_info_does_not_override() {
        let info = ReleaseInfo {
            release: Some("app@2".into()),
            environment: Some("production".into()),
        };
        let mut event = json!({"release": "app@1"});
        info.apply_to_event(&mut event);
        assert_eq!(event["release"], "app@1");
        assert_eq!(event["environment"], "production");
    }

    #[test]
    fn test_enrich_log() {
        let info = ReleaseInfo {
            release: Some("app@1".into()),
            environment: None,
        };
        let mut log = json!({"body": "hello", "level": "info"});
        enrich_log(&mut log, &info);
        assert_eq!(log["attributes"]["sentry.release"]["value"], "app@1");
        assert_eq!(log["attributes"]["sentry.sdk.name"]["value"], SDK_NAME);
        assert!(log["attributes"].get("sentry.environment").is_none());
    }

    #[test]
    fn test_log_envelope() {
        let env = log_envelope(vec![json!({"body": "a"}), json!({"body": "b"})]);
        assert_eq!(env.items[0].kind(), ItemKind::Log);
        assert_eq!(env.items[0].header.extra["item_count"], 2);
    }
}
