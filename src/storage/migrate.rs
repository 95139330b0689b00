//! Version dispatch for documents read from disk.
//!
//! Each reader looks at the stored `version` and routes the raw JSON through the
//! matching upgrade path. Anything that had to be upgraded is reported as such so
//! the store can write the normalized form back before returning it.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::models::{Branch, Canvas, Conversation, Project, CONVERSATION_VERSION, PROJECT_VERSION};

#[derive(Debug)]
pub enum Migrated<T> {
    Current(T),
    Upgraded(T),
}

impl<T> Migrated<T> {
    pub fn was_upgraded(&self) -> bool {
        matches!(self, Migrated::Upgraded(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Migrated::Current(doc) | Migrated::Upgraded(doc) => doc,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("{kind} document is not a JSON object")]
    NotAnObject { kind: &'static str },

    #[error("malformed {kind} document: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} document has version {found}, newer than supported version {supported}")]
    Unsupported {
        kind: &'static str,
        found: u64,
        supported: u32,
    },
}

fn stored_version(kind: &'static str, value: &Value) -> Result<Option<u64>, MigrationError> {
    let object = value.as_object().ok_or(MigrationError::NotAnObject { kind })?;
    Ok(object.get("version").and_then(Value::as_u64))
}

fn object_mut<'a>(kind: &'static str, value: &'a mut Value) -> Result<&'a mut Map<String, Value>, MigrationError> {
    value.as_object_mut().ok_or(MigrationError::NotAnObject { kind })
}

fn decode<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, MigrationError> {
    serde_json::from_value(value).map_err(|source| MigrationError::Malformed { kind, source })
}

fn now_value() -> Value {
    json!(Utc::now())
}

/// Insert `key` when absent; returns true when something was added.
fn fill(object: &mut Map<String, Value>, key: &str, value: impl FnOnce() -> Value) -> bool {
    if object.contains_key(key) && !object[key].is_null() {
        return false;
    }
    object.insert(key.to_string(), value());
    true
}

pub fn migrate_project(mut value: Value) -> Result<Migrated<Project>, MigrationError> {
    const KIND: &str = "project";
    match stored_version(KIND, &value)? {
        None | Some(0) => {
            upgrade_project_v0(object_mut(KIND, &mut value)?);
            Ok(Migrated::Upgraded(decode(KIND, value)?))
        }
        Some(v) if v == u64::from(PROJECT_VERSION) => {
            let object = object_mut(KIND, &mut value)?;
            let mut upgraded = fill(object, "tags", || json!([]));
            let brand_time = object.get("updatedAt").cloned().unwrap_or_else(now_value);
            upgraded |= fill(object, "brand", || {
                json!({ "colors": [], "fonts": [], "updatedAt": brand_time })
            });
            let project = decode(KIND, value)?;
            Ok(if upgraded {
                Migrated::Upgraded(project)
            } else {
                Migrated::Current(project)
            })
        }
        Some(found) => Err(MigrationError::Unsupported {
            kind: KIND,
            found,
            supported: PROJECT_VERSION,
        }),
    }
}

/// Unversioned projects nested preview and sandbox data and had no brand or tags.
fn upgrade_project_v0(object: &mut Map<String, Value>) {
    fill(object, "createdAt", now_value);
    let created = object["createdAt"].clone();
    fill(object, "updatedAt", || created);

    if let Some(Value::Object(preview)) = object.remove("previewImg") {
        if let Some(url) = preview.get("url").filter(|v| v.is_string()) {
            fill(object, "previewImgUrl", || url.clone());
        }
        if let Some(path) = preview.get("storagePath").filter(|v| v.is_string()) {
            fill(object, "previewImgPath", || path.clone());
        }
    }
    if let Some(Value::Object(sandbox)) = object.remove("sandbox") {
        if let Some(id) = sandbox.get("id").filter(|v| v.is_string()) {
            fill(object, "sandboxId", || id.clone());
        }
        if let Some(url) = sandbox.get("url").filter(|v| v.is_string()) {
            fill(object, "sandboxUrl", || url.clone());
        }
    }

    fill(object, "tags", || json!([]));
    let brand_time = object["updatedAt"].clone();
    fill(object, "brand", || {
        json!({ "colors": [], "fonts": [], "updatedAt": brand_time })
    });
    object.insert("version".to_string(), json!(PROJECT_VERSION));
}

pub fn migrate_conversation(mut value: Value) -> Result<Migrated<Conversation>, MigrationError> {
    const KIND: &str = "conversation";
    match stored_version(KIND, &value)? {
        None | Some(0) => {
            upgrade_conversation_v0(object_mut(KIND, &mut value)?);
            Ok(Migrated::Upgraded(decode(KIND, value)?))
        }
        Some(v) if v == u64::from(CONVERSATION_VERSION) => {
            let object = object_mut(KIND, &mut value)?;
            let upgraded = fill(object, "suggestions", || json!([]));
            let conversation = decode(KIND, value)?;
            Ok(if upgraded {
                Migrated::Upgraded(conversation)
            } else {
                Migrated::Current(conversation)
            })
        }
        Some(found) => Err(MigrationError::Unsupported {
            kind: KIND,
            found,
            supported: CONVERSATION_VERSION,
        }),
    }
}

/// Unversioned conversations used `displayName`, had no suggestions, and stored
/// messages without a back-reference or structured parts.
fn upgrade_conversation_v0(object: &mut Map<String, Value>) {
    if let Some(display_name) = object.remove("displayName") {
        if display_name.is_string() {
            fill(object, "title", || display_name);
        }
    }
    fill(object, "createdAt", now_value);
    let created = object["createdAt"].clone();
    fill(object, "updatedAt", || created.clone());
    fill(object, "suggestions", || json!([]));

    let conversation_id = object.get("id").cloned().unwrap_or(Value::Null);
    if let Some(Value::Array(messages)) = object.get_mut("messages") {
        for message in messages.iter_mut() {
            let Some(message) = message.as_object_mut() else {
                continue;
            };
            fill(message, "conversationId", || conversation_id.clone());
            fill(message, "createdAt", || created.clone());
            fill(message, "context", || json!([]));
            fill(message, "checkpoints", || json!([]));
            let has_parts = message
                .get("parts")
                .and_then(Value::as_array)
                .is_some_and(|parts| !parts.is_empty());
            if !has_parts {
                let text = message.get("content").cloned().unwrap_or_else(|| json!(""));
                message.insert("parts".to_string(), json!([{ "type": "text", "text": text }]));
            }
        }
    } else {
        object.insert("messages".to_string(), json!([]));
    }
    object.insert("version".to_string(), json!(CONVERSATION_VERSION));
}

/// Canvases are unversioned; older ones lack `state` and stored frames elsewhere.
pub fn migrate_canvas(mut value: Value) -> Result<Migrated<Canvas>, MigrationError> {
    const KIND: &str = "canvas";
    let object = object_mut(KIND, &mut value)?;
    let mut upgraded = fill(object, "frames", || json!([]));
    upgraded |= fill(object, "state", || json!({ "scale": 1.0, "position": { "x": 0.0, "y": 0.0 } }));
    let canvas = decode(KIND, value)?;
    Ok(if upgraded {
        Migrated::Upgraded(canvas)
    } else {
        Migrated::Current(canvas)
    })
}

/// Branches have a single stored shape.
pub fn migrate_branch(value: Value) -> Result<Migrated<Branch>, MigrationError> {
    decode("branch", value).map(Migrated::Current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_project_is_flattened_and_versioned() {
        let legacy = json!({
            "id": "p1",
            "name": "Demo",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z",
            "previewImg": { "type": "storage", "storagePath": "previews/p1.png" },
            "sandbox": { "id": "sb-1", "url": "http://localhost:3000" }
        });
        let migrated = migrate_project(legacy).expect("legacy project should migrate");
        assert!(migrated.was_upgraded());
        let project = migrated.into_inner();
        assert_eq!(project.version, PROJECT_VERSION);
        assert_eq!(project.preview_img_path.as_deref(), Some("previews/p1.png"));
        assert_eq!(project.sandbox_id.as_deref(), Some("sb-1"));
        assert!(project.tags.is_empty());
        assert_eq!(project.brand.updated_at, project.updated_at);
    }

    #[test]
    fn current_project_is_not_rewritten() {
        let current = json!({
            "id": "p1",
            "name": "Demo",
            "tags": ["web"],
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-02T00:00:00Z",
            "version": 1,
            "brand": { "colors": [], "fonts": [], "updatedAt": "2024-01-02T00:00:00Z" }
        });
        assert!(!migrate_project(current).expect("current project").was_upgraded());
    }

    #[test]
    fn legacy_conversation_gets_title_and_parts() {
        let legacy = json!({
            "id": "c1",
            "projectId": "p1",
            "displayName": "Landing page",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
            "messages": [
                { "id": "m1", "role": "user", "content": "make it blue", "createdAt": "2024-01-01T00:00:01Z" }
            ]
        });
        let conversation = migrate_conversation(legacy)
            .expect("legacy conversation should migrate")
            .into_inner();
        assert_eq!(conversation.title.as_deref(), Some("Landing page"));
        assert_eq!(conversation.version, CONVERSATION_VERSION);
        assert_eq!(conversation.messages[0].conversation_id, "c1");
        assert_eq!(conversation.messages[0].parts[0]["text"], "make it blue");
    }

    #[test]
    fn newer_versions_are_rejected() {
        let future = json!({ "id": "c1", "version": 99 });
        let err = migrate_conversation(future).expect_err("newer version should be rejected");
        assert!(matches!(err, MigrationError::Unsupported { found: 99, .. }));
    }

    #[test]
    fn shape_errors_are_malformed() {
        let broken = json!({ "id": "p1", "version": 1, "name": 42 });
        assert!(matches!(
            migrate_project(broken),
            Err(MigrationError::Malformed { .. })
        ));
    }
}
