use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROJECT_VERSION: u32 = 1;
pub const CONVERSATION_VERSION: u32 = 1;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Brand {
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub fonts: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_img_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    pub version: u32,
    pub brand: Brand,
}

#[derive(Clone, Debug, Default)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

/// Partial project update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub preview_img_url: Option<String>,
    pub preview_img_path: Option<String>,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub brand_colors: Option<Vec<String>>,
    pub brand_fonts: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NewBranch {
    pub name: String,
    pub description: Option<String>,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub width: f64,
    pub height: f64,
}

impl Default for Dimension {
    fn default() -> Self {
        Self {
            width: 1536.0,
            height: 960.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanvasState {
    pub scale: f64,
    pub position: Position,
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            scale: 1.0,
            position: Position::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: String,
    pub project_id: String,
    pub canvas_id: String,
    pub branch_id: String,
    pub name: String,
    pub position: Position,
    pub dimension: Dimension,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct NewFrame {
    pub canvas_id: String,
    pub branch_id: String,
    pub name: String,
    pub position: Position,
    pub dimension: Dimension,
    pub url: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePatch {
    pub name: Option<String>,
    pub position: Option<Position>,
    pub dimension: Option<Dimension>,
    pub url: Option<String>,
    pub branch_id: Option<String>,
}

/// Restricts `list_frames`; unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct FrameFilter {
    pub canvas_id: Option<String>,
    pub branch_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub state: CanvasState,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasPatch {
    pub name: Option<String>,
    pub state: Option<CanvasState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context: Vec<Value>,
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default)]
    pub checkpoints: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_oid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub context: Vec<Value>,
    pub parts: Vec<Value>,
    pub checkpoints: Vec<Value>,
}

impl NewMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            parts: vec![serde_json::json!({ "type": "text", "text": content })],
            content,
            context: Vec::new(),
            checkpoints: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    pub content: Option<String>,
    pub parts: Option<Vec<Value>>,
    pub checkpoints: Option<Vec<Value>>,
    pub applied: Option<bool>,
    pub commit_oid: Option<String>,
    pub snapshots: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub suggestions: Vec<Value>,
    pub version: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub suggestions: Option<Vec<Value>>,
}
