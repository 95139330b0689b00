use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::access;
use super::migrate::migrate_canvas;
use super::models::{new_id, Canvas, CanvasPatch, CanvasState, Frame, FrameFilter, FramePatch, NewFrame};
use super::{document_file, DocumentStore, CANVASES_DIR, LEGACY_FRAMES_DIR};
use crate::error::{Result, WorkspaceError};

impl DocumentStore {
    /// Canvases of a project, oldest first.
    pub async fn list_canvases(&self, project_id: &str) -> Result<Vec<Canvas>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(Vec::new());
        };
        self.read_canvases(&dir).await
    }

    pub async fn get_canvas(&self, project_id: &str, canvas_id: &str) -> Result<Option<Canvas>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(None);
        };
        let path = document_file(&dir.join(CANVASES_DIR), canvas_id)?;
        self.load_canvas(&dir, &path).await
    }

    pub async fn create_canvas(&self, project_id: &str, name: &str) -> Result<Canvas> {
        let dir = self.require_project_dir(project_id).await?;
        let now = Utc::now();
        let canvas = Canvas {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.trim().to_string(),
            created_at: now,
            updated_at: now,
            frames: Vec::new(),
            state: CanvasState::default(),
        };
        self.write_canvas(&dir, &canvas).await?;
        Ok(canvas)
    }

    pub async fn update_canvas(&self, project_id: &str, canvas_id: &str, patch: CanvasPatch) -> Result<Canvas> {
        let dir = self.require_project_dir(project_id).await?;
        let mut canvas = self.require_canvas(&dir, canvas_id).await?;
        if let Some(name) = patch.name {
            canvas.name = name.trim().to_string();
        }
        if let Some(state) = patch.state {
            canvas.state = state;
        }
        canvas.updated_at = Utc::now();
        self.write_canvas(&dir, &canvas).await?;
        Ok(canvas)
    }

    /// Delete a canvas together with its frames.
    pub async fn delete_canvas(&self, project_id: &str, canvas_id: &str) -> Result<bool> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(false);
        };
        let path = document_file(&dir.join(CANVASES_DIR), canvas_id)?;
        Ok(access::remove_file(&path).await?)
    }

    /// Frames across the project's canvases, oldest first.
    pub async fn list_frames(&self, project_id: &str, filter: &FrameFilter) -> Result<Vec<Frame>> {
        let mut frames: Vec<Frame> = self
            .list_canvases(project_id)
            .await?
            .into_iter()
            .filter(|c| filter.canvas_id.as_deref().map_or(true, |id| c.id == id))
            .flat_map(|c| c.frames)
            .filter(|f| filter.branch_id.as_deref().map_or(true, |id| f.branch_id == id))
            .collect();
        frames.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(frames)
    }

    pub async fn get_frame(&self, project_id: &str, frame_id: &str) -> Result<Option<Frame>> {
        Ok(self
            .list_canvases(project_id)
            .await?
            .into_iter()
            .flat_map(|c| c.frames)
            .find(|f| f.id == frame_id))
    }

    /// Place a frame on a canvas. Both the canvas and the branch must exist.
    pub async fn create_frame(&self, project_id: &str, input: NewFrame) -> Result<Frame> {
        let dir = self.require_project_dir(project_id).await?;
        let mut canvas = self.require_canvas(&dir, &input.canvas_id).await?;
        self.require_branch(&dir, &input.branch_id).await?;

        let taken = self.frame_ids(&dir).await?;
        let now = Utc::now();
        let frame = Frame {
            id: unused_frame_id(&taken),
            project_id: project_id.to_string(),
            canvas_id: canvas.id.clone(),
            branch_id: input.branch_id,
            name: input.name,
            position: input.position,
            dimension: input.dimension,
            url: input.url,
            created_at: now,
            updated_at: now,
        };
        canvas.frames.push(frame.clone());
        canvas.updated_at = now;
        self.write_canvas(&dir, &canvas).await?;
        Ok(frame)
    }

    pub async fn update_frame(&self, project_id: &str, frame_id: &str, patch: FramePatch) -> Result<Frame> {
        let dir = self.require_project_dir(project_id).await?;
        let (mut canvas, index) = self
            .find_frame(&dir, frame_id)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("frame", frame_id))?;
        if let Some(branch_id) = &patch.branch_id {
            self.require_branch(&dir, branch_id).await?;
        }

        let now = Utc::now();
        let frame = &mut canvas.frames[index];
        if let Some(name) = patch.name {
            frame.name = name;
        }
        if let Some(position) = patch.position {
            frame.position = position;
        }
        if let Some(dimension) = patch.dimension {
            frame.dimension = dimension;
        }
        if let Some(url) = patch.url {
            frame.url = url;
        }
        if let Some(branch_id) = patch.branch_id {
            frame.branch_id = branch_id;
        }
        frame.updated_at = now;
        let updated = frame.clone();

        canvas.updated_at = now;
        self.write_canvas(&dir, &canvas).await?;
        Ok(updated)
    }

    pub async fn delete_frame(&self, project_id: &str, frame_id: &str) -> Result<bool> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(false);
        };
        let Some((mut canvas, index)) = self.find_frame(&dir, frame_id).await? else {
            return Ok(false);
        };
        canvas.frames.remove(index);
        canvas.updated_at = Utc::now();
        self.write_canvas(&dir, &canvas).await?;
        Ok(true)
    }

    /// Drop every frame placed on `branch_id`; returns how many were removed.
    pub(crate) async fn remove_branch_frames(&self, project_dir: &Path, branch_id: &str) -> Result<usize> {
        let mut removed = 0;
        for mut canvas in self.read_canvases(project_dir).await? {
            let before = canvas.frames.len();
            canvas.frames.retain(|f| f.branch_id != branch_id);
            let dropped = before - canvas.frames.len();
            if dropped > 0 {
                canvas.updated_at = Utc::now();
                self.write_canvas(project_dir, &canvas).await?;
                removed += dropped;
            }
        }
        Ok(removed)
    }

    /// Ids of every frame embedded in the project's canvas files. Read straight
    /// from disk so that no legacy adoption is triggered.
    async fn frame_ids(&self, project_dir: &Path) -> Result<HashSet<String>> {
        let canvases = self
            .load_documents(&project_dir.join(CANVASES_DIR), "canvas", migrate_canvas)
            .await?;
        Ok(canvases.into_iter().flat_map(|c| c.frames).map(|f| f.id).collect())
    }

    async fn read_canvases(&self, project_dir: &Path) -> Result<Vec<Canvas>> {
        let mut canvases = Vec::new();
        for entry in access::read_dir(&project_dir.join(CANVASES_DIR)).await? {
            if entry.is_dir || entry.name.starts_with('.') || !entry.name.ends_with(".json") {
                continue;
            }
            if let Some(canvas) = self.load_canvas(project_dir, &entry.path).await? {
                canvases.push(canvas);
            }
        }
        canvases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(canvases)
    }

    async fn load_canvas(&self, project_dir: &Path, path: &Path) -> Result<Option<Canvas>> {
        let Some(mut canvas) = self.load_document(path, "canvas", migrate_canvas).await? else {
            return Ok(None);
        };
        if canvas.frames.is_empty() {
            self.adopt_legacy_frames(project_dir, &mut canvas).await?;
        }
        Ok(Some(canvas))
    }

    /// Move frames stored as separate files under the project's legacy `frames/`
    /// directory into `canvas`. The canvas is written before the old files go away.
    async fn adopt_legacy_frames(&self, project_dir: &Path, canvas: &mut Canvas) -> Result<()> {
        let legacy_dir = project_dir.join(LEGACY_FRAMES_DIR);
        let entries = access::read_dir(&legacy_dir).await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut taken = self.frame_ids(project_dir).await?;
        let mut default_branch: Option<String> = None;
        let mut adopted: Vec<PathBuf> = Vec::new();
        for entry in entries {
            if entry.is_dir || !entry.name.ends_with(".json") {
                continue;
            }
            let Some(bytes) = access::read_optional(&entry.path).await? else {
                continue;
            };
            let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&bytes) else {
                tracing::warn!("skipping unreadable legacy frame {}", entry.path.display());
                continue;
            };
            if object.get("canvasId").and_then(Value::as_str) != Some(canvas.id.as_str()) {
                continue;
            }

            if !object.get("branchId").is_some_and(Value::is_string) {
                let branch_id = match &default_branch {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.ensure_default_branch(&canvas.project_id).await?.id;
                        default_branch = Some(id.clone());
                        id
                    }
                };
                object.insert("branchId".to_string(), json!(branch_id));
            }
            let now = json!(Utc::now());
            object.insert("projectId".to_string(), json!(canvas.project_id));
            object.entry("name").or_insert_with(|| json!("Frame"));
            object.entry("position").or_insert_with(|| json!({ "x": 0.0, "y": 0.0 }));
            object.entry("dimension").or_insert_with(|| json!({ "width": 1536.0, "height": 960.0 }));
            object.entry("url").or_insert_with(|| json!(""));
            object.entry("createdAt").or_insert_with(|| now.clone());
            object.entry("updatedAt").or_insert(now);

            match serde_json::from_value::<Frame>(Value::Object(object)) {
                Ok(mut frame) => {
                    if !taken.insert(frame.id.clone()) {
                        let id = unused_frame_id(&taken);
                        tracing::warn!(old = %frame.id, new = %id, "legacy frame id already in use; reassigned");
                        taken.insert(id.clone());
                        frame.id = id;
                    }
                    canvas.frames.push(frame);
                    adopted.push(entry.path);
                }
                Err(err) => tracing::warn!("skipping legacy frame {}: {err}", entry.path.display()),
            }
        }
        if adopted.is_empty() {
            return Ok(());
        }

        canvas.frames.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let canvas_path = document_file(&project_dir.join(CANVASES_DIR), &canvas.id)?;
        self.write_json(&canvas_path, &*canvas).await?;
        for path in &adopted {
            access::remove_file(path).await?;
        }
        if access::read_dir(&legacy_dir).await?.is_empty() {
            if let Err(err) = access::remove_dir(&legacy_dir).await {
                tracing::debug!("keeping legacy frames dir: {err}");
            }
        }
        tracing::info!(
            canvas_id = %canvas.id,
            frames = adopted.len(),
            "moved legacy frames into canvas"
        );
        Ok(())
    }

    async fn require_canvas(&self, project_dir: &Path, canvas_id: &str) -> Result<Canvas> {
        let path = document_file(&project_dir.join(CANVASES_DIR), canvas_id)?;
        self.load_canvas(project_dir, &path)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("canvas", canvas_id))
    }

    async fn require_branch(&self, project_dir: &Path, branch_id: &str) -> Result<()> {
        let known = self
            .read_branches(project_dir)
            .await?
            .iter()
            .any(|b| b.id == branch_id);
        if known {
            Ok(())
        } else {
            Err(WorkspaceError::not_found("branch", branch_id))
        }
    }

    /// The canvas holding `frame_id` and the frame's index within it.
    async fn find_frame(&self, project_dir: &Path, frame_id: &str) -> Result<Option<(Canvas, usize)>> {
        for canvas in self.read_canvases(project_dir).await? {
            if let Some(index) = canvas.frames.iter().position(|f| f.id == frame_id) {
                return Ok(Some((canvas, index)));
            }
        }
        Ok(None)
    }

    async fn write_canvas(&self, project_dir: &Path, canvas: &Canvas) -> Result<()> {
        let path = document_file(&project_dir.join(CANVASES_DIR), &canvas.id)?;
        self.write_json(&path, canvas).await
    }
}

fn unused_frame_id(taken: &HashSet<String>) -> String {
    let mut id = new_id();
    while taken.contains(&id) {
        id = new_id();
    }
    id
}
