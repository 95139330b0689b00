use chrono::Utc;
use std::path::Path;

use super::access;
use super::migrate::migrate_project;
use super::models::{new_id, Brand, NewProject, Project, ProjectPatch, PROJECT_VERSION};
use super::{DocumentStore, META_FILE, PREVIEWS_DIR};
use crate::error::{Result, WorkspaceError};

impl DocumentStore {
    /// Create a project folder named after the project, its standard layout, its
    /// `meta.json` and a default branch.
    pub async fn create_project(&self, input: NewProject) -> Result<Project> {
        self.ensure_root().await?;
        let name = input.name.trim().to_string();
        let dir = self.unique_project_dir(&name, None).await;
        access::create_dir_all(&dir).await?;

        let now = Utc::now();
        let project = Project {
            id: new_id(),
            name,
            description: input.description,
            tags: input.tags,
            created_at: now,
            updated_at: now,
            preview_img_url: None,
            preview_img_path: None,
            sandbox_id: None,
            sandbox_url: None,
            version: PROJECT_VERSION,
            brand: Brand {
                colors: Vec::new(),
                fonts: Vec::new(),
                updated_at: now,
            },
        };
        self.write_json(&dir.join(META_FILE), &project).await?;
        self.ensure_project_structure(&dir).await?;
        self.index_insert(&project.id, dir.clone());
        self.ensure_default_branch(&project.id).await?;

        tracing::info!(project_id = %project.id, dir = %dir.display(), "created project");
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let Some(dir) = self.resolve_project_dir(project_id).await? else {
            return Ok(None);
        };
        self.ensure_project_structure(&dir).await?;
        self.read_project_meta(&dir).await
    }

    /// All projects under the root, most recently updated first. Also refreshes
    /// the id -> directory index.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let found = self.scan_projects().await?;
        let mut projects = Vec::with_capacity(found.len());
        for (dir, project) in found {
            self.ensure_project_structure(&dir).await?;
            self.index_insert(&project.id, dir);
            projects.push(project);
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    /// Apply `patch`. A name change moves the project folder to the matching
    /// (unique) directory name.
    pub async fn update_project(&self, project_id: &str, patch: ProjectPatch) -> Result<Project> {
        let mut dir = self.require_project_dir(project_id).await?;
        let mut project = self
            .read_project_meta(&dir)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("project", project_id))?;
        let now = Utc::now();

        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name != project.name {
                let target = self.unique_project_dir(&name, Some(&dir)).await;
                if target != dir {
                    access::rename(&dir, &target).await?;
                    tracing::info!(
                        project_id,
                        from = %dir.display(),
                        to = %target.display(),
                        "moved project folder"
                    );
                    self.index_insert(project_id, target.clone());
                    dir = target;
                }
                project.name = name;
            }
        }
        if let Some(description) = patch.description {
            project.description = Some(description);
        }
        if let Some(tags) = patch.tags {
            project.tags = tags;
        }
        if let Some(url) = patch.preview_img_url {
            project.preview_img_url = Some(url);
        }
        if let Some(path) = patch.preview_img_path {
            project.preview_img_path = Some(path);
        }
        if let Some(sandbox_id) = patch.sandbox_id {
            project.sandbox_id = Some(sandbox_id);
        }
        if let Some(sandbox_url) = patch.sandbox_url {
            project.sandbox_url = Some(sandbox_url);
        }
        if patch.brand_colors.is_some() || patch.brand_fonts.is_some() {
            if let Some(colors) = patch.brand_colors {
                project.brand.colors = colors;
            }
            if let Some(fonts) = patch.brand_fonts {
                project.brand.fonts = fonts;
            }
            project.brand.updated_at = now;
        }
        project.updated_at = now;

        self.write_json(&dir.join(META_FILE), &project).await?;
        Ok(project)
    }

    /// Remove the whole project folder. Returns `false` when the project is unknown.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let Some(dir) = self.resolve_project_dir(project_id).await? else {
            return Ok(false);
        };
        access::remove_dir_all(&dir).await?;
        self.index_remove(project_id);
        tracing::info!(project_id, dir = %dir.display(), "deleted project");
        Ok(true)
    }

    /// Store a preview image under `previews/` and point the project at it.
    pub async fn save_preview_image(&self, project_id: &str, bytes: &[u8], extension: &str) -> Result<Project> {
        let extension: String = extension
            .trim_start_matches('.')
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();
        let extension = if extension.is_empty() { "png".to_string() } else { extension };

        let dir = self.require_project_dir(project_id).await?;
        let relative = format!("{PREVIEWS_DIR}/preview.{extension}");
        access::write_atomic(&dir.join(PREVIEWS_DIR).join(format!("preview.{extension}")), bytes).await?;

        self.update_project(
            project_id,
            ProjectPatch {
                preview_img_path: Some(relative),
                ..ProjectPatch::default()
            },
        )
        .await
    }

    pub(crate) async fn read_project_meta(&self, dir: &Path) -> Result<Option<Project>> {
        self.load_document(&dir.join(META_FILE), "project", migrate_project)
            .await
    }
}
