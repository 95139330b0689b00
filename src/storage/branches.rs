use chrono::Utc;
use std::path::Path;

use super::access;
use super::migrate::migrate_branch;
use super::models::{new_id, Branch, BranchPatch, NewBranch};
use super::{document_file, DocumentStore, BRANCHES_DIR};
use crate::error::{Result, WorkspaceError};

pub const DEFAULT_BRANCH_NAME: &str = "main";

impl DocumentStore {
    /// Branches of a project, default first, then oldest first.
    pub async fn list_branches(&self, project_id: &str) -> Result<Vec<Branch>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(Vec::new());
        };
        self.read_branches(&dir).await
    }

    pub async fn get_branch(&self, project_id: &str, branch_id: &str) -> Result<Option<Branch>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(None);
        };
        let path = document_file(&dir.join(BRANCHES_DIR), branch_id)?;
        self.load_document(&path, "branch", migrate_branch).await
    }

    pub async fn get_default_branch(&self, project_id: &str) -> Result<Option<Branch>> {
        Ok(self.list_branches(project_id).await?.into_iter().next())
    }

    /// The project's default branch, creating `main` when the project has no
    /// branches and promoting the oldest one when none is marked default.
    pub async fn ensure_default_branch(&self, project_id: &str) -> Result<Branch> {
        let dir = self.require_project_dir(project_id).await?;
        if let Some(mut first) = self.read_branches(&dir).await?.into_iter().next() {
            if !first.is_default {
                first.is_default = true;
                first.updated_at = Utc::now();
                self.write_branch(&dir, &first).await?;
                tracing::info!(project_id, branch_id = %first.id, "promoted branch to default");
            }
            return Ok(first);
        }

        let now = Utc::now();
        let branch = Branch {
            id: new_id(),
            project_id: project_id.to_string(),
            name: DEFAULT_BRANCH_NAME.to_string(),
            description: None,
            is_default: true,
            created_at: now,
            updated_at: now,
            sandbox_id: None,
            sandbox_url: None,
        };
        self.write_branch(&dir, &branch).await?;
        Ok(branch)
    }

    /// Add a branch. The first branch of a project becomes its default.
    pub async fn create_branch(&self, project_id: &str, input: NewBranch) -> Result<Branch> {
        let dir = self.require_project_dir(project_id).await?;
        let name = input.name.trim();
        if name.is_empty() {
            return Err(WorkspaceError::Custom("branch name cannot be empty".to_string()));
        }
        let is_default = self.read_branches(&dir).await?.is_empty();

        let now = Utc::now();
        let branch = Branch {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: input.description,
            is_default,
            created_at: now,
            updated_at: now,
            sandbox_id: input.sandbox_id,
            sandbox_url: input.sandbox_url,
        };
        self.write_branch(&dir, &branch).await?;
        Ok(branch)
    }

    pub async fn update_branch(&self, project_id: &str, branch_id: &str, patch: BranchPatch) -> Result<Branch> {
        let dir = self.require_project_dir(project_id).await?;
        let path = document_file(&dir.join(BRANCHES_DIR), branch_id)?;
        let mut branch = self
            .load_document(&path, "branch", migrate_branch)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("branch", branch_id))?;

        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(WorkspaceError::Custom("branch name cannot be empty".to_string()));
            }
            branch.name = name.to_string();
        }
        if let Some(description) = patch.description {
            branch.description = Some(description);
        }
        if let Some(sandbox_id) = patch.sandbox_id {
            branch.sandbox_id = Some(sandbox_id);
        }
        if let Some(sandbox_url) = patch.sandbox_url {
            branch.sandbox_url = Some(sandbox_url);
        }
        branch.updated_at = Utc::now();
        self.write_json(&path, &branch).await?;
        Ok(branch)
    }

    /// Delete a branch and the frames placed on it. Refuses to delete the last
    /// branch; deleting the default promotes the oldest remaining branch.
    pub async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<bool> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(false);
        };
        let branches = self.read_branches(&dir).await?;
        let Some(target) = branches.iter().find(|b| b.id == branch_id) else {
            return Ok(false);
        };
        if branches.len() == 1 {
            return Err(WorkspaceError::Custom(format!(
                "cannot delete {}: a project needs at least one branch",
                target.name
            )));
        }

        if target.is_default {
            if let Some(heir) = branches
                .iter()
                .filter(|b| b.id != branch_id)
                .min_by_key(|b| b.created_at)
            {
                let mut heir = heir.clone();
                heir.is_default = true;
                heir.updated_at = Utc::now();
                self.write_branch(&dir, &heir).await?;
                tracing::info!(project_id, branch_id = %heir.id, "promoted branch to default");
            }
        }

        access::remove_file(&document_file(&dir.join(BRANCHES_DIR), branch_id)?).await?;
        let removed = self.remove_branch_frames(&dir, branch_id).await?;
        if removed > 0 {
            tracing::debug!(project_id, branch_id, removed, "removed frames of deleted branch");
        }
        Ok(true)
    }

    pub(crate) async fn read_branches(&self, project_dir: &Path) -> Result<Vec<Branch>> {
        let mut branches = self
            .load_documents(&project_dir.join(BRANCHES_DIR), "branch", migrate_branch)
            .await?;
        branches.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(branches)
    }

    async fn write_branch(&self, project_dir: &Path, branch: &Branch) -> Result<()> {
        let path = document_file(&project_dir.join(BRANCHES_DIR), &branch.id)?;
        self.write_json(&path, branch).await
    }
}
