use chrono::Utc;
use std::path::{Path, PathBuf};

use super::access;
use super::migrate::migrate_conversation;
use super::models::{
    new_id, Conversation, ConversationPatch, Message, MessagePatch, NewMessage, CONVERSATION_VERSION,
};
use super::{document_file, DocumentStore, CONVERSATIONS_DIR};
use crate::error::{Result, WorkspaceError};

impl DocumentStore {
    /// Conversations of a project, most recently updated first.
    pub async fn list_conversations(&self, project_id: &str) -> Result<Vec<Conversation>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(Vec::new());
        };
        let mut conversations = self
            .load_documents(&dir.join(CONVERSATIONS_DIR), "conversation", migrate_conversation)
            .await?;
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub async fn get_conversation(&self, project_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(None);
        };
        let path = conversation_file(&dir, conversation_id)?;
        self.load_document(&path, "conversation", migrate_conversation)
            .await
    }

    pub async fn create_conversation(&self, project_id: &str, title: Option<String>) -> Result<Conversation> {
        let dir = self.require_project_dir(project_id).await?;
        let now = Utc::now();
        let conversation = Conversation {
            id: new_id(),
            project_id: project_id.to_string(),
            title,
            created_at: now,
            updated_at: now,
            suggestions: Vec::new(),
            version: CONVERSATION_VERSION,
            messages: Vec::new(),
        };
        self.write_json(&conversation_file(&dir, &conversation.id)?, &conversation)
            .await?;
        Ok(conversation)
    }

    pub async fn update_conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let (path, mut conversation) = self.require_conversation(project_id, conversation_id).await?;
        if let Some(title) = patch.title {
            conversation.title = Some(title);
        }
        if let Some(suggestions) = patch.suggestions {
            conversation.suggestions = suggestions;
        }
        conversation.updated_at = Utc::now();
        self.write_json(&path, &conversation).await?;
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, project_id: &str, conversation_id: &str) -> Result<bool> {
        let Some(dir) = self.optional_project_dir(project_id).await? else {
            return Ok(false);
        };
        Ok(access::remove_file(&conversation_file(&dir, conversation_id)?).await?)
    }

    /// Messages of a conversation, oldest first. Empty when the conversation is missing.
    pub async fn list_messages(&self, project_id: &str, conversation_id: &str) -> Result<Vec<Message>> {
        let mut messages = self
            .get_conversation(project_id, conversation_id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    pub async fn append_message(
        &self,
        project_id: &str,
        conversation_id: &str,
        input: NewMessage,
    ) -> Result<Message> {
        let (path, mut conversation) = self.require_conversation(project_id, conversation_id).await?;
        let now = Utc::now();
        let message = Message {
            id: new_id(),
            conversation_id: conversation.id.clone(),
            role: input.role,
            content: input.content,
            created_at: now,
            context: input.context,
            parts: input.parts,
            checkpoints: input.checkpoints,
            applied: None,
            commit_oid: None,
            snapshots: None,
        };
        conversation.messages.push(message.clone());
        conversation.updated_at = now;
        self.write_json(&path, &conversation).await?;
        Ok(message)
    }

    /// Replace the whole message list, keeping the given order.
    pub async fn replace_messages(
        &self,
        project_id: &str,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Conversation> {
        let (path, mut conversation) = self.require_conversation(project_id, conversation_id).await?;
        conversation.messages = messages
            .into_iter()
            .map(|mut m| {
                m.conversation_id = conversation.id.clone();
                m
            })
            .collect();
        conversation.updated_at = Utc::now();
        self.write_json(&path, &conversation).await?;
        Ok(conversation)
    }

    pub async fn update_message(
        &self,
        project_id: &str,
        conversation_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Message> {
        let (path, mut conversation) = self.require_conversation(project_id, conversation_id).await?;
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| WorkspaceError::not_found("message", message_id))?;

        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(parts) = patch.parts {
            message.parts = parts;
        }
        if let Some(checkpoints) = patch.checkpoints {
            message.checkpoints = checkpoints;
        }
        if let Some(applied) = patch.applied {
            message.applied = Some(applied);
        }
        if let Some(commit_oid) = patch.commit_oid {
            message.commit_oid = Some(commit_oid);
        }
        if let Some(snapshots) = patch.snapshots {
            message.snapshots = Some(snapshots);
        }
        let updated = message.clone();

        conversation.updated_at = Utc::now();
        self.write_json(&path, &conversation).await?;
        Ok(updated)
    }

    async fn require_conversation(
        &self,
        project_id: &str,
        conversation_id: &str,
    ) -> Result<(PathBuf, Conversation)> {
        let dir = self.require_project_dir(project_id).await?;
        let path = conversation_file(&dir, conversation_id)?;
        let conversation = self
            .load_document(&path, "conversation", migrate_conversation)
            .await?
            .ok_or_else(|| WorkspaceError::not_found("conversation", conversation_id))?;
        Ok((path, conversation))
    }
}

fn conversation_file(project_dir: &Path, conversation_id: &str) -> Result<PathBuf> {
    document_file(&project_dir.join(CONVERSATIONS_DIR), conversation_id)
}
