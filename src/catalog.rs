use crate::error::{Error, Result};
use crate::executor::validate_command;
use crate::storage::CommandTemplate;
use crate::store_manager::{JsonSnapshotFile, SnapshotBackend, SnapshotStore};
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

/// Editable fields of a saved command.
#[derive(Debug, Clone, Default)]
pub struct TemplateDraft {
    pub name: String,
    pub description: String,
    pub working_dir: String,
    pub command: String,
    pub tags: Vec<String>,
}

impl TemplateDraft {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("command name is required"));
        }
        validate_command(&self.working_dir, &self.command)
    }
}

/// Saved command templates, persisted as a whole on every change.
pub struct TemplateCatalog {
    templates: SnapshotStore<CommandTemplate>,
}

impl TemplateCatalog {
    pub fn open(backend: Box<dyn SnapshotBackend<CommandTemplate>>) -> Result<Self> {
        Ok(Self {
            templates: SnapshotStore::open(backend)?,
        })
    }

    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(Box::new(JsonSnapshotFile::new(path)))
    }

    pub fn create(&self, draft: TemplateDraft) -> Result<CommandTemplate> {
        draft.validate()?;
        let now = Utc::now();
        let template = CommandTemplate {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            description: draft.description,
            working_dir: draft.working_dir,
            command: draft.command,
            tags: draft.tags,
            created_at: now,
            updated_at: now,
        };

        let created = template.clone();
        self.templates.update(|entries| {
            entries.insert(template.id.clone(), template);
            ((), true)
        })?;
        Ok(created)
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<CommandTemplate> {
        let mut templates: Vec<CommandTemplate> =
            self.templates.read(|entries| entries.values().cloned().collect());
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        templates
    }

    pub fn get(&self, id: &str) -> Result<CommandTemplate> {
        self.templates
            .read(|entries| entries.get(id).cloned())
            .ok_or_else(|| Error::not_found("command", id))
    }

    pub fn update(&self, id: &str, draft: TemplateDraft) -> Result<CommandTemplate> {
        draft.validate()?;
        let updated = self.templates.update(|entries| match entries.get_mut(id) {
            Some(existing) => {
                existing.name = draft.name;
                existing.description = draft.description;
                existing.working_dir = draft.working_dir;
                existing.command = draft.command;
                existing.tags = draft.tags;
                existing.updated_at = Utc::now();
                (Some(existing.clone()), true)
            }
            None => (None, false),
        })?;
        updated.ok_or_else(|| Error::not_found("command", id))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let existed = self.templates.update(|entries| {
            let existed = entries.remove(id).is_some();
            (existed, existed)
        })?;
        if existed {
            Ok(())
        } else {
            Err(Error::not_found("command", id))
        }
    }
}
