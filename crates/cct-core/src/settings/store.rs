use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Permissions {
    #[serde(default)]
    allow: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    permissions: Permissions,
}

/// Per-project always-allow list at `<workingDir>/.claude/settings.local.json`
/// (spec §4.3). Guarantees the `allow` list is deduplicated, in insertion
/// order, on every load and save.
pub struct SettingsStore {
    path: PathBuf,
    doc: RwLock<SettingsDocument>,
}

impl SettingsStore {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        let path = working_dir.as_ref().join(".claude").join("settings.local.json");
        Self {
            path,
            doc: RwLock::new(SettingsDocument::default()),
        }
    }

    /// Load from disk, replacing in-memory state. A missing file yields an
    /// empty document rather than an error.
    pub async fn load_settings(&self) -> Result<()> {
        let loaded = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let mut doc: SettingsDocument =
                    serde_json::from_str(&contents).unwrap_or_default();
                dedup(&mut doc.permissions.allow);
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsDocument::default(),
            Err(e) => return Err(crate::error::CctError::Storage(sqlx::Error::Io(e))),
        };
        *self.doc.write().await = loaded;
        Ok(())
    }

    /// Pretty-print (2-space indent) and write to disk. Creates the `.claude`
    /// directory (mode 0755) if missing; the file itself stays at 0644 — it
    /// is not secret, unlike the central database.
    pub async fn save_settings(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| crate::error::CctError::Storage(sqlx::Error::Io(e)))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                let _ = std::fs::set_permissions(parent, perms);
            }
        }

        let doc = self.doc.read().await;
        let contents = serde_json::to_string_pretty(&*doc)
            .map_err(|e| crate::error::CctError::InvalidRequest(format!("serializing settings: {e}")))?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| crate::error::CctError::Storage(sqlx::Error::Io(e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&self.path) {
                let mut perms = meta.permissions();
                perms.set_mode(0o644);
                let _ = std::fs::set_permissions(&self.path, perms);
            }
        }

        Ok(())
    }

    /// Add `rule` to the allow list if not already present, persist, return
    /// whether it was newly added.
    pub async fn add_permission(&self, rule: impl Into<String>) -> Result<bool> {
        let rule = rule.into();
        let added = {
            let mut doc = self.doc.write().await;
            if doc.permissions.allow.contains(&rule) {
                false
            } else {
                doc.permissions.allow.push(rule);
                true
            }
        };
        if added {
            self.save_settings().await?;
        }
        Ok(added)
    }

    pub async fn remove_permission(&self, rule: &str) -> Result<bool> {
        let removed = {
            let mut doc = self.doc.write().await;
            let before = doc.permissions.allow.len();
            doc.permissions.allow.retain(|r| r != rule);
            doc.permissions.allow.len() != before
        };
        if removed {
            self.save_settings().await?;
        }
        Ok(removed)
    }

    pub async fn get_allowed(&self) -> Vec<String> {
        self.doc.read().await.permissions.allow.clone()
    }
}

fn dedup(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.load_settings().await.unwrap();
        assert!(store.get_allowed().await.is_empty());
    }

    #[tokio::test]
    async fn add_permission_dedups_and_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.load_settings().await.unwrap();

        store.add_permission("Bash(git:*)").await.unwrap();
        store.add_permission("Read(//tmp/**)").await.unwrap();
        store.add_permission("Bash(git:*)").await.unwrap();

        assert_eq!(
            store.get_allowed().await,
            vec!["Bash(git:*)".to_string(), "Read(//tmp/**)".to_string()]
        );
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.load_settings().await.unwrap();
        store.add_permission("Bash(*)").await.unwrap();

        let reloaded = SettingsStore::new(dir.path());
        reloaded.load_settings().await.unwrap();
        assert_eq!(reloaded.get_allowed().await, vec!["Bash(*)".to_string()]);
    }

    #[tokio::test]
    async fn remove_permission_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.load_settings().await.unwrap();
        store.add_permission("Bash(*)").await.unwrap();

        let removed = store.remove_permission("Bash(*)").await.unwrap();
        assert!(removed);
        assert!(store.get_allowed().await.is_empty());
    }
}
