//! Script management. Built-in scripts ship with the installation and are
//! read-only here.

use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{info, warn};

use super::store::{ScriptStore, ScriptUpdate};
use super::{JobsError, NewScript, Script, ScriptId};

#[derive(Clone)]
pub struct ScriptService {
    store: Arc<dyn ScriptStore>,
}

impl ScriptService {
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, script: NewScript) -> Result<Script, JobsError> {
        if script.name.trim().is_empty() {
            return Err(JobsError::InvalidRequest("script name is empty".into()));
        }
        // Each part becomes one directory level under the script root.
        for (field, value) in [
            ("project", &script.project),
            ("label", &script.label),
            ("name", &script.name),
        ] {
            if !is_single_path_part(value) {
                return Err(JobsError::InvalidRequest(format!(
                    "script {field} '{value}' must be a bare file name"
                )));
            }
        }
        let created = self.store.create_script(script).await?;
        info!(
            script_id = created.id,
            name = %created.name,
            builtin = created.is_builtin,
            "script registered"
        );
        Ok(created)
    }

    pub async fn find(&self, id: ScriptId) -> Result<Script, JobsError> {
        Ok(self.store.find_script(id).await?)
    }

    pub async fn list(&self, limit: u32, offset: u32) -> Result<(u64, Vec<Script>), JobsError> {
        Ok(self.store.list_scripts(limit, offset).await?)
    }

    pub async fn update(&self, id: ScriptId, update: ScriptUpdate) -> Result<Script, JobsError> {
        self.mutable(id).await?;
        self.store.update_script(id, update).await?;
        info!(script_id = id, "script updated");
        self.find(id).await
    }

    /// Enable or disable a script. Disabled scripts are rejected by the engine.
    pub async fn set_enabled(&self, id: ScriptId, enabled: bool) -> Result<Script, JobsError> {
        self.update(
            id,
            ScriptUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete(&self, id: ScriptId) -> Result<(), JobsError> {
        self.mutable(id).await?;
        self.store.delete_script(id).await?;
        info!(script_id = id, "script deleted");
        Ok(())
    }

    async fn mutable(&self, id: ScriptId) -> Result<Script, JobsError> {
        let script = self.store.find_script(id).await?;
        if script.is_builtin {
            warn!(script_id = id, "refusing to modify built-in script");
            return Err(JobsError::ScriptIsBuiltin { script_id: id });
        }
        Ok(script)
    }
}

fn is_single_path_part(value: &str) -> bool {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (None, _) => true,
        (Some(Component::Normal(_)), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_pool, SqliteStore};

    fn service() -> (tempfile::TempDir, ScriptService) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(open_pool(dir.path().join("test.db")).unwrap());
        (dir, ScriptService::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_builtin_scripts_are_protected() {
        let (_dir, svc) = service();
        let builtin = svc
            .create(NewScript {
                name: "install.sh".into(),
                project: "mds".into(),
                label: "master".into(),
                enabled: true,
                is_builtin: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.set_enabled(builtin.id, false).await,
            Err(JobsError::ScriptIsBuiltin { .. })
        ));
        assert!(matches!(
            svc.delete(builtin.id).await,
            Err(JobsError::ScriptIsBuiltin { .. })
        ));
        assert!(svc.find(builtin.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_disable_and_delete_user_script() {
        let (_dir, svc) = service();
        let script = svc
            .create(NewScript {
                name: "rotate.sh".into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let disabled = svc.set_enabled(script.id, false).await.unwrap();
        assert!(!disabled.enabled);

        tokio_test::assert_ok!(svc.delete(script.id).await);
        assert!(svc.find(script.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let (_dir, svc) = service();
        let cases = [
            ("", "", ""),
            ("", "", "../etc/passwd"),
            ("", "", "a/b.sh"),
            ("/bin", "", "sh"),
            ("ops", "/usr/bin", "env"),
            ("..", "..", "sh"),
            ("ops/../..", "x", "run.sh"),
            (".", "daily", "run.sh"),
        ];
        for (project, label, name) in cases {
            let result = svc
                .create(NewScript {
                    name: name.into(),
                    project: project.into(),
                    label: label.into(),
                    ..Default::default()
                })
                .await;
            assert!(
                matches!(result, Err(JobsError::InvalidRequest(_))),
                "{project}/{label}/{name}"
            );
        }
        let (total, _) = svc.list(50, 0).await.unwrap();
        assert_eq!(total, 0);

        tokio_test::assert_ok!(
            svc.create(NewScript {
                name: "run.sh".into(),
                project: "ops".into(),
                label: "daily".into(),
                ..Default::default()
            })
            .await
        );
    }
}
