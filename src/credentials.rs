use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const TOKEN_FILE: &str = "token.txt";
const APPLICATION_FILE: &str = "application.json";

/// Application metadata handed over by a URI activation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplicationDetail {
    pub email: String,
    pub organization: String,
    pub application: String,
    pub service: String,
    pub action: String,
    pub kubeconfig: String,
    pub workload_type: String,
    pub namespace: String,
    pub environment: String,
}

/// Per-account token and application files under `accounts/<email>/`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn account_dir(&self, email: &str) -> Result<PathBuf> {
        if email.is_empty()
            || email == "."
            || email == ".."
            || email.contains(['/', '\\'])
        {
            return Err(Error::InvalidAccount(email.to_string()));
        }
        let dir = self.dir.join(email);
        fs::create_dir_all(&dir).inspect_err(|err| {
            error!(dir = %dir.display(), error = %err, "create user account directory failed");
        })?;
        Ok(dir)
    }

    pub fn store_token(&self, email: &str, token: &str) -> Result<()> {
        if email.is_empty() || token.is_empty() {
            return Ok(());
        }
        let path = self.account_dir(email)?.join(TOKEN_FILE);
        fs::write(&path, token).inspect_err(|err| {
            error!(email, error = %err, "store account token failed");
        })?;
        debug!(email, "stored account token");
        Ok(())
    }

    pub fn store_application(&self, detail: &ApplicationDetail) -> Result<()> {
        let path = self.account_dir(&detail.email)?.join(APPLICATION_FILE);
        let mut merged = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str::<Value>(&raw).inspect_err(|err| {
                error!(path = %path.display(), error = %err, "stored application data is not valid JSON");
            })?
        } else {
            Value::Object(Map::new())
        };

        let mut patch = Map::new();
        patch.insert(
            detail.organization.clone(),
            json!({
                "name": detail.organization,
                "applications": [{
                    "name": detail.application,
                    "kubeconfig": detail.kubeconfig,
                    "services": [{
                        "name": detail.service,
                        "action": detail.action,
                        "workloadType": detail.workload_type,
                        "namespace": detail.namespace,
                        "env": detail.environment,
                    }],
                }],
            }),
        );
        merge_json(&mut merged, Value::Object(patch));

        fs::write(&path, serde_json::to_string_pretty(&merged)?)?;
        Ok(())
    }

    /// Application data of the first account directory holding a token.
    pub fn stored_application_data(&self) -> Result<Option<Value>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut accounts = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        accounts.sort();

        for account in accounts {
            if !account.join(TOKEN_FILE).exists() {
                continue;
            }
            let app_path = account.join(APPLICATION_FILE);
            if app_path.exists() {
                return read_json(&app_path).map(Some);
            }
        }
        Ok(None)
    }

    pub fn token(&self, email: &str) -> Result<Option<String>> {
        let path = self.dir.join(email).join(TOKEN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Removes the token file of `email`; returns whether one existed.
    pub fn clear_token(&self, email: &str) -> Result<bool> {
        let path = self.dir.join(email).join(TOKEN_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Recursive merge: objects by key, arrays by index, anything else replaced.
fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) => {
            for (index, value) in patch.into_iter().enumerate() {
                match target.get_mut(index) {
                    Some(existing) => merge_json(existing, value),
                    None => target.push(value),
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplicationDetail, CredentialStore, merge_json};
    use serde_json::json;

    fn detail(org: &str, service: &str) -> ApplicationDetail {
        ApplicationDetail {
            email: "dev@corp.io".into(),
            organization: org.into(),
            application: "shop".into(),
            service: service.into(),
            action: "run".into(),
            kubeconfig: "apiVersion: v1".into(),
            workload_type: "Deployment".into(),
            namespace: "dev".into(),
            environment: "test".into(),
        }
    }

    #[test]
    fn empty_token_or_email_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.store_token("", "t").unwrap();
        store.store_token("dev@corp.io", "").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn token_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.store_token("dev@corp.io", "abc").unwrap();
        assert_eq!(store.token("dev@corp.io").unwrap().as_deref(), Some("abc"));
        assert!(store.clear_token("dev@corp.io").unwrap());
        assert!(!store.clear_token("dev@corp.io").unwrap());
        assert_eq!(store.token("dev@corp.io").unwrap(), None);
    }

    #[test]
    fn email_cannot_escape_account_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        assert!(store.store_token("../evil", "abc").is_err());
    }

    #[test]
    fn application_data_merges_across_organizations() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.store_token("dev@corp.io", "abc").unwrap();
        store.store_application(&detail("acme", "cart")).unwrap();
        store.store_application(&detail("globex", "api")).unwrap();

        let data = store.stored_application_data().unwrap().unwrap();
        assert_eq!(data["acme"]["applications"][0]["services"][0]["name"], "cart");
        assert_eq!(data["globex"]["name"], "globex");
    }

    #[test]
    fn application_data_requires_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.store_application(&detail("acme", "cart")).unwrap();
        assert_eq!(store.stored_application_data().unwrap(), None);
    }

    #[test]
    fn merge_overlays_arrays_by_index() {
        let mut target = json!({"a": [{"x": 1, "y": 2}], "b": 1});
        merge_json(&mut target, json!({"a": [{"x": 3}, {"z": 4}], "c": true}));
        assert_eq!(target, json!({"a": [{"x": 3, "y": 2}, {"z": 4}], "b": 1, "c": true}));
    }
}
