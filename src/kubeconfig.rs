use crate::error::{Error, Result};
use crate::model::{LoginInfo, hash_id};
use crate::nhctl::{DevTool, KubeconfigOp};
use crate::state::{StateKey, StateStore, StateStoreExt};
use fs4::fs_std::FileExt;
use futures::future::join_all;
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCAL_CLUSTERS: StateKey<Vec<LocalCluster>> = StateKey::new("localPaths_v2");

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KubeconfigRecord {
    pub id: String,
    pub path: PathBuf,
    pub account: Option<String>,
}

/// Content-addressed kubeconfig files under `kubeConfigs/`.
#[derive(Clone)]
pub struct KubeconfigMaterializer {
    dir: PathBuf,
    store: Arc<dyn StateStore>,
    tool: Arc<dyn DevTool>,
}

impl KubeconfigMaterializer {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<dyn StateStore>, tool: Arc<dyn DevTool>) -> Self {
        Self {
            dir: dir.into(),
            store,
            tool,
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Writes the blob once per content and registers it with the merge tool.
    pub async fn materialize(&self, blob: &str, account: Option<&str>) -> Result<KubeconfigRecord> {
        let id = hash_id(blob.trim());
        let path = self.path_for(&id);
        let record = KubeconfigRecord {
            id,
            path,
            account: account.map(str::to_string),
        };

        if record.path.exists() {
            return Ok(record);
        }

        if self.write_locked(&record.path, blob).await? {
            debug!(kubeconfig = %record.path.display(), "kubeconfig written");
            if let Err(err) = self.tool.kubeconfig(&record.path, KubeconfigOp::Add).await {
                warn!(kubeconfig = %record.path.display(), error = %err, "kubeconfig add failed");
            }
        }
        Ok(record)
    }

    /// False when another writer produced the file first. The sidecar lock
    /// file is left in place so every writer locks the same inode.
    async fn write_locked(&self, path: &Path, blob: &str) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.with_extension("lock"))?;
        let _lock = lock_file(lock, LOCK_TIMEOUT).await?;
        write_new(path, blob)
    }

    /// Prunes files the account no longer references, then records `ids` as its set.
    pub async fn reconcile(&self, login: &LoginInfo, ids: &[String]) {
        let key = login.link_key();
        let previous: Vec<String> = match self.store.get_as(&key) {
            Ok(previous) => previous.unwrap_or_default(),
            Err(err) => {
                warn!(key = %key, error = %err, "unreadable kubeconfig reference set");
                Vec::new()
            }
        };

        let stale = previous
            .into_iter()
            .filter(|id| !ids.contains(id))
            .collect::<Vec<_>>();
        if !stale.is_empty() {
            info!(account = %key, count = stale.len(), "pruning kubeconfigs");
        }
        join_all(stale.iter().map(|id| self.prune(id))).await;

        if let Err(err) = self.store.set_as(&key, &ids) {
            warn!(key = %key, error = %err, "failed to store kubeconfig reference set");
        }
    }

    async fn prune(&self, id: &str) {
        let path = self.path_for(id);
        if let Err(err) = self.tool.kubeconfig(&path, KubeconfigOp::Remove).await {
            warn!(kubeconfig = %path.display(), error = %err, "kubeconfig remove failed");
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(kubeconfig = %path.display(), error = %err, "kubeconfig delete failed"),
        }
    }
}

fn write_new(path: &Path, blob: &str) -> Result<bool> {
    let mut file = match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    file.write_all(blob.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}

struct LockedFile {
    file: File,
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

async fn lock_file(file: File, timeout: Duration) -> Result<LockedFile> {
    let start = Instant::now();
    loop {
        if matches!(FileExt::try_lock_exclusive(&file), Ok(true)) {
            return Ok(LockedFile { file });
        }
        if start.elapsed() >= timeout {
            return Err(Error::State {
                path: PathBuf::from("kubeConfigs"),
                message: "timed out waiting for kubeconfig lock".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Name of the first cluster in a kubeconfig blob.
pub fn cluster_name(blob: &str) -> Result<String> {
    let kubeconfig = Kubeconfig::from_yaml(blob)?;
    kubeconfig
        .clusters
        .first()
        .map(|cluster| cluster.name.clone())
        .ok_or(Error::EmptyKubeconfig)
}

/// A cluster added straight from a kubeconfig rather than through an account.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCluster {
    pub id: String,
    pub cluster_name: String,
    pub kubeconfig_path: PathBuf,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct LocalClusters {
    store: Arc<dyn StateStore>,
}

impl LocalClusters {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<LocalCluster>> {
        Ok(self.store.get(&LOCAL_CLUSTERS)?.unwrap_or_default())
    }

    /// Returns the new entry, or `None` when the kubeconfig was already known.
    pub fn append(&self, name: &str, record: &KubeconfigRecord) -> Result<Option<LocalCluster>> {
        let mut clusters = self.list()?;
        if clusters.iter().any(|cluster| cluster.id == record.id) {
            return Ok(None);
        }
        let cluster = LocalCluster {
            id: record.id.clone(),
            cluster_name: name.to_string(),
            kubeconfig_path: record.path.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        clusters.push(cluster.clone());
        self.store.set(&LOCAL_CLUSTERS, &clusters)?;
        info!(cluster = %name, "local cluster added");
        Ok(Some(cluster))
    }
}
