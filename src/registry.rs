use crate::error::{Error, Result};
use crate::kubeconfig::{KubeconfigMaterializer, cluster_name};
use crate::model::{AccountSession, ClusterRoot, DevSpace, HealthState, LoginInfo, ServiceAccount};
use crate::nhctl::DevTool;
use crate::session::SessionClient;
use crate::state::{StateKey, StateStore, StateStoreExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const SERVER_CLUSTER_LIST: StateKey<Vec<Value>> = StateKey::new("userinfoList_v2");

/// Arguments nhctl `dev start` needs on shared clusters.
const PRIORITY_CLASS_ARGS: [&str; 2] = ["--priority-class", "nocalhost-container-critical"];

/// Persisted, identity-deduplicated list of account sessions.
#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn StateStore>,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Persisted entries that carry an identity, in stored order.
    fn load(&self) -> Result<Vec<Value>> {
        let entries = self.store.get(&SERVER_CLUSTER_LIST)?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|entry| entry_id(entry).is_some())
            .collect())
    }

    fn save(&self, entries: &[Value]) -> Result<()> {
        self.store.set(&SERVER_CLUSTER_LIST, &entries.to_vec())
    }

    pub fn list(&self) -> Result<Vec<AccountSession>> {
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<AccountSession>(entry) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable account entry");
                    None
                }
            })
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<Option<AccountSession>> {
        Ok(self.list()?.into_iter().find(|session| session.id == id))
    }

    pub fn upsert(&self, session: &AccountSession) -> Result<()> {
        if session.id.is_empty() {
            return Err(Error::State {
                path: "userinfoList_v2".into(),
                message: "refusing to store an account without identity".to_string(),
            });
        }

        let mut entries = self.load()?;
        let value = serde_json::to_value(session)?;
        match entries
            .iter()
            .position(|entry| entry_id(entry) == Some(session.id.as_str()))
        {
            Some(index) => entries[index] = value,
            None => entries.push(value),
        }

        let mut seen = HashSet::new();
        entries.retain(|entry| {
            entry_id(entry)
                .map(|id| seen.insert(id.to_string()))
                .unwrap_or(false)
        });
        self.save(&entries)
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|entry| entry_id(entry) != Some(id));
        if entries.len() == before {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Live session clients, one per registered account.
pub struct Accounts {
    http: reqwest::Client,
    registry: ClusterRegistry,
    materializer: KubeconfigMaterializer,
    tool: Arc<dyn DevTool>,
    min_server_version: semver::Version,
    clients: Mutex<HashMap<String, SessionClient>>,
}

impl Accounts {
    pub fn new(
        http: reqwest::Client,
        registry: ClusterRegistry,
        materializer: KubeconfigMaterializer,
        tool: Arc<dyn DevTool>,
        min_server_version: semver::Version,
    ) -> Self {
        Self {
            http,
            registry,
            materializer,
            tool,
            min_server_version,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    fn clients(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionClient>>> {
        self.clients
            .lock()
            .map_err(|_| Error::Config("account client lock poisoned".to_string()))
    }

    /// Logs in and registers the account, replacing any session with the same identity.
    pub async fn append_cluster_by_login_info(&self, login: LoginInfo) -> Result<AccountSession> {
        let client =
            SessionClient::login(self.http.clone(), self.registry.clone(), login).await?;
        let session = client.session()?;
        self.registry.upsert(&session)?;
        client.check_server_version(&self.min_server_version).await;

        if let Some(previous) = self.clients()?.insert(session.id.clone(), client) {
            previous.invalidate();
        }
        info!(account = %session.id, user = %session.login.username, "account registered");
        Ok(session)
    }

    pub fn client_for(&self, session: &AccountSession) -> Result<SessionClient> {
        let mut clients = self.clients()?;
        if let Some(client) = clients.get(&session.id)
            && !client.is_invalidated()
        {
            return Ok(client.clone());
        }
        let client =
            SessionClient::from_session(self.http.clone(), self.registry.clone(), session.clone());
        clients.insert(session.id.clone(), client.clone());
        Ok(client)
    }

    /// Drops the account and its live client.
    pub fn logout(&self, id: &str) -> Result<Option<AccountSession>> {
        let session = self.registry.get(id)?;
        self.registry.remove(id)?;
        if let Some(client) = self.clients()?.remove(id) {
            client.invalidate();
        }
        Ok(session)
    }

    /// Clusters reachable through `session`, with their kubeconfigs materialized.
    pub async fn refresh_roots(&self, session: &AccountSession) -> Result<Vec<ClusterRoot>> {
        let client = self.client_for(session)?;
        let service_accounts = client.list_service_accounts().await?;
        info!(account = %session.id, count = service_accounts.len(), "service accounts");
        if service_accounts.is_empty() {
            return Err(Error::NoClusters(format!(
                "{} {}",
                session.login.base_url, session.login.username
            )));
        }

        let applications = client.list_applications_v2().await?;
        info!(account = %session.id, count = applications.len(), "applications");

        let mut ids = Vec::with_capacity(service_accounts.len());
        let mut roots = Vec::with_capacity(service_accounts.len());
        for account in &service_accounts {
            let record = self
                .materializer
                .materialize(&account.kubeconfig, Some(&session.id))
                .await?;
            ids.push(record.id.clone());

            let dev_spaces = if account.privilege {
                self.privileged_dev_spaces(account, &record.path).await?
            } else {
                namespace_dev_spaces(account, &record.path)
            };

            let state = match self.tool.check_cluster(&record.path).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(kubeconfig = %record.path.display(), error = %err, "cluster check failed");
                    HealthState {
                        code: 201,
                        message: Some(err.to_string()),
                    }
                }
            };

            roots.push(ClusterRoot {
                cluster_name: cluster_name(&account.kubeconfig).unwrap_or_else(|_| record.id.clone()),
                kubeconfig_id: record.id,
                kubeconfig_path: record.path,
                dev_spaces,
                applications: applications.clone(),
                state,
            });
        }

        self.materializer.reconcile(&session.login, &ids).await;
        Ok(roots)
    }

    async fn privileged_dev_spaces(
        &self,
        account: &ServiceAccount,
        kubeconfig_path: &Path,
    ) -> Result<Vec<DevSpace>> {
        let namespaces = self.tool.list_namespaces(kubeconfig_path).await?;
        Ok(namespaces
            .into_iter()
            .map(|namespace| {
                let pack = account
                    .namespace_packs
                    .iter()
                    .find(|pack| pack.namespace == namespace);
                let space_own_type = match account.privilege_type.as_deref() {
                    Some("CLUSTER_ADMIN") => Some("Owner".to_string()),
                    Some("CLUSTER_VIEWER") => Some(
                        pack.and_then(|pack| pack.space_own_type.clone())
                            .unwrap_or_else(|| "Viewer".to_string()),
                    ),
                    _ => pack.and_then(|pack| pack.space_own_type.clone()),
                };
                DevSpace {
                    space_id: pack.and_then(|pack| pack.space_id),
                    space_name: pack
                        .and_then(|pack| pack.spacename.clone())
                        .unwrap_or_else(|| namespace.clone()),
                    namespace,
                    kubeconfig_path: kubeconfig_path.to_path_buf(),
                    storage_class: account.storage_class.clone(),
                    space_own_type,
                    dev_start_append_command: priority_class_args(),
                }
            })
            .collect())
    }
}

fn namespace_dev_spaces(account: &ServiceAccount, kubeconfig_path: &Path) -> Vec<DevSpace> {
    account
        .namespace_packs
        .iter()
        .map(|pack| DevSpace {
            space_id: pack.space_id,
            space_name: pack
                .spacename
                .clone()
                .unwrap_or_else(|| pack.namespace.clone()),
            namespace: pack.namespace.clone(),
            kubeconfig_path: kubeconfig_path.to_path_buf(),
            storage_class: account.storage_class.clone(),
            space_own_type: pack.space_own_type.clone(),
            dev_start_append_command: priority_class_args(),
        })
        .collect()
}

fn priority_class_args() -> Vec<String> {
    PRIORITY_CLASS_ARGS.iter().map(|arg| arg.to_string()).collect()
}
