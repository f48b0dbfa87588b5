use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Container name nhctl gives the dev container while a workload is under development.
pub const DEV_CONTAINER_SENTINEL: &str = "nocalhost-dev";

/// Name the server uses for the catch-all application.
pub const DEFAULT_APPLICATION: &str = "default.application";

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Pod,
    Custom(String),
}

impl WorkloadKind {
    pub const BUILTIN: [Self; 6] = [
        Self::Deployment,
        Self::StatefulSet,
        Self::DaemonSet,
        Self::Job,
        Self::CronJob,
        Self::Pod,
    ];

    /// Folder label under `Workloads` in the resource tree.
    pub fn title(&self) -> String {
        match self {
            Self::Deployment => "Deployments".to_string(),
            Self::StatefulSet => "StatefulSets".to_string(),
            Self::DaemonSet => "DaemonSets".to_string(),
            Self::Job => "Jobs".to_string(),
            Self::CronJob => "CronJobs".to_string(),
            Self::Pod => "Pods".to_string(),
            Self::Custom(kind) => format!("{kind}s"),
        }
    }

    /// Value passed to nhctl `-t`.
    pub fn as_arg(&self) -> &str {
        match self {
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonset",
            Self::Job => "job",
            Self::CronJob => "cronjob",
            Self::Pod => "pod",
            Self::Custom(kind) => kind.as_str(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" => None,
            "deploy" | "deployment" | "deployments" | "dp" => Some(Self::Deployment),
            // the URI handler has historically sent the misspelled form
            "sts" | "statefulset" | "statefulsets" | "statefuleset" | "statefulesets" => {
                Some(Self::StatefulSet)
            }
            "ds" | "daemonset" | "daemonsets" | "daemon-set" | "daemon-sets" => {
                Some(Self::DaemonSet)
            }
            "job" | "jobs" => Some(Self::Job),
            "cj" | "cronjob" | "cronjobs" | "cron-job" | "cron-jobs" => Some(Self::CronJob),
            "po" | "pod" | "pods" => Some(Self::Pod),
            other => Some(Self::Custom(other.to_string())),
        }
    }
}

impl Display for WorkloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl Serialize for WorkloadKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_arg())
    }
}

impl<'de> Deserialize<'de> for WorkloadKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_token(&raw).ok_or_else(|| serde::de::Error::custom("empty workload kind"))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevMode {
    #[default]
    Replace,
    Copy,
}

impl DevMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Copy => "copy",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "replace" => Some(Self::Replace),
            "copy" | "duplicate" => Some(Self::Copy),
            _ => None,
        }
    }
}

/// Everything nhctl needs to address one workload.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub app_name: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub kubeconfig_path: PathBuf,
    #[serde(default)]
    pub space_name: String,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub dev_start_append_command: Vec<String>,
}

impl WorkloadRef {
    pub fn new(
        app_name: impl Into<String>,
        kind: WorkloadKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
        kubeconfig_path: impl Into<PathBuf>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            app_name: app_name.into(),
            kind,
            name: name.into(),
            space_name: namespace.clone(),
            namespace,
            kubeconfig_path: kubeconfig_path.into(),
            storage_class: None,
            dev_start_append_command: Vec::new(),
        }
    }

    /// Key used for per-workload markers in the state store.
    pub fn state_id(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, self.app_name, self.kind, self.name
        )
    }
}

impl Display for WorkloadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({} {})",
            self.namespace, self.name, self.kind, self.app_name
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInfo {
    pub base_url: String,
    pub username: String,
    #[serde(skip)]
    pub password: String,
}

impl LoginInfo {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            username: username.into(),
            password: password.into(),
        }
    }

    /// State key under which the kubeconfig ids this account references are kept.
    pub fn link_key(&self) -> String {
        format!("USER_LINK:{}@{}", self.base_url, self.username)
    }
}

/// Prefixes `http://` when the caller left the scheme off.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Hex SHA-256, used for account identities and kubeconfig file names.
pub fn hash_id(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NamespacePack {
    #[serde(default)]
    pub space_id: Option<u64>,
    pub namespace: String,
    #[serde(default)]
    pub spacename: Option<String>,
    #[serde(default)]
    pub space_own_type: Option<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub kubeconfig: String,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub privilege: bool,
    #[serde(default)]
    pub privilege_type: Option<String>,
    #[serde(default)]
    pub namespace_packs: Vec<NamespacePack>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: u64,
    pub user_id: u64,
    pub public: u8,
    pub editable: u8,
    /// camelCased application context, kept as the JSON text the tree renders.
    pub context: String,
    pub status: u8,
}

/// Health reported for a session or a cluster.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthState {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccountSession {
    pub id: String,
    pub login: LoginInfo,
    pub token: String,
    pub refresh_token: String,
    pub user: UserInfo,
    pub created_at: i64,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
    pub state: HealthState,
}

impl AccountSession {
    pub fn identity(user_id: u64, base_url: &str) -> String {
        hash_id(&format!("{user_id}{base_url}"))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DevSpace {
    pub space_id: Option<u64>,
    pub space_name: String,
    pub namespace: String,
    pub kubeconfig_path: PathBuf,
    pub storage_class: Option<String>,
    pub space_own_type: Option<String>,
    pub dev_start_append_command: Vec<String>,
}

/// One cluster reachable through an account, as shown at the top of the tree.
#[derive(Debug, Clone)]
pub struct ClusterRoot {
    pub cluster_name: String,
    pub kubeconfig_id: String,
    pub kubeconfig_path: PathBuf,
    pub dev_spaces: Vec<DevSpace>,
    pub applications: Vec<ApplicationInfo>,
    pub state: HealthState,
}

#[cfg(test)]
mod tests {
    use super::{
        AccountSession, DevMode, LoginInfo, WorkloadKind, WorkloadRef, hash_id, normalize_base_url,
    };

    #[test]
    fn workload_aliases_map_to_expected_kinds() {
        assert_eq!(
            WorkloadKind::from_token("Deployment"),
            Some(WorkloadKind::Deployment)
        );
        assert_eq!(
            WorkloadKind::from_token("StatefuleSet"),
            Some(WorkloadKind::StatefulSet)
        );
        assert_eq!(WorkloadKind::from_token("cj"), Some(WorkloadKind::CronJob));
        assert_eq!(
            WorkloadKind::from_token("rollouts"),
            Some(WorkloadKind::Custom("rollouts".to_string()))
        );
        assert_eq!(WorkloadKind::from_token("  "), None);
    }

    #[test]
    fn kind_titles_match_tree_folders() {
        assert_eq!(WorkloadKind::Deployment.title(), "Deployments");
        assert_eq!(WorkloadKind::CronJob.title(), "CronJobs");
        assert_eq!(WorkloadKind::Custom("Rollout".into()).title(), "Rollouts");
    }

    #[test]
    fn kind_serializes_as_nhctl_argument() {
        let json = serde_json::to_string(&WorkloadKind::DaemonSet).unwrap();
        assert_eq!(json, "\"daemonset\"");
        let parsed: WorkloadKind = serde_json::from_str("\"Pods\"").unwrap();
        assert_eq!(parsed, WorkloadKind::Pod);
    }

    #[test]
    fn base_url_gets_default_scheme() {
        assert_eq!(normalize_base_url("x.dev:8080/"), "http://x.dev:8080");
        assert_eq!(normalize_base_url("https://x.dev"), "https://x.dev");
    }

    #[test]
    fn login_link_key_uses_normalized_url() {
        let login = LoginInfo::new("api.local", "dev@local", "secret");
        assert_eq!(login.link_key(), "USER_LINK:http://api.local@dev@local");
    }

    #[test]
    fn password_is_never_persisted() {
        let login = LoginInfo::new("http://x", "dev", "secret");
        let json = serde_json::to_string(&login).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn identity_hashes_user_and_server() {
        let id = AccountSession::identity(42, "http://x");
        assert_eq!(id, hash_id("42http://x"));
        assert_eq!(id.len(), 64);
        assert_ne!(id, AccountSession::identity(42, "http://y"));
    }

    #[test]
    fn mode_tokens() {
        assert_eq!(DevMode::from_token("Copy"), Some(DevMode::Copy));
        assert_eq!(DevMode::from_token("bogus"), None);
        assert_eq!(DevMode::default().as_str(), "replace");
    }

    #[test]
    fn workload_state_id_is_stable() {
        let workload = WorkloadRef::new(
            "bookinfo",
            WorkloadKind::Deployment,
            "reviews",
            "dev",
            "/tmp/k",
        );
        assert_eq!(workload.state_id(), "dev/bookinfo/deployment/reviews");
        assert_eq!(workload.space_name, "dev");
    }
}
