//! Scripted stand-ins for the dev tool, git and the host.

use crate::error::{Error, Result};
use crate::git::SourceFetcher;
use crate::host::{GitCredentials, Host, TerminalHandle};
use crate::model::{HealthState, WorkloadKind, WorkloadRef};
use crate::nhctl::{Association, ContainerConfig, DevStart, DevTool, KubeconfigOp};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn kubeconfig_blob(cluster: &str) -> String {
    format!(
        "apiVersion: v1
kind: Config
clusters:
- name: {cluster}
  cluster:
    server: https://{cluster}.example:6443
contexts:
- name: {cluster}
  context:
    cluster: {cluster}
    user: {cluster}-admin
    namespace: default
current-context: {cluster}
users:
- name: {cluster}-admin
  user:
    token: secret-{cluster}
"
    )
}

fn record(log: &Mutex<Vec<String>>, entry: String) {
    if let Ok(mut log) = log.lock() {
        log.push(entry);
    }
}

fn snapshot<T: Clone>(log: &Mutex<Vec<T>>) -> Vec<T> {
    log.lock().map(|log| log.clone()).unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct FakeDevTool {
    pub namespaces: Vec<String>,
    pub containers: Vec<String>,
    pub associated: Option<PathBuf>,
    /// Answer to the current-directory association query.
    pub association: Option<Association>,
    pub config: Option<ContainerConfig>,
    pub image: Option<String>,
    pub apps: Vec<String>,
    pub workloads: Vec<String>,
    pub fail_auth: bool,
    pub fail_dev_start: bool,
    pub fail_sync: bool,
    pub fail_terminal: bool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeDevTool {
    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn call(&self, entry: impl Into<String>) {
        record(&self.calls, entry.into());
    }

    fn failure(command: &str) -> Error {
        Error::ExternalTool {
            program: "nhctl".to_string(),
            command: command.to_string(),
            stderr: format!("{command} refused"),
        }
    }
}

#[async_trait]
impl DevTool for FakeDevTool {
    async fn auth_check(&self, _workload: &WorkloadRef) -> Result<()> {
        self.call("auth check");
        if self.fail_auth {
            return Err(Self::failure("auth check"));
        }
        Ok(())
    }

    async fn associate_info(&self, _workload: &WorkloadRef, _container: &str) -> Result<Option<PathBuf>> {
        self.call("associate info");
        Ok(self.associated.clone())
    }

    async fn associate(&self, _workload: &WorkloadRef, container: &str, dir: &Path) -> Result<()> {
        self.call(format!("associate {container} {}", dir.display()));
        Ok(())
    }

    async fn associate_query_current(&self, dir: &Path) -> Result<Option<Association>> {
        self.call(format!("associate query {}", dir.display()));
        Ok(self.association.clone())
    }

    async fn disassociate(&self, dir: &Path, association: &Association) -> Result<()> {
        self.call(format!("disassociate {} {}", association.svc_pack.svc, dir.display()));
        Ok(())
    }

    async fn profile_set(
        &self,
        _workload: &WorkloadRef,
        container: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.call(format!("profile set {container} {key}={value}"));
        Ok(())
    }

    async fn container_config(
        &self,
        _workload: &WorkloadRef,
        _container: &str,
    ) -> Result<Option<ContainerConfig>> {
        self.call("config get");
        Ok(self.config.clone())
    }

    async fn image_for_container(&self, _workload: &WorkloadRef, _container: &str) -> Result<Option<String>> {
        self.call("image");
        Ok(self.image.clone())
    }

    async fn list_containers(&self, _workload: &WorkloadRef) -> Result<Vec<String>> {
        self.call("containers");
        Ok(self.containers.clone())
    }

    async fn dev_start(&self, request: &DevStart<'_>) -> Result<()> {
        self.call(format!(
            "dev start {} {} {}",
            request.container,
            request.image,
            request.mode.as_str()
        ));
        if self.fail_dev_start {
            return Err(Self::failure("dev start"));
        }
        Ok(())
    }

    async fn sync_files(&self, _workload: &WorkloadRef, container: &str) -> Result<()> {
        self.call(format!("sync {container}"));
        if self.fail_sync {
            return Err(Self::failure("sync"));
        }
        Ok(())
    }

    async fn dev_terminal(&self, workload: &WorkloadRef, container: &str) -> Result<TerminalHandle> {
        self.call(format!("dev terminal {container}"));
        if self.fail_terminal {
            return Err(Self::failure("dev terminal"));
        }
        Ok(TerminalHandle::detached(workload.name.clone()))
    }

    async fn dev_end(&self, _workload: &WorkloadRef) -> Result<()> {
        self.call("dev end");
        Ok(())
    }

    async fn kubeconfig(&self, _path: &Path, op: KubeconfigOp) -> Result<()> {
        self.call(format!("kubeconfig {}", op.as_str()));
        Ok(())
    }

    async fn list_namespaces(&self, _kubeconfig: &Path) -> Result<Vec<String>> {
        self.call("get namespace");
        Ok(self.namespaces.clone())
    }

    async fn check_cluster(&self, _kubeconfig: &Path) -> Result<HealthState> {
        self.call("check cluster");
        Ok(HealthState::ok())
    }

    async fn list_applications(&self, _kubeconfig: &Path, _namespace: &str) -> Result<Vec<String>> {
        self.call("get app");
        Ok(self.apps.clone())
    }

    async fn list_workloads(
        &self,
        _kubeconfig: &Path,
        _namespace: &str,
        _app: &str,
        kind: &WorkloadKind,
    ) -> Result<Vec<String>> {
        self.call(format!("get {kind}"));
        if kind == &WorkloadKind::Deployment {
            Ok(self.workloads.clone())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Clones by creating the destination directory.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    pub fail: bool,
    pub clones: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn clones(&self) -> Vec<String> {
        snapshot(&self.clones)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<bool> {
        record(&self.clones, url.to_string());
        if self.fail {
            return Ok(false);
        }
        tokio::fs::create_dir_all(dest).await?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct FakeHost {
    pub workspace: Option<PathBuf>,
    pub container_choice: Option<String>,
    pub image_choice: Option<String>,
    pub directory_choice: Option<PathBuf>,
    pub credentials: Option<GitCredentials>,
    pub confirm: bool,
    pub opened: Mutex<Vec<PathBuf>>,
    pub dispatched: Mutex<Vec<String>>,
    pub notices: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn in_workspace(dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        snapshot(&self.opened)
    }

    pub fn dispatched(&self) -> Vec<String> {
        snapshot(&self.dispatched)
    }

    pub fn notices(&self) -> Vec<String> {
        snapshot(&self.notices)
    }
}

#[async_trait]
impl Host for FakeHost {
    fn workspace_dir(&self) -> Option<PathBuf> {
        self.workspace.clone()
    }

    async fn open_folder(&self, dir: &Path) -> Result<()> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(dir.to_path_buf());
        }
        Ok(())
    }

    async fn select_container(&self, _containers: &[String]) -> Result<Option<String>> {
        Ok(self.container_choice.clone())
    }

    async fn select_image(&self, _images: &[String]) -> Result<Option<String>> {
        Ok(self.image_choice.clone())
    }

    async fn choose_directory(&self, _reason: &str) -> Result<Option<PathBuf>> {
        Ok(self.directory_choice.clone())
    }

    async fn git_credentials(&self, _url: &str) -> Result<Option<GitCredentials>> {
        Ok(self.credentials.clone())
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        record(&self.notices, question.to_string());
        Ok(self.confirm)
    }

    async fn dispatch_command(&self, command: &str) -> Result<()> {
        record(&self.dispatched, command.to_string());
        Ok(())
    }

    fn notify(&self, message: &str) {
        record(&self.notices, message.to_string());
    }
}
