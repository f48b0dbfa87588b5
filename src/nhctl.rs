use crate::error::{Error, Result};
use crate::host::TerminalHandle;
use crate::model::{DevMode, HealthState, WorkloadKind, WorkloadRef};
use async_trait::async_trait;
use k8s_openapi::List;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as TokioCommand;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KubeconfigOp {
    Add,
    Remove,
}

impl KubeconfigOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Dev settings nhctl keeps for one container of a workload.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dev: ContainerDevConfig,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDevConfig {
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceConfig {
    #[serde(default)]
    containers: Vec<ContainerConfig>,
}

#[derive(Debug, Deserialize)]
struct NamedItem {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: Option<ObjectMeta>,
}

impl NamedItem {
    fn into_name(self) -> Option<String> {
        self.name
            .or_else(|| self.metadata.and_then(|meta| meta.name))
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ClusterCheck {
    code: i64,
    #[serde(default)]
    info: Option<String>,
}

/// What `dev associate-queryer --current` reports for a source directory.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Association {
    /// Cluster label the workload is listed under.
    pub server: String,
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    pub svc_pack: ServicePack,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct ServicePack {
    pub ns: String,
    pub app: String,
    pub svc_type: String,
    pub svc: String,
    #[serde(default)]
    pub container: Option<String>,
}

pub struct DevStart<'a> {
    pub workload: &'a WorkloadRef,
    pub container: &'a str,
    pub image: &'a str,
    pub mode: DevMode,
    pub local_sync: &'a Path,
    pub header: Option<&'a str>,
}

/// The external dev tool driving clusters on our behalf.
#[async_trait]
pub trait DevTool: Send + Sync {
    async fn auth_check(&self, workload: &WorkloadRef) -> Result<()>;
    async fn associate_info(&self, workload: &WorkloadRef, container: &str) -> Result<Option<PathBuf>>;
    async fn associate(&self, workload: &WorkloadRef, container: &str, dir: &Path) -> Result<()>;
    /// The workload `dir` is associated with, if any.
    async fn associate_query_current(&self, dir: &Path) -> Result<Option<Association>>;
    async fn disassociate(&self, dir: &Path, association: &Association) -> Result<()>;
    async fn profile_set(
        &self,
        workload: &WorkloadRef,
        container: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;
    async fn container_config(
        &self,
        workload: &WorkloadRef,
        container: &str,
    ) -> Result<Option<ContainerConfig>>;
    async fn image_for_container(&self, workload: &WorkloadRef, container: &str) -> Result<Option<String>>;
    async fn list_containers(&self, workload: &WorkloadRef) -> Result<Vec<String>>;
    async fn dev_start(&self, request: &DevStart<'_>) -> Result<()>;
    async fn sync_files(&self, workload: &WorkloadRef, container: &str) -> Result<()>;
    async fn dev_terminal(&self, workload: &WorkloadRef, container: &str) -> Result<TerminalHandle>;
    async fn dev_end(&self, workload: &WorkloadRef) -> Result<()>;
    async fn kubeconfig(&self, path: &Path, op: KubeconfigOp) -> Result<()>;
    async fn list_namespaces(&self, kubeconfig: &Path) -> Result<Vec<String>>;
    async fn check_cluster(&self, kubeconfig: &Path) -> Result<HealthState>;
    async fn list_applications(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<String>>;
    async fn list_workloads(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        app: &str,
        kind: &WorkloadKind,
    ) -> Result<Vec<String>>;
}

pub struct NhctlCli {
    program: PathBuf,
}

impl NhctlCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nhctl".to_string())
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let program = self.program_name();
        debug!(command = %args.join(" "), "{program}");
        let output = TokioCommand::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| Error::external(&program, &args, err.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            Err(Error::external(&program, &args, stderr))
        }
    }

    fn parse_json<T: serde::de::DeserializeOwned>(&self, args: &[String], stdout: &str) -> Result<T> {
        serde_json::from_str(stdout)
            .map_err(|err| Error::external(&self.program_name(), args, format!("unreadable output: {err}")))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn cluster_args(kubeconfig: &Path, namespace: &str) -> Vec<String> {
    vec![
        "--kubeconfig".to_string(),
        kubeconfig.display().to_string(),
        "-n".to_string(),
        namespace.to_string(),
    ]
}

/// `APP -d NAME -t KIND --kubeconfig PATH -n NS`
fn workload_args(workload: &WorkloadRef) -> Vec<String> {
    let mut args = args(&[
        &workload.app_name,
        "-d",
        &workload.name,
        "-t",
        workload.kind.as_arg(),
    ]);
    args.extend(cluster_args(&workload.kubeconfig_path, &workload.namespace));
    args
}

fn disassociate_args(dir: &Path, association: &Association) -> Vec<String> {
    let pack = &association.svc_pack;
    let mut full = args(&[
        "dev",
        "associate",
        &pack.app,
        "-d",
        &pack.svc,
        "-t",
        &pack.svc_type,
        "-n",
        &pack.ns,
        "--de-associate",
        "-s",
    ]);
    full.push(dir.display().to_string());
    if let Some(kubeconfig) = &association.kubeconfig_path {
        full.push("--kubeconfig".to_string());
        full.push(kubeconfig.display().to_string());
    }
    full
}

fn command(prefix: &[&str], rest: Vec<String>) -> Vec<String> {
    let mut full = args(prefix);
    full.extend(rest);
    full
}

#[async_trait]
impl DevTool for NhctlCli {
    async fn auth_check(&self, workload: &WorkloadRef) -> Result<()> {
        let mut full = command(
            &["auth", "check"],
            cluster_args(&workload.kubeconfig_path, &workload.namespace),
        );
        full.extend(args(&[
            "--",
            "dev",
            "start",
            &workload.app_name,
            &format!("-t{}", workload.kind.as_arg()),
            &workload.name,
        ]));
        self.run(full).await.map(|_| ())
    }

    async fn associate_info(&self, workload: &WorkloadRef, container: &str) -> Result<Option<PathBuf>> {
        let mut full = command(&["dev", "associate"], workload_args(workload));
        full.extend(args(&["-c", container, "--info"]));
        let stdout = self.run(full).await?;
        let dir = stdout.trim();
        Ok((!dir.is_empty()).then(|| PathBuf::from(dir)))
    }

    async fn associate(&self, workload: &WorkloadRef, container: &str, dir: &Path) -> Result<()> {
        let mut full = command(&["dev", "associate"], workload_args(workload));
        full.extend(args(&["-c", container, "-s"]));
        full.push(dir.display().to_string());
        self.run(full).await.map(|_| ())
    }

    async fn associate_query_current(&self, dir: &Path) -> Result<Option<Association>> {
        let mut full = args(&["dev", "associate-queryer", "--current", "--json", "-s"]);
        full.push(dir.display().to_string());
        let stdout = self.run(full.clone()).await?;
        let stdout = stdout.trim();
        if stdout.is_empty() || stdout == "null" {
            return Ok(None);
        }
        self.parse_json(&full, stdout).map(Some)
    }

    async fn disassociate(&self, dir: &Path, association: &Association) -> Result<()> {
        self.run(disassociate_args(dir, association))
            .await
            .map(|_| ())
    }

    async fn profile_set(
        &self,
        workload: &WorkloadRef,
        container: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut full = command(&["profile", "set"], workload_args(workload));
        full.extend(args(&["--container", container, "--key", key, "--value", value]));
        self.run(full).await.map(|_| ())
    }

    async fn container_config(
        &self,
        workload: &WorkloadRef,
        container: &str,
    ) -> Result<Option<ContainerConfig>> {
        let full = command(&["config", "get"], workload_args(workload));
        let stdout = self.run(full.clone()).await?;
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let config: ServiceConfig = serde_yaml::from_str(&stdout).map_err(|err| {
            Error::external(&self.program_name(), &full, format!("unreadable config: {err}"))
        })?;
        Ok(config
            .containers
            .into_iter()
            .find(|candidate| candidate.name == container))
    }

    async fn image_for_container(&self, workload: &WorkloadRef, container: &str) -> Result<Option<String>> {
        Ok(self
            .container_config(workload, container)
            .await?
            .and_then(|config| config.dev.image)
            .filter(|image| !image.is_empty()))
    }

    async fn list_containers(&self, workload: &WorkloadRef) -> Result<Vec<String>> {
        let full = command(&["dev", "containers"], workload_args(workload));
        let stdout = self.run(full.clone()).await?;
        self.parse_json(&full, &stdout)
    }

    async fn dev_start(&self, request: &DevStart<'_>) -> Result<()> {
        let workload = request.workload;
        let mut full = command(&["dev", "start"], workload_args(workload));
        full.extend(args(&[
            "-c",
            request.container,
            "--image",
            request.image,
            "--mode",
            request.mode.as_str(),
            "--local-sync",
        ]));
        full.push(request.local_sync.display().to_string());
        if let Some(storage_class) = workload.storage_class.as_deref() {
            full.extend(args(&["--storage-class", storage_class]));
        }
        if let Some(header) = request.header.filter(|header| !header.is_empty()) {
            full.extend(args(&["--header", header]));
        }
        full.extend(workload.dev_start_append_command.iter().cloned());
        self.run(full).await.map(|_| ())
    }

    async fn sync_files(&self, workload: &WorkloadRef, container: &str) -> Result<()> {
        let mut full = command(&["sync"], workload_args(workload));
        full.extend(args(&["-c", container]));
        self.run(full).await.map(|_| ())
    }

    async fn dev_terminal(&self, workload: &WorkloadRef, container: &str) -> Result<TerminalHandle> {
        let mut full = command(&["dev", "terminal"], workload_args(workload));
        full.extend(args(&["-c", container]));
        debug!(command = %full.join(" "), "opening terminal");
        let child = TokioCommand::new(&self.program)
            .args(&full)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| Error::external(&self.program_name(), &full, err.to_string()))?;
        Ok(TerminalHandle::spawned(
            format!("{}/{}", workload.namespace, workload.name),
            child,
        ))
    }

    async fn dev_end(&self, workload: &WorkloadRef) -> Result<()> {
        self.run(command(&["dev", "end"], workload_args(workload)))
            .await
            .map(|_| ())
    }

    async fn kubeconfig(&self, path: &Path, op: KubeconfigOp) -> Result<()> {
        let mut full = args(&["kubeconfig", op.as_str(), "--kubeconfig"]);
        full.push(path.display().to_string());
        self.run(full).await.map(|_| ())
    }

    async fn list_namespaces(&self, kubeconfig: &Path) -> Result<Vec<String>> {
        let mut full = args(&["get", "namespace", "-o", "json", "--kubeconfig"]);
        full.push(kubeconfig.display().to_string());
        let stdout = self.run(full.clone()).await?;
        let list: List<Namespace> = self.parse_json(&full, &stdout)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|namespace| namespace.metadata.name)
            .collect())
    }

    async fn check_cluster(&self, kubeconfig: &Path) -> Result<HealthState> {
        let mut full = args(&["check", "cluster", "-o", "json", "--kubeconfig"]);
        full.push(kubeconfig.display().to_string());
        let stdout = self.run(full.clone()).await?;
        let check: ClusterCheck = self.parse_json(&full, &stdout)?;
        Ok(HealthState {
            code: check.code,
            message: check.info,
        })
    }

    async fn list_applications(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<String>> {
        let full = command(&["get", "app", "-o", "json"], cluster_args(kubeconfig, namespace));
        let stdout = self.run(full.clone()).await?;
        let items: Vec<NamedItem> = self.parse_json(&full, &stdout)?;
        Ok(items.into_iter().filter_map(NamedItem::into_name).collect())
    }

    async fn list_workloads(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        app: &str,
        kind: &WorkloadKind,
    ) -> Result<Vec<String>> {
        let mut full = args(&["get", kind.as_arg(), "-a", app, "-o", "json"]);
        full.extend(cluster_args(kubeconfig, namespace));
        let stdout = self.run(full.clone()).await?;
        let items: Vec<NamedItem> = self.parse_json(&full, &stdout)?;
        Ok(items.into_iter().filter_map(NamedItem::into_name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{Association, NamedItem, ServiceConfig, disassociate_args, workload_args};
    use crate::model::{WorkloadKind, WorkloadRef};
    use k8s_openapi::List;
    use k8s_openapi::api::core::v1::Namespace;
    use std::path::Path;

    const QUERY_RESULT: &str = r#"{
        "server": "staging",
        "kubeconfig_path": "/k/staging",
        "svc_pack": {"ns": "dev", "app": "default.application", "svc_type": "statefulset", "svc": "db", "container": "db"}
    }"#;

    #[test]
    fn association_query_result_parses() {
        let association: Association = serde_json::from_str(QUERY_RESULT).unwrap();
        assert_eq!(association.server, "staging");
        assert_eq!(association.svc_pack.svc_type, "statefulset");
        assert_eq!(association.svc_pack.container.as_deref(), Some("db"));
    }

    #[test]
    fn disassociate_targets_directory_and_workload() {
        let association: Association = serde_json::from_str(QUERY_RESULT).unwrap();
        assert_eq!(
            disassociate_args(Path::new("/src/db"), &association),
            vec![
                "dev",
                "associate",
                "default.application",
                "-d",
                "db",
                "-t",
                "statefulset",
                "-n",
                "dev",
                "--de-associate",
                "-s",
                "/src/db",
                "--kubeconfig",
                "/k/staging",
            ]
        );
    }

    #[test]
    fn workload_arguments_address_one_workload() {
        let workload = WorkloadRef::new("shop", WorkloadKind::StatefulSet, "db", "dev", "/k/1");
        assert_eq!(
            workload_args(&workload),
            vec!["shop", "-d", "db", "-t", "statefulset", "--kubeconfig", "/k/1", "-n", "dev"]
        );
    }

    #[test]
    fn container_config_yaml_exposes_git_url() {
        let raw = "containers:\n  - name: web\n    dev:\n      gitUrl: https://github.com/acme/web.git\n      image: node:14\n";
        let config: ServiceConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(
            config.containers[0].dev.git_url.as_deref(),
            Some("https://github.com/acme/web.git")
        );
        assert_eq!(config.containers[0].dev.image.as_deref(), Some("node:14"));
    }

    #[test]
    fn named_items_accept_plain_and_object_metadata() {
        let items: Vec<NamedItem> =
            serde_json::from_str(r#"[{"name":"a"},{"metadata":{"name":"b"}},{"name":""}]"#).unwrap();
        let names = items.into_iter().filter_map(NamedItem::into_name).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn namespace_list_parses_as_kubernetes_list() {
        let raw = r#"{"apiVersion":"v1","kind":"NamespaceList","metadata":{},"items":[
            {"apiVersion":"v1","kind":"Namespace","metadata":{"name":"dev"}}]}"#;
        let list: List<Namespace> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.items[0].metadata.name.as_deref(), Some("dev"));
    }
}
