use crate::error::{Error, Result};
use crate::kubeconfig::LocalCluster;
use crate::model::{ClusterRoot, DEFAULT_APPLICATION, DevSpace, WorkloadKind, WorkloadRef};
use crate::nhctl::DevTool;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WORKLOADS_FOLDER: &str = "Workloads";

/// One node of the resource tree: cluster, dev space, application, folder or workload.
#[async_trait]
pub trait TreeNode: Send + Sync {
    fn label(&self) -> String;

    /// Dev-space nodes match a path segment on their namespace rather than their label.
    fn namespace(&self) -> Option<String> {
        None
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>>;

    fn workload(&self) -> Option<WorkloadRef> {
        None
    }
}

fn matches_segment(node: &dyn TreeNode, segment: &str) -> bool {
    let wanted = segment.to_lowercase();
    match node.namespace() {
        Some(namespace) => namespace == wanted,
        None => node.label().to_lowercase() == wanted,
    }
}

/// Walks `path` from `root` one level at a time.
pub async fn locate(
    root: &dyn TreeNode,
    path: &[String],
    cancel: &CancellationToken,
) -> Result<WorkloadRef> {
    let not_found = || Error::NotFound {
        path: path.to_vec(),
    };

    let mut current: Option<Box<dyn TreeNode>> = None;
    for segment in path {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("locate workload"));
        }
        let parent: &dyn TreeNode = match &current {
            Some(node) => node.as_ref(),
            None => root,
        };
        let children = parent.children().await.map_err(|err| {
            warn!(node = %parent.label(), error = %err, "listing children failed");
            not_found()
        })?;
        let Some(next) = children
            .into_iter()
            .find(|child| matches_segment(child.as_ref(), segment))
        else {
            debug!(segment = %segment, "no matching child");
            return Err(not_found());
        };
        current = Some(next);
    }

    current
        .and_then(|node| node.workload())
        .ok_or_else(not_found)
}

/// Path from the tree root down to one workload.
pub fn search_path(
    cluster: &str,
    namespace: &str,
    app: &str,
    kind: &WorkloadKind,
    workload: &str,
) -> Vec<String> {
    let app = if app == DEFAULT_APPLICATION { "default" } else { app };
    vec![
        cluster.to_string(),
        namespace.to_string(),
        app.to_string(),
        WORKLOADS_FOLDER.to_string(),
        kind.title(),
        workload.to_string(),
    ]
}

/// A cluster shown at the top of the tree.
#[derive(Debug, Clone)]
pub struct ClusterSource {
    pub name: String,
    pub kubeconfig_path: PathBuf,
    /// Empty when namespaces are discovered from the cluster itself.
    pub dev_spaces: Vec<DevSpace>,
}

impl From<&LocalCluster> for ClusterSource {
    fn from(cluster: &LocalCluster) -> Self {
        Self {
            name: cluster.cluster_name.clone(),
            kubeconfig_path: cluster.kubeconfig_path.clone(),
            dev_spaces: Vec::new(),
        }
    }
}

impl From<&ClusterRoot> for ClusterSource {
    fn from(root: &ClusterRoot) -> Self {
        Self {
            name: root.cluster_name.clone(),
            kubeconfig_path: root.kubeconfig_path.clone(),
            dev_spaces: root.dev_spaces.clone(),
        }
    }
}

pub struct ClusterTree {
    clusters: Vec<ClusterSource>,
    tool: Arc<dyn DevTool>,
}

impl ClusterTree {
    pub fn new(clusters: Vec<ClusterSource>, tool: Arc<dyn DevTool>) -> Self {
        Self { clusters, tool }
    }
}

#[async_trait]
impl TreeNode for ClusterTree {
    fn label(&self) -> String {
        "clusters".to_string()
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        Ok(self
            .clusters
            .iter()
            .map(|cluster| {
                Box::new(ClusterNode {
                    source: cluster.clone(),
                    tool: self.tool.clone(),
                }) as Box<dyn TreeNode>
            })
            .collect())
    }
}

struct ClusterNode {
    source: ClusterSource,
    tool: Arc<dyn DevTool>,
}

#[async_trait]
impl TreeNode for ClusterNode {
    fn label(&self) -> String {
        self.source.name.clone()
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        let spaces = if self.source.dev_spaces.is_empty() {
            self.tool
                .list_namespaces(&self.source.kubeconfig_path)
                .await?
                .into_iter()
                .map(|namespace| DevSpace {
                    space_id: None,
                    space_name: namespace.clone(),
                    namespace,
                    kubeconfig_path: self.source.kubeconfig_path.clone(),
                    storage_class: None,
                    space_own_type: None,
                    dev_start_append_command: Vec::new(),
                })
                .collect()
        } else {
            self.source.dev_spaces.clone()
        };

        Ok(spaces
            .into_iter()
            .map(|space| {
                Box::new(DevSpaceNode {
                    space: Arc::new(space),
                    tool: self.tool.clone(),
                }) as Box<dyn TreeNode>
            })
            .collect())
    }
}

struct DevSpaceNode {
    space: Arc<DevSpace>,
    tool: Arc<dyn DevTool>,
}

#[async_trait]
impl TreeNode for DevSpaceNode {
    fn label(&self) -> String {
        self.space.space_name.clone()
    }

    fn namespace(&self) -> Option<String> {
        Some(self.space.namespace.clone())
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        let mut apps = self
            .tool
            .list_applications(&self.space.kubeconfig_path, &self.space.namespace)
            .await?;
        if !apps.iter().any(|app| app == DEFAULT_APPLICATION) {
            apps.push(DEFAULT_APPLICATION.to_string());
        }
        Ok(apps
            .into_iter()
            .map(|app| {
                Box::new(AppNode {
                    scope: Scope {
                        space: self.space.clone(),
                        app,
                        tool: self.tool.clone(),
                    },
                }) as Box<dyn TreeNode>
            })
            .collect())
    }
}

#[derive(Clone)]
struct Scope {
    space: Arc<DevSpace>,
    app: String,
    tool: Arc<dyn DevTool>,
}

struct AppNode {
    scope: Scope,
}

#[async_trait]
impl TreeNode for AppNode {
    fn label(&self) -> String {
        if self.scope.app == DEFAULT_APPLICATION {
            "default".to_string()
        } else {
            self.scope.app.clone()
        }
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        let folder: Box<dyn TreeNode> = Box::new(WorkloadsFolder {
            scope: self.scope.clone(),
        });
        Ok(vec![folder])
    }
}

struct WorkloadsFolder {
    scope: Scope,
}

#[async_trait]
impl TreeNode for WorkloadsFolder {
    fn label(&self) -> String {
        WORKLOADS_FOLDER.to_string()
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        Ok(WorkloadKind::BUILTIN
            .into_iter()
            .map(|kind| {
                Box::new(KindFolder {
                    scope: self.scope.clone(),
                    kind,
                }) as Box<dyn TreeNode>
            })
            .collect())
    }
}

struct KindFolder {
    scope: Scope,
    kind: WorkloadKind,
}

#[async_trait]
impl TreeNode for KindFolder {
    fn label(&self) -> String {
        self.kind.title()
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        let space = &self.scope.space;
        let names = self
            .scope
            .tool
            .list_workloads(
                &space.kubeconfig_path,
                &space.namespace,
                &self.scope.app,
                &self.kind,
            )
            .await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let mut workload = WorkloadRef::new(
                    self.scope.app.clone(),
                    self.kind.clone(),
                    name,
                    space.namespace.clone(),
                    space.kubeconfig_path.clone(),
                );
                workload.space_name = space.space_name.clone();
                workload.storage_class = space.storage_class.clone();
                workload.dev_start_append_command = space.dev_start_append_command.clone();
                Box::new(WorkloadNode { workload }) as Box<dyn TreeNode>
            })
            .collect())
    }
}

struct WorkloadNode {
    workload: WorkloadRef,
}

#[async_trait]
impl TreeNode for WorkloadNode {
    fn label(&self) -> String {
        self.workload.name.clone()
    }

    async fn children(&self) -> Result<Vec<Box<dyn TreeNode>>> {
        Ok(Vec::new())
    }

    fn workload(&self) -> Option<WorkloadRef> {
        Some(self.workload.clone())
    }
}
