use crate::credentials::{ApplicationDetail, CredentialStore};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::kubeconfig::{KubeconfigMaterializer, LocalClusters, cluster_name};
use crate::model::{DEFAULT_APPLICATION, DevMode, WorkloadKind, WorkloadRef};
use crate::nhctl::DevTool;
use crate::tree::{ClusterSource, ClusterTree, locate, search_path};
use crate::workflow::{DevModeRequest, WorkflowEngine, WorkflowOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AutoStartAction {
    Run,
    Debug,
    Stop,
}

impl AutoStartAction {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "run" => Some(Self::Run),
            "debug" => Some(Self::Debug),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Debug => "debug",
            Self::Stop => "stop",
        }
    }
}

/// Account data that may ride along on an activation link.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AccountHandoff {
    pub email: String,
    pub token: Option<String>,
    pub organization: String,
    pub app: String,
    pub service: String,
    pub environment: String,
}

/// A validated "open this workload in dev mode" link.
#[derive(Debug, Clone)]
pub struct AutoStartRequest {
    pub kubeconfig: String,
    pub namespace: String,
    pub application: String,
    pub kind: WorkloadKind,
    /// `workload_type` as it appeared in the link.
    pub workload_type: String,
    pub workload: String,
    pub action: AutoStartAction,
    pub account: Option<AccountHandoff>,
}

impl AutoStartRequest {
    pub fn from_uri(raw: &str) -> Result<Self> {
        let uri = Url::parse(raw.trim())?;
        let params = uri.query_pairs().into_owned().collect::<HashMap<_, _>>();
        let param = |name: &str| {
            params
                .get(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &str| {
            param(name).ok_or_else(|| Error::InvalidRequest(format!("missing `{name}`")))
        };

        let kubeconfig = required("kubeconfig")?;
        let namespace = required("namespace")?;
        let workload = required("workload")?;
        let workload_type = required("workload_type")?;
        let kind = WorkloadKind::from_token(&workload_type)
            .ok_or_else(|| Error::InvalidRequest("missing `workload_type`".to_string()))?;
        let action = required("action")?;
        let action = AutoStartAction::from_token(&action)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown action `{action}`")))?;

        let account = param("email").map(|email| AccountHandoff {
            email,
            token: param("token"),
            organization: param("organization").unwrap_or_default(),
            app: param("app").unwrap_or_default(),
            service: param("service").unwrap_or_default(),
            environment: param("env").unwrap_or_default(),
        });

        Ok(Self {
            kubeconfig,
            namespace,
            application: param("application").unwrap_or_else(|| DEFAULT_APPLICATION.to_string()),
            kind,
            workload_type,
            workload,
            action,
            account,
        })
    }

    fn application_detail(&self, account: &AccountHandoff) -> ApplicationDetail {
        ApplicationDetail {
            email: account.email.clone(),
            organization: account.organization.clone(),
            application: account.app.clone(),
            service: account.service.clone(),
            action: self.action.as_str().to_string(),
            kubeconfig: self.kubeconfig.clone(),
            workload_type: self.workload_type.clone(),
            namespace: self.namespace.clone(),
            environment: account.environment.clone(),
        }
    }
}

#[derive(Debug)]
pub enum UriOutcome {
    Started(WorkflowOutcome),
    Stopped(WorkloadRef),
}

/// Handles activation links: registers the cluster, finds the workload and drives dev mode.
pub struct UriActivation {
    credentials: CredentialStore,
    materializer: KubeconfigMaterializer,
    local_clusters: LocalClusters,
    tool: Arc<dyn DevTool>,
    host: Arc<dyn Host>,
    engine: Arc<WorkflowEngine>,
}

impl UriActivation {
    pub fn new(
        credentials: CredentialStore,
        materializer: KubeconfigMaterializer,
        local_clusters: LocalClusters,
        tool: Arc<dyn DevTool>,
        host: Arc<dyn Host>,
        engine: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            credentials,
            materializer,
            local_clusters,
            tool,
            host,
            engine,
        }
    }

    pub async fn handle(&self, request: &AutoStartRequest, cancel: &CancellationToken) -> Result<UriOutcome> {
        if let Some(account) = &request.account {
            self.remember_account(request, account);
        }

        let cluster = cluster_name(&request.kubeconfig)?;
        info!(cluster = %cluster, action = request.action.as_str(), workload = %request.workload, "activation link");

        if request.action != AutoStartAction::Stop {
            let record = self.materializer.materialize(&request.kubeconfig, None).await?;
            if self.local_clusters.append(&cluster, &record)?.is_some() {
                self.host.notify("Success add cluster");
            }
        }

        let sources = self
            .local_clusters
            .list()?
            .iter()
            .map(ClusterSource::from)
            .collect();
        let tree = ClusterTree::new(sources, self.tool.clone());
        let path = search_path(
            &cluster,
            &request.namespace,
            &request.application,
            &request.kind,
            &request.workload,
        );
        let workload = locate(&tree, &path, cancel).await.inspect_err(|err| {
            warn!(error = %err, "Failed to find workload node");
        })?;

        match request.action {
            AutoStartAction::Stop => {
                self.host.notify("Waiting for stopping dev mode...");
                self.engine.end(&workload).await?;
                Ok(UriOutcome::Stopped(workload))
            }
            action => {
                let command = (action == AutoStartAction::Debug).then(|| "debug".to_string());
                self.host
                    .notify(&format!("Waiting for entering {} mode...", action.as_str()));
                let outcome = self
                    .engine
                    .start(
                        workload,
                        DevMode::Replace,
                        DevModeRequest {
                            command,
                            ..DevModeRequest::default()
                        },
                    )
                    .await?;
                Ok(UriOutcome::Started(outcome))
            }
        }
    }

    fn remember_account(&self, request: &AutoStartRequest, account: &AccountHandoff) {
        if let Some(token) = account.token.as_deref()
            && let Err(err) = self.credentials.store_token(&account.email, token)
        {
            warn!(email = %account.email, error = %err, "could not store account token");
        }
        if let Err(err) = self
            .credentials
            .store_application(&request.application_detail(account))
        {
            warn!(email = %account.email, error = %err, "could not store application data");
        }
    }
}
