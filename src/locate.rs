use crate::error::{Error, Result};
use crate::host::Host;
use crate::model::{WorkloadKind, WorkloadRef};
use crate::nhctl::{Association, DevTool};
use crate::tree::{TreeNode, locate, search_path};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Finds the tree node of the workload a source directory is associated with.
pub struct AssociationLocator {
    tool: Arc<dyn DevTool>,
    host: Arc<dyn Host>,
}

impl AssociationLocator {
    pub fn new(tool: Arc<dyn DevTool>, host: Arc<dyn Host>) -> Self {
        Self { tool, host }
    }

    /// A workload that cannot be found offers to drop the stale association.
    pub async fn locate(
        &self,
        dir: &Path,
        tree: &dyn TreeNode,
        cancel: &CancellationToken,
    ) -> Result<WorkloadRef> {
        let association = self
            .tool
            .associate_query_current(dir)
            .await?
            .ok_or_else(|| Error::NotAssociated {
                dir: dir.to_path_buf(),
            })?;
        let path = association_path(&association);

        match locate(tree, &path, cancel).await {
            Err(err @ Error::NotFound { .. }) => {
                warn!(error = %err, "Failed to get work node");
                self.offer_disassociate(dir, &association).await?;
                Err(err)
            }
            located => located,
        }
    }

    async fn offer_disassociate(&self, dir: &Path, association: &Association) -> Result<()> {
        let confirmed = self
            .host
            .confirm("Failed to get work node, whether to disassociate the workload?")
            .await?;
        if confirmed {
            self.tool.disassociate(dir, association).await?;
            info!(dir = %dir.display(), workload = %association.svc_pack.svc, "disassociated");
        }
        Ok(())
    }
}

fn association_path(association: &Association) -> Vec<String> {
    let pack = &association.svc_pack;
    let kind = WorkloadKind::from_token(&pack.svc_type)
        .unwrap_or_else(|| WorkloadKind::Custom(pack.svc_type.clone()));
    search_path(&association.server, &pack.ns, &pack.app, &kind, &pack.svc)
}
