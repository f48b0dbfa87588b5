use crate::model::{DEFAULT_APPLICATION, DevMode, WorkloadKind, WorkloadRef};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "forkdev",
    version,
    about = "Develop Kubernetes workloads in place, with your local source synced into the cluster."
)]
pub struct CliArgs {
    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_filter: String,

    /// Do not pick up a dev session handed off to the current directory
    #[arg(long, global = true)]
    pub no_resume: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Log in to a control-plane server and register its clusters
    Login {
        #[arg(long)]
        server: String,
        #[arg(long)]
        username: String,
        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// List registered accounts and local clusters
    Clusters,
    /// Fetch the clusters of one account, or of every account
    Refresh { id: Option<String> },
    /// Forget an account and its stored token
    Logout { id: String },
    /// Ask the server to recreate a dev space of an account
    ResetSpace { account: String, space_id: u64 },
    /// Enter or leave dev mode on a workload
    Dev {
        #[command(subcommand)]
        action: DevCommand,
    },
    /// Handle an activation link
    Open { uri: String },
    /// Attach to a dev session handed off to the current directory
    Resume,
    /// Find the workload the current directory is associated with
    Locate,
}

#[derive(Debug, Clone, Subcommand)]
pub enum DevCommand {
    Start {
        #[command(flatten)]
        target: WorkloadArgs,
        #[arg(short, long)]
        container: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long, default_value = "replace", value_parser = parse_mode)]
        mode: DevMode,
        /// Traffic header routed to the copy, such as `x-user=dev`
        #[arg(long)]
        header: Option<String>,
        /// Host command to run once the terminal is attached
        #[arg(long)]
        then: Option<String>,
    },
    End {
        #[command(flatten)]
        target: WorkloadArgs,
    },
}

#[derive(Debug, Clone, Args)]
pub struct WorkloadArgs {
    pub workload: String,

    #[arg(long)]
    pub kubeconfig: PathBuf,

    #[arg(short, long)]
    pub namespace: String,

    #[arg(short, long, default_value = DEFAULT_APPLICATION)]
    pub app: String,

    #[arg(short = 't', long = "type", default_value = "deployment", value_parser = parse_kind)]
    pub kind: WorkloadKind,

    #[arg(long)]
    pub storage_class: Option<String>,
}

impl WorkloadArgs {
    pub fn to_workload(&self) -> WorkloadRef {
        let mut workload = WorkloadRef::new(
            self.app.clone(),
            self.kind.clone(),
            self.workload.clone(),
            self.namespace.clone(),
            self.kubeconfig.clone(),
        );
        workload.storage_class = self.storage_class.clone();
        workload
    }
}

fn parse_mode(raw: &str) -> Result<DevMode, String> {
    DevMode::from_token(raw).ok_or_else(|| format!("unknown mode `{raw}`, expected replace or copy"))
}

fn parse_kind(raw: &str) -> Result<WorkloadKind, String> {
    WorkloadKind::from_token(raw).ok_or_else(|| "workload type must not be empty".to_string())
}
