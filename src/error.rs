use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication rejected ({code}): {message}")]
    Auth { code: i64, message: String },

    #[error("please login again {base_url}:{username}")]
    LoginRequired { base_url: String, username: String },

    #[error("api error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("token refresh failed: {0}")]
    Refresh(Arc<Error>),

    #[error("{program} {command} failed: {stderr}")]
    ExternalTool {
        program: String,
        command: String,
        stderr: String,
    },

    #[error("workload not found at {}", path.join(" > "))]
    NotFound { path: Vec<String> },

    #[error("{} is not associated with a workload, open your local source directory first", dir.display())]
    NotAssociated { dir: PathBuf },

    #[error("the service is already under developing: {namespace}/{workload}")]
    AlreadyDeveloping { namespace: String, workload: String },

    #[error("no git url found on workload {workload}")]
    NoGitUrl { workload: String },

    #[error("failed to clone {url}")]
    CloneFailed { url: String },

    #[error("{step} cancelled")]
    Cancelled { step: String },

    #[error("no clusters found for {0}")]
    NoClusters(String),

    #[error("invalid activation uri: {0}")]
    InvalidRequest(String),

    #[error("{workload} has no containers")]
    NoContainers { workload: String },

    #[error("unsupported git url {0:?}")]
    InvalidGitUrl(String),

    #[error("invalid account email {0:?}")]
    InvalidAccount(String),

    #[error("kubeconfig defines no clusters")]
    EmptyKubeconfig,

    #[error("state store error at {}: {message}", path.display())]
    State { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Workflow(Box<crate::workflow::WorkflowFailure>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    pub fn external(program: &str, args: &[String], stderr: impl Into<String>) -> Self {
        Self::ExternalTool {
            program: program.to_string(),
            command: args.join(" "),
            stderr: stderr.into(),
        }
    }

    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// True for failures that only new credentials can fix.
    pub fn needs_login(&self) -> bool {
        match self {
            Self::Auth { .. } | Self::LoginRequired { .. } => true,
            Self::Refresh(inner) => inner.needs_login(),
            Self::Workflow(failure) => failure.error.needs_login(),
            _ => false,
        }
    }
}

impl From<crate::workflow::WorkflowFailure> for Error {
    fn from(failure: crate::workflow::WorkflowFailure) -> Self {
        Self::Workflow(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
