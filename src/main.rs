mod cli;
mod config;
mod credentials;
mod error;
mod git;
mod host;
mod kubeconfig;
mod locate;
mod model;
mod nhctl;
mod registry;
mod resume;
mod session;
mod state;
#[cfg(test)]
mod testing;
mod tree;
mod uri;
mod workflow;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{CliArgs, Command, DevCommand};
use config::Settings;
use credentials::CredentialStore;
use git::GitCloner;
use host::{ConsoleHost, Host, TerminalRegistry};
use kubeconfig::{KubeconfigMaterializer, LocalClusters};
use locate::AssociationLocator;
use model::{AccountSession, ClusterRoot, LoginInfo};
use nhctl::{DevTool, NhctlCli};
use registry::{Accounts, ClusterRegistry};
use session::http_client;
use state::{FileStateStore, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tree::{ClusterSource, ClusterTree};
use uri::{AutoStartRequest, UriActivation, UriOutcome};
use workflow::{DevModeRequest, WorkflowEngine, WorkflowOutcome};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let settings = Settings::load()?;
    settings.ensure_dirs()?;
    debug!(
        config = settings.source.as_deref().unwrap_or("<defaults>"),
        home = %settings.home_dir.display(),
        "settings loaded"
    );
    let runtime = Runtime::new(settings)?;

    if !args.no_resume && !matches!(args.command, Some(Command::Resume)) {
        runtime.resume_here().await?;
    }

    match args.command {
        None | Some(Command::Clusters) => runtime.print_clusters(),
        Some(Command::Resume) => {
            if !runtime.resume_here().await? {
                if runtime.engine.resume_record().is_pending()? {
                    println!("a dev session is waiting in another directory");
                } else {
                    println!("no dev session to resume in this directory");
                }
            }
            Ok(())
        }
        Some(Command::Login {
            server,
            username,
            password,
        }) => runtime.login(server, username, password).await,
        Some(Command::Refresh { id }) => runtime.refresh(id.as_deref()).await,
        Some(Command::Logout { id }) => runtime.logout(&id).await,
        Some(Command::ResetSpace { account, space_id }) => {
            runtime.reset_space(&account, space_id).await
        }
        Some(Command::Dev { action }) => runtime.dev(action).await,
        Some(Command::Open { uri }) => runtime.open(&uri).await,
        Some(Command::Locate) => runtime.locate().await,
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

struct Runtime {
    store: Arc<dyn StateStore>,
    tool: Arc<dyn DevTool>,
    host: Arc<ConsoleHost>,
    terminals: Arc<TerminalRegistry>,
    engine: Arc<WorkflowEngine>,
    accounts: Accounts,
    materializer: KubeconfigMaterializer,
    credentials: CredentialStore,
}

impl Runtime {
    fn new(settings: Settings) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(
            FileStateStore::open(settings.state_file()).context("failed to open state store")?,
        );
        let tool: Arc<dyn DevTool> = Arc::new(NhctlCli::new(&settings.nhctl_path));
        let host = Arc::new(ConsoleHost::new(std::env::current_dir().ok()));
        let terminals = Arc::new(TerminalRegistry::new());
        let fetcher = Arc::new(GitCloner::new(&settings.git_path, host.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            tool.clone(),
            fetcher,
            host.clone(),
            store.clone(),
            terminals.clone(),
            settings.projects_dir(),
            settings.default_images.clone(),
        ));
        let materializer =
            KubeconfigMaterializer::new(settings.kubeconfig_dir(), store.clone(), tool.clone());
        let http = http_client(settings.request_timeout).context("failed to build http client")?;
        let accounts = Accounts::new(
            http,
            ClusterRegistry::new(store.clone()),
            materializer.clone(),
            tool.clone(),
            settings.min_server_version.clone(),
        );

        Ok(Self {
            store,
            tool,
            host,
            terminals,
            engine,
            accounts,
            materializer,
            credentials: CredentialStore::new(settings.accounts_dir()),
        })
    }

    /// Attaches to a session an earlier run handed off to this directory.
    async fn resume_here(&self) -> Result<bool> {
        let Some(dir) = self.host.workspace_dir() else {
            return Ok(false);
        };
        let Some(state) = self.engine.resume_record().consume_if_matching(&dir)? else {
            return Ok(false);
        };
        let outcome = self.engine.resume(state).await?;
        self.finish(outcome).await?;
        Ok(true)
    }

    fn print_clusters(&self) -> Result<()> {
        let sessions = self.accounts.registry().list()?;
        let locals = LocalClusters::new(self.store.clone()).list()?;
        if sessions.is_empty() && locals.is_empty() {
            println!("no clusters yet, run `forkdev login` or open an activation link");
            return Ok(());
        }
        for session in sessions {
            print_session(&session);
        }
        for local in locals {
            println!(
                "local  {}  {}",
                local.cluster_name,
                local.kubeconfig_path.display()
            );
        }
        Ok(())
    }

    async fn login(&self, server: String, username: String, password: Option<String>) -> Result<()> {
        let password = match password {
            Some(password) => password,
            None => self
                .host
                .ask_secret("password")
                .await?
                .ok_or_else(|| anyhow!("a password is required to log in"))?,
        };
        let session = self
            .accounts
            .append_cluster_by_login_info(LoginInfo::new(server, username, password))
            .await
            .context("login failed")?;
        print_session(&session);

        let roots = self.accounts.refresh_roots(&session).await?;
        print_roots(&roots);
        Ok(())
    }

    async fn refresh(&self, id: Option<&str>) -> Result<()> {
        let sessions = match id {
            Some(id) => vec![
                self.accounts
                    .registry()
                    .get(id)?
                    .ok_or_else(|| anyhow!("no account with id {id}"))?,
            ],
            None => self.accounts.registry().list()?,
        };

        for session in sessions {
            match self.accounts.refresh_roots(&session).await {
                Ok(roots) => {
                    print_session(&session);
                    print_roots(&roots);
                }
                Err(err) if err.needs_login() => {
                    warn!(account = %session.id, error = %err, "account needs a new login");
                    self.host.notify(&err.to_string());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("refresh of {} failed", session.login.base_url));
                }
            }
        }
        Ok(())
    }

    async fn logout(&self, id: &str) -> Result<()> {
        let Some(session) = self.accounts.logout(id)? else {
            println!("no account with id {id}");
            return Ok(());
        };
        self.materializer.reconcile(&session.login, &[]).await;
        let email = session
            .user
            .email
            .as_deref()
            .unwrap_or(&session.login.username);
        if self.credentials.clear_token(email)? {
            debug!(email, "account token removed");
        }
        info!(account = %session.id, "logged out");
        Ok(())
    }

    async fn reset_space(&self, account: &str, space_id: u64) -> Result<()> {
        let session = self
            .accounts
            .registry()
            .get(account)?
            .ok_or_else(|| anyhow!("no account with id {account}"))?;
        let client = self.accounts.client_for(&session)?;
        client
            .reset_dev_space(space_id)
            .await
            .with_context(|| format!("failed to reset dev space {space_id}"))?;
        println!("dev space {space_id} is being recreated");
        Ok(())
    }

    async fn dev(&self, action: DevCommand) -> Result<()> {
        match action {
            DevCommand::Start {
                target,
                container,
                image,
                mode,
                header,
                then,
            } => {
                let request = DevModeRequest {
                    container,
                    image,
                    header,
                    command: then,
                };
                let outcome = self
                    .engine
                    .start(target.to_workload(), mode, request)
                    .await?;
                self.finish(outcome).await
            }
            DevCommand::End { target } => {
                let workload = target.to_workload();
                self.engine.end(&workload).await?;
                println!("dev mode ended for {workload}");
                Ok(())
            }
        }
    }

    async fn open(&self, uri: &str) -> Result<()> {
        let request = AutoStartRequest::from_uri(uri).context("invalid activation link")?;
        let activation = UriActivation::new(
            self.credentials.clone(),
            self.materializer.clone(),
            LocalClusters::new(self.store.clone()),
            self.tool.clone(),
            self.host.clone(),
            self.engine.clone(),
        );

        match activation.handle(&request, &interrupt_token()).await? {
            UriOutcome::Started(outcome) => self.finish(outcome).await,
            UriOutcome::Stopped(workload) => {
                println!("dev mode ended for {workload}");
                Ok(())
            }
        }
    }

    async fn locate(&self) -> Result<()> {
        let dir = self
            .host
            .workspace_dir()
            .ok_or_else(|| anyhow!("the current directory is not accessible"))?;

        let mut sources = Vec::new();
        for session in self.accounts.registry().list()? {
            match self.accounts.refresh_roots(&session).await {
                Ok(roots) => sources.extend(roots.iter().map(ClusterSource::from)),
                Err(err) => {
                    warn!(account = %session.id, error = %err, "account clusters unavailable");
                }
            }
        }
        let locals = LocalClusters::new(self.store.clone()).list()?;
        sources.extend(locals.iter().map(ClusterSource::from));

        let tree = ClusterTree::new(sources, self.tool.clone());
        let locator = AssociationLocator::new(self.tool.clone(), self.host.clone());
        let workload = locator.locate(&dir, &tree, &interrupt_token()).await?;
        println!(
            "{workload}  space {}  kubeconfig {}",
            workload.space_name,
            workload.kubeconfig_path.display()
        );
        Ok(())
    }

    async fn finish(&self, outcome: WorkflowOutcome) -> Result<()> {
        debug!(step = %outcome.state().step, "workflow finished");
        match outcome {
            WorkflowOutcome::Ready(state) => {
                println!("{} is in dev mode, container {}", state.workload, state.container);
                debug!(terminals = self.terminals.count(), "waiting on terminals");
                tokio::select! {
                    waited = self.terminals.wait_all() => waited?,
                    _ = tokio::signal::ctrl_c() => {
                        let workload = &state.workload;
                        let closed = self
                            .terminals
                            .dispose_app(&workload.space_name, &workload.app_name)
                            .await;
                        info!(app = %workload.app_name, closed, "terminals closed");
                    }
                }
            }
            WorkflowOutcome::Handoff(state) => {
                debug!(workload = %state.workload, "handed off");
            }
        }
        Ok(())
    }
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    cancel
}

fn print_session(session: &AccountSession) {
    println!(
        "{}  {}@{}  state {}",
        session.id, session.login.username, session.login.base_url, session.state.code
    );
}

fn print_roots(roots: &[ClusterRoot]) {
    for root in roots {
        println!(
            "  {}  {}  health {}",
            root.cluster_name,
            root.kubeconfig_path.display(),
            root.state.code
        );
        for space in &root.dev_spaces {
            println!(
                "    {} ({}) {}",
                space.space_name,
                space.namespace,
                space.space_own_type.as_deref().unwrap_or("-")
            );
        }
    }
}
