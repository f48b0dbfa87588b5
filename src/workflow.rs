use crate::error::{Error, Result};
use crate::git::SourceFetcher;
use crate::host::{Host, TerminalRegistry};
use crate::model::{DEV_CONTAINER_SENTINEL, DevMode, WorkloadRef};
use crate::nhctl::{DevStart, DevTool};
use crate::resume::ResumeRecord;
use crate::state::{StateStore, WorkloadMarkers};
use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STATUS_STARTING: &str = "starting";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkflowStep {
    Idle,
    AssociatingDirectory,
    ConfiguringProfile,
    ActivatingDevContainer,
    SyncingFiles,
    AttachingTerminal,
    Ready,
    Failed,
}

impl WorkflowStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Steps reached after the container marker was set to the sentinel.
    pub fn holds_dev_container(self) -> bool {
        matches!(
            self,
            Self::ActivatingDevContainer | Self::SyncingFiles | Self::AttachingTerminal
        )
    }
}

impl Display for WorkflowStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::AssociatingDirectory => "associating directory",
            Self::ConfiguringProfile => "configuring profile",
            Self::ActivatingDevContainer => "activating dev container",
            Self::SyncingFiles => "syncing files",
            Self::AttachingTerminal => "attaching terminal",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Where one dev-mode run stands, and everything it has resolved so far.
#[derive(Debug, Clone, PartialEq)]
pub struct DevModeState {
    pub workload: WorkloadRef,
    pub container: String,
    pub image: String,
    pub mode: DevMode,
    pub header: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub step: WorkflowStep,
    /// Host command dispatched once the terminal is attached.
    pub command: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DevModeState {
    pub fn new(workload: WorkloadRef, mode: DevMode) -> Self {
        Self {
            workload,
            container: String::new(),
            image: String::new(),
            mode,
            header: None,
            work_dir: None,
            step: WorkflowStep::Idle,
            command: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn transition_to(&mut self, step: WorkflowStep) {
        debug!(workload = %self.workload, from = %self.step, to = %step, "workflow step");
        self.step = step;
        if step.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DevModeRequest {
    pub container: Option<String>,
    pub image: Option<String>,
    pub header: Option<String>,
    pub command: Option<String>,
}

#[derive(Debug)]
pub enum WorkflowOutcome {
    /// Terminal attached in this process.
    Ready(DevModeState),
    /// The source lives elsewhere; a process started there picks the session up.
    Handoff(DevModeState),
}

impl WorkflowOutcome {
    pub fn state(&self) -> &DevModeState {
        match self {
            Self::Ready(state) | Self::Handoff(state) => state,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("dev mode failed while {}: {error}", .state.step_before_failure)]
pub struct WorkflowFailure {
    pub state: Box<FailedState>,
    #[source]
    pub error: Error,
}

#[derive(Debug, Clone)]
pub struct FailedState {
    pub state: DevModeState,
    pub step_before_failure: WorkflowStep,
}

enum Progress {
    Ready,
    Handoff,
}

pub struct WorkflowEngine {
    tool: Arc<dyn DevTool>,
    fetcher: Arc<dyn SourceFetcher>,
    host: Arc<dyn Host>,
    store: Arc<dyn StateStore>,
    terminals: Arc<TerminalRegistry>,
    resume: ResumeRecord,
    projects_dir: PathBuf,
    default_images: Vec<String>,
}

impl WorkflowEngine {
    pub fn new(
        tool: Arc<dyn DevTool>,
        fetcher: Arc<dyn SourceFetcher>,
        host: Arc<dyn Host>,
        store: Arc<dyn StateStore>,
        terminals: Arc<TerminalRegistry>,
        projects_dir: impl Into<PathBuf>,
        default_images: Vec<String>,
    ) -> Self {
        Self {
            tool,
            fetcher,
            host,
            resume: ResumeRecord::new(store.clone()),
            store,
            terminals,
            projects_dir: projects_dir.into(),
            default_images,
        }
    }

    pub fn resume_record(&self) -> &ResumeRecord {
        &self.resume
    }

    fn markers(&self) -> WorkloadMarkers<'_> {
        WorkloadMarkers::new(self.store.as_ref())
    }

    pub async fn start(
        &self,
        workload: WorkloadRef,
        mode: DevMode,
        request: DevModeRequest,
    ) -> std::result::Result<WorkflowOutcome, WorkflowFailure> {
        let mut state = DevModeState::new(workload, mode);
        state.header = request.header.clone();
        state.command = request.command.clone();
        info!(workload = %state.workload, mode = mode.as_str(), "starting dev mode");

        let result = match self.ensure_not_developing(&state.workload) {
            Ok(()) => self.run(&mut state, &request).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(Progress::Ready) => Ok(WorkflowOutcome::Ready(state)),
            Ok(Progress::Handoff) => Ok(WorkflowOutcome::Handoff(state)),
            Err(err @ Error::AlreadyDeveloping { .. }) => Err(self.reject(state, err)),
            Err(err) => Err(self.fail(state, err)),
        }
    }

    /// Continues a session handed off by an earlier process.
    pub async fn resume(
        &self,
        mut state: DevModeState,
    ) -> std::result::Result<WorkflowOutcome, WorkflowFailure> {
        info!(workload = %state.workload, "resuming dev mode");
        match self.attach(&mut state).await {
            Ok(()) => Ok(WorkflowOutcome::Ready(state)),
            Err(err) => Err(self.fail(state, err)),
        }
    }

    /// Leaves dev mode and closes the workload's terminals.
    pub async fn end(&self, workload: &WorkloadRef) -> Result<()> {
        info!(workload = %workload, "ending dev mode");
        self.tool.dev_end(workload).await?;
        let id = workload.state_id();
        let markers = self.markers();
        markers.clear_container(&id)?;
        markers.clear_status(&id)?;
        let closed = self
            .terminals
            .dispose_workload(&workload.space_name, &workload.app_name, &workload.name)
            .await;
        debug!(workload = %workload, closed, "terminals disposed");
        Ok(())
    }

    fn ensure_not_developing(&self, workload: &WorkloadRef) -> Result<()> {
        let marker = self.markers().container(&workload.state_id())?;
        if marker.as_deref() == Some(DEV_CONTAINER_SENTINEL) {
            return Err(already_developing(workload));
        }
        Ok(())
    }

    async fn run(&self, state: &mut DevModeState, request: &DevModeRequest) -> Result<Progress> {
        if state.workload.kind.is_builtin() {
            self.tool.auth_check(&state.workload).await?;
        }
        state.container = self.resolve_container(&state.workload, request).await?;

        state.transition_to(WorkflowStep::AssociatingDirectory);
        let work_dir = self.associate_directory(state).await?;
        state.work_dir = Some(work_dir.clone());

        state.transition_to(WorkflowStep::ConfiguringProfile);
        state.image = self.resolve_image(state, request).await?;
        self.tool
            .profile_set(&state.workload, &state.container, "image", &state.image)
            .await?;

        self.resume.snapshot(state, &work_dir)?;

        state.transition_to(WorkflowStep::ActivatingDevContainer);
        self.activate(state, &work_dir).await?;

        state.transition_to(WorkflowStep::SyncingFiles);
        self.tool
            .sync_files(&state.workload, &state.container)
            .await?;
        self.markers().clear_status(&state.workload.state_id())?;

        if self.host.workspace_dir().as_deref() != Some(work_dir.as_path()) {
            info!(dir = %work_dir.display(), "handing off to the source directory");
            self.host.open_folder(&work_dir).await?;
            return Ok(Progress::Handoff);
        }

        self.attach(state).await?;
        Ok(Progress::Ready)
    }

    async fn resolve_container(&self, workload: &WorkloadRef, request: &DevModeRequest) -> Result<String> {
        if let Some(container) = request.container.as_ref().filter(|name| !name.is_empty()) {
            return Ok(container.clone());
        }
        if let Some(container) = self.markers().container(&workload.state_id())? {
            return Ok(container);
        }

        let containers = self.tool.list_containers(workload).await?;
        if containers.iter().any(|name| name == DEV_CONTAINER_SENTINEL) {
            return Err(already_developing(workload));
        }
        match containers.as_slice() {
            [] => Err(Error::NoContainers {
                workload: workload.to_string(),
            }),
            [only] => Ok(only.clone()),
            many => self
                .host
                .select_container(many)
                .await?
                .ok_or_else(|| Error::cancelled("select container")),
        }
    }

    async fn associate_directory(&self, state: &DevModeState) -> Result<PathBuf> {
        let workload = &state.workload;
        let container = state.container.as_str();
        let workspace = self.host.workspace_dir();

        match self.tool.associate_info(workload, container).await? {
            Some(dir) if workspace.as_ref() == Some(&dir) => {
                debug!(dir = %dir.display(), "associated directory is the workspace");
                Ok(dir)
            }
            Some(dir) if dir.exists() => Ok(dir),
            Some(missing) => {
                warn!(dir = %missing.display(), "associated directory no longer exists");
                let dir = self
                    .host
                    .choose_directory("The directory does not exist, choose a new source code directory")
                    .await?
                    .ok_or_else(|| Error::cancelled("associate directory"))?;
                self.tool.associate(workload, container, &dir).await?;
                Ok(dir)
            }
            None => {
                let dir = self.clone_source(workload, container).await?;
                self.tool.associate(workload, container, &dir).await?;
                Ok(dir)
            }
        }
    }

    async fn clone_source(&self, workload: &WorkloadRef, container: &str) -> Result<PathBuf> {
        let git_url = self
            .tool
            .container_config(workload, container)
            .await?
            .and_then(|config| config.dev.git_url)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::NoGitUrl {
                workload: workload.name.clone(),
            })?;

        let dest = self.project_dir(workload);
        if dest.exists() {
            debug!(dir = %dest.display(), "reusing existing source directory");
            return Ok(dest);
        }

        info!(url = %git_url, dest = %dest.display(), "cloning source");
        let (saved, cloned) = tokio::join!(
            self.tool.profile_set(workload, container, "gitUrl", &git_url),
            self.fetcher.clone_repo(&git_url, &dest),
        );
        saved?;
        if !cloned? {
            return Err(Error::CloneFailed { url: git_url });
        }
        Ok(dest)
    }

    fn project_dir(&self, workload: &WorkloadRef) -> PathBuf {
        self.projects_dir
            .join(&workload.app_name)
            .join(&workload.name)
    }

    async fn resolve_image(&self, state: &DevModeState, request: &DevModeRequest) -> Result<String> {
        if let Some(image) = request.image.as_ref().filter(|image| !image.is_empty()) {
            return Ok(image.clone());
        }
        if let Some(image) = self
            .tool
            .image_for_container(&state.workload, &state.container)
            .await?
        {
            return Ok(image);
        }
        self.host
            .select_image(&self.default_images)
            .await?
            .ok_or_else(|| Error::cancelled("select image"))
    }

    async fn activate(&self, state: &DevModeState, work_dir: &Path) -> Result<()> {
        let id = state.workload.state_id();
        let markers = self.markers();
        markers.set_status(&id, STATUS_STARTING)?;
        markers.set_container(&id, DEV_CONTAINER_SENTINEL)?;

        self.tool
            .dev_start(&DevStart {
                workload: &state.workload,
                container: &state.container,
                image: &state.image,
                mode: state.mode,
                local_sync: work_dir,
                header: state.header.as_deref(),
            })
            .await
    }

    async fn attach(&self, state: &mut DevModeState) -> Result<()> {
        if state.step != WorkflowStep::AttachingTerminal {
            state.transition_to(WorkflowStep::AttachingTerminal);
        }
        let workload = &state.workload;
        let terminal = self
            .tool
            .dev_terminal(workload, DEV_CONTAINER_SENTINEL)
            .await?;
        self.terminals
            .register(&workload.space_name, &workload.app_name, &workload.name, terminal);

        if let Some(command) = state.command.as_deref() {
            self.host.dispatch_command(command).await?;
        }

        self.resume.clear()?;
        state.transition_to(WorkflowStep::Ready);
        info!(workload = %state.workload, "dev mode ready");
        Ok(())
    }

    /// Another session owns the workload: nothing of ours to undo.
    fn reject(&self, mut state: DevModeState, err: Error) -> WorkflowFailure {
        warn!(workload = %state.workload, "{err}");
        self.host.notify(&err.to_string());
        let step_before_failure = state.step;
        state.error = Some(err.to_string());
        state.transition_to(WorkflowStep::Failed);
        WorkflowFailure {
            state: Box::new(FailedState {
                state,
                step_before_failure,
            }),
            error: err,
        }
    }

    fn fail(&self, mut state: DevModeState, err: Error) -> WorkflowFailure {
        error!(workload = %state.workload, step = %state.step, error = %err, "dev mode failed");
        let id = state.workload.state_id();
        let markers = self.markers();
        if let Err(cleanup) = markers.clear_status(&id) {
            warn!(error = %cleanup, "failed to clear status marker");
        }
        if state.step.holds_dev_container()
            && let Err(cleanup) = markers.clear_container(&id)
        {
            warn!(error = %cleanup, "failed to clear container marker");
        }
        if let Err(cleanup) = self.resume.clear() {
            warn!(error = %cleanup, "failed to clear resume record");
        }

        self.host.notify(&err.to_string());
        let step_before_failure = state.step;
        state.error = Some(err.to_string());
        state.transition_to(WorkflowStep::Failed);
        WorkflowFailure {
            state: Box::new(FailedState {
                state,
                step_before_failure,
            }),
            error: err,
        }
    }
}

fn already_developing(workload: &WorkloadRef) -> Error {
    Error::AlreadyDeveloping {
        namespace: workload.namespace.clone(),
        workload: workload.name.clone(),
    }
}
