use crate::error::{Error, Result};
use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const TERMINAL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

/// What the surrounding environment (an IDE, or the console) offers the core.
#[async_trait]
pub trait Host: Send + Sync {
    fn workspace_dir(&self) -> Option<PathBuf>;

    /// Reopens the environment at `dir`; the current process is expected to end.
    async fn open_folder(&self, dir: &Path) -> Result<()>;

    async fn select_container(&self, containers: &[String]) -> Result<Option<String>>;

    async fn select_image(&self, images: &[String]) -> Result<Option<String>>;

    async fn choose_directory(&self, reason: &str) -> Result<Option<PathBuf>>;

    async fn git_credentials(&self, url: &str) -> Result<Option<GitCredentials>>;

    async fn confirm(&self, question: &str) -> Result<bool>;

    async fn dispatch_command(&self, command: &str) -> Result<()>;

    fn notify(&self, message: &str);
}

/// Line-oriented host over stdin and stderr.
pub struct ConsoleHost {
    workspace: Option<PathBuf>,
    input: AsyncMutex<BufReader<Stdin>>,
}

impl ConsoleHost {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        Self {
            workspace,
            input: AsyncMutex::new(BufReader::new(tokio::io::stdin())),
        }
    }

    pub async fn ask(&self, question: &str) -> Result<Option<String>> {
        prompt(question).await?;
        let mut line = String::new();
        let read = self.input.lock().await.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let answer = line.trim();
        Ok((!answer.is_empty()).then(|| answer.to_string()))
    }

    /// Like `ask`, without echoing what is typed when stdin is a terminal.
    pub async fn ask_secret(&self, question: &str) -> Result<Option<String>> {
        if !std::io::stdin().is_terminal() {
            return self.ask(question).await;
        }
        let _input = self.input.lock().await;
        prompt(question).await?;
        tokio::task::spawn_blocking(read_secret)
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))?
    }

    async fn pick(&self, title: &str, options: &[String]) -> Result<Option<String>> {
        if options.is_empty() {
            return Ok(None);
        }
        let mut menu = format!("{title}\n");
        for (index, option) in options.iter().enumerate() {
            menu.push_str(&format!("  {}) {option}\n", index + 1));
        }
        eprint!("{menu}");

        let Some(answer) = self.ask("number or value").await? else {
            return Ok(None);
        };
        if let Ok(index) = answer.parse::<usize>()
            && let Some(option) = index.checked_sub(1).and_then(|index| options.get(index))
        {
            return Ok(Some(option.clone()));
        }
        Ok(Some(answer))
    }
}

#[async_trait]
impl Host for ConsoleHost {
    fn workspace_dir(&self) -> Option<PathBuf> {
        self.workspace.clone()
    }

    async fn open_folder(&self, dir: &Path) -> Result<()> {
        info!(dir = %dir.display(), "continue in the source directory");
        eprintln!(
            "source is ready at {}\nrun `forkdev resume` from that directory to attach",
            dir.display()
        );
        Ok(())
    }

    async fn select_container(&self, containers: &[String]) -> Result<Option<String>> {
        self.pick("Please select a container", containers).await
    }

    async fn select_image(&self, images: &[String]) -> Result<Option<String>> {
        self.pick("Please select the image you want to develop with", images)
            .await
    }

    async fn choose_directory(&self, reason: &str) -> Result<Option<PathBuf>> {
        Ok(self.ask(reason).await?.map(PathBuf::from))
    }

    async fn git_credentials(&self, url: &str) -> Result<Option<GitCredentials>> {
        let Some(username) = self.ask(&format!("username for {url}")).await? else {
            return Ok(None);
        };
        let Some(password) = self.ask_secret("password").await? else {
            return Ok(None);
        };
        Ok(Some(GitCredentials { username, password }))
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        let answer = self.ask(&format!("{question} [y/N]")).await?;
        Ok(answer.is_some_and(|answer| matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")))
    }

    async fn dispatch_command(&self, command: &str) -> Result<()> {
        info!(command, "follow-up command requested");
        Ok(())
    }

    fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

async fn prompt(question: &str) -> Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(format!("{question}: ").as_bytes()).await?;
    stderr.flush().await?;
    Ok(())
}

#[derive(Debug, Eq, PartialEq)]
enum SecretInput {
    Pending,
    Submitted,
    Cancelled,
}

fn secret_key(buffer: &mut String, key: KeyEvent) -> SecretInput {
    if key.kind == KeyEventKind::Release {
        return SecretInput::Pending;
    }
    match key.code {
        KeyCode::Enter => SecretInput::Submitted,
        KeyCode::Esc => SecretInput::Cancelled,
        KeyCode::Char('c' | 'd') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            SecretInput::Cancelled
        }
        KeyCode::Backspace => {
            buffer.pop();
            SecretInput::Pending
        }
        KeyCode::Char(ch) => {
            buffer.push(ch);
            SecretInput::Pending
        }
        _ => SecretInput::Pending,
    }
}

fn read_secret() -> Result<Option<String>> {
    enable_raw_mode()?;
    let read = read_secret_keys();
    let restored = disable_raw_mode();
    eprintln!();
    restored?;
    read
}

fn read_secret_keys() -> Result<Option<String>> {
    let mut buffer = String::new();
    loop {
        if let Event::Key(key) = event::read()? {
            match secret_key(&mut buffer, key) {
                SecretInput::Pending => {}
                SecretInput::Submitted => return Ok((!buffer.is_empty()).then_some(buffer)),
                SecretInput::Cancelled => return Ok(None),
            }
        }
    }
}

/// A terminal session attached to a dev container.
#[derive(Debug)]
pub struct TerminalHandle {
    label: String,
    child: Option<Child>,
}

impl TerminalHandle {
    pub fn spawned(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            child: Some(child),
        }
    }

    #[cfg(test)]
    pub fn detached(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            child: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn dispose(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(err) = child.kill().await
        {
            warn!(terminal = %self.label, error = %err, "terminal dispose failed");
        }
    }

    /// `true` once the terminal has exited; never blocks.
    fn poll_exit(&mut self) -> Result<bool> {
        let Some(child) = self.child.as_mut() else {
            return Ok(true);
        };
        let Some(status) = child.try_wait()? else {
            return Ok(false);
        };
        self.child = None;
        exited(&self.label, status).map(|()| true)
    }
}

fn exited(label: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::ExternalTool {
            program: "terminal".to_string(),
            command: label.to_string(),
            stderr: format!("exited with {status}"),
        })
    }
}

type TerminalKey = (String, String, String);

/// Open terminals keyed by (dev space, application, workload).
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    terminals: Mutex<HashMap<TerminalKey, Vec<TerminalHandle>>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, matches: impl Fn(&TerminalKey) -> bool) -> Vec<TerminalHandle> {
        let Ok(mut terminals) = self.terminals.lock() else {
            return Vec::new();
        };
        let keys = terminals
            .keys()
            .filter(|key| matches(key))
            .cloned()
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|key| terminals.remove(&key))
            .flatten()
            .collect()
    }

    pub fn register(&self, space: &str, app: &str, workload: &str, handle: TerminalHandle) {
        debug!(terminal = handle.label(), "terminal registered");
        if let Ok(mut terminals) = self.terminals.lock() {
            terminals
                .entry((space.to_string(), app.to_string(), workload.to_string()))
                .or_default()
                .push(handle);
        }
    }

    pub fn count(&self) -> usize {
        self.terminals
            .lock()
            .map(|terminals| terminals.values().map(Vec::len).sum())
            .unwrap_or_default()
    }

    pub async fn dispose_workload(&self, space: &str, app: &str, workload: &str) -> usize {
        let handles = self.take(|(s, a, w)| s == space && a == app && w == workload);
        dispose_all(handles).await
    }

    pub async fn dispose_app(&self, space: &str, app: &str) -> usize {
        let handles = self.take(|(s, a, _)| s == space && a == app);
        dispose_all(handles).await
    }

    /// Waits for every registered terminal to exit. Handles stay registered
    /// while running, so dropping this future leaves them to `dispose_*`.
    pub async fn wait_all(&self) -> Result<()> {
        while self.reap()? > 0 {
            tokio::time::sleep(TERMINAL_POLL).await;
        }
        Ok(())
    }

    /// Drops exited terminals and returns how many are still running.
    fn reap(&self) -> Result<usize> {
        let Ok(mut terminals) = self.terminals.lock() else {
            return Ok(0);
        };
        let mut failure = None;
        for handles in terminals.values_mut() {
            handles.retain_mut(|handle| match handle.poll_exit() {
                Ok(exited) => !exited,
                Err(err) => {
                    failure.get_or_insert(err);
                    false
                }
            });
        }
        terminals.retain(|_, handles| !handles.is_empty());
        match failure {
            Some(err) => Err(err),
            None => Ok(terminals.values().map(Vec::len).sum()),
        }
    }
}

async fn dispose_all(handles: Vec<TerminalHandle>) -> usize {
    let count = handles.len();
    for mut handle in handles {
        handle.dispose().await;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::{SecretInput, TerminalHandle, TerminalRegistry, secret_key};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use std::time::Duration;

    fn sleeper(seconds: &str) -> tokio::process::Child {
        tokio::process::Command::new("sleep")
            .arg(seconds)
            .spawn()
            .unwrap()
    }

    fn alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn dispose_workload_only_touches_its_terminals() {
        let registry = TerminalRegistry::new();
        registry.register("dev", "shop", "cart", TerminalHandle::detached("cart"));
        registry.register("dev", "shop", "cart", TerminalHandle::detached("cart-2"));
        registry.register("dev", "shop", "api", TerminalHandle::detached("api"));

        assert_eq!(registry.dispose_workload("dev", "shop", "cart").await, 2);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.dispose_workload("dev", "shop", "cart").await, 0);
    }

    #[tokio::test]
    async fn dispose_app_clears_every_workload() {
        let registry = TerminalRegistry::new();
        registry.register("dev", "shop", "cart", TerminalHandle::detached("cart"));
        registry.register("dev", "shop", "api", TerminalHandle::detached("api"));
        registry.register("qa", "shop", "api", TerminalHandle::detached("qa-api"));

        assert_eq!(registry.dispose_app("dev", "shop").await, 2);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn spawned_terminal_is_killed_on_dispose() {
        let child = sleeper("30");
        let pid = child.id().unwrap();
        let mut handle = TerminalHandle::spawned("sleeper", child);
        handle.dispose().await;
        assert!(handle.poll_exit().unwrap());
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn interrupted_wait_leaves_terminals_disposable() {
        let registry = TerminalRegistry::new();
        let child = sleeper("30");
        let pid = child.id().unwrap();
        registry.register("dev", "shop", "web", TerminalHandle::spawned("web", child));

        let closed = tokio::select! {
            waited = registry.wait_all() => panic!("wait ended early: {waited:?}"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {
                registry.dispose_app("dev", "shop").await
            }
        };

        assert_eq!(closed, 1);
        assert_eq!(registry.count(), 0);
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn wait_all_returns_once_terminals_exit() {
        let registry = TerminalRegistry::new();
        registry.register("dev", "shop", "web", TerminalHandle::spawned("web", sleeper("0")));
        registry.register("dev", "shop", "api", TerminalHandle::detached("api"));

        tokio::time::timeout(Duration::from_secs(10), registry.wait_all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn secret_input_edits_and_submits() {
        let mut buffer = String::new();
        for ch in "pw9".chars() {
            assert_eq!(
                secret_key(&mut buffer, KeyEvent::new(KeyCode::Char(ch), KeyModifiers::NONE)),
                SecretInput::Pending
            );
        }
        secret_key(&mut buffer, KeyEvent::new(KeyCode::Backspace, KeyModifiers::NONE));
        assert_eq!(buffer, "pw");
        assert_eq!(
            secret_key(&mut buffer, KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)),
            SecretInput::Submitted
        );
    }

    #[test]
    fn ctrl_c_cancels_secret_input() {
        let mut buffer = String::from("half");
        assert_eq!(
            secret_key(&mut buffer, KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            SecretInput::Cancelled
        );
    }
}
