use crate::error::{Error, Result};
use crate::host::{GitCredentials, Host};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};
use url::Url;

/// Fetches workload source into a local directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// `Ok(false)` when every attempt failed or the user backed out.
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<bool>;
}

/// Where a repository lives, independent of the protocol used to reach it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepoLocation {
    pub host: String,
    pub owner: String,
    pub project: String,
}

/// Read by the inline credential helper; nothing about them is written to `.git/config`.
const USERNAME_ENV: &str = "FORKDEV_GIT_USERNAME";
const PASSWORD_ENV: &str = "FORKDEV_GIT_PASSWORD";
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { test \"$1\" = get || exit 0; \
    echo \"username=$FORKDEV_GIT_USERNAME\"; echo \"password=$FORKDEV_GIT_PASSWORD\"; }; f";

impl RepoLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || Error::InvalidGitUrl(raw.to_string());

        let (host, path) = if let Some(rest) = raw.strip_prefix("git@") {
            let (host, path) = rest.split_once(':').ok_or_else(invalid)?;
            (host.to_string(), path.to_string())
        } else {
            let url = Url::parse(raw)?;
            let host = url.host_str().ok_or_else(invalid)?;
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            (host, url.path().to_string())
        };

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let (owner, project) = path.rsplit_once('/').ok_or_else(invalid)?;
        if host.is_empty() || owner.is_empty() || project.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host,
            owner: owner.to_string(),
            project: project.to_string(),
        })
    }

    pub fn https_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host, self.owner, self.project)
    }

    pub fn ssh_url(&self) -> String {
        format!("git@{}:{}/{}.git", self.host, self.owner, self.project)
    }
}

/// Clones with the `git` binary: anonymous https, then ssh, then https with credentials.
pub struct GitCloner {
    program: PathBuf,
    host: Arc<dyn Host>,
}

impl GitCloner {
    pub fn new(program: impl Into<PathBuf>, host: Arc<dyn Host>) -> Self {
        Self {
            program: program.into(),
            host,
        }
    }

    async fn attempt(
        &self,
        label: &str,
        url: &str,
        dest: &Path,
        credentials: Option<&GitCredentials>,
    ) -> bool {
        info!(protocol = label, dest = %dest.display(), "git clone");
        let mut command = TokioCommand::new(&self.program);
        if let Some(credentials) = credentials {
            command
                .args(["-c", "credential.helper=", "-c", CREDENTIAL_HELPER])
                .env(USERNAME_ENV, &credentials.username)
                .env(PASSWORD_ENV, &credentials.password);
        }
        let output = command
            .arg("clone")
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!(protocol = label, stderr = %stderr.trim(), "git clone failed");
                false
            }
            Err(err) => {
                warn!(program = %self.program.display(), error = %err, "git could not be started");
                false
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for GitCloner {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<bool> {
        let location = RepoLocation::parse(url)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let https = location.https_url();
        if self.attempt("https", &https, dest, None).await {
            return Ok(true);
        }
        if self.attempt("ssh", &location.ssh_url(), dest, None).await {
            return Ok(true);
        }

        self.host
            .notify("You have to enter your credentials to clone the source code.");
        let Some(credentials) = self.host.git_credentials(&https).await? else {
            self.host.notify("Cancelled");
            return Ok(false);
        };
        Ok(self
            .attempt("https+credentials", &https, dest, Some(&credentials))
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::{GitCloner, RepoLocation, SourceFetcher};
    use crate::error::Error;
    use crate::host::GitCredentials;
    use crate::testing::FakeHost;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    #[test]
    fn parses_https_and_scp_forms() {
        let https = RepoLocation::parse("https://gitlab.corp.io/team/web.git").unwrap();
        assert_eq!(https.host, "gitlab.corp.io");
        assert_eq!(https.owner, "team");
        assert_eq!(https.project, "web");

        let ssh = RepoLocation::parse("git@github.com:acme/api.git").unwrap();
        assert_eq!(ssh.https_url(), "https://github.com/acme/api.git");
        assert_eq!(https.ssh_url(), "git@gitlab.corp.io:team/web.git");
    }

    #[test]
    fn keeps_nested_groups_and_ports() {
        let location = RepoLocation::parse("https://git.local:8443/group/sub/app").unwrap();
        assert_eq!(location.host, "git.local:8443");
        assert_eq!(location.owner, "group/sub");
        assert_eq!(location.project, "app");
    }

    #[test]
    fn rejects_urls_without_project() {
        assert!(RepoLocation::parse("https://github.com/").is_err());
        assert!(matches!(
            RepoLocation::parse("git@github.com"),
            Err(Error::InvalidGitUrl(_))
        ));
    }

    /// Stand-in `git` that logs `<url> <user>` per clone and only accepts `s3cret`.
    fn scripted_git(dir: &Path) -> (PathBuf, PathBuf) {
        let log = dir.join("clones.log");
        let script = dir.join("git");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
prev=""
url=""
for arg in "$@"; do
  if [ "$prev" = clone ]; then url="$arg"; fi
  prev="$arg"
done
echo "$url ${{FORKDEV_GIT_USERNAME:-anonymous}}" >> "{log}"
if [ "$FORKDEV_GIT_PASSWORD" = "s3cret" ]; then exit 0; fi
echo "authentication failed" >&2
exit 128
"#,
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    fn attempts(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn host_with(password: Option<&str>) -> Arc<FakeHost> {
        Arc::new(FakeHost {
            credentials: password.map(|password| GitCredentials {
                username: "dev".into(),
                password: password.into(),
            }),
            ..FakeHost::default()
        })
    }

    #[tokio::test]
    async fn prompted_credentials_are_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let (git, log) = scripted_git(dir.path());
        let host = host_with(Some("s3cret"));
        let cloner = GitCloner::new(git, host.clone());

        let cloned = cloner
            .clone_repo("git@github.com:acme/api.git", &dir.path().join("src/api"))
            .await
            .unwrap();

        assert!(cloned);
        assert_eq!(
            attempts(&log),
            vec![
                "https://github.com/acme/api.git anonymous",
                "git@github.com:acme/api.git anonymous",
                "https://github.com/acme/api.git dev",
            ]
        );
        assert_eq!(
            host.notices(),
            vec!["You have to enter your credentials to clone the source code."]
        );
    }

    #[tokio::test]
    async fn credentials_stay_out_of_the_clone_url() {
        let dir = tempfile::tempdir().unwrap();
        let (git, log) = scripted_git(dir.path());
        let cloner = GitCloner::new(git, host_with(Some("wrong")));

        let cloned = cloner
            .clone_repo("https://github.com/acme/api", &dir.path().join("api"))
            .await
            .unwrap();

        assert!(!cloned);
        let attempts = attempts(&log);
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|line| !line.contains("wrong")));
        assert!(attempts.iter().all(|line| !line.contains('@') || line.starts_with("git@")));
    }

    #[tokio::test]
    async fn cancelled_credentials_prompt_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (git, log) = scripted_git(dir.path());
        let host = host_with(None);
        let cloner = GitCloner::new(git, host.clone());

        let cloned = cloner
            .clone_repo("https://github.com/acme/api.git", &dir.path().join("api"))
            .await
            .unwrap();

        assert!(!cloned);
        assert_eq!(attempts(&log).len(), 2);
        assert_eq!(host.notices().last().map(String::as_str), Some("Cancelled"));
    }

    #[tokio::test]
    async fn missing_git_binary_is_a_failed_clone() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = GitCloner::new(dir.path().join("no-such-git"), host_with(None));
        let cloned = cloner
            .clone_repo("https://github.com/acme/api.git", &dir.path().join("api"))
            .await
            .unwrap();
        assert!(!cloned);
    }
}
