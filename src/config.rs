use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MIN_SERVER_VERSION: &str = "0.4.0";

#[derive(Debug, Clone)]
pub struct Settings {
    pub source: Option<String>,
    pub home_dir: PathBuf,
    pub nhctl_path: PathBuf,
    pub git_path: PathBuf,
    pub request_timeout: Duration,
    pub min_server_version: semver::Version,
    pub default_images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ForkdevConfigFile {
    #[serde(default)]
    home_dir: Option<PathBuf>,
    #[serde(default, alias = "nhctl")]
    nhctl_path: Option<PathBuf>,
    #[serde(default, alias = "git")]
    git_path: Option<PathBuf>,
    #[serde(
        default = "default_request_timeout_secs",
        alias = "timeout",
        alias = "timeout_secs"
    )]
    request_timeout_secs: u64,
    #[serde(default)]
    min_server_version: Option<String>,
    #[serde(default, alias = "images")]
    default_images: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        match discover_config_path() {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                let parsed: ForkdevConfigFile = serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?;
                Self::from_file(Some(path.display().to_string()), parsed)
            }
            None => Self::from_file(None, ForkdevConfigFile {
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                ..ForkdevConfigFile::default()
            }),
        }
    }

    fn from_file(source: Option<String>, parsed: ForkdevConfigFile) -> Result<Self> {
        let nh_dir = nh_dir()?;
        let home_dir = parsed
            .home_dir
            .unwrap_or_else(|| nh_dir.join("vscode-plugin"));
        let nhctl_path = parsed
            .nhctl_path
            .unwrap_or_else(|| discover_nhctl(&nh_dir.join("bin")));
        let min_server_version = parsed
            .min_server_version
            .as_deref()
            .unwrap_or(DEFAULT_MIN_SERVER_VERSION);
        let min_server_version = semver::Version::parse(min_server_version.trim_start_matches('v'))
            .with_context(|| format!("invalid min_server_version {min_server_version}"))?;
        let default_images = if parsed.default_images.is_empty() {
            default_dev_images()
        } else {
            parsed.default_images
        };

        Ok(Self {
            source,
            home_dir,
            nhctl_path,
            git_path: parsed.git_path.unwrap_or_else(|| PathBuf::from("git")),
            request_timeout: Duration::from_secs(parsed.request_timeout_secs.max(1)),
            min_server_version,
            default_images,
        })
    }

    pub fn kubeconfig_dir(&self) -> PathBuf {
        self.home_dir.join("kubeConfigs")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.home_dir.join("projects")
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.home_dir.join("accounts")
    }

    pub fn state_file(&self) -> PathBuf {
        self.home_dir.join("state.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.home_dir.clone(),
            self.kubeconfig_dir(),
            self.projects_dir(),
            self.accounts_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_dev_images() -> Vec<String> {
    ["java:11", "ruby:3.0", "node:14", "python:3.9", "golang:1.16", "perl:latest", "rust:latest", "php:latest"]
        .iter()
        .map(|tag| format!("nocalhost-docker.pkg.coding.net/nocalhost/dev-images/{tag}"))
        .collect()
}

fn nh_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".nh"))
}

fn discover_nhctl(bin_dir: &Path) -> PathBuf {
    let bundled = bin_dir.join(if cfg!(windows) { "nhctl.exe" } else { "nhctl" });
    if bundled.exists() {
        return bundled;
    }
    which::which("nhctl").unwrap_or_else(|_| PathBuf::from("nhctl"))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FORKDEV_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("forkdev.yaml"),
        PathBuf::from("forkdev.yml"),
        PathBuf::from(".forkdev.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Some(config_dir) = dirs::home_dir().map(|home| home.join(".config/forkdev")) {
        let user_candidates = [config_dir.join("config.yaml"), config_dir.join("config.yml")];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{ForkdevConfigFile, Settings};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn empty_file_uses_defaults() {
        let parsed: ForkdevConfigFile = serde_yaml::from_str("{}").unwrap();
        let settings = Settings::from_file(None, parsed).unwrap();
        assert_eq!(settings.request_timeout, Duration::from_secs(20));
        assert_eq!(settings.min_server_version, semver::Version::new(0, 4, 0));
        assert!(settings.home_dir.ends_with(".nh/vscode-plugin"));
        assert_eq!(settings.default_images.len(), 8);
    }

    #[test]
    fn file_overrides_paths_and_timeout() {
        let parsed: ForkdevConfigFile = serde_yaml::from_str(
            "home_dir: /tmp/forkdev\nnhctl: /opt/nhctl\ntimeout: 5\nmin_server_version: v1.2.3\nimages: [img:1]\n",
        )
        .unwrap();
        let settings = Settings::from_file(Some("test".into()), parsed).unwrap();
        assert_eq!(settings.nhctl_path, PathBuf::from("/opt/nhctl"));
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.kubeconfig_dir(), PathBuf::from("/tmp/forkdev/kubeConfigs"));
        assert_eq!(settings.min_server_version, semver::Version::new(1, 2, 3));
        assert_eq!(settings.default_images, vec!["img:1".to_string()]);
    }

    #[test]
    fn invalid_server_version_is_rejected() {
        let parsed: ForkdevConfigFile =
            serde_yaml::from_str("min_server_version: latest\n").unwrap();
        assert!(Settings::from_file(None, parsed).is_err());
    }
}
