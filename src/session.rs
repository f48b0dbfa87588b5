use crate::error::{Error, Result};
use crate::model::{
    AccountSession, ApplicationInfo, DEFAULT_APPLICATION, HealthState, LoginInfo, ServiceAccount,
    UserInfo,
};
use crate::registry::ClusterRegistry;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Envelope code for an expired access token.
pub const TOKEN_EXPIRED: i64 = 20103;
/// Envelope code for a credential the server will never accept again.
pub const CREDENTIAL_REVOKED: i64 = 20111;

const LOGIN_PATH: &str = "/v1/login";
const REFRESH_PATH: &str = "/v1/token/refresh";
const REFRESH_HEADER: &str = "Reraeb";

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| Error::Http {
            url: String::new(),
            source,
        })
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct TokenPair {
    token: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct RawApplication {
    id: u64,
    #[serde(default)]
    user_id: u64,
    #[serde(default)]
    public: u8,
    #[serde(default)]
    editable: u8,
    #[serde(default)]
    context: String,
    #[serde(default)]
    status: u8,
    #[serde(default)]
    application_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: String,
}

/// Authenticated channel to one control-plane account.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    registry: ClusterRegistry,
    session: Mutex<AccountSession>,
    refresh: Mutex<Option<SharedRefresh>>,
    invalidated: AtomicBool,
}

impl SessionClient {
    pub fn from_session(
        http: reqwest::Client,
        registry: ClusterRegistry,
        session: AccountSession,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                registry,
                session: Mutex::new(session),
                refresh: Mutex::new(None),
                invalidated: AtomicBool::new(false),
            }),
        }
    }

    /// Logs in and fetches the user; nothing is written to the registry here.
    pub async fn login(
        http: reqwest::Client,
        registry: ClusterRegistry,
        login: LoginInfo,
    ) -> Result<Self> {
        info!(server = %login.base_url, user = %login.username, "logging in");
        let url = format!("{}{LOGIN_PATH}", login.base_url);
        let body = json!({
            "email": login.username,
            "password": login.password,
            "from": "plugin",
        });
        let response = http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.clone(),
                source,
            })?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|source| Error::Http { url, source })?;
        if envelope.code != 0 {
            return Err(Error::Auth {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        let pair: TokenPair = serde_json::from_value(envelope.data).map_err(|_| Error::Auth {
            code: envelope.code,
            message: "login response carried no token".to_string(),
        })?;

        let session = AccountSession {
            id: String::new(),
            login,
            token: pair.token,
            refresh_token: pair.refresh_token,
            user: UserInfo::default(),
            created_at: chrono::Utc::now().timestamp_millis(),
            service_accounts: Vec::new(),
            state: HealthState::ok(),
        };
        let client = Self::from_session(http, registry, session);
        let user = client.user_info().await?;
        {
            let mut session = client.lock_session()?;
            session.id = AccountSession::identity(user.id, &session.login.base_url);
            session.user = user;
        }
        info!(account = %client.id(), "login end");
        Ok(client)
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, AccountSession>> {
        self.inner
            .session
            .lock()
            .map_err(|_| Error::Config("session lock poisoned".to_string()))
    }

    pub fn session(&self) -> Result<AccountSession> {
        Ok(self.lock_session()?.clone())
    }

    pub fn id(&self) -> String {
        self.lock_session()
            .map(|session| session.id.clone())
            .unwrap_or_default()
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::SeqCst)
    }

    /// Stops this client from issuing further requests.
    pub fn invalidate(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
    }

    fn login_required(&self) -> Error {
        match self.lock_session() {
            Ok(session) => Error::LoginRequired {
                base_url: session.login.base_url.clone(),
                username: session.login.username.clone(),
            },
            Err(err) => err,
        }
    }

    fn evict(&self) {
        let id = self.id();
        if id.is_empty() {
            return;
        }
        match self.inner.registry.remove(&id) {
            Ok(true) => info!(account = %id, "removed account from registry"),
            Ok(false) => {}
            Err(err) => warn!(account = %id, error = %err, "failed to remove account"),
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        refresh_token: Option<&str>,
    ) -> Result<Value> {
        if self.is_invalidated() {
            return Err(self.login_required());
        }

        let (url, token) = {
            let session = self.lock_session()?;
            (
                format!("{}{path}", session.login.base_url),
                session.token.clone(),
            )
        };
        let mut builder = self.inner.http.request(method.clone(), &url);
        if !token.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(refresh_token) = refresh_token {
            builder = builder.header(REFRESH_HEADER, refresh_token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(%method, %url, "request");
        let response = builder.send().await.map_err(|source| Error::Http {
            url: url.clone(),
            source,
        })?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|source| Error::Http { url, source })?;

        let message = envelope.message.unwrap_or_default();
        match envelope.code {
            0 => Ok(envelope.data),
            TOKEN_EXPIRED => Err(Error::Auth {
                code: TOKEN_EXPIRED,
                message,
            }),
            CREDENTIAL_REVOKED => {
                warn!(account = %self.id(), "credential revoked");
                self.evict();
                self.invalidate();
                Err(Error::Auth {
                    code: CREDENTIAL_REVOKED,
                    message,
                })
            }
            code => Err(Error::Api { code, message }),
        }
    }

    /// Issues a call, refreshing once and retrying when the token has expired.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        match self.send_once(method.clone(), path, body, None).await {
            Err(Error::Auth {
                code: TOKEN_EXPIRED,
                ..
            }) => {
                debug!(path, "token expired, refreshing");
                self.refresh().await?;
                self.send_once(method, path, body, None).await
            }
            other => other,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let data = self.request(Method::GET, path, None).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Joins the in-flight refresh, or starts one when none is running.
    pub async fn refresh(&self) -> Result<()> {
        let pending = {
            let mut slot = self
                .inner
                .refresh
                .lock()
                .map_err(|_| Error::Config("refresh lock poisoned".to_string()))?;
            match slot.as_ref() {
                Some(pending) if pending.peek().is_none() => pending.clone(),
                _ => {
                    let client = self.clone();
                    let pending = async move { client.run_refresh().await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await.map_err(Error::Refresh)
    }

    async fn run_refresh(&self) -> Result<()> {
        let refresh_token = self.lock_session()?.refresh_token.clone();
        let body = json!({});
        match self
            .send_once(Method::POST, REFRESH_PATH, Some(&body), Some(&refresh_token))
            .await
        {
            Ok(data) => {
                let pair: TokenPair = serde_json::from_value(data)?;
                let updated = {
                    let mut session = self.lock_session()?;
                    session.token = pair.token;
                    session.refresh_token = pair.refresh_token;
                    session.clone()
                };
                self.inner.registry.upsert(&updated)?;
                info!(account = %updated.id, "token refreshed");
                Ok(())
            }
            Err(Error::Auth {
                code: TOKEN_EXPIRED,
                ..
            }) => {
                let error = self.login_required();
                warn!("{error}");
                self.invalidate();
                self.evict();
                Err(error)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn user_info(&self) -> Result<UserInfo> {
        self.get("/v1/me").await
    }

    /// Falls back to the last fetched list when the server answers with nothing usable.
    pub async fn list_service_accounts(&self) -> Result<Vec<ServiceAccount>> {
        let data = self
            .request(Method::GET, "/v1/plugin/service_accounts", None)
            .await
            .inspect_err(|err| error!(account = %self.id(), error = %err, "list service accounts failed"))?;

        let fetched = serde_json::from_value::<Vec<ServiceAccount>>(data)
            .ok()
            .filter(|accounts| !accounts.is_empty());

        match fetched {
            Some(accounts) => {
                let updated = {
                    let mut session = self.lock_session()?;
                    session.service_accounts = accounts.clone();
                    session.clone()
                };
                if !self.is_invalidated() && !updated.id.is_empty() {
                    self.inner.registry.upsert(&updated)?;
                }
                Ok(accounts)
            }
            None => {
                let session = self.lock_session()?;
                if session.service_accounts.is_empty() {
                    return Err(Error::NoClusters(format!(
                        "{}@{}",
                        session.login.base_url, session.login.username
                    )));
                }
                warn!(account = %session.id, "empty service account payload, using cached list");
                Ok(session.service_accounts.clone())
            }
        }
    }

    /// Applications plus the default application, ordered by id.
    pub async fn list_applications_v2(&self) -> Result<Vec<ApplicationInfo>> {
        let user_id = self.lock_session()?.user.id;
        let path = format!("/v1/users/{user_id}/applications");
        let raw = match self.get::<Vec<RawApplication>>(&path).await {
            Ok(raw) => raw,
            Err(err) if err.needs_login() => return Err(err),
            Err(err) => {
                warn!(error = %err, "list applications failed");
                Vec::new()
            }
        };

        let mut applications = raw
            .into_iter()
            .map(|app| {
                let mut context = serde_json::from_str::<Value>(&app.context)
                    .unwrap_or_else(|_| Value::Object(Map::new()));
                if let Value::Object(map) = &mut context {
                    map.insert(
                        "install_type".to_string(),
                        app.application_type.map(Value::from).unwrap_or(Value::Null),
                    );
                }
                ApplicationInfo {
                    id: app.id,
                    user_id: app.user_id,
                    public: app.public,
                    editable: app.editable,
                    context: keys_to_camel(context).to_string(),
                    status: app.status,
                }
            })
            .collect::<Vec<_>>();

        applications.push(ApplicationInfo {
            id: 0,
            user_id,
            public: 1,
            editable: 1,
            context: json!({
                "applicationName": DEFAULT_APPLICATION,
                "applicationUrl": "",
                "applicationConfigPath": "",
                "nocalhostConfig": "",
                "source": "",
                "resourceDir": "",
                "installType": "",
            })
            .to_string(),
            status: 1,
        });
        applications.sort_by_key(|app| app.id);
        Ok(applications)
    }

    pub async fn server_version(&self) -> Option<semver::Version> {
        let info = self.get::<VersionInfo>("/v1/version").await.ok()?;
        semver::Version::parse(info.version.trim_start_matches('v')).ok()
    }

    /// False when the server reports a version older than `minimum`.
    pub async fn check_server_version(&self, minimum: &semver::Version) -> bool {
        let version = self.server_version().await;
        info!(
            server = ?version.as_ref().map(ToString::to_string),
            minimum = %minimum,
            "check server version"
        );
        match version {
            Some(version) if *minimum > version => {
                warn!("please upgrade api server version ({minimum} or higher)");
                false
            }
            _ => true,
        }
    }

    pub async fn reset_dev_space(&self, dev_space_id: u64) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/v1/plugin/{dev_space_id}/recreate"),
            None,
        )
        .await?;
        Ok(())
    }
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for ch in key.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn keys_to_camel(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (camel_case(&key), keys_to_camel(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(keys_to_camel).collect()),
        other => other,
    }
}
