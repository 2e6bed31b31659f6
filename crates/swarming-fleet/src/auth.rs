use crate::error::FleetError;
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use swarming_core::{ENV_LUCI_CONTEXT, ENV_STATIC_TOKEN};

const OAUTH_SCOPE_EMAIL: &str = "https://www.googleapis.com/auth/userinfo.email";
const LOCAL_AUTH_TOKEN_PATH: &str = "/rpc/LuciLocalAuthService.GetOAuthToken";
const LOCAL_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Which service account a call runs as. Reads use the bot's system
/// account; writes use the account of the task being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    System,
    Task,
}

impl Identity {
    pub fn account_id(self) -> &'static str {
        match self {
            Identity::System => "system",
            Identity::Task => "task",
        }
    }
}

pub trait TokenSource: Send + Sync {
    /// Bearer token for `identity`, or `None` for anonymous calls.
    fn token(&self, identity: Identity) -> Result<Option<String>, FleetError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTokenSource {
    token: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self, _identity: Identity) -> Result<Option<String>, FleetError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct LuciContextFile {
    local_auth: Option<LocalAuthSection>,
}

#[derive(Debug, Deserialize)]
struct LocalAuthSection {
    rpc_port: u16,
    secret: String,
    #[serde(default)]
    accounts: Vec<LocalAuthAccount>,
}

#[derive(Debug, Deserialize)]
struct LocalAuthAccount {
    id: String,
}

#[derive(Debug, Serialize)]
struct GetOAuthTokenRequest<'a> {
    scopes: Vec<&'a str>,
    secret: &'a str,
    account_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct GetOAuthTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expiry: i64,
    #[serde(default)]
    error_code: i32,
    #[serde(default)]
    error_message: String,
}

/// Mints tokens through the Swarming bot's local auth server.
pub struct LuciContextTokenSource {
    endpoint: String,
    secret: String,
    accounts: Vec<String>,
    client: HttpClient,
    cache: Mutex<HashMap<Identity, (String, i64)>>,
}

impl LuciContextTokenSource {
    pub fn from_file(path: &Path) -> Result<Self, FleetError> {
        let raw = fs::read(path).map_err(|err| {
            FleetError::Config(format!("read {}: {}", path.display(), err))
        })?;
        let parsed: LuciContextFile = serde_json::from_slice(&raw).map_err(|err| {
            FleetError::Config(format!("parse {}: {}", path.display(), err))
        })?;
        let local_auth = parsed.local_auth.ok_or_else(|| {
            FleetError::Config(format!("{} has no local_auth section", path.display()))
        })?;
        let client = HttpClient::builder()
            .timeout(LOCAL_AUTH_TIMEOUT)
            .build()
            .map_err(|err| FleetError::Config(format!("build local auth client: {}", err)))?;
        Ok(Self {
            endpoint: format!("http://127.0.0.1:{}{}", local_auth.rpc_port, LOCAL_AUTH_TOKEN_PATH),
            secret: local_auth.secret,
            accounts: local_auth.accounts.into_iter().map(|a| a.id).collect(),
            client,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, identity: Identity) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let (token, expiry) = cache.get(&identity)?;
        if *expiry - TOKEN_REFRESH_MARGIN_SECS > Utc::now().timestamp() {
            Some(token.clone())
        } else {
            None
        }
    }
}

impl TokenSource for LuciContextTokenSource {
    fn token(&self, identity: Identity) -> Result<Option<String>, FleetError> {
        if let Some(token) = self.cached(identity) {
            return Ok(Some(token));
        }
        let account_id = identity.account_id();
        if !self.accounts.iter().any(|a| a == account_id) {
            return Err(FleetError::Config(format!(
                "LUCI_CONTEXT has no {:?} account (have: {})",
                account_id,
                self.accounts.join(", ")
            )));
        }
        let request = GetOAuthTokenRequest {
            scopes: vec![OAUTH_SCOPE_EMAIL],
            secret: &self.secret,
            account_id,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| FleetError::Config(format!("local auth request: {}", err)))?;
        let body: GetOAuthTokenResponse = response
            .json()
            .map_err(|err| FleetError::Config(format!("local auth response: {}", err)))?;
        if body.error_code != 0 || body.access_token.is_empty() {
            return Err(FleetError::Config(format!(
                "local auth refused {} token: code={} {}",
                account_id, body.error_code, body.error_message
            )));
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(identity, (body.access_token.clone(), body.expiry));
        Ok(Some(body.access_token))
    }
}

/// Picks the token source for this process: a static token when
/// `SSW_STATIC_TOKEN` is set, the bot's local auth server when
/// `LUCI_CONTEXT` is set, anonymous otherwise.
pub fn token_source_from_env() -> Result<Box<dyn TokenSource>, FleetError> {
    if let Ok(token) = env::var(ENV_STATIC_TOKEN) {
        if !token.trim().is_empty() {
            return Ok(Box::new(StaticTokenSource::new(Some(token.trim().to_string()))));
        }
    }
    match env::var(ENV_LUCI_CONTEXT) {
        Ok(path) if !path.trim().is_empty() => Ok(Box::new(LuciContextTokenSource::from_file(
            Path::new(path.trim()),
        )?)),
        _ => {
            tracing::warn!("no credentials configured; fleet calls will be anonymous");
            Ok(Box::new(StaticTokenSource::new(None)))
        }
    }
}
