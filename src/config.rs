use crate::error::AppError;
use crate::models::TimeWindow;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "aetheria-usage";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const TOKEN_ENTRY: &str = "session:access-token";
const TOKEN_ENV: &str = "AETHERIA_ACCESS_TOKEN";
const API_URL_ENV: &str = "AETHERIA_API_URL";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("AETHERIA_USAGE_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("ai", "aetheria", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".aetheria-usage"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_seconds: u64,
    pub default_window: String,
    pub user_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            request_timeout_secs: 15,
            refresh_seconds: 60,
            default_window: TimeWindow::ThirtyDays.as_label().into(),
            user_id: None,
        }
    }
}

impl AppConfig {
    pub fn default_time_window(&self) -> TimeWindow {
        TimeWindow::from_label(&self.default_window).unwrap_or(TimeWindow::ThirtyDays)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

pub fn normalize_base_url(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AppError::Config("api_base_url must not be empty".into()));
    }
    url::Url::parse(trimmed)
        .map_err(|e| AppError::Config(format!("invalid api_base_url '{trimmed}': {e}")))?;
    Ok(trimmed.to_string())
}

fn normalize_config(config: &mut AppConfig) -> Result<bool, AppError> {
    let mut changed = false;

    let base = normalize_base_url(&config.api_base_url)?;
    if base != config.api_base_url {
        config.api_base_url = base;
        changed = true;
    }

    if config.request_timeout_secs == 0 {
        config.request_timeout_secs = AppConfig::default().request_timeout_secs;
        changed = true;
    }

    let window = config.default_time_window().as_label();
    if window != config.default_window {
        config.default_window = window.to_string();
        changed = true;
    }

    if let Some(user_id) = &config.user_id {
        if user_id.trim().is_empty() {
            config.user_id = None;
            changed = true;
        }
    }

    Ok(changed)
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    let mut parsed = if path.exists() {
        let raw = fs::read_to_string(&path)?;
        let mut parsed: AppConfig = toml::from_str(&raw)?;
        if normalize_config(&mut parsed)? {
            save_config(&parsed)?;
        }
        parsed
    } else {
        AppConfig::default()
    };

    // Not persisted: lets one-off runs point at another backend.
    if let Ok(url) = std::env::var(API_URL_ENV) {
        if !url.trim().is_empty() {
            parsed.api_base_url = normalize_base_url(&url)?;
        }
    }

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn token_entry() -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(SERVICE_NAME, TOKEN_ENTRY)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenLocation {
    Keyring,
    File(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    access_token: String,
}

pub fn credentials_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("credentials.toml"))
}

fn write_token_file(path: &Path, token: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string(&StoredCredentials {
        access_token: token.to_string(),
    })?;

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    // `mode` only applies when the file is created.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(raw.as_bytes())?;
    Ok(())
}

fn read_token_file(path: &Path) -> Result<Option<String>, AppError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let stored: StoredCredentials = toml::from_str(&raw)?;
    let token = stored.access_token.trim();
    Ok((!token.is_empty()).then(|| token.to_string()))
}

fn remove_token_file(path: &Path) -> Result<(), AppError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn store_in_keyring(token: &str) -> bool {
    if let Err(err) = token_entry().and_then(|e| Ok(e.set_password(token)?)) {
        tracing::debug!(error = %err, "keyring write failed");
        return false;
    }
    // Without a native backend every entry is a separate in-memory mock,
    // so a fresh handle only sees the token when the OS store kept it.
    matches!(token_entry().map(|e| e.get_password()), Ok(Ok(v)) if v == token)
}

pub fn set_access_token(token: &str) -> Result<TokenLocation, AppError> {
    let token = token.trim();
    let path = credentials_path()?;
    if store_in_keyring(token) {
        remove_token_file(&path)?;
        return Ok(TokenLocation::Keyring);
    }
    write_token_file(&path, token)?;
    Ok(TokenLocation::File(path))
}

pub fn delete_access_token() -> Result<(), AppError> {
    match token_entry()?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => {}
        Err(e) => return Err(AppError::Keyring(e)),
    }
    remove_token_file(&credentials_path()?)
}

pub fn get_access_token() -> Result<String, AppError> {
    if let Ok(entry) = token_entry() {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }

    if let Some(value) = read_token_file(&credentials_path()?)? {
        return Ok(value);
    }

    if let Ok(value) = std::env::var(TOKEN_ENV) {
        if !value.trim().is_empty() {
            return Ok(value.trim().to_string());
        }
    }

    Err(AppError::Unauthorized(format!(
        "No access token found. Run `aetheria-usage login --token ...` or set {TOKEN_ENV}"
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}
