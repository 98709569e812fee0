use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

const DEFAULT_API_RELEASE: &str = "8.0.1.0";
const THUMBPRINT_HEX_LENGTHS: [usize; 5] = [40, 56, 64, 96, 128];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub backend: BackendConfig,
    pub remote_timeout_ms: u64,
    pub session_connect_timeout_ms: u64,
    pub session_cache_max_entries: usize,
    pub session_idle_ttl_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub ticket_ttl_secs: u64,
    pub ticket_max_entries: usize,
    pub task_workers: usize,
    pub seed_chassis_count: usize,
}

/// Where the remote management server lives and how it is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub fqdn: String,
    pub port: u16,
    pub backend_id: String,
    /// Normalised: delimiters removed, lowercase hex.
    pub thumbprint: String,
    pub api_url: String,
    pub gateway_url: String,
}

impl GatewayConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn session_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session_connect_timeout_ms)
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Option<Duration> {
        (self.session_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.session_sweep_interval_secs))
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("RPB_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("RPB_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "RPB_BIND_ADDR",
        )?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("RPB_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && bind_addr.ip().is_unspecified())
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REFUSED",
                message: "non-local bind requires RPB_DEV_ALLOW_NONLOCAL_BIND and an unspecified address"
                    .to_string(),
            });
        }

        let backend = parse_backend_config(kv)?;

        let remote_timeout_ms = parse_u64(
            kv.get("RPB_REMOTE_TIMEOUT_MS"),
            10_000,
            "RPB_REMOTE_TIMEOUT_MS",
        )?;
        let session_connect_timeout_ms = parse_u64(
            kv.get("RPB_SESSION_CONNECT_TIMEOUT_MS"),
            30_000,
            "RPB_SESSION_CONNECT_TIMEOUT_MS",
        )?;
        if remote_timeout_ms == 0 || session_connect_timeout_ms == 0 {
            return Err(invalid("remote timeouts must be >= 1ms"));
        }

        let session_cache_max_entries = parse_usize(
            kv.get("RPB_SESSION_CACHE_MAX_ENTRIES"),
            100,
            "RPB_SESSION_CACHE_MAX_ENTRIES",
        )?;
        if session_cache_max_entries == 0 {
            return Err(invalid("RPB_SESSION_CACHE_MAX_ENTRIES must be >= 1"));
        }

        let session_idle_ttl_secs = parse_u64(
            kv.get("RPB_SESSION_IDLE_TTL_SECS"),
            10 * 60,
            "RPB_SESSION_IDLE_TTL_SECS",
        )?;
        if session_idle_ttl_secs == 0 {
            return Err(invalid("RPB_SESSION_IDLE_TTL_SECS must be >= 1"));
        }

        let session_sweep_interval_secs = parse_u64(
            kv.get("RPB_SESSION_SWEEP_INTERVAL_SECS"),
            60,
            "RPB_SESSION_SWEEP_INTERVAL_SECS",
        )?;

        let ticket_ttl_secs = parse_u64(kv.get("RPB_TICKET_TTL_SECS"), 60, "RPB_TICKET_TTL_SECS")?;
        let ticket_max_entries = parse_usize(
            kv.get("RPB_TICKET_MAX_ENTRIES"),
            100,
            "RPB_TICKET_MAX_ENTRIES",
        )?;
        if ticket_ttl_secs == 0 || ticket_max_entries == 0 {
            return Err(invalid(
                "RPB_TICKET_TTL_SECS and RPB_TICKET_MAX_ENTRIES must be >= 1",
            ));
        }

        let task_workers = parse_usize(kv.get("RPB_TASK_WORKERS"), 10, "RPB_TASK_WORKERS")?;
        if task_workers == 0 || task_workers > 256 {
            return Err(invalid("RPB_TASK_WORKERS must be between 1 and 256"));
        }

        let seed_chassis_count = parse_usize(
            kv.get("RPB_SEED_CHASSIS_COUNT"),
            4,
            "RPB_SEED_CHASSIS_COUNT",
        )?;

        Ok(Self {
            bind_addr,
            backend,
            remote_timeout_ms,
            session_connect_timeout_ms,
            session_cache_max_entries,
            session_idle_ttl_secs,
            session_sweep_interval_secs,
            ticket_ttl_secs,
            ticket_max_entries,
            task_workers,
            seed_chassis_count,
        })
    }
}

fn parse_backend_config(kv: &HashMap<String, String>) -> Result<BackendConfig, StartupError> {
    let fqdn = require_nonempty(kv, "RPB_BACKEND_FQDN")?;
    let port = parse_u16(kv.get("RPB_BACKEND_PORT"), 443, "RPB_BACKEND_PORT")?;
    let backend_id = require_nonempty(kv, "RPB_BACKEND_ID")?;

    let thumbprint = normalize_thumbprint(&require_nonempty(kv, "RPB_BACKEND_THUMBPRINT")?)
        .ok_or_else(|| StartupError {
            code: "ERR_INVALID_THUMBPRINT",
            message: "RPB_BACKEND_THUMBPRINT must be a hex SHA-1 or SHA-2 digest".to_string(),
        })?;

    let release = optional_nonempty(kv, "RPB_BACKEND_API_RELEASE")
        .unwrap_or_else(|| DEFAULT_API_RELEASE.to_string());

    let api_url = optional_nonempty(kv, "RPB_BACKEND_API_URL")
        .unwrap_or_else(|| format!("https://{}:{}/sdk/vim25/{}", fqdn, port, release));
    let gateway_url = optional_nonempty(kv, "RPB_GATEWAY_URL")
        .unwrap_or_else(|| format!("https://{}:{}/api/ui", fqdn, port));

    for (key, url) in [("RPB_BACKEND_API_URL", &api_url), ("RPB_GATEWAY_URL", &gateway_url)] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(invalid(format!("{} must be an http(s) url", key)));
        }
    }

    Ok(BackendConfig {
        fqdn,
        port,
        backend_id,
        thumbprint,
        api_url,
        gateway_url,
    })
}

/// Strips `:` and whitespace delimiters and checks the digest length.
fn normalize_thumbprint(raw: &str) -> Option<String> {
    let hex = raw
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    if !THUMBPRINT_HEX_LENGTHS.contains(&hex.len()) {
        return None;
    }
    hex.bytes().all(|b| b.is_ascii_hexdigit()).then_some(hex)
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| invalid(format!("{} must be a valid host:port socket address", key))),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u16(value: Option<&String>, default: u16, key: &'static str) -> Result<u16, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u16>()
            .map_err(|_| invalid(format!("{} must be a port number", key))),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
