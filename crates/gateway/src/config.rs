use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::session::SessionPolicy;
use crate::validation::DEFAULT_MAX_INPUT_LENGTH;

const MAX_INPUT_LENGTH_CEILING: usize = 100_000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub agent_url: String,
    pub upstream_timeout_ms: u64,
    pub max_input_length: usize,
    pub session_timeout_secs: u64,
    pub session_recreate_unknown: bool,
    pub max_sessions: usize,
    pub session_sweep_interval_secs: u64,
    pub rate_limit_max_calls: u32,
    pub rate_limit_window_secs: u64,
    pub audit_verbose: bool,
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

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("ADVISOR_CONFIG_PATH") {
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
            kv.get("ADVISOR_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "ADVISOR_BIND_ADDR",
        )?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("ADVISOR_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()))
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REQUIRES_OVERRIDE",
                message: "non-local bind requires ADVISOR_DEV_ALLOW_NONLOCAL_BIND; refuse startup"
                    .to_string(),
            });
        }

        let agent_url = require_nonempty(kv, "ADVISOR_AGENT_URL")?;
        if !(agent_url.starts_with("http://") || agent_url.starts_with("https://")) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ADVISOR_AGENT_URL must be an http(s) URL".to_string(),
            });
        }

        let upstream_timeout_ms = parse_u64(
            kv.get("ADVISOR_UPSTREAM_TIMEOUT_MS"),
            30_000,
            "ADVISOR_UPSTREAM_TIMEOUT_MS",
        )?;
        require_positive(upstream_timeout_ms, "ADVISOR_UPSTREAM_TIMEOUT_MS")?;

        let max_input_length = parse_usize(
            kv.get("ADVISOR_MAX_INPUT_LENGTH"),
            DEFAULT_MAX_INPUT_LENGTH,
            "ADVISOR_MAX_INPUT_LENGTH",
        )?;
        if !(1..=MAX_INPUT_LENGTH_CEILING).contains(&max_input_length) {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!(
                    "ADVISOR_MAX_INPUT_LENGTH must be between 1 and {}",
                    MAX_INPUT_LENGTH_CEILING
                ),
            });
        }

        let session_timeout_secs = parse_u64(
            kv.get("ADVISOR_SESSION_TIMEOUT_SECS"),
            3600,
            "ADVISOR_SESSION_TIMEOUT_SECS",
        )?;
        require_positive(session_timeout_secs, "ADVISOR_SESSION_TIMEOUT_SECS")?;

        let session_recreate_unknown =
            parse_bool(kv.get("ADVISOR_SESSION_RECREATE_UNKNOWN")).unwrap_or(false);

        let max_sessions = parse_usize(
            kv.get("ADVISOR_MAX_SESSIONS"),
            16_384,
            "ADVISOR_MAX_SESSIONS",
        )?;
        if max_sessions == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ADVISOR_MAX_SESSIONS must be >= 1".to_string(),
            });
        }

        let session_sweep_interval_secs = parse_u64(
            kv.get("ADVISOR_SESSION_SWEEP_INTERVAL_SECS"),
            60,
            "ADVISOR_SESSION_SWEEP_INTERVAL_SECS",
        )?;

        let rate_limit_max_calls = parse_u32(
            kv.get("ADVISOR_RATE_LIMIT_MAX_CALLS"),
            60,
            "ADVISOR_RATE_LIMIT_MAX_CALLS",
        )?;
        let rate_limit_window_secs = parse_u64(
            kv.get("ADVISOR_RATE_LIMIT_WINDOW_SECS"),
            60,
            "ADVISOR_RATE_LIMIT_WINDOW_SECS",
        )?;
        require_positive(rate_limit_window_secs, "ADVISOR_RATE_LIMIT_WINDOW_SECS")?;

        let audit_verbose = parse_bool(kv.get("ADVISOR_AUDIT_VERBOSE")).unwrap_or(false);

        Ok(Self {
            bind_addr,
            agent_url,
            upstream_timeout_ms,
            max_input_length,
            session_timeout_secs,
            session_recreate_unknown,
            max_sessions,
            session_sweep_interval_secs,
            rate_limit_max_calls,
            rate_limit_window_secs,
            audit_verbose,
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn session_sweep_interval(&self) -> Option<Duration> {
        (self.session_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.session_sweep_interval_secs))
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            timeout: Duration::from_secs(self.session_timeout_secs),
            max_sessions: self.max_sessions,
            history_window: self.rate_limit_window(),
            recreate_unknown: self.session_recreate_unknown,
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
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

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let value = kv.get(key).map(|v| v.trim()).unwrap_or_default();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn require_positive(value: u64, key: &'static str) -> Result<(), StartupError> {
    if value == 0 {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be >= 1", key),
        });
    }
    Ok(())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
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
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
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

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
