use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;
use uuid::Uuid;

use crate::rendezvous::tunnel::{
    manager,
    transport::{self, TlsDialOptions, TlsListenOptions},
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

const CONFIG_ENV: &str = "RENDEZVOUS_CONFIG";
const CANDIDATES: [&str; 3] = ["rendezvous.toml", "rendezvous.yaml", "rendezvous.yml"];

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join(CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CANDIDATES {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no rendezvous.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/rendezvous/rendezvous.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "rendezvous", "rendezvous")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rendezvous.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns whether
/// a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = extension_of(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: Option<RelayConfig>,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_name: String,
    pub listeners: Vec<ListenerConfig>,
    pub authentication: AuthConfig,
    pub timeouts: RelayTimeouts,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: String,
    pub transport: String,
    pub tls: TlsListenOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Http,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: String,
    pub url: String,
    /// HTTP request timeout for `mode = "http"`.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelayTimeouts {
    pub handshake: Duration,
    pub idle: Option<Duration>,
    pub call: Duration,
    pub authentication: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Expose,
    Forward,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub mode: PeerMode,
    pub relay_addr: String,
    pub transport: String,
    pub tls: TlsDialOptions,
    pub token: String,
    pub name: String,
    /// Own uuid for `expose`, target uuid for `forward`.
    pub server_uuid: Uuid,
    pub local_addr: String,
    pub listen_addr: String,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    #[serde(default)]
    peers: Vec<FilePeer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    server_name: Option<String>,
    #[serde(default)]
    listeners: Vec<FileListener>,
    authentication: Option<FileAuthentication>,
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileListener {
    listen_addr: String,
    transport: Option<String>,
    tls: Option<FileTlsServer>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuthentication {
    mode: Option<String>,
    token: Option<String>,
    url: Option<String>,
    timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    call_timeout_ms: Option<i64>,
    authentication_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePeer {
    mode: String,
    relay_addr: String,
    transport: Option<String>,
    tls: Option<FileTlsClient>,
    token: Option<String>,
    name: Option<String>,
    server_uuid: String,
    local_addr: Option<String>,
    listen_addr: Option<String>,
    auto_reconnect: Option<bool>,
    connect_timeout_ms: Option<i64>,
    ping_interval_ms: Option<i64>,
    reconnect_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsClient {
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
}

fn trimmed(s: &Option<String>) -> String {
    s.as_deref().unwrap_or_default().trim().to_string()
}

fn or_default(s: &Option<String>, fallback: &str) -> String {
    let t = trimmed(s);
    if t.is_empty() { fallback.to_string() } else { t }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|ms| ms.max(0) as u64).unwrap_or(default_ms))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig::default(),
            relay: None,
            peers: vec![],
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = or_default(&l.level, &cfg.logging.level);
            cfg.logging.format = or_default(&l.format, &cfg.logging.format);
            cfg.logging.output = or_default(&l.output, &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Relay ---
        if let Some(r) = &fc.relay {
            cfg.relay = Some(relay_from_file(r)?);
        }

        // --- Peers ---
        for (i, p) in fc.peers.iter().enumerate() {
            cfg.peers.push(peer_from_file(i, p)?);
        }

        if cfg.relay.is_none() && cfg.peers.is_empty() {
            anyhow::bail!("config: nothing to run (set [relay] or [[peers]])");
        }
        Ok(cfg)
    }
}

fn relay_from_file(r: &FileRelay) -> anyhow::Result<RelayConfig> {
    let mut listeners = Vec::with_capacity(r.listeners.len());
    for (i, l) in r.listeners.iter().enumerate() {
        let listen_addr = l.listen_addr.trim().to_string();
        if listen_addr.is_empty() {
            anyhow::bail!("config: relay.listeners[{i}] missing listen_addr");
        }
        let transport = transport::parse_transport(l.transport.as_deref().unwrap_or_default())
            .with_context(|| format!("config: relay.listeners[{i}] invalid transport"))?;
        let tls = TlsListenOptions {
            cert_file: l.tls.as_ref().map(|t| trimmed(&t.cert_file)).unwrap_or_default(),
            key_file: l.tls.as_ref().map(|t| trimmed(&t.key_file)).unwrap_or_default(),
        };
        if tls.cert_file.is_empty() != tls.key_file.is_empty() {
            anyhow::bail!("config: relay.listeners[{i}] needs both tls.cert_file and tls.key_file");
        }
        listeners.push(ListenerConfig {
            listen_addr,
            transport,
            tls,
        });
    }
    if listeners.is_empty() {
        anyhow::bail!("config: relay.listeners is empty");
    }

    let authentication = match &r.authentication {
        None => AuthConfig {
            mode: AuthMode::None,
            token: String::new(),
            url: String::new(),
            timeout: Duration::from_secs(5),
        },
        Some(a) => {
            let mode = match or_default(&a.mode, "none").to_ascii_lowercase().as_str() {
                "none" => AuthMode::None,
                "token" => AuthMode::Token,
                "http" => AuthMode::Http,
                other => anyhow::bail!("config: relay.authentication.mode {other:?} (expected none|token|http)"),
            };
            let url = trimmed(&a.url);
            if mode == AuthMode::Http && url.is_empty() {
                anyhow::bail!("config: relay.authentication missing url for mode \"http\"");
            }
            AuthConfig {
                mode,
                token: trimmed(&a.token),
                url,
                timeout: millis(a.timeout_ms, 5000),
            }
        }
    };

    let t = r.timeouts.as_ref();
    let idle = millis(t.and_then(|t| t.idle_timeout_ms), 0);
    let timeouts = RelayTimeouts {
        handshake: millis(t.and_then(|t| t.handshake_timeout_ms), 10_000),
        idle: (!idle.is_zero()).then_some(idle),
        call: millis(t.and_then(|t| t.call_timeout_ms), 5000),
        authentication: millis(t.and_then(|t| t.authentication_timeout_ms), 8000),
    };

    Ok(RelayConfig {
        server_name: or_default(&r.server_name, "rendezvous"),
        listeners,
        authentication,
        timeouts,
    })
}

fn peer_from_file(i: usize, p: &FilePeer) -> anyhow::Result<PeerConfig> {
    let mode = match p.mode.trim().to_ascii_lowercase().as_str() {
        "expose" => PeerMode::Expose,
        "forward" => PeerMode::Forward,
        other => anyhow::bail!("config: peers[{i}] mode {other:?} (expected expose|forward)"),
    };
    let relay_addr = p.relay_addr.trim().to_string();
    if relay_addr.is_empty() {
        anyhow::bail!("config: peers[{i}] missing relay_addr");
    }
    if p.server_uuid.trim().is_empty() {
        anyhow::bail!("config: peers[{i}] missing server_uuid");
    }
    let server_uuid = manager::parse_uuid(&p.server_uuid)
        .map_err(|_| anyhow::anyhow!("config: peers[{i}] invalid server_uuid {:?}", p.server_uuid))?;

    let local_addr = trimmed(&p.local_addr);
    let listen_addr = trimmed(&p.listen_addr);
    match mode {
        PeerMode::Expose if local_addr.is_empty() => anyhow::bail!("config: peers[{i}] missing local_addr"),
        PeerMode::Forward if listen_addr.is_empty() => anyhow::bail!("config: peers[{i}] missing listen_addr"),
        _ => {}
    }

    let transport = transport::parse_transport(p.transport.as_deref().unwrap_or_default())
        .with_context(|| format!("config: peers[{i}] invalid transport"))?;
    let tls = p
        .tls
        .as_ref()
        .map(|t| TlsDialOptions {
            server_name: trimmed(&t.server_name),
            insecure_skip_verify: t.insecure_skip_verify,
            ca_file: trimmed(&t.ca_file),
        })
        .unwrap_or_default();

    Ok(PeerConfig {
        mode,
        relay_addr,
        transport,
        tls,
        token: trimmed(&p.token),
        name: or_default(&p.name, "rendezvous-peer"),
        server_uuid,
        local_addr,
        listen_addr,
        auto_reconnect: p.auto_reconnect.unwrap_or(mode == PeerMode::Expose),
        connect_timeout: millis(p.connect_timeout_ms, 10_000),
        ping_interval: millis(p.ping_interval_ms, 30_000),
        reconnect_interval: millis(p.reconnect_interval_ms, 5000),
    })
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# rendezvous configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path. It starts
# a relay on :2213 that accepts servers and clients without authentication.

admin_addr = ":8080"

[relay]
server_name = "rendezvous"

[[relay.listeners]]
listen_addr = ":2213"
transport = "tcp" # tcp | tls | unix

[relay.authentication]
mode = "none" # none | token | http

[relay.timeouts]
handshake_timeout_ms = 10000
idle_timeout_ms = 0
call_timeout_ms = 5000
authentication_timeout_ms = 8000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

# Publish a local service through a relay:
#
# [[peers]]
# mode = "expose"
# relay_addr = "relay.example.net:2213"
# server_uuid = "6f1c0b8e-8f64-4a59-9a3a-2f1f0d4c3b21"
# name = "home"
# local_addr = "127.0.0.1:22"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# rendezvous configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path. It starts
# a relay on :2213 that accepts servers and clients without authentication.

admin_addr: ":8080"

relay:
  server_name: "rendezvous"
  listeners:
    - listen_addr: ":2213"
      transport: "tcp" # tcp | tls | unix
  authentication:
    mode: "none" # none | token | http
  timeouts:
    handshake_timeout_ms: 10000
    idle_timeout_ms: 0
    call_timeout_ms: 5000
    authentication_timeout_ms: 8000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("rendezvous_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn default_templates_load() {
        let dir = temp_dir("templates");
        for name in ["rendezvous.toml", "rendezvous.yaml"] {
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());

            let cfg = load_config(&path).expect("load_config");
            let relay = cfg.relay.expect("relay section");
            assert_eq!(relay.listeners[0].listen_addr, ":2213");
            assert_eq!(relay.listeners[0].transport, "tcp");
            assert_eq!(relay.authentication.mode, AuthMode::None);
            assert_eq!(relay.timeouts.handshake, Duration::from_secs(10));
            assert_eq!(relay.timeouts.idle, None);
            assert_eq!(cfg.admin_addr, ":8080");
            assert!(cfg.peers.is_empty());
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn peers_are_validated() {
        let dir = temp_dir("peers");
        let cfg_path = dir.join("rendezvous.toml");

        let toml = r#"
[[peers]]
mode = "expose"
relay_addr = "relay.example.net:2213"
server_uuid = "6f1c0b8e-8f64-4a59-9a3a-2f1f0d4c3b21"
local_addr = "127.0.0.1:22"
token = " secret "

[[peers]]
mode = "forward"
relay_addr = "relay.example.net:2213"
transport = "TLS"
server_uuid = "{6f1c0b8e-8f64-4a59-9a3a-2f1f0d4c3b21}"
listen_addr = ":2222"
tls = { insecure_skip_verify = true }
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert!(cfg.relay.is_none());
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].mode, PeerMode::Expose);
        assert_eq!(cfg.peers[0].token, "secret");
        assert!(cfg.peers[0].auto_reconnect);
        assert_eq!(cfg.peers[1].mode, PeerMode::Forward);
        assert_eq!(cfg.peers[1].transport, "tls");
        assert!(cfg.peers[1].tls.insecure_skip_verify);
        assert!(!cfg.peers[1].auto_reconnect);
        assert_eq!(cfg.peers[0].server_uuid, cfg.peers[1].server_uuid);

        let missing = r#"
[[peers]]
mode = "forward"
relay_addr = "relay.example.net:2213"
server_uuid = ""
listen_addr = ":2222"
"#;
        std::fs::write(&cfg_path, missing).expect("write");
        let err = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(err.contains("peers[0] missing server_uuid"), "{err}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn relay_authentication_modes() {
        let dir = temp_dir("auth");
        let cfg_path = dir.join("rendezvous.yaml");

        let yaml = r#"
relay:
  listeners:
    - listen_addr: ":2213"
  authentication:
    mode: http
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let err = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(err.contains("missing url"), "{err}");

        let yaml = r#"
relay:
  listeners:
    - listen_addr: ":2213"
  authentication:
    mode: token
    token: abc
  timeouts:
    idle_timeout_ms: 60000
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let relay = load_config(&cfg_path).unwrap().relay.unwrap();
        assert_eq!(relay.authentication.mode, AuthMode::Token);
        assert_eq!(relay.authentication.token, "abc");
        assert_eq!(relay.timeouts.idle, Some(Duration::from_secs(60)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_and_empty_configs_are_rejected() {
        let dir = temp_dir("reject");
        let cfg_path = dir.join("rendezvous.toml");

        std::fs::write(&cfg_path, "tunnels = []\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err()).to_ascii_lowercase();
        assert!(msg.contains("tunnels"), "{msg}");

        std::fs::write(&cfg_path, "admin_addr = \":8080\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("nothing to run"), "{msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_candidate() {
        let dir = temp_dir("explicit");
        let p = normalize_explicit_path(&dir).unwrap();
        assert_eq!(p, dir.join("rendezvous.toml"));

        std::fs::write(dir.join("rendezvous.yml"), "").expect("write");
        let p = normalize_explicit_path(&dir).unwrap();
        assert_eq!(p, dir.join("rendezvous.yml"));

        let p = normalize_explicit_path(&dir.join("custom")).unwrap();
        assert_eq!(p, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
