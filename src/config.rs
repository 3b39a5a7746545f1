use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt, fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

/// File looked up in the working directory before the per-user config.
pub const LOCAL_CONFIG_NAME: &str = ".sshforwardrc";

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// OpenSSH style `SHA256:...` fingerprint the server key must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub name: String,
    #[serde(rename = "remoteTargetHost")]
    pub remote_host: String,
    #[serde(rename = "remoteTargetPort")]
    pub remote_port: u16,
    #[serde(rename = "localBindingPort")]
    pub local_port: u16,
    /// Local interface to listen on; all interfaces when absent.
    #[serde(rename = "bindAddress", default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

impl ForwardSpec {
    #[cfg(test)]
    pub fn new(name: &str, remote_host: &str, remote_port: u16, local_port: u16) -> Self {
        ForwardSpec {
            name: name.to_string(),
            remote_host: remote_host.to_string(),
            remote_port,
            local_port,
            bind_address: None,
        }
    }

    pub fn bind_host(&self) -> &str {
        self.bind_address.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn bind_addr(&self) -> String {
        let host = self.bind_host();
        if host.contains(':') {
            format!("[{}]:{}", host, self.local_port)
        } else {
            format!("{}:{}", host, self.local_port)
        }
    }

    /// Whether both forwards would claim the same local socket. A wildcard
    /// address collides with every address of the same port.
    fn overlaps(&self, other: &ForwardSpec) -> bool {
        if self.local_port != other.local_port {
            return false;
        }
        let ours = self.bind_host().parse::<IpAddr>().ok();
        let theirs = other.bind_host().parse::<IpAddr>().ok();
        match (ours, theirs) {
            (Some(a), _) if a.is_unspecified() => true,
            (_, Some(b)) if b.is_unspecified() => true,
            (Some(a), Some(b)) => a == b,
            _ => self.bind_host().eq_ignore_ascii_case(other.bind_host()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_command: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            connect_timeout_secs: 5,
            reconnect_delay_secs: 5,
            probe_interval_secs: 5,
            probe_command: "echo".to_string(),
        }
    }
}

impl Options {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub ssh_server: ServerEndpoint,
    pub forwards: Vec<ForwardSpec>,
    #[serde(default)]
    pub options: Options,
}

impl Config {
    /// Load from `explicit` if given, otherwise from the first existing
    /// default location. Returns the path that was read.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::discover()?,
        };
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// `.json` files are read as JSON, anything else (including
    /// `.sshforwardrc`) as YAML.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Config = if is_json {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    fn discover() -> Result<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG_NAME);
        if local.exists() {
            return Ok(local);
        }
        let user = Self::config_path()?;
        if user.exists() {
            return Ok(user);
        }
        anyhow::bail!(
            "No configuration found: looked for ./{} and {}",
            LOCAL_CONFIG_NAME,
            user.display()
        )
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sshf");

        Ok(config_dir.join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        let server = &self.ssh_server;
        if server.host.trim().is_empty() {
            anyhow::bail!("sshServer.host must not be empty");
        }
        if server.port == 0 {
            anyhow::bail!("sshServer.port must not be 0");
        }
        if server.username.trim().is_empty() {
            anyhow::bail!("sshServer.username must not be empty");
        }
        if self.forwards.is_empty() {
            anyhow::bail!("At least one forward must be configured");
        }
        if self.options.probe_interval_secs == 0 {
            anyhow::bail!("options.probeIntervalSecs must be at least 1");
        }

        let mut by_port: HashMap<u16, Vec<&ForwardSpec>> = HashMap::new();
        for forward in &self.forwards {
            if forward.remote_host.trim().is_empty() {
                anyhow::bail!("Forward '{}': remoteTargetHost must not be empty", forward.name);
            }
            if forward.remote_port == 0 {
                anyhow::bail!("Forward '{}': remoteTargetPort must not be 0", forward.name);
            }
            if forward.local_port == 0 {
                anyhow::bail!("Forward '{}': localBindingPort must not be 0", forward.name);
            }
            let claimed = by_port.entry(forward.local_port).or_default();
            if let Some(other) = claimed.iter().find(|other| other.overlaps(forward)) {
                anyhow::bail!(
                    "Forward '{}': {} is already used by forward '{}' ({})",
                    forward.name,
                    forward.bind_addr(),
                    other.name,
                    other.bind_addr()
                );
            }
            claimed.push(forward);
        }
        Ok(())
    }
}
