//! Daemon Configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Link-wide settings
    pub general: GeneralSettings,
    /// One entry per bonded tunnel
    #[serde(default, rename = "tunnel")]
    pub tunnels: Vec<TunnelSettings>,
}

/// Link-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Shared secret both peers must present
    pub password: String,
    /// MTU of the TUN device (payload bytes per aggregate packet)
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Name of the TUN device
    #[serde(default = "default_tuntap_name")]
    pub tuntap_name: String,
    /// Local port accepting TCP connections to splice over the bond,
    /// disabled when absent
    #[serde(default)]
    pub tcp_listen_port: Option<u16>,
    /// Hook script run on link and tunnel state changes
    #[serde(default)]
    pub hook_script: Option<PathBuf>,
    /// Local address of the point-to-point link, exported to hooks
    #[serde(default)]
    pub ip4: String,
    /// IPv6 address, exported to hooks
    #[serde(default)]
    pub ip6: String,
    /// IPv4 gateway, exported to hooks
    #[serde(default)]
    pub ip4_gateway: String,
    /// IPv6 gateway, exported to hooks
    #[serde(default)]
    pub ip6_gateway: String,
    /// IPv4 routes, exported to hooks
    #[serde(default)]
    pub ip4_routes: String,
    /// IPv6 routes, exported to hooks
    #[serde(default)]
    pub ip6_routes: String,
    /// Seconds of silence before a lossy tunnel is declared dead
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    /// Bring the TUN device up at startup instead of on first tunnel
    #[serde(default)]
    pub static_tunnel: bool,
    /// Also service retransmission requests for plain UDP payloads
    #[serde(default)]
    pub resend_udp_payloads: bool,
}

fn default_mtu() -> u16 {
    1450
}

fn default_tuntap_name() -> String {
    "lbond0".to_string()
}

fn default_timeout() -> u32 {
    30
}

/// Per-tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Tunnel name, unique within the config
    pub name: String,
    /// Local bind address
    #[serde(default)]
    pub bind_addr: Option<String>,
    /// Local bind port (required in server mode, doubles as the tunnel id)
    #[serde(default)]
    pub bind_port: Option<u16>,
    /// Network device to bind the socket to
    #[serde(default)]
    pub bind_device: Option<String>,
    /// Remote address to send to (client mode)
    #[serde(default)]
    pub dest_addr: Option<String>,
    /// Remote port (client mode, doubles as the tunnel id)
    #[serde(default)]
    pub dest_port: Option<u16>,
    /// Wait for the peer instead of dialing out
    #[serde(default)]
    pub server_mode: bool,
    /// Declared ceiling in kbit/s, 0 enables automatic adjustment
    #[serde(default)]
    pub bandwidth_max: u32,
    /// Quota credit rate in kbit/s, 0 disables metering
    #[serde(default)]
    pub quota: u32,
    /// Only used when no unrestricted tunnel is authenticated
    #[serde(default)]
    pub fallback_only: bool,
    /// Per-tunnel override of the dead-tunnel timeout in seconds
    #[serde(default)]
    pub timeout: Option<u32>,
}

impl TunnelSettings {
    /// The tunnel id both peers agree on: the port number of the
    /// server-side socket.
    pub fn id(&self) -> u16 {
        if self.server_mode {
            self.bind_port.unwrap_or(0)
        } else {
            self.dest_port.unwrap_or(0)
        }
    }
}

impl Settings {
    /// Load and validate a configuration file.
    ///
    /// The file must not be group or other accessible; it holds the shared
    /// secret.
    pub fn load(path: &Path) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(ConfigError::InsecurePermissions(
                    path.display().to_string(),
                ));
            }
        }
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse from a TOML string without touching the filesystem
    pub fn parse(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.general.password.is_empty() {
            return Err(ConfigError::ValidationError(
                "general.password must not be empty".into(),
            ));
        }
        if self.tunnels.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[tunnel]] is required".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for tunnel in &self.tunnels {
            if !names.insert(tunnel.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tunnel name {:?}",
                    tunnel.name
                )));
            }
            if tunnel.server_mode {
                if tunnel.bind_port.is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "tunnel {:?}: server mode requires bind_port",
                        tunnel.name
                    )));
                }
            } else if tunnel.dest_addr.is_none() || tunnel.dest_port.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "tunnel {:?}: client mode requires dest_addr and dest_port",
                    tunnel.name
                )));
            }
        }
        Ok(())
    }

    /// Per-tunnel timeout, falling back to the link-wide default
    pub fn tunnel_timeout(&self, tunnel: &TunnelSettings) -> u32 {
        tunnel.timeout.unwrap_or(self.general.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [general]
        password = "hunter2"
        tcp_listen_port = 10500

        [[tunnel]]
        name = "adsl"
        dest_addr = "198.51.100.7"
        dest_port = 5080
        bandwidth_max = 8000

        [[tunnel]]
        name = "lte"
        dest_addr = "198.51.100.7"
        dest_port = 5081
        quota = 2000
        fallback_only = true
    "#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.general.mtu, 1450);
        assert_eq!(settings.general.tuntap_name, "lbond0");
        assert_eq!(settings.tunnels.len(), 2);
        assert_eq!(settings.tunnels[0].id(), 5080);
        assert!(settings.tunnels[1].fallback_only);
        assert_eq!(settings.tunnel_timeout(&settings.tunnels[0]), 30);
    }

    #[test]
    fn test_server_mode_requires_bind_port() {
        let bad = r#"
            [general]
            password = "x"

            [[tunnel]]
            name = "t"
            server_mode = true
        "#;
        assert!(Settings::parse(bad).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let bad = r#"
            [general]
            password = "x"

            [[tunnel]]
            name = "t"
            dest_addr = "192.0.2.1"
            dest_port = 5000

            [[tunnel]]
            name = "t"
            dest_addr = "192.0.2.1"
            dest_port = 5001
        "#;
        assert!(Settings::parse(bad).is_err());
    }

    #[test]
    fn test_empty_password_rejected() {
        let bad = r#"
            [general]
            password = ""

            [[tunnel]]
            name = "t"
            dest_addr = "192.0.2.1"
            dest_port = 5000
        "#;
        assert!(Settings::parse(bad).is_err());
    }
}
