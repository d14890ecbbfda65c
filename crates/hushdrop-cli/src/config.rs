use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use hushdrop_transfer::CoordinatorConfig;
use hushdrop_transfer::transport::lan::LanConfig;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Settings read from the environment (and `.env`), before flags are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device_name: String,
    pub download_dir: PathBuf,
    pub discovery_port: u16,
    /// `HUSHDROP_CONNECT_TIMEOUT_SECS=0` disables the timeout.
    pub connect_timeout: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = CoordinatorConfig::default();

        let device_name = lookup("HUSHDROP_DEVICE_NAME")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or(defaults.device_name);
        let download_dir = lookup("HUSHDROP_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);
        let discovery_port = match lookup("HUSHDROP_DISCOVERY_PORT") {
            Some(port) => port
                .parse()
                .with_context(|| format!("HUSHDROP_DISCOVERY_PORT: invalid port {:?}", port))?,
            None => LanConfig::default().discovery_port,
        };
        let timeout_secs: u64 = match lookup("HUSHDROP_CONNECT_TIMEOUT_SECS") {
            Some(secs) => secs
                .parse()
                .with_context(|| format!("HUSHDROP_CONNECT_TIMEOUT_SECS: invalid value {:?}", secs))?,
            None => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        Ok(Self {
            device_name,
            download_dir,
            discovery_port,
            connect_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            device_name: self.device_name.clone(),
            download_dir: self.download_dir.clone(),
            connect_timeout: self.connect_timeout,
            ..CoordinatorConfig::default()
        }
    }

    pub fn lan_config(&self) -> LanConfig {
        LanConfig {
            discovery_port: self.discovery_port,
            ..LanConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> anyhow::Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.device_name, "hushdrop");
        assert_eq!(s.download_dir, PathBuf::from("received"));
        assert_eq!(s.discovery_port, 48613);
        assert_eq!(s.connect_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn environment_overrides() {
        let s = settings(&[
            ("HUSHDROP_DEVICE_NAME", "  Kitchen tablet "),
            ("HUSHDROP_DOWNLOAD_DIR", "/tmp/drops"),
            ("HUSHDROP_DISCOVERY_PORT", "50000"),
            ("HUSHDROP_CONNECT_TIMEOUT_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(s.device_name, "Kitchen tablet");
        assert_eq!(s.download_dir, PathBuf::from("/tmp/drops"));
        assert_eq!(s.lan_config().discovery_port, 50000);
        assert_eq!(s.coordinator_config().connect_timeout, None);
    }

    #[test]
    fn blank_device_name_keeps_default() {
        let s = settings(&[("HUSHDROP_DEVICE_NAME", "   ")]).unwrap();
        assert_eq!(s.device_name, "hushdrop");
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(settings(&[("HUSHDROP_DISCOVERY_PORT", "70000")]).is_err());
        assert!(settings(&[("HUSHDROP_CONNECT_TIMEOUT_SECS", "soon")]).is_err());
    }
}
