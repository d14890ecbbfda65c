use std::path::PathBuf;
use std::time::Duration;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Name this device advertises and presents when dialing a sender.
    pub device_name: String,
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Fail a session stuck in `Connecting` after this long. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Minimum number of bytes between two `Progress` events.
    pub progress_interval: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            device_name: "hushdrop".to_string(),
            download_dir: PathBuf::from("received"),
            connect_timeout: None,
            progress_interval: 256 * 1024,
        }
    }
}
