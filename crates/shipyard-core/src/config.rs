//! shipyard.toml configuration parser.
//!
//! Every field is optional; accessors fall back to the defaults the daemon
//! runs with when the file (or a section of it) is absent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::RotatorConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipyardConfig {
    pub server: Option<ServerConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub placement: Option<PlacementConfig>,
    pub installations: Option<InstallationsConfig>,
    pub webhooks: Option<WebhooksConfig>,
    pub rotator: Option<RotatorSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Identity used as the reconciliation lock owner. Generated when unset.
    pub instance_id: Option<String>,
    pub listen: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Log as JSON lines instead of the human-readable format.
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence of the fast supervisors (e.g. "30s").
    pub poll_interval: Option<String>,
    /// Cadence of the low-urgency supervisors (e.g. "5m").
    pub slow_poll_interval: Option<String>,
    /// How long a resource may sit in a failed state before it is reported as stuck.
    pub stuck_warning_after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    pub cluster_resource_threshold: Option<u32>,
    pub cpu_threshold: Option<u32>,
    pub memory_threshold: Option<u32>,
    pub pod_threshold: Option<u32>,
    pub cluster_resource_threshold_scale_value: Option<u32>,
    pub balanced_installation_scheduling: Option<bool>,
    pub prefer_stable_clusters: Option<bool>,
    pub always_schedule_external_clusters: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationsConfig {
    /// Grace window applied when an installation is marked for deletion.
    pub deletion_pending_time: Option<String>,
    /// Upper bound of installations the deletion sweep keeps in flight.
    pub deletion_max_updating: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhooksConfig {
    pub failure_threshold: Option<u32>,
    pub delivery_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotatorSection {
    pub use_rotator: Option<bool>,
    pub max_scaling: Option<u32>,
    pub max_drain_retries: Option<u32>,
    pub evict_grace_period: Option<String>,
    pub wait_between_rotations: Option<String>,
    pub wait_between_drains: Option<String>,
    pub wait_between_pod_evictions: Option<String>,
}

impl ShipyardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShipyardConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn listen(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.listen.clone())
            .unwrap_or_else(|| "0.0.0.0:8075".to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server
            .as_ref()
            .and_then(|s| s.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/shipyard"))
    }

    pub fn log_json(&self) -> bool {
        self.server.as_ref().and_then(|s| s.log_json).unwrap_or(false)
    }

    pub fn instance_id(&self) -> Option<String> {
        self.server.as_ref().and_then(|s| s.instance_id.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        let raw = self.scheduler.as_ref().and_then(|s| s.poll_interval.as_deref());
        duration_or(raw, Duration::from_secs(30))
    }

    pub fn slow_poll_interval(&self) -> Duration {
        let raw = self
            .scheduler
            .as_ref()
            .and_then(|s| s.slow_poll_interval.as_deref());
        duration_or(raw, Duration::from_secs(300))
    }

    pub fn stuck_warning_after(&self) -> Duration {
        let raw = self
            .scheduler
            .as_ref()
            .and_then(|s| s.stuck_warning_after.as_deref());
        duration_or(raw, Duration::from_secs(3600))
    }

    pub fn placement(&self) -> PlacementConfig {
        self.placement.clone().unwrap_or_default()
    }

    pub fn deletion_pending_time(&self) -> Duration {
        let raw = self
            .installations
            .as_ref()
            .and_then(|s| s.deletion_pending_time.as_deref());
        duration_or(raw, Duration::from_secs(3 * 60 * 60))
    }

    pub fn deletion_max_updating(&self) -> u32 {
        self.installations
            .as_ref()
            .and_then(|s| s.deletion_max_updating)
            .unwrap_or(25)
    }

    pub fn webhook_failure_threshold(&self) -> u32 {
        self.webhooks
            .as_ref()
            .and_then(|s| s.failure_threshold)
            .unwrap_or(10)
    }

    pub fn webhook_delivery_timeout(&self) -> Duration {
        let raw = self
            .webhooks
            .as_ref()
            .and_then(|s| s.delivery_timeout.as_deref());
        duration_or(raw, Duration::from_secs(5))
    }

    /// Rotation policy used when an upgrade/resize request does not carry its own.
    pub fn default_rotator(&self) -> RotatorConfig {
        let base = RotatorConfig::default();
        let Some(section) = &self.rotator else {
            return base;
        };
        let secs = |raw: &Option<String>, fallback: u64| {
            raw.as_deref()
                .and_then(parse_duration)
                .map(|d| d.as_secs())
                .unwrap_or(fallback)
        };
        RotatorConfig {
            use_rotator: section.use_rotator.unwrap_or(base.use_rotator),
            max_scaling: section.max_scaling.unwrap_or(base.max_scaling),
            max_drain_retries: section.max_drain_retries.unwrap_or(base.max_drain_retries),
            evict_grace_period_secs: secs(&section.evict_grace_period, base.evict_grace_period_secs),
            wait_between_rotations_secs: secs(
                &section.wait_between_rotations,
                base.wait_between_rotations_secs,
            ),
            wait_between_drains_secs: secs(&section.wait_between_drains, base.wait_between_drains_secs),
            wait_between_pod_evictions_secs: secs(
                &section.wait_between_pod_evictions,
                base.wait_between_pod_evictions_secs,
            ),
        }
    }

    /// Scaffold a config file with every default spelled out.
    pub fn scaffold() -> Self {
        ShipyardConfig {
            server: Some(ServerConfig {
                instance_id: None,
                listen: Some("0.0.0.0:8075".to_string()),
                data_dir: Some(PathBuf::from("/var/lib/shipyard")),
                log_json: Some(false),
            }),
            scheduler: Some(SchedulerConfig {
                poll_interval: Some("30s".to_string()),
                slow_poll_interval: Some("5m".to_string()),
                stuck_warning_after: Some("60m".to_string()),
            }),
            placement: Some(PlacementConfig {
                cluster_resource_threshold: Some(80),
                cpu_threshold: None,
                memory_threshold: None,
                pod_threshold: None,
                cluster_resource_threshold_scale_value: Some(0),
                balanced_installation_scheduling: Some(true),
                prefer_stable_clusters: Some(true),
                always_schedule_external_clusters: Some(false),
            }),
            installations: Some(InstallationsConfig {
                deletion_pending_time: Some("180m".to_string()),
                deletion_max_updating: Some(25),
            }),
            webhooks: Some(WebhooksConfig {
                failure_threshold: Some(10),
                delivery_timeout: Some("5s".to_string()),
            }),
            rotator: None,
        }
    }
}

/// Parse a duration string like "30s", "5m", "2h" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration_or(raw: Option<&str>, fallback: Duration) -> Duration {
    raw.and_then(parse_duration).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_roundtrips() {
        let config = ShipyardConfig::scaffold();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("poll_interval"));
        let parsed: ShipyardConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.poll_interval(), Duration::from_secs(30));
        assert_eq!(parsed.deletion_pending_time(), Duration::from_secs(3 * 60 * 60));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: ShipyardConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen(), "0.0.0.0:8075");
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.slow_poll_interval(), Duration::from_secs(300));
        assert_eq!(config.deletion_max_updating(), 25);
        assert_eq!(config.webhook_failure_threshold(), 10);
        assert!(config.instance_id().is_none());
    }

    #[test]
    fn test_parse_sections() {
        let toml_str = r#"
[server]
instance_id = "shipyard-a"

[scheduler]
poll_interval = "5s"
slow_poll_interval = "1m"

[placement]
cluster_resource_threshold = 70
pod_threshold = 90

[rotator]
max_scaling = 3
wait_between_rotations = "2m"
"#;
        let config: ShipyardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.instance_id().as_deref(), Some("shipyard-a"));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.slow_poll_interval(), Duration::from_secs(60));
        assert_eq!(config.placement().cluster_resource_threshold, Some(70));
        assert_eq!(config.placement().pod_threshold, Some(90));

        let rotator = config.default_rotator();
        assert_eq!(rotator.max_scaling, 3);
        assert_eq!(rotator.wait_between_rotations_secs, 120);
        assert_eq!(rotator.max_drain_retries, RotatorConfig::default().max_drain_retries);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipyard.toml");
        std::fs::write(&path, "[webhooks]\nfailure_threshold = 3\n").unwrap();
        let config = ShipyardConfig::from_file(&path).unwrap();
        assert_eq!(config.webhook_failure_threshold(), 3);
    }
}
