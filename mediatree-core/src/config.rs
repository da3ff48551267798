use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub mesh: MeshConfig,
    pub load: LoadConfig,
    pub session: SessionConfig,
    pub autoscaler: AutoscalerConfig,
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub connect_timeout_seconds: u64,
    /// Upper bound for a single store round trip
    pub operation_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 10,
            operation_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Mesh shape and slot sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Name of the global topology broadcast channel (`topology:{tree_id}`)
    pub tree_id: String,
    pub bootstrap_on_start: bool,
    /// Template to build the first tree from instead of the minimal chain
    pub bootstrap_template: Option<String>,
    pub injection_max_slots: u32,
    pub relay_max_slots: u32,
    pub egress_max_slots: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tree_id: "default".to_string(),
            bootstrap_on_start: true,
            bootstrap_template: None,
            injection_max_slots: 10,
            relay_max_slots: 10,
            egress_max_slots: 10,
        }
    }
}

/// Load normalisation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// CPU percentage treated as 100% load
    pub cpu_limit_percent: f64,
    /// RTP queue depth treated as 100% relay load
    pub queue_limit_ms: f64,
    pub egress_max_viewers: u32,
    pub egress_max_sessions: u32,
    /// Egress load above which no new viewers are placed on it
    pub viewer_accept_load: f64,
    /// Load at or above which a node is considered unhealthy
    pub health_limit: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            cpu_limit_percent: 80.0,
            queue_limit_ms: 200.0,
            egress_max_viewers: 10,
            egress_max_sessions: 5,
            viewer_accept_load: 80.0,
            health_limit: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cleanup_interval_seconds: u64,
    pub cleanup_timeout_seconds: u64,
    pub session_idle_seconds: u64,
    pub path_idle_seconds: u64,
    pub http_timeout_seconds: u64,
    pub max_path_hops: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 30,
            cleanup_timeout_seconds: 10,
            session_idle_seconds: 60,
            path_idle_seconds: 60,
            http_timeout_seconds: 10,
            max_path_hops: 10,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub tick_timeout_seconds: u64,
    pub saturation_threshold: f64,
    pub scale_up_cooldown_seconds: u64,
    pub recover_cooldown_seconds: u64,
    /// Pools evaluated on every tick ("injection", "relay", "egress")
    pub roles: Vec<String>,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            tick_timeout_seconds: 10,
            saturation_threshold: 80.0,
            scale_up_cooldown_seconds: 60,
            recover_cooldown_seconds: 10,
            roles: vec!["injection".to_string(), "egress".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerMode {
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub mode: ProvisionerMode,
    pub docker: DockerConfig,
    pub kubernetes: KubernetesConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            mode: ProvisionerMode::Docker,
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

/// Inclusive port interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub start: u16,
    pub end: u16,
}

impl PortRangeConfig {
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub injection: String,
    pub relay: String,
    pub egress: String,
    pub videoroom: String,
    pub streaming: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            injection: "media-tree/injection-node:latest".to_string(),
            relay: "media-tree/relay-node:latest".to_string(),
            egress: "media-tree/egress-node:latest".to_string(),
            videoroom: "media-tree/janus-videoroom:latest".to_string(),
            streaming: "media-tree/janus-streaming:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub network: String,
    pub images: ImagesConfig,
    pub cpus: f64,
    pub memory_mb: u64,
    /// Host reachable by viewers and broadcasters
    pub external_host: String,
    /// Redis address handed to the media nodes
    pub node_redis_host: String,
    pub node_redis_port: u16,
    pub startup_timeout_seconds: u64,
    pub api_ports: PortRangeConfig,
    pub media_http_ports: PortRangeConfig,
    pub media_ws_ports: PortRangeConfig,
    pub webrtc_ports: PortRangeConfig,
    pub webrtc_block_size: u16,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: "media-tree".to_string(),
            images: ImagesConfig::default(),
            cpus: 1.0,
            memory_mb: 512,
            external_host: "localhost".to_string(),
            node_redis_host: "redis".to_string(),
            node_redis_port: 6379,
            startup_timeout_seconds: 10,
            api_ports: PortRangeConfig::new(7070, 7100),
            media_http_ports: PortRangeConfig::new(8088, 8120),
            media_ws_ports: PortRangeConfig::new(8188, 8220),
            webrtc_ports: PortRangeConfig::new(20000, 25000),
            webrtc_block_size: 100,
        }
    }
}

/// A physical host that can run one injection or egress pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub external_api_port: u16,
    pub webrtc_ports: PortRangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub api_url: String,
    pub namespace: String,
    pub token_path: String,
    pub ca_cert_path: Option<String>,
    /// Address advertised to viewers for host-bound pods
    pub public_ip: String,
    pub images: ImagesConfig,
    pub agents: Vec<AgentConfig>,
    pub ready_timeout_seconds: u64,
    pub ready_poll_interval_ms: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        let agents = (0u16..3)
            .map(|i| AgentConfig {
                name: format!("k3d-media-tree-agent-{i}"),
                external_api_port: 11000 + i * 1000,
                webrtc_ports: PortRangeConfig::new(20000 + i * 100, 20010 + i * 100),
            })
            .collect();

        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            token_path: "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string(),
            ca_cert_path: Some("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()),
            public_ip: "127.0.0.1".to_string(),
            images: ImagesConfig::default(),
            agents,
            ready_timeout_seconds: 120,
            ready_poll_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then `MEDIATREE__*` environment overrides
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MEDIATREE__REDIS__URL, MEDIATREE__AUTOSCALER__INTERVAL_SECONDS, ...
        builder = builder.add_source(
            Environment::with_prefix("MEDIATREE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Check cross-field constraints, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.redis.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
            Ok(url) => errors.push(format!("redis.url has unsupported scheme '{}'", url.scheme())),
            Err(e) => errors.push(format!("redis.url is invalid: {e}")),
        }
        if self.mesh.tree_id.is_empty() {
            errors.push("mesh.tree_id must not be empty".to_string());
        }
        if self.load.cpu_limit_percent <= 0.0 || self.load.queue_limit_ms <= 0.0 {
            errors.push("load limits must be positive".to_string());
        }
        if self.load.egress_max_viewers == 0 || self.load.egress_max_sessions == 0 {
            errors.push("egress viewer and session caps must be positive".to_string());
        }
        if self.session.max_path_hops < 2 {
            errors.push("session.max_path_hops must be at least 2".to_string());
        }
        if self.autoscaler.interval_seconds == 0 {
            errors.push("autoscaler.interval_seconds must be positive".to_string());
        }
        for role in &self.autoscaler.roles {
            if !matches!(role.as_str(), "injection" | "relay" | "egress") {
                errors.push(format!("autoscaler.roles contains unknown role '{role}'"));
            }
        }

        match self.provisioner.mode {
            ProvisionerMode::Docker => self.validate_docker(&mut errors),
            ProvisionerMode::Kubernetes => {
                if self.provisioner.kubernetes.agents.is_empty() {
                    errors.push("provisioner.kubernetes.agents must not be empty".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_docker(&self, errors: &mut Vec<String>) {
        let docker = &self.provisioner.docker;
        let ranges = [
            ("api_ports", docker.api_ports),
            ("media_http_ports", docker.media_http_ports),
            ("media_ws_ports", docker.media_ws_ports),
            ("webrtc_ports", docker.webrtc_ports),
        ];

        for (name, range) in &ranges {
            if range.start > range.end {
                errors.push(format!("provisioner.docker.{name} is empty"));
            }
        }
        for (i, (a_name, a)) in ranges.iter().enumerate() {
            for (b_name, b) in &ranges[i + 1..] {
                if a.overlaps(b) {
                    errors.push(format!(
                        "provisioner.docker.{a_name} overlaps provisioner.docker.{b_name}"
                    ));
                }
            }
        }
        if docker.webrtc_block_size == 0 {
            errors.push("provisioner.docker.webrtc_block_size must be positive".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.redis_url().is_empty());
        assert_eq!(config.load.cpu_limit_percent, 80.0);
        assert_eq!(config.load.queue_limit_ms, 200.0);
        assert_eq!(config.load.egress_max_viewers, 10);
        assert_eq!(config.load.egress_max_sessions, 5);
        assert_eq!(config.autoscaler.scale_up_cooldown_seconds, 60);
        assert_eq!(config.autoscaler.recover_cooldown_seconds, 10);
        assert_eq!(config.session.session_idle_seconds, 60);
        assert_eq!(config.session.path_idle_seconds, 60);
        assert_eq!(config.autoscaler.interval_seconds, 30);
        assert_eq!(config.provisioner.mode, ProvisionerMode::Docker);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_agents() {
        let config = KubernetesConfig::default();
        assert_eq!(config.agents.len(), 3);
        assert_eq!(config.agents[1].name, "k3d-media-tree-agent-1");
        assert_eq!(config.agents[1].external_api_port, 12000);
        assert_eq!(config.agents[2].webrtc_ports, PortRangeConfig::new(20200, 20210));
    }

    #[test]
    fn test_validate_rejects_overlapping_ranges() {
        let mut config = Config::default();
        config.provisioner.docker.media_ws_ports = PortRangeConfig::new(8100, 8200);
        config.autoscaler.roles.push("router".to_string());

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("overlaps")));
        assert!(errors.iter().any(|e| e.contains("router")));
    }

    #[test]
    fn test_validate_redis_url() {
        let mut config = Config::default();
        config.redis.url = "http://localhost:6379".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("unsupported scheme"));

        config.redis.url = "not a url".to_string();
        assert!(config.validate().unwrap_err()[0].contains("invalid"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[mesh]\ntree_id = \"eu-west\"\n\n[autoscaler]\ninterval_seconds = 5\n\n[provisioner]\nmode = \"kubernetes\""
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.mesh.tree_id, "eu-west");
        assert_eq!(config.autoscaler.interval_seconds, 5);
        assert_eq!(config.provisioner.mode, ProvisionerMode::Kubernetes);
        // Untouched sections keep their defaults
        assert_eq!(config.session.cleanup_interval_seconds, 30);
    }
}
