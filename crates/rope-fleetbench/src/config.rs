//! Experiment configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ExperimentError, Result};
use crate::types::{RequestKind, SubnetId};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "FLEETBENCH";

/// Complete experiment configuration.
///
/// Constructed once (from a file, the environment or code) and shared
/// read-only by every component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Testnet the load is sent to
    #[serde(default = "default_testnet")]
    pub testnet: String,

    /// Testnet hosting the driver machines
    #[serde(default = "default_testnet")]
    pub driver_testnet: String,

    /// Query or call requests
    #[serde(default)]
    pub request_kind: RequestKind,

    /// Target every node of the subnet, even for queries
    #[serde(default)]
    pub target_all_nodes: bool,

    /// Target addresses, bypassing registry lookup
    #[serde(default)]
    pub explicit_targets: Vec<String>,

    /// Driver machine addresses, bypassing registry lookup
    #[serde(default)]
    pub explicit_driver_machines: Vec<String>,

    /// Subnet whose nodes act as driver machines
    #[serde(default)]
    pub driver_partition_override: Option<SubnetId>,

    /// Maximum number of driver machines to use
    #[serde(default)]
    pub max_driver_count: Option<usize>,

    /// Requests per second used when none is given per iteration
    #[serde(default = "default_target_rps")]
    pub target_requests_per_second: u64,

    /// Index of the node targeted by query load
    #[serde(default)]
    pub query_node_index: usize,

    /// Look targets up by subnet id instead of by subnet index
    #[serde(default)]
    pub mainnet_mode: bool,

    /// Subnet hosting the resources under test (mainnet mode)
    #[serde(default)]
    pub mainnet_target_partition_id: Option<SubnetId>,

    /// Index of the target subnet in the registry's subnet list
    #[serde(default = "default_target_subnet_index")]
    pub target_subnet_index: usize,

    /// Index of the driver subnet when drivers share the target testnet
    #[serde(default)]
    pub driver_subnet_index: usize,

    /// Skip telemetry polling
    #[serde(default)]
    pub instrumentation_disabled: bool,

    /// Resource identifiers the agent sends requests to
    #[serde(default)]
    pub resource_ids: Vec<String>,

    /// Load agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Registry client settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Telemetry settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Quiescence polling settings
    #[serde(default)]
    pub quiescence: QuiescenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_testnet() -> String {
    "testnet".to_string()
}

fn default_target_rps() -> u64 {
    10
}

fn default_target_subnet_index() -> usize {
    1
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            testnet: default_testnet(),
            driver_testnet: default_testnet(),
            request_kind: RequestKind::default(),
            target_all_nodes: false,
            explicit_targets: Vec::new(),
            explicit_driver_machines: Vec::new(),
            driver_partition_override: None,
            max_driver_count: None,
            target_requests_per_second: default_target_rps(),
            query_node_index: 0,
            mainnet_mode: false,
            mainnet_target_partition_id: None,
            target_subnet_index: default_target_subnet_index(),
            driver_subnet_index: 0,
            instrumentation_disabled: false,
            resource_ids: Vec::new(),
            agent: AgentConfig::default(),
            output: OutputConfig::default(),
            registry: RegistryConfig::default(),
            telemetry: TelemetryConfig::default(),
            quiescence: QuiescenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a TOML file, with `FLEETBENCH__*` environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("explicit_targets")
                    .with_list_parse_key("explicit_driver_machines")
                    .with_list_parse_key("resource_ids")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ExperimentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.mainnet_mode && self.mainnet_target_partition_id.is_none() {
            return Err(ExperimentError::Config(
                "mainnet_mode requires mainnet_target_partition_id".to_string(),
            ));
        }
        if self.max_driver_count == Some(0) {
            return Err(ExperimentError::Config(
                "max_driver_count must be positive".to_string(),
            ));
        }
        if self.quiescence.sleep_per_iteration_secs == 0 && !self.instrumentation_disabled {
            return Err(ExperimentError::Config(
                "quiescence.sleep_per_iteration_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether drivers live on a different testnet than the targets
    pub fn drivers_on_separate_testnet(&self) -> bool {
        self.driver_testnet != self.testnet
    }

    /// Whether every resolved node is targeted
    pub fn targets_all(&self) -> bool {
        self.request_kind == RequestKind::Call || self.target_all_nodes
    }

    /// Path to the persistent resolution cache
    pub fn cache_path(&self) -> PathBuf {
        self.output
            .cache_path
            .clone()
            .unwrap_or_else(|| self.output.dir.join("fleetbench-cache.json"))
    }
}

/// Load agent settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent binary name on the driver machines
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Locally built agent; forces reinstall when set
    #[serde(default)]
    pub local_path: Option<PathBuf>,

    /// Agent source used for installation when no local build is given
    #[serde(default = "default_agent_source")]
    pub source_path: PathBuf,

    /// Cluster-node service stopped on driver machines during the experiment
    #[serde(default = "default_node_service")]
    pub node_service: String,

    /// Remote user for ssh/scp
    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    /// ssh/scp connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Port of the node endpoint the agent targets
    #[serde(default = "default_target_port")]
    pub target_port: u16,

    /// Summary file written by the agent on each driver
    #[serde(default = "default_summary_file")]
    pub summary_file: String,
}

fn default_agent_binary() -> String {
    "workload-generator".to_string()
}

fn default_agent_source() -> PathBuf {
    PathBuf::from("./bin/workload-generator")
}

fn default_node_service() -> String {
    "rope-node".to_string()
}

fn default_remote_user() -> String {
    "admin".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_target_port() -> u16 {
    8080
}

fn default_summary_file() -> String {
    "wg_summary".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            local_path: None,
            source_path: default_agent_source(),
            node_service: default_node_service(),
            remote_user: default_remote_user(),
            connect_timeout_secs: default_connect_timeout(),
            target_port: default_target_port(),
            summary_file: default_summary_file(),
        }
    }
}

impl AgentConfig {
    /// Binary copied to the drivers on install
    pub fn install_source(&self) -> &Path {
        self.local_path.as_deref().unwrap_or(&self.source_path)
    }
}

/// Output settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Experiment output directory
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Resolution cache file; defaults to a file inside `dir`
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./results")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            cache_path: None,
        }
    }
}

/// Registry client settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry admin binary
    #[serde(default = "default_admin_binary")]
    pub admin_binary: PathBuf,

    /// Registry URL of the target testnet
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Registry URL of the driver testnet; defaults to `url`
    #[serde(default)]
    pub driver_url: Option<String>,
}

fn default_admin_binary() -> PathBuf {
    PathBuf::from("rope-admin")
}

fn default_registry_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            admin_binary: default_admin_binary(),
            url: default_registry_url(),
            driver_url: None,
        }
    }
}

impl RegistryConfig {
    pub fn driver_url(&self) -> &str {
        self.driver_url.as_deref().unwrap_or(&self.url)
    }
}

/// Telemetry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Prometheus base URL
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Request-rate query; `{testnet}` is substituted
    #[serde(default = "default_request_rate_query")]
    pub request_rate_query: String,

    /// HTTP timeout in seconds
    #[serde(default = "default_telemetry_timeout")]
    pub timeout_secs: u64,
}

fn default_prometheus_url() -> String {
    "http://127.0.0.1:9090".to_string()
}

fn default_request_rate_query() -> String {
    "rate(rope_http_request_duration_seconds_count{testnet=\"{testnet}\"}[60s])".to_string()
}

fn default_telemetry_timeout() -> u64 {
    30
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: default_prometheus_url(),
            request_rate_query: default_request_rate_query(),
            timeout_secs: default_telemetry_timeout(),
        }
    }
}

impl TelemetryConfig {
    /// Request-rate query for the given testnet
    pub fn request_rate_query_for(&self, testnet: &str) -> String {
        self.request_rate_query.replace("{testnet}", testnet)
    }
}

/// Quiescence polling settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuiescenceConfig {
    /// Maximum number of telemetry polls
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Mean request rate considered quiet
    #[serde(default = "default_quiet_rate")]
    pub quiet_rate_rps: f64,

    /// Sleep after each poll, in seconds
    #[serde(default = "default_sleep_per_iteration")]
    pub sleep_per_iteration_secs: u64,

    /// Fixed sleep when instrumentation is disabled, in seconds
    #[serde(default = "default_uninstrumented_sleep")]
    pub uninstrumented_sleep_secs: u64,
}

fn default_max_iterations() -> u32 {
    60
}

fn default_quiet_rate() -> f64 {
    2.0
}

fn default_sleep_per_iteration() -> u64 {
    10
}

fn default_uninstrumented_sleep() -> u64 {
    60
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quiet_rate_rps: default_quiet_rate(),
            sleep_per_iteration_secs: default_sleep_per_iteration(),
            uninstrumented_sleep_secs: default_uninstrumented_sleep(),
        }
    }
}

impl QuiescenceConfig {
    pub fn sleep_per_iteration(&self) -> Duration {
        Duration::from_secs(self.sleep_per_iteration_secs)
    }

    pub fn uninstrumented_sleep(&self) -> Duration {
        Duration::from_secs(self.uninstrumented_sleep_secs)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
