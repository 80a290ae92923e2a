use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::rebalance::planner::Strategy;
use crate::util::Error;

/// Top-level CLI configuration for the binary. Every option can also
/// be set through its environment variable or, below that, through the
/// optional YAML config file; precedence is flags > environment >
/// config file > built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Kubernetes node autoscaler for VPSie clouds", long_about = None)]
pub struct Cli {
    /// Optional YAML config file consulted below flags and environment.
    #[arg(long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Bind address for the Prometheus metrics endpoint.
    #[arg(long, env = "METRICS_BIND_ADDRESS")]
    pub metrics_bind_address: Option<String>,

    /// Bind address for the liveness/readiness endpoints.
    #[arg(long, env = "HEALTH_BIND_ADDRESS")]
    pub health_bind_address: Option<String>,

    /// Enable leader election.
    #[arg(long, env = "LEADER_ELECTION")]
    pub leader_election: Option<bool>,

    /// Name of the leader-election lease.
    #[arg(long, env = "LEADER_ELECTION_ID")]
    pub leader_election_id: Option<String>,

    /// Namespace of the leader-election lease.
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    /// Informer resync period, e.g. "10m".
    #[arg(long, env = "SYNC_PERIOD")]
    pub sync_period: Option<String>,

    /// Log level: debug, info, warn or error.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: json or console.
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Name of the Secret holding VPSie credentials.
    #[arg(long, env = "VPSIE_SECRET_NAME")]
    pub vpsie_secret_name: Option<String>,

    /// Namespace of the credentials Secret.
    #[arg(long, env = "VPSIE_SECRET_NAMESPACE")]
    pub vpsie_secret_namespace: Option<String>,

    /// Cloud API requests per minute.
    #[arg(long, env = "RATE_LIMIT_RPM")]
    pub rate_limit_rpm: Option<u32>,

    /// Cloud API request timeout, e.g. "30s".
    #[arg(long, env = "VPSIE_TIMEOUT")]
    pub vpsie_timeout: Option<String>,

    /// CPU percentage below which a node counts as underutilized.
    #[arg(long, env = "SCALE_CPU_THRESHOLD")]
    pub scale_cpu_threshold: Option<f64>,

    /// Memory percentage below which a node counts as underutilized.
    #[arg(long, env = "SCALE_MEMORY_THRESHOLD")]
    pub scale_memory_threshold: Option<f64>,

    /// Duration underutilization must persist before a scale-down.
    #[arg(long, env = "OBSERVATION_WINDOW")]
    pub observation_window: Option<String>,

    /// Minimum interval between scale-downs per group.
    #[arg(long, env = "COOLDOWN_PERIOD")]
    pub cooldown_period: Option<String>,

    /// Cap on nodes removed per scale-down pass.
    #[arg(long, env = "MAX_NODES_PER_SCALE_DOWN")]
    pub max_nodes_per_scale_down: Option<usize>,

    /// Overall drain deadline per node.
    #[arg(long, env = "DRAIN_TIMEOUT")]
    pub drain_timeout: Option<String>,

    /// Grace period handed to pod evictions.
    #[arg(long, env = "EVICTION_GRACE_PERIOD")]
    pub eviction_grace_period: Option<String>,

    /// Enable the cost rebalancer.
    #[arg(long, env = "REBALANCING_ENABLED")]
    pub rebalancing_enabled: Option<bool>,

    /// Rebalancing strategy: rolling, surge or blue-green.
    #[arg(long, env = "REBALANCING_STRATEGY")]
    pub rebalancing_strategy: Option<String>,

    /// Nodes migrated per rebalancing batch.
    #[arg(long, env = "REBALANCING_BATCH_SIZE")]
    pub rebalancing_batch_size: Option<usize>,

    /// Deadline per rebalancing batch.
    #[arg(long, env = "REBALANCING_TIMEOUT")]
    pub rebalancing_timeout: Option<String>,

    /// Minimum interval between rebalances of the same group.
    #[arg(long, env = "REBALANCING_COOLDOWN")]
    pub rebalancing_cooldown: Option<String>,
}

/// The YAML config file mirror of [`Cli`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub metrics_bind_address: Option<String>,
    pub health_bind_address: Option<String>,
    pub leader_election: Option<bool>,
    pub leader_election_id: Option<String>,
    pub leader_election_namespace: Option<String>,
    pub sync_period: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub vpsie_secret_name: Option<String>,
    pub vpsie_secret_namespace: Option<String>,
    pub rate_limit_rpm: Option<u32>,
    pub vpsie_timeout: Option<String>,
    pub scale_cpu_threshold: Option<f64>,
    pub scale_memory_threshold: Option<f64>,
    pub observation_window: Option<String>,
    pub cooldown_period: Option<String>,
    pub max_nodes_per_scale_down: Option<usize>,
    pub drain_timeout: Option<String>,
    pub eviction_grace_period: Option<String>,
    pub rebalancing_enabled: Option<bool>,
    pub rebalancing_strategy: Option<String>,
    pub rebalancing_batch_size: Option<usize>,
    pub rebalancing_timeout: Option<String>,
    pub rebalancing_cooldown: Option<String>,
}

/// Output log format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Console,
}

/// Fully resolved configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub metrics_bind_address: SocketAddr,
    pub health_bind_address: SocketAddr,
    pub leader_election: bool,
    pub leader_election_id: String,
    pub leader_election_namespace: String,
    pub sync_period: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
    pub vpsie_secret_name: String,
    pub vpsie_secret_namespace: String,
    pub rate_limit_rpm: u32,
    pub vpsie_timeout: Duration,
    pub scale_cpu_threshold: f64,
    pub scale_memory_threshold: f64,
    pub observation_window: Duration,
    pub cooldown_period: Duration,
    pub max_nodes_per_scale_down: usize,
    pub drain_timeout: Duration,
    pub eviction_grace_period: Duration,
    pub rebalancing_enabled: bool,
    pub rebalancing_strategy: Strategy,
    pub rebalancing_batch_size: usize,
    pub rebalancing_timeout: Duration,
    pub rebalancing_cooldown: Duration,
}

fn parse_duration_opt(value: Option<String>, default: Duration, what: &str) -> Result<Duration, Error> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration::parse(&raw)
            .map_err(|e| Error::UserInputError(format!("invalid {}: {}", what, e))),
    }
}

fn parse_addr(value: Option<String>, default: &str, what: &str) -> Result<SocketAddr, Error> {
    value
        .unwrap_or_else(|| default.to_owned())
        .parse()
        .map_err(|e| Error::UserInputError(format!("invalid {}: {}", what, e)))
}

impl Config {
    /// Resolves flags (which clap already backed with environment
    /// variables), the optional config file, and built-in defaults, in
    /// that order.
    pub fn resolve(cli: Cli) -> Result<Config, Error> {
        let file: FileConfig = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::UserInputError(format!("reading config file {}: {}", path.display(), e))
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    Error::UserInputError(format!("parsing config file {}: {}", path.display(), e))
                })?
            }
            None => FileConfig::default(),
        };

        let config = Config {
            metrics_bind_address: parse_addr(
                cli.metrics_bind_address.or(file.metrics_bind_address),
                "0.0.0.0:8080",
                "metrics-bind-address",
            )?,
            health_bind_address: parse_addr(
                cli.health_bind_address.or(file.health_bind_address),
                "0.0.0.0:8081",
                "health-bind-address",
            )?,
            leader_election: cli.leader_election.or(file.leader_election).unwrap_or(true),
            leader_election_id: cli
                .leader_election_id
                .or(file.leader_election_id)
                .unwrap_or_else(|| "vpsie-autoscaler-leader".to_owned()),
            leader_election_namespace: cli
                .leader_election_namespace
                .or(file.leader_election_namespace)
                .unwrap_or_else(|| "kube-system".to_owned()),
            sync_period: parse_duration_opt(
                cli.sync_period.or(file.sync_period),
                Duration::from_secs(600),
                "sync-period",
            )?,
            log_level: cli
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_owned()),
            log_format: match cli
                .log_format
                .or(file.log_format)
                .unwrap_or_else(|| "console".to_owned())
                .as_str()
            {
                "json" => LogFormat::Json,
                "console" => LogFormat::Console,
                other => {
                    return Err(Error::UserInputError(format!(
                        "invalid log-format {:?}, expected json or console",
                        other
                    )))
                }
            },
            vpsie_secret_name: cli
                .vpsie_secret_name
                .or(file.vpsie_secret_name)
                .unwrap_or_else(|| "vpsie-secret".to_owned()),
            vpsie_secret_namespace: cli
                .vpsie_secret_namespace
                .or(file.vpsie_secret_namespace)
                .unwrap_or_else(|| "kube-system".to_owned()),
            rate_limit_rpm: cli.rate_limit_rpm.or(file.rate_limit_rpm).unwrap_or(120),
            vpsie_timeout: parse_duration_opt(
                cli.vpsie_timeout.or(file.vpsie_timeout),
                Duration::from_secs(30),
                "vpsie-timeout",
            )?,
            scale_cpu_threshold: cli
                .scale_cpu_threshold
                .or(file.scale_cpu_threshold)
                .unwrap_or(20.0),
            scale_memory_threshold: cli
                .scale_memory_threshold
                .or(file.scale_memory_threshold)
                .unwrap_or(20.0),
            observation_window: parse_duration_opt(
                cli.observation_window.or(file.observation_window),
                Duration::from_secs(600),
                "observation-window",
            )?,
            cooldown_period: parse_duration_opt(
                cli.cooldown_period.or(file.cooldown_period),
                Duration::from_secs(600),
                "cooldown-period",
            )?,
            max_nodes_per_scale_down: cli
                .max_nodes_per_scale_down
                .or(file.max_nodes_per_scale_down)
                .unwrap_or(1),
            drain_timeout: parse_duration_opt(
                cli.drain_timeout.or(file.drain_timeout),
                Duration::from_secs(300),
                "drain-timeout",
            )?,
            eviction_grace_period: parse_duration_opt(
                cli.eviction_grace_period.or(file.eviction_grace_period),
                Duration::from_secs(30),
                "eviction-grace-period",
            )?,
            rebalancing_enabled: cli
                .rebalancing_enabled
                .or(file.rebalancing_enabled)
                .unwrap_or(false),
            rebalancing_strategy: cli
                .rebalancing_strategy
                .or(file.rebalancing_strategy)
                .unwrap_or_else(|| "rolling".to_owned())
                .parse()
                .map_err(Error::UserInputError)?,
            rebalancing_batch_size: cli
                .rebalancing_batch_size
                .or(file.rebalancing_batch_size)
                .unwrap_or(2),
            rebalancing_timeout: parse_duration_opt(
                cli.rebalancing_timeout.or(file.rebalancing_timeout),
                Duration::from_secs(1200),
                "rebalancing-timeout",
            )?,
            rebalancing_cooldown: parse_duration_opt(
                cli.rebalancing_cooldown.or(file.rebalancing_cooldown),
                Duration::from_secs(3600),
                "rebalancing-cooldown",
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("scale-cpu-threshold", self.scale_cpu_threshold),
            ("scale-memory-threshold", self.scale_memory_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::UserInputError(format!(
                    "{} must be a percentage, got {}",
                    name, value
                )));
            }
        }
        if self.rate_limit_rpm == 0 {
            return Err(Error::UserInputError(
                "rate-limit-rpm must be positive".to_owned(),
            ));
        }
        if self.rebalancing_batch_size == 0 {
            return Err(Error::UserInputError(
                "rebalancing-batch-size must be positive".to_owned(),
            ));
        }
        if self.max_nodes_per_scale_down == 0 {
            return Err(Error::UserInputError(
                "max-nodes-per-scale-down must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_input() {
        let config = Config::resolve(Cli::default()).unwrap();
        assert_eq!(config.rate_limit_rpm, 120);
        assert_eq!(config.vpsie_secret_name, "vpsie-secret");
        assert_eq!(config.observation_window, Duration::from_secs(600));
        assert_eq!(config.log_format, LogFormat::Console);
        assert!(config.leader_election);
        assert!(!config.rebalancing_enabled);
        assert_eq!(config.rebalancing_strategy, Strategy::Rolling);
    }

    #[test]
    fn flags_override_everything() {
        let cli = Cli::parse_from([
            "vpsie-autoscaler",
            "--rate-limit-rpm",
            "42",
            "--log-format",
            "json",
            "--observation-window",
            "5m",
            "--rebalancing-strategy",
            "surge",
        ]);
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.rate_limit_rpm, 42);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.observation_window, Duration::from_secs(300));
        assert_eq!(config.rebalancing_strategy, Strategy::Surge);
    }

    #[test]
    fn file_fills_what_flags_leave_unset() {
        let dir = std::env::temp_dir().join("vpsie-autoscaler-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            "rate-limit-rpm: 33\nscale-cpu-threshold: 30.0\n",
        )
        .unwrap();
        let cli = Cli {
            config: Some(path),
            scale_cpu_threshold: Some(55.0),
            ..Default::default()
        };
        let config = Config::resolve(cli).unwrap();
        // The flag wins, the file fills the gap.
        assert!((config.scale_cpu_threshold - 55.0).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit_rpm, 33);
    }

    #[test]
    fn nonsense_is_fatal() {
        let cli = Cli {
            scale_cpu_threshold: Some(250.0),
            ..Default::default()
        };
        assert!(Config::resolve(cli).is_err());

        let cli = Cli {
            log_format: Some("xml".to_owned()),
            ..Default::default()
        };
        assert!(Config::resolve(cli).is_err());

        let cli = Cli {
            drain_timeout: Some("not-a-duration".to_owned()),
            ..Default::default()
        };
        assert!(Config::resolve(cli).is_err());
    }
}
