use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::{
    broker::BrokerOptions,
    registry::{ClusterDescriptor, ClusterRegistry},
};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Log cluster actions instead of performing them.
    DryRun,
    /// Forward cluster actions to the control plane.
    Production,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Production => "production",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gslauncher",
    about = "Start and stop game server clusters and stream their state",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the control panel HTTP API (default).
    Run,

    /// Print the configured cluster registry and exit.
    Clusters,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "GSL_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:9443"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "GSL_MODE",
        value_name = "MODE",
        default_value = "dry-run",
        value_enum
    )]
    pub mode: DispatchMode,

    /// NAME=RESOURCE_ID[@DOMAIN]; repeatable.
    #[arg(
        long = "cluster",
        global = true,
        env = "GSL_CLUSTERS",
        value_name = "NAME=RESOURCE_ID",
        value_delimiter = ','
    )]
    pub clusters: Vec<ClusterDescriptor>,

    #[arg(
        long = "clusters-file",
        global = true,
        env = "GSL_CLUSTERS_FILE",
        value_name = "PATH"
    )]
    pub clusters_file: Option<PathBuf>,

    #[arg(
        long = "control-api-base-url",
        global = true,
        env = "GSL_CONTROL_API_BASE_URL",
        value_name = "URL"
    )]
    pub control_api_base_url: Option<String>,

    #[arg(
        long = "control-api-token",
        global = true,
        env = "GSL_CONTROL_API_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub control_api_token: Option<String>,

    /// Exact origins allowed by CORS. Empty means any origin.
    #[arg(
        long = "allowed-origin",
        global = true,
        env = "GSL_ALLOWED_ORIGINS",
        value_name = "ORIGIN",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    #[arg(
        long = "subscriber-buffer",
        global = true,
        env = "GSL_SUBSCRIBER_BUFFER",
        value_name = "N",
        default_value_t = 64,
        value_parser = clap::value_parser!(u64).range(1..=4096)
    )]
    pub subscriber_buffer: u64,

    #[arg(
        long = "publish-queue",
        global = true,
        env = "GSL_PUBLISH_QUEUE",
        value_name = "N",
        default_value_t = 256,
        value_parser = clap::value_parser!(u64).range(1..=65536)
    )]
    pub publish_queue: u64,

    #[arg(
        long = "sse-keepalive-secs",
        global = true,
        env = "GSL_SSE_KEEPALIVE_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub sse_keepalive_secs: u64,
}

impl Config {
    pub fn load_registry(&self) -> anyhow::Result<ClusterRegistry> {
        ClusterRegistry::load(self.clusters_file.as_deref(), self.clusters.iter().cloned())
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            ingress_capacity: self.publish_queue as usize,
            subscriber_capacity: self.subscriber_buffer as usize,
        }
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["gslauncher"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.bind, "0.0.0.0:9443".parse().unwrap());
        assert_eq!(cli.config.mode, DispatchMode::DryRun);
        assert!(cli.config.clusters.is_empty());
        assert!(cli.config.clusters_file.is_none());
        assert!(cli.config.allowed_origins.is_empty());
        assert_eq!(cli.config.subscriber_buffer, 64);
        assert_eq!(cli.config.publish_queue, 256);
        assert_eq!(cli.config.sse_keepalive(), Duration::from_secs(10));
    }

    #[test]
    fn parses_repeated_and_delimited_clusters() {
        let cli = Cli::try_parse_from([
            "gslauncher",
            "--cluster",
            "arma=asg-arma,mumble=asg-mumble@voice.example.com",
            "--cluster",
            "valheim=asg-valheim",
        ])
        .unwrap();
        let names: Vec<_> = cli.config.clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["arma", "mumble", "valheim"]);

        let registry = cli.config.load_registry().unwrap();
        assert_eq!(
            registry.get("mumble").unwrap().domain.as_deref(),
            Some("voice.example.com")
        );
    }

    #[test]
    fn rejects_malformed_cluster() {
        let err = Cli::try_parse_from(["gslauncher", "--cluster", "arma"]).unwrap_err();
        assert!(err.to_string().contains("NAME=RESOURCE_ID"));
    }

    #[test]
    fn parses_production_mode() {
        let cli = Cli::try_parse_from(["gslauncher", "--mode", "production"]).unwrap();
        assert_eq!(cli.config.mode, DispatchMode::Production);
        assert_eq!(cli.config.mode.as_str(), "production");
    }

    #[test]
    fn rejects_invalid_subscriber_buffer() {
        let err = Cli::try_parse_from(["gslauncher", "--subscriber-buffer", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--subscriber-buffer"));
        assert!(msg.contains("1..=4096"));
    }

    #[test]
    fn rejects_invalid_sse_keepalive_secs() {
        let err = Cli::try_parse_from(["gslauncher", "--sse-keepalive-secs", "301"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--sse-keepalive-secs"));
        assert!(msg.contains("1..=300"));
    }

    #[test]
    fn broker_options_follow_flags() {
        let cli = Cli::try_parse_from([
            "gslauncher",
            "--subscriber-buffer",
            "8",
            "--publish-queue",
            "16",
        ])
        .unwrap();
        let opts = cli.config.broker_options();
        assert_eq!(opts.subscriber_capacity, 8);
        assert_eq!(opts.ingress_capacity, 16);
    }
}
