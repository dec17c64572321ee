//! process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "pollkeeper-worker";
    /// the default path to the node config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/pollkeeper/node.yaml";
    /// default log level. Can use this argument or POLLKEEPER_LOG env var
    pub const DEFAULT_POLLKEEPER_LOG: &str = "info";
    /// default upper bound on graceful shutdown, in seconds
    pub const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 10;

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "pollkeeper", bin_name = "pollkeeper", about, long_about = None)]
    /// parses from cli & environment var. pollkeeper will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the node config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the reporting api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// number of tokio worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// name of this node, overrides `node_name` from the config file
        #[clap(long, env, value_parser)]
        pub node_name: Option<String>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_POLLKEEPER_LOG)]
        pub pollkeeper_log: String,
        /// seconds to wait for leases to be released on shutdown
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT)]
        pub shutdown_timeout: u64,
    }

    impl Config {
        /// Shutdown timeout as `Duration`
        pub fn shutdown_timeout(&self) -> Duration {
            Duration::from_secs(self.shutdown_timeout)
        }

        /// Node name from the cli, ignoring blank values
        pub fn node_name(&self) -> Option<&str> {
            self.node_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let cfg = Config::parse_from(["pollkeeper"]);
            assert_eq!(cfg.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
            assert_eq!(cfg.external_api.port(), 3333);
            assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(10));
            assert_eq!(cfg.node_name(), None);
        }

        #[test]
        fn test_blank_node_name_is_ignored() {
            let cfg = Config::parse_from(["pollkeeper", "--node-name", "  "]);
            assert_eq!(cfg.node_name(), None);
            let cfg = Config::parse_from(["pollkeeper", "--node-name", "api-1"]);
            assert_eq!(cfg.node_name(), Some("api-1"));
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for logging
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. The level comes from POLLKEEPER_LOG
        /// (or `--pollkeeper-log`), the format from LOG_FORMAT.
        pub fn parse(pollkeeper_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(pollkeeper_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("async_nats=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
