//! gateway configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:2001";
    /// Default bound on a single credential store call, in seconds
    pub const DEFAULT_STORE_TIMEOUT: u64 = 3;
    /// Default bound on a whole HTTP request, in seconds
    pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "lease-gateway-worker";
    /// default credentials db path
    pub const DEFAULT_DATABASE_URL: &str = "/var/lib/lease-gateway/credentials.db";
    /// default log level. Can use this argument or GATEWAY_LOG env var
    pub const DEFAULT_GATEWAY_LOG: &str = "info";

    use std::{io, net::SocketAddr, time::Duration};

    pub use clap::Parser;
    use clap::ValueEnum;
    use dns_lookup::{AddrInfoHints, getaddrinfo};
    use tracing::{debug, warn};

    /// Which credential store backend to run against
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StoreBackend {
        /// sqlite database at `database_url`
        Sqlite,
        /// process-local store, starts empty
        Memory,
    }

    /// Log output format
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        /// unstructured, one line per event
        Standard,
        /// one json object per event
        Json,
        /// multi-line, human readable
        Pretty,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "lease-gateway", bin_name = "lease-gateway", about, long_about = None)]
    /// parses from cli & environment var. lease-gateway will load `.env` in the
    /// same dir as the binary as well
    pub struct Config {
        /// the address the HTTP api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// credential store backend
        #[clap(long, env, value_enum, default_value_t = StoreBackend::Sqlite)]
        pub store: StoreBackend,
        /// Path to the database use "sqlite::memory:" for in mem db ex. "em.db"
        #[clap(long, env, value_parser, default_value = DEFAULT_DATABASE_URL)]
        pub database_url: String,
        /// fully qualified name of this replica, defaults to the host fqdn
        #[clap(long, env, value_parser)]
        pub replica_fqdn: Option<String>,
        /// seconds a single store call may take before it is abandoned
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STORE_TIMEOUT)]
        pub store_timeout: u64,
        /// seconds an HTTP request may take before the api answers 408
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT)]
        pub request_timeout: u64,
        /// treat credentials past their recorded not_after as not found
        #[clap(long, env)]
        pub enforce_validity_window: bool,
        /// services whose leases on this replica are flushed before serving
        #[clap(long, env, value_parser, value_delimiter = ',')]
        pub flush_on_start: Vec<String>,
        /// number of tokio worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_GATEWAY_LOG)]
        pub gateway_log: String,
        /// log output format
        #[clap(long, env, value_enum, default_value_t = LogFormat::Standard)]
        pub log_format: LogFormat,
    }

    impl Config {
        /// store timeout as `Duration`
        pub fn store_timeout(&self) -> Duration {
            Duration::from_secs(self.store_timeout)
        }

        /// request timeout as `Duration`
        pub fn request_timeout(&self) -> Duration {
            Duration::from_secs(self.request_timeout)
        }

        /// the configured fqdn, or this host's fully qualified name when none
        /// was given. Resolves through the system resolver, so call it off
        /// the async workers.
        pub fn replica_fqdn(&self) -> io::Result<String> {
            match &self.replica_fqdn {
                Some(fqdn) if !fqdn.is_empty() => Ok(fqdn.clone()),
                _ => local_fqdn(),
            }
        }
    }

    /// The OS host name, resolved to its canonical name when the resolver
    /// knows one.
    pub fn local_fqdn() -> io::Result<String> {
        let host = hostname::get()?.to_string_lossy().into_owned();
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "OS reported an empty host name",
            ));
        }
        Ok(resolve_fqdn(host, canonical_name))
    }

    /// falls back to `host` when `lookup` has no better answer
    fn resolve_fqdn(host: String, lookup: impl FnOnce(&str) -> Option<String>) -> String {
        match lookup(&host) {
            Some(fqdn) => fqdn,
            None => {
                warn!(%host, "no canonical name for host, using it as the replica fqdn");
                host
            }
        }
    }

    /// `getaddrinfo` with `AI_CANONNAME`
    fn canonical_name(host: &str) -> Option<String> {
        let hints = AddrInfoHints {
            flags: libc::AI_CANONNAME,
            ..AddrInfoHints::default()
        };
        match getaddrinfo(Some(host), None, Some(hints)) {
            Ok(addrs) => addrs
                .filter_map(Result::ok)
                .find_map(|info| info.canonname)
                .filter(|name| !name.is_empty()),
            Err(err) => {
                debug!(?err, %host, "canonical name lookup failed");
                None
            }
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

    use super::cli::LogFormat;

    /// Installed tracing configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// Install the global subscriber. `gateway_log` is an `EnvFilter`
        /// directive string, falling back to "info" if it doesn't parse.
        pub fn parse(gateway_log: &str, log_frmt: LogFormat) -> Result<Self> {
            let filter = EnvFilter::try_new(gateway_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
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
                LogFormat::Standard => {
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
