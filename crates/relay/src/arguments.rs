use {
    alloy::primitives::Address,
    num::BigRational,
    std::{
        fmt::{self, Display, Formatter},
        net::SocketAddr,
        path::PathBuf,
        time::Duration,
    },
    tracing::Level,
    url::Url,
};

#[derive(clap::Parser)]
pub struct Arguments {
    #[clap(long, env, default_value = "warn,relay=debug,observe=info")]
    pub log_filter: String,

    /// Log events at or above this level also go to stderr.
    #[clap(long, env)]
    pub log_stderr_threshold: Option<Level>,

    #[clap(long, env, default_value = "false")]
    pub use_json_logs: bool,

    #[clap(long, env, default_value = "0.0.0.0:9586")]
    pub metrics_address: SocketAddr,

    /// Url of the Postgres database. Orders are kept in memory if unset.
    #[clap(long, env)]
    pub db_url: Option<Url>,

    /// The Ethereum node URL to connect to.
    #[clap(long, env, default_value = "http://localhost:8545")]
    pub node_url: Url,

    /// Newline delimited JSON events. `-` reads from stdin.
    #[clap(long, env, default_value = "-")]
    pub event_source: PathBuf,

    /// Events of one kind that can be buffered before the source waits.
    #[clap(long, env, default_value = "1024")]
    pub event_queue_size: usize,

    /// Exchange contracts whose order events are applied. Accepts all if
    /// empty.
    #[clap(long, env, use_value_delimiter = true)]
    pub protocol: Vec<Address>,

    /// Spender whose allowances get cached.
    #[clap(long, env)]
    pub delegate_address: Address,

    #[clap(long, env)]
    pub weth_address: Address,

    /// Tokens whose balances get cached when no token is requested.
    #[clap(long, env, use_value_delimiter = true)]
    pub supported_tokens: Vec<Address>,

    #[clap(
        long,
        env,
        default_value = "100d",
        value_parser = humantime::parse_duration,
    )]
    pub cache_duration: Duration,

    /// How many blocks dirty keys are kept for fork replays.
    #[clap(long, env, default_value = "500")]
    pub dirty_block_window: u64,

    /// Cutoff watermarks untouched for this long get evicted.
    #[clap(
        long,
        env,
        default_value = "1h",
        value_parser = humantime::parse_duration,
    )]
    pub cutoff_cache_ttl: Duration,

    #[clap(
        long,
        env,
        default_value = "1m",
        value_parser = humantime::parse_duration,
    )]
    pub cutoff_sweep_interval: Duration,

    /// Forks reorganizing more blocks than this stop the relay.
    #[clap(long, env, default_value = "64")]
    pub max_fork_depth: u64,

    /// Remaining amounts below this fraction of the original amount are
    /// dust.
    #[clap(
        long,
        env,
        default_value = "0.01",
        value_parser = number::conversions::big_rational_from_decimal_str,
    )]
    pub dust_threshold: BigRational,
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            log_filter,
            log_stderr_threshold,
            use_json_logs,
            metrics_address,
            db_url,
            node_url,
            event_source,
            event_queue_size,
            protocol,
            delegate_address,
            weth_address,
            supported_tokens,
            cache_duration,
            dirty_block_window,
            cutoff_cache_ttl,
            cutoff_sweep_interval,
            max_fork_depth,
            dust_threshold,
        } = self;

        writeln!(f, "log_filter: {log_filter}")?;
        writeln!(f, "log_stderr_threshold: {log_stderr_threshold:?}")?;
        writeln!(f, "use_json_logs: {use_json_logs}")?;
        writeln!(f, "metrics_address: {metrics_address}")?;
        writeln!(f, "db_url: {}", if db_url.is_some() { "SECRET" } else { "None" })?;
        writeln!(f, "node_url: {node_url}")?;
        writeln!(f, "event_source: {}", event_source.display())?;
        writeln!(f, "event_queue_size: {event_queue_size}")?;
        writeln!(f, "protocol: {protocol:?}")?;
        writeln!(f, "delegate_address: {delegate_address}")?;
        writeln!(f, "weth_address: {weth_address}")?;
        writeln!(f, "supported_tokens: {supported_tokens:?}")?;
        writeln!(f, "cache_duration: {cache_duration:?}")?;
        writeln!(f, "dirty_block_window: {dirty_block_window}")?;
        writeln!(f, "cutoff_cache_ttl: {cutoff_cache_ttl:?}")?;
        writeln!(f, "cutoff_sweep_interval: {cutoff_sweep_interval:?}")?;
        writeln!(f, "max_fork_depth: {max_fork_depth}")?;
        writeln!(f, "dust_threshold: {dust_threshold}")?;
        Ok(())
    }
}
