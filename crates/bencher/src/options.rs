use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;

use crate::{address::ServerAddr, workload::DEFAULT_SENTINEL};

/// Benchmark a RESP server by flooding it with pipelined commands.
///
/// Trailing arguments are taken as a literal command to benchmark instead of
/// the default suite.
#[derive(Parser, Debug, Clone)]
#[clap(name = "bencher", disable_help_flag = true)]
pub struct Options {
    /// Server hostname.
    #[clap(short = 'h', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port.
    #[clap(short = 'p', long, default_value = "6379")]
    pub port: u16,

    /// Server UNIX socket path (overrides host and port).
    #[clap(short = 's', long)]
    pub socket: Option<PathBuf>,

    /// Number of parallel connections.
    #[clap(short = 'c', long, default_value = "50")]
    pub clients: usize,

    /// Total number of requests.
    #[clap(short = 'n', long, default_value = "100000")]
    pub requests: usize,

    /// 1 = reuse connections, 0 = reconnect after every round.
    #[clap(short = 'k', long, default_value = "1")]
    pub keepalive: i64,

    /// Data size of SET/GET values in bytes.
    #[clap(short = 'd', long, default_value = "3")]
    pub datasize: usize,

    /// Pipeline depth: commands written back to back before awaiting replies.
    #[clap(short = 'P', long, default_value = "1")]
    pub pipeline: usize,

    /// Use random keys, padding each sentinel with this many random characters.
    #[clap(short = 'r', long, allow_negative_numbers = true)]
    pub random_keys: Option<i64>,

    /// Quiet. Just show query/sec values.
    #[clap(short = 'q', long)]
    pub quiet: bool,

    /// Output in CSV format.
    #[clap(long)]
    pub csv: bool,

    /// Loop. Run the selected benchmarks forever.
    #[clap(short = 'l', long = "loop")]
    pub loop_forever: bool,

    /// Idle mode. Just open the connections and wait.
    #[clap(short = 'I', long)]
    pub idle: bool,

    /// If the server replies with errors, show them (at most one per second).
    #[clap(short = 'e', long)]
    pub show_errors: bool,

    /// Value of INCRBY/HINCRBY.
    #[clap(short = 'v', long, default_value = "1", allow_negative_numbers = true)]
    pub inc_value: i64,

    /// Max latency in milliseconds for the outlier count.
    #[clap(short = 'm', long, default_value = "10")]
    pub max_latency: u64,

    /// Only run the comma separated list of benchmarks.
    #[clap(short = 't', long, value_delimiter = ',')]
    pub tests: Option<Vec<String>>,

    /// SELECT this database number before benchmarking.
    #[clap(long, default_value = "0", allow_negative_numbers = true)]
    pub dbnum: i64,

    /// Sentinel marking the key positions to randomize.
    #[clap(long = "kp", default_value = DEFAULT_SENTINEL)]
    pub key_prefix: String,

    /// Number of sub fields for ZADD/HMSET/HMGET.
    #[clap(long = "sk", default_value = "10")]
    pub subkeys: usize,

    /// Write one CSV row per recorded latency sample to this file.
    #[clap(short = 'o', long)]
    pub out_file: Option<PathBuf>,

    /// Print help.
    #[clap(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,

    /// Literal command to benchmark instead of the default suite.
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Immutable run configuration derived from the command line. Handed to the
/// engine behind an `Rc` so nothing benchmark-related is process-global.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub addr: ServerAddr,
    pub numclients: usize,
    pub requests: usize,
    pub keepalive: bool,
    pub datasize: usize,
    pub pipeline: usize,
    pub randomkeys: bool,
    pub keyspacelen: usize,
    pub quiet: bool,
    pub csv: bool,
    pub idle: bool,
    pub show_errors: bool,
    pub inc_value: i64,
    pub max_latency_ms: u64,
    pub dbnum: i64,
    pub sentinel: String,
    pub subkeys: usize,
}

impl Options {
    /// Validate and freeze the command line into the engine configuration.
    pub fn config(&self) -> anyhow::Result<BenchConfig> {
        if self.key_prefix.is_empty() {
            bail!("--kp requires a non-empty key prefix");
        }
        let addr = match &self.socket {
            Some(path) => ServerAddr::Unix(path.clone()),
            None => ServerAddr::Tcp {
                host: self.host.clone(),
                port: self.port,
            },
        };
        Ok(BenchConfig {
            addr,
            numclients: self.clients,
            requests: self.requests,
            keepalive: self.keepalive != 0,
            datasize: self.datasize.clamp(1, 1 << 30),
            pipeline: self.pipeline.max(1),
            randomkeys: self.random_keys.is_some(),
            keyspacelen: self.random_keys.map_or(0, |n| n.max(0) as usize),
            quiet: self.quiet,
            csv: self.csv,
            idle: self.idle,
            show_errors: self.show_errors,
            inc_value: self.inc_value,
            max_latency_ms: self.max_latency,
            dbnum: self.dbnum,
            sentinel: self.key_prefix.clone(),
            subkeys: if self.subkeys < 1 { 10 } else { self.subkeys },
        })
    }
}
