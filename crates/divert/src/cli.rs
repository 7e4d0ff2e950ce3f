use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser)]
#[command(
    name = "divert",
    about = "Transparently proxy redirected TCP connections through HTTP CONNECT upstreams"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Address and port to listen on (e.g. 0.0.0.0:3128)
    #[arg(short, long, value_name = "ADDR:PORT")]
    pub listen: Option<String>,

    /// Upstream CONNECT proxy in failover order (repeatable or
    /// comma-separated; user:password@host:port to authenticate)
    #[arg(short = 'p', long = "proxy", value_name = "SPEC", value_delimiter = ',')]
    pub proxies: Vec<String>,

    /// Destination IP or CIDR block to reach directly, bypassing upstreams
    /// (repeatable or comma-separated)
    #[arg(short = 'd', long = "direct", value_name = "IP|CIDR", value_delimiter = ',')]
    pub directs: Vec<String>,

    /// Maximum number of pooled connections before random eviction
    #[arg(short = 'M', long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Relay upstream HTTP redirect responses to clients
    #[arg(short = 'r', long)]
    pub relay_redirects: bool,

    /// Reverse-resolve destination IPs and use the hostname in CONNECT
    #[arg(short = 'R', long)]
    pub reverse_lookups: bool,

    /// Parse TLS ClientHello SNI and use the server name in CONNECT
    #[arg(short = 'S', long)]
    pub sni: bool,

    /// Skip the startup reachability probe of upstream proxies
    #[arg(short = 's', long)]
    pub skip_healthcheck: bool,

    /// Path to a TOML configuration file (default: /etc/divert.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
