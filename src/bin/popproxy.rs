use anyhow::{Result, bail};
use clap::Parser;
use popproxy::{Config, ProxyServer, UserPass, users::MAX_USERS};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy with POP3 credential sniffing", long_about = None)]
struct Args {
    /// SOCKS5 listener address
    #[arg(short, long, default_value = "0.0.0.0:1080")]
    listen: String,

    /// Management listener address
    #[arg(short = 'L', long, default_value = "127.0.0.1:8080")]
    mgmt_listen: String,

    /// Proxy user as user:pass (repeatable)
    #[arg(short, long = "user", value_name = "USER:PASS")]
    users: Vec<UserPass>,

    /// Administrator as user:pass (repeatable); may also use the proxy
    #[arg(short, long = "admin", value_name = "USER:PASS")]
    admins: Vec<UserPass>,

    /// Disable POP3 credential sniffing at startup
    #[arg(short = 'N', long)]
    disable_dissector: bool,

    /// Accept clients without authentication even when users are configured
    #[arg(long)]
    no_auth: bool,

    /// Size of each per-connection buffer in bytes
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Longest single selector wait, in seconds
    #[arg(long, default_value_t = 10)]
    select_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    if args.users.len() + args.admins.len() > MAX_USERS {
        bail!("[ERR] at most {MAX_USERS} users and admins can be configured");
    }

    let config = Config {
        users: args.users,
        admins: args.admins,
        force_no_auth: args.no_auth,
        dissector_enabled: !args.disable_dissector,
        buffer_size: args.buffer_size,
        select_timeout: Duration::from_secs(args.select_timeout),
        ..Config::new(args.listen).with_mgmt_addr(args.mgmt_listen)
    };

    // Instantiate server
    let server = ProxyServer::bind(config)?;
    server.shutdown_on_ctrl_c();

    // Run it
    info!("Starting SOCKS5 proxy: {}", server.local_addr());
    server.run()
}
