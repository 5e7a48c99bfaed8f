//! Demo replication daemon: serves the AppendLog RPC on the listen
//! address and drives the write paths from stdin. On the leader every
//! line becomes a replicated entry; on the follower the line `takeover`
//! promotes this node. `status` prints the offsets as JSON on either
//! role.

#[macro_use]
extern crate replog;

use std::io::{self, BufRead, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use replog::log::{LogError, LogInfo};
use replog::{serve_append_log, NodeConfig, ReplicatedLog, Role, TcpReplicaClient};

#[derive(StructOpt)]
#[structopt(name = "replog", about = "Two-node log replication demo daemon")]
struct ReplogOptions {
    /// JSON config file; overrides the individual flags below.
    #[structopt(long)]
    config: Option<PathBuf>,

    /// Comma separated two-node address list, e.g. "a:8828,b:8828".
    #[structopt(long, default_value = "127.0.0.1:8828,127.0.0.1:8829")]
    nodes: String,

    /// This node's own address; must appear in --nodes.
    #[structopt(long, default_value = "127.0.0.1:8828")]
    listen: String,

    /// Initial role: leader|follower (master|slave also accepted).
    #[structopt(long, default_value = "leader")]
    role: String,

    /// Directory for the entry log and applied checkpoint.
    #[structopt(long, default_value = "replog-data")]
    data_dir: PathBuf,

    /// Timeout for each synchronous append, in milliseconds.
    #[structopt(long, default_value = "1000")]
    sync_timeout_ms: u64,

    /// sync_data after every append.
    #[structopt(long)]
    fsync: bool,
}

fn build_config(options: &ReplogOptions) -> replog::Result<NodeConfig> {
    if let Some(path) = &options.config {
        return NodeConfig::from_file(path);
    }
    let nodes = options
        .nodes
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();
    let role = Role::parse(&options.role)?;
    let mut config = NodeConfig::new(nodes, options.listen.clone(), role, options.data_dir.clone());
    config.fsync_on_append = options.fsync;
    config.validate()?;
    Ok(config)
}

fn main() {
    let options = ReplogOptions::from_args();
    let config = match build_config(&options) {
        Ok(c) => c,
        Err(e) => fatal!("bad configuration: {}", e),
    };
    let sync_timeout = Duration::from_millis(options.sync_timeout_ms);

    let peer = config.peer().expect("validated above").to_owned();
    let client = Box::new(TcpReplicaClient::new(&peer, config.rpc_timeout()));
    let core = match ReplicatedLog::new(config.clone(), client) {
        Ok(c) => c,
        Err(e) => fatal!("bad configuration: {}", e),
    };

    // The state machine here just narrates what it is fed.
    core.register_callback(Box::new(|entry: &[u8]| {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "apply: {}", String::from_utf8_lossy(entry));
    }));

    if let Err(e) = core.init() {
        fatal!("init failed: {}", e);
    }

    let listener = match TcpListener::bind(&config.listen) {
        Ok(l) => l,
        Err(e) => fatal!("cannot listen on {}: {}", config.listen, e),
    };
    log!(LogInfo, "serving AppendLog on {}", config.listen);
    {
        let core = Arc::clone(&core);
        thread::spawn(move || serve_append_log(listener, core));
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log!(LogError, "stdin read failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "status" => {
                let status = core.status();
                println!("{}", serde_json::to_string(&status).unwrap());
            }
            "takeover" if !core.is_leader() => {
                core.switch_to_leader();
            }
            _ if core.is_leader() => {
                core.log_sync(line.as_bytes(), sync_timeout);
            }
            _ => {
                log!(LogInfo, "follower ignores input; type `takeover` or `status`");
            }
        }
    }

    core.shutdown();
}
