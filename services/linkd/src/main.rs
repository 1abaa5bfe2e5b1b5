//! linkmq link daemon - run one side of a link or inspect a running one
//!
//! Usage:
//!   linkd send --config config/send.toml --msg-type 7 < messages.txt
//!   linkd recv --config config/recv.toml
//!   linkd query --socket /tmp/linkmq/linkmq-recv.rsvr.0.usck --what recv

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use linkmq_codec::TYPE_MAX;
use linkmq_config::{RecvConfig, SendConfig};
use linkmq_network::{query, Command, RecvDaemon, SendDaemon, TransportError};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Lines read ahead of submission
const STDIN_BACKLOG: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "linkd")]
#[command(about = "linkmq link daemon")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Connect to a receiver and submit one message per stdin line
    Send {
        /// Path to the send configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Application message type stamped on every line
        #[arg(short = 't', long, default_value_t = 1)]
        msg_type: u16,
    },
    /// Accept sender links and log every message received
    Recv {
        /// Path to the receive configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Ask a running thread for its configuration or counters
    Query {
        /// Command socket of the thread to ask
        #[arg(short, long)]
        socket: PathBuf,

        #[arg(short, long, value_enum, default_value_t = QueryKind::Recv)]
        what: QueryKind,

        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum QueryKind {
    /// Static configuration (any long-running thread)
    Conf,
    /// Link counters (sender sessions, receive servers)
    Recv,
    /// Handler counters (workers)
    Proc,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    match args.mode {
        Mode::Send { config, msg_type } => run_send(&config, msg_type),
        Mode::Recv { config } => run_recv(&config),
        Mode::Query {
            socket,
            what,
            timeout_ms,
        } => run_query(socket, what, Duration::from_millis(timeout_ms)),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn setup_signal_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(running)
}

/// Forward lines from `input` on a reader thread
///
/// At most `backlog` lines wait in the channel, so a fast producer cannot run
/// ahead of the send queues. The channel disconnects at end of input.
fn spawn_line_reader<R>(input: R, backlog: usize) -> Result<Receiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = bounded::<String>(backlog);
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn input reader")?;
    Ok(rx)
}

fn run_send(config_path: &Path, msg_type: u16) -> Result<()> {
    if msg_type >= TYPE_MAX {
        bail!("--msg-type must be below {}", TYPE_MAX);
    }
    let config = SendConfig::load(config_path).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;

    let running = setup_signal_handler()?;
    let mut daemon = SendDaemon::new(config)?;
    daemon.start()?;

    // Stdin blocks, so lines arrive over a channel and Ctrl-C stays responsive
    let rx = spawn_line_reader(BufReader::new(std::io::stdin()), STDIN_BACKLOG)?;

    let mut submitted = 0u64;
    let mut dropped = 0u64;
    let mut input_open = true;
    while running.load(Ordering::SeqCst) {
        if !input_open {
            thread::sleep(Duration::from_millis(200));
            continue;
        }
        let line = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!(submitted, dropped, "Input closed, Ctrl-C to stop");
                input_open = false;
                continue;
            }
        };

        // Queue-full is backpressure: wait for the sessions to drain
        loop {
            match daemon.submit(msg_type, line.clone().into_bytes()) {
                Ok(()) => {
                    submitted += 1;
                    break;
                }
                Err(TransportError::ResourceExhausted { resource, .. })
                    if resource == "queue capacity" && running.load(Ordering::SeqCst) =>
                {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    dropped += 1;
                    warn!(error = %e, "Message dropped");
                    break;
                }
            }
        }
    }

    info!("Received shutdown signal");
    let stats = daemon.link_stats();
    daemon.shutdown();
    info!(
        submitted,
        dropped,
        sent = stats.send_total,
        reconnects = stats.reconnects,
        "Send daemon stopped"
    );
    Ok(())
}

fn run_recv(config_path: &Path) -> Result<()> {
    let config = RecvConfig::load(config_path).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        e
    })?;

    let running = setup_signal_handler()?;
    let mut daemon = RecvDaemon::new(config)?;
    daemon.register_default(|msg_type: u16, node_id: u32, payload: &[u8]| {
        info!(
            msg_type,
            node_id,
            len = payload.len(),
            "{}",
            String::from_utf8_lossy(payload)
        );
        Ok(())
    })?;
    daemon.start()?;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Received shutdown signal");
    let links = daemon.link_stats();
    let procs = daemon.proc_stats();
    let open = daemon.connection_count();
    daemon.shutdown();
    info!(
        connections = open,
        received = links.recv_total,
        dropped = links.drop_total + procs.drop_total,
        errors = links.err_total + procs.err_total,
        processed = procs.proc_total,
        "Receive daemon stopped"
    );
    Ok(())
}

fn run_query(socket: PathBuf, what: QueryKind, timeout: Duration) -> Result<()> {
    let reply = query(&socket, timeout, |reply_to| match what {
        QueryKind::Conf => Command::QueryConf { reply_to },
        QueryKind::Recv => Command::QueryRecvStat { reply_to },
        QueryKind::Proc => Command::QueryProcStat { reply_to },
    })
    .with_context(|| format!("Query to {:?} failed", socket))?;

    match reply {
        Command::ConfReply(conf) => println!("{:#?}", conf),
        Command::RecvStatReply(stats) => println!("{:#?}", stats),
        Command::ProcStatReply(stats) => println!("{:#?}", stats),
        other => bail!("Unexpected reply {:?}", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_line_reader_is_bounded_and_ordered() {
        let input = Cursor::new(b"one\ntwo\nthree\nfour\n".to_vec());
        let rx = spawn_line_reader(input, 2).unwrap();
        assert_eq!(rx.capacity(), Some(2));

        // The reader stalls on the full channel until lines are taken
        let start = std::time::Instant::now();
        while rx.len() < 2 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.len(), 2);

        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines, ["one", "two", "three", "four"]);
    }
}
