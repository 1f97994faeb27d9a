use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dyad_flow::demo::Script;
use dyad_flow::diagnostics;
use dyad_flow::log::ConsoleSink;
use dyad_flow::request::{FileTransport, FixtureTransport, Payload, Transport};
use dyad_flow::runtime::Runtime;

/// Fetch a.json and b.json, add the payloads and show the sum.
#[derive(Parser, Debug)]
#[command(name = "dyad-flow", version, about)]
struct Cli {
    /// Directory the file transport serves a.json and b.json from
    #[arg(long, env = "DYAD_FLOW_ROOT", default_value = ".")]
    root: PathBuf,

    /// Answer requests from memory instead of the filesystem
    #[arg(long)]
    offline: bool,

    /// Offline payload for a.json (JSON, or a plain string)
    #[arg(long, default_value = "2", requires = "offline")]
    a: String,

    /// Offline payload for b.json (JSON, or a plain string)
    #[arg(long, default_value = "3", requires = "offline")]
    b: String,

    /// Offline response delay in milliseconds
    #[arg(long, default_value_t = 0, requires = "offline")]
    latency_ms: u64,

    /// Make the offline b.json request fail with a network error
    #[arg(long, requires = "offline")]
    fail_b: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_payload(raw: &str) -> Payload {
    serde_json::from_str(raw).unwrap_or_else(|_| Payload::String(raw.to_string()))
}

fn transport(cli: &Cli) -> Result<Rc<dyn Transport>> {
    if cli.offline {
        let mut fixtures = FixtureTransport::new()
            .respond("a.json", parse_payload(&cli.a))
            .latency(Duration::from_millis(cli.latency_ms));
        fixtures = if cli.fail_b {
            fixtures.fail("b.json", "NetworkError")
        } else {
            fixtures.respond("b.json", parse_payload(&cli.b))
        };
        debug!("using offline fixtures");
        return Ok(Rc::new(fixtures));
    }
    if !cli.root.is_dir() {
        bail!("{} is not a directory", cli.root.display());
    }
    debug!(root = %cli.root.display(), "serving requests from files");
    Ok(Rc::new(FileTransport::new(&cli.root)))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let script = Script::new(transport(&cli)?, Rc::new(ConsoleSink));

    let unhandled = Rc::new(Cell::new(0usize));
    let counter = unhandled.clone();
    let _hook = diagnostics::on_unhandled_rejection(move |error| {
        eprintln!("error: {error}");
        counter.set(counter.get() + 1);
    });

    let mut runtime = Runtime::new().context("failed to start the event loop")?;
    let bootstrap = script.bootstrap();
    runtime.run_entry(&bootstrap).context("event loop failed")?;
    info!(tasks = runtime.task_count(), "event loop finished");

    if unhandled.get() > 0 {
        bail!("{} promise(s) rejected without a handler", unhandled.get());
    }
    Ok(())
}
