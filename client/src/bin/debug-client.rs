use std::path::PathBuf;

use clap::Parser;
use color_eyre::{eyre, eyre::Context};
use tracing_subscriber::EnvFilter;

use client::{ClientOptions, DebugClient, ForkPolicy};

/// Runs one script under a remote debug controller.
#[derive(Debug, Parser)]
struct Args {
    /// Controller host; a trailing `@@v6` marks an IPv6 literal.
    #[clap(long)]
    host: String,

    /// Controller port.
    #[clap(long)]
    port: u16,

    /// Correlation id stamped on every message; generated when absent.
    #[clap(long)]
    procuuid: Option<String>,

    /// Always follow the child side of a script fork.
    #[clap(long, conflicts_with = "fork_parent")]
    fork_child: bool,

    /// Always follow the parent side of a script fork.
    #[clap(long)]
    fork_parent: bool,

    /// Keep script stdio on the console instead of the protocol.
    #[clap(long)]
    no_redirect: bool,

    /// Do not report runtime errors as they are raised.
    #[clap(long)]
    no_exc_report: bool,

    /// Start with call/return tracing off.
    #[clap(long)]
    no_call_trace: bool,

    /// Trace prelude code as well as user code.
    #[clap(long)]
    trace_lib: bool,

    /// IO encoding, accepted for compatibility; this build always uses UTF-8.
    #[clap(long, default_value = "utf-8")]
    encoding: String,

    /// The script to run and its arguments, after `--`.
    #[clap(last = true, required = true)]
    script_and_args: Vec<String>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    // The script owns stdout; our own noise goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed command line arguments");

    let mut opts = ClientOptions::new(args.host, args.port);
    if let Some(procuuid) = args.procuuid {
        opts.procuuid = procuuid;
    }
    opts.redirect = !args.no_redirect;
    opts.exc_report = !args.no_exc_report;
    opts.call_trace = !args.no_call_trace;
    opts.trace_lib = args.trace_lib;
    if args.fork_child {
        opts.fork_policy = ForkPolicy::FollowChild;
    } else if args.fork_parent {
        opts.fork_policy = ForkPolicy::FollowParent;
    }
    if !args.encoding.eq_ignore_ascii_case("utf-8") && !args.encoding.eq_ignore_ascii_case("utf8") {
        tracing::warn!(encoding = %args.encoding, "only utf-8 is supported; continuing with utf-8");
    }
    opts.encoding = args.encoding;
    opts.auth = read_auth_token()?;

    let (script, script_args) = match args.script_and_args.split_first() {
        Some(split) => split,
        None => eyre::bail!("no script given"),
    };
    let script_path = PathBuf::from(script);

    let mut client = DebugClient::connect(opts).context("connecting to the controller")?;
    let code = client
        .run_script(&script_path, script_args)
        .context("running the script under debug")?;
    tracing::debug!(code, "script finished");
    std::process::exit(code as i32);
}

/// The spawning controller can hand us an authentication token through a
/// file named in the environment, keeping it off the command line.
fn read_auth_token() -> eyre::Result<Option<String>> {
    let Ok(path) = std::env::var("DEBUG_CLIENT_AUTH_FILE") else {
        return Ok(None);
    };
    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("reading auth token file {path:?}"))?;
    Ok(Some(token.trim().to_owned()))
}
