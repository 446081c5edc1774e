//! Interactive command-line controller for the script debugger.
//!
//! Launches a script under the debug client and drives the session from
//! stdin: one thread reads commands, the main loop multiplexes them with
//! session events. Logs go to a file so the prompt stays readable.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use clap::Parser;
use color_eyre::eyre::{self, Context};
use crossbeam_channel::Receiver;
use debugger::{
    DebugEvent, LaunchOptions, ManagerConfig, SessionError, SessionManager, SessionState,
    StatementOutcome,
};
use transport::params::VarScope;
use tracing_subscriber::filter::EnvFilter;

struct App {
    manager: SessionManager,
    script: PathBuf,
    events: Receiver<DebugEvent>,
    input_rx: Receiver<String>,
    /// The debuggee asked for a line of input; the next command line is
    /// forwarded to it instead of being interpreted.
    feeding_stdin: bool,

    #[allow(dead_code)]
    input_thread: JoinHandle<()>,
}

impl App {
    fn new(manager: SessionManager, script: PathBuf) -> Self {
        let events = manager.events();

        // handle input
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let input_thread = std::thread::spawn(move || {
            let mut buffer = String::new();
            loop {
                let n = std::io::stdin()
                    .read_line(&mut buffer)
                    .expect("reading from stdin");
                if n == 0 {
                    break;
                }
                let input = buffer.trim().to_owned();
                let _ = input_tx.send(input);
                buffer.clear();
            }
        });

        Self {
            manager,
            script,
            events,
            input_rx,
            feeding_stdin: false,
            input_thread,
        }
    }

    fn loop_step(&mut self) -> eyre::Result<ShouldQuit> {
        print!("> ");
        std::io::stdout().flush()?;

        crossbeam_channel::select! {
            recv(self.input_rx) -> input => match input {
                Ok(input) => self.handle_input(&input).context("handling command"),
                // stdin closed; keep serving events until the session ends
                Err(_) => self.handle_event_blocking(),
            },
            recv(self.events) -> event => if let Ok(event) = event {
                self.handle_event(event).context("handling session event")
            } else {
                Ok(ShouldQuit::False)
            },
        }
    }

    fn handle_event_blocking(&mut self) -> eyre::Result<ShouldQuit> {
        match self.events.recv() {
            Ok(event) => self.handle_event(event).context("handling session event"),
            Err(_) => Ok(ShouldQuit::True),
        }
    }

    #[tracing::instrument(skip(self))]
    fn handle_event(&mut self, event: DebugEvent) -> eyre::Result<ShouldQuit> {
        match event {
            DebugEvent::Line(event) => {
                println!("halted at {}:{}", event.filename, event.line);
            }
            DebugEvent::StateChange(SessionState::Attached) => println!("running"),
            DebugEvent::StateChange(_) => {}
            DebugEvent::Stdout(text) => print!("{text}"),
            DebugEvent::Stderr(text) => eprint!("{text}"),
            DebugEvent::StdinRequested(prompt) => {
                print!("{prompt}");
                std::io::stdout().flush()?;
                self.feeding_stdin = true;
            }
            DebugEvent::Exception(event) => {
                println!("{}: {}", event.kind, event.message);
            }
            DebugEvent::SyntaxError(event) => {
                println!(
                    "syntax error at {}:{}: {}",
                    event.filename, event.line, event.message
                );
            }
            DebugEvent::Conflicts(names) => {
                println!("warning: the script shadows built-ins: {}", names.join(", "));
            }
            DebugEvent::BreakpointConditionError(report) => {
                println!(
                    "bad breakpoint condition at {}:{}: {}",
                    report.filename, report.line, report.message
                );
            }
            DebugEvent::WatchConditionError(report) => {
                println!("bad watch condition {:?}: {}", report.condition, report.message);
            }
            DebugEvent::Exit { code, message } => {
                match code {
                    Some(code) => println!("program finished with exit code {code}"),
                    None => println!("lost the debuggee: {message}"),
                }
                return Ok(ShouldQuit::True);
            }
            other => tracing::trace!(?other, "unhandled event"),
        }
        Ok(ShouldQuit::False)
    }

    fn handle_input(&mut self, input: &str) -> eyre::Result<ShouldQuit> {
        if self.feeding_stdin {
            self.feeding_stdin = false;
            report(self.manager.send_stdin(input));
            return Ok(ShouldQuit::False);
        }

        let (command, rest) = match input.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };
        match command {
            "q" | "quit" => {
                report(self.manager.stop_debuggee());
                return Ok(ShouldQuit::True);
            }
            "c" | "continue" => {
                tracing::debug!("executing continue command");
                report(self.manager.request_go());
            }
            "s" | "step" => {
                report(self.manager.request_step());
            }
            "n" | "next" => {
                report(self.manager.request_step_over());
            }
            "r" | "return" => {
                report(self.manager.request_step_out());
            }
            "w" | "where" => self.print_stack(),
            "f" | "frame" => match rest.parse() {
                Ok(index) => {
                    report(self.manager.set_current_frame(index));
                }
                Err(_) => println!("usage: frame <number>"),
            },
            "v" | "vars" => self.print_variables(VarScope::Global),
            "l" | "locals" => self.print_variables(VarScope::Local),
            "t" | "threads" => {
                if let Some(reply) = report(self.manager.thread_list()) {
                    for thread in reply.threads {
                        let marker = if thread.id == reply.current_id { "*" } else { " " };
                        println!("{marker} {} {}", thread.id, thread.name);
                    }
                }
            }
            "b" | "break" => match parse_breakpoint(rest, &self.script) {
                Ok((filename, line)) => {
                    tracing::debug!(filename, line, "adding breakpoint");
                    report(self.manager.set_breakpoint(&filename, line, false, None));
                }
                Err(e) => println!("{e}"),
            },
            "d" | "clear" => match parse_breakpoint(rest, &self.script) {
                Ok((filename, line)) => {
                    report(self.manager.clear_breakpoint(&filename, line));
                }
                Err(e) => println!("{e}"),
            },
            "e" | "exec" => self.execute(rest),
            "p" | "print" => self.execute(&format!("print({rest})")),
            "" => return Ok(ShouldQuit::False),
            other => println!("Unhandled command: '{}'", other),
        }
        Ok(ShouldQuit::False)
    }

    fn execute(&self, statement: &str) {
        let Some(frame) = report(self.manager.current_frame()) else {
            return;
        };
        let outcome = match report(self.manager.execute_statement(statement, frame)) {
            Some(outcome) => outcome,
            None => return,
        };
        let text = match outcome {
            StatementOutcome::Output(text) | StatementOutcome::Error(text) => text,
        };
        if text.ends_with('\n') {
            print!("{text}");
        } else {
            println!("{text}");
        }
    }

    fn print_stack(&self) {
        let stack = report(self.manager.current_stack()).unwrap_or_default();
        if stack.is_empty() {
            println!("???");
            return;
        }
        let current = report(self.manager.current_frame()).unwrap_or(0);
        for (index, frame) in stack.iter().enumerate() {
            let marker = if index == current { "*" } else { " " };
            println!(
                "{marker}#{index} {} at {}:{}",
                frame.function, frame.filename, frame.line
            );
        }
    }

    fn print_variables(&self, scope: VarScope) {
        let Some(frame) = report(self.manager.current_frame()) else {
            return;
        };
        let Some(reply) = report(self.manager.get_variables(frame, scope)) else {
            return;
        };
        if reply.variables.is_empty() {
            println!("(empty)");
            return;
        }
        for item in reply.variables {
            let expand = if item.has_children { " +" } else { "" };
            println!("{} ({}) = {}{}", item.name, item.type_name, item.value, expand);
        }
    }
}

/// Print a failed session command instead of ending the repl over it.
fn report<T>(result: Result<T, SessionError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            println!("error: {e}");
            None
        }
    }
}

/// `file:line` targets that file; a bare `line` targets the script.
fn parse_breakpoint(raw: &str, script: &Path) -> eyre::Result<(String, u32)> {
    match raw.rsplit_once(':') {
        Some((filename, line)) => {
            let line = line
                .parse()
                .with_context(|| format!("breakpoint line in {raw:?}"))?;
            Ok((filename.to_owned(), line))
        }
        None => {
            let line = raw
                .parse()
                .with_context(|| format!("breakpoint line in {raw:?}"))?;
            Ok((script.to_string_lossy().into_owned(), line))
        }
    }
}

#[derive(Debug, Parser)]
struct Args {
    /// Script to run under the debugger.
    script: PathBuf,

    /// Breakpoints to install before launch, as `file:line` or `line`.
    #[clap(short, long)]
    breakpoints: Vec<String>,

    /// Listen port for debuggee connections; 0 picks a free one.
    #[clap(short, long)]
    port: Option<u16>,

    /// Config file to load instead of the default location.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Arguments passed through to the script.
    #[clap(last = true)]
    script_args: Vec<String>,
}

fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    let log_file = std::fs::File::create("log.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(Mutex::new(log_file))
        .init();

    let args = Args::parse();
    let script = args
        .script
        .canonicalize()
        .context("resolving the script path")?;

    let mut config = match &args.config {
        Some(path) => ManagerConfig::load_from(path).context("loading config")?,
        None => ManagerConfig::load().context("loading config")?,
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }

    let manager = SessionManager::new(config).context("starting the session manager")?;
    for raw in &args.breakpoints {
        let (filename, line) = parse_breakpoint(raw, &script)?;
        tracing::debug!(filename, line, "adding breakpoint");
        manager
            .set_breakpoint(&filename, line, false, None)
            .context("adding breakpoint")?;
    }

    let mut options = LaunchOptions::new(&script);
    options.args = args.script_args.clone();
    let info = manager.launch(&options).context("launching the script")?;
    println!("debugging {} (pid {})", info.filename, info.pid);

    let mut app = App::new(manager, script);
    loop {
        match app.loop_step() {
            Ok(ShouldQuit::True) => break,
            Ok(ShouldQuit::False) => {}
            Err(e) => eyre::bail!("Error running command: {e}"),
        }
    }

    Ok(())
}

enum ShouldQuit {
    True,
    False,
}
