use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::info;

use probe_config::{load_config, Config, LogLevel};
use probe_dbgp::{
    error_code_meaning, BreakpointKind, DbgpError, PathMapper, Render, Response, Session,
    SessionOptions, SourceLocation,
};

/// Renders session output as plain lines on stdout.
#[derive(Default)]
struct StdoutRender;

impl Render for StdoutRender {
    fn status(&mut self, status: &str) {
        println!("status: {status}");
    }

    fn location(&mut self, location: &SourceLocation) {
        println!("at {}:{}", location.file, location.line);
    }

    fn stack(&mut self, response: &Response) {
        let Ok(doc) = response.document() else { return };
        for frame in doc
            .descendants()
            .filter(|n| n.is_element() && n.has_tag_name("stack"))
        {
            let level = frame.attribute("level").unwrap_or("?");
            let name = frame.attribute("where").unwrap_or("?");
            let file = frame.attribute("filename").unwrap_or("?");
            let line = frame.attribute("lineno").unwrap_or("?");
            println!("  [{level}] {name} {file}:{line}");
        }
    }

    fn context(&mut self, response: &Response) {
        self.print_properties(response);
    }

    fn value(&mut self, response: &Response) {
        self.print_properties(response);
    }

    fn message(&mut self, text: &str) {
        println!("{text}");
    }

    fn error(&mut self, text: &str) {
        eprintln!("probe: {text}");
    }
}

impl StdoutRender {
    fn print_properties(&self, response: &Response) {
        let Ok(doc) = response.document() else { return };
        let mut printed = false;
        for property in doc
            .descendants()
            .filter(|n| n.is_element() && n.has_tag_name("property"))
        {
            let name = property
                .attribute("name")
                .or_else(|| property.attribute("fullname"))
                .unwrap_or("?");
            let type_name = property.attribute("type").unwrap_or("?");
            let value = property_value(&property);
            println!("  {name} ({type_name}) = {value}");
            printed = true;
        }
        if !printed {
            println!("  (no values)");
        }
    }
}

/// Extract a property's display value, decoding base64 payloads.
fn property_value(node: &roxmltree::Node<'_, '_>) -> String {
    let text = node
        .children()
        .filter_map(|c| c.text())
        .collect::<String>();
    let text = text.trim();
    if node.attribute("encoding") == Some("base64") {
        if let Ok(bytes) = BASE64.decode(text) {
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    text.to_string()
}

/// The interactive control loop around one [`Session`].
struct App {
    session: Session,
}

impl App {
    fn new(config: &Config) -> Self {
        let options = SessionOptions {
            host: config.server.host.clone(),
            port: config.server.port,
            accept_timeout: Duration::from_secs(config.server.timeout_secs),
            response_timeout: config
                .server
                .response_timeout_secs
                .map(Duration::from_secs),
            ide_key: config.session.ide_key.clone(),
            features: config
                .session
                .features
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let paths = PathMapper::new(
            config
                .path_maps
                .iter()
                .map(|(remote, local)| (remote.clone(), local.clone())),
        );
        let session = Session::new(options, Box::new(StdoutRender), Box::new(paths));
        Self { session }
    }

    /// Handle one command line. Returns false when the loop should end.
    fn handle_line(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return true;
        };
        let rest: Vec<&str> = parts.collect();

        match command {
            "listen" | "l" => self.listen(),
            "run" | "r" => report(self.session.run().map(|_| ())),
            "into" | "i" => report(self.session.step_into().map(|_| ())),
            "over" | "n" => report(self.session.step_over().map(|_| ())),
            "out" | "o" => report(self.session.step_out().map(|_| ())),
            "break" | "b" => self.add_breakpoint(&rest),
            "breaks" => self.list_breakpoints(),
            "delete" | "d" => self.delete_breakpoint(&rest),
            "toggle" | "t" => self.toggle_breakpoint(&rest),
            "stack" | "bt" => report(self.session.stack().map(|_| ())),
            "context" | "c" => report(self.session.context().map(|_| ())),
            "property" | "p" => match rest.first() {
                Some(name) => report(self.session.property(name).map(|_| ())),
                None => println!("usage: property <name>"),
            },
            "eval" | "e" => {
                if rest.is_empty() {
                    println!("usage: eval <expression>");
                } else {
                    report(self.session.eval(&rest.join(" ")).map(|_| ()));
                }
            }
            "status" | "s" => report(self.session.status().map(|_| ())),
            "detach" => report(self.session.detach()),
            "stop" => report(self.session.stop()),
            "help" | "?" => print_help(),
            "quit" | "q" | "exit" => {
                self.session.close();
                return false;
            }
            other => println!("unknown command: {other} (try: help)"),
        }
        true
    }

    /// Start listening and block until an engine attaches or the
    /// accept window lapses.
    fn listen(&mut self) {
        if let Err(e) = self.session.listen() {
            report_error(&e);
            return;
        }
        loop {
            match self.session.poll() {
                Ok(true) => return,
                Ok(false) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => {
                    report_error(&e);
                    return;
                }
            }
        }
    }

    fn add_breakpoint(&mut self, args: &[&str]) {
        let kind = match args {
            ["exception", name] => BreakpointKind::Exception {
                name: (*name).to_string(),
            },
            ["call", function] => BreakpointKind::Call {
                function: (*function).to_string(),
            },
            ["return", function] => BreakpointKind::Return {
                function: (*function).to_string(),
            },
            ["watch", expression @ ..] if !expression.is_empty() => BreakpointKind::Watch {
                expression: expression.join(" "),
            },
            [path, line, expression @ ..] => {
                let Ok(line) = line.parse::<u32>() else {
                    println!("usage: break <file> <line> [condition]");
                    return;
                };
                if expression.is_empty() {
                    BreakpointKind::Line {
                        path: (*path).to_string(),
                        line,
                    }
                } else {
                    BreakpointKind::Conditional {
                        path: (*path).to_string(),
                        line,
                        expression: expression.join(" "),
                    }
                }
            }
            _ => {
                println!("usage: break <file> <line> [condition]");
                println!("       break exception <name> | call <fn> | return <fn> | watch <expr>");
                return;
            }
        };
        match self.session.add_breakpoint(kind) {
            Ok(id) => println!("breakpoint {id} added"),
            Err(e) => report_error(&e),
        }
    }

    fn list_breakpoints(&self) {
        let mut any = false;
        for bp in self.session.breakpoints() {
            any = true;
            let state = if bp.is_enabled() { "enabled" } else { "disabled" };
            let place = match bp.kind().location() {
                Some((path, line)) => format!("{path}:{line}"),
                None => bp.kind().type_name().to_string(),
            };
            let remote = match bp.remote_id() {
                Some(id) => format!(" (engine id {id})"),
                None => String::new(),
            };
            println!(
                "  {} {} {} {}{}",
                bp.id(),
                bp.kind().type_name(),
                place,
                state,
                remote
            );
        }
        if !any {
            println!("no breakpoints");
        }
    }

    fn delete_breakpoint(&mut self, args: &[&str]) {
        let Some(id) = args.first().and_then(|s| s.parse::<u32>().ok()) else {
            println!("usage: delete <id>");
            return;
        };
        match self.session.remove_breakpoint(id) {
            Ok(true) => println!("breakpoint {id} removed"),
            Ok(false) => println!("no breakpoint {id}"),
            Err(e) => report_error(&e),
        }
    }

    fn toggle_breakpoint(&mut self, args: &[&str]) {
        let Some(id) = args.first().and_then(|s| s.parse::<u32>().ok()) else {
            println!("usage: toggle <id>");
            return;
        };
        match self.session.toggle_breakpoint(id) {
            Ok(Some(true)) => println!("breakpoint {id} enabled"),
            Ok(Some(false)) => println!("breakpoint {id} disabled"),
            Ok(None) => println!("no breakpoint {id}"),
            Err(e) => report_error(&e),
        }
    }
}

fn report(result: Result<(), DbgpError>) {
    if let Err(e) = result {
        report_error(&e);
    }
}

fn report_error(error: &DbgpError) {
    eprintln!("probe: {error}");
    if let DbgpError::Protocol { code, .. } = error {
        if let Some(meaning) = error_code_meaning(*code) {
            eprintln!("probe: engine error {code}: {}", meaning.trim());
        }
    }
}

fn print_help() {
    println!(
        "\
commands:
  listen              wait for a debugger engine to connect
  run                 resume until the next breakpoint
  into / over / out   step commands
  break <file> <line> [condition]
  break exception <name> | call <fn> | return <fn> | watch <expr>
  breaks              list breakpoints
  delete <id>         remove a breakpoint
  toggle <id>         enable/disable a breakpoint
  stack               show the call stack
  context             show local variables
  property <name>     show one variable
  eval <expression>   evaluate in the paused context
  status              query the engine status
  detach              detach, leaving the debuggee running
  stop                terminate the debuggee
  quit                exit"
    );
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PROBE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("probe")
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let level = match config.log.level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.log.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            // Keep logs on stderr so they never interleave with
            // rendered command output.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let config = load_config(&config_dir()).unwrap_or_else(|e| {
        eprintln!("probe: config load failed, using defaults: {e}");
        Config::default()
    });
    init_logging(&config)?;

    let mut app = App::new(&config);
    println!("probe: DBGP debugging client (try: help)");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("(probe) ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next() else { break };
        let line = line.context("failed to read command input")?;
        if !app.handle_line(&line) {
            break;
        }
    }

    info!("probe exited cleanly");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("probe: {e:#}");
        std::process::exit(1);
    }
}
