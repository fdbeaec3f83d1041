use anyhow::{Context as _, Result, bail};
use clap::Parser;
use jsh::{
    Engine, EngineConfig, ExitStatus, FlushPolicy, JobState, Mode, Process, StreamMask,
};
use nix::unistd::isatty;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Start the pipeline in the background
    #[arg(short, long)]
    background: bool,

    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,

    /// Forward this process's stdin to the first stage
    #[arg(long)]
    stdin: bool,

    /// Pipeline to run; stages are separated by a literal `|`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log.as_deref()) {
        eprintln!("Failed to initialize tracing: {err}");
        return ExitCode::FAILURE;
    }
    setup_panic_handler();

    match run(&cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("jsh: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    match log {
        Some(path) => {
            let log_file = Arc::new(
                std::fs::File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            );
            builder.with_writer(log_file).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");

        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = if let Some(location) = panic_info.location() {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        } else {
            "Unknown location".to_string()
        };

        tracing::error!("PANIC OCCURRED: {} at {} (thread {})", payload, location, thread_name);
        eprintln!("jsh panicked at {location} on thread {thread_name}: {payload}");
    }));
}

/// Split `words` into stages at each literal `|`.
fn parse_pipeline(words: &[String]) -> Result<Vec<Process>> {
    let mut stages = Vec::new();
    for stage in words.split(|word| word == "|") {
        let Some((program, args)) = stage.split_first() else {
            bail!("empty pipeline stage");
        };
        stages.push(Process::new(program.as_str()).args(args).inherit_env());
    }
    Ok(stages)
}

fn run(cli: &Cli) -> Result<i32> {
    let stages = parse_pipeline(&cli.command)?;

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .with_env()?;
    if config.interactive != Some(false) && isatty(config.terminal_fd).unwrap_or(false) {
        config.claim_terminal = true;
    }

    let engine = Engine::init(config)?;
    let job = engine.create_job();
    for stage in stages {
        job.add(stage)?;
    }

    job.on_stdout(|data| {
        let mut out = io::stdout().lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    });
    job.on_stderr(|data| {
        let mut err = io::stderr().lock();
        let _ = err.write_all(data);
        let _ = err.flush();
    });
    let finished: Arc<Mutex<Option<ExitStatus>>> = Arc::new(Mutex::new(None));
    let result = Arc::clone(&finished);
    job.on_state_changed(move |status| {
        debug!("job state: {:?}", status);
        match status.state {
            JobState::Terminated => {
                *result.lock() = Some(status.exit_status.unwrap_or(ExitStatus::Unspawned));
            }
            JobState::Stopped => warn!("job stopped"),
            JobState::Running | JobState::Failed => {}
        }
    });

    let mut streams = StreamMask::STDOUT | StreamMask::STDERR;
    if cli.stdin {
        streams |= StreamMask::STDIN;
    }
    let mode = if cli.background {
        Mode::Background
    } else {
        Mode::Foreground
    };
    job.start(mode, streams)?;

    if cli.stdin {
        let feeder = Arc::clone(&job);
        std::thread::spawn(move || {
            let mut input = io::stdin().lock();
            let mut chunk = vec![0u8; 8192];
            loop {
                match input.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => feeder.write(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("reading stdin failed: {}", e);
                        break;
                    }
                }
            }
            feeder.close();
        });
    }

    let status = loop {
        engine.dispatch(None)?;
        if let Some(status) = *finished.lock() {
            break status;
        }
    };
    debug!("'{}' finished: {}", job.command(), status);

    if engine.is_interactive()
        && let Err(e) = engine.session().restore(FlushPolicy::Drain)
    {
        debug!("terminal restore skipped: {}", e);
    }
    engine.deinit();
    Ok(status.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn pipeline_splits_on_bar() {
        let stages = parse_pipeline(&words("printf a | cat -n")).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].path(), "printf");
        assert_eq!(stages[1].get_args(), ["-n"]);
    }

    #[test]
    fn empty_stage_is_rejected() {
        assert!(parse_pipeline(&words("ls | | cat")).is_err());
        assert!(parse_pipeline(&words("ls |")).is_err());
    }
}
