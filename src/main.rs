use log::{debug, error};
use radiorec::config::{self, Config, ConfigError};
use radiorec::recorder::{
    CompletionReason, RecordingError, RecordingOutcome, RecordingRequest, RecordingSession,
};
use thiserror::Error;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime;

const USAGE: &str = "Usage: radiorec -r <radio> -s <show> -d <minutes> [-c <config>] [--json]

Command line internet radio recorder (for crontab).

  -r, --radio <name>       Name of the radio station (a section of the config file)
  -s, --show <name>        Name of the radio show
  -d, --duration <min>     Duration of the recording in minutes
  -c, --config <path>      Config file (default: ~/.pyrecorder.conf)
      --json               Print the outcome as JSON
  -h, --help               Show this help";

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("cannot start the async runtime: {0}")]
    Runtime(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    radio: String,
    show: String,
    duration: u64,
    config: Option<PathBuf>,
    json: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Record(Args),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(env::args().skip(1)) {
        Ok(Command::Record(args)) => args,
        Ok(Command::Help) => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("{}\n\n{}", message, USAGE);
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(outcome) => {
            report(&outcome, args.json);
            if outcome.reason.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("Recording failed: {}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/**
 * Resolves the station, prepares the target directory and records.
 */
fn run(args: &Args) -> Result<RecordingOutcome, RunError> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let registry = Config::load(&config_path)?;
    let station = registry.station(&args.radio)?;

    let dir = config::recording_dir(&registry.savedir, &args.radio, &args.show);
    let file_path = config::recording_path(
        &registry.savedir,
        &args.radio,
        &args.show,
        &station.suffix,
        chrono::Local::now(),
    );

    println!("The recording will start with the following settings:");
    println!("* Radio station: {}", station.fullname);
    println!("* Radio show:    {}", args.show);
    println!("* Duration:      {} minutes", args.duration);
    println!("* Record file:   {}", file_path.display());
    println!();

    let request = RecordingRequest::new(&station.url, file_path, args.duration)?;
    config::prepare_directory(&dir)?;

    let rt = runtime::Runtime::new().map_err(RunError::Runtime)?;
    let outcome = rt.block_on(RecordingSession::new(request).run())?;
    Ok(outcome)
}

fn report(outcome: &RecordingOutcome, json: bool) {
    if json {
        match serde_json::to_string(outcome) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode outcome: {}", e),
        }
        return;
    }

    match outcome.reason {
        CompletionReason::ConnectionFailed => {
            eprintln!("Not able to connect, nothing was recorded.")
        }
        reason => println!(
            "Recording {:?}: {} bytes written to {} in {:.0}s",
            reason,
            outcome.bytes_written,
            outcome.file_path.display(),
            outcome.elapsed_secs
        ),
    }
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut radio = None;
    let mut show = None;
    let mut duration = None;
    let mut config = None;
    let mut json = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("Missing value for {}", name))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-r" | "--radio" => radio = Some(value(&arg)?),
            "-s" | "--show" => show = Some(value(&arg)?),
            "-c" | "--config" => config = Some(PathBuf::from(value(&arg)?)),
            "-d" | "--duration" => {
                let raw = value(&arg)?;
                let minutes = raw
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid duration: {}", raw))?;
                if minutes == 0 {
                    return Err("Duration must be at least one minute".to_string());
                }
                duration = Some(minutes);
            }
            "--json" => json = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    let args = Args {
        radio: radio.ok_or("Missing required argument --radio")?,
        show: show.ok_or("Missing required argument --show")?,
        duration: duration.ok_or("Missing required argument --duration")?,
        config,
        json,
    };
    debug!("Parsed arguments: {:?}", args);
    Ok(Command::Record(args))
}
