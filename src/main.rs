//! FlowRunner CLI Entry Point
//!
//! Provides a command-line interface for running workflow documents and
//! reading back persisted results.
//!
//! # Usage
//!
//! ```bash
//! # Run a document's default function
//! flowrunner run suite.yaml
//!
//! # Run a specific function with arguments
//! flowrunner run suite.yaml --function smoke --args '"nightly"'
//!
//! # Validate only
//! flowrunner run suite.yaml --test
//!
//! # Show a persisted result
//! flowrunner result 3 --results /var/lib/flowrunner/results
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};

use flowrunner::execution::{JobSummary, ResultStore};
use flowrunner::monitoring::ExecutionTimeline;
use flowrunner::{CompletionStatus, Engine, EngineConfig, JobRequest, APP_NAME, VERSION};

/// How long `run` waits for a job before giving up.
const RUN_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Subcommand selected on the command line.
#[derive(Debug, PartialEq)]
enum Command {
    Run {
        document: String,
        function: Option<String>,
        args: Option<String>,
        test_only: bool,
    },
    Result {
        job_id: u64,
    },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    config_path: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    workers: Option<usize>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{}", format!("{} v{}", APP_NAME, VERSION).bold());
    println!("Cooperative Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run <DOCUMENT>      Run a workflow document (YAML)");
    println!("  result <JOB_ID>     Show a persisted job result");
    println!();
    println!("Options:");
    println!("  --function NAME     Start function (default: the document's)");
    println!("  --args EXPR         Argument expression for the start function");
    println!("  --config FILE       Engine configuration (YAML)");
    println!("  --workers N         Number of worker threads");
    println!("  --results DIR       Result directory");
    println!("  --test              Validate and record a result without running");
    println!("  --verbose           Enable debug logging and print the timeline");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner run suite.yaml --function smoke");
    println!("  flowrunner run suite.yaml --test");
    println!("  flowrunner result 3 --results ./results");
}

fn option_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut positional: Vec<&str> = Vec::new();
    let mut function = None;
    let mut call_args = None;
    let mut config_path = None;
    let mut results_dir = None;
    let mut workers = None;
    let mut test_only = false;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => verbose = true,
            "--test" => test_only = true,
            "--function" => function = Some(option_value(args, &mut i, arg)?.to_string()),
            "--args" => call_args = Some(option_value(args, &mut i, arg)?.to_string()),
            "--config" => config_path = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            "--results" => results_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            "--workers" => {
                let value = option_value(args, &mut i, arg)?;
                workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid worker count: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        ["run", document] => Command::Run {
            document: document.to_string(),
            function,
            args: call_args,
            test_only,
        },
        ["result", id] => Command::Result {
            job_id: id.parse().map_err(|_| format!("Invalid job id: {}", id))?,
        },
        [] => return Err("No command given".to_string()),
        [other, ..] if *other != "run" && *other != "result" => {
            return Err(format!("Unknown command: {}", other))
        }
        _ => return Err("Wrong number of arguments".to_string()),
    };

    Ok(Config {
        command,
        config_path,
        results_dir,
        workers,
        verbose,
    })
}

fn status_label(status: CompletionStatus) -> colored::ColoredString {
    match status {
        CompletionStatus::Normal => status.to_string().green().bold(),
        CompletionStatus::Terminated => status.to_string().yellow().bold(),
        CompletionStatus::Abnormal => status.to_string().red().bold(),
    }
}

fn print_summary(summary: &JobSummary) {
    println!();
    println!("{}", format!("=== Job {} ({}) ===", summary.job_id, summary.job_name).bold().cyan());
    println!("Document:  {}", summary.document);
    if let Some(function) = &summary.start_function {
        println!("Function:  {}", function);
    }
    println!("Status:    {}", status_label(summary.status));
    if let Some(code) = summary.termination_code {
        println!("Code:      {}", code);
    }
    if let Some(reason) = &summary.reason {
        println!("Reason:    {}", reason);
    }
    println!("Result:    {}", summary.result);
    if let Some(ms) = summary.duration_ms() {
        println!("Duration:  {} ms", ms);
    }
    for entry in &summary.errors {
        println!("  {} {}", "error:".red(), entry.message);
    }
}

fn print_timeline(timeline: &ExecutionTimeline) {
    println!();
    println!("{}", "=== Timeline ===".bold().cyan());
    print!("{}", timeline.report());

    let mut durations: Vec<_> = timeline.get_durations().into_iter().collect();
    durations.sort();
    for (subject, ms) in durations {
        println!("{:<10} {} ms", subject, ms);
    }
}

fn load_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = config.workers {
        engine_config = engine_config.with_workers(workers);
    }
    if let Some(dir) = &config.results_dir {
        engine_config = engine_config.with_result_dir(dir);
    }
    Ok(engine_config)
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let engine_config = load_config(&config)?;

    match &config.command {
        Command::Run {
            document,
            function,
            args,
            test_only,
        } => {
            let engine = Engine::new(engine_config);
            info!("Loading document: {}", document);
            let loaded = engine.load_local_document(document).map_err(|e| {
                error!("Failed to load document: {}", e);
                format!("Could not load document from '{}': {}", document, e)
            })?;

            let mut request = JobRequest::new(loaded);
            if let Some(function) = function {
                request = request.with_function(function.clone());
            }
            if let Some(args) = args {
                request = request.with_args(args.clone());
            }
            if *test_only {
                info!("Mode: TEST (document is validated, not run)");
                request = request.test_only();
            }

            let job = engine.submit(request)?;
            if !job.wait(RUN_TIMEOUT) {
                engine.shutdown();
                return Err(format!("Job {} did not complete in time", job.id()).into());
            }
            engine.shutdown();

            let detail = job
                .detail()
                .ok_or_else(|| format!("Job {} completed without a result", job.id()))?;
            print_summary(&detail.summary);
            if config.verbose {
                print_timeline(&job.timeline());
            }
            Ok(detail.summary.status == CompletionStatus::Normal)
        }
        Command::Result { job_id } => {
            let dir = engine_config
                .result_dir
                .ok_or("No result directory given (use --results or --config)")?;
            let summary = ResultStore::new(dir).load_summary(*job_id)?;
            print_summary(&summary);
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("flowrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run() {
        let config = parse_arguments(&args(&[
            "run", "suite.yaml", "--function", "smoke", "--workers", "3", "--test",
        ]))
        .unwrap();

        assert_eq!(
            config.command,
            Command::Run {
                document: "suite.yaml".to_string(),
                function: Some("smoke".to_string()),
                args: None,
                test_only: true,
            }
        );
        assert_eq!(config.workers, Some(3));
        assert!(!config.verbose);
    }

    #[test]
    fn test_parse_result() {
        let config = parse_arguments(&args(&["result", "12", "--results", "/tmp/r"])).unwrap();
        assert_eq!(config.command, Command::Result { job_id: 12 });
        assert_eq!(config.results_dir, Some(PathBuf::from("/tmp/r")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["run"])).is_err());
        assert!(parse_arguments(&args(&["launch", "x"])).is_err());
        assert!(parse_arguments(&args(&["result", "abc"])).is_err());
        assert!(parse_arguments(&args(&["run", "a.yaml", "--workers", "many"])).is_err());
        assert!(parse_arguments(&args(&["run", "a.yaml", "--function"])).is_err());
        assert!(parse_arguments(&args(&["run", "a.yaml", "--bogus"])).is_err());
    }

    #[test]
    fn test_load_config_overrides() {
        let config = parse_arguments(&args(&["result", "1", "--workers", "7", "--results", "out"]))
            .unwrap();
        let engine_config = load_config(&config).unwrap();
        assert_eq!(engine_config.workers, 7);
        assert_eq!(engine_config.result_dir, Some(PathBuf::from("out")));
    }
}
