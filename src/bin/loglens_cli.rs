use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use loglens::config::Config;
use loglens::filter::FilterRequest;
use loglens::jobs::{JobManager, Pipeline};
use loglens::models::{JobId, JobStatus};
use loglens::normalizer::{parse_address, LogFormat, Normalizer, RawInput};
use loglens::output::{OutputFormat, OutputHandler};
use loglens::reputation::ReputationAggregator;

/// Log analysis and IP reputation Command Line Interface
#[derive(StructOpt, Debug)]
#[structopt(name = "loglens", about = "Log analysis and IP reputation CLI")]
pub enum Cli {
    /// Analyze log files and print the job result
    Analyze {
        /// Log files to analyze as one job
        #[structopt(parse(from_os_str), required = true)]
        files: Vec<PathBuf>,
        #[structopt(flatten)]
        common: CommonOpts,
    },
    /// Analyze log files, then query the parsed records
    Filter {
        #[structopt(parse(from_os_str), required = true)]
        files: Vec<PathBuf>,
        #[structopt(flatten)]
        common: CommonOpts,
        /// Exact source address
        #[structopt(long)]
        ip: Option<String>,
        /// Substring of the user name
        #[structopt(long)]
        user: Option<String>,
        /// DEBUG, INFO, WARNING, ERROR or CRITICAL
        #[structopt(long)]
        severity: Option<String>,
        /// Inclusive lower time bound (RFC 3339)
        #[structopt(long)]
        start: Option<String>,
        /// Inclusive upper time bound (RFC 3339)
        #[structopt(long)]
        end: Option<String>,
    },
    /// Parse and display normalized records from a file
    Parse {
        /// Path to log file
        #[structopt(short, long)]
        file: PathBuf,
        /// Number of records to show
        #[structopt(short, long, default_value = "10")]
        lines: usize,
        /// Input format: text, json, jsonl, csv or xml
        #[structopt(long)]
        hint: Option<String>,
        /// Path to configuration file
        #[structopt(short, long)]
        config: Option<PathBuf>,
    },
    /// Look up addresses with the configured reputation providers
    Reputation {
        #[structopt(required = true)]
        addresses: Vec<String>,
        /// Path to configuration file
        #[structopt(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "loglens.toml")]
        output: PathBuf,
    },
}

#[derive(StructOpt, Debug)]
pub struct CommonOpts {
    /// Path to configuration file
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Output format: json, jsonl or console (overrides the configuration)
    #[structopt(long)]
    format: Option<String>,
    /// Append output to this file instead of stdout
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
    /// Input format: text, json, jsonl, csv or xml
    #[structopt(long)]
    hint: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)?;
            log::info!("Configuration loaded from {:?}", path);
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

fn parse_hint(hint: Option<&String>) -> Result<Option<LogFormat>, Box<dyn std::error::Error>> {
    hint.map(|h| LogFormat::from_hint(h).ok_or_else(|| format!("unknown input format '{}'", h).into()))
        .transpose()
}

fn read_inputs(files: &[PathBuf], hint: Option<LogFormat>) -> Result<Vec<RawInput>, Box<dyn std::error::Error>> {
    files
        .iter()
        .map(|path| {
            let input = RawInput::from_path(path)?;
            Ok(match hint {
                Some(format) => input.with_hint(format),
                None => input,
            })
        })
        .collect()
}

fn output_handler(config: &Config, common: &CommonOpts) -> Result<OutputHandler, Box<dyn std::error::Error>> {
    let format = OutputFormat::from_str(common.format.as_deref().unwrap_or(&config.output.format));
    let file = common.output.clone().or_else(|| config.output.file_path.clone());
    OutputHandler::new(format, file)
}

/// Submit one job and wait for it, canceling on Ctrl+C
async fn run_analysis(
    config: &Config,
    common: &CommonOpts,
    files: &[PathBuf],
) -> Result<(Arc<JobManager>, JobId), Box<dyn std::error::Error>> {
    let inputs = read_inputs(files, parse_hint(common.hint.as_ref())?)?;
    let cache = ReputationAggregator::cache_from_config(&config.reputation);
    let pipeline = Pipeline::from_config(config, cache)?;
    log::info!(
        "Reputation providers: {}",
        pipeline.reputation().provider_names().join(", ")
    );
    let manager = Arc::new(
        JobManager::new(pipeline, config.filter.max_matches)
            .with_retention(config.jobs.max_finished_jobs),
    );

    let id = manager.submit(inputs);
    {
        let manager = Arc::clone(&manager);
        ctrlc::set_handler(move || {
            log::info!("Interrupt received, canceling job {}", id);
            if let Err(e) = manager.cancel(id) {
                log::warn!("Could not cancel job: {}", e);
            }
        })?;
    }

    manager.wait(id).await?;
    Ok((manager, id))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Analyze { files, common } => {
            let config = load_config(common.config.as_ref())?;
            let mut output = output_handler(&config, &common)?;
            let (manager, id) = run_analysis(&config, &common, &files).await?;

            let view = manager.status(id)?;
            output.write_job(&view)?;
            output.flush()?;
            if view.status == JobStatus::Failed {
                std::process::exit(1);
            }
        }
        Cli::Filter {
            files,
            common,
            ip,
            user,
            severity,
            start,
            end,
        } => {
            let config = load_config(common.config.as_ref())?;
            let request = FilterRequest {
                ip,
                user,
                severity,
                start_time: start,
                end_time: end,
            };
            // Reject a bad query before spending time on analysis
            loglens::filter::RecordFilter::from_request(&request)?;

            let mut output = output_handler(&config, &common)?;
            let (manager, id) = run_analysis(&config, &common, &files).await?;
            match manager.filter(id, &request) {
                Ok(result) => {
                    output.write_filter(&result)?;
                    output.flush()?;
                }
                Err(e) => {
                    eprintln!("Filter failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Cli::Parse {
            file,
            lines,
            hint,
            config,
        } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }
            let config = load_config(config.as_ref())?;
            let normalizer = Normalizer::new(&config.normalizer)?;
            let mut input = RawInput::from_path(&file)?;
            if let Some(format) = parse_hint(hint.as_ref())? {
                input = input.with_hint(format);
            }

            let mut stream = normalizer.records(&input);
            let shown: Vec<_> = stream.by_ref().take(lines).collect();
            let rest = stream.by_ref().count();

            println!(
                "Parsed {} record(s) (showing {}, {} dropped):\n",
                shown.len() + rest,
                shown.len(),
                stream.skipped()
            );
            for record in &shown {
                println!(
                    "  Time: {}, Severity: {}, IP: {}, User: {}",
                    record.timestamp.to_rfc3339(),
                    record.severity,
                    record
                        .source_address
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    record.user.as_deref().unwrap_or("-")
                );
            }
        }
        Cli::Reputation { addresses, config } => {
            let config = load_config(config.as_ref())?;
            let mut parsed = BTreeSet::new();
            for raw in &addresses {
                match parse_address(raw) {
                    Some(address) => {
                        parsed.insert(address);
                    }
                    None => {
                        eprintln!("Not an IP address: {}", raw);
                        std::process::exit(1);
                    }
                }
            }

            let cache = ReputationAggregator::cache_from_config(&config.reputation);
            let aggregator = ReputationAggregator::from_config(&config.reputation, cache)?;
            let report = aggregator.lookup(&parsed).await;

            println!(
                "{}",
                serde_json::to_string_pretty(&report.results)?
            );
            if report.all_failed() {
                eprintln!("Every reputation lookup failed");
                std::process::exit(1);
            }
        }
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
    }

    Ok(())
}
