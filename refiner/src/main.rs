//! Test-driven candidate refinement CLI.
//!
//! Runs a pytest oracle against a Python candidate inside a disposable
//! container and, when checks fail, asks a generator command for improved
//! candidates until the checks pass or the run stops making progress.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use refiner::analysis::{PythonAnalyzer, QualityAnalyzer};
use refiner::cancel::CancelToken;
use refiner::core::classifier::{classify, render_feedback};
use refiner::core::outcome_parser;
use refiner::core::types::{FailureAnalysis, QualityMetrics, StopKind, TestOutcome};
use refiner::exit_codes;
use refiner::io::config::{DEFAULT_CONFIG_FILE, RefinerConfig, load_config, write_config};
use refiner::io::generator::{CommandBackend, PromptedGenerator};
use refiner::io::sandbox::{DockerBackend, Sandbox};
use refiner::refine::{RefineError, RefineTask, Refiner};

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Run a pytest oracle against a candidate and refine it until it passes"
)]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// More diagnostics on stderr (-v info, -vv debug); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with every default spelled out.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Analyze a candidate; with `--oracle`, also run the checks once.
    Check {
        #[arg(long)]
        candidate: PathBuf,
        #[arg(long)]
        oracle: Option<PathBuf>,
    },
    /// Refine a candidate until the oracle passes or the run stops.
    Run {
        /// Natural-language description of the function to implement.
        #[arg(long)]
        spec: PathBuf,
        /// pytest file importing the candidate as `impl`.
        #[arg(long)]
        oracle: PathBuf,
        /// First candidate; generated from the spec when omitted.
        #[arg(long)]
        candidate: Option<PathBuf>,
        /// Write the JSON run report here instead of stdout.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Write the best candidate here.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove containers leaked by interrupted runs.
    Gc,
}

fn main() {
    let cli = Cli::parse();
    refiner::logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::Check { candidate, oracle } => {
            let cfg = load_config(&cli.config)?;
            cmd_check(&cfg, &candidate, oracle.as_deref())
        }
        Command::Run {
            spec,
            oracle,
            candidate,
            report,
            output,
        } => {
            let cfg = load_config(&cli.config)?;
            cmd_run(
                &cfg,
                &RunArgs {
                    spec: &spec,
                    oracle: &oracle,
                    candidate: candidate.as_deref(),
                    report: report.as_deref(),
                    output: output.as_deref(),
                },
            )
        }
        Command::Gc => {
            let cfg = load_config(&cli.config)?;
            cmd_gc(&cfg)
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RefinerConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct CheckReport {
    syntax_error: Option<String>,
    metrics: QualityMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<TestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<FailureAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<String>,
}

fn cmd_check(cfg: &RefinerConfig, candidate: &Path, oracle: Option<&Path>) -> Result<i32> {
    let source = read(candidate)?;
    let analyzer = PythonAnalyzer::new(cfg.analysis.clone());
    let syntax_error = analyzer.syntax_error(&source);
    let mut report = CheckReport {
        metrics: analyzer.analyze(&source),
        syntax_error,
        outcome: None,
        analysis: None,
        feedback: None,
    };

    if let Some(oracle) = oracle {
        let oracle = read(oracle)?;
        let sandbox = docker_sandbox(cfg)?;
        let raw = sandbox.execute(
            &source,
            &oracle,
            sandbox.default_timeout(),
            &CancelToken::new(),
        )?;
        let outcome = outcome_parser::parse(&raw);
        let analysis = classify(&outcome, Some(&source));
        report.feedback = Some(render_feedback(&analysis));
        report.outcome = Some(outcome);
        report.analysis = Some(analysis);
    }

    println!("{}", to_json(&report)?);
    Ok(match (&report.syntax_error, &report.outcome) {
        (Some(_), _) => exit_codes::SYNTAX_ERROR,
        (None, Some(outcome)) if !outcome.is_converged() => exit_codes::NOT_CONVERGED,
        _ => exit_codes::OK,
    })
}

struct RunArgs<'a> {
    spec: &'a Path,
    oracle: &'a Path,
    candidate: Option<&'a Path>,
    report: Option<&'a Path>,
    output: Option<&'a Path>,
}

fn cmd_run(cfg: &RefinerConfig, args: &RunArgs<'_>) -> Result<i32> {
    let specification = read(args.spec)?;
    let oracle = read(args.oracle)?;
    let initial = args.candidate.map(read).transpose()?;

    let sandbox = docker_sandbox(cfg)?;
    let generator = PromptedGenerator::new(
        CommandBackend::new(&cfg.generator),
        cfg.generator.prompt_budget_bytes,
    );
    let analyzer = PythonAnalyzer::new(cfg.analysis.clone());
    let refiner = Refiner {
        sandbox: &sandbox,
        generator: &generator,
        analyzer: &analyzer,
        config: &cfg.refine,
        weights: &cfg.reward,
    };
    let task = RefineTask {
        specification: &specification,
        oracle: &oracle,
        initial_candidate: initial.as_deref(),
    };

    let outcome = match refiner.run(&task, &CancelToken::new(), |record| {
        eprintln!(
            "iteration {}: {}/{} passed, {} ({:.1} reward)",
            record.index,
            record.outcome.passed,
            record.outcome.total,
            record.analysis.error_kind,
            record.reward.total
        );
    }) {
        Ok(outcome) => outcome,
        Err(RefineError::Cancelled) => {
            eprintln!("run cancelled before any candidate was executed");
            return Ok(exit_codes::CANCELLED);
        }
        Err(err) => return Err(err).context("refinement failed"),
    };

    if let Some(path) = args.output {
        fs::write(path, &outcome.best_code)
            .with_context(|| format!("write {}", path.display()))?;
    }
    let json = to_json(&outcome.state)?;
    match args.report {
        Some(path) => fs::write(path, json).with_context(|| format!("write {}", path.display()))?,
        None => println!("{json}"),
    }

    Ok(run_exit_code(outcome.state.stop.as_ref().map(|s| s.kind)))
}

/// Exit code of a finished `run`. Only the run timeout cancels a CLI run.
fn run_exit_code(stop: Option<StopKind>) -> i32 {
    match stop {
        Some(StopKind::Converged) => exit_codes::OK,
        Some(StopKind::Cancelled) => exit_codes::CANCELLED,
        _ => exit_codes::NOT_CONVERGED,
    }
}

fn cmd_gc(cfg: &RefinerConfig) -> Result<i32> {
    let sandbox = docker_sandbox(cfg)?;
    let removed = sandbox
        .collect_garbage()
        .context("collect leaked containers")?;
    println!("{removed}");
    Ok(exit_codes::OK)
}

fn docker_sandbox(cfg: &RefinerConfig) -> Result<Sandbox> {
    Sandbox::new(Box::new(DockerBackend::new(cfg.sandbox.clone())), &cfg.sandbox)
        .context("start sandbox")
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    Ok(payload)
}
