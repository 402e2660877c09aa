use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vivlab_runner::{
    BatchPlan, BenchConfig, Pipeline, RunReport, Technique, TechniqueSet, DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(
    name = "vivlab",
    version = "0.3.0",
    about = "Measure how CNF preprocessing affects model counting and dDNNF compilation"
)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure one formula with one solver.
    Run {
        #[arg(long)]
        solver: String,
        #[arg(long)]
        example: PathBuf,
        #[arg(long)]
        vivification: bool,
        #[arg(long)]
        backbone: bool,
        #[arg(long)]
        retain: bool,
        #[arg(long)]
        json: bool,
    },
    /// Measure every solver x formula x technique set combination.
    Batch {
        #[arg(long = "solver")]
        solvers: Vec<String>,
        #[arg(long = "techniques")]
        techniques: Vec<String>,
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long)]
        retain: bool,
        #[arg(long)]
        json: bool,
    },
    Summarize {
        #[arg(long)]
        results: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Check {
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(&cli.config, cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload["ok"] == json!(false) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_config(path: &Path) -> Result<BenchConfig> {
    let cwd = std::env::current_dir()?;
    if !path.exists() {
        tracing::info!(config = %path.display(), "config not found; using default layout");
    }
    BenchConfig::load_or_default(path, &cwd)
}

fn run_command(config_path: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            solver,
            example,
            vivification,
            backbone,
            retain,
            json,
        } => {
            let mut config = load_config(config_path)?;
            config.retain_intermediates |= retain;
            let formula = resolve_example(&config, &example);
            let techniques = selected_techniques(vivification, backbone);
            let pipeline = Pipeline::new(config, std::process::id().to_string());
            let ctx = pipeline.context(&solver, &formula, techniques)?;
            let report = pipeline.run(&ctx)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_report_to_json(&report),
                })));
            }
            print_run_report(&report);
        }
        Commands::Batch {
            solvers,
            techniques,
            jobs,
            retain,
            json,
        } => {
            let mut config = load_config(config_path)?;
            config.retain_intermediates |= retain;
            let technique_sets = techniques
                .iter()
                .map(|raw| raw.parse::<TechniqueSet>())
                .collect::<Result<Vec<_>>>()?;
            let plan = BatchPlan::from_config(&config, &solvers, &technique_sets)?;
            let pipeline = Pipeline::new(config, std::process::id().to_string());
            let report = vivlab_runner::run_batch(&pipeline, &plan, jobs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "batch",
                    "combinations": plan.len(),
                    "completed": report.completed.iter().map(run_report_to_json).collect::<Vec<_>>(),
                    "failures": report.failures.iter().map(|f| json!({
                        "solver": f.job.solver,
                        "formula": f.job.formula.display().to_string(),
                        "techniques": f.job.techniques.code(),
                        "error": f.error,
                    })).collect::<Vec<_>>(),
                })));
            }
            println!("combinations: {}", plan.len());
            println!("completed: {}", report.completed.len());
            println!("failed: {}", report.failures.len());
            for run in &report.completed {
                println!("record: {}", run.record_path.display());
            }
            for failure in &report.failures {
                println!(
                    "failure: {} {} {}: {}",
                    failure.job.solver,
                    failure.job.techniques,
                    failure.job.formula.display(),
                    failure.error
                );
            }
        }
        Commands::Summarize { results, json } => {
            let results_dir = match results {
                Some(dir) => dir,
                None => load_config(config_path)?.paths.results_dir,
            };
            let summary = vivlab_runner::summarize(&results_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            println!("results_dir: {}", summary.results_dir.display());
            println!("records: {}", summary.records);
            println!("skipped_lines: {}", summary.skipped_lines);
            print!("{}", summary.render_table());
        }
        Commands::Check { json } => {
            let config = load_config(config_path)?;
            let problems = config.check();
            if json {
                return Ok(Some(json!({
                    "ok": problems.is_empty(),
                    "command": "check",
                    "config": config_path.display().to_string(),
                    "config_exists": config_path.exists(),
                    "solvers": config.solvers.keys().collect::<Vec<_>>(),
                    "problems": problems,
                })));
            }
            println!("config: {}", config_path.display());
            println!("config_exists: {}", config_path.exists());
            println!("examples_dir: {}", config.paths.examples_dir.display());
            println!("results_dir: {}", config.paths.results_dir.display());
            for (name, spec) in &config.solvers {
                println!("solver: {} ({})", name, spec.path.display());
            }
            for problem in &problems {
                println!("problem: {}", problem);
            }
            if !problems.is_empty() {
                return Err(anyhow!("check_failed: {} problem(s)", problems.len()));
            }
            println!("status: ok");
        }
        Commands::Init { force } => {
            if config_path.exists() && !force {
                return Err(anyhow!(
                    "config_exists: {} (use --force to overwrite)",
                    config_path.display()
                ));
            }
            let root = std::env::current_dir()?;
            let layout = BenchConfig::default_for_root(&root);
            for dir in [&layout.paths.examples_dir, &layout.paths.results_dir] {
                std::fs::create_dir_all(dir)?;
                println!("created: {}", dir.display());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            // Relative entries resolve against the config file's directory.
            let portable = BenchConfig::default_for_root(Path::new("."));
            std::fs::write(config_path, portable.to_yaml()?)?;
            println!("wrote: {}", config_path.display());
            println!("next: place tool binaries under programs/ or edit the tools section");
            println!("next: vivlab check");
        }
    }
    Ok(None)
}

/// Neither flag means vivification alone.
fn selected_techniques(vivification: bool, backbone: bool) -> TechniqueSet {
    let mut chosen = Vec::new();
    if vivification || !backbone {
        chosen.push(Technique::Vivification);
    }
    if backbone {
        chosen.push(Technique::Backbone);
    }
    TechniqueSet::new(chosen)
}

/// Bare names are looked up in the examples dir, anything else is a path.
fn resolve_example(config: &BenchConfig, example: &Path) -> PathBuf {
    if example.components().count() == 1 && !example.exists() {
        config.paths.examples_dir.join(example)
    } else {
        example.to_path_buf()
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Batch { json, .. }
        | Commands::Summarize { json, .. }
        | Commands::Check { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn run_report_to_json(report: &RunReport) -> Value {
    let columns: serde_json::Map<String, Value> = vivlab_runner::HEADER
        .iter()
        .zip(report.record.rendered())
        .map(|(name, value)| (name.to_string(), Value::String(value)))
        .collect();
    json!({
        "tag": report.tag,
        "record_path": report.record_path.display().to_string(),
        "record": columns,
        "retained": report.retained.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        "ddnnf_consistent": report.ddnnf_consistent,
        "work_dir": report.work_dir.as_ref().map(|p| p.display().to_string()),
        "stages": report.trace.iter().map(|t| json!({
            "step": t.step,
            "outcome": t.outcome,
            "elapsed_ms": t.elapsed_ms,
        })).collect::<Vec<_>>(),
    })
}

fn print_run_report(report: &RunReport) {
    println!("tag: {}", report.tag);
    println!("record: {}", report.record_path.display());
    for (name, value) in vivlab_runner::HEADER.iter().zip(report.record.rendered()) {
        println!("{}: {}", name, value);
    }
    for nnf in &report.retained {
        println!("retained: {}", nnf.display());
    }
    if let Some(consistent) = report.ddnnf_consistent {
        println!("ddnnf_consistent: {}", consistent);
    }
    if let Some(dir) = &report.work_dir {
        println!("work_dir: {}", dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_technique_flags_means_vivification() {
        assert_eq!(selected_techniques(false, false).code(), "v");
        assert_eq!(selected_techniques(false, true).code(), "b");
        assert_eq!(selected_techniques(true, true).code(), "vb");
    }

    #[test]
    fn bare_example_names_resolve_into_the_examples_dir() {
        let config = BenchConfig::default_for_root(Path::new("/srv/bench"));
        assert_eq!(
            resolve_example(&config, Path::new("no-such-file.cnf")),
            PathBuf::from("/srv/bench/data/CNF_EXAMPLES/no-such-file.cnf")
        );
        assert_eq!(
            resolve_example(&config, Path::new("/tmp/x.cnf")),
            PathBuf::from("/tmp/x.cnf")
        );
    }

    #[test]
    fn cli_parses_repeated_batch_options() {
        let cli = Cli::try_parse_from([
            "vivlab", "batch", "--solver", "pmc", "--solver", "maple", "--techniques", "vb",
            "--jobs", "4",
        ])
        .expect("parse");
        match cli.command {
            Commands::Batch {
                solvers,
                techniques,
                jobs,
                ..
            } => {
                assert_eq!(solvers, vec!["pmc", "maple"]);
                assert_eq!(techniques, vec!["vb"]);
                assert_eq!(jobs, 4);
            }
            _ => panic!("expected batch"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }
}
