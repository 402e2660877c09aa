use crate::config::BenchConfig;
use crate::error::PipelineResult;
use crate::pipeline::{Pipeline, RunReport};
use crate::technique::{Technique, TechniqueSet};
use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One (solver, formula, technique set) combination of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub index: usize,
    pub solver: String,
    pub formula: PathBuf,
    pub techniques: TechniqueSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub solvers: Vec<String>,
    pub formulas: Vec<PathBuf>,
    pub technique_sets: Vec<TechniqueSet>,
}

impl BatchPlan {
    /// Empty selections fall back to every configured solver, every formula
    /// in the examples dir, and vivification alone.
    pub fn from_config(
        config: &BenchConfig,
        solvers: &[String],
        technique_sets: &[TechniqueSet],
    ) -> Result<Self> {
        let solvers: Vec<String> = if solvers.is_empty() {
            config.solvers.keys().cloned().collect()
        } else {
            for name in solvers {
                config.solver(name)?;
            }
            solvers.to_vec()
        };
        let technique_sets = if technique_sets.is_empty() {
            vec![TechniqueSet::new([Technique::Vivification])]
        } else {
            technique_sets.to_vec()
        };
        if let Some(empty) = technique_sets.iter().find(|s| s.is_empty()) {
            return Err(anyhow!("invalid_techniques: empty set {:?}", empty));
        }
        Ok(BatchPlan {
            solvers,
            formulas: discover_formulas(&config.paths.examples_dir)?,
            technique_sets,
        })
    }

    pub fn len(&self) -> usize {
        self.solvers.len() * self.formulas.len() * self.technique_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> Vec<BatchJob> {
        let mut jobs = Vec::with_capacity(self.len());
        for solver in &self.solvers {
            for formula in &self.formulas {
                for techniques in &self.technique_sets {
                    jobs.push(BatchJob {
                        index: jobs.len(),
                        solver: solver.clone(),
                        formula: formula.clone(),
                        techniques: techniques.clone(),
                    });
                }
            }
        }
        jobs
    }
}

/// Every regular file under `dir`, sorted by path. Hidden files and stray
/// `.nnf` byproducts are skipped.
pub fn discover_formulas(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow!("examples_dir_missing: {}", dir.display()));
    }
    let mut formulas = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("examples_dir_unreadable: {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || name.ends_with(".nnf") {
            continue;
        }
        formulas.push(entry.into_path());
    }
    formulas.sort();
    Ok(formulas)
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub job: BatchJob,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub completed: Vec<RunReport>,
    pub failures: Vec<BatchFailure>,
}

/// Runs every job of `plan`. With `jobs > 1` combinations run on a bounded
/// rayon pool; each gets instance `<pipeline instance>.<index>`. A fatal run
/// error is recorded and the batch moves on.
pub fn run_batch(pipeline: &Pipeline, plan: &BatchPlan, jobs: usize) -> Result<BatchReport> {
    let queue = plan.jobs();
    info!(combinations = queue.len(), jobs, "batch started");

    let outcomes: Vec<(BatchJob, PipelineResult<RunReport>)> = if jobs <= 1 || queue.len() <= 1 {
        queue.into_iter().map(|job| run_job(pipeline, job)).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs.min(queue.len()))
            .build()
            .context("thread_pool_failed")?;
        pool.install(|| {
            queue
                .into_par_iter()
                .map(|job| run_job(pipeline, job))
                .collect()
        })
    };

    let mut report = BatchReport::default();
    for (job, outcome) in outcomes {
        match outcome {
            Ok(run) => report.completed.push(run),
            Err(e) => {
                warn!(
                    solver = %job.solver,
                    formula = %job.formula.display(),
                    error = %e,
                    "run failed"
                );
                report.failures.push(BatchFailure {
                    job,
                    error: e.to_string(),
                });
            }
        }
    }
    info!(
        completed = report.completed.len(),
        failed = report.failures.len(),
        "batch finished"
    );
    Ok(report)
}

fn run_job(pipeline: &Pipeline, job: BatchJob) -> (BatchJob, PipelineResult<RunReport>) {
    let instance = format!("{}.{}", pipeline.instance(), job.index);
    let outcome = pipeline
        .context_for_instance(&job.solver, &job.formula, job.techniques.clone(), &instance)
        .and_then(|ctx| pipeline.run(&ctx));
    (job, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandSpec, StageExecutor, StageOutcome};
    use std::collections::BTreeSet;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    struct AlwaysTimeout;

    impl StageExecutor for AlwaysTimeout {
        fn execute(&self, _spec: &CommandSpec, _timeout: Duration) -> StageOutcome {
            StageOutcome::Timeout
        }
    }

    fn setup(label: &str) -> (PathBuf, BenchConfig) {
        let root = std::env::temp_dir().join(format!(
            "vivlab_batch_{}_{}_{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let config = BenchConfig::default_for_root(&root);
        let examples = &config.paths.examples_dir;
        fs::create_dir_all(examples.join("nested")).expect("examples dir");
        fs::write(examples.join("b.cnf"), "p cnf 1 1\n1 0\n").expect("b");
        fs::write(examples.join("a.cnf"), "p cnf 2 1\n1 2 0\n").expect("a");
        fs::write(examples.join("nested").join("c.cnf"), "p cnf 1 1\n-1 0\n").expect("c");
        fs::write(examples.join("a.cnf.nnf"), "nnf 0 0 0\n").expect("stale nnf");
        fs::write(examples.join(".hidden"), "").expect("hidden");
        (root, config)
    }

    #[test]
    fn formulas_are_discovered_sorted_and_filtered() {
        let (root, config) = setup("discover");
        let formulas = discover_formulas(&config.paths.examples_dir).expect("discover");
        let names: Vec<String> = formulas
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.cnf", "b.cnf", "c.cnf"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn default_plan_covers_every_solver_once_with_vivification() {
        let (root, config) = setup("plan");
        let plan = BatchPlan::from_config(&config, &[], &[]).expect("plan");
        assert_eq!(plan.solvers.len(), 5);
        assert_eq!(plan.len(), 15);
        let jobs = plan.jobs();
        assert_eq!(jobs.len(), 15);
        assert_eq!(jobs[0].solver, plan.solvers[0]);
        assert_eq!(jobs[0].techniques.code(), "v");
        assert!(jobs.iter().enumerate().all(|(i, j)| j.index == i));

        let err = BatchPlan::from_config(&config, &["nope".to_string()], &[]);
        assert!(err.is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn parallel_batch_gives_every_run_its_own_artifacts() {
        let (root, config) = setup("parallel");
        let sets: Vec<TechniqueSet> = vec!["v".parse().expect("v"), "vb".parse().expect("vb")];
        let plan = BatchPlan::from_config(&config, &["pmc".to_string()], &sets).expect("plan");
        assert_eq!(plan.len(), 6);

        let pipeline = Pipeline::new(config.clone(), "900").with_executor(Arc::new(AlwaysTimeout));
        let report = run_batch(&pipeline, &plan, 4).expect("batch");
        assert!(report.failures.is_empty());
        assert_eq!(report.completed.len(), 6);

        let records: BTreeSet<&PathBuf> = report.completed.iter().map(|r| &r.record_path).collect();
        assert_eq!(records.len(), 6);
        for run in &report.completed {
            let text = fs::read_to_string(&run.record_path).expect("record");
            assert_eq!(text.lines().count(), 1);
            assert!(run.tag.contains("_900."));
            assert_eq!(run.record.worlds_orig.to_string(), "TIMEOUT");
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn fatal_run_errors_are_counted_and_skipped() {
        let (root, config) = setup("failure");
        let plan = BatchPlan::from_config(&config, &["maple".to_string()], &[]).expect("plan");
        fs::remove_file(config.paths.examples_dir.join("b.cnf")).expect("remove b");

        let pipeline = Pipeline::new(config.clone(), "901").with_executor(Arc::new(AlwaysTimeout));
        let report = run_batch(&pipeline, &plan, 1).expect("batch");
        assert_eq!(report.completed.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].job.formula.ends_with("b.cnf"));
        assert!(report.failures[0].error.contains("filesystem_error"));
        let _ = fs::remove_dir_all(root);
    }
}
