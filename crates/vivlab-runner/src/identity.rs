use crate::config::SolverSpec;
use crate::error::{PipelineError, PipelineResult};
use crate::technique::TechniqueSet;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Process-unique part of a run name: an instance token (the pid, or
/// `pid.index` for in-process batch workers) plus the start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken {
    pub instance: String,
    pub started_at: DateTime<Local>,
}

impl RunToken {
    pub fn new(instance: impl Into<String>) -> Self {
        Self::at(instance, Local::now())
    }

    pub fn at(instance: impl Into<String>, started_at: DateTime<Local>) -> Self {
        RunToken {
            instance: instance.into(),
            started_at,
        }
    }

    pub fn timestamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M%S_%3f").to_string()
    }
}

/// Immutable descriptor of one (solver, formula, technique set) run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub solver_name: String,
    pub solver: SolverSpec,
    pub formula: PathBuf,
    pub techniques: TechniqueSet,
    pub token: RunToken,
}

impl RunContext {
    pub fn new(
        solver_name: &str,
        solver: SolverSpec,
        formula: &Path,
        techniques: TechniqueSet,
        token: RunToken,
    ) -> PipelineResult<Self> {
        if techniques.is_empty() {
            return Err(PipelineError::InvalidRun(
                "at least one preprocessing technique is required".to_string(),
            ));
        }
        if formula.file_name().is_none() {
            return Err(PipelineError::InvalidRun(format!(
                "formula path has no file name: {}",
                formula.display()
            )));
        }
        Ok(RunContext {
            solver_name: solver_name.to_string(),
            solver,
            formula: formula.to_path_buf(),
            techniques,
            token,
        })
    }

    /// File name of the formula as it appears in the `example` column.
    pub fn example(&self) -> String {
        self.formula
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn tag(&self) -> String {
        [
            sanitize_component(&self.solver_name),
            self.techniques.code(),
            sanitize_component(&self.token.instance),
            sanitize_component(&self.example()),
            self.token.timestamp(),
        ]
        .join("_")
    }

    pub fn artifacts(&self, results_dir: &Path) -> ArtifactPaths {
        ArtifactPaths::new(results_dir, &self.tag())
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == ';' || c.is_whitespace() || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}

/// Every path a run may touch. Intermediates live under `work_dir`; the
/// record and the relocated dDNNF byproducts sit directly in the results dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub tag: String,
    pub record: PathBuf,
    pub work_dir: PathBuf,
    pub staged_formula: PathBuf,
    pub count_orig_log: PathBuf,
    pub count_prep_log: PathBuf,
    pub compile_orig_log: PathBuf,
    pub compile_prep_log: PathBuf,
    pub ddnnf_orig_log: PathBuf,
    pub ddnnf_prep_log: PathBuf,
    pub nnf_orig: PathBuf,
    pub nnf_prep: PathBuf,
}

impl ArtifactPaths {
    pub fn new(results_dir: &Path, tag: &str) -> Self {
        let work_dir = results_dir.join("work").join(tag);
        ArtifactPaths {
            tag: tag.to_string(),
            record: results_dir.join(format!("{}.log", tag)),
            staged_formula: work_dir.join("orig.cnf"),
            count_orig_log: work_dir.join("count_orig.log"),
            count_prep_log: work_dir.join("count_prep.log"),
            compile_orig_log: work_dir.join("c2d_orig.log"),
            compile_prep_log: work_dir.join("c2d_prep.log"),
            ddnnf_orig_log: work_dir.join("ddnnf_orig.log"),
            ddnnf_prep_log: work_dir.join("ddnnf_prep.log"),
            nnf_orig: results_dir.join(format!("{}_orig.nnf", tag)),
            nnf_prep: results_dir.join(format!("{}_prep.nnf", tag)),
            work_dir,
        }
    }

    pub fn vivified_cnf(&self) -> PathBuf {
        self.work_dir.join("vivified.cnf")
    }

    pub fn vivify_aux_log(&self) -> PathBuf {
        self.work_dir.join("vivified.cnf_aux.log")
    }

    pub fn backbone_dir(&self) -> PathBuf {
        self.work_dir.join("backbone")
    }

    pub fn backbone_log(&self) -> PathBuf {
        self.work_dir.join("backbone.log")
    }
}
