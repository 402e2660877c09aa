//! Measurement pipeline for CNF preprocessing: count models, preprocess,
//! count again, compile both formulas to dDNNF, and emit one fixed-schema
//! record per run.

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod formula;
pub mod identity;
pub mod pipeline;
pub mod record;
pub mod summary;
pub mod technique;

pub use batch::{discover_formulas, run_batch, BatchFailure, BatchJob, BatchPlan, BatchReport};
pub use config::{BenchConfig, SolverFamily, SolverSpec, DEFAULT_CONFIG_FILE};
pub use error::{PipelineError, PipelineResult};
pub use executor::{CommandSpec, ProcessExecutor, StageExecutor, StageOutcome};
pub use extract::{MetricKind, ModelCount, OutputParser, PatternParser, Scalar};
pub use formula::{CnfHeader, Formula};
pub use identity::{ArtifactPaths, RunContext, RunToken};
pub use pipeline::{Pipeline, RunReport, Stage, StageTrace};
pub use record::{Field, MetricRecord, RecordRow, FIELD_COUNT, HEADER};
pub use summary::{summarize, GroupSummary, Summary};
pub use technique::{Technique, TechniqueSet};
