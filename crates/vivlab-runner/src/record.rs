use crate::error::{PipelineError, PipelineResult};
use crate::executor::StageOutcome;
use crate::extract::ModelCount;
use anyhow::{anyhow, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const FIELD_COUNT: usize = 16;

pub const HEADER: [&str; FIELD_COUNT] = [
    "solver",
    "example",
    "usedVivification",
    "usedBackbone",
    "varsOrig",
    "clausesOrig",
    "worldsOrig",
    "preprocessTimeSec",
    "varsPrep",
    "clausesPrep",
    "worldsPrep",
    "sameWorlds",
    "compileTimeOrig",
    "compileTimePrep",
    "worldsOrigDDNNF",
    "worldsPrepDDNNF",
];

pub const TIMEOUT_TOKEN: &str = "TIMEOUT";
pub const ABORT_TOKEN: &str = "ABORT";
pub const MISSING_TOKEN: &str = "-";

/// One column value. The three sentinels stand in for data a stage could
/// not produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Text(String),
    Int(u64),
    Count(ModelCount),
    Seconds(f64),
    Bool(bool),
    Timeout,
    Abort,
    Missing,
}

impl Field {
    /// Sentinel for a stage that did not produce a usable result.
    pub fn failure(outcome: &StageOutcome) -> Field {
        match outcome {
            StageOutcome::Timeout => Field::Timeout,
            StageOutcome::Aborted(_) => Field::Abort,
            StageOutcome::Ok(_) => Field::Missing,
        }
    }
}

impl From<Option<u64>> for Field {
    fn from(value: Option<u64>) -> Self {
        value.map(Field::Int).unwrap_or(Field::Missing)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Text(s) => {
                let cleaned: String = s
                    .chars()
                    .map(|c| if c == ';' || c.is_control() { '-' } else { c })
                    .collect();
                f.write_str(&cleaned)
            }
            Field::Int(n) => write!(f, "{}", n),
            Field::Count(c) => write!(f, "{}", c),
            Field::Seconds(s) => write!(f, "{:.3}", s),
            Field::Bool(true) => f.write_str("TRUE"),
            Field::Bool(false) => f.write_str("FALSE"),
            Field::Timeout => f.write_str(TIMEOUT_TOKEN),
            Field::Abort => f.write_str(ABORT_TOKEN),
            Field::Missing => f.write_str(MISSING_TOKEN),
        }
    }
}

/// Everything one run measured, in schema order. Fields a run never reached
/// keep their `Missing` default, so the arity never depends on how far it got.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub solver: Field,
    pub example: Field,
    pub used_vivification: Field,
    pub used_backbone: Field,
    pub vars_orig: Field,
    pub clauses_orig: Field,
    pub worlds_orig: Field,
    pub preprocess_time: Field,
    pub vars_prep: Field,
    pub clauses_prep: Field,
    pub worlds_prep: Field,
    pub same_worlds: Field,
    pub compile_time_orig: Field,
    pub compile_time_prep: Field,
    pub worlds_orig_ddnnf: Field,
    pub worlds_prep_ddnnf: Field,
}

impl MetricRecord {
    pub fn new(solver: &str, example: &str, vivification: bool, backbone: bool) -> Self {
        MetricRecord {
            solver: Field::Text(solver.to_string()),
            example: Field::Text(example.to_string()),
            used_vivification: Field::Bool(vivification),
            used_backbone: Field::Bool(backbone),
            vars_orig: Field::Missing,
            clauses_orig: Field::Missing,
            worlds_orig: Field::Missing,
            preprocess_time: Field::Missing,
            vars_prep: Field::Missing,
            clauses_prep: Field::Missing,
            worlds_prep: Field::Missing,
            same_worlds: Field::Bool(false),
            compile_time_orig: Field::Missing,
            compile_time_prep: Field::Missing,
            worlds_orig_ddnnf: Field::Missing,
            worlds_prep_ddnnf: Field::Missing,
        }
    }

    pub fn fields(&self) -> [&Field; FIELD_COUNT] {
        [
            &self.solver,
            &self.example,
            &self.used_vivification,
            &self.used_backbone,
            &self.vars_orig,
            &self.clauses_orig,
            &self.worlds_orig,
            &self.preprocess_time,
            &self.vars_prep,
            &self.clauses_prep,
            &self.worlds_prep,
            &self.same_worlds,
            &self.compile_time_orig,
            &self.compile_time_prep,
            &self.worlds_orig_ddnnf,
            &self.worlds_prep_ddnnf,
        ]
    }

    pub fn rendered(&self) -> Vec<String> {
        self.fields().iter().map(|f| f.to_string()).collect()
    }

    pub fn to_line(&self) -> String {
        let mut line = self.rendered().join(";");
        line.push('\n');
        line
    }

    /// Appends the record to the run's own log file.
    pub fn append_to(&self, path: &Path) -> PipelineResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::fs(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PipelineError::fs(path, e))?;
        file.write_all(self.to_line().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| PipelineError::fs(path, e))
    }
}

/// A record line read back from disk, still as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub values: Vec<String>,
}

impl RecordRow {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut values: Vec<String> = line.split(';').map(|s| s.trim().to_string()).collect();
        if values.len() == FIELD_COUNT + 1 && values.last().is_some_and(|v| v.is_empty()) {
            values.pop();
        }
        if values.len() != FIELD_COUNT {
            return Err(anyhow!(
                "record_arity_mismatch: expected {} fields, found {}",
                FIELD_COUNT,
                values.len()
            ));
        }
        Ok(RecordRow { values })
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        HEADER
            .iter()
            .position(|h| *h == column)
            .map(|i| self.values[i].as_str())
    }

    pub fn seconds(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(|v| v.parse().ok())
    }

    pub fn flag(&self, column: &str) -> bool {
        self.get(column) == Some("TRUE")
    }
}
