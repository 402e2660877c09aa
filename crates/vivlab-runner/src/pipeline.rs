use crate::config::{BenchConfig, SolverFamily};
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{CommandSpec, ProcessExecutor, StageExecutor, StageOutcome};
use crate::extract::{MetricKind, ModelCount, OutputParser, PatternParser, Scalar};
use crate::formula::Formula;
use crate::identity::{ArtifactPaths, RunContext, RunToken};
use crate::record::{Field, MetricRecord};
use crate::technique::{Technique, TechniqueSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stages of one run, in execution order. Every run walks all of them; a
/// failed stage only turns its dependents into no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    CountOrig,
    Preprocess,
    CountPrep,
    Compare,
    CompileOrig,
    CompilePrep,
    CompileCompare,
    Done,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::Init => Stage::CountOrig,
            Stage::CountOrig => Stage::Preprocess,
            Stage::Preprocess => Stage::CountPrep,
            Stage::CountPrep => Stage::Compare,
            Stage::Compare => Stage::CompileOrig,
            Stage::CompileOrig => Stage::CompilePrep,
            Stage::CompilePrep => Stage::CompileCompare,
            Stage::CompileCompare => Stage::Done,
            Stage::Done => Stage::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::CountOrig => "count_orig",
            Stage::Preprocess => "preprocess",
            Stage::CountPrep => "count_prep",
            Stage::Compare => "compare",
            Stage::CompileOrig => "compile_orig",
            Stage::CompilePrep => "compile_prep",
            Stage::CompileCompare => "compile_compare",
            Stage::Done => "done",
        }
    }
}

/// One external invocation as it happened, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTrace {
    pub step: &'static str,
    pub outcome: &'static str,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub tag: String,
    pub record_path: PathBuf,
    pub record: MetricRecord,
    /// dDNNF byproducts moved into the results dir.
    pub retained: Vec<PathBuf>,
    /// Whether both dDNNF counts agree with each other and with the CNF
    /// counts; `None` when there was nothing to compare.
    pub ddnnf_consistent: Option<bool>,
    pub trace: Vec<StageTrace>,
    pub work_dir: Option<PathBuf>,
}

struct RunState {
    paths: ArtifactPaths,
    record: MetricRecord,
    orig_count: Option<ModelCount>,
    prep_count: Option<ModelCount>,
    /// Final preprocessed CNF; `None` once any technique failed.
    prepared: Option<PathBuf>,
    nnf_orig: Option<PathBuf>,
    nnf_prep: Option<PathBuf>,
    ddnnf_consistent: Option<bool>,
    trace: Vec<StageTrace>,
}

enum TechniqueStep {
    Done {
        output: PathBuf,
        seconds: Option<f64>,
    },
    Failed(Field),
}

/// Removes the run's work directory when the run ends, however it ends.
struct WorkDirScope {
    dir: PathBuf,
    retain: bool,
}

impl Drop for WorkDirScope {
    fn drop(&mut self) {
        if self.retain {
            debug!(dir = %self.dir.display(), "retaining intermediates");
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "intermediates removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "failed to remove intermediates"),
        }
    }
}

/// Runs the measurement sequence for one (solver, formula, techniques) tuple.
/// Configuration, the instance token, the process boundary and the output
/// parsers are all injected, so tests run against temp dirs and canned text.
pub struct Pipeline {
    config: Arc<BenchConfig>,
    instance: String,
    executor: Arc<dyn StageExecutor>,
    parser: Arc<dyn OutputParser>,
}

impl Pipeline {
    pub fn new(config: BenchConfig, instance: impl Into<String>) -> Self {
        Pipeline {
            config: Arc::new(config),
            instance: instance.into(),
            executor: Arc::new(ProcessExecutor),
            parser: Arc::new(PatternParser),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn context(
        &self,
        solver: &str,
        formula: &Path,
        techniques: TechniqueSet,
    ) -> PipelineResult<RunContext> {
        self.context_for_instance(solver, formula, techniques, &self.instance)
    }

    pub fn context_for_instance(
        &self,
        solver: &str,
        formula: &Path,
        techniques: TechniqueSet,
        instance: &str,
    ) -> PipelineResult<RunContext> {
        let spec = self
            .config
            .solver(solver)
            .map_err(|e| PipelineError::InvalidRun(e.to_string()))?;
        RunContext::new(solver, spec.clone(), formula, techniques, RunToken::new(instance))
    }

    /// Walks every stage and appends the record. Only filesystem problems
    /// with the run's own files come back as `Err`.
    pub fn run(&self, ctx: &RunContext) -> PipelineResult<RunReport> {
        let paths = ctx.artifacts(&self.config.paths.results_dir);
        fs::create_dir_all(&paths.work_dir).map_err(|e| PipelineError::fs(&paths.work_dir, e))?;
        let _scope = WorkDirScope {
            dir: paths.work_dir.clone(),
            retain: self.config.retain_intermediates,
        };
        info!(
            tag = %paths.tag,
            solver = %ctx.solver_name,
            example = %ctx.example(),
            techniques = %ctx.techniques,
            "run started"
        );

        let mut state = RunState {
            record: MetricRecord::new(
                &ctx.solver_name,
                &ctx.example(),
                ctx.techniques.contains(Technique::Vivification),
                ctx.techniques.contains(Technique::Backbone),
            ),
            paths,
            orig_count: None,
            prep_count: None,
            prepared: None,
            nnf_orig: None,
            nnf_prep: None,
            ddnnf_consistent: None,
            trace: Vec::new(),
        };

        let mut stage = Stage::Init;
        while stage != Stage::Done {
            self.step(stage, ctx, &mut state)?;
            stage = stage.next();
        }

        state.record.append_to(&state.paths.record)?;
        info!(tag = %state.paths.tag, record = %state.paths.record.display(), "run finished");

        let retained = [state.nnf_orig.clone(), state.nnf_prep.clone()]
            .into_iter()
            .flatten()
            .collect();
        Ok(RunReport {
            tag: state.paths.tag.clone(),
            record_path: state.paths.record.clone(),
            record: state.record,
            retained,
            ddnnf_consistent: state.ddnnf_consistent,
            trace: state.trace,
            work_dir: self
                .config
                .retain_intermediates
                .then(|| state.paths.work_dir.clone()),
        })
    }

    fn step(&self, stage: Stage, ctx: &RunContext, state: &mut RunState) -> PipelineResult<()> {
        debug!(tag = %state.paths.tag, stage = stage.as_str(), "entering stage");
        match stage {
            Stage::Init => {
                let formula = Formula::load(&ctx.formula)?;
                if formula.header.is_none() {
                    warn!(formula = %ctx.formula.display(), "no `p cnf` header found");
                }
                state.record.vars_orig = formula.variable_count().into();
                state.record.clauses_orig = formula.clause_count().into();
                fs::copy(&ctx.formula, &state.paths.staged_formula)
                    .map_err(|e| PipelineError::fs(&state.paths.staged_formula, e))?;
            }
            Stage::CountOrig => {
                let input = state.paths.staged_formula.clone();
                let log = state.paths.count_orig_log.clone();
                let (field, count) = self.count_models(state, "count_orig", &input, &log);
                state.record.worlds_orig = field;
                state.orig_count = count;
            }
            Stage::Preprocess => self.preprocess(ctx, state)?,
            Stage::CountPrep => match state.prepared.clone() {
                Some(prepared) => {
                    match Formula::load(&prepared) {
                        Ok(formula) => {
                            state.record.vars_prep = formula.variable_count().into();
                            state.record.clauses_prep = formula.clause_count().into();
                        }
                        Err(e) => warn!(error = %e, "preprocessed formula unreadable"),
                    }
                    let log = state.paths.count_prep_log.clone();
                    let (field, count) = self.count_models(state, "count_prep", &prepared, &log);
                    state.record.worlds_prep = field;
                    state.prep_count = count;
                }
                None => debug!(tag = %state.paths.tag, "count_prep skipped: no valid preprocessed formula"),
            },
            Stage::Compare => {
                let same = match (&state.orig_count, &state.prep_count) {
                    (Some(orig), Some(prep)) => {
                        if orig != prep {
                            warn!(
                                tag = %state.paths.tag,
                                orig = %orig,
                                prep = %prep,
                                "model count changed by preprocessing"
                            );
                        }
                        orig == prep
                    }
                    _ => false,
                };
                state.record.same_worlds = Field::Bool(same);
            }
            Stage::CompileOrig => {
                let input = state.paths.staged_formula.clone();
                let log = state.paths.compile_orig_log.clone();
                let target = state.paths.nnf_orig.clone();
                let (field, nnf) = self.compile(state, "compile_orig", &input, &log, &target)?;
                state.record.compile_time_orig = field;
                state.nnf_orig = nnf;
            }
            Stage::CompilePrep => match state.prepared.clone() {
                Some(prepared) => {
                    let log = state.paths.compile_prep_log.clone();
                    let target = state.paths.nnf_prep.clone();
                    let (field, nnf) =
                        self.compile(state, "compile_prep", &prepared, &log, &target)?;
                    state.record.compile_time_prep = field;
                    state.nnf_prep = nnf;
                }
                None => debug!(tag = %state.paths.tag, "compile_prep skipped: no valid preprocessed formula"),
            },
            Stage::CompileCompare => self.compare_compiled(state),
            Stage::Done => {}
        }
        Ok(())
    }

    fn invoke(
        &self,
        state: &mut RunState,
        step: &'static str,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> StageOutcome {
        info!(tag = %state.paths.tag, step, command = %spec.display(), "stage started");
        let started = Instant::now();
        let outcome = self.executor.execute(spec, timeout);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            StageOutcome::Ok(_) => info!(tag = %state.paths.tag, step, elapsed_ms, "stage ok"),
            StageOutcome::Timeout => warn!(
                tag = %state.paths.tag,
                step,
                timeout_secs = timeout.as_secs(),
                "stage timed out"
            ),
            StageOutcome::Aborted(reason) => {
                warn!(tag = %state.paths.tag, step, %reason, "stage aborted")
            }
        }
        state.trace.push(StageTrace {
            step,
            outcome: outcome.kind(),
            elapsed_ms,
        });
        outcome
    }

    fn scalar(&self, kind: MetricKind, text: &str, step: &str) -> Option<Scalar> {
        let value = self.parser.extract(kind, text);
        if value.is_none() {
            warn!(step, ?kind, "expected metric not found in tool output");
        }
        value
    }

    fn count_models(
        &self,
        state: &mut RunState,
        step: &'static str,
        input: &Path,
        log: &Path,
    ) -> (Field, Option<ModelCount>) {
        let tool = &self.config.tools.model_counter;
        let spec = CommandSpec::new(&tool.path, log)
            .arg("-mc")
            .path_arg(input)
            .exit_codes(&tool.exit_codes);
        match self.invoke(state, step, &spec, self.config.timeouts.model_count()) {
            StageOutcome::Ok(text) => {
                match self
                    .scalar(MetricKind::ModelCount, &text, step)
                    .and_then(Scalar::into_count)
                {
                    Some(count) => (Field::Count(count.clone()), Some(count)),
                    None => (Field::Missing, None),
                }
            }
            other => (Field::failure(&other), None),
        }
    }

    fn preprocess(&self, ctx: &RunContext, state: &mut RunState) -> PipelineResult<()> {
        let mut input = state.paths.staged_formula.clone();
        let mut total = Some(0.0_f64);
        for technique in ctx.techniques.iter() {
            let step = match technique {
                Technique::Vivification => self.vivify(ctx, state, &input),
                Technique::Backbone => self.extract_backbone(state, &input)?,
            };
            match step {
                TechniqueStep::Done { output, seconds } => {
                    total = total.zip(seconds).map(|(t, s)| t + s);
                    input = output;
                }
                TechniqueStep::Failed(field) => {
                    warn!(
                        tag = %state.paths.tag,
                        %technique,
                        "preprocessing failed; dependent stages will be skipped"
                    );
                    state.record.preprocess_time = field;
                    state.prepared = None;
                    return Ok(());
                }
            }
        }
        state.record.preprocess_time = total.map(Field::Seconds).unwrap_or(Field::Missing);
        state.prepared = Some(input);
        Ok(())
    }

    fn vivify(&self, ctx: &RunContext, state: &mut RunState, input: &Path) -> TechniqueStep {
        let solver = &ctx.solver;
        let output = state.paths.vivified_cnf();
        let spec = match solver.family {
            SolverFamily::Pmc => CommandSpec::new(&solver.path, &output)
                .args(["-verb=1", "-vivification"])
                .path_arg(input)
                .stdout_only(),
            SolverFamily::Glucose => {
                let elimination = if self.config.var_elimination {
                    "-elim"
                } else {
                    "-no-elim"
                };
                CommandSpec::new(&solver.path, &state.paths.vivify_aux_log())
                    .args([elimination, "-pre", "-verb=2"])
                    .arg(format!("-dimacs={}", output.display()))
                    .path_arg(input)
            }
        }
        .exit_codes(&solver.exit_codes);

        let text = match self.invoke(state, "vivify", &spec, self.config.timeouts.preprocess()) {
            StageOutcome::Ok(text) => text,
            other => return TechniqueStep::Failed(Field::failure(&other)),
        };
        if !output.is_file() {
            warn!(output = %output.display(), "vivifier exited cleanly but wrote no formula");
            return TechniqueStep::Failed(Field::Abort);
        }
        TechniqueStep::Done {
            seconds: self
                .scalar(MetricKind::PreprocessTime, &text, "vivify")
                .and_then(Scalar::into_seconds),
            output,
        }
    }

    fn extract_backbone(&self, state: &mut RunState, input: &Path) -> PipelineResult<TechniqueStep> {
        let tool = &self.config.tools.backbone;
        let dir = state.paths.backbone_dir();
        fs::create_dir_all(&dir).map_err(|e| PipelineError::fs(&dir, e))?;
        let spec = CommandSpec::new(&tool.path, &state.paths.backbone_log())
            .path_arg(input)
            .path_arg(&dir)
            .exit_codes(&tool.exit_codes);
        let outcome = self.invoke(state, "backbone", &spec, self.config.timeouts.preprocess());
        if !outcome.is_ok() {
            return Ok(TechniqueStep::Failed(Field::failure(&outcome)));
        }
        let output = dir.join(&tool.cnf_name);
        if !output.is_file() {
            warn!(output = %output.display(), "backbone extractor wrote no formula");
            return Ok(TechniqueStep::Failed(Field::Abort));
        }
        let seconds = match fs::read_to_string(dir.join(&tool.stats_name)) {
            Ok(stats) => self
                .scalar(MetricKind::BackboneTime, &stats, "backbone")
                .and_then(Scalar::into_seconds),
            Err(e) => {
                warn!(error = %e, "backbone statistics unreadable");
                None
            }
        };
        Ok(TechniqueStep::Done { output, seconds })
    }

    /// Compiles `input` and moves the `<input>.nnf` byproduct to `target`.
    fn compile(
        &self,
        state: &mut RunState,
        step: &'static str,
        input: &Path,
        log: &Path,
        target: &Path,
    ) -> PipelineResult<(Field, Option<PathBuf>)> {
        let tool = &self.config.tools.compiler;
        let spec = CommandSpec::new(&tool.path, log)
            .args(self.config.compiler.to_args(input))
            .exit_codes(&tool.exit_codes);
        let text = match self.invoke(state, step, &spec, self.config.timeouts.compile()) {
            StageOutcome::Ok(text) => text,
            other => return Ok((Field::failure(&other), None)),
        };
        let byproduct = nnf_byproduct(input);
        if !byproduct.is_file() {
            warn!(byproduct = %byproduct.display(), "compiler wrote no dDNNF");
            return Ok((Field::Abort, None));
        }
        fs::rename(&byproduct, target).map_err(|e| PipelineError::fs(target, e))?;
        let field = self
            .scalar(MetricKind::CompileTime, &text, step)
            .and_then(Scalar::into_seconds)
            .map(Field::Seconds)
            .unwrap_or(Field::Missing);
        Ok((field, Some(target.to_path_buf())))
    }

    fn count_ddnnf(
        &self,
        state: &mut RunState,
        step: &'static str,
        nnf: &Path,
        log: &Path,
    ) -> (Field, Option<ModelCount>) {
        let tool = &self.config.tools.ddnnf_counter;
        let spec = CommandSpec::new(&tool.path, log)
            .stdin(format!("load {}\nmc\nq\n", nnf.display()))
            .stdout_only()
            .exit_codes(&tool.exit_codes);
        match self.invoke(state, step, &spec, self.config.timeouts.ddnnf_count()) {
            StageOutcome::Ok(text) => {
                match self
                    .scalar(MetricKind::DdnnfCount, &text, step)
                    .and_then(Scalar::into_count)
                {
                    Some(count) => (Field::Count(count.clone()), Some(count)),
                    None => (Field::Missing, None),
                }
            }
            other => (Field::failure(&other), None),
        }
    }

    fn compare_compiled(&self, state: &mut RunState) {
        let (orig, prep) = match (state.nnf_orig.clone(), state.nnf_prep.clone()) {
            (Some(orig), Some(prep)) => (orig, prep),
            _ => {
                debug!(tag = %state.paths.tag, "compile_compare skipped: a compilation failed");
                return;
            }
        };
        let log = state.paths.ddnnf_orig_log.clone();
        let (field, orig_count) = self.count_ddnnf(state, "ddnnf_count_orig", &orig, &log);
        state.record.worlds_orig_ddnnf = field;
        let log = state.paths.ddnnf_prep_log.clone();
        let (field, prep_count) = self.count_ddnnf(state, "ddnnf_count_prep", &prep, &log);
        state.record.worlds_prep_ddnnf = field;

        if let (Some(a), Some(b)) = (&orig_count, &prep_count) {
            let agrees_with_cnf = |ddnnf: &ModelCount, cnf: &Option<ModelCount>| {
                cnf.as_ref().map_or(true, |c| c == ddnnf)
            };
            let consistent =
                a == b && agrees_with_cnf(a, &state.orig_count) && agrees_with_cnf(b, &state.prep_count);
            if !consistent {
                warn!(
                    tag = %state.paths.tag,
                    orig_ddnnf = %a,
                    prep_ddnnf = %b,
                    "dDNNF counts disagree"
                );
            }
            state.ddnnf_consistent = Some(consistent);
        }
    }
}

fn nnf_byproduct(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".nnf");
    PathBuf::from(name)
}
