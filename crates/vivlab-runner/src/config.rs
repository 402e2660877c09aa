use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "vivlab.yaml";

/// How a preprocessing solver is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverFamily {
    /// Writes the vivified CNF to stdout; timing is read from that output.
    Pmc,
    /// Minisat/Glucose descendants: `-pre -dimacs=<out>`, timing in an aux log.
    #[default]
    Glucose,
}

fn sat_exit_codes() -> Vec<i32> {
    vec![0, 10, 20]
}

fn zero_exit_code() -> Vec<i32> {
    vec![0]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub family: SolverFamily,
    #[serde(default = "sat_exit_codes")]
    pub exit_codes: Vec<i32>,
}

impl SolverSpec {
    pub fn new(path: impl Into<PathBuf>, family: SolverFamily) -> Self {
        SolverSpec {
            path: path.into(),
            family,
            exit_codes: sat_exit_codes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub path: PathBuf,
    #[serde(default = "zero_exit_code")]
    pub exit_codes: Vec<i32>,
}

impl ToolSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ToolSpec {
            path: path.into(),
            exit_codes: zero_exit_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneSpec {
    pub path: PathBuf,
    #[serde(default = "zero_exit_code")]
    pub exit_codes: Vec<i32>,
    #[serde(default = "default_backbone_cnf")]
    pub cnf_name: String,
    #[serde(default = "default_backbone_stats")]
    pub stats_name: String,
}

fn default_backbone_cnf() -> String {
    "backbone.cnf".to_string()
}

fn default_backbone_stats() -> String {
    "statistics.txt".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub model_counter: ToolSpec,
    pub compiler: ToolSpec,
    pub ddnnf_counter: ToolSpec,
    pub backbone: BackboneSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPaths {
    pub examples_dir: PathBuf,
    pub results_dir: PathBuf,
}

/// Per-stage bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub model_count: u64,
    pub preprocess: u64,
    pub compile: u64,
    pub ddnnf_count: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            model_count: 1200,
            preprocess: 1200,
            compile: 1200,
            ddnnf_count: 600,
        }
    }
}

impl Timeouts {
    /// A zero bound would kill every tool on spawn.
    pub fn validate(&self) -> Result<()> {
        let bounds = [
            ("model_count", self.model_count),
            ("preprocess", self.preprocess),
            ("compile", self.compile),
            ("ddnnf_count", self.ddnnf_count),
        ];
        for (name, secs) in bounds {
            if secs == 0 {
                return Err(anyhow!("config_invalid: timeouts.{} must be at least 1 second", name));
            }
        }
        Ok(())
    }

    pub fn model_count(&self) -> Duration {
        Duration::from_secs(self.model_count)
    }

    pub fn preprocess(&self) -> Duration {
        Duration::from_secs(self.preprocess)
    }

    pub fn compile(&self) -> Duration {
        Duration::from_secs(self.compile)
    }

    pub fn ddnnf_count(&self) -> Duration {
        Duration::from_secs(self.ddnnf_count)
    }
}

/// Fixed tuning flags handed to the knowledge compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerFlags {
    pub dt_count: u32,
    pub smooth_all: bool,
    pub count: bool,
    pub cache_size: u32,
    pub nnf_block_size: u32,
}

impl Default for CompilerFlags {
    fn default() -> Self {
        CompilerFlags {
            dt_count: 50,
            smooth_all: true,
            count: true,
            cache_size: 10,
            nnf_block_size: 50,
        }
    }
}

impl CompilerFlags {
    pub fn to_args(&self, input: &Path) -> Vec<String> {
        let mut args = vec![
            "-in".to_string(),
            input.to_string_lossy().into_owned(),
            "-dt_count".to_string(),
            self.dt_count.to_string(),
        ];
        if self.smooth_all {
            args.push("-smooth_all".to_string());
        }
        if self.count {
            args.push("-count".to_string());
        }
        args.extend([
            "-cache_size".to_string(),
            self.cache_size.to_string(),
            "-nnf_block_size".to_string(),
            self.nnf_block_size.to_string(),
        ]);
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub paths: DataPaths,
    pub tools: ToolPaths,
    pub solvers: BTreeMap<String, SolverSpec>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub compiler: CompilerFlags,
    #[serde(default)]
    pub var_elimination: bool,
    #[serde(default)]
    pub retain_intermediates: bool,
}

/// On-disk shape: every section optional, missing ones fall back to the
/// default layout rooted at the config file's directory.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    paths: Option<DataPaths>,
    #[serde(default)]
    tools: Option<ToolPaths>,
    #[serde(default)]
    solvers: Option<BTreeMap<String, SolverSpec>>,
    #[serde(default)]
    timeouts: Option<Timeouts>,
    #[serde(default)]
    compiler: Option<CompilerFlags>,
    #[serde(default)]
    var_elimination: Option<bool>,
    #[serde(default)]
    retain_intermediates: Option<bool>,
}

impl BenchConfig {
    /// The directory layout of the original scripts: `data/` and `programs/`
    /// side by side under `base`.
    pub fn default_for_root(base: &Path) -> Self {
        let data = base.join("data");
        let programs = base.join("programs");
        let glucose_like = |dir: &str| {
            SolverSpec::new(
                programs.join(dir).join("simp").join("glucose"),
                SolverFamily::Glucose,
            )
        };
        let mut solvers = BTreeMap::new();
        solvers.insert(
            "pmc".to_string(),
            SolverSpec::new(programs.join("pmc").join("pmc"), SolverFamily::Pmc),
        );
        solvers.insert("maple".to_string(), glucose_like("Maple+"));
        solvers.insert("mapleLRB".to_string(), glucose_like("MapleLRB+"));
        solvers.insert("glucose+".to_string(), glucose_like("Glucose+"));
        solvers.insert("comsps".to_string(), glucose_like("COMSPS+"));

        BenchConfig {
            paths: DataPaths {
                examples_dir: data.join("CNF_EXAMPLES"),
                results_dir: data.join("SAT_RESULTS"),
            },
            tools: ToolPaths {
                model_counter: ToolSpec::new(programs.join("d4").join("d4")),
                compiler: ToolSpec::new(programs.join("c2d").join("c2d")),
                ddnnf_counter: ToolSpec::new(programs.join("dDNNFreasoner").join("query-dnnf")),
                backbone: BackboneSpec {
                    path: programs.join("cadiback").join("cadiback"),
                    exit_codes: zero_exit_code(),
                    cnf_name: default_backbone_cnf(),
                    stats_name: default_backbone_stats(),
                },
            },
            solvers,
            timeouts: Timeouts::default(),
            compiler: CompilerFlags::default(),
            var_elimination: false,
            retain_intermediates: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("config_unreadable: {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Self::from_yaml_str(&raw, base)
            .with_context(|| format!("config_invalid: {}", path.display()))
    }

    /// Loads `path` when it exists, otherwise the default layout rooted at `fallback_root`.
    pub fn load_or_default(path: &Path, fallback_root: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default_for_root(fallback_root))
        }
    }

    pub fn from_yaml_str(raw: &str, base: &Path) -> Result<Self> {
        let parsed: RawConfig = if raw.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        let defaults = Self::default_for_root(base);
        let mut cfg = BenchConfig {
            paths: parsed.paths.unwrap_or(defaults.paths),
            tools: parsed.tools.unwrap_or(defaults.tools),
            solvers: parsed.solvers.unwrap_or(defaults.solvers),
            timeouts: parsed.timeouts.unwrap_or_default(),
            compiler: parsed.compiler.unwrap_or_default(),
            var_elimination: parsed.var_elimination.unwrap_or(false),
            retain_intermediates: parsed.retain_intermediates.unwrap_or(false),
        };
        cfg.resolve_relative_to(base);
        cfg.timeouts.validate()?;
        if cfg.solvers.is_empty() {
            return Err(anyhow!("config_invalid: no solvers configured"));
        }
        Ok(cfg)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.paths.examples_dir);
        fix(&mut self.paths.results_dir);
        fix(&mut self.tools.model_counter.path);
        fix(&mut self.tools.compiler.path);
        fix(&mut self.tools.ddnnf_counter.path);
        fix(&mut self.tools.backbone.path);
        for spec in self.solvers.values_mut() {
            fix(&mut spec.path);
        }
    }

    pub fn solver(&self, name: &str) -> Result<&SolverSpec> {
        self.solvers.get(name).ok_or_else(|| {
            anyhow!(
                "unknown_solver: {} (configured: {})",
                name,
                self.solvers.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Lists everything the pipeline would need but cannot find.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.paths.examples_dir.is_dir() {
            problems.push(format!(
                "examples_dir missing: {}",
                self.paths.examples_dir.display()
            ));
        }
        let tools = [
            ("model_counter", &self.tools.model_counter.path),
            ("compiler", &self.tools.compiler.path),
            ("ddnnf_counter", &self.tools.ddnnf_counter.path),
            ("backbone", &self.tools.backbone.path),
        ];
        for (name, path) in tools {
            if !path.is_file() {
                problems.push(format!("{} not found: {}", name, path.display()));
            }
        }
        for (name, spec) in &self.solvers {
            if !spec.path.is_file() {
                problems.push(format!("solver {} not found: {}", name, spec.path.display()));
            }
        }
        problems
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_legacy_layout() {
        let cfg = BenchConfig::from_yaml_str("", Path::new("/srv/tfm")).expect("parse");
        assert_eq!(
            cfg.paths.examples_dir,
            PathBuf::from("/srv/tfm/data/CNF_EXAMPLES")
        );
        assert_eq!(
            cfg.paths.results_dir,
            PathBuf::from("/srv/tfm/data/SAT_RESULTS")
        );
        assert_eq!(cfg.solvers.len(), 5);
        assert_eq!(cfg.solvers["pmc"].family, SolverFamily::Pmc);
        assert_eq!(cfg.solvers["maple"].family, SolverFamily::Glucose);
        assert_eq!(cfg.timeouts.compile, 1200);
        assert!(!cfg.retain_intermediates);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let yaml = r#"
paths:
  examples_dir: cnf
  results_dir: /abs/results
solvers:
  mine:
    path: bin/solver
    family: pmc
timeouts:
  compile: 5
retain_intermediates: true
"#;
        let cfg = BenchConfig::from_yaml_str(yaml, Path::new("/home/u/bench")).expect("parse");
        assert_eq!(cfg.paths.examples_dir, PathBuf::from("/home/u/bench/cnf"));
        assert_eq!(cfg.paths.results_dir, PathBuf::from("/abs/results"));
        let mine = cfg.solver("mine").expect("solver");
        assert_eq!(mine.path, PathBuf::from("/home/u/bench/bin/solver"));
        assert_eq!(mine.exit_codes, vec![0, 10, 20]);
        assert_eq!(cfg.timeouts.compile, 5);
        assert_eq!(cfg.timeouts.model_count, 1200);
        assert!(cfg.retain_intermediates);
        assert!(cfg.solver("maple").is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = BenchConfig::from_yaml_str("timeouts:\n  compile: 0\n", Path::new("/x"))
            .expect_err("zero bound");
        assert!(err.to_string().contains("timeouts.compile"), "got {}", err);
        let cfg = BenchConfig::from_yaml_str("timeouts:\n  compile: 1\n", Path::new("/x"))
            .expect("one second is fine");
        assert_eq!(cfg.timeouts.compile(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(BenchConfig::from_yaml_str("bogus: 1\n", Path::new("/x")).is_err());
    }

    #[test]
    fn compiler_flags_render_in_tool_order() {
        let args = CompilerFlags::default().to_args(Path::new("/w/orig.cnf"));
        assert_eq!(
            args,
            vec![
                "-in",
                "/w/orig.cnf",
                "-dt_count",
                "50",
                "-smooth_all",
                "-count",
                "-cache_size",
                "10",
                "-nnf_block_size",
                "50"
            ]
        );
    }

    #[test]
    fn yaml_round_trip_keeps_solvers() {
        let cfg = BenchConfig::default_for_root(Path::new("/b"));
        let text = cfg.to_yaml().expect("yaml");
        let again = BenchConfig::from_yaml_str(&text, Path::new("/elsewhere")).expect("parse");
        assert_eq!(cfg, again);
    }
}
