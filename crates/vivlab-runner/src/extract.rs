use std::fmt;

/// Exact model count kept as a normalized decimal string, so counts far past
/// `u128` still compare correctly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelCount(String);

impl ModelCount {
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = token.trim_start_matches('0');
        Some(ModelCount(if digits.is_empty() {
            "0".to_string()
        } else {
            digits.to_string()
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for ModelCount {
    fn from(n: u64) -> Self {
        ModelCount(n.to_string())
    }
}

impl fmt::Display for ModelCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which textual contract a captured output is read against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// `s <count>` line from the model counter.
    ModelCount,
    /// "CPU time" line; the 5th whitespace token is seconds.
    PreprocessTime,
    /// Every `time=<secs>` token in a backbone statistics file, summed.
    BackboneTime,
    /// `Total Time: <secs>s` line from the knowledge compiler.
    CompileTime,
    /// Bare count printed by the dDNNF reasoner after its `> ` prompts.
    DdnnfCount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Count(ModelCount),
    Seconds(f64),
}

impl Scalar {
    pub fn into_count(self) -> Option<ModelCount> {
        match self {
            Scalar::Count(c) => Some(c),
            Scalar::Seconds(_) => None,
        }
    }

    pub fn into_seconds(self) -> Option<f64> {
        match self {
            Scalar::Seconds(s) => Some(s),
            Scalar::Count(_) => None,
        }
    }
}

/// Turns captured tool output into a scalar. `None` means the expected line
/// was absent or malformed; it is never an error.
pub trait OutputParser: Send + Sync {
    fn extract(&self, kind: MetricKind, text: &str) -> Option<Scalar>;
}

/// The line patterns the supported tools actually print.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternParser;

impl OutputParser for PatternParser {
    fn extract(&self, kind: MetricKind, text: &str) -> Option<Scalar> {
        match kind {
            MetricKind::ModelCount => model_count(text).map(Scalar::Count),
            MetricKind::PreprocessTime => cpu_time(text).map(Scalar::Seconds),
            MetricKind::BackboneTime => summed_time_tokens(text).map(Scalar::Seconds),
            MetricKind::CompileTime => total_time(text).map(Scalar::Seconds),
            MetricKind::DdnnfCount => ddnnf_count(text).map(Scalar::Count),
        }
    }
}

fn seconds(token: &str) -> Option<f64> {
    let value: f64 = token.trim().trim_end_matches('s').parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

pub fn model_count(text: &str) -> Option<ModelCount> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next()? != "s" {
                return None;
            }
            tokens.last().and_then(ModelCount::parse)
        })
        .last()
}

pub fn cpu_time(text: &str) -> Option<f64> {
    text.lines()
        .filter(|line| line.contains("CPU time"))
        .filter_map(|line| line.split_whitespace().nth(4).and_then(seconds))
        .last()
}

pub fn summed_time_tokens(text: &str) -> Option<f64> {
    let values: Vec<f64> = text
        .split_whitespace()
        .filter_map(|token| token.strip_prefix("time="))
        .filter_map(seconds)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum())
    }
}

pub fn total_time(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| {
            let (_, rest) = line.split_once("Total Time")?;
            let rest = rest.trim_start().trim_start_matches(':').trim_start();
            let end = rest.find(|c: char| c == 's' || c.is_whitespace())?;
            seconds(&rest[..end])
        })
        .last()
}

pub fn ddnnf_count(text: &str) -> Option<ModelCount> {
    text.lines()
        .filter_map(|line| {
            let mut rest = line.trim();
            while let Some(stripped) = rest.strip_prefix('>') {
                rest = stripped.trim_start();
            }
            ModelCount::parse(rest)
        })
        .last()
}
