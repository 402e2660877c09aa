use crate::record::{RecordRow, TIMEOUT_TOKEN};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub solver: String,
    pub used_vivification: bool,
    pub used_backbone: bool,
    pub runs: usize,
    pub same_worlds: usize,
    pub timeouts: usize,
    pub median_preprocess_sec: Option<f64>,
    pub median_compile_orig_sec: Option<f64>,
    pub median_compile_prep_sec: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub results_dir: PathBuf,
    pub records: usize,
    pub skipped_lines: usize,
    pub groups: Vec<GroupSummary>,
}

/// Reads every record file directly inside `results_dir` and aggregates by
/// (solver, vivification, backbone).
pub fn summarize(results_dir: &Path) -> Result<Summary> {
    let mut files: Vec<PathBuf> = fs::read_dir(results_dir)
        .with_context(|| format!("results_dir_unreadable: {}", results_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "log"))
        .collect();
    files.sort();

    let mut rows = Vec::new();
    let mut skipped_lines = 0;
    for file in &files {
        let text = fs::read_to_string(file)
            .with_context(|| format!("record_unreadable: {}", file.display()))?;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match RecordRow::parse(line) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "skipping malformed record line");
                    skipped_lines += 1;
                }
            }
        }
    }

    Ok(Summary {
        results_dir: results_dir.to_path_buf(),
        records: rows.len(),
        skipped_lines,
        groups: summarize_rows(&rows),
    })
}

#[derive(Default)]
struct Accumulator {
    runs: usize,
    same_worlds: usize,
    timeouts: usize,
    preprocess: Vec<f64>,
    compile_orig: Vec<f64>,
    compile_prep: Vec<f64>,
}

pub fn summarize_rows(rows: &[RecordRow]) -> Vec<GroupSummary> {
    let mut groups: BTreeMap<(String, bool, bool), Accumulator> = BTreeMap::new();
    for row in rows {
        let key = (
            row.get("solver").unwrap_or_default().to_string(),
            row.flag("usedVivification"),
            row.flag("usedBackbone"),
        );
        let acc = groups.entry(key).or_default();
        acc.runs += 1;
        if row.flag("sameWorlds") {
            acc.same_worlds += 1;
        }
        if row.values.iter().any(|v| v == TIMEOUT_TOKEN) {
            acc.timeouts += 1;
        }
        acc.preprocess.extend(row.seconds("preprocessTimeSec"));
        acc.compile_orig.extend(row.seconds("compileTimeOrig"));
        acc.compile_prep.extend(row.seconds("compileTimePrep"));
    }

    groups
        .into_iter()
        .map(|((solver, viv, bb), mut acc)| GroupSummary {
            solver,
            used_vivification: viv,
            used_backbone: bb,
            runs: acc.runs,
            same_worlds: acc.same_worlds,
            timeouts: acc.timeouts,
            median_preprocess_sec: median(&mut acc.preprocess),
            median_compile_orig_sec: median(&mut acc.compile_orig),
            median_compile_prep_sec: median(&mut acc.compile_prep),
        })
        .collect()
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

impl Summary {
    pub fn render_table(&self) -> String {
        fn cell(v: Option<f64>) -> String {
            v.map(|s| format!("{:.3}", s)).unwrap_or_else(|| "-".to_string())
        }
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:>4} {:>3} {:>5} {:>5} {:>8} {:>10} {:>12} {:>12}",
            "solver", "viv", "bb", "runs", "same", "timeouts", "prep_med", "c2d_orig_med", "c2d_prep_med"
        );
        for g in &self.groups {
            let _ = writeln!(
                out,
                "{:<12} {:>4} {:>3} {:>5} {:>5} {:>8} {:>10} {:>12} {:>12}",
                g.solver,
                if g.used_vivification { "y" } else { "n" },
                if g.used_backbone { "y" } else { "n" },
                g.runs,
                g.same_worlds,
                g.timeouts,
                cell(g.median_preprocess_sec),
                cell(g.median_compile_orig_sec),
                cell(g.median_compile_prep_sec),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: Option<f64>, expected: f64) -> bool {
        actual.is_some_and(|v| (v - expected).abs() < 1e-9)
    }

    #[test]
    fn median_handles_odd_even_and_empty() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn records_are_grouped_and_sentinels_ignored_in_medians() {
        let dir = std::env::temp_dir().join(format!(
            "vivlab_summary_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(dir.join("work").join("leftover")).expect("dirs");
        fs::write(
            dir.join("pmc_v_1_a.cnf_x.log"),
            "pmc;a.cnf;TRUE;FALSE;3;2;5;0.100;3;1;5;TRUE;0.010;0.020;5;5\n",
        )
        .expect("a");
        fs::write(
            dir.join("pmc_v_1_b.cnf_x.log"),
            "pmc;b.cnf;TRUE;FALSE;3;2;TIMEOUT;0.300;3;1;7;FALSE;TIMEOUT;0.040;-;-\nnot;a;record\n",
        )
        .expect("b");
        fs::write(
            dir.join("maple_vb_1_a.cnf_x.log"),
            "maple;a.cnf;TRUE;TRUE;3;2;5;ABORT;-;-;-;FALSE;0.010;-;-;-;\n",
        )
        .expect("c");
        fs::write(dir.join("work").join("leftover").join("count_orig.log"), "s 5\n")
            .expect("capture");
        fs::write(dir.join("a.cnf_orig.nnf"), "nnf 0 0 0\n").expect("nnf");

        let summary = summarize(&dir).expect("summary");
        assert_eq!(summary.records, 3);
        assert_eq!(summary.skipped_lines, 1);
        assert_eq!(summary.groups.len(), 2);

        let maple = &summary.groups[0];
        assert_eq!(maple.solver, "maple");
        assert!(maple.used_backbone);
        assert_eq!(maple.runs, 1);
        assert_eq!(maple.median_preprocess_sec, None);
        assert_eq!(maple.median_compile_orig_sec, Some(0.01));

        let pmc = &summary.groups[1];
        assert_eq!(pmc.runs, 2);
        assert_eq!(pmc.same_worlds, 1);
        assert_eq!(pmc.timeouts, 1);
        assert!(close(pmc.median_preprocess_sec, 0.2));
        assert_eq!(pmc.median_compile_orig_sec, Some(0.01));
        assert!(close(pmc.median_compile_prep_sec, 0.03));

        let table = summary.render_table();
        assert_eq!(table.lines().count(), 3);
        assert!(table.lines().nth(2).expect("pmc row").starts_with("pmc"));
        let _ = fs::remove_dir_all(dir);
    }
}
