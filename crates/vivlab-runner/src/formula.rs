use crate::error::{PipelineError, PipelineResult};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Counts declared by a DIMACS `p cnf <vars> <clauses>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CnfHeader {
    pub variables: u64,
    pub clauses: u64,
}

/// A DIMACS CNF file on disk. The header is the only part of the file this
/// crate ever looks at.
#[derive(Debug, Clone)]
pub struct Formula {
    pub path: PathBuf,
    pub header: Option<CnfHeader>,
}

impl Formula {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let file = fs::File::open(path).map_err(|e| PipelineError::fs(path, e))?;
        let header = read_header(BufReader::new(file)).map_err(|e| PipelineError::fs(path, e))?;
        Ok(Formula {
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn variable_count(&self) -> Option<u64> {
        self.header.map(|h| h.variables)
    }

    pub fn clause_count(&self) -> Option<u64> {
        self.header.map(|h| h.clauses)
    }
}

/// Parses one header line. Anything that is not exactly `p cnf V C` is rejected.
pub fn parse_header_line(line: &str) -> Option<CnfHeader> {
    let mut parts = line.split_whitespace();
    if parts.next()? != "p" || parts.next()? != "cnf" {
        return None;
    }
    let variables = parts.next()?.parse().ok()?;
    let clauses = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(CnfHeader { variables, clauses })
}

/// Stops at the first header line; clause lines after it are never read.
/// Lines are raw bytes: only a candidate `p` line is decoded, so comments in
/// any encoding pass through.
pub fn read_header<R: BufRead>(mut reader: R) -> std::io::Result<Option<CnfHeader>> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'p') {
            if let Some(header) = parse_header_line(&String::from_utf8_lossy(&line)) {
                return Ok(Some(header));
            }
        }
    }
}

pub fn parse_header(text: &str) -> Option<CnfHeader> {
    text.lines()
        .filter(|l| l.trim_start().starts_with('p'))
        .find_map(parse_header_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_is_read_after_comments() {
        let text = "c generated\nc by hand\np cnf 3 2\n1 2 0\n-1 3 0\n";
        assert_eq!(
            parse_header(text),
            Some(CnfHeader {
                variables: 3,
                clauses: 2
            })
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(parse_header_line("p cnf 3"), None);
        assert_eq!(parse_header_line("p dnf 3 2"), None);
        assert_eq!(parse_header_line("p cnf x 2"), None);
        assert_eq!(parse_header_line("p cnf 3 2 7"), None);
        assert_eq!(parse_header("1 2 0\n-1 0\n"), None);
    }

    #[test]
    fn first_header_wins() {
        let text = "p cnf 4 1\n1 0\np cnf 9 9\n";
        assert_eq!(parse_header(text).map(|h| h.variables), Some(4));
    }

    #[test]
    fn load_reads_header_from_disk() {
        let dir = std::env::temp_dir().join(format!(
            "vivlab_formula_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("tiny.cnf");
        fs::write(&path, "p cnf 3 2\n1 2 0\n-1 3 0\n").expect("write formula");
        let formula = Formula::load(&path).expect("load");
        assert_eq!(formula.variable_count(), Some(3));
        assert_eq!(formula.clause_count(), Some(2));
        let missing = Formula::load(&dir.join("absent.cnf"));
        assert!(matches!(missing, Err(PipelineError::Filesystem { .. })));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn non_utf8_comments_do_not_hide_the_header() {
        let bytes: &[u8] = b"c autor: V\xEDctor\np cnf 3 2\n1 2 0\n-1 3 0\n";
        assert_eq!(
            read_header(bytes).expect("in-memory read"),
            Some(CnfHeader {
                variables: 3,
                clauses: 2
            })
        );
    }

    proptest! {
        #[test]
        fn header_parse_ignores_later_content(
            vars in 0u64..1_000_000,
            clauses in 0u64..1_000_000,
            body in proptest::collection::vec(
                proptest::collection::vec(-50i64..50, 0..6), 0..20),
        ) {
            let mut text = format!("c prop\np cnf {} {}\n", vars, clauses);
            for clause in body {
                for lit in clause {
                    text.push_str(&format!("{} ", lit));
                }
                text.push_str("0\n");
            }
            text.push_str("p cnf 1 1\n");
            prop_assert_eq!(
                parse_header(&text),
                Some(CnfHeader { variables: vars, clauses })
            );
            prop_assert_eq!(
                read_header(text.as_bytes()).expect("in-memory read"),
                Some(CnfHeader { variables: vars, clauses })
            );
        }
    }
}
