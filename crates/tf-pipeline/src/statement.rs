//! Flat statement-line enumeration used by the evaluation agent to sanity
//! check that a reported coverage percentage is consistent with the
//! source's actual statement count.

use std::collections::HashSet;

use rustpython_parser::ast::{self, Ranged, Stmt};
use rustpython_parser::{Mode, parse};

/// Statement-level coverage figure for a module: every line `coverage.py`
/// would count as an executable statement, intersected against the
/// executable set `(executed ∪ missing) ∖ excluded` the coverage JSON
/// reports for the same run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatementCoverageReport {
    pub total_statements: usize,
    pub covered_statements: usize,
    pub coverage_percentage: f64,
}

/// Returns every line that corresponds to an executable statement — the
/// denominator `coverage.py` itself uses, modulo its own exclusion rules,
/// which this pipeline takes as given from the externally-produced
/// coverage JSON rather than recomputing.
pub fn collect_statement_lines(source: &str) -> Vec<usize> {
    let mut lines = Vec::new();
    if let Ok(ast::Mod::Module(module)) = parse(source, Mode::Module, "<source>") {
        collect(&module.body, &mut lines);
    }
    lines.sort_unstable();
    lines.dedup();
    lines
}

fn collect(body: &[Stmt], out: &mut Vec<usize>) {
    for stmt in body {
        out.push(stmt.range().start().to_usize());
        match stmt {
            Stmt::FunctionDef(f) => collect(&f.body, out),
            Stmt::AsyncFunctionDef(f) => collect(&f.body, out),
            Stmt::ClassDef(c) => collect(&c.body, out),
            Stmt::If(n) => {
                collect(&n.body, out);
                collect(&n.orelse, out);
            }
            Stmt::For(n) => {
                collect(&n.body, out);
                collect(&n.orelse, out);
            }
            Stmt::While(n) => {
                collect(&n.body, out);
                collect(&n.orelse, out);
            }
            Stmt::With(n) => collect(&n.body, out),
            Stmt::AsyncWith(n) => collect(&n.body, out),
            Stmt::Try(n) => {
                collect(&n.body, out);
                for handler in &n.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    collect(&h.body, out);
                }
                collect(&n.orelse, out);
                collect(&n.finalbody, out);
            }
            Stmt::Match(n) => {
                for case in &n.cases {
                    collect(&case.body, out);
                }
            }
            _ => {}
        }
    }
}

/// True if `executed_lines` covers every statement line; used as a cheap
/// cross-check against a reported 100% coverage figure.
pub fn is_fully_covered(source: &str, executed_lines: &[usize]) -> bool {
    let statements = collect_statement_lines(source);
    statements.iter().all(|l| executed_lines.contains(l))
}

/// Builds the statement-coverage figure for `source`: its statement lines
/// intersected with the executable set `(executed ∪ missing) ∖ excluded`, the
/// same set-subtraction `coverage.rs::analyze_coverage` applies to the same
/// three inputs. A statement line outside that set (e.g. a `pragma: no
/// cover`-excluded line) counts toward neither the numerator nor the
/// denominator.
pub fn analyze_statement_coverage(
    source: &str,
    executed_lines: &[usize],
    missing_lines: &[usize],
    excluded_lines: &[usize],
) -> StatementCoverageReport {
    let excluded: HashSet<usize> = excluded_lines.iter().copied().collect();
    let executed: HashSet<usize> = executed_lines.iter().copied().filter(|l| !excluded.contains(l)).collect();
    let missing: HashSet<usize> = missing_lines.iter().copied().filter(|l| !excluded.contains(l)).collect();

    let statements = collect_statement_lines(source);
    let covered_statements = statements.iter().filter(|l| executed.contains(l)).count();
    let total_statements = statements
        .iter()
        .filter(|l| executed.contains(l) || missing.contains(l))
        .count();
    let coverage_percentage = if total_statements == 0 {
        0.0
    } else {
        100.0 * covered_statements as f64 / total_statements as f64
    };

    StatementCoverageReport {
        total_statements,
        covered_statements,
        coverage_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_top_level_and_nested_statements() {
        let source = "def f():\n    if True:\n        x = 1\n    return x\n";
        let lines = collect_statement_lines(source);
        assert!(lines.len() >= 3);
    }

    #[test]
    fn fully_covered_true_when_all_lines_executed() {
        let source = "x = 1\ny = 2\n";
        let lines = collect_statement_lines(source);
        assert!(is_fully_covered(source, &lines));
    }

    #[test]
    fn fully_covered_false_when_a_line_missing() {
        let source = "x = 1\ny = 2\n";
        assert!(!is_fully_covered(source, &[1]));
    }

    #[test]
    fn statement_coverage_counts_covered_and_total() {
        let source = "x = 1\ny = 2\n";
        let report = analyze_statement_coverage(source, &[1], &[2], &[]);
        assert_eq!(report.total_statements, 2);
        assert_eq!(report.covered_statements, 1);
        assert_eq!(report.coverage_percentage, 50.0);
    }

    #[test]
    fn statement_coverage_excludes_excluded_lines_from_total() {
        let source = "x = 1\ny = 2\n";
        let report = analyze_statement_coverage(source, &[1], &[2], &[2]);
        assert_eq!(report.total_statements, 1);
        assert_eq!(report.covered_statements, 1);
        assert_eq!(report.coverage_percentage, 100.0);
    }

    #[test]
    fn statement_coverage_is_zero_when_nothing_executable() {
        let source = "x = 1\n";
        let report = analyze_statement_coverage(source, &[], &[], &[1]);
        assert_eq!(report.total_statements, 0);
        assert_eq!(report.coverage_percentage, 0.0);
    }
}
