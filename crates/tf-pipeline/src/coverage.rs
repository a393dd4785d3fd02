//! Pure functions turning raw coverage.py JSON output into a `CoverageReport`.

use std::collections::HashSet;

use crate::code_utils::extract_definitions;
use crate::types::{CoverageReport, FunctionCoverage};

/// Builds a report from the line sets `coverage.py`'s `coverage json`
/// command reports for a single file, plus the file's own source so
/// function-level coverage can be derived from the executed-line set.
pub fn analyze_coverage(
    source: &str,
    executed_lines: &[usize],
    missing_lines: &[usize],
    excluded_lines: &[usize],
) -> CoverageReport {
    // Executable = (executed ∪ missing) ∖ excluded — a line coverage.py
    // reported as excluded never counts toward either side of the ratio,
    // even if it also shows up in one of the other two sets.
    let excluded: HashSet<usize> = excluded_lines.iter().copied().collect();
    let executed: HashSet<usize> = executed_lines
        .iter()
        .copied()
        .filter(|l| !excluded.contains(l))
        .collect();
    let missing: HashSet<usize> = missing_lines
        .iter()
        .copied()
        .filter(|l| !excluded.contains(l))
        .collect();
    let total_relevant = executed.len() + missing.len();
    let overall_percent = if total_relevant == 0 {
        0.0
    } else {
        100.0 * executed.len() as f64 / total_relevant as f64
    };

    let functions = extract_definitions(source)
        .into_iter()
        .map(|def| {
            let covered = (def.start_line..=def.end_line)
                .filter(|line| executed.contains(line))
                .count();
            let uncovered: Vec<usize> = (def.start_line..=def.end_line)
                .filter(|line| missing.contains(line))
                .collect();
            let total = covered + uncovered.len();
            let pct = if total == 0 {
                0.0
            } else {
                100.0 * covered as f64 / total as f64
            };
            FunctionCoverage {
                name: def.name,
                kind: def.kind,
                start_line: def.start_line,
                end_line: def.end_line,
                total,
                covered,
                uncovered,
                pct,
            }
        })
        .collect();

    let mut executed_sorted: Vec<usize> = executed.into_iter().collect();
    executed_sorted.sort_unstable();
    let mut missing_sorted: Vec<usize> = missing.into_iter().collect();
    missing_sorted.sort_unstable();

    CoverageReport {
        overall_percent,
        executed_lines: executed_sorted,
        missing_lines: missing_sorted,
        excluded_lines: excluded_lines.to_vec(),
        functions,
        uncovered_areas_text: format_uncovered_areas(source, missing_lines),
    }
}

/// Renders the uncovered line ranges into the plain-text block handed to
/// the implementation agent's "coverage gaps" prompt section — collapsed
/// into contiguous ranges rather than one line per number, so the prompt
/// stays short even for large gaps.
pub fn format_uncovered_areas(source: &str, missing_lines: &[usize]) -> String {
    if missing_lines.is_empty() {
        return "No uncovered lines.".to_string();
    }
    let lines: Vec<&str> = source.lines().collect();
    let mut sorted = missing_lines.to_vec();
    sorted.sort_unstable();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for line in sorted {
        match ranges.last_mut() {
            Some((_, end)) if line == *end + 1 => *end = line,
            _ => ranges.push((line, line)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                let text = lines.get(start.saturating_sub(1)).copied().unwrap_or("");
                format!("line {start}: {text}")
            } else {
                format!("lines {start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn get_overall_percentage(report: &CoverageReport) -> f64 {
    report.overall_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_coverage_is_100_percent() {
        let source = "def f():\n    return 1\n";
        let report = analyze_coverage(source, &[1, 2], &[], &[]);
        assert_eq!(report.overall_percent, 100.0);
    }

    #[test]
    fn partial_coverage_computes_percentage() {
        let source = "def f():\n    return 1\n";
        let report = analyze_coverage(source, &[1], &[2], &[]);
        assert_eq!(report.overall_percent, 50.0);
    }

    #[test]
    fn function_marked_covered_when_any_line_executed() {
        let source = "def f():\n    x = 1\n    return x\n";
        let report = analyze_coverage(source, &[1], &[2, 3], &[]);
        assert!(report.functions[0].is_covered());
        assert_eq!(report.functions[0].total, 3);
        assert_eq!(report.functions[0].covered + report.functions[0].uncovered.len(), report.functions[0].total);
    }

    #[test]
    fn zero_executable_lines_is_zero_percent_not_full_marks() {
        let source = "x = 1\n";
        let report = analyze_coverage(source, &[], &[], &[1]);
        assert_eq!(report.overall_percent, 0.0);
    }

    #[test]
    fn excluded_lines_are_removed_from_both_executed_and_missing() {
        let source = "def f():\n    x = 1\n    return x\n";
        let report = analyze_coverage(source, &[1, 2], &[3], &[3]);
        assert_eq!(report.overall_percent, 100.0);
        assert!(!report.missing_lines.contains(&3));
    }

    #[test]
    fn format_uncovered_areas_collapses_contiguous_ranges() {
        let source = "a\nb\nc\nd\ne\n";
        let text = format_uncovered_areas(source, &[2, 3, 4]);
        assert_eq!(text, "lines 2-4");
    }

    #[test]
    fn format_uncovered_areas_empty_when_nothing_missing() {
        assert_eq!(format_uncovered_areas("a\n", &[]), "No uncovered lines.");
    }
}
