//! Walks a module's control-flow constructs (`if`, `try`, `for`, `while`,
//! `match`) and reports, per construct, each arm's coverage against the
//! executed-line set and whether every arm of that construct was covered.

use std::collections::HashSet;

use rustpython_parser::ast::{self, Stmt};
use rustpython_parser::{Mode, parse};

use crate::types::{BranchArm, BranchConstruct, BranchReport};

/// Builds a `BranchReport` for `source` given the set of lines the test run
/// actually executed.
pub fn analyze_branches(source: &str, executed_lines: &[usize]) -> BranchReport {
    let executed: HashSet<usize> = executed_lines.iter().copied().collect();
    let mut report = BranchReport::default();
    let mut seen: HashSet<(usize, BranchConstruct)> = HashSet::new();
    let Ok(module) = parse(source, Mode::Module, "<source>") else {
        return report;
    };
    if let ast::Mod::Module(module) = module {
        walk_body(&module.body, &executed, &mut seen, &mut report);
    }
    report
}

/// Recursion can re-enter the same construct's line through more than one
/// path (e.g. an `elif` chain visits the same nested `If` both as an arm of
/// its parent and, independently, while walking into `orelse`); `seen`
/// guards a construct's *whole* set of arms from being generated twice. It
/// must NOT gate individual arm pushes — an `if`/`else` pair legitimately
/// shares one `(line, construct)` key and both arms are wanted.
fn walk_body(
    body: &[Stmt],
    executed: &HashSet<usize>,
    seen: &mut HashSet<(usize, BranchConstruct)>,
    report: &mut BranchReport,
) {
    for stmt in body {
        match stmt {
            Stmt::If(node) => {
                let line = node.range.start().to_usize();
                if seen.insert((line, BranchConstruct::If)) {
                    let if_covered = stmt_block_covered(&node.body, executed);
                    let mut arms = vec![BranchArm {
                        line,
                        construct: BranchConstruct::If,
                        label: "if".into(),
                        covered: if_covered,
                    }];
                    if node.orelse.is_empty() {
                        // No `else` at all: the implicit-else branch is "fall
                        // through the header without entering the body",
                        // which happened iff the header line itself ran and
                        // the body didn't — covered iff the header executed.
                        arms.push(BranchArm {
                            line,
                            construct: BranchConstruct::If,
                            label: "implicit-else".into(),
                            covered: executed.contains(&line),
                        });
                    } else {
                        // An `elif` is represented as a single nested `If` in
                        // the `orelse` list; a bare `else` is any other
                        // statement list. Both collapse to one "else" arm on
                        // this node's line, matching coverage.py's line-level
                        // granularity for implicit-else branches.
                        let is_elif = matches!(node.orelse.first(), Some(Stmt::If(_)) if node.orelse.len() == 1);
                        if !is_elif {
                            arms.push(BranchArm {
                                line,
                                construct: BranchConstruct::If,
                                label: "else".into(),
                                covered: stmt_block_covered(&node.orelse, executed),
                            });
                        }
                    }
                    report.push_construct(line, BranchConstruct::If, arms);
                }
                walk_body(&node.body, executed, seen, report);
                walk_body(&node.orelse, executed, seen, report);
            }
            Stmt::Try(node) => {
                let line = node.range.start().to_usize();
                if seen.insert((line, BranchConstruct::Try)) {
                    let mut arms = vec![BranchArm {
                        line,
                        construct: BranchConstruct::Try,
                        label: "try".into(),
                        covered: stmt_block_covered(&node.body, executed),
                    }];
                    for handler in &node.handlers {
                        let ast::ExceptHandler::ExceptHandler(h) = handler;
                        arms.push(BranchArm {
                            line: h.range.start().to_usize(),
                            construct: BranchConstruct::Try,
                            label: h
                                .type_
                                .as_ref()
                                .map(|_| "except".to_string())
                                .unwrap_or_else(|| "except*".to_string()),
                            covered: stmt_block_covered(&h.body, executed),
                        });
                    }
                    if !node.orelse.is_empty() {
                        arms.push(BranchArm {
                            line,
                            construct: BranchConstruct::Try,
                            label: "try-else".into(),
                            covered: stmt_block_covered(&node.orelse, executed),
                        });
                    }
                    if !node.finalbody.is_empty() {
                        arms.push(BranchArm {
                            line,
                            construct: BranchConstruct::Try,
                            label: "finally".into(),
                            covered: stmt_block_covered(&node.finalbody, executed),
                        });
                    }
                    report.push_construct(line, BranchConstruct::Try, arms);
                }
                walk_body(&node.body, executed, seen, report);
                for handler in &node.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    walk_body(&h.body, executed, seen, report);
                }
                walk_body(&node.orelse, executed, seen, report);
                walk_body(&node.finalbody, executed, seen, report);
            }
            Stmt::For(node) => {
                let line = node.range.start().to_usize();
                if seen.insert((line, BranchConstruct::For)) {
                    let mut arms = vec![BranchArm {
                        line,
                        construct: BranchConstruct::For,
                        label: "for".into(),
                        covered: stmt_block_covered(&node.body, executed),
                    }];
                    // `for...else` only fires when the loop completes without a
                    // `break`; report it only if an `else` block is present at
                    // all, matching the original's loop-else-only reporting.
                    if !node.orelse.is_empty() {
                        arms.push(BranchArm {
                            line,
                            construct: BranchConstruct::For,
                            label: "else".into(),
                            covered: stmt_block_covered(&node.orelse, executed),
                        });
                    }
                    report.push_construct(line, BranchConstruct::For, arms);
                }
                walk_body(&node.body, executed, seen, report);
                walk_body(&node.orelse, executed, seen, report);
            }
            Stmt::While(node) => {
                let line = node.range.start().to_usize();
                if seen.insert((line, BranchConstruct::While)) {
                    let mut arms = vec![BranchArm {
                        line,
                        construct: BranchConstruct::While,
                        label: "while".into(),
                        covered: stmt_block_covered(&node.body, executed),
                    }];
                    if !node.orelse.is_empty() {
                        arms.push(BranchArm {
                            line,
                            construct: BranchConstruct::While,
                            label: "else".into(),
                            covered: stmt_block_covered(&node.orelse, executed),
                        });
                    }
                    report.push_construct(line, BranchConstruct::While, arms);
                }
                walk_body(&node.body, executed, seen, report);
                walk_body(&node.orelse, executed, seen, report);
            }
            Stmt::Match(node) => {
                let line = node.range.start().to_usize();
                if seen.insert((line, BranchConstruct::Match)) {
                    let mut arms = Vec::new();
                    for case in &node.cases {
                        arms.push(BranchArm {
                            line: case.body.first().map(|s| stmt_line(s)).unwrap_or(line),
                            construct: BranchConstruct::Match,
                            // Pattern formatting is a truncated debug dump, not
                            // a full unparse — enough to distinguish arms in a
                            // report without reimplementing a Python unparser.
                            label: format!("{:?}", case.pattern).chars().take(40).collect(),
                            covered: stmt_block_covered(&case.body, executed),
                        });
                    }
                    report.push_construct(line, BranchConstruct::Match, arms);
                }
                for case in &node.cases {
                    walk_body(&case.body, executed, seen, report);
                }
            }
            Stmt::FunctionDef(f) => walk_body(&f.body, executed, seen, report),
            Stmt::AsyncFunctionDef(f) => walk_body(&f.body, executed, seen, report),
            Stmt::ClassDef(c) => walk_body(&c.body, executed, seen, report),
            Stmt::With(w) => walk_body(&w.body, executed, seen, report),
            Stmt::AsyncWith(w) => walk_body(&w.body, executed, seen, report),
            _ => {}
        }
    }
}

fn stmt_block_covered(body: &[Stmt], executed: &HashSet<usize>) -> bool {
    body.iter().any(|s| executed.contains(&stmt_line(s)))
}

fn stmt_line(stmt: &Stmt) -> usize {
    use rustpython_parser::ast::Ranged;
    stmt.range().start().to_usize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_with_else_produces_two_arms_and_is_not_fully_covered() {
        let source = "def f(x):\n    if x:\n        return 1\n    else:\n        return 2\n";
        let report = analyze_branches(source, &[1, 2, 3]);
        assert_eq!(report.constructs.len(), 1);
        let construct = &report.constructs[0];
        assert_eq!(construct.arms.len(), 2);
        assert!(construct.arms.iter().any(|a| a.label == "if" && a.covered));
        assert!(construct.arms.iter().any(|a| a.label == "else" && !a.covered));
        assert!(!construct.fully_covered);
    }

    #[test]
    fn bare_if_produces_implicit_else_arm() {
        let source = "def f(x):\n    if x:\n        return 1\n";
        let report = analyze_branches(source, &[1, 2]);
        assert_eq!(report.constructs.len(), 1);
        let construct = &report.constructs[0];
        assert_eq!(construct.arms.len(), 2);
        assert!(construct.arms.iter().any(|a| a.label == "if" && !a.covered));
        assert!(construct.arms.iter().any(|a| a.label == "implicit-else" && a.covered));
        assert!(!construct.fully_covered);
    }

    #[test]
    fn try_except_produces_arms_for_each_handler() {
        let source = "def f():\n    try:\n        pass\n    except ValueError:\n        pass\n";
        let report = analyze_branches(source, &[2]);
        assert_eq!(report.constructs.len(), 1);
        assert_eq!(report.constructs[0].arms.len(), 2);
    }

    #[test]
    fn coverage_percent_is_ratio_of_fully_covered_constructs() {
        let mut report = BranchReport::default();
        report.push_construct(
            1,
            BranchConstruct::If,
            vec![BranchArm {
                line: 1,
                construct: BranchConstruct::If,
                label: "if".into(),
                covered: true,
            }],
        );
        report.push_construct(
            2,
            BranchConstruct::While,
            vec![
                BranchArm {
                    line: 2,
                    construct: BranchConstruct::While,
                    label: "while".into(),
                    covered: true,
                },
                BranchArm {
                    line: 2,
                    construct: BranchConstruct::While,
                    label: "else".into(),
                    covered: false,
                },
            ],
        );
        assert_eq!(report.coverage_percent(), 50.0);
    }
}
