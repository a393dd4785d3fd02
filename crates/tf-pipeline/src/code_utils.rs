//! Static inspection helpers shared by the implementation and evaluation
//! agents: syntax validation, source sanitization, definition extraction,
//! and hallucinated-symbol detection, all operating over the target
//! codebase's Python source.

use std::collections::HashSet;

use rustpython_parser::ast::{self, Stmt};
use rustpython_parser::{Mode, parse};

use crate::types::FunctionKind;

/// Strips a wrapping markdown code fence and leading/trailing whitespace an
/// LLM sometimes adds around an otherwise-valid source file.
pub fn sanitize(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("```python")
        .or_else(|| trimmed.strip_prefix("```py"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let stripped = stripped.strip_suffix("```").unwrap_or(stripped);
    stripped.trim().to_string()
}

#[derive(Debug, Clone)]
pub struct SyntaxIssue {
    pub line: usize,
    pub message: String,
}

/// Parses `source` as a Python module, returning `Ok(())` when it is
/// syntactically valid and a line-anchored issue otherwise.
pub fn validate_syntax(source: &str) -> Result<(), SyntaxIssue> {
    parse(source, Mode::Module, "<generated>")
        .map(|_| ())
        .map_err(|e| SyntaxIssue {
            line: e.location().row.to_usize(),
            message: e.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub kind: FunctionKind,
    pub start_line: usize,
    pub end_line: usize,
}

/// Walks the module body (top level and one level of class nesting, which
/// is as deep as the coverage/evaluation machinery needs to go) and returns
/// every function, async function, and class definition found.
pub fn extract_definitions(source: &str) -> Vec<Definition> {
    let Ok(module) = parse(source, Mode::Module, "<source>") else {
        return Vec::new();
    };
    let ast::Mod::Module(module) = module else {
        return Vec::new();
    };
    let mut defs = Vec::new();
    collect_definitions(&module.body, &mut defs);
    defs
}

fn collect_definitions(body: &[Stmt], out: &mut Vec<Definition>) {
    for stmt in body {
        match stmt {
            Stmt::FunctionDef(f) => {
                out.push(Definition {
                    name: f.name.to_string(),
                    kind: FunctionKind::Function,
                    start_line: f.range.start().to_usize(),
                    end_line: f.range.end().to_usize(),
                });
            }
            Stmt::AsyncFunctionDef(f) => {
                out.push(Definition {
                    name: f.name.to_string(),
                    kind: FunctionKind::AsyncFunction,
                    start_line: f.range.start().to_usize(),
                    end_line: f.range.end().to_usize(),
                });
            }
            Stmt::ClassDef(c) => {
                out.push(Definition {
                    name: c.name.to_string(),
                    kind: FunctionKind::Class,
                    start_line: c.range.start().to_usize(),
                    end_line: c.range.end().to_usize(),
                });
                collect_definitions(&c.body, out);
            }
            _ => {}
        }
    }
}

/// Names imported anywhere in `source`, both module names (`import foo`,
/// `import foo.bar`) and symbol names (`from foo import bar, baz as qux`).
fn imported_names(body: &[Stmt]) -> HashSet<String> {
    let mut names = HashSet::new();
    for stmt in body {
        match stmt {
            Stmt::Import(i) => {
                for alias in &i.names {
                    let top = alias.name.split('.').next().unwrap_or(&alias.name);
                    names.insert(
                        alias
                            .asname
                            .as_ref()
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| top.to_string()),
                    );
                }
            }
            Stmt::ImportFrom(i) => {
                for alias in &i.names {
                    names.insert(
                        alias
                            .asname
                            .as_ref()
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| alias.name.to_string()),
                    );
                }
            }
            Stmt::ClassDef(c) => names.extend(imported_names(&c.body)),
            Stmt::FunctionDef(f) => names.extend(imported_names(&f.body)),
            Stmt::AsyncFunctionDef(f) => names.extend(imported_names(&f.body)),
            _ => {}
        }
    }
    names
}

/// Returns every dotted attribute-access / call base name referenced in the
/// generated test file's module scope, e.g. `requests`, `MyClass`.
fn referenced_names(source: &str) -> HashSet<String> {
    // A name reference can appear anywhere in an expression tree; rather
    // than walk every expression variant, take the conservative approach
    // the original hallucination check uses: scan identifier-shaped tokens
    // and let `actual_symbols`/`actual_modules` set membership do the
    // filtering.
    let mut names = HashSet::new();
    let mut current = String::new();
    for ch in source.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.push(ch);
        } else {
            if !current.is_empty() && !current.chars().next().unwrap().is_ascii_digit() {
                names.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if !current.is_empty() {
        names.insert(current);
    }
    names
}

/// Flags identifiers referenced in `test_source` that match neither a
/// symbol imported/defined in the test file itself nor one of the
/// `actual_modules`/`actual_symbols` known to exist in the target codebase.
/// Conservative by construction: it can only under-report (Python's dynamic
/// scoping means some false positives are unavoidable without executing the
/// code), never invent a hallucination that isn't at least a plausible
/// unresolved name.
pub fn detect_hallucinations(
    test_source: &str,
    actual_modules: &HashSet<String>,
    actual_symbols: &HashSet<String>,
) -> Vec<String> {
    let Ok(module) = parse(test_source, Mode::Module, "<generated>") else {
        return Vec::new();
    };
    let ast::Mod::Module(module) = module else {
        return Vec::new();
    };
    let known_local = imported_names(&module.body);
    let mut defs = Vec::new();
    collect_definitions(&module.body, &mut defs);
    let known_local: HashSet<String> = known_local
        .into_iter()
        .chain(defs.into_iter().map(|d| d.name))
        .collect();

    const BUILTINS: &[&str] = &[
        "self", "cls", "None", "True", "False", "print", "len", "range", "list", "dict", "set",
        "tuple", "str", "int", "float", "bool", "type", "isinstance", "Exception", "ValueError",
        "TypeError", "KeyError", "assert", "super", "object", "staticmethod", "classmethod",
        "property", "Mock", "MagicMock", "patch", "pytest", "fixture", "mark", "raises",
        "asyncio", "await",
    ];

    referenced_names(test_source)
        .into_iter()
        .filter(|name| {
            !known_local.contains(name)
                && !actual_modules.contains(name)
                && !actual_symbols.contains(name)
                && !BUILTINS.contains(&name.as_str())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_code_fence() {
        let raw = "```python\ndef f():\n    pass\n```";
        assert_eq!(sanitize(raw), "def f():\n    pass");
    }

    #[test]
    fn sanitize_leaves_plain_source_untouched() {
        let raw = "def f():\n    pass";
        assert_eq!(sanitize(raw), raw);
    }

    #[test]
    fn validate_syntax_accepts_valid_code() {
        assert!(validate_syntax("def f():\n    return 1\n").is_ok());
    }

    #[test]
    fn validate_syntax_rejects_invalid_code() {
        let issue = validate_syntax("def f(:\n    pass\n").unwrap_err();
        assert!(issue.line >= 1);
    }

    #[test]
    fn extract_definitions_finds_functions_and_classes() {
        let source = "def foo():\n    pass\n\nclass Bar:\n    def method(self):\n        pass\n";
        let defs = extract_definitions(source);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"foo"));
        assert!(names.contains(&"Bar"));
        assert!(names.contains(&"method"));
    }

    #[test]
    fn detect_hallucinations_flags_unknown_symbol() {
        let test_source = "def test_x():\n    totally_made_up_helper()\n";
        let modules = HashSet::new();
        let symbols = HashSet::new();
        let found = detect_hallucinations(test_source, &modules, &symbols);
        assert!(found.contains(&"totally_made_up_helper".to_string()));
    }

    #[test]
    fn detect_hallucinations_allows_known_symbol() {
        let test_source = "def test_x():\n    real_helper()\n";
        let modules = HashSet::new();
        let mut symbols = HashSet::new();
        symbols.insert("real_helper".to_string());
        let found = detect_hallucinations(test_source, &modules, &symbols);
        assert!(!found.contains(&"real_helper".to_string()));
    }
}
