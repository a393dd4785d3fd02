//! Walks a codebase directory, filters out files the pipeline should never
//! touch, and groups source files into LLM-sized chunks.

use std::path::{Path, PathBuf};

const EXCLUDED_DIRS: &[&str] = &[
    ".git", ".venv", "venv", "__pycache__", "node_modules", ".mutmut-cache", ".pytest_cache",
    "build", "dist", ".tox", "site-packages", "tests", "test", "__tests__",
];

const EXCLUDED_FILE_PREFIXES: &[&str] = &["test_", "conftest"];
const EXCLUDED_FILE_SUFFIXES: &[&str] = &["_test.py"];

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content: String,
}

/// Recursively collects `.py` files under `root`, skipping virtualenvs,
/// caches, and existing test files — the pipeline generates tests, it
/// never analyzes or rewrites them as source.
pub fn gather_files(root: &Path) -> std::io::Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    walk(root, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn walk(dir: &Path, out: &mut Vec<SourceFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            walk(&path, out)?;
            continue;
        }
        if !name.ends_with(".py") {
            continue;
        }
        if EXCLUDED_FILE_PREFIXES.iter().any(|p| name.starts_with(p))
            || EXCLUDED_FILE_SUFFIXES.iter().any(|s| name.ends_with(s))
        {
            continue;
        }
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        out.push(SourceFile { path, content });
    }
    Ok(())
}

/// Target character budget per chunk handed to the identification agent.
/// Conservative relative to a typical model's context window, leaving
/// headroom for the system prompt and scenario-format instructions.
pub const CHUNK_CHAR_BUDGET: usize = 12_000;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub files: Vec<SourceFile>,
}

impl Chunk {
    pub fn code_context(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("# {}\n{}", f.path.display(), f.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn file_list(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| f.path.display().to_string())
            .collect()
    }
}

/// Greedily packs files into chunks so each stays under
/// `CHUNK_CHAR_BUDGET`. A single file larger than the budget is truncated
/// at a line boundary rather than split across chunks, since splitting a
/// module mid-definition would confuse the identification agent more than
/// losing its tail.
pub fn chunk(files: Vec<SourceFile>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0usize;

    for mut file in files {
        if file.content.len() > CHUNK_CHAR_BUDGET {
            file.content = truncate_at_boundary(&file.content, CHUNK_CHAR_BUDGET);
        }
        if current_size + file.content.len() > CHUNK_CHAR_BUDGET && !current.is_empty() {
            chunks.push(Chunk {
                files: std::mem::take(&mut current),
            });
            current_size = 0;
        }
        current_size += file.content.len();
        current.push(file);
    }
    if !current.is_empty() {
        chunks.push(Chunk { files: current });
    }
    chunks
}

/// Truncates `source` to at most `limit` characters, backing off to the
/// nearest preceding newline so a truncated function body doesn't end
/// mid-line.
pub fn truncate_at_boundary(source: &str, limit: usize) -> String {
    if source.len() <= limit {
        return source.to_string();
    }
    let slice = &source[..limit];
    match slice.rfind('\n') {
        Some(idx) => slice[..idx].to_string(),
        None => slice.to_string(),
    }
}
