//! Run history: one JSON line per run in `<data_dir>/history/<provider>.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::Run;

/// Append `run` as a single JSON line.
pub fn append_run(path: &Path, run: &Run) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create history dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(run).context("serialize run")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open history {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append history {}", path.display()))
}

/// Read back all runs, oldest first. A missing file has no runs.
pub fn read_runs(path: &Path) -> Result<Vec<Run>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).with_context(|| format!("open history {}", path.display()))?;
    let mut runs = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read history {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let run: Run = serde_json::from_str(&line)
            .with_context(|| format!("parse history {} line {}", path.display(), index + 1))?;
        runs.push(run);
    }
    Ok(runs)
}
