//! Merging of per-worker log files.

use super::pool::worker_log_path;
use regex::Regex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Name of the merged log inside the log directory
pub const MERGED_LOG: &str = "workers.log";

fn file_index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"file\{index=(\d+)\}").expect("valid file index regex"))
}

/// Merge `worker-0.log .. worker-<n-1>.log` into `workers.log`, ordered by
/// file index, then delete the per-worker files.
///
/// Lines without a file index stay with the file logged before them; lines
/// before a worker's first file come first. Returns None when no worker
/// log exists.
pub fn merge_worker_logs(dir: &Path, workers: usize) -> io::Result<Option<PathBuf>> {
    let mut lines: Vec<(Option<usize>, String)> = Vec::new();
    let mut sources = Vec::new();

    for worker_id in 0..workers {
        let path = worker_log_path(dir, worker_id);
        if !path.exists() {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        let mut current = None;
        for line in text.lines() {
            if let Some(index) = file_index_pattern()
                .captures(line)
                .and_then(|c| c[1].parse::<usize>().ok())
            {
                current = Some(index);
            }
            lines.push((current, line.to_string()));
        }
        sources.push(path);
    }

    if sources.is_empty() {
        return Ok(None);
    }

    // Stable: equal indices keep worker then line order
    lines.sort_by_key(|(index, _)| *index);

    let merged = dir.join(MERGED_LOG);
    let mut output = String::with_capacity(lines.iter().map(|(_, l)| l.len() + 1).sum());
    for (_, line) in &lines {
        output.push_str(line);
        output.push('\n');
    }
    fs::write(&merged, output)?;

    for path in sources {
        fs::remove_file(path)?;
    }
    Ok(Some(merged))
}

/// Copy a merged log to `out`
pub fn replay_log(path: &Path, out: &mut impl Write) -> io::Result<()> {
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, out)?;
    out.flush()
}
