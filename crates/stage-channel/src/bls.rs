//! Kernel command line edits for Boot Loader Specification entries.
//!
//! Every `*.conf` under `<root>/loader/entries` gets the arguments appended
//! to its `options` line. Entries are collected first; if there are none the
//! call fails before any file is touched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ENTRIES_DIR: &str = "loader/entries";
const ENTRY_EXTENSION: &str = "conf";
const OPTIONS_PREFIX: &str = "options ";

#[derive(Debug, thiserror::Error)]
pub enum BlsError {
    #[error("no boot loader entries found in {0}")]
    NoEntries(PathBuf),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BlsError + '_ {
    move |source| BlsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Entry files under `root`, sorted by path.
pub fn entries(root: &Path) -> Result<Vec<PathBuf>, BlsError> {
    let dir = root.join(ENTRIES_DIR);
    let read_dir = match fs::read_dir(&dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&dir)(e)),
    };

    let mut found = Vec::new();
    for entry in read_dir {
        let path = entry.map_err(io_err(&dir))?.path();
        if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Append `kernel_args` to the `options` line of every entry under `root`.
///
/// Returns the entries that were rewritten.
pub fn options_append<S: AsRef<str>>(
    root: &Path,
    kernel_args: &[S],
) -> Result<Vec<PathBuf>, BlsError> {
    let found = entries(root)?;
    if found.is_empty() {
        return Err(BlsError::NoEntries(root.join(ENTRIES_DIR)));
    }

    let args = kernel_args
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ");

    for path in &found {
        let contents = fs::read_to_string(path).map_err(io_err(path))?;
        fs::write(path, append_to_options(&contents, &args)).map_err(io_err(path))?;
    }

    tracing::info!(
        args = %args,
        entries = ?found,
        "Added kernel arguments to boot loader entries"
    );
    Ok(found)
}

fn append_to_options(contents: &str, args: &str) -> String {
    let mut out = String::with_capacity(contents.len() + args.len() + 1);
    for line in contents.lines() {
        out.push_str(line);
        if !args.is_empty() && line.starts_with(OPTIONS_PREFIX) {
            out.push(' ');
            out.push_str(args);
        }
        out.push('\n');
    }
    out
}
