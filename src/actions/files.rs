use std::{collections::HashSet, fs, path::Path};

use anyhow::{bail, Context, Error};
use walkdir::WalkDir;

use hostutils::{checksum, files};
use updater_api::manifest::{MergeStrategy, SyncMode};

use crate::engine::EngineContext;

/// Copy one file out of the staged package. The write is atomic per file:
/// temp file, fsync, rename over the destination.
pub fn copy(
    source: &Path,
    destination: &Path,
    expected_md5: Option<&str>,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let staged = ctx.staged(source);
    if let Some(expected) = expected_md5 {
        let expected = expected.to_ascii_lowercase();
        let found = checksum::file_md5(&staged)?;
        if found != expected {
            bail!(
                "Staged file '{}' does not match its declared checksum: expected {expected}, found {found}",
                source.display()
            );
        }
    }
    files::atomic_copy(&staged, destination)?;
    ctx.log(format!(
        "Copied {} -> {}",
        source.display(),
        destination.display()
    ));
    Ok(())
}

/// Synchronize a directory tree from the staged package to the host.
pub fn sync(
    source: &Path,
    destination: &Path,
    mode: SyncMode,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let staged = ctx.staged(source);
    if !staged.is_dir() {
        bail!("Staged directory '{}' does not exist", source.display());
    }
    files::create_dirs(destination)?;

    let source_files = files::list_files(&staged)?;
    let mut copied = 0usize;
    for file in &source_files {
        let target = destination.join(file);
        if mode == SyncMode::AddOnly && target.exists() {
            continue;
        }
        files::atomic_copy(&staged.join(file), &target)?;
        copied += 1;
    }

    let mut removed = 0usize;
    if mode == SyncMode::Mirror {
        let keep: HashSet<_> = source_files.iter().cloned().collect();
        for file in files::list_files(destination)? {
            if !keep.contains(&file) {
                files::remove_path_if_exists(&destination.join(&file))?;
                removed += 1;
            }
        }
        remove_empty_dirs(destination)?;
    }

    ctx.log(format!(
        "Synced {} -> {} ({} mode): {copied} copied, {removed} removed",
        source.display(),
        destination.display(),
        match mode {
            SyncMode::Mirror => "mirror",
            SyncMode::AddOnly => "add_only",
            SyncMode::OverwriteExisting => "overwrite_existing",
        }
    ));
    Ok(())
}

/// Remove directories under `root` (not `root` itself) that are left empty.
fn remove_empty_dirs(root: &Path) -> Result<(), Error> {
    let mut dirs: Vec<_> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    // Deepest first so parents empty out as children disappear.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir).context(format!("Failed to remove {}", dir.display()))?;
        }
    }
    Ok(())
}

/// One line of a `KEY=VALUE` configuration file. Comments, blanks and
/// anything unparseable pass through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvLine {
    Verbatim(String),
    Pair { key: String, value: String },
}

fn parse_env_lines(text: &str) -> Vec<EnvLine> {
    text.lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return EnvLine::Verbatim(line.to_string());
            }
            match line.split_once('=') {
                Some((key, value)) => EnvLine::Pair {
                    key: key.trim().to_string(),
                    value: value.to_string(),
                },
                None => EnvLine::Verbatim(line.to_string()),
            }
        })
        .collect()
}

fn render_env_lines(lines: &[EnvLine]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            EnvLine::Verbatim(raw) => out.push_str(raw),
            EnvLine::Pair { key, value } => {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
            }
        }
        out.push('\n');
    }
    out
}

/// Merge `KEY=VALUE` configuration from the staged package into a host file,
/// preserving the destination's comments and blank lines. The result is
/// written atomically.
pub fn merge(
    source: &Path,
    destination: &Path,
    strategy: MergeStrategy,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let staged = ctx.staged(source);
    let source_text = fs::read_to_string(&staged)
        .context(format!("Failed to read staged file {}", source.display()))?;
    let dest_text = match fs::read_to_string(destination) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).context(format!("Failed to read {}", destination.display()));
        }
    };

    let source_pairs: Vec<(String, String)> = parse_env_lines(&source_text)
        .into_iter()
        .filter_map(|line| match line {
            EnvLine::Pair { key, value } => Some((key, value)),
            EnvLine::Verbatim(_) => None,
        })
        .collect();

    let mut result = parse_env_lines(&dest_text);
    let dest_keys: HashSet<String> = result
        .iter()
        .filter_map(|line| match line {
            EnvLine::Pair { key, .. } => Some(key.clone()),
            EnvLine::Verbatim(_) => None,
        })
        .collect();

    if strategy == MergeStrategy::OverwriteAll {
        for line in result.iter_mut() {
            if let EnvLine::Pair { key, value } = line {
                if let Some((_, new_value)) = source_pairs.iter().find(|(k, _)| k == key) {
                    *value = new_value.clone();
                }
            }
        }
    }

    // All strategies append keys the destination does not have yet.
    let mut appended = 0usize;
    for (key, value) in &source_pairs {
        if !dest_keys.contains(key) {
            result.push(EnvLine::Pair {
                key: key.clone(),
                value: value.clone(),
            });
            appended += 1;
        }
    }

    files::atomic_write(destination, render_env_lines(&result).as_bytes())?;
    ctx.log(format!(
        "Merged {} into {} ({appended} new keys)",
        source.display(),
        destination.display()
    ));
    Ok(())
}
