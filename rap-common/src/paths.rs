//! Path arithmetic for action descriptions.
//!
//! Commands run with a working directory below the execution root, and the
//! same command must resolve relative paths identically on a remote worker.
//! These helpers keep the two views consistent. Both `/` and `\` are treated
//! as separators everywhere: when cross-building for Windows, paths can
//! arrive in either form regardless of the host.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// First segment of every canonical remote working directory. The literal is
/// part of the wire contract with remote workers.
const REMOTE_WORKING_DIR_ROOT: &str = "set_by_reclient";

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Number of segments in a file path: 0 for the empty string, else 1 plus
/// the count of separator characters.
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        return 0;
    }
    1 + path.chars().filter(|c| is_separator(*c)).count()
}

/// Lexically clean a path: drop `.` segments and empty segments, resolve
/// `..` against preceding segments, keep a single leading separator for
/// absolute paths. Cleaning an empty path yields `.`.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.chars().next().is_some_and(is_separator);
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split(is_separator) {
        match seg {
            "" | "." => {}
            ".." => {
                let poppable = segments.last().is_some_and(|s| *s != "..");
                if poppable {
                    segments.pop();
                } else if !absolute {
                    // Leading parent segments of a relative path survive;
                    // above an absolute root they vanish.
                    segments.push("..");
                }
            }
            _ => segments.push(seg),
        }
    }
    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Canonical path with the same number of segments as `working_dir`, so that
/// relative path arithmetic inside commands resolves identically on remote
/// workers. The empty string and `.` map to themselves. Separators in the
/// result are the host separator.
pub fn to_remote_working_dir(working_dir: &str) -> String {
    if working_dir.is_empty() || working_dir == "." {
        return working_dir.to_string();
    }
    let dir_depth = depth(&clean(working_dir));
    let mut elems = Vec::with_capacity(dir_depth);
    elems.push(REMOTE_WORKING_DIR_ROOT);
    for _ in 1..dir_depth {
        elems.push("a");
    }
    elems.join(&MAIN_SEPARATOR.to_string())
}

/// Rewrite all backslashes to forward slashes. Used when submitting output
/// paths for a Windows target from a POSIX host.
pub fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

/// Order-preserving deduplication.
pub fn dedup(paths: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(paths.len());
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

/// Lexical relative path from `base` to `target`. Both are interpreted as
/// cleaned path strings; no filesystem access.
fn rel_path(base: &str, target: &str) -> String {
    let base = clean(base);
    let target = clean(target);
    if base == target {
        return ".".to_string();
    }
    let base_segs: Vec<&str> = base.split(is_separator).filter(|s| !s.is_empty() && *s != ".").collect();
    let target_segs: Vec<&str> =
        target.split(is_separator).filter(|s| !s.is_empty() && *s != ".").collect();
    let common = base_segs
        .iter()
        .zip(target_segs.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<String> = Vec::new();
    for _ in common..base_segs.len() {
        out.push("..".to_string());
    }
    for seg in &target_segs[common..] {
        out.push((*seg).to_string());
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

fn join_str(root: &Path, rel: &str) -> String {
    let mut p = PathBuf::from(root);
    p.push(rel);
    p.to_string_lossy().into_owned()
}

/// Re-express paths that are relative to the execution root (or absolute)
/// as paths relative to the working directory.
pub fn rel_to_working_dir(exec_root: &Path, working_dir: &str, paths: &[String]) -> Vec<String> {
    let wd_abs = join_str(exec_root, working_dir);
    paths
        .iter()
        .map(|p| {
            let abs = if Path::new(p).is_absolute() {
                p.clone()
            } else {
                join_str(exec_root, p)
            };
            rel_path(&wd_abs, &abs)
        })
        .collect()
}

/// Re-express paths that are relative to the working directory (or absolute)
/// as paths relative to the execution root.
pub fn rel_to_exec_root(exec_root: &Path, working_dir: &str, paths: &[String]) -> Vec<String> {
    let root = exec_root.to_string_lossy();
    paths
        .iter()
        .map(|p| {
            if Path::new(p).is_absolute() {
                rel_path(&root, p)
            } else {
                let mut joined = String::new();
                if working_dir != "." && !working_dir.is_empty() {
                    joined.push_str(working_dir);
                    joined.push('/');
                }
                joined.push_str(p);
                clean(&joined)
            }
        })
        .collect()
}
