//! Stashing of files modified in place.
//!
//! A file that appears in both the input and output sets of an action is
//! rewritten by every run. Before a comparison rerun the original content is
//! saved to a side location (the file itself stays put, the rerun reads it),
//! and restored afterwards so each rerun starts from the same state.

use std::path::{Path, PathBuf};
use tracing::warn;

const STASH_SUFFIX: &str = ".stash";

#[derive(Debug)]
enum Saved {
    Copied(PathBuf),
    Absent,
}

/// Saved state of a set of in-and-out files.
#[derive(Debug)]
pub struct Stash {
    entries: Vec<(PathBuf, Saved)>,
}

/// Copy each file to its side location. Files missing on disk are recorded
/// as absent and removed again on restore. Copy failures are logged and the
/// file is left unstashed.
pub fn stash_files(paths: &[PathBuf]) -> Stash {
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        if !path.exists() {
            entries.push((path.clone(), Saved::Absent));
            continue;
        }
        let side = side_location(path);
        match std::fs::copy(path, &side) {
            Ok(_) => entries.push((path.clone(), Saved::Copied(side))),
            Err(e) => warn!("failed to stash {}: {}", path.display(), e),
        }
    }
    Stash { entries }
}

fn side_location(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(STASH_SUFFIX);
    PathBuf::from(name)
}

impl Stash {
    /// Put every stashed file back, overwriting whatever a rerun left
    /// behind. Failures are logged; restore continues with the remaining
    /// files.
    pub fn restore(self) {
        for (path, saved) in self.entries {
            match saved {
                Saved::Copied(side) => {
                    if let Err(e) = std::fs::rename(&side, &path) {
                        warn!("failed to restore {}: {}", path.display(), e);
                    }
                }
                Saved::Absent => match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to remove {}: {}", path.display(), e),
                },
            }
        }
    }
}
