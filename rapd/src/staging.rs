//! Output staging for remote results.
//!
//! During a race, remote outputs are downloaded into a per-action scratch
//! directory and only moved into the execution root once remote actually
//! wins. This module owns the scratch directory lifecycle, the pre-execution
//! output snapshot, the move into place, mtime restoration for unchanged
//! outputs, and the changed-output filter used by the non-race remote path.

use crate::action::Action;
use crate::fmc::FileMetadataCache;
use crate::remote::OutputNode;
use rap_common::Digest;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to create scratch directory {path}: {source}")]
    CreateScratch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to move output to {path}: {source}")]
    Move {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove directory {path}: {source}")]
    RemoveDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not get output digests: {0}")]
    OutputDigests(String),
}

/// Digest and mtime of one output as it existed before execution.
#[derive(Debug, Clone)]
pub struct PreExecInfo {
    pub digest: Digest,
    pub mtime: SystemTime,
}

/// Per-action scratch directory under the racing temp root. Removal runs
/// asynchronously when the handle drops; on a runtime-less (abnormal) exit
/// it degrades to a best-effort synchronous removal.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        if path.as_os_str().is_empty() {
            return;
        }
        let remove = move || {
            if let Err(e) = remove_contents(&path) {
                warn!(
                    "could not remove scratch directory {}: {}",
                    path.display(),
                    e
                );
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

/// Remove a directory and everything under it.
pub(crate) fn remove_contents(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    std::fs::remove_dir(dir)
}

impl Action {
    /// Create this action's scratch directory, named by the execution id so
    /// no two actions ever share one.
    pub(crate) fn create_scratch_dir(&self) -> Result<ScratchDir, StagingError> {
        let path = self.racing_tmp.join(&self.cmd.identifiers.execution_id);
        std::fs::create_dir_all(&self.racing_tmp)
            .and_then(|()| std::fs::create_dir(&path))
            .map_err(|e| StagingError::CreateScratch {
                path: path.clone(),
                source: e,
            })?;
        Ok(ScratchDir { path })
    }

    /// Snapshot digests and mtimes of every declared output currently on
    /// disk, keyed by path relative to the absolute working directory.
    /// Missing outputs are skipped silently; unreadable ones with a warning.
    pub(crate) fn pre_exec_outs_info(&self) -> HashMap<String, PreExecInfo> {
        let abs = self.cmd.abs_working_dir();
        let mut info = HashMap::new();
        let mut capture = |path: &Path, mtime: SystemTime| {
            let digest = match Digest::of_file(path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        execution_id = %self.cmd.identifiers.execution_id,
                        "failed to digest existing output {}; its mtime may not be preserved: {}",
                        path.display(),
                        e
                    );
                    return;
                }
            };
            let rel = path
                .strip_prefix(&abs)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned();
            info.insert(rel, PreExecInfo { digest, mtime });
        };
        for f in &self.cmd.output_files {
            let path = abs.join(f);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    if let Ok(mtime) = meta.modified() {
                        capture(&path, mtime);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to stat existing output {}; its mtime may not be preserved: {}",
                    path.display(),
                    e
                ),
            }
        }
        for d in &self.cmd.output_dirs {
            for entry in WalkDir::new(abs.join(d)) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(
                            execution_id = %self.cmd.identifiers.execution_id,
                            "could not walk output directory; mtimes may not be preserved: {}",
                            e
                        );
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(mtime) = entry.metadata().ok().and_then(|m| m.modified().ok()) {
                    capture(entry.path(), mtime);
                }
            }
        }
        info
    }

    /// Move staged outputs from the scratch directory into the execution
    /// root: files first, then directories. A move failure is fatal for the
    /// action; a missing staged file is logged and skipped.
    pub(crate) fn move_outputs_from_temp(&self, tmp_dir: &Path) -> Result<(), StagingError> {
        let src_dir = if self.cmd.working_dir.is_empty() {
            tmp_dir.to_path_buf()
        } else {
            tmp_dir.join(&self.cmd.working_dir)
        };
        let dest_dir = self.cmd.abs_working_dir();
        let mut created: HashSet<PathBuf> = HashSet::new();
        for f in &self.cmd.output_files {
            let src = src_dir.join(f);
            let md = self.fmc.get(&src);
            if let Some(err) = md.err {
                error!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to get file metadata for {}: {}",
                    src.display(),
                    err
                );
                continue;
            }
            let dest = dest_dir.join(f);
            if let Some(parent) = dest.parent() {
                if created.insert(parent.to_path_buf()) {
                    std::fs::create_dir_all(parent).map_err(|e| StagingError::CreateDir {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
                }
            }
            std::fs::rename(&src, &dest).map_err(|e| StagingError::Move {
                path: dest.clone(),
                source: e,
            })?;
        }
        for d in &self.cmd.output_dirs {
            let src = src_dir.join(d);
            if !self.fmc.get(&src).is_directory {
                continue;
            }
            let dest = dest_dir.join(d);
            match std::fs::remove_dir_all(&dest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StagingError::RemoveDir {
                        path: dest,
                        source: e,
                    })
                }
            }
            std::fs::rename(&src, &dest).map_err(|e| StagingError::Move {
                path: dest.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// For every output whose content did not change across the remote run,
    /// put the pre-execution mtime back and refresh the metadata cache.
    /// Per-output failures are logged and skipped.
    pub(crate) fn restore_unchanged_output_mtimes(
        &self,
        pre: &HashMap<String, PreExecInfo>,
    ) -> Result<(), StagingError> {
        let Some(ec) = self.exec_context.clone() else {
            return Err(StagingError::OutputDigests(
                "no execution context".to_string(),
            ));
        };
        let out_digests = ec
            .output_file_digests()
            .map_err(|e| StagingError::OutputDigests(e.to_string()))?;
        let base = self.cmd.abs_working_dir();
        for (out, digest) in &out_digests {
            let Some(info) = pre.get(out) else { continue };
            if info.digest != *digest {
                continue;
            }
            let path = base.join(out);
            let mtime = filetime::FileTime::from_system_time(info.mtime);
            if let Err(e) = filetime::set_file_times(&path, mtime, mtime) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "unable to restore mtime of {}: {}",
                    path.display(),
                    e
                );
                continue;
            }
            debug!(
                execution_id = %self.cmd.identifiers.execution_id,
                "restored mtime of unchanged output {}",
                out
            );
            let mut md = self.fmc.get(&path);
            md.digest = Some(info.digest.clone());
            md.mtime = Some(info.mtime);
            if let Err(e) = self.fmc.update(&path, md) {
                warn!(
                    execution_id = %self.cmd.identifiers.execution_id,
                    "failed to update file metadata cache for {}: {}",
                    path.display(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Filter the remote output tree down to outputs whose local copy is
    /// missing or differs. Digest failures on an existing file include the
    /// output (download is the safe side).
    pub(crate) fn exclude_unchanged_outputs(
        &self,
        outs: Vec<OutputNode>,
        out_dir: &Path,
    ) -> Vec<OutputNode> {
        let dest_dir = if self.cmd.working_dir.is_empty() {
            out_dir.to_path_buf()
        } else {
            out_dir.join(&self.cmd.working_dir)
        };
        outs.into_iter()
            .filter(|node| {
                let dest = dest_dir.join(&node.path);
                match std::fs::metadata(&dest) {
                    Ok(_) => match Digest::of_file(&dest) {
                        Ok(digest) => digest.hash != node.digest.hash,
                        Err(e) => {
                            warn!(
                                execution_id = %self.cmd.identifiers.execution_id,
                                "failed to digest existing output {}, downloading new output: {}",
                                dest.display(),
                                e
                            );
                            true
                        }
                    },
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                execution_id = %self.cmd.identifiers.execution_id,
                                "failed to access existing output {}, downloading new output: {}",
                                dest.display(),
                                e
                            );
                        }
                        true
                    }
                }
            })
            .collect()
    }

    /// Absolute paths of every declared output file plus every file inside
    /// every declared output directory.
    pub(crate) fn output_file_list(&self) -> Vec<PathBuf> {
        let base = self.cmd.abs_working_dir();
        let mut files: Vec<PathBuf> =
            self.cmd.output_files.iter().map(|f| base.join(f)).collect();
        for d in &self.cmd.output_dirs {
            for entry in WalkDir::new(base.join(d)).into_iter().flatten() {
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{CommandIdentifiers, CommandSpec};
    use crate::fmc::{FileMetadata, FileMetadataCache, MemoryFileMetadataCache};
    use crate::forecast::Forecast;
    use crate::testing::FakeExecutionContext;
    use rap_common::ActionLabels;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn staged_action(dir: &TempDir) -> Action {
        let cmd = CommandSpec {
            identifiers: CommandIdentifiers::generate(),
            exec_root: dir.path().join("root"),
            working_dir: "out".to_string(),
            args: vec!["cc".to_string()],
            ..Default::default()
        };
        std::fs::create_dir_all(dir.path().join("root/out")).unwrap();
        let mut action = Action::new(
            cmd,
            ActionLabels::new(),
            Arc::new(MemoryFileMetadataCache::new()),
            Arc::new(Forecast::default()),
        );
        action.racing_tmp = dir.path().join("racing");
        action
    }

    #[test]
    fn test_scratch_dir_named_by_execution_id() {
        let dir = tempfile::tempdir().unwrap();
        let action = staged_action(&dir);
        let scratch = action.create_scratch_dir().unwrap();
        assert!(scratch.path().ends_with(&action.cmd.identifiers.execution_id));
        assert!(scratch.path().is_dir());
    }

    #[test]
    fn test_scratch_dir_removed_on_drop_outside_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let action = staged_action(&dir);
        let scratch = action.create_scratch_dir().unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(path.join("main.o"), b"staged").unwrap();
        std::fs::create_dir(path.join("gen")).unwrap();
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_duplicate_scratch_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let action = staged_action(&dir);
        let _scratch = action.create_scratch_dir().unwrap();
        assert!(matches!(
            action.create_scratch_dir(),
            Err(StagingError::CreateScratch { .. })
        ));
    }

    #[test]
    fn test_pre_exec_snapshot_skips_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        let wd = action.cmd.abs_working_dir();
        std::fs::write(wd.join("present.o"), b"obj").unwrap();
        action.cmd.output_files =
            vec!["present.o".to_string(), "missing.o".to_string()];

        let info = action.pre_exec_outs_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info["present.o"].digest, Digest::of_bytes(b"obj"));
    }

    #[test]
    fn test_pre_exec_snapshot_walks_output_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        let wd = action.cmd.abs_working_dir();
        std::fs::create_dir_all(wd.join("gen/sub")).unwrap();
        std::fs::write(wd.join("gen/a.h"), b"a").unwrap();
        std::fs::write(wd.join("gen/sub/b.h"), b"b").unwrap();
        action.cmd.output_dirs = vec!["gen".to_string()];

        let info = action.pre_exec_outs_info();
        assert!(info.contains_key("gen/a.h"));
        assert!(info.contains_key("gen/sub/b.h"));
    }

    #[test]
    fn test_move_outputs_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        action.cmd.output_files = vec!["obj/main.o".to_string()];
        action.cmd.output_dirs = vec!["gen".to_string()];

        let scratch = dir.path().join("stage");
        std::fs::create_dir_all(scratch.join("out/obj")).unwrap();
        std::fs::create_dir_all(scratch.join("out/gen")).unwrap();
        std::fs::write(scratch.join("out/obj/main.o"), b"obj").unwrap();
        std::fs::write(scratch.join("out/gen/g.h"), b"hdr").unwrap();
        // Stale destination directory should be replaced wholesale.
        let wd = action.cmd.abs_working_dir();
        std::fs::create_dir_all(wd.join("gen")).unwrap();
        std::fs::write(wd.join("gen/stale.h"), b"stale").unwrap();

        action.move_outputs_from_temp(&scratch).unwrap();
        assert_eq!(std::fs::read(wd.join("obj/main.o")).unwrap(), b"obj");
        assert_eq!(std::fs::read(wd.join("gen/g.h")).unwrap(), b"hdr");
        assert!(!wd.join("gen/stale.h").exists());
        assert!(!scratch.join("out/obj/main.o").exists());
    }

    #[test]
    fn test_move_outputs_skips_unstaged_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        action.cmd.output_files = vec!["main.o".to_string()];
        let scratch = dir.path().join("stage");
        std::fs::create_dir_all(scratch.join("out")).unwrap();
        // Nothing staged: metadata lookup records an error, file skipped.
        action.move_outputs_from_temp(&scratch).unwrap();
        assert!(!action.cmd.abs_working_dir().join("main.o").exists());
    }

    #[test]
    fn test_move_outputs_rename_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        action.cmd.output_files = vec!["main.o".to_string()];
        let scratch = dir.path().join("stage");
        std::fs::create_dir_all(scratch.join("out")).unwrap();
        // Poison the metadata cache so the staged path looks fine but the
        // rename has nothing to move.
        let staged = scratch.join("out/main.o");
        action
            .fmc
            .update(
                &staged,
                FileMetadata {
                    digest: Some(Digest::of_bytes(b"phantom")),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            action.move_outputs_from_temp(&scratch),
            Err(StagingError::Move { .. })
        ));
    }

    #[test]
    fn test_move_outputs_skips_staged_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        action.cmd.output_dirs = vec!["gen".to_string()];
        let scratch = dir.path().join("stage");
        std::fs::create_dir_all(scratch.join("out")).unwrap();
        // Staged entry is a file where a directory was declared.
        std::fs::write(scratch.join("out/gen"), b"not a dir").unwrap();
        action.move_outputs_from_temp(&scratch).unwrap();
        assert!(!action.cmd.abs_working_dir().join("gen").exists());
    }

    #[test]
    fn test_exclude_unchanged_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let action = staged_action(&dir);
        let wd = action.cmd.abs_working_dir();
        std::fs::write(wd.join("same.o"), b"same").unwrap();
        std::fs::write(wd.join("changed.o"), b"old").unwrap();

        let outs = vec![
            OutputNode {
                path: "same.o".to_string(),
                digest: Digest::of_bytes(b"same"),
            },
            OutputNode {
                path: "changed.o".to_string(),
                digest: Digest::of_bytes(b"new"),
            },
            OutputNode {
                path: "missing.o".to_string(),
                digest: Digest::of_bytes(b"fresh"),
            },
        ];
        let kept = action.exclude_unchanged_outputs(outs, &action.cmd.exec_root);
        let kept: Vec<&str> = kept.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(kept, vec!["changed.o", "missing.o"]);
    }

    #[tokio::test]
    async fn test_restore_unchanged_output_mtimes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        let wd = action.cmd.abs_working_dir();
        std::fs::write(wd.join("same.o"), b"same").unwrap();
        std::fs::write(wd.join("diff.o"), b"new content").unwrap();

        let original = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let mut pre = HashMap::new();
        pre.insert(
            "same.o".to_string(),
            PreExecInfo {
                digest: Digest::of_bytes(b"same"),
                mtime: original,
            },
        );
        pre.insert(
            "diff.o".to_string(),
            PreExecInfo {
                digest: Digest::of_bytes(b"old content"),
                mtime: original,
            },
        );

        let ec = FakeExecutionContext::with_output_digests(
            [
                ("same.o".to_string(), Digest::of_bytes(b"same")),
                ("diff.o".to_string(), Digest::of_bytes(b"new content")),
            ]
            .into(),
        );
        action.exec_context = Some(Arc::new(ec));
        action.restore_unchanged_output_mtimes(&pre).unwrap();

        let same_mtime = std::fs::metadata(wd.join("same.o")).unwrap().modified().unwrap();
        assert_eq!(same_mtime, original);
        let diff_mtime = std::fs::metadata(wd.join("diff.o")).unwrap().modified().unwrap();
        assert_ne!(diff_mtime, original);

        // The cache reflects the restored mtime.
        let md = action.fmc.get(&wd.join("same.o"));
        assert_eq!(md.mtime, Some(original));
    }

    #[test]
    fn test_output_file_list_includes_dir_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut action = staged_action(&dir);
        let wd = action.cmd.abs_working_dir();
        std::fs::create_dir_all(wd.join("gen")).unwrap();
        std::fs::write(wd.join("gen/a.h"), b"a").unwrap();
        action.cmd.output_files = vec!["main.o".to_string()];
        action.cmd.output_dirs = vec!["gen".to_string()];

        let list = action.output_file_list();
        assert!(list.contains(&wd.join("main.o")));
        assert!(list.contains(&wd.join("gen/a.h")));
    }
}
