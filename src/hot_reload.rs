// =============================================================================
// HOT RELOAD - Watch compiled shaders and flag changes
// =============================================================================
//
// The watcher thread only sets a flag; the event loop picks it up between
// frames and rebuilds the pipeline on the main thread.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ShaderWatcher {
    // Dropping the watcher stops the notification thread
    _watcher: RecommendedWatcher,
    changed: Arc<AtomicBool>,
}

impl ShaderWatcher {
    /// Watch the directories containing `files` for changes to those files
    pub fn new(files: &[&Path]) -> Result<Self> {
        let changed = Arc::new(AtomicBool::new(false));
        let names: Vec<OsString> = files
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_os_string()))
            .collect();

        let flag = changed.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if touches_any(&event, &names) {
                        log::debug!("Shader change detected: {:?}", event.paths);
                        flag.store(true, Ordering::Release);
                    }
                }
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        })
        .context("Failed to create shader watcher")?;

        for dir in watch_dirs(files) {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            changed,
        })
    }

    /// True once per batch of changes since the last call
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

/// Parent directories of `files`, without repeats
fn watch_dirs(files: &[&Path]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for file in files {
        let dir = match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// A create or modify event on one of the watched file names
fn touches_any(event: &Event, names: &[OsString]) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event.paths.iter().any(|path| {
        path.file_name()
            .is_some_and(|name| names.iter().any(|watched| watched == name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn names() -> Vec<OsString> {
        vec![OsString::from("model.vert.spv"), OsString::from("model.frag.spv")]
    }

    #[test]
    fn modify_of_watched_file_counts() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/project/shaders/model.frag.spv"));
        assert!(touches_any(&event, &names()));

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("shaders/model.vert.spv"));
        assert!(touches_any(&event, &names()));
    }

    #[test]
    fn other_files_and_kinds_are_ignored() {
        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("shaders/model.frag"));
        assert!(!touches_any(&event, &names()));

        let event = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("shaders/model.frag.spv"));
        assert!(!touches_any(&event, &names()));
    }

    #[test]
    fn shared_directory_is_watched_once() {
        let dirs = watch_dirs(&[
            Path::new("shaders/model.vert.spv"),
            Path::new("shaders/model.frag.spv"),
            Path::new("local.spv"),
        ]);
        assert_eq!(dirs, vec![PathBuf::from("shaders"), PathBuf::from(".")]);
    }
}
