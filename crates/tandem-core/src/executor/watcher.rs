//! Workdir watcher - `change` events for filesystem mutations
//!
//! Started lazily on an executor's first turn and stopped when its loop
//! exits. Hidden, temp, and log files are filtered out. Acquisition
//! failure is non-fatal; the loop proceeds without a watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::bus::{topics, BusPayload, EventBus};

const NOISE_EXTENSIONS: &[&str] = &["tmp", "log", "swp", "swx", "bak"];

/// Paths that never produce change events.
pub fn is_noise(path: &Path) -> bool {
    let hidden = path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| s.starts_with('.') && s != "." && s != "..")
    });
    if hidden {
        return true;
    }

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if name.ends_with('~') {
            return true;
        }
    }

    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| NOISE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Live watch on one task workdir. Dropping it stops the watch.
pub struct WorkdirWatcher {
    _watcher: RecommendedWatcher,
}

impl WorkdirWatcher {
    pub fn start(bus: Arc<EventBus>, task_uuid: String, workdir: PathBuf) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let Ok(event) = result else {
                    return;
                };
                for path in event.paths {
                    if is_noise(&path) {
                        continue;
                    }
                    bus.emit(
                        topics::CHANGE,
                        &task_uuid,
                        BusPayload::Change {
                            task_uuid: task_uuid.clone(),
                            path: path.clone(),
                        },
                    );
                }
            },
            Config::default(),
        )?;

        watcher.watch(&workdir, RecursiveMode::Recursive)?;
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_and_temp_paths_are_noise() {
        assert!(is_noise(Path::new("/work/.git/index")));
        assert!(is_noise(Path::new("/work/build.log")));
        assert!(is_noise(Path::new("/work/scratch.tmp")));
        assert!(is_noise(Path::new("/work/file.txt~")));
    }

    #[test]
    fn ordinary_source_paths_are_not_noise() {
        assert!(!is_noise(Path::new("/work/src/main.rs")));
        assert!(!is_noise(Path::new("/work/README.md")));
    }
}
