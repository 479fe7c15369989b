use std::path::PathBuf;
use std::time::SystemTime;

/// Watches shader sources for modification. Polled every 32 frames; each
/// changed path triggers a shader recompile and a rebuild of the pipelines
/// referencing it.
pub struct ShaderWatcher {
    entries: Vec<WatchEntry>,
}

struct WatchEntry {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl ShaderWatcher {
    pub fn new() -> ShaderWatcher {
        ShaderWatcher {
            entries: Vec::new(),
        }
    }

    pub fn watch(&mut self, path: &str) {
        if self.entries.iter().any(|entry| entry.path.as_os_str() == path) {
            return;
        }
        let path = PathBuf::from(path);
        let mtime = modified(&path);
        self.entries.push(WatchEntry { path, mtime });
    }

    /// Paths whose mtime moved since the last poll.
    pub fn poll(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for entry in &mut self.entries {
            let mtime = modified(&entry.path);
            if mtime != entry.mtime {
                entry.mtime = mtime;
                changed.push(entry.path.display().to_string());
            }
        }
        changed
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_do_not_spam_changes() {
        let mut watcher = ShaderWatcher::new();
        watcher.watch("no/such/shader.vert");
        assert!(watcher.poll().is_empty());
        assert!(watcher.poll().is_empty());
    }

    #[test]
    fn duplicate_watches_are_ignored() {
        let mut watcher = ShaderWatcher::new();
        watcher.watch("a.vert");
        watcher.watch("a.vert");
        assert_eq!(watcher.entries.len(), 1);
    }
}
