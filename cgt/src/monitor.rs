//! Watching the cgroup v2 hierarchy.

use std::{
    io,
    path::{Path, PathBuf},
};

use cgt_common::{CgroupEvent, CgroupEventKind, EventSender};
use notify::{
    event::{CreateKind, RemoveKind},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The initial walk failed.
    #[error("failed to walk the cgroup hierarchy")]
    Io(#[from] io::Error),
    /// The watch could not be set up.
    #[error("failed to watch the cgroup hierarchy")]
    Watch(#[from] notify::Error),
    /// The receiving end of the event stream is gone.
    #[error("event stream closed")]
    Closed,
    /// [`CgroupMonitor::stop`] was called before.
    #[error("monitor already stopped")]
    Stopped,
}

/// Turns the cgroup v2 hierarchy under `root` into [`CgroupEvent`]s.
///
/// [`CgroupMonitor::start`] reports every existing cgroup, parents before children, then keeps
/// reporting created and removed cgroups until the monitor is stopped or dropped. Stopping it
/// drops its senders, which closes the stream.
#[derive(Debug)]
pub struct CgroupMonitor {
    root: PathBuf,
    events: Option<EventSender>,
    watcher: Option<RecommendedWatcher>,
}

impl CgroupMonitor {
    pub fn new(root: impl Into<PathBuf>, events: EventSender) -> Self {
        Self { root: root.into(), events: Some(events), watcher: None }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn start(&mut self) -> Result<(), MonitorError> {
        let events = self.events.clone().ok_or(MonitorError::Stopped)?;

        // Watching first: a cgroup created during the walk may be reported twice, never missed.
        let root = self.root.clone();
        let tx = events.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "cgroup watch error");
                    return;
                }
            };

            for event in cgroup_events(&root, &event) {
                // Runs on the watcher's own thread, never inside the runtime.
                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self.watcher = Some(watcher);

        let root = self.root.clone();
        let existing = tokio::task::spawn_blocking(move || existing_cgroups(&root))
            .await
            .map_err(io::Error::other)??;

        tracing::info!(root = ?self.root, cgroups = existing.len(), "watching cgroup hierarchy");

        for path in existing {
            events.send(CgroupEvent::created(path)).await.map_err(|_| MonitorError::Closed)?;
        }

        Ok(())
    }

    /// Stops watching and closes the event stream.
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.root) {
                tracing::debug!(error = %e, "failed to unwatch cgroup hierarchy");
            }
        }
        self.events = None;
    }
}

/// Every cgroup below `root` as a path relative to it, parents before children and siblings
/// in name order. The root itself is not included.
///
/// Cgroups that vanish while being walked are skipped, along with their children.
pub fn existing_cgroups(root: &Path) -> io::Result<Vec<String>> {
    walk(root, subdirectories)
}

fn walk(
    root: &Path,
    mut children_of: impl FnMut(&Path) -> io::Result<Vec<PathBuf>>,
) -> io::Result<Vec<String>> {
    let mut cgroups = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut children = match children_of(&dir) {
            Ok(children) => children,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir != root => {
                tracing::debug!(path = ?dir, "cgroup vanished during walk");
                continue;
            }
            Err(e) => return Err(e),
        };
        children.sort();

        for child in &children {
            match relative_path(root, child) {
                Some(path) => cgroups.push(path),
                None => tracing::warn!(path = ?child, "skipping cgroup with a non UTF-8 path"),
            }
        }
        // Reversed so that the stack pops them in name order.
        stack.extend(children.into_iter().rev());
    }

    Ok(cgroups)
}

/// The directories directly below `dir`. Entries removed while listing are left out.
fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => children.push(entry.path()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(children)
}

/// Maps `path` to the cgroup path it stands for, e.g. `/sys/fs/cgroup/user.slice` to
/// `/user.slice`. `None` for the root itself, paths outside of it and non UTF-8 paths.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.to_str()?;
    if relative.is_empty() {
        return None;
    }
    Some(format!("/{relative}"))
}

/// The cgroup events a filesystem event stands for. Only directories are cgroups.
pub fn cgroup_events(root: &Path, event: &Event) -> Vec<CgroupEvent> {
    let kind = match event.kind {
        EventKind::Create(CreateKind::Folder) => CgroupEventKind::Created,
        EventKind::Remove(RemoveKind::Folder) => CgroupEventKind::Removed,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| relative_path(root, path))
        .map(|path| CgroupEvent { kind, path })
        .collect()
}
