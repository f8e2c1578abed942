//! Types shared by the cgroup monitor and the rule manager.

#![doc(issue_tracker_base_url = "https://github.com/chainbound/cgt/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::fmt;

/// The bounded stream cgroup events are sent over.
pub mod channel;

pub use channel::{channel, EventReceiver, EventSender};

/// What happened to a cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CgroupEventKind {
    /// The cgroup appeared, or existed when monitoring started.
    Created,
    /// The cgroup was removed.
    Removed,
}

/// A cgroup lifecycle event. The path is relative to the cgroup root and starts with `/`,
/// e.g. `/user.slice/app.slice/foo.service`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CgroupEvent {
    /// What happened.
    pub kind: CgroupEventKind,
    /// Path of the cgroup, relative to the cgroup root.
    pub path: String,
}

impl CgroupEvent {
    /// A [`CgroupEventKind::Created`] event for `path`.
    #[inline]
    pub fn created(path: impl Into<String>) -> Self {
        Self { kind: CgroupEventKind::Created, path: path.into() }
    }

    /// A [`CgroupEventKind::Removed`] event for `path`.
    #[inline]
    pub fn removed(path: impl Into<String>) -> Self {
        Self { kind: CgroupEventKind::Removed, path: path.into() }
    }
}

impl fmt::Display for CgroupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CgroupEventKind::Created => write!(f, "created({})", self.path),
            CgroupEventKind::Removed => write!(f, "removed({})", self.path),
        }
    }
}
