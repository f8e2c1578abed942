use std::fmt;

/// What to do with the traffic of a cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    /// Leave the cgroup alone.
    #[default]
    Noop,
    /// Mark the cgroup's traffic so it is routed to the transparent proxy owning `mark`.
    Redirect {
        /// Firewall mark of the proxy.
        mark: u32,
    },
    /// Let the cgroup's traffic through untouched, shadowing any directive of a parent cgroup.
    Direct,
    /// Drop the cgroup's traffic.
    Drop,
}

impl Target {
    /// Whether this target leaves the cgroup alone.
    #[inline]
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Redirect { mark } => write!(f, "redirect(mark={mark:#x})"),
            Self::Direct => f.write_str("direct"),
            Self::Drop => f.write_str("drop"),
        }
    }
}
