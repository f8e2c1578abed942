use std::future::Future;

use crate::{config::TProxy, Target};

/// Owns a kernel packet-classification table and keeps per-cgroup directives in it.
///
/// The [`RuleManager`](crate::RuleManager) calls a classifier sequentially from a single task
/// and never concurrently with itself. Other processes may share the underlying table; keeping
/// it consistent under that condition is up to the implementation.
///
/// Implementations must tolerate [`Classifier::add_cgroup`] for a path that has no directive
/// yet (and for one that already has one, replacing it), and [`Classifier::remove_cgroup`] for
/// a path that has none.
pub trait Classifier: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Installs the base chains and rules for one transparent proxy, keyed by its mark. Called
    /// once per configured proxy during startup.
    fn init_target(
        &mut self,
        tproxy: &TProxy,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Installs or updates the directive for the cgroup at `path`.
    fn add_cgroup(
        &mut self,
        path: &str,
        target: &Target,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Removes the directive for the cgroup at `path`, if any.
    fn remove_cgroup(&mut self, path: &str)
        -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Removes everything this classifier owns in one operation.
    fn clear(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
