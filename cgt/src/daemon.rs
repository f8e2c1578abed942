use std::{future::Future, io};

use cgt_nft::NftClassifier;
use cgt_route::RtNetlink;
use cgt_rules::{Config, MatcherError, RuleManager};
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    task::{JoinError, JoinHandle},
};

use crate::monitor::{CgroupMonitor, MonitorError};

/// Room for events produced by the initial walk of a busy hierarchy.
const EVENT_BUFFER: usize = 1024;

/// Why the daemon stopped, if not because of a signal.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The rtnetlink connection could not be set up.
    #[error("failed to open netlink socket")]
    Netlink(#[source] io::Error),
    /// SIGINT or SIGTERM could not be caught.
    #[error("failed to install signal handler")]
    Signal(#[source] io::Error),
    /// A rule could not be compiled.
    #[error(transparent)]
    Rules(#[from] MatcherError),
    /// The rule manager failed to set up.
    #[error(transparent)]
    Manager(#[from] cgt_rules::Error),
    /// The cgroup monitor failed to start.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    /// The rule manager task panicked.
    #[error("rule manager task failed")]
    Join(#[from] JoinError),
}

/// Wires a [`CgroupMonitor`] to a [`RuleManager`] driving nftables and the kernel's routing
/// policy database.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Creates a daemon for an already validated `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs until SIGINT or SIGTERM is received, or until the rule manager stops on its own.
    /// Everything the manager installed is removed before this returns.
    pub async fn run(self) -> Result<(), DaemonError> {
        let Self { config } = self;

        // Before anything is installed, so that a signal never skips the teardown.
        let mut shutdown = Shutdown::install()?;

        let (tx, rx) = cgt_common::channel(EVENT_BUFFER);

        let netlink = RtNetlink::new().map_err(DaemonError::Netlink)?;
        let classifier = NftClassifier::new(config.bypass.clone());
        tracing::debug!(table = classifier.table(), "classifying through nftables");
        let span = tracing::info_span!("rule_manager", table = config.route_table);
        let mut manager = RuleManager::new(&config, classifier, netlink, rx, span)?;

        let mut manager_task = tokio::spawn(async move { manager.run().await });

        let mut monitor = CgroupMonitor::new(&config.cgroup_root, tx);
        let stop = supervise(monitor.start(), &mut shutdown, &mut manager_task).await;

        // Closes the event stream; the manager tears down once it has drained it.
        monitor.stop();

        match stop {
            Stop::Signal => {
                tracing::info!("shutting down");
                Ok(manager_task.await??)
            }
            // Setup failed; the manager already cleaned up after itself.
            Stop::Manager(res) => Ok(res??),
            // The manager hung up before the walk was done, its result says why.
            Stop::Monitor(MonitorError::Closed) => Ok(manager_task.await??),
            Stop::Monitor(e) => {
                manager_task.await??;
                Err(e.into())
            }
        }
    }
}

/// SIGTERM and SIGINT handlers. The process' default disposition is replaced as soon as this
/// is installed.
#[derive(Debug)]
struct Shutdown {
    terminate: Signal,
    interrupt: Signal,
}

impl Shutdown {
    fn install() -> Result<Self, DaemonError> {
        let terminate = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
        let interrupt = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;
        Ok(Self { terminate, interrupt })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => tracing::debug!("received SIGTERM"),
            _ = self.interrupt.recv() => tracing::debug!("received SIGINT"),
        }
    }
}

#[derive(Debug)]
enum Stop {
    Signal,
    Manager(Result<Result<(), cgt_rules::Error>, JoinError>),
    Monitor(MonitorError),
}

/// Waits for the first of: a shutdown signal, the manager stopping, or the monitor failing to
/// start. Signals are listened for during the initial walk too.
async fn supervise(
    start: impl Future<Output = Result<(), MonitorError>>,
    shutdown: &mut Shutdown,
    manager: &mut JoinHandle<Result<(), cgt_rules::Error>>,
) -> Stop {
    let started = tokio::select! {
        res = start => res,
        () = shutdown.recv() => return Stop::Signal,
        res = &mut *manager => return Stop::Manager(res),
    };

    if let Err(e) = started {
        return Stop::Monitor(e);
    }

    tokio::select! {
        () = shutdown.recv() => Stop::Signal,
        res = manager => Stop::Manager(res),
    }
}

#[cfg(test)]
mod tests {
    use std::{future::pending, time::Duration};

    use nix::sys::signal::{raise, Signal as NixSignal};

    use super::*;

    async fn supervise_with(
        start: impl Future<Output = Result<(), MonitorError>>,
        shutdown: &mut Shutdown,
        manager: &mut JoinHandle<Result<(), cgt_rules::Error>>,
    ) -> Stop {
        tokio::time::timeout(Duration::from_secs(5), supervise(start, shutdown, manager))
            .await
            .expect("supervise did not return")
    }

    // Both cases share one test: the signal is process-wide and would leak into a concurrent one.
    #[tokio::test]
    async fn stops_on_manager_exit_or_signal_during_walk() {
        let mut shutdown = Shutdown::install().unwrap();

        let mut finished = tokio::spawn(async { Ok(()) });
        let stop = supervise_with(pending(), &mut shutdown, &mut finished).await;
        assert!(matches!(stop, Stop::Manager(Ok(Ok(())))));

        let mut failed = tokio::spawn(async { Ok(()) });
        let stop = supervise_with(async { Err(MonitorError::Stopped) }, &mut shutdown, &mut failed)
            .await;
        assert!(matches!(stop, Stop::Monitor(MonitorError::Stopped)));

        // The walk never finishes and the manager never stops: only the signal can end this.
        let mut running = tokio::spawn(pending());
        raise(NixSignal::SIGTERM).unwrap();
        let stop = supervise_with(pending(), &mut shutdown, &mut running).await;
        assert!(matches!(stop, Stop::Signal));
        running.abort();
    }
}
