use cgt_common::{CgroupEvent, CgroupEventKind, EventReceiver};
use cgt_route::{PolicyRouter, RouteNetlink};
use tracing::Instrument as _;

use crate::{config::TProxy, Classifier, Config, MatcherError, Matchers};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A setup failure. Whatever was installed before the failure has already been removed by the
/// time this is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The local default routes could not be installed.
    #[error("failed to add routes")]
    Route(#[source] cgt_route::Error),
    /// The classifier rejected a tproxy.
    #[error("failed to initialize classification for tproxy `{name}`")]
    Classifier { name: String, source: BoxError },
    /// The fwmark rules of a tproxy could not be installed.
    #[error("failed to add route rule for tproxy `{name}`")]
    Rule { name: String, source: cgt_route::Error },
}

/// Lifecycle of a [`RuleManager::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing installed yet.
    Idle,
    /// The local default routes are installed.
    RoutesUp,
    /// Every tproxy has its classification and mark rules.
    ClassificationUp,
    /// Cgroup events are being handled.
    EventLoop,
    /// Installed state is being removed.
    TearingDown,
    /// Everything has been removed. Terminal.
    Stopped,
}

/// Kernel state acquired during startup. Released in reverse acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquired {
    Routes,
    Rules,
    Classification,
}

/// Installs routing and classification state, then keeps per-cgroup directives in sync with
/// a stream of cgroup events until that stream is closed.
pub struct RuleManager<C, N> {
    tproxies: Vec<TProxy>,
    matchers: Matchers,
    classifier: C,
    router: PolicyRouter<N>,
    events: EventReceiver,
    span: tracing::Span,
    state: State,
}

impl<C, N> RuleManager<C, N>
where
    C: Classifier,
    N: RouteNetlink,
{
    /// Creates a new manager. Rules are compiled here, once; `span` is the span every log line
    /// of the manager is emitted in.
    pub fn new(
        config: &Config,
        classifier: C,
        netlink: N,
        events: EventReceiver,
        span: tracing::Span,
    ) -> Result<Self, MatcherError> {
        let matchers = Matchers::from_config(config)?;

        Ok(Self {
            tproxies: config.tproxies.clone(),
            matchers,
            classifier,
            router: PolicyRouter::new(netlink, config.route_table),
            events,
            span,
            state: State::Idle,
        })
    }

    /// The current stage of [`RuleManager::run`].
    pub fn state(&self) -> State {
        self.state
    }

    /// The classifier this manager drives.
    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// The router holding the installed routes and rules.
    pub fn router(&self) -> &PolicyRouter<N> {
        &self.router
    }

    /// Runs the manager until the event stream is closed.
    ///
    /// Everything installed along the way is removed before this returns, whether it returns
    /// `Ok(())` because the stream was closed or an [`Error`] because setup failed. Failures
    /// during removal are logged, never returned.
    pub async fn run(&mut self) -> Result<(), Error> {
        let span = self.span.clone();

        async {
            let mut acquired = Vec::new();
            let res = self.setup_and_serve(&mut acquired).await;
            if let Err(e) = &res {
                tracing::error!(error = e as &dyn std::error::Error, "rule manager setup failed");
            }

            self.teardown(acquired).await;
            res
        }
        .instrument(span)
        .await
    }

    async fn setup_and_serve(&mut self, acquired: &mut Vec<Acquired>) -> Result<(), Error> {
        // Pushed before installing: routes are tracked one by one, so a partial install is
        // still rolled back.
        acquired.push(Acquired::Routes);
        self.router.install_default_routes().await.map_err(Error::Route)?;
        self.state = State::RoutesUp;

        acquired.push(Acquired::Rules);
        acquired.push(Acquired::Classification);
        for tp in &self.tproxies {
            tracing::info!(name = %tp.name, mark = tp.mark, port = tp.port, "initializing tproxy");

            self.classifier
                .init_target(tp)
                .await
                .map_err(|e| Error::Classifier { name: tp.name.clone(), source: Box::new(e) })?;

            self.router
                .install_mark_rule(tp.mark)
                .await
                .map_err(|source| Error::Rule { name: tp.name.clone(), source })?;
        }
        self.state = State::ClassificationUp;

        tracing::info!(rules = self.matchers.len(), "waiting for cgroup events");
        self.state = State::EventLoop;

        while let Some(event) = self.events.recv().await {
            let span = tracing::debug_span!("cgroup_event", cgroup = %event.path);
            self.handle_event(event).instrument(span).await;
        }

        tracing::info!("cgroup event stream closed");
        Ok(())
    }

    async fn handle_event(&mut self, event: CgroupEvent) {
        match event.kind {
            CgroupEventKind::Created => self.handle_new_cgroup(&event.path).await,
            CgroupEventKind::Removed => self.handle_removed_cgroup(&event.path).await,
        }
    }

    async fn handle_new_cgroup(&mut self, path: &str) {
        let Some(matcher) = self.matchers.find(path) else {
            tracing::debug!(cgroup = path, "no rule matches this cgroup");
            return;
        };

        tracing::info!(cgroup = path, rule = %matcher, "rule found for this cgroup");

        let target = matcher.target();
        if target.is_noop() {
            return;
        }

        if let Err(e) = self.classifier.add_cgroup(path, target).await {
            tracing::error!(
                cgroup = path,
                error = &e as &dyn std::error::Error,
                "failed to add classification for new cgroup"
            );
        }
    }

    async fn handle_removed_cgroup(&mut self, path: &str) {
        if let Err(e) = self.classifier.remove_cgroup(path).await {
            tracing::error!(
                cgroup = path,
                error = &e as &dyn std::error::Error,
                "failed to remove classification for removed cgroup"
            );
        }
    }

    async fn teardown(&mut self, mut acquired: Vec<Acquired>) {
        self.state = State::TearingDown;

        while let Some(resource) = acquired.pop() {
            tracing::debug!(?resource, "releasing");

            match resource {
                Acquired::Classification => {
                    if let Err(e) = self.classifier.clear().await {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            "failed to clear classification table"
                        );
                    }
                }
                Acquired::Rules => self.router.teardown_rules().await,
                Acquired::Routes => self.router.teardown_routes().await,
            }
        }

        self.state = State::Stopped;
    }
}

impl<C, N> std::fmt::Debug for RuleManager<C, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleManager")
            .field("tproxies", &self.tproxies)
            .field("matchers", &self.matchers)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
