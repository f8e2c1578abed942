use crate::{
    ip::{Family, LOOPBACK},
    netlink::{ManagedRoute, ManagedRule, NetlinkError, RouteNetlink},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to find loopback interface")]
    Loopback(#[source] NetlinkError),
    #[error("failed to add route `{route}`")]
    AddRoute { route: ManagedRoute, source: NetlinkError },
    #[error("failed to add rule `{rule}`")]
    AddRule { rule: ManagedRule, source: NetlinkError },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Installs the routes and mark rules that send marked traffic into a dedicated table, and
/// remembers them so they can be removed again.
///
/// Every route or rule that was successfully installed is tracked exactly once, and the
/// teardown methods attempt to remove exactly the tracked set. Rules that were already present
/// in the kernel are tracked (and later removed) as if this router had created them.
#[derive(Debug)]
pub struct PolicyRouter<N> {
    netlink: N,
    table: u32,
    routes: Vec<ManagedRoute>,
    rules: Vec<ManagedRule>,
}

impl<N: RouteNetlink> PolicyRouter<N> {
    pub fn new(netlink: N, table: u32) -> Self {
        Self { netlink, table, routes: Vec::new(), rules: Vec::new() }
    }

    /// The routing table this router installs into.
    pub fn table(&self) -> u32 {
        self.table
    }

    /// Routes installed so far, in installation order.
    pub fn routes(&self) -> &[ManagedRoute] {
        &self.routes
    }

    /// Rules installed so far, in installation order.
    pub fn rules(&self) -> &[ManagedRule] {
        &self.rules
    }

    pub fn netlink(&self) -> &N {
        &self.netlink
    }

    /// `ip route add local default dev lo table <table>`, for IPv4 then IPv6.
    ///
    /// Each route is tracked as soon as it is installed, so on failure the routes that did make
    /// it are still removed by [`Self::teardown_routes`], which the caller is responsible for.
    pub async fn install_default_routes(&mut self) -> Result<()> {
        tracing::info!(table = self.table, "adding local default routes");

        let oif = self.netlink.link_index(LOOPBACK).map_err(Error::Loopback)?;

        for family in Family::ALL {
            let route = ManagedRoute { family, table: self.table, oif };

            self.netlink
                .add_route(&route)
                .await
                .map_err(|source| Error::AddRoute { route, source })?;

            tracing::debug!(%route, "route added");
            self.routes.push(route);
        }

        Ok(())
    }

    /// `ip rule add fwmark <mark> lookup <table>`, for IPv4 then IPv6.
    ///
    /// A rule that already exists counts as installed: it is left in place and tracked, so a
    /// crashed previous run doesn't prevent startup.
    pub async fn install_mark_rule(&mut self, mark: u32) -> Result<()> {
        tracing::info!(mark, table = self.table, "adding route rule");

        for family in Family::ALL {
            let rule = ManagedRule { family, mark, table: self.table };

            match self.netlink.add_rule(&rule).await {
                Ok(()) => tracing::debug!(%rule, "rule added"),
                Err(NetlinkError::AlreadyExists) => tracing::info!(%rule, "rule already exists"),
                Err(source) => return Err(Error::AddRule { rule, source }),
            }

            self.rules.push(rule);
        }

        Ok(())
    }

    /// Removes every tracked rule. Failures are logged and don't stop the removal of the others.
    pub async fn teardown_rules(&mut self) {
        for rule in std::mem::take(&mut self.rules) {
            if let Err(e) = self.netlink.del_rule(&rule).await {
                tracing::error!(
                    %rule,
                    error = &e as &dyn std::error::Error,
                    "failed to delete route rule"
                );
                continue;
            }
            tracing::debug!(%rule, "rule removed");
        }
    }

    /// Removes every tracked route. Failures are logged and don't stop the removal of the others.
    pub async fn teardown_routes(&mut self) {
        for route in std::mem::take(&mut self.routes) {
            if let Err(e) = self.netlink.del_route(&route).await {
                tracing::warn!(
                    %route,
                    error = &e as &dyn std::error::Error,
                    "failed to remove route"
                );
                continue;
            }
            tracing::debug!(%route, "route removed");
        }
    }
}
