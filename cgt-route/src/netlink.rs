//! The kernel-facing side of the policy router.
//!
//! [`RtNetlink`] builds raw `RTM_{NEW,DEL}{ROUTE,RULE}` requests and sends them over a
//! [`rtnetlink::Handle`]: fill in the message, set the netlink flags, and drain the response
//! stream looking for an error payload.

use std::{
    fmt,
    future::Future,
    io,
    net::IpAddr,
};

use futures::StreamExt as _;
use rtnetlink::{
    packet_core::{
        NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST,
    },
    packet_route::{
        route::{
            RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
        },
        rule::{RuleAction, RuleAttribute, RuleMessage},
        RouteNetlinkMessage,
    },
};
use tokio::task::JoinHandle;

use crate::{ip::Family, wrappers};

/// A "local default route via loopback" installed into a dedicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedRoute {
    pub family: Family,
    pub table: u32,
    /// Index of the output interface.
    pub oif: u32,
}

impl fmt::Display for ManagedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local {} dev #{} table {}", self.family, self.oif, self.table)
    }
}

/// A "fwmark `mark` lookup `table`" policy routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedRule {
    pub family: Family,
    pub mark: u32,
    pub table: u32,
}

impl fmt::Display for ManagedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self.family {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        };
        write!(f, "{v} fwmark {:#x} lookup {}", self.mark, self.table)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    /// The kernel answered `EEXIST`.
    #[error("object already exists")]
    AlreadyExists,
    #[error("rtnetlink error")]
    RtNetlink(#[from] rtnetlink::Error),
    #[error("io error")]
    Io(#[from] io::Error),
}

impl NetlinkError {
    fn from_rtnetlink(error: rtnetlink::Error) -> Self {
        match &error {
            rtnetlink::Error::NetlinkError(msg)
                if msg.code.map(|c| c.get()) == Some(-nix::libc::EEXIST) =>
            {
                Self::AlreadyExists
            }
            _ => Self::RtNetlink(error),
        }
    }
}

/// Operations on kernel routes and policy rules needed by the
/// [`PolicyRouter`](crate::PolicyRouter).
pub trait RouteNetlink: Send {
    /// Resolves an interface name to its index.
    fn link_index(&self, name: &str) -> Result<u32, NetlinkError>;

    fn add_route(
        &mut self,
        route: &ManagedRoute,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn del_route(
        &mut self,
        route: &ManagedRoute,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Adds a rule. Must report an already present rule as [`NetlinkError::AlreadyExists`].
    fn add_rule(
        &mut self,
        rule: &ManagedRule,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn del_rule(
        &mut self,
        rule: &ManagedRule,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;
}

/// [`RouteNetlink`] over a [`rtnetlink::Handle`] bound to the current network namespace.
#[derive(Debug)]
pub struct RtNetlink {
    handle: rtnetlink::Handle,
    _rtnetlink_socket_task: JoinHandle<()>,
}

impl RtNetlink {
    /// Opens a netlink socket and spawns its connection task. Must be called from within a
    /// Tokio runtime.
    pub fn new() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let task = tokio::spawn(connection);

        Ok(Self { handle, _rtnetlink_socket_task: task })
    }

    async fn request(
        &mut self,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<(), NetlinkError> {
        let mut nl_req = NetlinkMessage::from(message);
        nl_req.header.flags = flags;

        let mut res = self.handle.request(nl_req).map_err(NetlinkError::from_rtnetlink)?;
        while let Some(msg) = res.next().await {
            if let NetlinkPayload::Error(e) = msg.payload {
                // An error message without a code is the kernel's ACK.
                if e.code.is_none() {
                    continue;
                }
                tracing::debug!(?e, "netlink request failed");
                return Err(NetlinkError::from_rtnetlink(rtnetlink::Error::NetlinkError(e)));
            }
        }

        Ok(())
    }
}

impl RouteNetlink for RtNetlink {
    fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
        Ok(wrappers::if_nametoindex(name)?.get())
    }

    async fn add_route(&mut self, route: &ManagedRoute) -> Result<(), NetlinkError> {
        let message = RouteNetlinkMessage::NewRoute(route_message(route));
        self.request(message, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL).await
    }

    async fn del_route(&mut self, route: &ManagedRoute) -> Result<(), NetlinkError> {
        let message = RouteNetlinkMessage::DelRoute(route_message(route));
        self.request(message, NLM_F_REQUEST | NLM_F_ACK).await
    }

    async fn add_rule(&mut self, rule: &ManagedRule) -> Result<(), NetlinkError> {
        let message = RouteNetlinkMessage::NewRule(rule_message(rule));
        self.request(message, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL).await
    }

    async fn del_rule(&mut self, rule: &ManagedRule) -> Result<(), NetlinkError> {
        let message = RouteNetlinkMessage::DelRule(rule_message(rule));
        self.request(message, NLM_F_REQUEST | NLM_F_ACK).await
    }
}

/// Tables above 255 don't fit the header field, the `RTA_TABLE` attribute carries them instead.
fn header_table(table: u32) -> u8 {
    u8::try_from(table).unwrap_or(0)
}

/// `ip route add local <default prefix> dev <oif> table <table>`
fn route_message(route: &ManagedRoute) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.address_family = route.family.address_family();
    message.header.destination_prefix_length = 0;
    message.header.table = header_table(route.table);
    message.header.protocol = RouteProtocol::Static;
    message.header.scope = RouteScope::Host;
    message.header.kind = RouteType::Local;

    let destination = match route.family.unspecified() {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    };
    message.attributes.push(RouteAttribute::Destination(destination));
    message.attributes.push(RouteAttribute::Oif(route.oif));
    message.attributes.push(RouteAttribute::Table(route.table));

    message
}

/// `ip rule add fwmark <mark> lookup <table>`
fn rule_message(rule: &ManagedRule) -> RuleMessage {
    let mut message = RuleMessage::default();
    message.header.family = rule.family.address_family();
    message.header.table = header_table(rule.table);
    message.header.action = RuleAction::ToTable;

    message.attributes.push(RuleAttribute::Table(rule.table));
    message.attributes.push(RuleAttribute::FwMark(rule.mark));

    message
}
