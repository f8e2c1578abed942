//! # Policy routing for marked traffic
//!
//! Makes packets carrying a given firewall mark resolve through a dedicated routing table, and
//! makes that table treat every IPv4/IPv6 destination as local to the loopback interface:
//!
//! ```text
//! ip route add local 0.0.0.0/0 dev lo table <table>
//! ip -6 route add local ::/0 dev lo table <table>
//! ip rule add fwmark <mark> lookup <table>
//! ip -6 rule add fwmark <mark> lookup <table>
//! ```
//!
//! A packet marked in the `output` path is therefore rerouted onto `lo`, comes back through
//! `prerouting` and can be picked up by a transparent proxy.
//!
//! The kernel is reached through the [`RouteNetlink`] trait. [`RtNetlink`] is the production
//! implementation backed by [`rtnetlink`].

#![doc(issue_tracker_base_url = "https://github.com/chainbound/cgt/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod ip;
pub mod netlink;
pub mod router;
mod wrappers;

pub use ip::Family;
pub use netlink::{ManagedRoute, ManagedRule, NetlinkError, RouteNetlink, RtNetlink};
pub use router::{Error, PolicyRouter, Result};
