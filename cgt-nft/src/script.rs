//! Rendering of the nftables scripts applied by the classifier.
//!
//! ```text
//! table inet cgtproxy
//! ├── set bypass4 / bypass6         destinations never redirected
//! ├── chain prerouting              (filter, mangle) marked traffic → tproxy port
//! ├── chain output                  (route, mangle)  bypass → return, local → return, jump cgroups
//! └── chain cgroups                 one directive per cgroup, deepest cgroups first
//! ```
//!
//! Marking a packet in the `route` type `output` chain triggers a reroute; the policy rules
//! installed alongside send it to a table whose default route is local, so it loops back through
//! `prerouting` where the tproxy statement for its mark picks it up.

use std::fmt::Write as _;

use cgt_rules::{TProxy, Target};
use ipnet::IpNet;

/// Name of the nftables table owned by the classifier.
pub const DEFAULT_TABLE: &str = "cgtproxy";

const CGROUPS_CHAIN: &str = "cgroups";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("the root cgroup can't be classified")]
    Root,
    #[error("cgroup path `{0}` contains characters that can't be quoted")]
    Unquotable(String),
}

/// A cgroup directive ready to be rendered: the path relative to the cgroup root without the
/// leading `/`, and its depth in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPath {
    relative: String,
    level: usize,
}

impl CgroupPath {
    /// Parses a path such as `/user.slice/app.slice/foo.service`.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.contains(['"', '\n', '\\']) {
            return Err(PathError::Unquotable(path.to_owned()));
        }

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(PathError::Root);
        }

        Ok(Self { relative: components.join("/"), level: components.len() })
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

/// Drops any leftover table from a previous run and creates the skeleton.
pub fn base(table: &str, bypass: &[IpNet]) -> String {
    let mut s = String::new();

    // Adding first makes the delete succeed whether or not the table exists.
    let _ = writeln!(s, "add table inet {table}");
    let _ = writeln!(s, "delete table inet {table}");
    let _ = writeln!(s, "add table inet {table}");

    let _ = writeln!(s, "add set inet {table} bypass4 {{ type ipv4_addr; flags interval; }}");
    let _ = writeln!(s, "add set inet {table} bypass6 {{ type ipv6_addr; flags interval; }}");

    let (v4, v6): (Vec<&IpNet>, Vec<&IpNet>) =
        bypass.iter().partition(|net| matches!(net, IpNet::V4(_)));
    for (set, nets) in [("bypass4", v4), ("bypass6", v6)] {
        if nets.is_empty() {
            continue;
        }
        let elements = nets.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        let _ = writeln!(s, "add element inet {table} {set} {{ {elements} }}");
    }

    let _ = writeln!(
        s,
        "add chain inet {table} prerouting {{ type filter hook prerouting priority mangle; policy accept; }}"
    );
    let _ = writeln!(
        s,
        "add chain inet {table} output {{ type route hook output priority mangle; policy accept; }}"
    );
    let _ = writeln!(s, "add chain inet {table} {CGROUPS_CHAIN}");

    let _ = writeln!(s, "add rule inet {table} output ip daddr @bypass4 return");
    let _ = writeln!(s, "add rule inet {table} output ip6 daddr @bypass6 return");
    let _ = writeln!(s, "add rule inet {table} output fib daddr type local return");
    let _ = writeln!(s, "add rule inet {table} output jump {CGROUPS_CHAIN}");

    s
}

/// Sends traffic carrying the proxy's mark to its port.
pub fn tproxy(table: &str, tproxy: &TProxy) -> String {
    let mut s = String::new();
    let TProxy { mark, port, .. } = tproxy;

    let _ = writeln!(
        s,
        "add rule inet {table} prerouting meta mark {mark:#x} meta l4proto tcp tproxy to :{port} accept"
    );
    if !tproxy.no_udp {
        let _ = writeln!(
            s,
            "add rule inet {table} prerouting meta mark {mark:#x} meta l4proto udp tproxy to :{port} accept"
        );
    }

    s
}

/// Replaces the content of the cgroups chain with `directives`.
///
/// Deeper cgroups are rendered first so that a directive on a child shadows the one on its
/// parent; directives at the same depth keep their order. `udp` tells whether the proxy owning
/// a mark accepts UDP.
pub fn cgroups<'a>(
    table: &str,
    directives: impl IntoIterator<Item = (&'a CgroupPath, &'a Target)>,
    udp: impl Fn(u32) -> bool,
) -> String {
    let mut directives: Vec<_> = directives.into_iter().collect();
    directives.sort_by(|(a, _), (b, _)| b.level.cmp(&a.level));

    let mut s = String::new();
    let _ = writeln!(s, "flush chain inet {table} {CGROUPS_CHAIN}");

    for (path, target) in directives {
        let matcher = format!("socket cgroupv2 level {} \"{}\"", path.level, path.relative);
        let statement = match target {
            Target::Noop => continue,
            Target::Redirect { mark } if udp(*mark) => {
                format!("meta l4proto {{ tcp, udp }} meta mark set {mark:#x} accept")
            }
            Target::Redirect { mark } => format!("meta l4proto tcp meta mark set {mark:#x} accept"),
            Target::Direct => "accept".to_owned(),
            Target::Drop => "drop".to_owned(),
        };
        let _ = writeln!(s, "add rule inet {table} {CGROUPS_CHAIN} {matcher} {statement}");
    }

    s
}

/// Removes the whole table. Succeeds whether or not it exists.
pub fn clear(table: &str) -> String {
    format!("add table inet {table}\ndelete table inet {table}\n")
}
