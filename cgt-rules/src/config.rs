//! The configuration consumed by the rule manager.
//!
//! Loading it from disk is the binary's business; this module only defines its shape and
//! validation. A configuration is immutable once validated, and the order of both `tproxies`
//! and `rules` is significant.

use std::{collections::HashSet, fmt, path::PathBuf};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Routing tables the kernel reserves: unspecified, default, main and local.
const RESERVED_TABLES: [u32; 4] = [0, 253, 254, 255];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("route table {0} is reserved")]
    ReservedTable(u32),
    #[error("no tproxy configured")]
    NoTProxy,
    #[error("duplicate tproxy name `{0}`")]
    DuplicateName(String),
    #[error("tproxy `{0}` has a zero mark")]
    ZeroMark(String),
    #[error("tproxy `{name}` reuses mark {mark:#x}")]
    DuplicateMark { name: String, mark: u32 },
    #[error("tproxy `{0}` has a zero port")]
    ZeroPort(String),
    #[error("rule #{index} references unknown tproxy `{name}`")]
    UnknownTProxy { index: usize, name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Mount point of the cgroup v2 hierarchy.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    /// The dedicated routing table marked traffic is sent to.
    #[serde(default = "default_route_table")]
    pub route_table: u32,
    /// Transparent proxies traffic can be redirected to, in order.
    pub tproxies: Vec<TProxy>,
    /// Ordered rules. The first rule whose pattern matches a cgroup path wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Destinations that are never redirected.
    #[serde(default)]
    pub bypass: Vec<IpNet>,
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_route_table() -> u32 {
    300
}

/// A transparent proxy listening on a local port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TProxy {
    pub name: String,
    /// The firewall mark identifying traffic for this proxy.
    pub mark: u32,
    pub port: u16,
    /// Only redirect TCP.
    #[serde(default)]
    pub no_udp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// A regular expression matched against the cgroup path, e.g. `/user.slice/.*`.
    #[serde(rename = "match")]
    pub pattern: String,
    pub target: RuleTarget,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.pattern, self.target)
    }
}

/// The target of a rule as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Noop,
    Direct,
    Drop,
    /// Redirect to the tproxy with this name.
    Tproxy(String),
}

impl fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Direct => f.write_str("direct"),
            Self::Drop => f.write_str("drop"),
            Self::Tproxy(name) => write!(f, "tproxy({name})"),
        }
    }
}

impl Config {
    pub fn tproxy(&self, name: &str) -> Option<&TProxy> {
        self.tproxies.iter().find(|tp| tp.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if RESERVED_TABLES.contains(&self.route_table) {
            return Err(Error::ReservedTable(self.route_table));
        }

        if self.tproxies.is_empty() {
            return Err(Error::NoTProxy);
        }

        let mut names = HashSet::new();
        let mut marks = HashSet::new();
        for tp in &self.tproxies {
            if !names.insert(tp.name.as_str()) {
                return Err(Error::DuplicateName(tp.name.clone()));
            }
            if tp.mark == 0 {
                return Err(Error::ZeroMark(tp.name.clone()));
            }
            if !marks.insert(tp.mark) {
                return Err(Error::DuplicateMark { name: tp.name.clone(), mark: tp.mark });
            }
            if tp.port == 0 {
                return Err(Error::ZeroPort(tp.name.clone()));
            }
        }

        for (index, rule) in self.rules.iter().enumerate() {
            if let RuleTarget::Tproxy(name) = &rule.target {
                if !names.contains(name.as_str()) {
                    return Err(Error::UnknownTProxy { index, name: name.clone() });
                }
            }
        }

        Ok(())
    }
}
