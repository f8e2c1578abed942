//! # cgt
//!
//! Redirects the traffic of selected cgroups to transparent proxies. The [`Daemon`] walks and
//! watches the cgroup v2 hierarchy with a [`CgroupMonitor`], and feeds what it sees to a
//! [`RuleManager`](cgt_rules::RuleManager) backed by nftables
//! ([`NftClassifier`](cgt_nft::NftClassifier)) and policy routing
//! ([`RtNetlink`](cgt_route::RtNetlink)).

#![doc(issue_tracker_base_url = "https://github.com/chainbound/cgt/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod config;
mod daemon;
pub mod monitor;

pub use config::{load_config, load_config_str, load_config_with_env, ConfigError};
pub use daemon::{Daemon, DaemonError};
pub use monitor::{CgroupMonitor, MonitorError};
