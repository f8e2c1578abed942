//! # Cgroup rule manager
//!
//! The [`RuleManager`] ties policy routing and packet classification to the lifecycle of
//! cgroups:
//!
//! 1. it installs the local default routes of the dedicated routing table;
//! 2. for every configured transparent proxy, it initializes the [`Classifier`] and adds the
//!    `fwmark` rule pointing at that table;
//! 3. it consumes [`CgroupEvent`](cgt_common::CgroupEvent)s, matching every new cgroup path
//!    against the configured [`Matchers`] and adding or removing per-cgroup directives;
//! 4. once the event stream is closed, or setup fails, it removes everything it installed, in
//!    reverse order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cgt_rules::{Config, RuleManager};
//!
//! let (tx, rx) = cgt_common::channel(64);
//! let netlink = cgt_route::RtNetlink::new()?;
//! let span = tracing::info_span!("rule_manager");
//!
//! let mut manager = RuleManager::new(&config, classifier, netlink, rx, span)?;
//!
//! // Feed `tx` from a cgroup monitor. Dropping it stops the manager.
//! manager.run().await?;
//! ```

#![doc(issue_tracker_base_url = "https://github.com/chainbound/cgt/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod classifier;
pub mod config;
mod manager;
mod matcher;
mod target;

pub use classifier::Classifier;
pub use config::{Config, Rule, RuleTarget, TProxy};
pub use manager::{Error, RuleManager, State};
pub use matcher::{Matcher, MatcherError, Matchers};
pub use target::Target;
