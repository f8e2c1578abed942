use std::{collections::HashMap, io};

use cgt_route::{ManagedRoute, ManagedRule, NetlinkError, RouteNetlink};
use cgt_rules::{Classifier, TProxy, Target};

/// Every kernel-visible operation performed by the fakes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddRoute(ManagedRoute),
    DelRoute(ManagedRoute),
    AddRule(ManagedRule),
    DelRule(ManagedRule),
    Init(u32),
    AddCgroup(String, Target),
    RemoveCgroup(String),
    Clear,
}

#[derive(Debug, thiserror::Error)]
#[error("fake failure: {0}")]
pub struct FakeError(pub &'static str);

fn boom() -> NetlinkError {
    NetlinkError::Io(io::Error::other("boom"))
}

#[derive(Debug, Default)]
pub struct FakeNetlink {
    pub ops: Vec<Op>,
    pub rules: Vec<ManagedRule>,
    pub fail_route_add_after: Option<usize>,
    pub fail_rule_add: bool,
    pub fail_removals: bool,
}

impl RouteNetlink for FakeNetlink {
    fn link_index(&self, _name: &str) -> Result<u32, NetlinkError> {
        Ok(1)
    }

    async fn add_route(&mut self, route: &ManagedRoute) -> Result<(), NetlinkError> {
        let added = self.ops.iter().filter(|op| matches!(op, Op::AddRoute(_))).count();
        if self.fail_route_add_after == Some(added) {
            return Err(boom());
        }
        self.ops.push(Op::AddRoute(*route));
        Ok(())
    }

    async fn del_route(&mut self, route: &ManagedRoute) -> Result<(), NetlinkError> {
        self.ops.push(Op::DelRoute(*route));
        if self.fail_removals {
            return Err(boom());
        }
        Ok(())
    }

    async fn add_rule(&mut self, rule: &ManagedRule) -> Result<(), NetlinkError> {
        if self.fail_rule_add {
            return Err(boom());
        }
        if self.rules.contains(rule) {
            return Err(NetlinkError::AlreadyExists);
        }
        self.rules.push(*rule);
        self.ops.push(Op::AddRule(*rule));
        Ok(())
    }

    async fn del_rule(&mut self, rule: &ManagedRule) -> Result<(), NetlinkError> {
        self.ops.push(Op::DelRule(*rule));
        if self.fail_removals {
            return Err(boom());
        }
        self.rules.retain(|r| r != rule);
        Ok(())
    }
}

impl FakeNetlink {
    pub fn routes_added(&self) -> Vec<ManagedRoute> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::AddRoute(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    pub fn routes_removed(&self) -> Vec<ManagedRoute> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::DelRoute(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    pub fn rules_removed(&self) -> Vec<ManagedRule> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::DelRule(r) => Some(*r),
                _ => None,
            })
            .collect()
    }
}

/// A classifier holding directives in a map. Adding over an existing directive replaces it and
/// removing a missing one is a no-op, which is what the rule manager expects of a real one.
#[derive(Debug, Default)]
pub struct FakeClassifier {
    pub ops: Vec<Op>,
    pub cgroups: HashMap<String, Target>,
    pub fail_init_for: Option<u32>,
    pub fail_add_for: Option<String>,
    pub fail_clear: bool,
}

impl Classifier for FakeClassifier {
    type Error = FakeError;

    async fn init_target(&mut self, tproxy: &TProxy) -> Result<(), FakeError> {
        if self.fail_init_for == Some(tproxy.mark) {
            return Err(FakeError("init"));
        }
        self.ops.push(Op::Init(tproxy.mark));
        Ok(())
    }

    async fn add_cgroup(&mut self, path: &str, target: &Target) -> Result<(), FakeError> {
        assert!(!target.is_noop(), "noop targets must never reach the classifier");
        self.ops.push(Op::AddCgroup(path.to_owned(), *target));
        if self.fail_add_for.as_deref() == Some(path) {
            return Err(FakeError("add"));
        }
        self.cgroups.insert(path.to_owned(), *target);
        Ok(())
    }

    async fn remove_cgroup(&mut self, path: &str) -> Result<(), FakeError> {
        self.ops.push(Op::RemoveCgroup(path.to_owned()));
        self.cgroups.remove(path);
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), FakeError> {
        self.ops.push(Op::Clear);
        self.cgroups.clear();
        if self.fail_clear {
            return Err(FakeError("clear"));
        }
        Ok(())
    }
}
