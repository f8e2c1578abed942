use std::collections::{BTreeMap, HashMap};

use cgt_rules::{Classifier, TProxy, Target};
use ipnet::IpNet;

use crate::{
    command::{self, Nft, ScriptRunner},
    script::{self, CgroupPath, PathError},
};

/// Failure of an [`NftClassifier`] operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// nft could not be run or rejected the script.
    #[error("failed to apply nftables script")]
    Command(#[from] command::Error),
    /// The cgroup path can't be written into a rule.
    #[error("invalid cgroup path")]
    InvalidPath(#[from] PathError),
    /// A redirect to a mark no tproxy was initialized with.
    #[error("no tproxy initialized with mark {0:#x}")]
    UnknownMark(u32),
}

/// A [`Classifier`] backed by an nftables table.
///
/// Per-cgroup directives live in a dedicated chain that is rebuilt from scratch, in a single
/// transaction, every time a directive changes. The in-memory view is only updated once the
/// kernel has accepted the new chain, except on removal, where the directive is forgotten
/// either way.
#[derive(Debug)]
pub struct NftClassifier<R = Nft> {
    runner: R,
    table: String,
    bypass: Vec<IpNet>,
    initialized: bool,
    /// Mark of every initialized tproxy, and whether it accepts UDP.
    marks: HashMap<u32, bool>,
    cgroups: BTreeMap<String, (CgroupPath, Target)>,
}

impl NftClassifier<Nft> {
    /// Creates a classifier that applies its scripts with the `nft` binary.
    pub fn new(bypass: Vec<IpNet>) -> Self {
        Self::with_runner(Nft::default(), bypass)
    }
}

impl<R: ScriptRunner> NftClassifier<R> {
    /// Creates a classifier that applies its scripts with `runner`.
    pub fn with_runner(runner: R, bypass: Vec<IpNet>) -> Self {
        Self {
            runner,
            table: script::DEFAULT_TABLE.to_owned(),
            bypass,
            initialized: false,
            marks: HashMap::new(),
            cgroups: BTreeMap::new(),
        }
    }

    /// Name of the nftables table this classifier owns.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The runner scripts are applied with.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// The directive currently installed for `path`, if any.
    pub fn directive(&self, path: &str) -> Option<&Target> {
        self.cgroups.get(path).map(|(_, target)| target)
    }

    fn render(&self, cgroups: &BTreeMap<String, (CgroupPath, Target)>) -> String {
        let marks = &self.marks;
        script::cgroups(
            &self.table,
            cgroups.values().map(|(path, target)| (path, target)),
            |mark| marks.get(&mark).copied().unwrap_or(false),
        )
    }
}

impl<R: ScriptRunner> Classifier for NftClassifier<R> {
    type Error = Error;

    async fn init_target(&mut self, tproxy: &TProxy) -> Result<(), Error> {
        let mut script = String::new();
        if !self.initialized {
            tracing::debug!(table = %self.table, "creating nftables table");
            script.push_str(&script::base(&self.table, &self.bypass));
        }
        script.push_str(&script::tproxy(&self.table, tproxy));

        self.runner.apply(&script).await?;

        self.initialized = true;
        self.marks.insert(tproxy.mark, !tproxy.no_udp);

        tracing::debug!(mark = tproxy.mark, port = tproxy.port, "tproxy rules installed");
        Ok(())
    }

    async fn add_cgroup(&mut self, path: &str, target: &Target) -> Result<(), Error> {
        if target.is_noop() {
            return self.remove_cgroup(path).await;
        }
        if let Target::Redirect { mark } = target {
            if !self.marks.contains_key(mark) {
                return Err(Error::UnknownMark(*mark));
            }
        }

        let parsed = CgroupPath::parse(path)?;

        let mut cgroups = self.cgroups.clone();
        cgroups.insert(path.to_owned(), (parsed, *target));

        let script = self.render(&cgroups);
        self.runner.apply(&script).await?;
        self.cgroups = cgroups;

        tracing::debug!(cgroup = path, %target, directives = self.cgroups.len(), "directive added");
        Ok(())
    }

    async fn remove_cgroup(&mut self, path: &str) -> Result<(), Error> {
        if self.cgroups.remove(path).is_none() {
            return Ok(());
        }

        let script = self.render(&self.cgroups);
        self.runner.apply(&script).await?;

        tracing::debug!(cgroup = path, directives = self.cgroups.len(), "directive removed");
        Ok(())
    }

    async fn clear(&mut self) -> Result<(), Error> {
        self.initialized = false;
        self.marks.clear();
        self.cgroups.clear();

        self.runner.apply(&script::clear(&self.table)).await?;

        tracing::debug!(table = %self.table, "nftables table deleted");
        Ok(())
    }
}
