//! Domain discovery and caching.
//!
//! [`DomainDirectory`] fronts the hypervisor with two explicit indexes, one
//! by name and one by numeric id, populated by a single enumeration of the
//! inactive and running domain listings. Cache validity is an explicit flag;
//! population is monotonic for the life of the process and there is no
//! invalidation path. A domain defined after the enumeration only becomes
//! visible through a direct define call, never through the cache.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::virsh::Hypervisor;

/// Power state of a domain, mirroring libvirt's state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainState {
    /// No state reported.
    NoState,
    /// The domain is running.
    Running,
    /// The domain is blocked on a resource.
    Blocked,
    /// The domain is paused by the user.
    Paused,
    /// The domain is being shut down.
    ShuttingDown,
    /// The domain is shut off.
    ShutOff,
    /// The domain has crashed.
    Crashed,
    /// The domain is suspended by guest power management.
    PmSuspended,
}

impl DomainState {
    /// Parse the state text printed by `virsh domstate`.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(match text {
            "no state" => Self::NoState,
            "running" | "idle" => Self::Running,
            "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::PmSuspended,
            other => return Err(Error::Parse(format!("unknown domain state {other:?}"))),
        })
    }

    /// Whether the domain is shut off.
    pub fn is_shut_off(&self) -> bool {
        matches!(self, Self::ShutOff)
    }

    /// Human-readable state label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "no state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "in shutdown",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
        }
    }
}

/// A virtual machine known to the hypervisor.
///
/// Never constructed locally; always the result of a lookup or enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct Domain {
    /// Unique domain name.
    pub name: String,
    /// Numeric id, assigned only while the domain is running.
    pub id: Option<u32>,
    /// Power state at the time of discovery.
    pub state: DomainState,
}

/// Key for [`DomainDirectory::lookup`]: exactly one of name or id.
#[derive(Debug, Clone)]
pub enum LookupKey {
    /// Look up by unique name.
    Name(String),
    /// Look up by numeric id (running domains only).
    Id(u32),
}

/// Name- and id-indexed cache over the hypervisor's domain listings.
#[derive(Debug)]
pub struct DomainDirectory<H> {
    hypervisor: H,
    fetched_all: bool,
    by_name: BTreeMap<String, Domain>,
    by_id: BTreeMap<u32, String>,
}

impl<H: Hypervisor> DomainDirectory<H> {
    /// Create an empty directory over the given hypervisor.
    pub fn new(hypervisor: H) -> Self {
        Self {
            hypervisor,
            fetched_all: false,
            by_name: BTreeMap::new(),
            by_id: BTreeMap::new(),
        }
    }

    /// The hypervisor this directory queries.
    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    /// Look up a single domain by name or id, consulting the cache first.
    pub fn lookup(&mut self, key: &LookupKey) -> Result<Domain> {
        match key {
            LookupKey::Name(name) => {
                if let Some(domain) = self.by_name.get(name) {
                    return Ok(domain.clone());
                }
                let state = self
                    .hypervisor
                    .domain_state(name)
                    .map_err(|e| Error::Lookup(format!("domain {name:?}: {e}")))?;
                let id = self.hypervisor.domain_id(name)?;
                let domain = Domain {
                    name: name.clone(),
                    id,
                    state,
                };
                self.insert(domain.clone());
                Ok(domain)
            }
            LookupKey::Id(id) => {
                if let Some(name) = self.by_id.get(id) {
                    let name = name.clone();
                    return self.lookup(&LookupKey::Name(name));
                }
                let name = self
                    .hypervisor
                    .domain_name(*id)
                    .map_err(|e| Error::Lookup(format!("domain id {id}: {e}")))?;
                let state = self.hypervisor.domain_state(&name)?;
                let domain = Domain {
                    name,
                    id: Some(*id),
                    state,
                };
                self.insert(domain.clone());
                Ok(domain)
            }
        }
    }

    /// Whether a domain of this name is known after a full enumeration.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Enumerate all domains, defined and running, merged by name.
    ///
    /// The underlying listings are queried exactly once per process when
    /// `use_cache` holds; with `use_cache` unset they are re-queried and the
    /// indexes refreshed. The two source populations are disjoint: an id is
    /// only meaningful for a running domain, and the inactive listing only
    /// reports shut-off ones.
    pub fn list_all(&mut self, use_cache: bool) -> Result<Vec<Domain>> {
        if use_cache && self.fetched_all {
            return Ok(self.by_name.values().cloned().collect());
        }

        for name in self.hypervisor.list_inactive_names()? {
            let domain = Domain {
                name,
                id: None,
                state: DomainState::ShutOff,
            };
            self.insert(domain);
        }

        for id in self.hypervisor.list_running_ids()? {
            let name = self.hypervisor.domain_name(id)?;
            let state = self.hypervisor.domain_state(&name)?;
            let domain = Domain {
                name,
                id: Some(id),
                state,
            };
            self.insert(domain);
        }

        self.fetched_all = true;
        Ok(self.by_name.values().cloned().collect())
    }

    fn insert(&mut self, domain: Domain) {
        if let Some(id) = domain.id {
            self.by_id.insert(id, domain.name.clone());
        }
        self.by_name.insert(domain.name.clone(), domain);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Mock hypervisor recording how often each listing was queried.
    #[derive(Debug, Default)]
    pub(crate) struct MockHypervisor {
        pub inactive: Vec<String>,
        pub running: Vec<(u32, String)>,
        pub xml: std::collections::BTreeMap<String, String>,
        pub enumerations: RefCell<u32>,
        pub defined: RefCell<Vec<String>>,
    }

    impl Hypervisor for MockHypervisor {
        fn list_inactive_names(&self) -> Result<Vec<String>> {
            *self.enumerations.borrow_mut() += 1;
            Ok(self.inactive.clone())
        }

        fn list_running_ids(&self) -> Result<Vec<u32>> {
            Ok(self.running.iter().map(|(id, _)| *id).collect())
        }

        fn domain_name(&self, id: u32) -> Result<String> {
            self.running
                .iter()
                .find(|(i, _)| *i == id)
                .map(|(_, n)| n.clone())
                .ok_or_else(|| Error::Lookup(format!("no domain with id {id}")))
        }

        fn domain_state(&self, name: &str) -> Result<DomainState> {
            if self.running.iter().any(|(_, n)| n == name) {
                Ok(DomainState::Running)
            } else if self.inactive.iter().any(|n| n == name) {
                Ok(DomainState::ShutOff)
            } else {
                Err(Error::Lookup(format!("no domain {name:?}")))
            }
        }

        fn domain_id(&self, name: &str) -> Result<Option<u32>> {
            Ok(self
                .running
                .iter()
                .find(|(_, n)| n == name)
                .map(|(id, _)| *id))
        }

        fn dump_xml(&self, name: &str) -> Result<String> {
            self.xml
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Lookup(format!("no domain {name:?}")))
        }

        fn define_xml(&self, xml: &str) -> Result<()> {
            self.defined.borrow_mut().push(xml.to_string());
            Ok(())
        }
    }

    fn mock() -> MockHypervisor {
        MockHypervisor {
            inactive: vec!["jessie".to_string(), "wheezy".to_string()],
            running: vec![(7, "mailhost".to_string())],
            ..Default::default()
        }
    }

    #[test]
    fn test_list_all_merges_populations() {
        let mut directory = DomainDirectory::new(mock());
        let domains = directory.list_all(true).unwrap();
        let names: Vec<_> = domains.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["jessie", "mailhost", "wheezy"]);

        let mailhost = domains.iter().find(|d| d.name == "mailhost").unwrap();
        assert_eq!(mailhost.id, Some(7));
        assert_eq!(mailhost.state, DomainState::Running);

        let jessie = domains.iter().find(|d| d.name == "jessie").unwrap();
        assert_eq!(jessie.id, None);
        assert!(jessie.state.is_shut_off());
    }

    #[test]
    fn test_list_all_cached_enumerates_once() {
        let mut directory = DomainDirectory::new(mock());
        directory.list_all(true).unwrap();
        directory.list_all(true).unwrap();
        directory.list_all(true).unwrap();
        assert_eq!(*directory.hypervisor().enumerations.borrow(), 1);
    }

    #[test]
    fn test_list_all_uncached_requeries() {
        let mut directory = DomainDirectory::new(mock());
        directory.list_all(false).unwrap();
        directory.list_all(false).unwrap();
        assert_eq!(*directory.hypervisor().enumerations.borrow(), 2);
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let mut directory = DomainDirectory::new(mock());
        let domain = directory
            .lookup(&LookupKey::Name("jessie".to_string()))
            .unwrap();
        assert!(domain.state.is_shut_off());

        let running = directory.lookup(&LookupKey::Id(7)).unwrap();
        assert_eq!(running.name, "mailhost");

        let err = directory
            .lookup(&LookupKey::Name("missing".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Lookup(_)));
    }

    #[test]
    fn test_domain_state_parse() {
        assert_eq!(DomainState::parse("shut off").unwrap(), DomainState::ShutOff);
        assert_eq!(DomainState::parse("running").unwrap(), DomainState::Running);
        assert!(matches!(
            DomainState::parse("levitating"),
            Err(Error::Parse(_))
        ));
    }
}
