//! virsh-backed hypervisor access.
//!
//! The tool never links against libvirt directly; every hypervisor
//! interaction goes through the `virsh` CLI, with an optional connection
//! URI passed as `-c`. The [`Hypervisor`] trait is the seam the domain
//! directory and orchestrator sit on, so tests can substitute a mock.

use std::io::Write;

use crate::cmdrun::{CommandRunner, RunOpts};
use crate::directory::DomainState;
use crate::error::{Error, Result};

/// Hypervisor operations required by the clone transaction.
///
/// Read-only probes must run even under dry-run; `define_xml` is the one
/// mutating call and must honor it.
pub trait Hypervisor {
    /// Names of all defined-but-inactive domains.
    fn list_inactive_names(&self) -> Result<Vec<String>>;
    /// Numeric ids of all running domains.
    fn list_running_ids(&self) -> Result<Vec<u32>>;
    /// Name of the running domain with the given id.
    fn domain_name(&self, id: u32) -> Result<String>;
    /// Power state of the named domain.
    fn domain_state(&self, name: &str) -> Result<DomainState>;
    /// Id of the named domain, absent when it is not running.
    fn domain_id(&self, name: &str) -> Result<Option<u32>>;
    /// Full XML configuration of the named domain.
    fn dump_xml(&self, name: &str) -> Result<String>;
    /// Persistently define a new domain from serialized XML.
    fn define_xml(&self, xml: &str) -> Result<()>;
}

impl<H: Hypervisor> Hypervisor for &H {
    fn list_inactive_names(&self) -> Result<Vec<String>> {
        (**self).list_inactive_names()
    }
    fn list_running_ids(&self) -> Result<Vec<u32>> {
        (**self).list_running_ids()
    }
    fn domain_name(&self, id: u32) -> Result<String> {
        (**self).domain_name(id)
    }
    fn domain_state(&self, name: &str) -> Result<DomainState> {
        (**self).domain_state(name)
    }
    fn domain_id(&self, name: &str) -> Result<Option<u32>> {
        (**self).domain_id(name)
    }
    fn dump_xml(&self, name: &str) -> Result<String> {
        (**self).dump_xml(name)
    }
    fn define_xml(&self, xml: &str) -> Result<()> {
        (**self).define_xml(xml)
    }
}

/// [`Hypervisor`] implementation that shells out to virsh.
#[derive(Debug, Clone, Copy)]
pub struct VirshHypervisor<'a> {
    runner: CommandRunner<'a>,
}

impl<'a> VirshHypervisor<'a> {
    /// Create a virsh-backed hypervisor using `runner`.
    pub fn new(runner: CommandRunner<'a>) -> Self {
        Self { runner }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec!["virsh".to_string()];
        if let Some(uri) = &self.runner.settings().connect {
            argv.push("-c".to_string());
            argv.push(uri.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn probe(&self, args: &[&str]) -> Result<String> {
        let out = self.runner.run(&self.argv(args), RunOpts::probe())?;
        Ok(out.stdout)
    }
}

impl Hypervisor for VirshHypervisor<'_> {
    fn list_inactive_names(&self) -> Result<Vec<String>> {
        let out = self.probe(&["list", "--name", "--inactive"])?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn list_running_ids(&self) -> Result<Vec<u32>> {
        let out = self.probe(&["list", "--id"])?;
        out.lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse()
                    .map_err(|_| Error::Parse(format!("bad domain id {l:?}")))
            })
            .collect()
    }

    fn domain_name(&self, id: u32) -> Result<String> {
        let out = self.probe(&["domname", &id.to_string()])?;
        let name = out.trim();
        if name.is_empty() {
            return Err(Error::Lookup(format!("no domain with id {id}")));
        }
        Ok(name.to_string())
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        let out = self.probe(&["domstate", name])?;
        DomainState::parse(out.trim())
    }

    fn domain_id(&self, name: &str) -> Result<Option<u32>> {
        let out = self.probe(&["domid", name])?;
        let id = out.trim();
        // virsh prints "-" for domains that are not running
        if id.is_empty() || id == "-" {
            return Ok(None);
        }
        id.parse()
            .map(Some)
            .map_err(|_| Error::Parse(format!("bad domain id {id:?}")))
    }

    fn dump_xml(&self, name: &str) -> Result<String> {
        self.probe(&["dumpxml", name])
    }

    fn define_xml(&self, xml: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml.as_bytes())?;
        let path = file
            .path()
            .to_str()
            .ok_or_else(|| Error::Parse("non-UTF8 temp path".into()))?
            .to_string();
        self.runner
            .run(&self.argv(&["define", &path]), RunOpts::default())?;
        Ok(())
    }
}
