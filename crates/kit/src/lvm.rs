//! LVM logical volume listing, inspection and creation.
//!
//! All information comes from the LVM command line tools invoked with
//! `--noheadings --separator ';' --units=b`, whose line-oriented output is
//! parsed positionally into [`LogicalVolume`] records. Volume and group
//! names are treated as opaque strings; the external tools are the source
//! of truth for naming rules.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use crate::cmdrun::{CommandRunner, RunOpts};
use crate::error::{Error, Result};

/// Number of fields reported by current LVM tools.
const LV_FIELDS: usize = 12;

/// One logical volume as reported by `lvs`/`lvdisplay -C`.
///
/// The identity key is `(vg, name)`, unique across the system. All fields
/// are kept as the raw strings the tool printed; `size` carries a byte
/// suffix (for example `10737418240B`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalVolume {
    /// Logical volume name.
    pub name: String,
    /// Owning volume group.
    pub vg: String,
    /// Attribute flag string.
    pub attr: String,
    /// Size in bytes, with trailing unit suffix.
    pub size: String,
    /// Thin pool, if any.
    pub pool: String,
    /// Snapshot origin, if any.
    pub origin: String,
    /// Data usage percentage.
    pub data: String,
    /// Metadata usage percentage (empty on older tool versions).
    pub meta: String,
    /// Move source physical volume.
    pub move_pv: String,
    /// Mirror log.
    pub log: String,
    /// Copy sync percentage.
    pub copy: String,
    /// Conversion target.
    pub convert: String,
}

impl LogicalVolume {
    /// Identity key of this volume.
    pub fn key(&self) -> (String, String) {
        (self.vg.clone(), self.name.clone())
    }

    /// Block device path of this volume.
    pub fn path(&self) -> String {
        format!("/dev/{}/{}", self.vg, self.name)
    }

    /// Size in bytes, parsed from the suffixed `size` field.
    pub fn size_bytes(&self) -> Result<u64> {
        let digits = self.size.trim().trim_end_matches(['B', 'b']);
        digits
            .parse()
            .map_err(|_| Error::Parse(format!("bad LV size {:?}", self.size)))
    }
}

/// Parse one semicolon-separated output line into a volume record.
///
/// Older LVM versions omit the metadata-percent column, so 11 fields are
/// accepted with `meta` left empty; any other arity is a parse failure
/// rather than a silent truncation.
pub fn parse_lv_line(line: &str) -> Result<LogicalVolume> {
    let fields: Vec<&str> = line.trim().split(';').map(|f| f.trim()).collect();
    let fields: Vec<String> = match fields.len() {
        LV_FIELDS => fields.into_iter().map(String::from).collect(),
        n if n == LV_FIELDS - 1 => {
            let mut padded: Vec<String> = fields.into_iter().map(String::from).collect();
            padded.insert(7, String::new());
            padded
        }
        n => {
            return Err(Error::Parse(format!(
                "expected {} or {} fields in LV line, got {}: {:?}",
                LV_FIELDS - 1,
                LV_FIELDS,
                n,
                line
            )))
        }
    };

    let mut it = fields.into_iter();
    // Arity was checked above, so the iterator cannot run short.
    let mut next = || it.next().unwrap_or_default();
    Ok(LogicalVolume {
        name: next(),
        vg: next(),
        attr: next(),
        size: next(),
        pool: next(),
        origin: next(),
        data: next(),
        meta: next(),
        move_pv: next(),
        log: next(),
        copy: next(),
        convert: next(),
    })
}

/// Volume operations required by the clone transaction.
///
/// The seam between the orchestrator and the LVM tools, so tests can
/// substitute a mock. Listing and resolving are read-only; `create` is the
/// one mutating call and must honor dry-run.
pub trait VolumeStore {
    /// Index of all volumes keyed by `(vg, name)`.
    fn index(&self) -> Result<HashMap<(String, String), LogicalVolume>>;
    /// Resolve a block device path to its owning volume record.
    fn display(&self, path: &str) -> Result<LogicalVolume>;
    /// Provision a new logical volume of exactly `size` in group `vg`.
    fn create(&self, vg: &str, name: &str, size: &str) -> Result<()>;
}

impl<V: VolumeStore> VolumeStore for &V {
    fn index(&self) -> Result<HashMap<(String, String), LogicalVolume>> {
        (**self).index()
    }
    fn display(&self, path: &str) -> Result<LogicalVolume> {
        (**self).display(path)
    }
    fn create(&self, vg: &str, name: &str, size: &str) -> Result<()> {
        (**self).create(vg, name, size)
    }
}

/// Wraps the LVM command line tools.
#[derive(Debug, Clone, Copy)]
pub struct VolumeManager<'a> {
    runner: CommandRunner<'a>,
}

impl<'a> VolumeManager<'a> {
    /// Create a manager that invokes the tools through `runner`.
    pub fn new(runner: CommandRunner<'a>) -> Self {
        Self { runner }
    }

    /// List every logical volume on the system.
    ///
    /// Runs even under dry-run; listing mutates nothing.
    pub fn list(&self) -> Result<Vec<LogicalVolume>> {
        let out = self.runner.run(
            &["lvs", "--noheadings", "--separator", ";", "--units=b"],
            RunOpts::probe(),
        )?;
        out.stdout
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(parse_lv_line)
            .collect()
    }
}

impl VolumeStore for VolumeManager<'_> {
    fn index(&self) -> Result<HashMap<(String, String), LogicalVolume>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|lv| (lv.key(), lv))
            .collect())
    }

    fn display(&self, path: &str) -> Result<LogicalVolume> {
        let out = self.runner.run(
            &[
                "lvdisplay",
                "--noheadings",
                "--separator",
                ";",
                "--units=b",
                "-C",
                path,
            ],
            RunOpts::probe(),
        )?;
        let line = out.stdout.trim();
        if line.is_empty() {
            return Err(Error::Lookup(format!("no logical volume at {path}")));
        }
        parse_lv_line(line)
    }

    /// `size` is the raw suffixed byte string from the template volume's
    /// record, passed through unchanged so the copy has identical size.
    fn create(&self, vg: &str, name: &str, size: &str) -> Result<()> {
        info!("Create LV {} on VG {}", name, vg);
        self.runner
            .run(&["lvcreate", "-L", size, "-n", name, vg], RunOpts::default())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Mock volume store recording every provisioning call.
    #[derive(Debug, Default)]
    pub(crate) struct MockVolumes {
        pub volumes: Vec<LogicalVolume>,
        pub created: RefCell<Vec<(String, String, String)>>,
    }

    impl VolumeStore for MockVolumes {
        fn index(&self) -> Result<HashMap<(String, String), LogicalVolume>> {
            Ok(self
                .volumes
                .iter()
                .map(|lv| (lv.key(), lv.clone()))
                .collect())
        }

        fn display(&self, path: &str) -> Result<LogicalVolume> {
            self.volumes
                .iter()
                .find(|lv| lv.path() == path)
                .cloned()
                .ok_or_else(|| Error::Lookup(format!("no logical volume at {path}")))
        }

        fn create(&self, vg: &str, name: &str, size: &str) -> Result<()> {
            self.created.borrow_mut().push((
                vg.to_string(),
                name.to_string(),
                size.to_string(),
            ));
            Ok(())
        }
    }

    const LINE: &str = "  root;vm_jessie;-wi-ao----;10737418240B;;;;;;;;";

    #[test]
    fn test_parse_lv_line() {
        let lv = parse_lv_line(LINE).unwrap();
        assert_eq!(lv.name, "root");
        assert_eq!(lv.vg, "vm_jessie");
        assert_eq!(lv.attr, "-wi-ao----");
        assert_eq!(lv.size, "10737418240B");
        assert_eq!(lv.path(), "/dev/vm_jessie/root");
        assert_eq!(lv.key(), ("vm_jessie".to_string(), "root".to_string()));
    }

    #[test]
    fn test_parse_lv_line_older_tool_arity() {
        // 11 fields: no metadata-percent column.
        let lv = parse_lv_line("swap;vm_jessie;-wi-a-;1073741824B;;;;;;;").unwrap();
        assert_eq!(lv.name, "swap");
        assert_eq!(lv.meta, "");
        assert_eq!(lv.size_bytes().unwrap(), 1073741824);
    }

    #[test]
    fn test_parse_lv_line_wrong_arity() {
        let err = parse_lv_line("root;vm_jessie;-wi-ao----").unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn test_size_bytes() {
        let lv = parse_lv_line(LINE).unwrap();
        assert_eq!(lv.size_bytes().unwrap(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_size_bytes_malformed() {
        let mut lv = parse_lv_line(LINE).unwrap();
        lv.size = "ten gigabytes".to_string();
        assert!(matches!(lv.size_bytes(), Err(Error::Parse(_))));
    }
}
