//! Clone libvirt virtual machines from an LVM-backed template.
//!
//! The heart of the crate is the clone transaction in [`clone`]: it copies a
//! template domain's libvirt definition and logical volumes, then rewrites
//! the new guest's identity (hostname, addresses, SSH and TLS keys) inside a
//! temporary chroot. The remaining modules are the pieces the transaction is
//! built from, plus a few read-only commands over the same plumbing.

pub mod clone;
pub mod cmdrun;
pub mod common_opts;
pub mod config;
pub mod descriptor;
pub mod directory;
pub mod error;
pub mod inspect;
pub mod list;
pub mod list_volumes;
pub mod lvm;
pub mod virsh;
pub mod xml_tree;
