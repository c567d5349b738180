//! Passthrough FUSE front-end (spec §4.7, §6): the external collaborator
//! whose contract `spec.md` states but whose implementation it declares out
//! of scope for the core queue. Implemented here so the crate produces a
//! complete, runnable `queuefs` binary.

mod inode;
mod passthrough;

pub use passthrough::PassthroughFs;
