//! Test doubles for the workflow seams
//!
//! Command-level doubles (virsh, ssh, podman, git) live in
//! `vmlane_virt::mock`; this module covers the higher-level seams:
//!
//! - [`MockPreparer`]: records clones and package installs, laying out every
//!   clone like a checkout carrying `test/common` and `ui/webui/package.json`
//! - [`MockProbe`]: answers web UI probes from a script

mod preparer;
mod probe;

pub use preparer::MockPreparer;
pub use probe::MockProbe;
