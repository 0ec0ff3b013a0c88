//! Virtualization plumbing for vmlane.
//!
//! Wraps the external tools the orchestrator drives: libvirt (`virsh`,
//! `virt-install`), OpenSSH control masters for remote hypervisors, and the
//! container engine. All of them run through a [`CommandRunner`], which the
//! [`mock`] module replaces in tests.

pub mod command;
pub mod container;
pub mod control;
pub mod error;
pub mod hypervisor;
pub mod mock;
pub mod poll;
pub mod process;

pub use command::{CommandOutput, CommandRunner, CommandSpec, OutputMode, SystemRunner};
pub use container::{container_path, ContainerRun, ExecutionContainer, VolumeMode, CONTAINER_WORKDIR};
pub use control::{ControlChannel, Forward, PortSource, RandomPorts};
pub use error::{VirtError, VirtResult};
pub use hypervisor::{is_loopback, ForwardSet, HypervisorClient, InstallSpec, Link};
pub use poll::{poll_until, PollError, PollLimit, PollPolicy};
pub use process::{wait_timeout, ChildExit, Escalation, ManagedChild, StopOutcome};
