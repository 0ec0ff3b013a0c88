//! VM lifecycle verbs against a local or SSH-tunneled libvirt backend.

use std::path::Path;
use std::sync::Arc;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::control::{ControlChannel, Forward};
use crate::error::{VirtError, VirtResult};
use crate::poll::{poll_until, PollError, PollPolicy};
use crate::process::ManagedChild;

/// Host names treated as this machine.
pub const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// libvirt URI of the local system hypervisor.
pub const LOCAL_URI: &str = "qemu:///system";

/// Storage pool virt-install uses for downloaded kernels and initrds.
pub const SCRATCH_POOL: &str = "boot-scratch";
const SCRATCH_POOL_TARGET: &str = "/var/lib/libvirt/boot";

/// Whether `host` names this machine.
pub fn is_loopback(host: &str) -> bool {
    LOOPBACK_HOSTS.contains(&host)
}

/// How the hypervisor is reached.
pub enum Link {
    /// libvirt on this machine; VM addresses are directly routable.
    Local,
    /// libvirt over SSH; VM ports need forwarding through the channel.
    Remote(ControlChannel),
}

/// Port mapping produced by [`HypervisorClient::configure_forwarding`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardSet {
    /// `(target port, reachable port)` in request order
    pub ports: Vec<(u16, u16)>,
    /// Tunnel forwards to cancel on release (empty for a local link)
    pub forwards: Vec<Forward>,
}

impl ForwardSet {
    /// Port through which `target` is reachable.
    pub fn local_port(&self, target: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|(t, _)| *t == target)
            .map(|(_, local)| *local)
    }

    pub fn is_tunneled(&self) -> bool {
        !self.forwards.is_empty()
    }
}

/// Parameters of a `virt-install` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    pub name: String,
    pub os_variant: String,
    /// `--location` value: tree URL, optionally with kernel and initrd paths
    pub location: String,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    /// Attach a pty serial console and follow it in text mode.
    pub serial_console: bool,
    pub extra_args: String,
}

impl InstallSpec {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os_variant: "rhel-unknown".to_string(),
            location: location.into(),
            memory_mib: 4096,
            vcpus: 2,
            disk_gib: 10,
            serial_console: false,
            extra_args: String::new(),
        }
    }

    /// The `virt-install` command for the given connection URI.
    pub fn command(&self, uri: &str) -> CommandSpec {
        let mut cmd = CommandSpec::new("virt-install").args(["--connect", uri]);
        cmd = if self.serial_console {
            cmd.args(["--autoconsole", "text"])
        } else {
            cmd.arg("--noautoconsole")
        };
        cmd = cmd
            .args(["-n", self.name.as_str()])
            .args(["--os-variant", self.os_variant.as_str()])
            .args(["--location", self.location.as_str()])
            .arg("--memory")
            .arg(self.memory_mib.to_string())
            .arg("--vcpus")
            .arg(self.vcpus.to_string())
            .arg("--disk")
            .arg(format!("size={}", self.disk_gib));
        if self.serial_console {
            cmd = cmd.args(["--serial", "pty"]);
        }
        cmd.args(["--extra-args", self.extra_args.as_str()])
    }

    /// Argv of [`command`](Self::command).
    pub fn argv(&self, uri: &str) -> Vec<String> {
        self.command(uri).argv()
    }
}

/// Parse the IPv4 address out of `virsh -q domifaddr` output.
///
/// Each line reads `<iface> <mac> <protocol> <address>/<prefix>`.
pub fn parse_domifaddr(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let address = line.split_whitespace().nth(3)?;
        let ip = address.split('/').next()?;
        (!ip.is_empty()).then(|| ip.to_string())
    })
}

/// Client of one libvirt host, shared by all workflows bound to it.
pub struct HypervisorClient {
    host: String,
    uri: String,
    link: Link,
    runner: Arc<dyn CommandRunner>,
}

impl HypervisorClient {
    /// Client for `host`: local for loopback names, tunneled otherwise.
    pub fn connect(host: impl Into<String>, runner: Arc<dyn CommandRunner>) -> VirtResult<Self> {
        let host = host.into();
        if is_loopback(&host) {
            return Ok(Self {
                host,
                uri: LOCAL_URI.to_string(),
                link: Link::Local,
                runner,
            });
        }
        let channel = ControlChannel::new(host.clone(), Arc::clone(&runner))?;
        Ok(Self::with_channel(channel, runner))
    }

    /// Remote client using an already prepared channel.
    pub fn with_channel(channel: ControlChannel, runner: Arc<dyn CommandRunner>) -> Self {
        let host = channel.host().to_string();
        Self {
            uri: format!("qemu+ssh://{}/system", host),
            host,
            link: Link::Remote(channel),
            runner,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.link, Link::Remote(_))
    }

    pub fn channel(&self) -> Option<&ControlChannel> {
        match self.link {
            Link::Local => None,
            Link::Remote(ref channel) => Some(channel),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn virsh_spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("virsh")
            .args(["-q", "--connect"])
            .arg(&self.uri)
            .args(args)
    }

    /// Run a virsh command, returning its output whatever the exit code.
    pub fn virsh<I, S>(&self, args: I) -> VirtResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.output(&self.virsh_spec(args))
    }

    fn virsh_checked<I, S>(&self, args: I) -> VirtResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.checked(&self.virsh_spec(args))
    }

    /// Prepare the host: scratch storage pool, and the control channel if remote.
    pub fn setup(&self) -> VirtResult<()> {
        let out = self.virsh([
            "pool-create-as",
            "--name",
            SCRATCH_POOL,
            "--type",
            "dir",
            "--target",
            SCRATCH_POOL_TARGET,
            "--build",
        ])?;
        if !out.success() {
            // Usually the pool exists already.
            tracing::debug!(host = %self.host, output = %out.combined().trim(), "scratch pool not created");
        }
        if let Link::Remote(ref channel) = self.link {
            channel.open()?;
        }
        Ok(())
    }

    /// Current IPv4 address of `vm`, if it has one.
    pub fn domain_address(&self, vm: &str) -> VirtResult<Option<String>> {
        let out = self.virsh(["domifaddr", vm])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_domifaddr(&out.stdout))
    }

    /// Poll until `vm` reports an address.
    pub fn wait_for_address(
        &self,
        vm: &str,
        policy: &PollPolicy,
        is_cancelled: impl Fn() -> bool,
    ) -> VirtResult<String> {
        match poll_until(policy, is_cancelled, || self.domain_address(vm), |_| false) {
            Ok(ip) => {
                tracing::info!(vm, ip = %ip, "VM has network address");
                Ok(ip)
            }
            Err(PollError::Cancelled) => Err(VirtError::Cancelled),
            Err(PollError::Exhausted { attempts, .. }) => Err(VirtError::NoAddress {
                vm: vm.to_string(),
                attempts,
            }),
            Err(PollError::Fatal(e)) => Err(e),
        }
    }

    /// Start `virt-install` in the background with output going to `log`.
    pub fn install(&self, spec: &InstallSpec, log: &Path) -> VirtResult<Box<dyn ManagedChild>> {
        let command = spec.command(&self.uri).log_to(log);
        tracing::info!(vm = %spec.name, host = %self.host, "starting installation");
        self.runner.spawn(&command)
    }

    /// Destroy `vm`. Failures are logged; returns whether it succeeded.
    pub fn destroy(&self, vm: &str) -> bool {
        match self.virsh_checked(["destroy", vm]) {
            Ok(_) => {
                tracing::info!(vm, "VM destroyed");
                true
            }
            Err(e) => {
                tracing::warn!(vm, error = %e, "failed to destroy VM");
                false
            }
        }
    }

    /// Undefine `vm` and remove its storage.
    pub fn undefine(&self, vm: &str) -> VirtResult<()> {
        self.virsh_checked(["undefine", vm, "--remove-all-storage"])?;
        tracing::info!(vm, "VM undefined");
        Ok(())
    }

    /// Save a screenshot of the VM console to `path`.
    pub fn screenshot(&self, vm: &str, path: &Path) -> VirtResult<()> {
        let path = path.display().to_string();
        self.virsh_checked(["screenshot", vm, path.as_str()])?;
        Ok(())
    }

    /// Make `ports` of the VM at `ip` reachable from this machine.
    ///
    /// Local VMs are reachable as they are. For a remote hypervisor every port
    /// is forwarded through the control channel.
    pub fn configure_forwarding(&self, ip: &str, ports: &[u16]) -> VirtResult<ForwardSet> {
        match self.link {
            Link::Local => Ok(ForwardSet {
                ports: ports.iter().map(|&p| (p, p)).collect(),
                forwards: Vec::new(),
            }),
            Link::Remote(ref channel) => {
                let forwards = channel.forward_ports(ip, ports)?;
                Ok(ForwardSet {
                    ports: forwards
                        .iter()
                        .map(|f| (f.target_port, f.local_port))
                        .collect(),
                    forwards,
                })
            }
        }
    }

    /// Cancel the forwards of one workflow. The channel stays open.
    pub fn release_forwarding(&self, set: &ForwardSet) {
        if let Link::Remote(ref channel) = self.link {
            channel.cancel_forwards(&set.forwards);
        }
    }

    /// Close the control channel. Called once all workflows finished.
    pub fn shutdown(&self) {
        if let Link::Remote(ref channel) = self.link {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockRunner, SequencePorts};
    use std::time::Duration;

    fn local(runner: &Arc<MockRunner>) -> HypervisorClient {
        HypervisorClient::connect("localhost", runner.clone()).unwrap()
    }

    fn remote(runner: &Arc<MockRunner>, ports: Vec<u16>) -> HypervisorClient {
        let channel = ControlChannel::new("hyper", runner.clone())
            .unwrap()
            .with_port_source(SequencePorts::new(ports));
        HypervisorClient::with_channel(channel, runner.clone())
    }

    #[test]
    fn test_loopback_is_local() {
        let runner = Arc::new(MockRunner::new());
        for host in LOOPBACK_HOSTS {
            let client = HypervisorClient::connect(*host, runner.clone()).unwrap();
            assert!(!client.is_remote());
            assert_eq!(client.uri(), "qemu:///system");
        }
        let client = HypervisorClient::connect("hyper.example.com", runner.clone()).unwrap();
        assert!(client.is_remote());
        assert_eq!(client.uri(), "qemu+ssh://hyper.example.com/system");
    }

    #[test]
    fn test_parse_domifaddr() {
        let out = " vnet3      52:54:00:12:34:56    ipv4         192.168.122.47/24\n";
        assert_eq!(parse_domifaddr(out), Some("192.168.122.47".to_string()));
        assert_eq!(parse_domifaddr(""), None);
        assert_eq!(parse_domifaddr(" vnet3 52:54:00:12:34:56\n"), None);
    }

    #[test]
    fn test_install_argv() {
        let mut spec = InstallSpec::new("vm1", "http://tree/os,kernel=k,initrd=i");
        spec.extra_args = "inst.sshd".to_string();
        assert_eq!(
            spec.argv(LOCAL_URI).join(" "),
            "virt-install --connect qemu:///system --noautoconsole -n vm1 --os-variant rhel-unknown \
             --location http://tree/os,kernel=k,initrd=i --memory 4096 --vcpus 2 --disk size=10 \
             --extra-args inst.sshd"
        );

        spec.serial_console = true;
        let argv = spec.argv(LOCAL_URI);
        assert_eq!(argv[3..5], ["--autoconsole".to_string(), "text".to_string()]);
        assert!(argv.join(" ").contains("--disk size=10 --serial pty --extra-args"));
    }

    #[test]
    fn test_wait_for_address_polls() {
        let runner = Arc::new(MockRunner::new());
        runner
            .respond(&["domifaddr"], MockResponse::fail(1, "domain not found"))
            .respond(&["domifaddr"], MockResponse::ok(""))
            .respond(
                &["domifaddr"],
                MockResponse::ok(" vnet0 52:54:00:aa:bb:cc ipv4 10.0.0.9/24\n"),
            );
        let client = local(&runner);
        let policy = PollPolicy::attempts(Duration::from_millis(1), 10);

        let ip = client.wait_for_address("vm1", &policy, || false).unwrap();
        assert_eq!(ip, "10.0.0.9");
        let call = &runner.calls_matching(&["domifaddr"])[0];
        assert_eq!(
            call.argv(),
            ["virsh", "-q", "--connect", "qemu:///system", "domifaddr", "vm1"]
        );
        assert_eq!(runner.count(&["domifaddr"]), 3);
    }

    #[test]
    fn test_wait_for_address_exhausted() {
        let runner = Arc::new(MockRunner::new());
        let client = local(&runner);
        let policy = PollPolicy::attempts(Duration::from_millis(1), 3);

        let err = client.wait_for_address("vm1", &policy, || false).unwrap_err();
        assert!(matches!(err, VirtError::NoAddress { attempts: 3, .. }));
    }

    #[test]
    fn test_local_forwarding_is_identity() {
        let runner = Arc::new(MockRunner::new());
        let client = local(&runner);
        let set = client.configure_forwarding("10.0.0.9", &[22, 80]).unwrap();
        assert_eq!(set.local_port(22), Some(22));
        assert_eq!(set.local_port(80), Some(80));
        assert!(!set.is_tunneled());
        client.release_forwarding(&set);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_remote_forwarding_and_release() {
        let runner = Arc::new(MockRunner::new());
        let client = remote(&runner, vec![51000, 51001]);
        client.setup().unwrap();

        let set = client.configure_forwarding("10.0.0.9", &[22, 80]).unwrap();
        assert_eq!(set.ports, vec![(22, 51000), (80, 51001)]);
        client.release_forwarding(&set);
        assert_eq!(runner.count(&["-O", "cancel"]), 2);
        assert!(client.channel().unwrap().is_open());

        client.shutdown();
        client.shutdown();
        assert_eq!(runner.count(&["-O", "exit"]), 1);
    }

    #[test]
    fn test_setup_tolerates_existing_pool() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(&["pool-create-as"], MockResponse::fail(1, "pool exists"));
        let client = local(&runner);
        client.setup().unwrap();
        assert_eq!(runner.count(&["--name", "boot-scratch"]), 1);
    }

    #[test]
    fn test_destroy_is_best_effort() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(&["destroy"], MockResponse::fail(1, "domain is not running"));
        let client = local(&runner);
        assert!(!client.destroy("vm1"));
        assert!(client.undefine("vm1").is_ok());
        assert_eq!(runner.count(&["undefine", "vm1", "--remove-all-storage"]), 1);
    }
}
