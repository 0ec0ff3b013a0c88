//! Scriptable stand-ins for external commands.
//!
//! [`MockRunner`] records every command it is asked to run and answers from
//! rules keyed by a word pattern, so hypervisor, control channel, container
//! and workflow logic can be exercised without libvirt, ssh or podman.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{CommandOutput, CommandRunner, CommandSpec, OutputMode};
use crate::control::PortSource;
use crate::error::VirtResult;
use crate::process::{ChildExit, ManagedChild};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Canned result of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    /// Successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed run with the given exit code and stderr.
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<MockResponse> for CommandOutput {
    fn from(r: MockResponse) -> Self {
        CommandOutput {
            code: Some(r.code),
            stdout: r.stdout,
            stderr: r.stderr,
        }
    }
}

/// How a mock child process behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildBehavior {
    /// Exits with the code as soon as it is checked.
    Immediately(i32),
    /// Exits with the code after being checked this many times.
    AfterPolls(u32, i32),
    /// Runs until it receives SIGTERM.
    OnTerminate,
    /// Ignores SIGTERM and runs until SIGKILL.
    OnKill,
    /// Never exits.
    Never,
}

/// Observer of a spawned [`MockChild`].
#[derive(Debug, Clone)]
pub struct ChildHandle {
    inner: Arc<ChildShared>,
}

#[derive(Debug)]
struct ChildShared {
    argv: Vec<String>,
    terminated: AtomicBool,
    killed: AtomicBool,
    polls: AtomicU32,
}

impl ChildHandle {
    /// Argv the child was spawned with.
    pub fn argv(&self) -> &[String] {
        &self.inner.argv
    }

    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    /// Number of `try_wait` calls so far.
    pub fn polls(&self) -> u32 {
        self.inner.polls.load(Ordering::SeqCst)
    }
}

/// Scripted child process.
pub struct MockChild {
    behavior: ChildBehavior,
    shared: Arc<ChildShared>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

impl MockChild {
    pub fn new(behavior: ChildBehavior) -> (Self, ChildHandle) {
        Self::with_argv(behavior, Vec::new())
    }

    fn with_argv(behavior: ChildBehavior, argv: Vec<String>) -> (Self, ChildHandle) {
        let shared = Arc::new(ChildShared {
            argv,
            terminated: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            polls: AtomicU32::new(0),
        });
        let child = Self {
            behavior,
            shared: Arc::clone(&shared),
            stdout: None,
            stderr: None,
        };
        (child, ChildHandle { inner: shared })
    }

    /// Make the child print `text` on stdout.
    pub fn with_stdout(mut self, text: impl Into<String>) -> Self {
        self.stdout = Some(text.into().into_bytes());
        self
    }
}

impl ManagedChild for MockChild {
    fn id(&self) -> u32 {
        4242
    }

    fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        let polls = self.shared.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let killed = self.shared.killed.load(Ordering::SeqCst);
        let terminated = self.shared.terminated.load(Ordering::SeqCst);

        let exit = match self.behavior {
            ChildBehavior::Never => None,
            _ if killed => Some(ChildExit::signaled(SIGKILL)),
            ChildBehavior::Immediately(code) => Some(ChildExit::code(code)),
            ChildBehavior::AfterPolls(n, code) if polls > n => Some(ChildExit::code(code)),
            ChildBehavior::AfterPolls(..) if terminated => Some(ChildExit::signaled(SIGTERM)),
            ChildBehavior::OnTerminate if terminated => Some(ChildExit::signaled(SIGTERM)),
            _ => None,
        };
        Ok(exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.shared.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.shared.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .take()
            .map(|b| Box::new(Cursor::new(b)) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stderr
            .take()
            .map(|b| Box::new(Cursor::new(b)) as Box<dyn Read + Send>)
    }
}

struct Rule<R> {
    pattern: Vec<String>,
    responses: VecDeque<R>,
}

impl<R: Clone> Rule<R> {
    /// Queued responses are consumed in order; the last one repeats.
    fn next(&mut self) -> Option<R> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

#[derive(Clone)]
struct SpawnScript {
    behavior: ChildBehavior,
    stdout: String,
}

/// Find the rule with the longest pattern occurring as a contiguous word
/// sequence in `argv`; later rules win ties.
fn matching_rule<'a, R>(rules: &'a mut [Rule<R>], argv: &[String]) -> Option<&'a mut Rule<R>> {
    let mut best: Option<(usize, usize)> = None;
    for (i, rule) in rules.iter().enumerate() {
        let n = rule.pattern.len();
        let hit = n == 0 || argv.windows(n).any(|w| w == rule.pattern.as_slice());
        if hit && best.map_or(true, |(_, len)| n >= len) {
            best = Some((i, n));
        }
    }
    best.map(move |(i, _)| &mut rules[i])
}

fn words(pattern: &[&str]) -> Vec<String> {
    pattern.iter().map(|s| s.to_string()).collect()
}

/// Recording, scriptable [`CommandRunner`].
#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Mutex<Vec<Rule<MockResponse>>>,
    spawn_rules: Mutex<Vec<Rule<SpawnScript>>>,
    children: Mutex<Vec<ChildHandle>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `response`.
    ///
    /// Calling this repeatedly for one pattern queues responses; the last
    /// queued response is repeated once the others are used up.
    pub fn respond(&self, pattern: &[&str], response: MockResponse) -> &Self {
        let pattern = words(pattern);
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(response),
            None => rules.push(Rule {
                pattern,
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    /// Spawned commands containing `pattern` behave as `behavior`.
    pub fn on_spawn(&self, pattern: &[&str], behavior: ChildBehavior) -> &Self {
        self.on_spawn_with_output(pattern, behavior, "")
    }

    /// Like [`on_spawn`](Self::on_spawn), also printing `stdout`.
    pub fn on_spawn_with_output(
        &self,
        pattern: &[&str],
        behavior: ChildBehavior,
        stdout: &str,
    ) -> &Self {
        let pattern = words(pattern);
        let script = SpawnScript {
            behavior,
            stdout: stdout.to_string(),
        };
        let mut rules = lock(&self.spawn_rules);
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(script),
            None => rules.push(Rule {
                pattern,
                responses: VecDeque::from([script]),
            }),
        }
        self
    }

    /// Every command run or spawned so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    /// Argv of every command so far.
    pub fn argvs(&self) -> Vec<Vec<String>> {
        lock(&self.calls).iter().map(CommandSpec::argv).collect()
    }

    /// Commands whose argv contains `pattern`.
    pub fn calls_matching(&self, pattern: &[&str]) -> Vec<CommandSpec> {
        let pattern = words(pattern);
        lock(&self.calls)
            .iter()
            .filter(|c| c.argv().windows(pattern.len()).any(|w| w == pattern.as_slice()))
            .cloned()
            .collect()
    }

    /// Number of commands whose argv contains `pattern`.
    pub fn count(&self, pattern: &[&str]) -> usize {
        self.calls_matching(pattern).len()
    }

    /// Handles of all spawned children in spawn order.
    pub fn children(&self) -> Vec<ChildHandle> {
        lock(&self.children).clone()
    }
}

impl CommandRunner for MockRunner {
    fn output(&self, spec: &CommandSpec) -> VirtResult<CommandOutput> {
        lock(&self.calls).push(spec.clone());
        let argv = spec.argv();
        let response = {
            let mut rules = lock(&self.rules);
            matching_rule(&mut rules, &argv).and_then(Rule::next)
        };
        Ok(response.unwrap_or_else(|| MockResponse::ok("")).into())
    }

    fn spawn(&self, spec: &CommandSpec) -> VirtResult<Box<dyn ManagedChild>> {
        lock(&self.calls).push(spec.clone());
        let argv = spec.argv();
        let script = {
            let mut rules = lock(&self.spawn_rules);
            matching_rule(&mut rules, &argv).and_then(Rule::next)
        }
        .unwrap_or(SpawnScript {
            behavior: ChildBehavior::Immediately(0),
            stdout: String::new(),
        });

        let (mut child, handle) = MockChild::with_argv(script.behavior, argv);
        match spec.output {
            OutputMode::Log(ref path) => std::fs::write(path, &script.stdout)?,
            OutputMode::Piped => child = child.with_stdout(script.stdout),
            OutputMode::Null => {}
        }
        lock(&self.children).push(handle);
        Ok(Box::new(child))
    }
}

/// [`PortSource`] yielding a fixed sequence of ports, then repeating the last.
#[derive(Debug, Clone)]
pub struct SequencePorts {
    ports: VecDeque<u16>,
}

impl SequencePorts {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }
}

impl PortSource for SequencePorts {
    fn next_port(&mut self) -> u16 {
        if self.ports.len() > 1 {
            self.ports.pop_front().unwrap_or(crate::control::PORT_RANGE_START)
        } else {
            self.ports
                .front()
                .copied()
                .unwrap_or(crate::control::PORT_RANGE_START)
        }
    }
}
