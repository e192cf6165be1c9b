//! Deterministic fakes for the tool interfaces.
//!
//! Each fake records what it was asked to do and answers from scripted
//! rules. Rules match on a substring of the command line; the most recently
//! added matching rule wins. A rule with several replies hands them out in
//! order and then keeps repeating the last one.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::exec::{
    ChartInstaller, ClientFactory, ClusterClients, KubeApi, Release, ReleaseSpec, ReleaseStatus,
    RemoteSession, RemoteShell, TalosCli,
};
use crate::state::{Checkpoint, ComputedState};

#[derive(Debug, Clone)]
enum Reply {
    Output(String),
    Fail(String),
    Unreachable(String),
}

impl Reply {
    fn into_result(self, step: &str) -> Result<String> {
        match self {
            Self::Output(out) => Ok(out),
            Self::Fail(msg) => Err(Error::command(step, msg)),
            Self::Unreachable(msg) => Err(Error::connection(step, msg)),
        }
    }
}

#[derive(Debug)]
struct Rule {
    scope: Option<String>,
    pattern: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct Rules(Vec<Rule>);

impl Rules {
    fn add(&mut self, scope: Option<&str>, pattern: &str, replies: Vec<Reply>) {
        self.0.push(Rule {
            scope: scope.map(str::to_string),
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
    }

    fn answer(&mut self, scope: &str, line: &str) -> Option<Reply> {
        let rule = self.0.iter_mut().rev().find(|r| {
            r.scope.as_deref().map_or(true, |s| s == scope) && line.contains(&r.pattern)
        })?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct ShellState {
    rules: Rules,
    commands: Vec<(String, String)>,
    connects: HashMap<String, u32>,
    refuse_connects: HashMap<String, u32>,
}

/// Fake SSH: answers commands per host from scripted rules, empty output by
/// default.
#[derive(Debug, Clone, Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any host running a command containing `pattern` prints `output`.
    pub fn respond(&self, pattern: &str, output: &str) -> &Self {
        self.lock().rules.add(None, pattern, vec![Reply::Output(output.into())]);
        self
    }

    /// Successive outputs for the same command on one host.
    pub fn respond_sequence(&self, host: &str, pattern: &str, outputs: &[&str]) -> &Self {
        let replies = outputs.iter().map(|o| Reply::Output((*o).into())).collect();
        self.lock().rules.add(Some(host), pattern, replies);
        self
    }

    /// The command exits non-zero on `host`.
    pub fn fail_on(&self, host: &str, pattern: &str, message: &str) -> &Self {
        self.lock()
            .rules
            .add(Some(host), pattern, vec![Reply::Fail(message.into())]);
        self
    }

    /// Refuse the first `times` connections to `host`.
    pub fn refuse_connections(&self, host: &str, times: u32) -> &Self {
        self.lock().refuse_connects.insert(host.to_string(), times);
        self
    }

    /// Commands run on `host`, in order.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// How many commands containing `pattern` ran on `host`.
    pub fn count(&self, host: &str, pattern: &str) -> usize {
        self.commands_on(host)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Hosts in the order they ran a command containing `pattern`.
    pub fn hosts_running(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(_, c)| c.contains(pattern))
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Successful connections made to `host`.
    pub fn connections(&self, host: &str) -> u32 {
        self.lock().connects.get(host).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShellState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect(&self, node: &NodeConfig) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.lock();
        if let Some(left) = state.refuse_connects.get_mut(&node.host) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::connection(node.ssh_address(), "connection refused"));
            }
        }
        *state.connects.entry(node.host.clone()).or_default() += 1;
        Ok(Box::new(FakeSession {
            host: node.host.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<ShellState>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&self, command: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.commands.push((self.host.clone(), command.to_string()));
        match state.rules.answer(&self.host, command) {
            Some(reply) => reply.into_result(&format!("`{command}` on {}", self.host)),
            None => Ok(String::new()),
        }
    }

    async fn close(&self) {}
}

#[derive(Debug, Default)]
struct TalosState {
    rules: Rules,
    calls: Vec<Vec<String>>,
}

/// Fake talosctl. `gen secrets`, `gen config` and `kubeconfig` write
/// plausible files into the working directory the way the real tool does.
#[derive(Debug, Clone, Default)]
pub struct FakeTalosctl {
    state: Arc<Mutex<TalosState>>,
}

impl FakeTalosctl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls whose joined argv contains `pattern` print `output`.
    pub fn respond(&self, pattern: &str, output: &str) -> &Self {
        self.lock().rules.add(None, pattern, vec![Reply::Output(output.into())]);
        self
    }

    /// Successive outputs for the same call.
    pub fn respond_sequence(&self, pattern: &str, outputs: &[&str]) -> &Self {
        let replies = outputs.iter().map(|o| Reply::Output((*o).into())).collect();
        self.lock().rules.add(None, pattern, replies);
        self
    }

    /// Calls containing `pattern` fail with `message`.
    pub fn fail(&self, pattern: &str, message: &str) -> &Self {
        self.lock().rules.add(None, pattern, vec![Reply::Fail(message.into())]);
        self
    }

    /// Calls containing `pattern` cannot reach the node.
    pub fn unreachable(&self, pattern: &str, message: &str) -> &Self {
        self.lock()
            .rules
            .add(None, pattern, vec![Reply::Unreachable(message.into())]);
        self
    }

    /// Every call's argv joined with spaces.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.join(" ")).collect()
    }

    /// Calls containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TalosState> {
        self.state.lock().unwrap()
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn simulate_outputs(workdir: &Path, args: &[String]) -> std::io::Result<()> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["gen", "secrets", ..] => {
            let out = flag_value(args, "-o").unwrap_or("secrets.yaml");
            std::fs::write(workdir.join(out), "cluster:\n  id: fake-cluster-id\n")
        }
        ["gen", "config", name, endpoint, ..] => {
            let dir = workdir.join(flag_value(args, "--output-dir").unwrap_or("."));
            std::fs::create_dir_all(&dir)?;
            for kind in ["controlplane", "worker"] {
                std::fs::write(
                    dir.join(format!("{kind}.yaml")),
                    format!("machine:\n  type: {kind}\ncluster:\n  clusterName: {name}\n  controlPlane:\n    endpoint: {endpoint}\n"),
                )?;
            }
            std::fs::write(
                dir.join("talosconfig"),
                format!("context: {name}\ncontexts:\n  {name}:\n    endpoints: []\n"),
            )
        }
        ["kubeconfig", path, ..] => std::fs::write(
            workdir.join(path),
            "apiVersion: v1\nkind: Config\nclusters:\n- cluster:\n    server: https://10.0.0.20:6443\n  name: lab\n",
        ),
        _ => Ok(()),
    }
}

#[async_trait]
impl TalosCli for FakeTalosctl {
    async fn run(&self, workdir: &Path, args: &[String]) -> Result<String> {
        let line = args.join(" ");
        let reply = {
            let mut state = self.lock();
            state.calls.push(args.to_vec());
            state.rules.answer("", &line)
        };
        let step = format!("talosctl {}", args.first().map_or("", String::as_str));
        match reply {
            Some(Reply::Output(out)) => {
                simulate_outputs(workdir, args)?;
                Ok(out)
            }
            Some(other) => other.into_result(&step),
            None => {
                simulate_outputs(workdir, args)?;
                Ok(String::new())
            }
        }
    }
}

/// Chart installer that records every request and reports success.
#[derive(Debug, Clone, Default)]
pub struct FakeCharts {
    pub repositories: Arc<Mutex<Vec<(String, String)>>>,
    pub installs: Arc<Mutex<Vec<ReleaseSpec>>>,
}

impl FakeCharts {
    /// Release names in install order.
    pub fn installed(&self) -> Vec<String> {
        self.installs
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.release_name.clone())
            .collect()
    }
}

#[async_trait]
impl ChartInstaller for FakeCharts {
    async fn add_repository(&self, name: &str, url: &str) -> Result<()> {
        self.repositories
            .lock()
            .unwrap()
            .push((name.to_string(), url.to_string()));
        Ok(())
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<Release> {
        self.installs.lock().unwrap().push(spec.clone());
        Ok(Release {
            name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            status: ReleaseStatus::Deployed,
            revision: 1,
        })
    }

    async fn get_release(&self, name: &str, namespace: &str) -> Result<Release> {
        let installs = self.installs.lock().unwrap();
        let count = installs.iter().filter(|s| s.release_name == name).count();
        if count == 0 {
            return Err(Error::command("helm status", "release: not found"));
        }
        Ok(Release {
            name: name.to_string(),
            namespace: namespace.to_string(),
            status: ReleaseStatus::Deployed,
            revision: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }
}

/// Kubernetes API that accepts everything and reports ready deployments.
#[derive(Debug, Clone, Default)]
pub struct FakeKube {
    pub applied: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn apply(&self, manifest_yaml: &str) -> Result<()> {
        self.applied.lock().unwrap().push(manifest_yaml.to_string());
        Ok(())
    }

    async fn delete(&self, _manifest_yaml: &str) -> Result<()> {
        Ok(())
    }

    async fn get(&self, kind: &str, name: &str, _namespace: &str) -> Result<String> {
        if kind == "deployment" {
            Ok(format!(
                r#"{{"metadata":{{"name":"{name}"}},"spec":{{"replicas":1}},"status":{{"readyReplicas":1}}}}"#
            ))
        } else {
            Ok(format!(r#"{{"metadata":{{"name":"{name}"}}}}"#))
        }
    }
}

/// Hands out the same fake clients and remembers the kubeconfigs it saw.
#[derive(Debug, Clone, Default)]
pub struct FakeClientFactory {
    pub charts: FakeCharts,
    pub kube: FakeKube,
    pub kubeconfigs: Arc<Mutex<Vec<String>>>,
}

impl ClientFactory for FakeClientFactory {
    fn clients(&self, kubeconfig: &str) -> Result<ClusterClients> {
        self.kubeconfigs.lock().unwrap().push(kubeconfig.to_string());
        Ok(ClusterClients::new(
            Arc::new(self.charts.clone()),
            Arc::new(self.kube.clone()),
        ))
    }
}

/// Checkpoint that keeps every saved state in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingCheckpoint {
    pub saved: Arc<Mutex<Vec<ComputedState>>>,
}

impl RecordingCheckpoint {
    /// Most recent checkpoint.
    pub fn last(&self) -> Option<ComputedState> {
        self.saved.lock().unwrap().last().cloned()
    }
}

impl Checkpoint for RecordingCheckpoint {
    fn save(&self, state: &ComputedState) -> Result<()> {
        self.saved.lock().unwrap().push(state.clone());
        Ok(())
    }
}
