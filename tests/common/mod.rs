//! In-process fakes for the container runtime, hardware and sessions.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use devbench::backoff::RetryPolicy;
use devbench::broker::DeviceBroker;
use devbench::config::{RescanConfig, SandboxConfig, SerialConfig, ToolchainConfig};
use devbench::error::{Error, Result};
use devbench::pipeline::FlashPipeline;
use devbench::process::{ExecOutput, OutputLine};
use devbench::registry::{ActionRecord, Device, DeviceRegistry, Grant, StateStore, Store, UserRecord};
use devbench::relay::{RelayRegistry, SerialOpener, SerialPort};
use devbench::rescan::RescanCoordinator;
use devbench::sandbox::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ReadinessProbe, SandboxManager,
    SessionEndpoint,
};
use devbench::scanner::DeviceScanner;
use devbench::session::{
    RemoteSession, SessionBridge, SessionConnector, SessionTarget, ShellChannel,
};
use devbench::subscriber::{Event, EventSink, SubscriberId};

/// Output and exit code a scripted tool invocation produces.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

impl Script {
    pub fn new(exit_code: i32, lines: &[&str]) -> Self {
        Self {
            exit_code,
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct RuntimeState {
    containers: HashMap<String, ContainerInfo>,
    specs: Vec<ContainerSpec>,
    creates: usize,
    removes: usize,
    hidden_inside: BTreeSet<String>,
    commands: Vec<Vec<String>>,
    compile: Script,
    upload: Script,
    upload_delay: Duration,
    uploads_active: usize,
    upload_peak: usize,
}

/// Container runtime that keeps containers in memory.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn creates(&self) -> usize {
        self.state().creates
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.state().containers.get(name).cloned()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state().specs.last().cloned()
    }

    /// Marks a container as exited.
    pub fn stop(&self, name: &str) {
        if let Some(c) = self.state().containers.get_mut(name) {
            c.running = false;
            c.status = "exited".to_string();
        }
    }

    /// Makes `test -e <port>` fail inside every container.
    pub fn hide_inside(&self, port: &str) {
        self.state().hidden_inside.insert(port.to_string());
    }

    pub fn set_compile(&self, script: Script) {
        self.state().compile = script;
    }

    pub fn set_upload(&self, script: Script) {
        self.state().upload = script;
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        self.state().upload_delay = delay;
    }

    pub fn upload_peak(&self) -> usize {
        self.state().upload_peak
    }

    /// Commands run through `exec_streaming` whose second word is `word`.
    pub fn tool_runs(&self, word: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.get(1).is_some_and(|w| w == word))
            .count()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        Ok(self.container(name))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.state();
        state.creates += 1;
        state.specs.push(spec.clone());
        state.containers.insert(
            spec.name.clone(),
            ContainerInfo {
                name: spec.name.clone(),
                status: "running".to_string(),
                running: true,
                devices: spec.devices.clone(),
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.containers.remove(name).is_some() {
            state.removes += 1;
        }
        Ok(())
    }

    async fn exec(&self, name: &str, _user: Option<&str>, args: &[String]) -> Result<ExecOutput> {
        let state = self.state();
        if !state.containers.get(name).is_some_and(|c| c.running) {
            return Err(Error::Runtime(format!("container {} is not running", name)));
        }
        let missing = args.first().is_some_and(|a| a == "test")
            && args.last().is_some_and(|p| state.hidden_inside.contains(p));
        Ok(ExecOutput {
            status: if missing { 1 } else { 0 },
            stdout: Vec::new(),
            stderr: String::new(),
        })
    }

    async fn exec_streaming(
        &self,
        _name: &str,
        _user: Option<&str>,
        args: &[String],
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<i32> {
        let (script, delay) = {
            let mut state = self.state();
            state.commands.push(args.to_vec());
            match args.get(1).map(String::as_str) {
                Some("compile") => (state.compile.clone(), Duration::ZERO),
                Some("upload") => {
                    state.uploads_active += 1;
                    state.upload_peak = state.upload_peak.max(state.uploads_active);
                    (state.upload.clone(), state.upload_delay)
                }
                _ => (Script::default(), Duration::ZERO),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for line in script.lines {
            let _ = output_tx.send(OutputLine::Stdout(line)).await;
        }
        if args.get(1).is_some_and(|w| w == "upload") {
            self.state().uploads_active -= 1;
        }
        Ok(script.exit_code)
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect())
    }
}

/// Store that delegates to an in-memory [`StateStore`], with hooks to
/// interleave readers and to fail writes for one port.
pub struct HookedStore {
    pub inner: StateStore,
    pub yield_in_users: AtomicBool,
    pub fail_upsert_for: Mutex<Option<String>>,
}

impl Default for HookedStore {
    fn default() -> Self {
        Self {
            inner: StateStore::in_memory(),
            yield_in_users: AtomicBool::new(false),
            fail_upsert_for: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Store for HookedStore {
    async fn create_user(&self, username: &str) -> Result<UserRecord> {
        self.inner.create_user(username).await
    }

    async fn user(&self, username: &str) -> Result<Option<UserRecord>> {
        self.inner.user(username).await
    }

    async fn user_by_safe_name(&self, safe_name: &str) -> Result<Option<UserRecord>> {
        self.inner.user_by_safe_name(safe_name).await
    }

    async fn users(&self) -> Result<Vec<UserRecord>> {
        let users = self.inner.users().await;
        if self.yield_in_users.load(Ordering::SeqCst) {
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        users
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        self.inner.delete_user(username).await
    }

    async fn set_management_port(&self, username: &str, port: Option<u16>) -> Result<()> {
        self.inner.set_management_port(username, port).await
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        self.inner.devices().await
    }

    async fn device(&self, port: &str) -> Result<Option<Device>> {
        self.inner.device(port).await
    }

    async fn upsert_device(&self, device: Device) -> Result<()> {
        if self.fail_upsert_for.lock().unwrap().as_deref() == Some(device.port.as_str()) {
            return Err(Error::Runtime(format!("store rejected {}", device.port)));
        }
        self.inner.upsert_device(device).await
    }

    async fn grants(&self) -> Result<Vec<Grant>> {
        self.inner.grants().await
    }

    async fn put_grant(&self, grant: Grant) -> Result<()> {
        self.inner.put_grant(grant).await
    }

    async fn remove_grant(&self, username: &str, port: &str) -> Result<bool> {
        self.inner.remove_grant(username, port).await
    }

    async fn append_action(&self, record: ActionRecord) -> Result<()> {
        self.inner.append_action(record).await
    }

    async fn actions(&self, username: &str) -> Result<Vec<ActionRecord>> {
        self.inner.actions(username).await
    }
}

/// Readiness probe that can be switched between up and down.
#[derive(Default)]
pub struct FakeProbe {
    down: AtomicBool,
    probes: AtomicUsize,
}

impl FakeProbe {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn probe(&self, host: &str, port: u16) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Connection {
                user: format!("{}:{}", host, port),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Physical port set controlled by the test.
#[derive(Default)]
pub struct FakeScanner {
    ports: Mutex<BTreeSet<String>>,
}

impl FakeScanner {
    pub fn set(&self, ports: &[&str]) {
        *self.ports.lock().unwrap() = ports.iter().map(|p| p.to_string()).collect();
    }
}

#[async_trait]
impl DeviceScanner for FakeScanner {
    async fn scan(&self) -> Result<BTreeSet<String>> {
        Ok(self.ports.lock().unwrap().clone())
    }
}

/// Event sink that records everything and can simulate departed subscribers.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(SubscriberId, Event)>>,
    gone: Mutex<HashSet<SubscriberId>>,
}

impl RecordingSink {
    pub fn events_for(&self, subscriber: &SubscriberId) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == subscriber)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn mark_gone(&self, subscriber: &SubscriberId) {
        self.gone.lock().unwrap().insert(subscriber.clone());
    }

    /// Concatenated serial payload delivered to `subscriber`.
    pub fn serial_text(&self, subscriber: &SubscriberId) -> String {
        self.events_for(subscriber)
            .into_iter()
            .filter_map(|e| match e {
                Event::SerialData { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn shell_text(&self, subscriber: &SubscriberId) -> String {
        self.events_for(subscriber)
            .into_iter()
            .filter_map(|e| match e {
                Event::ShellData { data } => Some(data),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, subscriber: &SubscriberId, event: Event) -> Result<()> {
        if self.gone.lock().unwrap().contains(subscriber) {
            return Err(Error::NotFound(format!("subscriber {}", subscriber)));
        }
        self.events
            .lock()
            .unwrap()
            .push((subscriber.clone(), event));
        Ok(())
    }
}

/// Shared state of every [`FakeSerialPort`] an opener hands out.
#[derive(Default)]
pub struct SerialState {
    pub chunks: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub opens: usize,
    pub closes: usize,
    pub fail_open: bool,
    pub error_when_drained: bool,
}

#[derive(Default, Clone)]
pub struct FakeSerialOpener {
    pub state: Arc<Mutex<SerialState>>,
}

impl FakeSerialOpener {
    pub fn push(&self, chunk: &[u8]) {
        self.state.lock().unwrap().chunks.push_back(chunk.to_vec());
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }
}

#[async_trait]
impl SerialOpener for FakeSerialOpener {
    async fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialPort>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(Error::Serial {
                port: port.to_string(),
                reason: "No such file or directory".to_string(),
            });
        }
        state.opens += 1;
        Ok(Box::new(FakeSerialPort {
            state: self.state.clone(),
        }))
    }
}

pub struct FakeSerialPort {
    state: Arc<Mutex<SerialState>>,
}

impl SerialPort for FakeSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let Some(mut chunk) = state.chunks.pop_front() else {
            if state.error_when_drained {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device disconnected",
                ));
            }
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.state.lock().unwrap().written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Shell whose output is fed by the test through a channel.
pub struct FakeShell {
    output: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    input: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.output.lock().await.recv().await {
            Some(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out in-memory sessions.
#[derive(Default)]
pub struct FakeConnector {
    pub failures_left: AtomicUsize,
    pub connects: AtomicUsize,
    pub session_closes: Arc<AtomicUsize>,
    pub shell_closes: Arc<AtomicUsize>,
    pub shell_input: Arc<Mutex<Vec<u8>>>,
    pub commands: Arc<Mutex<Vec<String>>>,
    shell_output: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl FakeConnector {
    /// Returns the sender feeding the next shell's output.
    pub fn shell_feed(&self) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        *self.shell_output.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Connection {
                user: target.username.clone(),
                reason: "connection refused".to_string(),
            });
        }
        let shell = self.shell_output.lock().unwrap().take().map(|rx| FakeShell {
            output: tokio::sync::Mutex::new(rx),
            input: self.shell_input.clone(),
            closes: self.shell_closes.clone(),
        });
        Ok(Box::new(FakeSession {
            shell: Mutex::new(shell),
            closes: self.session_closes.clone(),
            commands: self.commands.clone(),
        }))
    }
}

pub struct FakeSession {
    shell: Mutex<Option<FakeShell>>,
    closes: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(ExecOutput {
            status: 0,
            stdout: Vec::new(),
            stderr: String::new(),
        })
    }

    async fn exec_with_input(&self, command: &str, _input: &[u8]) -> Result<ExecOutput> {
        self.exec(command).await
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        match self.shell.lock().unwrap().take() {
            Some(shell) => Ok(Box::new(shell)),
            None => Err(Error::Remote("no shell available".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sandbox manager wired to fakes, with users and ports ready to use.
pub struct Harness {
    pub store: Arc<StateStore>,
    pub registry: DeviceRegistry,
    pub runtime: Arc<FakeRuntime>,
    pub scanner: Arc<FakeScanner>,
    pub probe: Arc<FakeProbe>,
    pub sink: Arc<RecordingSink>,
    pub manager: SandboxManager,
    _data: TempDir,
}

impl Harness {
    /// Builds a harness whose host currently has `ports` plugged in.
    pub async fn new(ports: &[&str]) -> Self {
        let data = TempDir::new().unwrap();
        let store = Arc::new(StateStore::in_memory());
        let registry = DeviceRegistry::new(store.clone());
        let runtime = Arc::new(FakeRuntime::default());
        let scanner = Arc::new(FakeScanner::default());
        let probe = Arc::new(FakeProbe::default());
        scanner.set(ports);
        registry
            .reconcile_present(&scanner.scan().await.unwrap())
            .await
            .unwrap();

        let config = SandboxConfig {
            data_root: data.path().to_path_buf(),
            port_range: (47100, 47199),
            ..SandboxConfig::default()
        };
        let manager = SandboxManager::new(
            runtime.clone(),
            registry.clone(),
            scanner.clone(),
            probe.clone(),
            config,
            SessionEndpoint {
                host: "127.0.0.1".to_string(),
                password: "secret".to_string(),
            },
        )
        .with_ready_policy(RetryPolicy::immediate(2));

        Self {
            store,
            registry,
            runtime,
            scanner,
            probe,
            sink: Arc::new(RecordingSink::default()),
            manager,
            _data: data,
        }
    }

    /// Creates a user and grants them `ports`.
    pub async fn user(&self, name: &str, ports: &[&str]) {
        self.store.create_user(name).await.unwrap();
        for port in ports {
            self.registry.grant(name, port, None).await.unwrap();
        }
    }

    pub fn pipeline(&self) -> FlashPipeline {
        FlashPipeline::new(
            self.manager.clone(),
            DeviceBroker::new(),
            self.sink.clone(),
            ToolchainConfig::default(),
        )
    }

    pub fn rescan(&self) -> RescanCoordinator {
        RescanCoordinator::new(
            self.manager.clone(),
            RescanConfig {
                interval_secs: 3600,
                debounce_ms: 50,
                ..RescanConfig::default()
            },
        )
    }

    pub fn relays(&self, opener: FakeSerialOpener) -> RelayRegistry {
        RelayRegistry::new(
            self.sink.clone(),
            Arc::new(opener),
            SerialConfig {
                poll_interval_ms: 5,
                flush_interval_ms: 20,
                ..SerialConfig::default()
            },
        )
    }

    pub fn sessions(&self, connector: Arc<FakeConnector>) -> SessionBridge {
        SessionBridge::new(
            self.registry.clone(),
            connector,
            "127.0.0.1",
            "secret",
            RetryPolicy::immediate(3),
        )
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
