//! In-process container engine.
//!
//! Keeps containers in a map and never touches a real runtime. Used by
//! the test suites (including fault injection through [`FailPoint`]) and
//! by `forged agent --engine memory` for dry runs of the control path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::*;

/// Engine operations that can be made to fail or stall on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Exec,
    List,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    state: RunState,
    cpu: CpuSample,
    logs: Vec<String>,
    followers: Vec<mpsc::UnboundedSender<EngineResult<LogLine>>>,
    execs: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    failures: HashMap<FailPoint, String>,
    delays: HashMap<FailPoint, Duration>,
    pulls: Vec<String>,
}

/// In-memory [`ContainerEngine`].
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
    log_readers: Arc<AtomicUsize>,
}

/// Decrements the reader gauge when a log stream is dropped.
struct ReaderGuard(Arc<AtomicUsize>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

const CORES: u32 = 4;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens inside a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every later call of `point` fail with `message`.
    pub fn fail_on(&self, point: FailPoint, message: &str) {
        self.lock().failures.insert(point, message.to_string());
    }

    pub fn clear_failure(&self, point: FailPoint) {
        self.lock().failures.remove(&point);
    }

    /// Make every later call of `point` take at least `delay`.
    pub fn delay_on(&self, point: FailPoint, delay: Duration) {
        self.lock().delays.insert(point, delay);
    }

    /// Pretend `image` is already present locally.
    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    /// Images pulled so far, in order.
    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    /// The spec a container was created with.
    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Commands executed inside a container.
    pub fn execs_of(&self, id: &str) -> Vec<Vec<String>> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.execs.clone())
            .unwrap_or_default()
    }

    /// Force a container into a state, e.g. to simulate a crash.
    pub fn set_state(&self, id: &str, state: RunState) {
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.state = state;
        }
    }

    /// Append a console line and deliver it to every follower.
    pub fn push_log(&self, id: &str, line: &str) {
        let mut inner = self.lock();
        if let Some(c) = inner.containers.get_mut(id) {
            c.logs.push(line.to_string());
            c.followers.retain(|tx| {
                tx.send(Ok(LogLine {
                    text: line.to_string(),
                    timestamp_ms: now_ms(),
                }))
                .is_ok()
            });
        }
    }

    /// Log streams currently held open by callers.
    pub fn active_log_readers(&self) -> usize {
        self.log_readers.load(Ordering::SeqCst)
    }

    async fn check(&self, point: FailPoint) -> EngineResult<()> {
        let delay = self.lock().delays.get(&point).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.lock().failures.get(&point) {
            Some(message) => Err(EngineError::Engine(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        if let Err(e) = self.check(FailPoint::Pull).await {
            return Err(EngineError::Pull {
                image: image.to_string(),
                reason: e.to_string(),
            });
        }
        let mut inner = self.lock();
        inner.pulls.push(image.to_string());
        inner.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.check(FailPoint::Create).await?;
        let mut inner = self.lock();
        if !inner.images.contains(&spec.image) {
            return Err(EngineError::Engine(format!("no such image: {}", spec.image)));
        }
        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Engine(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let id = format!("mem-{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: RunState::Created,
                cpu: CpuSample {
                    total_usage_ns: 0,
                    system_usage_ns: 0,
                    online_cpus: CORES,
                },
                logs: Vec::new(),
                followers: Vec::new(),
                execs: Vec::new(),
            },
        );
        debug!(%id, name = %spec.name, "memory engine created container");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.check(FailPoint::Start).await?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        c.state = RunState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> EngineResult<()> {
        self.check(FailPoint::Stop).await?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        c.state = RunState::Exited;
        // Followers see the end of the stream when the process exits.
        c.followers.clear();
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.check(FailPoint::Remove).await?;
        let mut inner = self.lock();
        let running = inner
            .containers
            .get(id)
            .map(|c| c.state.is_running())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if running && !force {
            return Err(EngineError::Engine(format!(
                "cannot remove running container {id}"
            )));
        }
        inner.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInfo> {
        let inner = self.lock();
        let c = inner
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(ContainerInfo {
            id: id.to_string(),
            state: c.state,
            exit_code: (c.state == RunState::Exited).then_some(0),
            oom_killed: false,
            error: None,
        })
    }

    async fn find_by_label(&self, key: &str, value: &str) -> EngineResult<Option<ContainerSummary>> {
        Ok(self
            .list_labeled(key)
            .await?
            .into_iter()
            .find(|c| c.workload_id.as_deref() == Some(value)))
    }

    async fn list_labeled(&self, key: &str) -> EngineResult<Vec<ContainerSummary>> {
        self.check(FailPoint::List).await?;
        let inner = self.lock();
        let mut found: Vec<ContainerSummary> = inner
            .containers
            .iter()
            .filter_map(|(id, c)| {
                let value = c.spec.labels.get(key)?;
                Some(ContainerSummary {
                    id: id.clone(),
                    workload_id: Some(value.clone()),
                    state: c.state,
                })
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn stats(&self, id: &str) -> EngineResult<EngineStats> {
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        // Each sample advances one wall second on four cores, half a core busy.
        if c.state.is_running() {
            c.cpu.total_usage_ns += 500_000_000;
        }
        c.cpu.system_usage_ns += u64::from(CORES) * 1_000_000_000;
        let limit = u64::try_from(c.spec.memory_bytes).unwrap_or(0);
        Ok(EngineStats {
            cpu: c.cpu,
            precpu: None,
            memory_usage_bytes: if c.state.is_running() { limit / 2 + 4096 } else { 0 },
            memory_cache_bytes: if c.state.is_running() { 4096 } else { 0 },
            memory_limit_bytes: limit,
            pids: u64::from(c.state.is_running()),
            ..Default::default()
        })
    }

    async fn logs(&self, id: &str, tail: u32) -> EngineResult<LogStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            let c = inner
                .containers
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            let skip = c.logs.len().saturating_sub(tail as usize);
            for line in &c.logs[skip..] {
                let _ = tx.send(Ok(LogLine {
                    text: line.clone(),
                    timestamp_ms: now_ms(),
                }));
            }
            if c.state.is_running() {
                c.followers.push(tx);
            }
        }
        self.log_readers.fetch_add(1, Ordering::SeqCst);
        let guard = ReaderGuard(Arc::clone(&self.log_readers));
        let stream = UnboundedReceiverStream::new(rx).map(move |item| {
            let _held = &guard;
            item
        });
        Ok(stream.boxed())
    }

    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> EngineResult<()> {
        self.check(FailPoint::Exec).await?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !c.state.is_running() {
            return Err(EngineError::Engine(format!("container {id} is not running")));
        }
        c.execs.push(cmd);
        Ok(())
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        Ok(EngineInfo {
            cpu_cores: CORES,
            memory_total_bytes: 16 * 1024 * 1024 * 1024,
        })
    }
}
