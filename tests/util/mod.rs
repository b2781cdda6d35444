use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ai_engine::config::EngineConfig;
use ai_engine::jobs::{JobEvent, JobScheduler, JobState, JobStatus};
use ai_engine::registry::HandlerRegistry;
use ai_engine::resources::{DirectoryLoader, ResourceLoader, ResourceManager};
use ai_engine::server::{Dispatcher, Outbound};
use crossbeam_channel::Receiver;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Engine config rooted in a temp dir.
#[allow(dead_code)]
pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        max_workers: 2,
        max_budget_bytes: 1_000_000_000,
        cache_dir: root.join("cache"),
        model_dir: root.join("models"),
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub fn engine() -> (Dispatcher, Receiver<Outbound>, TempDir) {
    let tmp = TempDir::new().expect("tempdir");
    let (tx, rx) = crossbeam_channel::unbounded();
    let dispatcher = Dispatcher::from_config(&test_config(tmp.path()), tx).expect("engine");
    (dispatcher, rx, tmp)
}

/// Scheduler with its own registry, events on a plain channel.
#[allow(dead_code)]
pub fn scheduler(
    workers: usize,
    setup: impl FnOnce(&HandlerRegistry),
) -> (JobScheduler, Receiver<JobEvent>, TempDir) {
    let tmp = TempDir::new().expect("tempdir");
    let loader: Arc<dyn ResourceLoader> =
        Arc::new(DirectoryLoader::new(&tmp.path().join("models")).expect("loader"));
    let resources = Arc::new(ResourceManager::with_catalog(
        1_000_000_000,
        loader,
        ai_engine::resources::catalog::default_descriptors(),
    ));
    let registry = Arc::new(HandlerRegistry::new());
    setup(&registry);
    let (tx, rx) = crossbeam_channel::unbounded();
    let scheduler = JobScheduler::new(workers, registry, resources, Arc::new(tx)).expect("scheduler");
    (scheduler, rx, tmp)
}

/// Issue one request and return the serialized response.
#[allow(dead_code)]
pub fn call(dispatcher: &Dispatcher, id: u64, method: &str, params: Value) -> Value {
    let line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string();
    let response = dispatcher.handle_line(&line).expect("response");
    serde_json::to_value(response).expect("serializable response")
}

#[allow(dead_code)]
pub fn wait_for_state(scheduler: &JobScheduler, job_id: &str, want: JobState) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = scheduler.status(job_id).expect("job exists");
        if status.state == want {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} stuck in {:?}, wanted {want:?}",
            status.state
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Collect events for `job_id` until its terminal event arrives.
#[allow(dead_code)]
pub fn events_until_terminal(rx: &Receiver<JobEvent>, job_id: &str) -> Vec<JobEvent> {
    use ai_engine::jobs::EventKind;

    let mut events = Vec::new();
    loop {
        let event = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("terminal event");
        if event.job_id != job_id {
            continue;
        }
        let terminal = event.kind != EventKind::Progress;
        events.push(event);
        if terminal {
            return events;
        }
    }
}
