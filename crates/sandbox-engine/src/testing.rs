//! Recording fake of `ContainerRuntime` for unit tests

use crate::error::RuntimeError;
use crate::monitor::{HostLoad, HostProbe};
use crate::runtime::{ContainerRuntime, ImageDetails, RawStats};
use crate::types::{ContainerLaunchConfig, ContainerOutput};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted outcome of one container run
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeRun {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl FakeRun {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }
}

/// Host probe reporting a constant load
pub(crate) struct FixedProbe(pub HostLoad);

impl FixedProbe {
    pub fn idle() -> Arc<dyn HostProbe> {
        Arc::new(FixedProbe(HostLoad::default()))
    }
}

impl HostProbe for FixedProbe {
    fn sample(&self) -> HostLoad {
        self.0
    }
}

type RunHandler = Arc<dyn Fn(&ContainerLaunchConfig) -> FakeRun + Send + Sync>;

struct FakeContainer {
    config: ContainerLaunchConfig,
    run: FakeRun,
    stopped: Arc<Notify>,
    was_stopped: bool,
}

#[derive(Default)]
struct Inner {
    operations: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    created: Mutex<Vec<ContainerLaunchConfig>>,
    images: Mutex<HashMap<String, ImageDetails>>,
    in_use: Mutex<HashSet<String>>,
    stats: Mutex<RawStats>,
    handler: Mutex<Option<RunHandler>>,
    wait_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
    build_delay: Mutex<Option<Duration>>,
    dockerfiles: Mutex<Vec<String>>,
    fail_builds: AtomicBool,
    builds: AtomicUsize,
    next_id: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingRuntime {
    inner: Arc<Inner>,
}

impl RecordingRuntime {
    pub fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().clone()
    }

    pub fn created_configs(&self) -> Vec<ContainerLaunchConfig> {
        self.inner.created.lock().clone()
    }

    pub fn builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    pub fn set_handler(
        &self,
        handler: impl Fn(&ContainerLaunchConfig) -> FakeRun + Send + Sync + 'static,
    ) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Containers run this long unless stopped first
    pub fn set_wait_delay(&self, delay: Duration) {
        *self.inner.wait_delay.lock() = Some(delay);
    }

    /// `create_container` takes this long before the container exists
    pub fn set_create_delay(&self, delay: Duration) {
        *self.inner.create_delay.lock() = Some(delay);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.inner.build_delay.lock() = Some(delay);
    }

    /// Dockerfiles passed to `build_image`, in order
    pub fn dockerfiles(&self) -> Vec<String> {
        self.inner.dockerfiles.lock().clone()
    }

    pub fn set_stats(&self, stats: RawStats) {
        *self.inner.stats.lock() = stats;
    }

    pub fn fail_builds(&self) {
        self.inner.fail_builds.store(true, Ordering::SeqCst);
    }

    pub fn add_image(&self, reference: &str, details: ImageDetails) {
        self.inner
            .images
            .lock()
            .insert(reference.to_string(), details);
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.inner.images.lock().contains_key(reference)
    }

    pub fn mark_in_use(&self, reference: &str) {
        self.inner.in_use.lock().insert(reference.to_string());
    }

    pub fn was_stopped(&self, container_id: &str) -> bool {
        self.inner
            .containers
            .lock()
            .get(container_id)
            .map(|c| c.was_stopped)
            .unwrap_or(false)
    }

    fn record(&self, op: String) {
        self.inner.operations.lock().push(op);
    }
}

pub(crate) fn image_details(id: &str, age: chrono::Duration) -> ImageDetails {
    ImageDetails {
        id: id.to_string(),
        size: 42 * 1024 * 1024,
        created: chrono::Utc::now() - age,
        layers: vec![format!("sha256:{}-layer", id)],
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn create_container(
        &self,
        config: &ContainerLaunchConfig,
    ) -> Result<String, RuntimeError> {
        let delay = *self.inner.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let id = format!("ctr-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(format!("create:{}:{}", id, config.image));

        let handler = self.inner.handler.lock().clone();
        let run = handler.map(|h| h(config)).unwrap_or_default();

        self.inner.created.lock().push(config.clone());
        self.inner.containers.lock().insert(
            id.clone(),
            FakeContainer {
                config: config.clone(),
                run,
                stopped: Arc::new(Notify::new()),
                was_stopped: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start:{}", container_id));
        if self.inner.containers.lock().contains_key(container_id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(container_id.to_string()))
        }
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, RuntimeError> {
        self.record(format!("wait:{}", container_id));
        let (run, stopped) = {
            let containers = self.inner.containers.lock();
            let c = containers
                .get(container_id)
                .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
            (c.run.clone(), c.stopped.clone())
        };

        let delay = *self.inner.wait_delay.lock();
        match delay {
            None => Ok(run.exit_code),
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(run.exit_code),
                    _ = stopped.notified() => Ok(137),
                }
            }
        }
    }

    async fn container_logs(&self, container_id: &str) -> Result<ContainerOutput, RuntimeError> {
        self.record(format!("logs:{}", container_id));
        let containers = self.inner.containers.lock();
        let c = containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(ContainerOutput {
            stdout: c.run.stdout.clone(),
            stderr: c.run.stderr.clone(),
        })
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _grace: Duration,
    ) -> Result<(), RuntimeError> {
        self.record(format!("stop:{}", container_id));
        if let Some(c) = self.inner.containers.lock().get_mut(container_id) {
            c.was_stopped = true;
            c.stopped.notify_one();
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove:{}", container_id));
        // Keep the record so tests can still ask whether it was stopped
        if let Some(c) = self.inner.containers.lock().get_mut(container_id) {
            c.config.labels.insert("removed".to_string(), "true".to_string());
        }
        Ok(())
    }

    async fn container_stats(&self, container_id: &str) -> Result<Option<RawStats>, RuntimeError> {
        let containers = self.inner.containers.lock();
        match containers.get(container_id) {
            Some(c) if !c.config.labels.contains_key("removed") => {
                Ok(Some(self.inner.stats.lock().clone()))
            }
            _ => Ok(None),
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageDetails>, RuntimeError> {
        Ok(self.inner.images.lock().get(reference).cloned())
    }

    async fn build_image(&self, tag: &str, dockerfile: &str) -> Result<ImageDetails, RuntimeError> {
        self.record(format!("build:{}", tag));
        self.inner.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.dockerfiles.lock().push(dockerfile.to_string());
        let delay = *self.inner.build_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_builds.load(Ordering::SeqCst) {
            return Err(RuntimeError::Build("scripted build failure".to_string()));
        }
        assert!(dockerfile.starts_with("FROM "), "dockerfile must start with FROM");
        let id = format!("sha256:{}", tag.replace(':', "-"));
        let details = image_details(&id, chrono::Duration::zero());
        self.inner
            .images
            .lock()
            .insert(tag.to_string(), details.clone());
        Ok(details)
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.record(format!("rmi:{}", reference));
        self.inner.images.lock().remove(reference);
        Ok(())
    }

    async fn images_in_use(&self) -> Result<HashSet<String>, RuntimeError> {
        Ok(self.inner.in_use.lock().clone())
    }
}
