//! Shared fixtures for the integration tests.
//!
//! Provides recording fakes for the coordinator's collaborators, a
//! fully wired coordinator fixture with a manual clock, the graph
//! shapes the scheduling tests exercise, and wait helpers.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use swarmbuild::build_id::BuildId;
use swarmbuild::cache::{ArtifactUploader, StaticCacheOracle};
use swarmbuild::config::CoordinatorConfig;
use swarmbuild::coordinator::Coordinator;
use swarmbuild::error::{Result, SwarmError};
use swarmbuild::events::{BuildRulePublisher, EventManager, ManualClock};
use swarmbuild::executor::{BuildExecutor, ExecutionOutcome};
use swarmbuild::graph::{DependencyGraph, Target, TargetNode};
use swarmbuild::race::RemoteBuildNotifier;
use swarmbuild::scheduler::build_work_queue;

pub fn target(name: &str) -> Target {
    Target::from(name)
}

pub fn targets(names: &[&str]) -> Vec<Target> {
    names.iter().map(|n| Target::from(*n)).collect()
}

/// Coordinator config with short timeouts for faster tests.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        heartbeat_timeout_ms: 200,
        dead_minion_check_interval_ms: 20,
        event_flush_interval_ms: 20,
        event_publish_margin_ms: 100,
        ..CoordinatorConfig::default()
    }
}

// =============================================================================
// Graph shapes
// =============================================================================

/// root -> {left, right} -> leaf
pub fn diamond_graph() -> DependencyGraph {
    DependencyGraph::new(
        vec![
            TargetNode::new("//:root").with_deps(["//:left", "//:right"]),
            TargetNode::new("//:left").with_deps(["//:leaf"]),
            TargetNode::new("//:right").with_deps(["//:leaf"]),
            TargetNode::new("//:leaf"),
        ],
        targets(&["//:root"]),
    )
    .unwrap()
}

/// root -> {left, right} -> chain_top -> leaf
pub fn diamond_with_chain_graph() -> DependencyGraph {
    DependencyGraph::new(
        vec![
            TargetNode::new("//:root").with_deps(["//:left", "//:right"]),
            TargetNode::new("//:left").with_deps(["//:chain_top"]),
            TargetNode::new("//:right").with_deps(["//:chain_top"]),
            TargetNode::new("//:chain_top").with_deps(["//:leaf"]),
            TargetNode::new("//:leaf"),
        ],
        targets(&["//:root"]),
    )
    .unwrap()
}

/// Diamond over leaf where the sides also carry runtime deps:
/// right has an uncacheable runtime dep, left has an uncacheable
/// runtime dep plus a cacheable one.
pub fn runtime_deps_graph() -> DependencyGraph {
    DependencyGraph::new(
        vec![
            TargetNode::new("//:root").with_deps(["//:left", "//:right"]),
            TargetNode::new("//:right")
                .with_deps(["//:leaf"])
                .with_runtime_deps(["//:uncacheable_a"]),
            TargetNode::new("//:left")
                .with_deps(["//:leaf"])
                .with_runtime_deps(["//:uncacheable_b", "//:cacheable_c"]),
            TargetNode::new("//:leaf"),
            TargetNode::new("//:uncacheable_a").uncacheable(),
            TargetNode::new("//:uncacheable_b").uncacheable(),
            TargetNode::new("//:cacheable_c"),
        ],
        targets(&["//:root"]),
    )
    .unwrap()
}

/// a -> b -> c -> d
pub fn linear_chain_graph() -> DependencyGraph {
    DependencyGraph::new(
        vec![
            TargetNode::new("//:a").with_deps(["//:b"]),
            TargetNode::new("//:b").with_deps(["//:c"]),
            TargetNode::new("//:c").with_deps(["//:d"]),
            TargetNode::new("//:d"),
        ],
        targets(&["//:a"]),
    )
    .unwrap()
}

// =============================================================================
// Recording fakes
// =============================================================================

/// Publisher remembering every batch it was handed, in order.
#[derive(Default)]
pub struct RecordingPublisher {
    started: Mutex<Vec<Vec<Target>>>,
    finished: Mutex<Vec<Vec<Target>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_batches(&self) -> Vec<Vec<Target>> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished_batches(&self) -> Vec<Vec<Target>> {
        self.finished.lock().unwrap().clone()
    }

    pub fn finished_flat(&self) -> Vec<Target> {
        self.finished.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn started_flat(&self) -> Vec<Target> {
        self.started.lock().unwrap().iter().flatten().cloned().collect()
    }
}

impl BuildRulePublisher for RecordingPublisher {
    fn targets_started(&self, targets: &[Target]) -> Result<()> {
        self.started.lock().unwrap().push(targets.to_vec());
        Ok(())
    }

    fn targets_finished(&self, targets: &[Target]) -> Result<()> {
        self.finished.lock().unwrap().push(targets.to_vec());
        Ok(())
    }
}

/// Publisher whose finished-batch path always fails, for the
/// at-most-once delivery tests.
#[derive(Default)]
pub struct FailingPublisher {
    finished_attempts: AtomicUsize,
}

impl FailingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_attempts(&self) -> usize {
        self.finished_attempts.load(Ordering::SeqCst)
    }
}

impl BuildRulePublisher for FailingPublisher {
    fn targets_started(&self, _targets: &[Target]) -> Result<()> {
        Ok(())
    }

    fn targets_finished(&self, _targets: &[Target]) -> Result<()> {
        self.finished_attempts.fetch_add(1, Ordering::SeqCst);
        Err(SwarmError::Publish("injected publish failure".to_string()))
    }
}

/// Uploader remembering which artifacts it was asked to push.
#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<Target>>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded(&self) -> Vec<Target> {
        self.uploads.lock().unwrap().clone()
    }
}

impl ArtifactUploader for RecordingUploader {
    fn upload_critical_artifacts(&self, targets: &[Target]) -> Result<()> {
        self.uploads.lock().unwrap().extend(targets.iter().cloned());
        Ok(())
    }
}

/// Notifier counting each signal and remembering the per-rule ones.
#[derive(Default)]
pub struct CountingNotifier {
    started: Mutex<Vec<Target>>,
    completed: Mutex<Vec<Target>>,
    most_rules: AtomicUsize,
    build_completed: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_targets(&self) -> Vec<Target> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed_targets(&self) -> Vec<Target> {
        self.completed.lock().unwrap().clone()
    }

    pub fn most_rules_count(&self) -> usize {
        self.most_rules.load(Ordering::SeqCst)
    }

    pub fn build_completed_count(&self) -> usize {
        self.build_completed.load(Ordering::SeqCst)
    }
}

impl RemoteBuildNotifier for CountingNotifier {
    fn signal_rule_started(&self, target: &Target) {
        self.started.lock().unwrap().push(target.clone());
    }

    fn signal_rule_completed(&self, target: &Target) {
        self.completed.lock().unwrap().push(target.clone());
    }

    fn signal_most_rules_finished(&self) {
        self.most_rules.fetch_add(1, Ordering::SeqCst);
    }

    fn signal_remote_build_completed(&self) {
        self.build_completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Executor recording the order targets were built in, with optional
/// scripted failures.
#[derive(Default)]
pub struct ScriptedExecutor {
    built: Mutex<Vec<Target>>,
    fail_targets: Mutex<Vec<Target>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_on(self, name: &str) -> Self {
        self.fail_targets.lock().unwrap().push(target(name));
        self
    }

    pub fn built(&self) -> Vec<Target> {
        self.built.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn build_target(&self, target: &Target) -> Result<ExecutionOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.built.lock().unwrap().push(target.clone());
        let success = !self.fail_targets.lock().unwrap().contains(target);
        Ok(ExecutionOutcome {
            target: target.clone(),
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            output: None,
            error: None,
        })
    }
}

// =============================================================================
// Wired coordinator fixture
// =============================================================================

/// A coordinator with recording collaborators and a manual clock.
pub struct TestBuild {
    pub graph: Arc<DependencyGraph>,
    pub coordinator: Arc<Coordinator>,
    pub events: Arc<EventManager>,
    pub clock: Arc<ManualClock>,
    pub publisher: Arc<RecordingPublisher>,
    pub uploader: Arc<RecordingUploader>,
    pub notifier: Arc<CountingNotifier>,
    config: CoordinatorConfig,
}

impl TestBuild {
    pub fn new(graph: DependencyGraph) -> Self {
        Self::with_config(graph, test_config())
    }

    pub fn with_config(graph: DependencyGraph, config: CoordinatorConfig) -> Self {
        let graph = Arc::new(graph);
        let clock = Arc::new(ManualClock::new(1_000));
        let publisher = Arc::new(RecordingPublisher::new());
        let events = Arc::new(EventManager::new(
            clock.clone(),
            publisher.clone(),
            config.event_publish_margin_ms,
        ));
        let uploader = Arc::new(RecordingUploader::new());
        let notifier = Arc::new(CountingNotifier::new());
        let coordinator = Arc::new(Coordinator::new(
            BuildId::generate(),
            config.clone(),
            graph.clone(),
            events.clone(),
            notifier.clone(),
        ));
        Self {
            graph,
            coordinator,
            events,
            clock,
            publisher,
            uploader,
            notifier,
            config,
        }
    }

    /// Build the work queue against fixed cache hits and go live,
    /// synchronously; pruned-target events go through the event
    /// manager like in production.
    pub fn prepare(&self, remote_hits: &[&str], local_hits: &[&str]) {
        let oracle = StaticCacheOracle::new(targets(remote_hits), targets(local_hits));
        let queue = build_work_queue(
            &self.graph,
            &oracle,
            self.events.as_ref(),
            self.uploader.as_ref(),
        )
        .expect("queue construction failed");
        self.coordinator.install_queue(queue);
    }

    /// Age every pending finished event past the margin and flush.
    pub fn flush_aged(&self) {
        self.clock
            .advance(self.config.event_publish_margin_ms as i64 + 1);
        self.events.flush_synchronized();
    }
}

// =============================================================================
// Wait helpers
// =============================================================================

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}

/// Token that cancels itself when dropped, so failed tests do not leak
/// spawned loops.
pub struct DropToken(pub CancellationToken);

impl DropToken {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn token(&self) -> CancellationToken {
        self.0.clone()
    }
}

impl Default for DropToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DropToken {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
