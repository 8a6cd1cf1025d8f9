//! Subscriber registry and runtime lifecycle.
//!
//! A [`Runtime`] is the explicit value threaded through the whole library:
//! streams and subscribers are declared against it, `start` validates the
//! topology, reconciles it with the broker, and brings up the consumer
//! workers and background sweeps, and `stop` broadcasts cancellation and
//! waits for drains. Configuration and registrations are frozen once
//! started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::{ConsumerConfig, RuntimeConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consumer::ConsumerWorker;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::inbox::{InboxMiddleware, InboxSweeper};
use crate::middleware::Middleware;
use crate::outbox::{JetStreamOutboxPublisher, OutboxWorker};
use crate::publisher::Publisher;
use crate::repository::{InboxRepository, InboxStatus, OutboxRepository, OutboxStatus};
use crate::retry::{Classifier, RetryEngine};
use crate::subject;
use crate::topology::{
    validate_no_overlap, ConsumerSpec, DeliverPolicy, ReplayPolicy, StreamSpec, TopologyManager,
};

/// Declarative subscriber binding: topics on a stream, a handler, and the
/// middlewares wrapped around it.
pub struct SubscriberSpec {
    /// Subscriber identity; the durable consumer name derives from it.
    pub name: String,
    /// Stream the binding consumes from.
    pub stream: String,
    /// Topic patterns relative to `{env}.{app}`.
    pub topics: Vec<String>,
    pub handler: Arc<dyn Handler>,
    /// Subscriber-local middlewares, run after the global ones.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// Overrides of the runtime-level consumer defaults.
    pub config: Option<ConsumerConfig>,
}

impl SubscriberSpec {
    pub fn new(
        name: impl Into<String>,
        stream: impl Into<String>,
        topics: Vec<String>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            stream: stream.into(),
            topics,
            handler,
            middlewares: Vec::new(),
            config: None,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Aggregated health view over connection, topology, subscribers, and the
/// outbox/inbox stores.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub connection: ConnectionState,
    pub topology_ready: bool,
    pub subscribers: Vec<SubscriberHealth>,
    pub outbox_depth: Option<HashMap<OutboxStatus, i64>>,
    /// Age of the oldest undrained outbox row; a growing value means the
    /// worker is not keeping up.
    pub outbox_oldest_pending: Option<std::time::Duration>,
    pub inbox_depth: Option<HashMap<InboxStatus, i64>>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.connection == ConnectionState::Connected && self.topology_ready
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberHealth {
    pub name: String,
    pub in_flight: usize,
    pub concurrency_limit: usize,
}

struct SubscriberGauge {
    name: String,
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// The process-wide messaging runtime.
pub struct Runtime {
    config: RuntimeConfig,
    connection: Arc<ConnectionManager>,
    streams: Vec<StreamSpec>,
    global_middlewares: Vec<Arc<dyn Middleware>>,
    subscribers: Vec<SubscriberSpec>,
    outbox_repository: Option<Arc<dyn OutboxRepository>>,
    inbox_repository: Option<Arc<dyn InboxRepository>>,
    classifier: Option<Arc<Classifier>>,
    outbox_notify: Arc<Notify>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    gauges: Mutex<Vec<SubscriberGauge>>,
    started: AtomicBool,
    topology_ready: AtomicBool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let connection = Arc::new(ConnectionManager::new(config.connection.clone()));
        Self {
            config,
            connection,
            streams: Vec::new(),
            global_middlewares: Vec::new(),
            subscribers: Vec::new(),
            outbox_repository: None,
            inbox_repository: None,
            classifier: None,
            outbox_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            gauges: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            topology_ready: AtomicBool::new(false),
        }
    }

    /// Install the outbox store; required when outbox mode is on.
    pub fn with_outbox_repository(mut self, repository: Arc<dyn OutboxRepository>) -> Self {
        self.outbox_repository = Some(repository);
        self
    }

    /// Install the inbox store; required when the inbox is on.
    pub fn with_inbox_repository(mut self, repository: Arc<dyn InboxRepository>) -> Self {
        self.inbox_repository = Some(repository);
        self
    }

    /// Replace the default failure-classification heuristics.
    pub fn with_error_classifier(
        mut self,
        classifier: impl Fn(&anyhow::Error) -> crate::retry::ErrorClass + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Declare a stream with full control over its spec. Subject patterns
    /// are expected to be full subjects; see [`Runtime::stream_for_topics`].
    pub fn declare_stream(&mut self, spec: StreamSpec) {
        self.streams.push(spec);
    }

    /// Build a stream spec whose subjects are topics composed under this
    /// runtime's `{env}.{app}` identity.
    pub fn stream_for_topics(&self, name: impl Into<String>, topics: &[&str]) -> Result<StreamSpec> {
        let subjects = topics
            .iter()
            .map(|t| subject::compose(&self.config.env, &self.config.app_name, t))
            .collect::<Result<Vec<_>>>()?;
        Ok(StreamSpec::new(name, subjects))
    }

    /// Register a middleware wrapped around every subscriber, outside the
    /// subscriber-local ones.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.global_middlewares.push(middleware);
    }

    /// Register a subscriber binding. Takes effect at `start`.
    pub fn subscribe(&mut self, spec: SubscriberSpec) {
        self.subscribers.push(spec);
    }

    /// A publisher bound to this runtime's identity, connection, and outbox.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.config.env.clone(),
            self.config.app_name.clone(),
            self.config.publisher.clone(),
            self.connection.clone(),
            self.outbox_repository.clone(),
            self.outbox_notify.clone(),
        )
    }

    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.clone()
    }

    /// Validate the topology, connect, reconcile streams and consumers, and
    /// start every worker.
    ///
    /// Fatal errors (invalid identity, overlapping subjects, missing
    /// repositories, incompatible topology) surface here before any
    /// consumer begins consuming.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("runtime already started".into()));
        }
        self.config.validate_identity()?;
        if self.config.publisher.use_outbox && self.outbox_repository.is_none() {
            return Err(Error::Config("outbox mode is on but no outbox repository is set".into()));
        }
        if self.config.inbox.use_inbox && self.inbox_repository.is_none() {
            return Err(Error::Config("inbox is on but no inbox repository is set".into()));
        }

        let plans = self.compose_bindings()?;
        let stream_specs = self.effective_streams(&plans);

        // Overlap violations abort startup before anything touches the
        // broker.
        let mut groups: Vec<(String, Vec<String>)> = stream_specs
            .iter()
            .map(|s| (s.name.clone(), s.subject_patterns.clone()))
            .collect();
        groups.extend(
            plans
                .iter()
                .map(|p| (p.stream.clone(), p.subjects.clone())),
        );
        validate_no_overlap(&groups)?;

        self.connection.connect().await?;

        let topology = TopologyManager::new(self.connection.clone());
        for spec in &stream_specs {
            topology.ensure_stream(spec).await?;
        }
        self.topology_ready.store(true, Ordering::SeqCst);

        for plan in plans {
            let consumer = topology.ensure_consumer(&plan.stream, &plan.consumer_spec).await?;
            self.spawn_worker(plan, consumer).await;
        }

        if self.config.publisher.use_outbox {
            if let Some(repository) = &self.outbox_repository {
                self.spawn_outbox(repository.clone());
            }
        }
        if self.config.inbox.use_inbox {
            if let Some(repository) = &self.inbox_repository {
                self.spawn_inbox_sweeper(repository.clone());
            }
        }

        info!(
            env = %self.config.env,
            app = %self.config.app_name,
            subscribers = self.subscribers.len(),
            outbox = self.config.publisher.use_outbox,
            inbox = self.config.inbox.use_inbox,
            "runtime started"
        );
        Ok(())
    }

    /// Broadcast cancellation, wait for workers to drain, and close the
    /// connection.
    pub async fn stop(&self) -> Result<()> {
        info!("runtime stopping");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.connection.close().await?;
        info!("runtime stopped");
        Ok(())
    }

    /// Current health across connection, topology, subscribers, and stores.
    pub async fn health(&self) -> HealthReport {
        let subscribers = self
            .gauges
            .lock()
            .await
            .iter()
            .map(|g| SubscriberHealth {
                name: g.name.clone(),
                in_flight: g.limit - g.semaphore.available_permits(),
                concurrency_limit: g.limit,
            })
            .collect();

        let (outbox_depth, outbox_oldest_pending) = match &self.outbox_repository {
            Some(repo) => (
                repo.count_by_status().await.ok(),
                repo.oldest_pending_age().await.ok().flatten(),
            ),
            None => (None, None),
        };
        let inbox_depth = match &self.inbox_repository {
            Some(repo) => repo.count_by_status().await.ok(),
            None => None,
        };

        HealthReport {
            connection: self.connection.state(),
            topology_ready: self.topology_ready.load(Ordering::SeqCst),
            subscribers,
            outbox_depth,
            outbox_oldest_pending,
            inbox_depth,
        }
    }

    fn compose_bindings(&self) -> Result<Vec<BindingPlan>> {
        let prefix = subject::prefix_of(&self.config.env, &self.config.app_name);
        let mut plans = Vec::with_capacity(self.subscribers.len());

        for (index, spec) in self.subscribers.iter().enumerate() {
            subject::validate_name(&spec.name)
                .map_err(|e| Error::Config(format!("invalid subscriber name '{}': {e}", spec.name)))?;
            if spec.topics.is_empty() {
                return Err(Error::Config(format!(
                    "subscriber '{}' binds no topics",
                    spec.name
                )));
            }
            let subjects = spec
                .topics
                .iter()
                .map(|t| subject::compose(&self.config.env, &self.config.app_name, t))
                .collect::<Result<Vec<_>>>()?;

            let consumer = spec.config.clone().unwrap_or_else(|| self.config.consumer.clone());
            let consumer_spec = ConsumerSpec {
                durable_name: format!("{prefix}-{}", spec.name),
                filter_subjects: subjects.clone(),
                deliver_policy: DeliverPolicy::All,
                ack_wait: consumer.ack_wait,
                max_deliver: consumer.max_deliver,
                max_ack_pending: (consumer.concurrency_limit.max(consumer.batch_size) * 2) as i64,
                replay_policy: ReplayPolicy::Instant,
                backoff_schedule: consumer.backoff_schedule.clone(),
            };

            plans.push(BindingPlan {
                index,
                stream: spec.stream.clone(),
                subjects,
                consumer_spec,
                config: consumer,
            });
        }
        Ok(plans)
    }

    /// Declared streams, plus a synthesized spec for any stream a binding
    /// references without declaring.
    fn effective_streams(&self, plans: &[BindingPlan]) -> Vec<StreamSpec> {
        let mut streams = self.streams.clone();
        for plan in plans {
            if streams.iter().any(|s| s.name == plan.stream) {
                continue;
            }
            let subjects: Vec<String> = plans
                .iter()
                .filter(|p| p.stream == plan.stream)
                .flat_map(|p| p.subjects.iter().cloned())
                .collect();
            streams.push(StreamSpec::new(plan.stream.clone(), subjects));
        }
        streams
    }

    async fn spawn_worker(&self, plan: BindingPlan, consumer: crate::consumer::PullConsumer) {
        let spec = &self.subscribers[plan.index];

        let mut chain = self.global_middlewares.clone();
        chain.extend(spec.middlewares.iter().cloned());
        if self.config.inbox.use_inbox {
            if let Some(repo) = &self.inbox_repository {
                chain.push(Arc::new(InboxMiddleware::new(repo.clone())));
            }
        }

        let mut retry = RetryEngine::new(plan.config.backoff_schedule.clone(), plan.config.max_deliver);
        if let Some(classifier) = &self.classifier {
            retry.classifier = classifier.clone();
        }

        let semaphore = Arc::new(Semaphore::new(plan.config.concurrency_limit));
        self.gauges.lock().await.push(SubscriberGauge {
            name: spec.name.clone(),
            semaphore: semaphore.clone(),
            limit: plan.config.concurrency_limit,
        });

        let worker = Arc::new(ConsumerWorker {
            name: spec.name.clone(),
            consumer,
            chain,
            handler: spec.handler.clone(),
            config: plan.config,
            retry,
            dlq_subject: self.config.dlq_subject(),
            inbox: if self.config.inbox.use_inbox {
                self.inbox_repository.clone()
            } else {
                None
            },
            semaphore,
            connection: self.connection.clone(),
        });

        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move { worker.run(cancel).await });
    }

    fn spawn_outbox(&self, repository: Arc<dyn OutboxRepository>) {
        let publisher = Arc::new(JetStreamOutboxPublisher::new(
            self.connection.clone(),
            self.config.publisher.publish_timeout,
        ));
        let worker = Arc::new(OutboxWorker::new(
            repository,
            publisher,
            self.config.outbox.clone(),
            self.outbox_notify.clone(),
        ));

        let drain = worker.clone();
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move { drain.run(cancel).await });

        let sweeper = worker;
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move { sweeper.run_sweeper(cancel).await });
    }

    fn spawn_inbox_sweeper(&self, repository: Arc<dyn InboxRepository>) {
        let sweeper = InboxSweeper::new(repository, self.config.inbox.clone());
        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move { sweeper.run(cancel).await });
    }
}

struct BindingPlan {
    index: usize,
    stream: String,
    subjects: Vec<String>,
    consumer_spec: ConsumerSpec,
    config: ConsumerConfig,
}
