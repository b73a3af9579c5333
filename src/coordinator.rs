use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use crate::bootstrap::{BootstrapOutcome, Bootstrapper, Reconciler};
use crate::bus::{BusConsumer, BusMessage, ChannelBus};
use crate::config::{CoordinatorConfig, TransportKind, ms};
use crate::dispatch::{BusTransport, DispatchTransport, Dispatcher, QueueTransport};
use crate::error::Result;
use crate::idempotency::IdempotencyGuard;
use crate::lock::DistributedLock;
use crate::node::{NodeIdentity, NodeMonitor, NodeRegistry};
use crate::queue::{ActiveCleanup, TaskQueue};
use crate::store::CoordinationStore;
use crate::worker::{BatchListener, HandlerRegistry, TaskExecutor, WorkerPool};

/// Channel depth of the in-process bus.
const BUS_CAPACITY: usize = 1024;

/// One node, fully wired but not yet running.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<NodeRegistry>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<TaskExecutor>,
    guard: Arc<IdempotencyGuard>,
    bus_rx: Option<mpsc::Receiver<BusMessage>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        handlers: HandlerRegistry,
        listener: Option<Arc<dyn BatchListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let keys = config.key_space();
        let identity = NodeIdentity::resolve(config.node.id.as_deref());
        let lock = DistributedLock::new(store.clone());

        let registry = Arc::new(NodeRegistry::new(store.clone(), keys.clone(), identity.clone(), &config.node));
        let queue = Arc::new(TaskQueue::new(store.clone(), keys.clone(), config.queue.clone()));
        let guard = Arc::new(IdempotencyGuard::new(
            store.clone(),
            keys.clone(),
            ms(config.idempotency.window_ms),
        ));

        let mut executor = TaskExecutor::new(
            queue.clone(),
            lock,
            identity,
            Arc::new(handlers),
            &config.worker,
            &config.lock,
        );
        if let Some(listener) = listener {
            executor = executor.with_listener(listener);
        }

        let (transport, bus_rx) = match config.transport {
            TransportKind::Queue => {
                let transport: Arc<dyn DispatchTransport> = Arc::new(QueueTransport::new(queue.clone()));
                (transport, None)
            }
            TransportKind::Bus => {
                let (bus, rx) = ChannelBus::new(BUS_CAPACITY);
                let transport: Arc<dyn DispatchTransport> =
                    Arc::new(BusTransport::new(Arc::new(bus), queue.clone(), keys.queue_name()));
                (transport, Some(rx))
            }
        };
        let dispatcher = Arc::new(Dispatcher::new(transport, queue.clone()));

        Ok(Self {
            config,
            store,
            registry,
            queue,
            dispatcher,
            executor: Arc::new(executor),
            guard,
            bus_rx,
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    /// Starts heartbeat, monitor, cleanup and the consumer for the configured
    /// transport, then runs the bootstrap if a reconciler was given.
    pub async fn start(mut self, reconciler: Option<Arc<dyn Reconciler>>) -> RunningNode {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let keys = self.config.key_space();

        self.registry.heartbeat_once().await;
        let mut background = vec![self.registry.clone().spawn(shutdown_rx.clone())];

        let monitor = Arc::new(NodeMonitor::new(
            self.store.clone(),
            keys.clone(),
            self.registry.clone(),
            self.queue.clone(),
            ms(self.config.node.monitor_interval_ms),
        ));
        background.push(monitor.spawn(shutdown_rx.clone()));

        let cleanup = Arc::new(ActiveCleanup::new(self.queue.clone(), self.config.cleanup.clone()));
        background.push(cleanup.spawn(self.registry.clone(), shutdown_rx.clone()));

        let pool = match (self.config.transport, self.bus_rx.take()) {
            (TransportKind::Bus, Some(rx)) => {
                let consumer = Arc::new(BusConsumer::new(
                    keys.queue_name(),
                    self.executor.clone(),
                    self.guard.clone(),
                    self.config.worker.max_in_flight,
                ));
                background.push(consumer.spawn(rx, shutdown_rx.clone()));
                None
            }
            _ => Some(WorkerPool::start(self.executor.clone(), &self.config.worker)),
        };

        let bootstrap = match reconciler {
            Some(reconciler) => {
                let bootstrapper = Bootstrapper::new(
                    DistributedLock::new(self.store.clone()),
                    keys,
                    self.registry.identity().clone(),
                    self.config.bootstrap.clone(),
                );
                Some(bootstrapper.run(reconciler).await)
            }
            None => None,
        };

        info!(
            node = %self.registry.identity(),
            transport = self.dispatcher.transport_name(),
            leader = self.registry.is_leader(),
            "Node started"
        );
        RunningNode {
            shutdown_tx,
            background,
            pool,
            registry: self.registry,
            dispatcher: self.dispatcher,
            queue: self.queue,
            bootstrap,
        }
    }
}

/// Handle on a started node.
pub struct RunningNode {
    shutdown_tx: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
    pool: Option<WorkerPool>,
    registry: Arc<NodeRegistry>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<TaskQueue>,
    bootstrap: Option<BootstrapOutcome>,
}

impl RunningNode {
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    pub fn bootstrap_outcome(&self) -> Option<BootstrapOutcome> {
        self.bootstrap
    }

    /// Drains in-flight executions, then stops the background loops. The
    /// heartbeat loop gives up leadership on its way out.
    pub async fn shutdown(self) {
        if let Some(pool) = self.pool {
            pool.shutdown_and_join().await;
        }
        let _ = self.shutdown_tx.send(true);
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!(node = %self.registry.identity(), "Node stopped");
    }
}
