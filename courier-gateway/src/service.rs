use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use courier_task::{ShutdownSignal, Task, TaskSet};
use device_store::{DeviceStore as _, DynDeviceStore};
use device_store_libsql::LibSqlDeviceStore;
use tap::prelude::*;

use crate::amqp::ingress::{MarkReadHandler, SendMediaHandler, SendMessageHandler};
use crate::amqp::{EventConsumer, EventPublisher, PublisherReconnectTask};
use crate::classifier::Classifier;
use crate::config::{Conf, UpstreamMode};
use crate::coordinator::Coordinator;
use crate::dispatch::pool::{PoolCleanupTask, PoolHealthTask};
use crate::pairing::PairingCoordinator;
use crate::session::SessionRegistry;
use crate::token::AuthKeys;
use crate::upstream::DynConnector;
use crate::upstream::loopback::LoopbackConnector;

pub const SERVICE_NAME: &str = "courier-gateway";

const INGRESS_PREFETCH: u16 = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state cloned into every router.
#[derive(Clone)]
pub struct GatewayState {
    pub conf: Arc<Conf>,
    pub auth: Arc<AuthKeys>,
    pub registry: Arc<SessionRegistry>,
    pub pairing: Arc<PairingCoordinator>,
    pub coordinator: Arc<Coordinator>,
    pub publisher: Arc<EventPublisher>,
}

/// Boots every long-lived task and runs until Ctrl-C.
pub async fn run(conf: Arc<Conf>) -> anyhow::Result<()> {
    let (tasks, state) = spawn_tasks(conf).await?;
    let (children, shutdown_handle) = tasks.into_parts();

    let monitor = tokio::spawn(async move {
        let mut join_all = futures::future::select_all(children.into_iter().map(|child| Box::pin(child.join())));

        loop {
            let (result, _, rest) = join_all.await;

            match result {
                Ok(Ok(())) => trace!("A task terminated gracefully"),
                Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                Err(error) => error!(%error, "Something went very wrong with a task"),
            }

            if rest.is_empty() {
                break;
            }

            join_all = futures::future::select_all(rest);
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    shutdown_handle.signal();

    tokio::select! {
        () = shutdown_handle.all_closed() => {
            debug!("All tasks closed gracefully");
        }
        () = tokio::time::sleep(SHUTDOWN_GRACE) => {
            warn!("Some tasks didn’t terminate in time");
        }
    }

    monitor.abort();

    state.coordinator.pool().close();
    state.registry.close().await;

    info!("Bye!");

    Ok(())
}

/// Builds the full object graph and registers the long-lived tasks.
pub async fn spawn_tasks(conf: Arc<Conf>) -> anyhow::Result<(TaskSet<anyhow::Result<()>>, GatewayState)> {
    let store = open_store(&conf).await?;
    let connector = build_connector(&conf);

    let auth = AuthKeys::from_conf(&conf).pipe(Arc::new);
    let registry = SessionRegistry::new(Arc::clone(&store), connector);
    let publisher = EventPublisher::new(&conf.amqp_url, &conf.exchange_name);

    let (coordinator, scheduler_task) = Coordinator::new(Arc::clone(&registry), &conf);

    let classifier = Classifier::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&publisher),
        Arc::clone(coordinator.pool()),
    );
    registry.install_event_sink(classifier);

    let pairing = PairingCoordinator::new(Arc::clone(&registry), conf.pairing_timeout);

    let consumer = build_consumer(&conf, &coordinator, Arc::clone(&publisher));

    let state = GatewayState {
        conf: Arc::clone(&conf),
        auth,
        registry,
        pairing,
        coordinator: Arc::clone(&coordinator),
        publisher: Arc::clone(&publisher),
    };

    let listener = tokio::net::TcpListener::bind(conf.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", conf.listen_addr))?;
    info!(addr = %conf.listen_addr, "Control plane listening");

    let mut tasks = TaskSet::new();

    tasks.register(scheduler_task);
    tasks.register(PoolHealthTask {
        pool: Arc::clone(coordinator.pool()),
    });
    tasks.register(PoolCleanupTask {
        pool: Arc::clone(coordinator.pool()),
    });
    tasks.register(PublisherReconnectTask { publisher });
    tasks.register(consumer);
    tasks.register(HttpListenerTask {
        listener,
        state: state.clone(),
    });

    Ok((tasks, state))
}

async fn open_store(conf: &Conf) -> anyhow::Result<DynDeviceStore> {
    let db = device_store_libsql::libsql::Builder::new_local(conf.db_path.as_std_path())
        .build()
        .await
        .with_context(|| format!("failed to open database at {}", conf.db_path))?;

    let connection = db.connect().context("failed to connect to the database")?;

    let store: DynDeviceStore = LibSqlDeviceStore::builder().conn(connection).build().pipe(Arc::new);

    store.setup().await.context("failed to set up the device store")?;

    Ok(store)
}

fn build_connector(conf: &Conf) -> DynConnector {
    match conf.upstream_mode {
        UpstreamMode::Loopback => {
            warn!("Using the loopback upstream driver; pairing completes without a real device");
            LoopbackConnector::new(true)
        }
    }
}

fn build_consumer(conf: &Conf, coordinator: &Coordinator, publisher: Arc<EventPublisher>) -> EventConsumer {
    let mut consumer = EventConsumer::new(&conf.amqp_url, &conf.exchange_name, INGRESS_PREFETCH, publisher);

    let scheduler = coordinator.scheduler().clone();
    let budget = conf.worker.task_timeout;

    consumer.bind("events.send-message", "events.send-message");
    consumer.bind("events.send-media", "events.send-media");
    consumer.bind("events.mark-read", "events.mark-read");

    consumer.register(
        "events.send-message",
        Arc::new(SendMessageHandler::new(scheduler.clone(), budget)),
    );
    consumer.register(
        "events.send-media",
        Arc::new(SendMediaHandler::new(scheduler.clone(), budget)),
    );
    consumer.register("events.mark-read", Arc::new(MarkReadHandler::new(scheduler, budget)));

    consumer
}

struct HttpListenerTask {
    listener: tokio::net::TcpListener,
    state: GatewayState,
}

#[async_trait]
impl Task for HttpListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let router = crate::api::make_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("HTTP server failed")
    }
}
