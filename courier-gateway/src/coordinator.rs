use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::Conf;
use crate::dispatch::pool::WorkerPool;
use crate::dispatch::scheduler::{SchedulerHandle, SchedulerTask, scheduler_channel};
use crate::events::{ClassifiedEvent, EventKind};
use crate::services::ServiceSet;
use crate::session::SessionRegistry;

/// Callback invoked for classified events of a registered kind. Errors are
/// logged and never block sibling handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &ClassifiedEvent) -> anyhow::Result<()>;
}

/// `event_type → [handler]`, shared between the coordinator (writes) and the
/// workers' event loops (reads).
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    pub async fn dispatch(&self, event: &ClassifiedEvent) {
        // Snapshot under the read lock; handler calls must not hold it.
        let matching = self.handlers.read().get(&event.kind).cloned().unwrap_or_default();

        for handler in matching {
            if let Err(error) = handler.handle(event).await {
                warn!(
                    handler = handler.name(),
                    event.kind = %event.kind,
                    user.id = %event.user_id,
                    error = format!("{error:#}"),
                    "Event handler failed"
                );
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// C7: wires the scheduler and pool to the service façades and owns the
/// event-handler registry.
pub struct Coordinator {
    services: Arc<ServiceSet>,
    pool: Arc<WorkerPool>,
    scheduler: SchedulerHandle,
    handlers: Arc<HandlerRegistry>,
}

impl Coordinator {
    /// Builds the dispatch layer. The returned [`SchedulerTask`] must be
    /// registered on the service's task set.
    pub fn new(registry: Arc<SessionRegistry>, conf: &Conf) -> (Arc<Self>, SchedulerTask) {
        let services = ServiceSet::over_registry(registry, conf.worker.task_timeout);
        let handlers = Arc::new(HandlerRegistry::new());
        let pool = WorkerPool::new(Arc::clone(&services), Arc::clone(&handlers), conf.worker, conf.pool);
        let (scheduler, scheduler_task) = scheduler_channel(Arc::clone(&pool));

        let coordinator = Arc::new(Self {
            services,
            pool,
            scheduler,
            handlers,
        });

        (coordinator, scheduler_task)
    }

    pub fn services(&self) -> &Arc<ServiceSet> {
        &self.services
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn register_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.register(kind, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserId;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _event: &ClassifiedEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("synthetic handler failure");
            }

            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_the_others() {
        let registry = HandlerRegistry::new();

        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        registry.register(EventKind::Message, Arc::clone(&failing) as Arc<dyn EventHandler>);
        registry.register(EventKind::Message, Arc::clone(&healthy) as Arc<dyn EventHandler>);

        let event = ClassifiedEvent::new(UserId::from("alice"), EventKind::Message, serde_json::json!({}));
        registry.dispatch(&event).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_without_matching_handlers_is_a_no_op() {
        let registry = HandlerRegistry::new();
        let event = ClassifiedEvent::new(UserId::from("alice"), EventKind::Qr, serde_json::json!({}));
        registry.dispatch(&event).await;
    }
}
