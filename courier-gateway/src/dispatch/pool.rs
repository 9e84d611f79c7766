use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_task::{ShutdownSignal, Task as ServiceTask};
use parking_lot::RwLock;
use serde::Serialize;
use tap::Pipe as _;
use time::OffsetDateTime;

use crate::UserId;
use crate::config::{PoolConf, WorkerConf};
use crate::coordinator::HandlerRegistry;
use crate::error::GatewayError;
use crate::events::ClassifiedEvent;
use crate::services::ServiceSet;

use super::worker::{Worker, WorkerMetrics, WorkerStatus};

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub active_workers: usize,
    pub total_workers: usize,
    pub pending_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub start_time: i64,
}

/// C6: owns the workers, keyed by tenant.
pub struct WorkerPool {
    workers: RwLock<HashMap<UserId, Arc<Worker>>>,
    services: Arc<ServiceSet>,
    handlers: Arc<HandlerRegistry>,
    worker_conf: WorkerConf,
    pool_conf: PoolConf,
    start_time: OffsetDateTime,
}

impl WorkerPool {
    pub fn new(
        services: Arc<ServiceSet>,
        handlers: Arc<HandlerRegistry>,
        worker_conf: WorkerConf,
        pool_conf: PoolConf,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            services,
            handlers,
            worker_conf,
            pool_conf,
            start_time: OffsetDateTime::now_utc(),
        })
    }

    pub fn get(&self, user_id: &UserId) -> Option<Arc<Worker>> {
        self.workers.read().get(user_id).cloned()
    }

    /// Idempotent: a running worker is returned as-is, a stopped one is
    /// replaced. Fails with `PoolFull` at the global cap.
    pub fn get_or_create(&self, user_id: &UserId) -> Result<Arc<Worker>, GatewayError> {
        if let Some(worker) = self.get(user_id) {
            if worker.is_running() {
                return Ok(worker);
            }
        }

        let mut workers = self.workers.write();

        if let Some(worker) = workers.get(user_id) {
            if worker.is_running() {
                return Ok(Arc::clone(worker));
            }

            worker.stop();
            workers.remove(user_id);
        }

        if workers.len() >= self.pool_conf.global_worker_cap() {
            return Err(GatewayError::PoolFull);
        }

        let worker = Worker::spawn(
            user_id.clone(),
            Arc::clone(&self.services),
            Arc::clone(&self.handlers),
            self.worker_conf,
        );

        workers.insert(user_id.clone(), Arc::clone(&worker));
        info!(user.id = %user_id, total = workers.len(), "Worker created");

        Ok(worker)
    }

    pub fn remove(&self, user_id: &UserId) -> bool {
        let Some(worker) = self.workers.write().remove(user_id) else {
            return false;
        };

        worker.stop();
        info!(user.id = %user_id, "Worker removed");

        true
    }

    /// Best-effort event delivery to the tenant's worker. Tenants without a
    /// worker have nobody listening; the event bus stays the durable path.
    pub fn send_event(&self, event: ClassifiedEvent) {
        match self.get(&event.user_id) {
            Some(worker) => worker.send_event(event),
            None => {
                debug!(user.id = %event.user_id, event.kind = %event.kind, "No worker for tenant; event not fanned out");
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let workers = self.workers.read();

        let mut active = 0;
        let mut pending = 0;
        let mut completed = 0;
        let mut failed = 0;

        for worker in workers.values() {
            if worker.is_running() {
                active += 1;
            }

            let metrics = worker.metrics();
            pending += metrics.queued_tasks;
            completed += metrics.successful;
            failed += metrics.failed;
        }

        PoolMetrics {
            active_workers: active,
            total_workers: workers.len(),
            pending_tasks: pending,
            completed,
            failed,
            start_time: self.start_time.unix_timestamp(),
        }
    }

    pub fn worker_metrics(&self) -> Vec<(UserId, WorkerMetrics)> {
        self.workers
            .read()
            .iter()
            .map(|(user_id, worker)| (user_id.clone(), worker.metrics()))
            .collect()
    }

    /// Evicts workers whose loops are no longer running.
    fn health_sweep(&self) {
        let mut workers = self.workers.write();
        let before = workers.len();

        workers.retain(|user_id, worker| {
            let running = worker.is_running();

            if !running {
                warn!(user.id = %user_id, "Evicting dead worker");
            }

            running
        });

        let evicted = before - workers.len();

        if evicted > 0 {
            info!(evicted, "Health check evicted workers");
        }
    }

    /// Evicts idle workers that have not dispatched a task within the idle
    /// timeout. The next task submission transparently re-creates them.
    fn idle_sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let idle_timeout = self.worker_conf.idle_timeout;

        let stale: Vec<UserId> = {
            let workers = self.workers.read();

            workers
                .iter()
                .filter(|(_, worker)| {
                    if worker.status() != WorkerStatus::Idle {
                        return false;
                    }

                    let metrics = worker.metrics();
                    let reference = metrics
                        .last_task_time
                        .unwrap_or(metrics.start_time)
                        .pipe(OffsetDateTime::from_unix_timestamp)
                        .unwrap_or(now);

                    now - reference > idle_timeout
                })
                .map(|(user_id, _)| user_id.clone())
                .collect()
        };

        for user_id in stale {
            if self.remove(&user_id) {
                info!(user.id = %user_id, "Idle worker evicted");
            }
        }
    }

    /// Stops every worker and empties the pool.
    pub fn close(&self) {
        let workers: Vec<_> = {
            let mut map = self.workers.write();
            map.drain().map(|(_, worker)| worker).collect()
        };

        for worker in &workers {
            worker.stop();
        }

        info!(stopped = workers.len(), "Worker pool closed");
    }
}

/// Periodic `!running` eviction.
pub struct PoolHealthTask {
    pub pool: Arc<WorkerPool>,
}

#[async_trait]
impl ServiceTask for PoolHealthTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "pool health check";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(self.pool.pool_conf.healthcheck_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.pool.health_sweep(),
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

/// Periodic idle-GC.
pub struct PoolCleanupTask {
    pub pool: Arc<WorkerPool>,
}

#[async_trait]
impl ServiceTask for PoolCleanupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "pool cleaner";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(self.pool.pool_conf.cleanup_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => self.pool.idle_sweep(),
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::upstream::loopback::LoopbackConnector;

    use std::time::Duration;

    use async_trait::async_trait;
    use device_store::{DeviceMapping, DeviceStore, StoreError};

    struct NullStore;

    #[async_trait]
    impl DeviceStore for NullStore {
        async fn setup(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn save_mapping(&self, _user_id: &str, _device_jid: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_mapping(&self, _user_id: &str) -> Result<Option<DeviceMapping>, StoreError> {
            Ok(None)
        }

        async fn delete_mapping(&self, _user_id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_mappings(&self) -> Result<Vec<DeviceMapping>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn pool_with_caps(max_per_tenant: usize, idle_timeout: Duration) -> Arc<WorkerPool> {
        let registry = SessionRegistry::new(Arc::new(NullStore), LoopbackConnector::new(false));
        let services = ServiceSet::over_registry(registry, Duration::from_secs(5));

        WorkerPool::new(
            services,
            Arc::new(HandlerRegistry::new()),
            WorkerConf {
                task_queue_size: 4,
                event_queue_size: 4,
                task_timeout: Duration::from_secs(5),
                idle_timeout,
            },
            PoolConf {
                healthcheck_interval: Duration::from_secs(30),
                cleanup_interval: Duration::from_secs(300),
                max_workers_per_tenant: max_per_tenant,
            },
        )
    }

    #[tokio::test]
    async fn create_is_idempotent_per_tenant() {
        let pool = pool_with_caps(3, Duration::from_secs(1800));
        let alice = UserId::from("alice");

        let first = pool.get_or_create(&alice).expect("create");
        let second = pool.get_or_create(&alice).expect("create again");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.metrics().total_workers, 1);
    }

    #[tokio::test]
    async fn stopped_workers_are_replaced_on_create() {
        let pool = pool_with_caps(3, Duration::from_secs(1800));
        let alice = UserId::from("alice");

        let first = pool.get_or_create(&alice).expect("create");
        first.stop();

        let second = pool.get_or_create(&alice).expect("recreate");

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_running());
    }

    #[tokio::test]
    async fn creation_beyond_the_cap_fails_with_pool_full() {
        // Cap is max_workers_per_tenant × 10; 0 means no workers at all.
        let pool = pool_with_caps(0, Duration::from_secs(1800));

        let err = pool.get_or_create(&UserId::from("alice")).expect_err("over cap");
        assert!(matches!(err, GatewayError::PoolFull));
    }

    #[tokio::test]
    async fn health_sweep_evicts_dead_workers() {
        let pool = pool_with_caps(3, Duration::from_secs(1800));
        let alice = UserId::from("alice");

        let worker = pool.get_or_create(&alice).expect("create");
        worker.stop();

        pool.health_sweep();

        assert!(pool.get(&alice).is_none());
    }

    #[tokio::test]
    async fn idle_sweep_evicts_and_submission_recreates() {
        let pool = pool_with_caps(3, Duration::ZERO);
        let alice = UserId::from("alice");

        pool.get_or_create(&alice).expect("create");

        // Zero idle timeout: everything idle is immediately stale.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        pool.idle_sweep();

        assert!(pool.get(&alice).is_none());

        let worker = pool.get_or_create(&alice).expect("recreate");
        assert!(worker.is_running());
    }
}
