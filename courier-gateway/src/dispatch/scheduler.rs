use std::cmp;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_task::{ShutdownSignal, Task as ServiceTask};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::UserId;
use crate::error::GatewayError;
use crate::upstream::UpstreamError;

use super::pool::WorkerPool;
use super::task::{CommandKind, Priority, Task};

const SUBMISSION_DEPTH: usize = 256;

enum SchedulerMessage {
    Submit(Task),
}

/// Cheap handle for submitting tasks to the scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle(mpsc::Sender<SchedulerMessage>);

impl SchedulerHandle {
    /// Validates and hands the task to the scheduler. The response arrives
    /// on the task's `response_chan`.
    pub async fn submit(&self, task: Task) -> Result<(), GatewayError> {
        task.validate()?;

        self.0
            .send(SchedulerMessage::Submit(task))
            .await
            .map_err(|_| GatewayError::Upstream(UpstreamError::Transport("scheduler is not running".to_owned())))
    }

    /// Builds a task carrying the caller's budget as its deadline, submits
    /// it and awaits the response. This is the HTTP edge's entry point.
    pub async fn execute(
        &self,
        user_id: UserId,
        command: CommandKind,
        payload: Value,
        priority: Option<Priority>,
        budget: Duration,
    ) -> Result<Value, GatewayError> {
        let (tx, rx) = oneshot::channel();

        let task = Task::builder()
            .user_id(user_id)
            .command(command)
            .priority(priority.unwrap_or_else(|| command.default_priority()))
            .payload(payload)
            .response_chan(tx)
            .deadline(OffsetDateTime::now_utc() + budget)
            .build();

        let task_id = task.id;
        self.submit(task).await?;

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(response)) => response.result,
            Ok(Err(_closed)) => Err(GatewayError::Upstream(UpstreamError::Transport(
                "task was dropped before completion".to_owned(),
            ))),
            Err(_elapsed) => {
                debug!(task.id = %task_id, "Caller budget elapsed while awaiting the task response");
                Err(GatewayError::DeadlineExceeded)
            }
        }
    }
}

pub fn scheduler_channel(pool: Arc<WorkerPool>) -> (SchedulerHandle, SchedulerTask) {
    let (tx, rx) = mpsc::channel(SUBMISSION_DEPTH);

    (
        SchedulerHandle(tx),
        SchedulerTask {
            rx,
            pool,
            lanes: Default::default(),
            retries: BinaryHeap::new(),
            seq: 0,
        },
    )
}

/// Min-heap entry for queue-full reschedules; earliest due first, FIFO on
/// ties.
struct RetryEntry {
    due: tokio::time::Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match self.due.cmp(&other.due) {
            cmp::Ordering::Less => cmp::Ordering::Greater,
            cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            cmp::Ordering::Greater => cmp::Ordering::Less,
        }
    }
}

/// C5: four priority lanes, deadline enforcement, implicit worker
/// provisioning and linear-backoff retries on worker backpressure.
pub struct SchedulerTask {
    rx: mpsc::Receiver<SchedulerMessage>,
    pool: Arc<WorkerPool>,
    lanes: [VecDeque<Task>; Priority::COUNT],
    retries: BinaryHeap<RetryEntry>,
    seq: u64,
}

impl SchedulerTask {
    fn enqueue(&mut self, task: Task) {
        self.lanes[task.priority.lane()].push_back(task);
    }

    fn next_ready(&mut self) -> Option<Task> {
        // Strict priority, re-evaluated between every dequeue.
        for lane in (0..Priority::COUNT).rev() {
            if let Some(task) = self.lanes[lane].pop_front() {
                return Some(task);
            }
        }

        None
    }

    fn drain_ready(&mut self) {
        while let Some(task) = self.next_ready() {
            self.dispatch_one(task);
        }
    }

    fn dispatch_one(&mut self, mut task: Task) {
        if task.deadline_elapsed(OffsetDateTime::now_utc()) {
            task.respond(Err(GatewayError::DeadlineExceeded), Duration::ZERO);
            return;
        }

        // The single place workers come into existence implicitly.
        let worker = match self.pool.get_or_create(&task.user_id) {
            Ok(worker) => worker,
            Err(error) => {
                task.respond(Err(error), Duration::ZERO);
                return;
            }
        };

        if let Err(task) = worker.enqueue_task(task) {
            self.schedule_retry(task);
        }
    }

    /// Linear backoff: the n-th retry waits n × 1 s in its original lane.
    fn schedule_retry(&mut self, mut task: Task) {
        task.retries += 1;

        if task.retries > task.max_retries {
            let attempts = task.retries - 1;
            task.respond(
                Err(GatewayError::MaxRetriesExceeded(format!(
                    "worker task queue still full after {attempts} retries"
                ))),
                Duration::ZERO,
            );
            return;
        }

        let delay = Duration::from_secs(u64::from(task.retries));
        let due = tokio::time::Instant::now() + delay;

        debug!(
            task.id = %task.id,
            user.id = %task.user_id,
            retries = task.retries,
            delay_s = delay.as_secs(),
            "Worker queue full; task rescheduled"
        );

        self.seq += 1;
        self.retries.push(RetryEntry {
            due,
            seq: self.seq,
            task,
        });
    }

    fn release_due_retries(&mut self) {
        let now = tokio::time::Instant::now();

        while self.retries.peek().is_some_and(|entry| entry.due <= now) {
            let entry = self.retries.pop().expect("peeked above");
            self.enqueue(entry.task);
        }
    }

    fn fail_leftovers(&mut self) {
        let mut leftovers: Vec<Task> = self.lanes.iter_mut().flat_map(std::mem::take).collect();
        leftovers.extend(std::mem::take(&mut self.retries).into_iter().map(|entry| entry.task));

        for mut task in leftovers {
            task.respond(
                Err(GatewayError::Upstream(UpstreamError::Transport(
                    "scheduler shutting down".to_owned(),
                ))),
                Duration::ZERO,
            );
        }
    }
}

#[async_trait]
impl ServiceTask for SchedulerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "task scheduler";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        scheduler_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn scheduler_task(mut scheduler: SchedulerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let retry_sleep = tokio::time::sleep_until(tokio::time::Instant::now());
    tokio::pin!(retry_sleep);
    (&mut retry_sleep).await; // Consume initial sleep.

    loop {
        scheduler.drain_ready();

        if let Some(next) = scheduler.retries.peek() {
            if retry_sleep.is_elapsed() || retry_sleep.deadline() != next.due {
                retry_sleep.as_mut().reset(next.due);
            }
        }

        tokio::select! {
            () = &mut retry_sleep, if !scheduler.retries.is_empty() => {
                scheduler.release_due_retries();
            }
            msg = scheduler.rx.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };

                match msg {
                    SchedulerMessage::Submit(task) => scheduler.enqueue(task),
                }
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    debug!("Task is stopping; failing queued work");
    scheduler.fail_leftovers();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConf, WorkerConf};
    use crate::coordinator::HandlerRegistry;
    use crate::services::testing::{ScriptedServices, stubbed_services};

    use courier_task::ShutdownHandle;
    use serde_json::json;

    fn spawn_scheduler(
        script: &ScriptedServices,
        task_queue_size: usize,
    ) -> (SchedulerHandle, Arc<WorkerPool>, ShutdownHandle) {
        let pool = WorkerPool::new(
            stubbed_services(script),
            Arc::new(HandlerRegistry::new()),
            WorkerConf {
                task_queue_size,
                event_queue_size: 16,
                task_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(1800),
            },
            PoolConf {
                healthcheck_interval: Duration::from_secs(30),
                cleanup_interval: Duration::from_secs(300),
                max_workers_per_tenant: 3,
            },
        );

        let (handle, task) = scheduler_channel(Arc::clone(&pool));
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        courier_task::spawn_task(task, shutdown_signal).detach();

        (handle, pool, shutdown_handle)
    }

    #[tokio::test]
    async fn elapsed_deadline_short_circuits_without_dispatch() {
        let script = ScriptedServices::default();
        let (handle, _pool, _shutdown) = spawn_scheduler(&script, 16);

        let (tx, rx) = oneshot::channel();
        let task = Task::builder()
            .user_id(UserId::from("alice"))
            .command(CommandKind::SendText)
            .payload(json!({"to": "+15551234567", "message": "late"}))
            .response_chan(tx)
            .deadline(OffsetDateTime::now_utc() - time::Duration::seconds(1))
            .build();

        handle.submit(task).await.expect("submit");

        let response = rx.await.expect("response");
        assert!(matches!(response.result, Err(GatewayError::DeadlineExceeded)));
        assert!(script.calls().is_empty(), "no handler must run");
    }

    #[tokio::test]
    async fn submission_validates_required_fields() {
        let script = ScriptedServices::default();
        let (handle, _pool, _shutdown) = spawn_scheduler(&script, 16);

        let task = Task::builder()
            .user_id(UserId::from(""))
            .command(CommandKind::SendText)
            .build();

        let err = handle.submit(task).await.expect_err("must reject");
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn submission_auto_provisions_the_worker() {
        let script = ScriptedServices::default();
        let (handle, pool, _shutdown) = spawn_scheduler(&script, 16);
        let alice = UserId::from("alice");

        assert!(pool.get(&alice).is_none());

        let result = handle
            .execute(
                alice.clone(),
                CommandKind::SendText,
                json!({"to": "+15551234567", "message": "hi"}),
                None,
                Duration::from_secs(5),
            )
            .await
            .expect("execute");

        assert_eq!(result["message_id"], "STUB");
        assert!(pool.get(&alice).is_some());
    }

    #[tokio::test]
    async fn queue_full_retries_with_linear_backoff_until_room() {
        // One-slot queue and slow sends: the third submission bounces, gets
        // rescheduled and eventually completes.
        let script = ScriptedServices::with_delay(Duration::from_millis(150));
        let (handle, _pool, _shutdown) = spawn_scheduler(&script, 1);

        let mut responses = Vec::new();

        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            let task = Task::builder()
                .user_id(UserId::from("alice"))
                .command(CommandKind::SendText)
                .payload(json!({"to": "+15551234567", "message": format!("m{i}")}))
                .response_chan(tx)
                .build();

            handle.submit(task).await.expect("submit");
            responses.push(rx);
        }

        for rx in responses {
            let response = tokio::time::timeout(Duration::from_secs(10), rx)
                .await
                .expect("within budget")
                .expect("response");
            response.result.expect("success");
        }

        assert_eq!(script.calls().len(), 3);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_surfaces_max_retries_exceeded() {
        // The queue never frees up within the retry budget.
        let script = ScriptedServices::with_delay(Duration::from_secs(30));
        let (handle, _pool, _shutdown) = spawn_scheduler(&script, 1);

        // Fill the in-flight slot and the queue.
        for _ in 0..2 {
            let (tx, _rx) = oneshot::channel();
            let task = Task::builder()
                .user_id(UserId::from("alice"))
                .command(CommandKind::SendText)
                .payload(json!({"to": "+15551234567", "message": "blocker"}))
                .response_chan(tx)
                .build();
            handle.submit(task).await.expect("submit");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, rx) = oneshot::channel();
        let task = Task::builder()
            .user_id(UserId::from("alice"))
            .command(CommandKind::SendText)
            .payload(json!({"to": "+15551234567", "message": "doomed"}))
            .response_chan(tx)
            .max_retries(1)
            .build();

        handle.submit(task).await.expect("submit");

        let response = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("within budget")
            .expect("response");

        match response.result {
            Err(GatewayError::MaxRetriesExceeded(_)) => {}
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }
}
