use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use courier_task::ChildTask;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc, watch};

use crate::UserId;
use crate::config::WorkerConf;
use crate::coordinator::HandlerRegistry;
use crate::error::GatewayError;
use crate::events::ClassifiedEvent;
use crate::services::ServiceSet;

use super::task::{CommandKind, Priority, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Idle,
    Busy,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetrics {
    pub status: WorkerStatus,
    pub start_time: i64,
    pub last_task_time: Option<i64>,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: u64,
    pub avg_task_duration_ms: f64,
    pub dropped_events: u64,
    pub queued_tasks: usize,
}

#[derive(Debug)]
struct MetricsInner {
    start_time: OffsetDateTime,
    last_task_time: Option<OffsetDateTime>,
    processed: u64,
    successful: u64,
    failed: u64,
    errors: u64,
    avg_task_duration_ms: f64,
    last_error: Option<String>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            start_time: OffsetDateTime::now_utc(),
            last_task_time: None,
            processed: 0,
            successful: 0,
            failed: 0,
            errors: 0,
            avg_task_duration_ms: 0.0,
            last_error: None,
        }
    }

    fn record(&mut self, duration: Duration, error: Option<String>) {
        self.processed += 1;
        self.last_task_time = Some(OffsetDateTime::now_utc());

        match error {
            None => self.successful += 1,
            Some(message) => {
                self.failed += 1;
                self.last_error = Some(message);
            }
        }

        // Running average over all processed tasks.
        let sample_ms = duration.as_secs_f64() * 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let n = self.processed as f64;
        self.avg_task_duration_ms += (sample_ms - self.avg_task_duration_ms) / n;
    }
}

/// Bounded intake shared by all four priority lanes. Dequeue re-evaluates
/// lane order every time, so a critical task overtakes anything queued in a
/// lower lane.
#[derive(Debug)]
struct LaneQueue {
    lanes: Mutex<[std::collections::VecDeque<Task>; Priority::COUNT]>,
    len: AtomicUsize,
    capacity: usize,
    notify: Notify,
}

impl LaneQueue {
    fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Default::default()),
            len: AtomicUsize::new(0),
            capacity,
            notify: Notify::new(),
        }
    }

    fn push(&self, task: Task) -> Result<(), Task> {
        {
            let mut lanes = self.lanes.lock();

            if self.len.load(Ordering::SeqCst) >= self.capacity {
                return Err(task);
            }

            lanes[task.priority.lane()].push_back(task);
            self.len.fetch_add(1, Ordering::SeqCst);
        }

        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Task> {
        let mut lanes = self.lanes.lock();

        for lane in (0..Priority::COUNT).rev() {
            if let Some(task) = lanes[lane].pop_front() {
                self.len.fetch_sub(1, Ordering::SeqCst);
                return Some(task);
            }
        }

        None
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct WorkerShared {
    user_id: UserId,
    status: Mutex<WorkerStatus>,
    running: AtomicBool,
    dropped_events: AtomicU64,
    metrics: Mutex<MetricsInner>,
    tasks: LaneQueue,
}

impl WorkerShared {
    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }
}

/// C4: exactly one per tenant. All mutations of the tenant's upstream
/// session funnel through this worker's task loop; classified events are
/// fanned out to registered handlers on a separate loop so a slow handler
/// never delays command dispatch.
#[derive(Debug)]
pub struct Worker {
    event_tx: mpsc::Sender<ClassifiedEvent>,
    stop_tx: watch::Sender<bool>,
    shared: Arc<WorkerShared>,
    _task_loop: ChildTask<()>,
    _event_loop: ChildTask<()>,
}

impl Worker {
    pub fn spawn(
        user_id: UserId,
        services: Arc<ServiceSet>,
        dispatcher: Arc<HandlerRegistry>,
        conf: WorkerConf,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(conf.event_queue_size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(WorkerShared {
            user_id: user_id.clone(),
            status: Mutex::new(WorkerStatus::Starting),
            running: AtomicBool::new(true),
            dropped_events: AtomicU64::new(0),
            metrics: Mutex::new(MetricsInner::new()),
            tasks: LaneQueue::new(conf.task_queue_size),
        });

        let task_loop = ChildTask::spawn(task_loop(Arc::clone(&shared), services, stop_rx.clone()));
        let event_loop = ChildTask::spawn(event_loop(Arc::clone(&shared), dispatcher, event_rx, stop_rx));

        shared.set_status(WorkerStatus::Idle);
        debug!(user.id = %user_id, "Worker started");

        Arc::new(Self {
            event_tx,
            stop_tx,
            shared,
            _task_loop: task_loop,
            _event_loop: event_loop,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status.lock()
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Hands the task to the task loop. Gives the task back on a full queue
    /// (or a stopped worker) so the scheduler can apply its retry policy.
    pub fn enqueue_task(&self, task: Task) -> Result<(), Task> {
        if !self.is_running() {
            return Err(task);
        }

        self.shared.tasks.push(task)
    }

    /// Non-blocking event delivery; overflow drops the event with a warning.
    /// The durable path is the event bus, not this queue.
    pub fn send_event(&self, event: ClassifiedEvent) {
        if self.event_tx.try_send(event).is_err() {
            let dropped = self.shared.dropped_events.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(user.id = %self.shared.user_id, dropped, "Worker event queue is full; event dropped");
        }
    }

    /// Signals both loops to exit at their next idle point. In-flight
    /// responses are not guaranteed after this returns.
    pub fn stop(&self) {
        self.shared.set_status(WorkerStatus::Stopping);
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    pub fn metrics(&self) -> WorkerMetrics {
        let inner = self.shared.metrics.lock();

        WorkerMetrics {
            status: self.status(),
            start_time: inner.start_time.unix_timestamp(),
            last_task_time: inner.last_task_time.map(|t| t.unix_timestamp()),
            processed: inner.processed,
            successful: inner.successful,
            failed: inner.failed,
            errors: inner.errors,
            avg_task_duration_ms: inner.avg_task_duration_ms,
            dropped_events: self.shared.dropped_events.load(Ordering::SeqCst),
            queued_tasks: self.queued_tasks(),
        }
    }
}

async fn task_loop(shared: Arc<WorkerShared>, services: Arc<ServiceSet>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }

        let Some(mut task) = shared.tasks.pop() else {
            tokio::select! {
                () = shared.tasks.notify.notified() => continue,
                _ = stop_rx.changed() => break,
            }
        };

        shared.set_status(WorkerStatus::Busy);

        let started = Instant::now();
        let result = dispatch_command(&services, &task).await;
        let duration = started.elapsed();

        let error = result.as_ref().err().map(|e| format!("{e:#}"));
        shared.metrics.lock().record(duration, error.clone());

        if let Some(error) = error {
            debug!(
                user.id = %shared.user_id,
                task.id = %task.id,
                command = %task.command,
                error,
                "Task handler failed"
            );
        }

        if !task.respond(result, duration) {
            shared.metrics.lock().errors += 1;
        }

        shared.set_status(WorkerStatus::Idle);
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.set_status(WorkerStatus::Stopped);
    debug!(user.id = %shared.user_id, "Worker task loop stopped");
}

async fn event_loop(
    shared: Arc<WorkerShared>,
    dispatcher: Arc<HandlerRegistry>,
    mut event_rx: mpsc::Receiver<ClassifiedEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                dispatcher.dispatch(&event).await;
            }
        }
    }

    debug!(user.id = %shared.user_id, "Worker event loop stopped");
}

/// Static dispatch table from the command taxonomy to the service façades.
async fn dispatch_command(services: &ServiceSet, task: &Task) -> Result<Value, GatewayError> {
    use serde::de::DeserializeOwned;

    fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, GatewayError> {
        serde_json::from_value(payload.clone()).map_err(|e| GatewayError::Validation(format!("invalid payload: {e}")))
    }

    #[derive(serde::Deserialize)]
    struct TargetRequest {
        jid: String,
    }

    let user_id = &task.user_id;
    let payload = &task.payload;

    match task.command {
        CommandKind::CreateSession => services.lifecycle.create(user_id).await,
        CommandKind::SessionStatus => services.lifecycle.status(user_id).await,
        CommandKind::Connect => services.lifecycle.connect(user_id).await,
        CommandKind::Disconnect => services.lifecycle.disconnect(user_id).await,
        CommandKind::Logout => services.lifecycle.logout(user_id).await,
        CommandKind::Reset => services.lifecycle.reset(user_id).await,
        CommandKind::DeleteSession => services.lifecycle.delete(user_id).await,
        CommandKind::SendText => services.message.send_text(user_id, parse(payload)?).await,
        CommandKind::SendMedia => services.message.send_media(user_id, parse(payload)?).await,
        CommandKind::SendLocation => services.message.send_location(user_id, parse(payload)?).await,
        CommandKind::SendContact => services.message.send_contact(user_id, parse(payload)?).await,
        CommandKind::React => services.message.react(user_id, parse(payload)?).await,
        CommandKind::Revoke => services.message.revoke(user_id, parse(payload)?).await,
        CommandKind::MarkRead => services.message.mark_read(user_id, parse(payload)?).await,
        CommandKind::CreateGroup => services.group.create_group(user_id, parse(payload)?).await,
        CommandKind::GroupInfo => {
            let target: TargetRequest = parse(payload)?;
            services.group.group_info(user_id, &target.jid).await
        }
        CommandKind::UpdateParticipants => services.group.update_participants(user_id, parse(payload)?).await,
        CommandKind::UpdateGroupMeta => services.group.update_meta(user_id, parse(payload)?).await,
        CommandKind::LeaveGroup => {
            let target: TargetRequest = parse(payload)?;
            services.group.leave_group(user_id, &target.jid).await
        }
        CommandKind::InviteLink => services.group.invite_link(user_id, parse(payload)?).await,
        CommandKind::JoinWithLink => services.group.join_with_link(user_id, parse(payload)?).await,
        CommandKind::CreateCommunity => services.community.create_community(user_id, parse(payload)?).await,
        CommandKind::CommunityInfo => {
            let target: TargetRequest = parse(payload)?;
            services.community.community_info(user_id, &target.jid).await
        }
        CommandKind::LinkGroup => services.community.link_group(user_id, parse(payload)?, true).await,
        CommandKind::UnlinkGroup => services.community.link_group(user_id, parse(payload)?, false).await,
        CommandKind::LinkedGroups => {
            let target: TargetRequest = parse(payload)?;
            services.community.linked_groups(user_id, &target.jid).await
        }
        CommandKind::FollowChannel => {
            let target: TargetRequest = parse(payload)?;
            services.channel.follow(user_id, &target.jid).await
        }
        CommandKind::UnfollowChannel => {
            let target: TargetRequest = parse(payload)?;
            services.channel.unfollow(user_id, &target.jid).await
        }
        CommandKind::ChannelInfo => {
            let target: TargetRequest = parse(payload)?;
            services.channel.channel_info(user_id, &target.jid).await
        }
        CommandKind::MuteChannel => services.channel.mute(user_id, parse(payload)?).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{ScriptedServices, stubbed_services};

    use serde_json::json;
    use tokio::sync::oneshot;

    fn worker_conf() -> WorkerConf {
        WorkerConf {
            task_queue_size: 64,
            event_queue_size: 4,
            task_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(1800),
        }
    }

    fn send_text_task(
        user: &str,
        message: &str,
        priority: Priority,
        tx: oneshot::Sender<super::super::task::TaskResponse>,
    ) -> Task {
        Task::builder()
            .user_id(UserId::from(user))
            .command(CommandKind::SendText)
            .priority(priority)
            .payload(json!({"to": "+15551234567", "message": message}))
            .response_chan(tx)
            .build()
    }

    #[tokio::test]
    async fn tasks_are_dispatched_in_fifo_order_within_a_lane() {
        let script = ScriptedServices::default();
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            worker_conf(),
        );

        let mut receivers = Vec::new();

        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            worker
                .enqueue_task(send_text_task("alice", &format!("m{i}"), Priority::Normal, tx))
                .map_err(|_| "enqueue failed")
                .expect("enqueue");
            receivers.push(rx);
        }

        for rx in receivers {
            rx.await.expect("response").result.expect("success");
        }

        assert_eq!(script.calls(), vec!["send_text:m0", "send_text:m1", "send_text:m2"]);

        let metrics = worker.metrics();
        assert_eq!(metrics.processed, 3);
        assert_eq!(metrics.successful, 3);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn critical_tasks_preempt_queued_normal_tasks() {
        let script = ScriptedServices::with_delay(Duration::from_millis(25));
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            worker_conf(),
        );

        let mut receivers = Vec::new();

        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            worker
                .enqueue_task(send_text_task("alice", &format!("m{i}"), Priority::Normal, tx))
                .map_err(|_| "enqueue failed")
                .expect("enqueue");
            receivers.push(rx);
        }

        // Give the worker a moment to pull the first normal task in-flight.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (tx, critical_rx) = oneshot::channel();
        let critical = Task::builder()
            .user_id(UserId::from("alice"))
            .command(CommandKind::Disconnect)
            .priority(Priority::Critical)
            .response_chan(tx)
            .build();
        worker.enqueue_task(critical).map_err(|_| "enqueue failed").expect("enqueue");

        critical_rx.await.expect("response").result.expect("success");

        for rx in receivers {
            rx.await.expect("response").result.expect("success");
        }

        let calls = script.calls();
        let disconnect_at = calls
            .iter()
            .position(|c| c == "disconnect")
            .expect("disconnect dispatched");

        // At most the in-flight normal task may precede the critical one.
        assert!(disconnect_at <= 1, "disconnect ran at position {disconnect_at}: {calls:?}");
    }

    #[tokio::test]
    async fn handler_failures_are_counted_and_surfaced() {
        let script = ScriptedServices::failing_lifecycle();
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            worker_conf(),
        );

        let (tx, rx) = oneshot::channel();
        let task = Task::builder()
            .user_id(UserId::from("alice"))
            .command(CommandKind::SessionStatus)
            .response_chan(tx)
            .build();

        worker.enqueue_task(task).map_err(|_| "enqueue failed").expect("enqueue");

        let response = rx.await.expect("response");
        assert!(matches!(response.result, Err(GatewayError::NotFound(_))));

        let metrics = worker.metrics();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_validation_failure() {
        let script = ScriptedServices::default();
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            worker_conf(),
        );

        let (tx, rx) = oneshot::channel();
        let task = Task::builder()
            .user_id(UserId::from("alice"))
            .command(CommandKind::SendText)
            .payload(json!({"to": "+15551234567"})) // missing `message`
            .response_chan(tx)
            .build();

        worker.enqueue_task(task).map_err(|_| "enqueue failed").expect("enqueue");

        let response = rx.await.expect("response");
        assert!(matches!(response.result, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn full_task_queue_returns_the_task() {
        let script = ScriptedServices::with_delay(Duration::from_secs(5));
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            WorkerConf {
                task_queue_size: 1,
                event_queue_size: 1,
                task_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(1800),
            },
        );

        // First task goes in-flight, second fills the queue, third bounces.
        for i in 0..2 {
            let (tx, _rx) = oneshot::channel();
            let _ = worker.enqueue_task(send_text_task("alice", &format!("m{i}"), Priority::Normal, tx));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, _rx) = oneshot::channel();
        assert!(worker.enqueue_task(send_text_task("alice", "overflow", Priority::Normal, tx)).is_err());
    }

    #[tokio::test]
    async fn stop_marks_the_worker_not_running_and_rejects_tasks() {
        let script = ScriptedServices::default();
        let worker = Worker::spawn(
            UserId::from("alice"),
            stubbed_services(&script),
            Arc::new(HandlerRegistry::new()),
            worker_conf(),
        );

        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());

        let (tx, _rx) = oneshot::channel();
        assert!(worker.enqueue_task(send_text_task("alice", "late", Priority::Normal, tx)).is_err());
    }
}
