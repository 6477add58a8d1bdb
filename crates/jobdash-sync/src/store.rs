//! Reconciliation store: the one observable state surface for the dashboard.
//!
//! Pulls go through an [`ActionGateway`] and replace their field wholesale.
//! Pushes arrive as handlers on the [`FeedConnection`] and only ever trigger
//! pulls, apart from the optimistic status patch on `job_update`.

use crate::channel::{lock, FeedConnection};
use crate::gateway::{ActionGateway, GatewayError};
use crate::registry::{feed_handler, FeedHandler};
use crate::timer::TimerSlot;
use jobdash_core::discovery::{summarize_discovery, DiscoveryNotification, DiscoverySummary};
use jobdash_core::feed::{
    FeedEvent, FeedMessage, JOB_DISCOVERY_COMPLETE, JOB_RETRY, JOB_UPDATE, PIPELINE_UPDATE,
};
use jobdash_core::{Job, JobListParams, JobStats, JobStatus, PipelineSnapshot};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_REJECT_REASON: &str = "User rejected";

const PUSH_EVENT_TYPES: [&str; 4] = [JOB_UPDATE, JOB_RETRY, PIPELINE_UPDATE, JOB_DISCOVERY_COMPLETE];
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// One flag per concern; concurrent work on one concern never touches another's flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadingFlags {
    pub jobs: bool,
    pub pipeline: bool,
    pub pending: bool,
    pub discovering: bool,
}

impl LoadingFlags {
    pub fn any(&self) -> bool {
        self.jobs || self.pipeline || self.pending || self.discovering
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    pub jobs: Vec<Job>,
    pub pipeline: Option<PipelineSnapshot>,
    pub pending: Vec<Job>,
    pub loading: LoadingFlags,
    pub error: Option<String>,
    pub connection_status: ConnectionState,
    pub discovery_notification: Option<DiscoveryNotification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub pending_limit: u32,
    pub liveness_interval: Duration,
    pub notification_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Concern {
    Jobs,
    Pipeline,
    Pending,
}

impl Concern {
    fn name(self) -> &'static str {
        match self {
            Concern::Jobs => "jobs",
            Concern::Pipeline => "pipeline",
            Concern::Pending => "pending",
        }
    }

    fn flag(self, loading: &mut LoadingFlags) -> &mut bool {
        match self {
            Concern::Jobs => &mut loading.jobs,
            Concern::Pipeline => &mut loading.pipeline,
            Concern::Pending => &mut loading.pending,
        }
    }
}

/// Request tickets for one concern. A response is applied only if nothing
/// newer has been applied yet; the loading flag clears only when the most
/// recently issued request resolves.
#[derive(Debug, Default)]
struct PullSequence {
    issued: AtomicU64,
    applied: AtomicU64,
}

impl PullSequence {
    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_latest(&self, ticket: u64) -> bool {
        self.issued.load(Ordering::SeqCst) == ticket
    }

    fn claim(&self, ticket: u64) -> bool {
        self.applied.fetch_max(ticket, Ordering::SeqCst) < ticket
    }
}

struct StoreInner {
    gateway: Arc<dyn ActionGateway>,
    feed: FeedConnection,
    config: StoreConfig,
    state: watch::Sender<DashboardState>,
    jobs_seq: PullSequence,
    pipeline_seq: PullSequence,
    pending_seq: PullSequence,
    job_params: Mutex<JobListParams>,
    notice_ids: AtomicU64,
    notice_timer: Mutex<TimerSlot>,
    liveness: Mutex<TimerSlot>,
    subscriptions: Mutex<Vec<(&'static str, FeedHandler)>>,
    manual_disconnect: AtomicBool,
}

/// Cheap to clone. Push handlers hold only a weak reference, so dropping
/// every clone tears the store down even while the feed is still alive.
#[derive(Clone)]
pub struct DashboardStore {
    inner: Arc<StoreInner>,
}

impl DashboardStore {
    pub fn new(gateway: Arc<dyn ActionGateway>, feed: FeedConnection, config: StoreConfig) -> Self {
        let (state, _) = watch::channel(DashboardState::default());
        Self {
            inner: Arc::new(StoreInner {
                gateway,
                feed,
                config,
                state,
                jobs_seq: PullSequence::default(),
                pipeline_seq: PullSequence::default(),
                pending_seq: PullSequence::default(),
                job_params: Mutex::new(JobListParams::default()),
                notice_ids: AtomicU64::new(0),
                notice_timer: Mutex::new(TimerSlot::default()),
                liveness: Mutex::new(TimerSlot::default()),
                subscriptions: Mutex::new(Vec::new()),
                manual_disconnect: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> DashboardState {
        self.inner.state.borrow().clone()
    }

    /// Recomputed from the current job list on every call.
    pub fn job_stats(&self) -> JobStats {
        JobStats::from_jobs(&self.inner.state.borrow().jobs)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Remembers `params` so later refreshes repeat the same query.
    pub async fn fetch_jobs(&self, params: JobListParams) {
        *lock(&self.inner.job_params) = params;
        self.refresh_jobs().await;
    }

    pub async fn refresh_jobs(&self) {
        let params = lock(&self.inner.job_params).clone();
        let gateway = self.inner.gateway.clone();
        self.pull(
            Concern::Jobs,
            async move { gateway.list_jobs(&params).await.map(|response| response.jobs) },
            |state, jobs| state.jobs = jobs.unwrap_or_default(),
        )
        .await;
    }

    pub async fn fetch_pipeline(&self) {
        let gateway = self.inner.gateway.clone();
        self.pull(
            Concern::Pipeline,
            async move { gateway.pipeline_status().await },
            |state, snapshot| state.pipeline = snapshot,
        )
        .await;
    }

    pub async fn fetch_pending(&self, limit: u32) {
        let gateway = self.inner.gateway.clone();
        self.pull(
            Concern::Pending,
            async move {
                gateway
                    .list_pending(limit)
                    .await
                    .map(|response| response.pending_jobs)
            },
            |state, pending| state.pending = pending.unwrap_or_default(),
        )
        .await;
    }

    pub async fn refresh_pending(&self) {
        self.fetch_pending(self.inner.config.pending_limit).await;
    }

    async fn refresh(&self, concern: Concern) {
        match concern {
            Concern::Jobs => self.refresh_jobs().await,
            Concern::Pipeline => self.fetch_pipeline().await,
            Concern::Pending => self.refresh_pending().await,
        }
    }

    /// Runs one pull. `apply` receives `None` on failure and must reset its
    /// field to empty; the error text lands in the shared `error` field.
    async fn pull<T, Fut, A>(&self, concern: Concern, request: Fut, apply: A)
    where
        Fut: Future<Output = Result<T, GatewayError>>,
        A: FnOnce(&mut DashboardState, Option<T>),
    {
        let sequence = self.sequence(concern);
        let ticket = sequence.issue();
        self.inner.state.send_modify(|state| {
            *concern.flag(&mut state.loading) = true;
            state.error = None;
        });

        let outcome = request.await;

        self.inner.state.send_if_modified(|state| {
            let mut changed = false;
            if sequence.is_latest(ticket) {
                *concern.flag(&mut state.loading) = false;
                changed = true;
            }
            if !sequence.claim(ticket) {
                debug!(event = "store_pull_stale", concern = concern.name(), ticket);
                return changed;
            }
            match outcome {
                Ok(value) => apply(state, Some(value)),
                Err(err) => {
                    warn!(event = "store_pull_failed", concern = concern.name(), error = %err);
                    apply(state, None);
                    state.error = Some(err.to_string());
                }
            }
            true
        });
    }

    fn sequence(&self, concern: Concern) -> &PullSequence {
        match concern {
            Concern::Jobs => &self.inner.jobs_seq,
            Concern::Pipeline => &self.inner.pipeline_seq,
            Concern::Pending => &self.inner.pending_seq,
        }
    }

    pub async fn retry_job(&self, id: &str) -> Result<Value, StoreError> {
        match self.inner.gateway.retry_job(id).await {
            Ok(ack) => {
                info!(event = "job_retry_requested", job_id = id);
                self.refresh_jobs().await;
                Ok(ack)
            }
            Err(err) => Err(self.action_failed("retry", id, err)),
        }
    }

    pub async fn approve_job(&self, id: &str) -> Result<Value, StoreError> {
        match self.inner.gateway.approve_job(id).await {
            Ok(ack) => {
                info!(event = "job_approved", job_id = id);
                self.refresh_pending().await;
                Ok(ack)
            }
            Err(err) => Err(self.action_failed("approve", id, err)),
        }
    }

    pub async fn reject_job(&self, id: &str, reason: Option<&str>) -> Result<Value, StoreError> {
        let reason = reason.unwrap_or(DEFAULT_REJECT_REASON);
        match self.inner.gateway.reject_job(id, reason).await {
            Ok(ack) => {
                info!(event = "job_rejected", job_id = id, reason);
                self.refresh_pending().await;
                Ok(ack)
            }
            Err(err) => Err(self.action_failed("reject", id, err)),
        }
    }

    fn action_failed(&self, action: &'static str, id: &str, err: GatewayError) -> StoreError {
        warn!(event = "store_action_failed", action, job_id = id, error = %err);
        let message = err.to_string();
        self.inner.state.send_modify(|state| state.error = Some(message));
        StoreError::Gateway(err)
    }

    pub async fn discover_jobs(&self) -> Result<DiscoverySummary, StoreError> {
        lock(&self.inner.notice_timer).cancel();
        self.inner.state.send_modify(|state| {
            state.loading.discovering = true;
            state.discovery_notification = None;
        });

        match self.inner.gateway.discover().await {
            Ok(response) => {
                let summary = summarize_discovery(&response);
                info!(
                    event = "discovery_complete",
                    total = summary.total,
                    sources = summary.fragments.len()
                );
                let notice = DiscoveryNotification::success(self.next_notice_id(), summary.message.clone());
                self.raise_notice(notice, None);
                tokio::join!(self.refresh_jobs(), self.fetch_pipeline(), self.refresh_pending());
                Ok(summary)
            }
            Err(err) => {
                warn!(event = "discovery_failed", error = %err);
                let message = err
                    .server_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                let notice = DiscoveryNotification::error(self.next_notice_id(), message);
                self.raise_notice(notice, Some(err.to_string()));
                Err(StoreError::Gateway(err))
            }
        }
    }

    fn next_notice_id(&self) -> u64 {
        self.inner.notice_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Shows `notice` and schedules its expiry. The expiry only clears the
    /// banner it was scheduled for.
    fn raise_notice(&self, notice: DiscoveryNotification, error: Option<String>) {
        let id = notice.id;
        self.inner.state.send_modify(|state| {
            state.loading.discovering = false;
            state.discovery_notification = Some(notice);
            if let Some(error) = error {
                state.error = Some(error);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let ttl = self.inner.config.notification_ttl;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.state.send_if_modified(|state| match &state.discovery_notification {
                Some(current) if current.id == id => {
                    state.discovery_notification = None;
                    true
                }
                _ => false,
            });
        });
        lock(&self.inner.notice_timer).replace(expiry);
    }

    /// Registers push handlers, starts the liveness poll, then connects and
    /// runs the three initial pulls concurrently. Never fails: the dashboard
    /// works from pulls alone when the feed is down.
    pub async fn initialize(&self) {
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        self.attach_push_handlers();
        self.start_liveness_poll();
        tokio::join!(
            self.connect_feed(),
            self.refresh_jobs(),
            self.fetch_pipeline(),
            self.refresh_pending()
        );
    }

    pub fn cleanup(&self) {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        lock(&self.inner.liveness).cancel();
        let subscriptions: Vec<_> = lock(&self.inner.subscriptions).drain(..).collect();
        for (event_type, handler) in &subscriptions {
            self.inner.feed.off(event_type, handler);
        }
        self.inner.feed.disconnect();
        self.set_connection_status(ConnectionState::Disconnected);
        info!(event = "store_cleanup", handlers = subscriptions.len());
    }

    async fn connect_feed(&self) {
        self.set_connection_status(ConnectionState::Connecting);
        let outcome = self.inner.feed.connect().await;
        if self.inner.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        match outcome {
            Ok(()) => self.set_connection_status(ConnectionState::Connected),
            Err(err) => {
                warn!(event = "store_feed_unavailable", error = %err);
                self.set_connection_status(ConnectionState::Disconnected);
            }
        }
    }

    fn set_connection_status(&self, status: ConnectionState) {
        self.inner.state.send_if_modified(|state| {
            if state.connection_status == status {
                return false;
            }
            state.connection_status = status;
            true
        });
    }

    fn start_liveness_poll(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.liveness_interval.max(MIN_LIVENESS_INTERVAL);
        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DashboardStore { inner }.reconcile_connection_status();
            }
        });
        lock(&self.inner.liveness).replace(poll);
    }

    /// Brings `connection_status` in line with the feed's real state. A
    /// manual disconnect is never overridden.
    pub(crate) fn reconcile_connection_status(&self) {
        if self.inner.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        let connected = self.inner.feed.is_connected();
        self.inner.state.send_if_modified(|state| {
            let next = match (state.connection_status, connected) {
                (ConnectionState::Connected, false) => ConnectionState::Reconnecting,
                (ConnectionState::Connected, true) => return false,
                (_, true) => ConnectionState::Connected,
                (_, false) => return false,
            };
            debug!(
                event = "connection_status_reconciled",
                from = state.connection_status.label(),
                to = next.label()
            );
            state.connection_status = next;
            true
        });
    }

    fn attach_push_handlers(&self) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }
        let handler = push_handler(Arc::downgrade(&self.inner));
        for event_type in PUSH_EVENT_TYPES {
            self.inner.feed.on(event_type, handler.clone());
            subscriptions.push((event_type, handler.clone()));
        }
    }

    fn ingest(&self, message: &FeedMessage) -> anyhow::Result<()> {
        match FeedEvent::from_message(message)? {
            FeedEvent::JobUpdate(update) => {
                if let Some((job_id, status)) = update.patch() {
                    self.patch_job_status(job_id, status);
                }
                if update.touches_pending() {
                    self.spawn_refresh(Concern::Pending);
                }
                self.spawn_refresh(Concern::Jobs);
            }
            FeedEvent::JobRetry(_) | FeedEvent::JobDiscoveryComplete(_) => {
                self.spawn_refresh(Concern::Jobs);
            }
            FeedEvent::PipelineUpdate(_) => self.spawn_refresh(Concern::Pipeline),
            FeedEvent::Unknown => {
                debug!(event = "store_push_ignored", event_type = %message.event_type);
            }
        }
        Ok(())
    }

    /// Optimistic; the jobs refresh that follows overwrites it.
    fn patch_job_status(&self, job_id: &str, status: &JobStatus) {
        self.inner.state.send_if_modified(|state| {
            match state.jobs.iter_mut().find(|job| job.id == job_id) {
                Some(job) => {
                    job.status = status.clone();
                    true
                }
                None => false,
            }
        });
    }

    fn spawn_refresh(&self, concern: Concern) {
        let store = self.clone();
        tokio::spawn(async move { store.refresh(concern).await });
    }
}

fn push_handler(store: Weak<StoreInner>) -> FeedHandler {
    feed_handler(move |message| match store.upgrade() {
        Some(inner) => DashboardStore { inner }.ingest(message),
        None => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{feed_config, wait_until, TestFeedServer};
    use async_trait::async_trait;
    use jobdash_core::discovery::NoticeKind;
    use jobdash_core::{DiscoveryResponse, JobsResponse, PendingResponse};
    use serde_json::json;
    use std::collections::VecDeque;
    use url::Url;

    type Scripted<T> = (Duration, Result<T, GatewayError>);

    /// Answers each call from a per-endpoint script, falling back to an empty
    /// success once the script runs out.
    #[derive(Default)]
    struct ScriptedGateway {
        jobs: Mutex<VecDeque<Scripted<JobsResponse>>>,
        pipeline: Mutex<VecDeque<Scripted<PipelineSnapshot>>>,
        pending: Mutex<VecDeque<Scripted<PendingResponse>>>,
        acks: Mutex<VecDeque<Scripted<Value>>>,
        discovery: Mutex<VecDeque<Scripted<DiscoveryResponse>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        fn script_jobs(&self, delay_ms: u64, result: Result<Vec<Job>, GatewayError>) {
            let result = result.map(|jobs| JobsResponse { jobs });
            push(&self.jobs, delay_ms, result);
        }

        fn script_pipeline(&self, delay_ms: u64, result: Result<PipelineSnapshot, GatewayError>) {
            push(&self.pipeline, delay_ms, result);
        }

        fn script_pending(&self, delay_ms: u64, result: Result<Vec<Job>, GatewayError>) {
            let result = result.map(|pending_jobs| PendingResponse { pending_jobs });
            push(&self.pending, delay_ms, result);
        }

        fn script_ack(&self, result: Result<Value, GatewayError>) {
            push(&self.acks, 0, result);
        }

        fn script_discovery(&self, result: Result<Value, GatewayError>) {
            let result = result.map(|body| serde_json::from_value(body).expect("discovery body"));
            push(&self.discovery, 0, result);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|call| call.starts_with(prefix)).count()
        }

        async fn answer<T: Default>(
            &self,
            call: String,
            queue: &Mutex<VecDeque<Scripted<T>>>,
        ) -> Result<T, GatewayError> {
            self.calls.lock().expect("calls lock").push(call);
            let scripted = queue.lock().expect("script lock").pop_front();
            let Some((delay, result)) = scripted else {
                return Ok(T::default());
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }

    fn push<T>(queue: &Mutex<VecDeque<Scripted<T>>>, delay_ms: u64, result: Result<T, GatewayError>) {
        queue
            .lock()
            .expect("script lock")
            .push_back((Duration::from_millis(delay_ms), result));
    }

    #[async_trait]
    impl ActionGateway for ScriptedGateway {
        async fn list_jobs(&self, params: &JobListParams) -> Result<JobsResponse, GatewayError> {
            let filter = params.status.as_deref().unwrap_or("*");
            self.answer(format!("list_jobs:{filter}"), &self.jobs).await
        }

        async fn retry_job(&self, id: &str) -> Result<Value, GatewayError> {
            self.answer(format!("retry_job:{id}"), &self.acks).await
        }

        async fn pipeline_status(&self) -> Result<PipelineSnapshot, GatewayError> {
            self.answer("pipeline_status".to_string(), &self.pipeline).await
        }

        async fn list_pending(&self, limit: u32) -> Result<PendingResponse, GatewayError> {
            self.answer(format!("list_pending:{limit}"), &self.pending).await
        }

        async fn approve_job(&self, id: &str) -> Result<Value, GatewayError> {
            self.answer(format!("approve_job:{id}"), &self.acks).await
        }

        async fn reject_job(&self, id: &str, reason: &str) -> Result<Value, GatewayError> {
            self.answer(format!("reject_job:{id}:{reason}"), &self.acks).await
        }

        async fn discover(&self) -> Result<DiscoveryResponse, GatewayError> {
            self.answer("discover".to_string(), &self.discovery).await
        }
    }

    fn job(id: &str, status: JobStatus) -> Job {
        Job::new(id, status)
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|job| job.id.as_str()).collect()
    }

    fn transport(reason: &str) -> GatewayError {
        GatewayError::Transport(reason.to_string())
    }

    fn store_config() -> StoreConfig {
        StoreConfig {
            pending_limit: 20,
            liveness_interval: Duration::from_millis(20),
            notification_ttl: Duration::from_millis(5_000),
        }
    }

    /// Nothing listens on port 1 and no reconnects are allowed.
    fn offline_feed() -> FeedConnection {
        let url = Url::parse("ws://127.0.0.1:1/ws").expect("url");
        FeedConnection::new(feed_config(&url, 10_000, 0))
    }

    fn store_with(gateway: &Arc<ScriptedGateway>, feed: &FeedConnection) -> DashboardStore {
        DashboardStore::new(gateway.clone(), feed.clone(), store_config())
    }

    fn offline_store() -> (Arc<ScriptedGateway>, FeedConnection, DashboardStore) {
        let gateway = Arc::new(ScriptedGateway::default());
        let feed = offline_feed();
        let store = store_with(&gateway, &feed);
        (gateway, feed, store)
    }

    fn frame(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[tokio::test]
    async fn fetch_pending_replaces_list_and_clears_flag() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_pending(
            0,
            Ok(vec![
                job("1", JobStatus::Matched),
                job("2", JobStatus::Matched),
                job("3", JobStatus::Failed),
            ]),
        );

        store.fetch_pending(20).await;

        let state = store.snapshot();
        assert_eq!(state.pending.len(), 3);
        assert!(!state.loading.pending);
        assert_eq!(state.error, None);
        assert_eq!(gateway.calls(), vec!["list_pending:20"]);
    }

    #[tokio::test]
    async fn failed_jobs_pull_resets_only_jobs() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(0, Ok(vec![job("1", JobStatus::Pending)]));
        gateway.script_pipeline(
            0,
            Ok(PipelineSnapshot {
                active_jobs: vec![job("1", JobStatus::Pending)],
                ..PipelineSnapshot::default()
            }),
        );
        gateway.script_pending(0, Ok(vec![job("2", JobStatus::Matched)]));
        store.refresh_jobs().await;
        store.fetch_pipeline().await;
        store.refresh_pending().await;

        gateway.script_jobs(0, Err(transport("connection reset")));
        store.refresh_jobs().await;

        let state = store.snapshot();
        assert!(state.jobs.is_empty());
        assert_eq!(
            state.error.as_deref(),
            Some("request failed: connection reset")
        );
        assert_eq!(state.pipeline.map(|p| p.active_jobs.len()), Some(1));
        assert_eq!(ids(&state.pending), vec!["2"]);
        assert!(!state.loading.any());
    }

    #[tokio::test]
    async fn failed_pipeline_pull_resets_to_none() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_pipeline(0, Ok(PipelineSnapshot::default()));
        store.fetch_pipeline().await;
        assert!(store.snapshot().pipeline.is_some());

        gateway.script_pipeline(
            0,
            Err(GatewayError::Status {
                status: 500,
                message: None,
            }),
        );
        store.fetch_pipeline().await;
        let state = store.snapshot();
        assert_eq!(state.pipeline, None);
        assert_eq!(state.error.as_deref(), Some("server returned 500"));
    }

    #[tokio::test]
    async fn next_pull_clears_previous_error() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(0, Err(transport("timeout")));
        store.refresh_jobs().await;
        assert!(store.snapshot().error.is_some());

        store.fetch_pending(5).await;
        assert_eq!(store.snapshot().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn slower_older_pull_cannot_overwrite_newer_result() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(100, Ok(vec![job("old", JobStatus::Pending)]));
        gateway.script_jobs(10, Ok(vec![job("new", JobStatus::Pending)]));

        let observer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let state = store.snapshot();
            assert_eq!(ids(&state.jobs), vec!["new"]);
            assert!(!state.loading.jobs);
        };
        tokio::join!(store.refresh_jobs(), store.refresh_jobs(), observer);

        let state = store.snapshot();
        assert_eq!(ids(&state.jobs), vec!["new"]);
        assert!(!state.loading.jobs);
    }

    #[tokio::test(start_paused = true)]
    async fn older_result_shows_until_newer_lands_and_flag_waits_for_newest() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(10, Ok(vec![job("old", JobStatus::Pending)]));
        gateway.script_jobs(100, Ok(vec![job("new", JobStatus::Pending)]));

        let observer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let state = store.snapshot();
            assert_eq!(ids(&state.jobs), vec!["old"]);
            assert!(state.loading.jobs);
        };
        tokio::join!(store.refresh_jobs(), store.refresh_jobs(), observer);

        let state = store.snapshot();
        assert_eq!(ids(&state.jobs), vec!["new"]);
        assert!(!state.loading.jobs);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_flags_are_independent() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(100, Ok(Vec::new()));
        gateway.script_pending(10, Ok(Vec::new()));

        let observer = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let loading = store.snapshot().loading;
            assert!(loading.jobs);
            assert!(!loading.pending);
            assert!(!loading.pipeline);
        };
        tokio::join!(store.refresh_jobs(), store.refresh_pending(), observer);
        assert!(!store.snapshot().loading.any());
    }

    #[tokio::test]
    async fn fetch_jobs_params_are_reused_by_refreshes() {
        let (gateway, _feed, store) = offline_store();
        store
            .fetch_jobs(JobListParams {
                status: Some("failed".to_string()),
                ..JobListParams::default()
            })
            .await;
        store.retry_job("7").await.expect("retry");
        assert_eq!(
            gateway.calls(),
            vec!["list_jobs:failed", "retry_job:7", "list_jobs:failed"]
        );
    }

    #[tokio::test]
    async fn retry_refreshes_once_and_ignores_refresh_failure() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_ack(Ok(json!({"ok": true})));
        gateway.script_jobs(0, Err(transport("backend restarting")));

        let ack = store.retry_job("7").await.expect("retry succeeds");
        assert_eq!(ack, json!({"ok": true}));
        assert_eq!(gateway.calls(), vec!["retry_job:7", "list_jobs:*"]);
        assert_eq!(
            store.snapshot().error.as_deref(),
            Some("request failed: backend restarting")
        );
    }

    #[tokio::test]
    async fn retry_failure_is_recorded_and_returned() {
        let (gateway, _feed, store) = offline_store();
        let failure = GatewayError::Status {
            status: 404,
            message: Some("job not found".to_string()),
        };
        gateway.script_ack(Err(failure.clone()));

        let err = store.retry_job("7").await.expect_err("retry fails");
        assert_eq!(err, StoreError::Gateway(failure));
        assert_eq!(gateway.calls(), vec!["retry_job:7"]);
        assert_eq!(
            store.snapshot().error.as_deref(),
            Some("server returned 404: job not found")
        );
    }

    #[tokio::test]
    async fn approve_and_reject_refresh_pending() {
        let (gateway, _feed, store) = offline_store();
        store.approve_job("3").await.expect("approve");
        store.reject_job("4", None).await.expect("reject");
        store
            .reject_job("5", Some("Salary too low"))
            .await
            .expect("reject with reason");

        assert_eq!(
            gateway.calls(),
            vec![
                "approve_job:3",
                "list_pending:20",
                "reject_job:4:User rejected",
                "list_pending:20",
                "reject_job:5:Salary too low",
                "list_pending:20",
            ]
        );
    }

    #[tokio::test]
    async fn approve_failure_skips_refresh() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_ack(Err(transport("refused")));
        assert!(store.approve_job("3").await.is_err());
        assert_eq!(gateway.count("list_pending"), 0);
        assert_eq!(store.snapshot().error.as_deref(), Some("request failed: refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_success_notifies_refreshes_and_expires() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_discovery(Ok(json!({
            "pollers": {"seek": {"jobs_added": 2}, "indeed": {"jobs_added": 0}}
        })));

        let summary = store.discover_jobs().await.expect("discover");
        assert_eq!(summary.message, "Discovered 2 jobs! (2 from SEEK)");
        assert_eq!(summary.total, 2);

        let state = store.snapshot();
        let notice = state.discovery_notification.expect("notice");
        assert_eq!(notice.kind, NoticeKind::Success);
        assert_eq!(notice.message, "Discovered 2 jobs! (2 from SEEK)");
        assert!(!state.loading.discovering);
        assert_eq!(
            gateway.calls(),
            vec!["discover", "list_jobs:*", "pipeline_status", "list_pending:20"]
        );

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert!(store.snapshot().discovery_notification.is_some());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(store.snapshot().discovery_notification, None);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_refreshes_run_concurrently() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(100, Ok(Vec::new()));
        gateway.script_pipeline(100, Ok(PipelineSnapshot::default()));
        gateway.script_pending(100, Ok(Vec::new()));

        let started = tokio::time::Instant::now();
        store.discover_jobs().await.expect("discover");
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!store.snapshot().loading.any());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_notice_supersedes_older_expiry() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_discovery(Ok(json!({"pollers": {"seek": {"jobs_added": 1}}})));
        gateway.script_discovery(Ok(json!({"pollers": {"seek": {"jobs_added": 0}}})));

        store.discover_jobs().await.expect("first discover");
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        store.discover_jobs().await.expect("second discover");

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let notice = store.snapshot().discovery_notification.expect("second notice");
        assert_eq!(notice.message, "Discovery completed: 0 from SEEK");

        tokio::time::sleep(Duration::from_millis(2_501)).await;
        assert_eq!(store.snapshot().discovery_notification, None);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_failure_prefers_server_message() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_discovery(Err(GatewayError::Status {
            status: 503,
            message: Some("pollers busy".to_string()),
        }));

        let err = store.discover_jobs().await.expect_err("discover fails");
        assert_eq!(err.to_string(), "server returned 503: pollers busy");

        let state = store.snapshot();
        let notice = state.discovery_notification.clone().expect("notice");
        assert_eq!(notice.kind, NoticeKind::Error);
        assert_eq!(notice.message, "pollers busy");
        assert_eq!(state.error.as_deref(), Some("server returned 503: pollers busy"));
        assert!(!state.loading.discovering);
        assert_eq!(gateway.calls(), vec!["discover"]);

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert_eq!(store.snapshot().discovery_notification, None);
    }

    #[tokio::test]
    async fn discovery_failure_falls_back_to_transport_error() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_discovery(Err(transport("connection refused")));
        assert!(store.discover_jobs().await.is_err());
        let notice = store.snapshot().discovery_notification.expect("notice");
        assert_eq!(notice.message, "request failed: connection refused");
    }

    #[tokio::test]
    async fn job_update_patches_then_refresh_overwrites() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        gateway.script_jobs(
            0,
            Ok(vec![job("1", JobStatus::Pending), job("2", JobStatus::Pending)]),
        );
        store.refresh_jobs().await;

        gateway.script_jobs(
            0,
            Ok(vec![
                job("1", JobStatus::Completed),
                job("2", JobStatus::Pending),
                job("3", JobStatus::Matched),
            ]),
        );
        feed.dispatch_frame(&frame(json!({
            "type": "job_update", "job_id": 1, "status": "completed", "action": "approve"
        })));

        let patched = store.snapshot();
        assert_eq!(patched.jobs.len(), 2);
        assert_eq!(patched.jobs[0].status, JobStatus::Completed);

        wait_until("jobs refreshed", || store.snapshot().jobs.len() == 3).await;
        wait_until("pending refreshed", || gateway.count("list_pending") == 1).await;
        assert_eq!(store.snapshot().jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn job_update_for_unknown_job_still_refreshes() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        feed.dispatch_frame(&frame(json!({
            "type": "job_update", "job_id": "99", "status": "failed"
        })));
        assert!(store.snapshot().jobs.is_empty());
        wait_until("jobs refreshed", || gateway.count("list_jobs") == 1).await;
        tokio::task::yield_now().await;
        assert_eq!(gateway.count("list_pending"), 0);
    }

    #[tokio::test]
    async fn job_update_without_status_skips_patch_but_refreshes() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        gateway.script_jobs(
            0,
            Ok(vec![job("5", JobStatus::Pending), job("6", JobStatus::Pending)]),
        );
        store.refresh_jobs().await;

        feed.dispatch_frame(&frame(json!({"type": "job_update", "job_id": 5})));
        feed.dispatch_frame(&frame(json!({
            "type": "job_update", "job_id": 6, "status": null, "action": "approve"
        })));
        let unpatched = store.snapshot();
        assert_eq!(unpatched.jobs[0].status, JobStatus::Pending);
        assert_eq!(unpatched.jobs[1].status, JobStatus::Pending);

        wait_until("jobs refreshed", || gateway.count("list_jobs") == 3).await;
        wait_until("pending refreshed", || gateway.count("list_pending") == 1).await;
    }

    #[tokio::test]
    async fn other_pushes_trigger_targeted_refreshes() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        feed.dispatch_frame(&frame(json!({"type": "job_retry", "job_id": 4})));
        feed.dispatch_frame(&frame(json!({"type": "job_discovery_complete"})));
        feed.dispatch_frame(&frame(json!({"type": "pipeline_update", "stage": "scoring"})));

        wait_until("refreshes issued", || gateway.calls().len() == 3).await;
        assert_eq!(gateway.count("list_jobs"), 2);
        assert_eq!(gateway.count("pipeline_status"), 1);
        assert_eq!(gateway.count("list_pending"), 0);
    }

    #[tokio::test]
    async fn unknown_or_untyped_pushes_do_nothing() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        feed.dispatch_frame(&frame(json!({"type": "heartbeat"})));
        feed.dispatch_frame(&frame(json!({"job_id": 1, "status": "failed"})));
        feed.dispatch_frame(b"not json at all");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gateway.calls().is_empty());
        assert_eq!(store.snapshot(), DashboardState::default());
    }

    #[tokio::test]
    async fn initialize_without_feed_still_pulls() {
        let (gateway, feed, store) = offline_store();
        store.initialize().await;

        let state = store.snapshot();
        assert_eq!(state.connection_status, ConnectionState::Disconnected);
        assert_eq!(gateway.count("list_jobs"), 1);
        assert_eq!(gateway.count("pipeline_status"), 1);
        assert_eq!(gateway.count("list_pending:20"), 1);
        for event_type in PUSH_EVENT_TYPES {
            assert_eq!(feed.handler_count(event_type), 1);
        }

        store.initialize().await;
        assert_eq!(feed.handler_count(JOB_UPDATE), 1);

        store.cleanup();
        for event_type in PUSH_EVENT_TYPES {
            assert_eq!(feed.handler_count(event_type), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn liveness_poll_tracks_feed_and_respects_cleanup() {
        let mut server = TestFeedServer::launch().await;
        let gateway = Arc::new(ScriptedGateway::default());
        let feed = FeedConnection::new(feed_config(&server.url(), 10_000, 3));
        let store = store_with(&gateway, &feed);

        store.initialize().await;
        assert_eq!(store.snapshot().connection_status, ConnectionState::Connected);

        let client = server.next_client().await;
        drop(client);
        wait_until("status reconciled to reconnecting", || {
            store.snapshot().connection_status == ConnectionState::Reconnecting
        })
        .await;

        store.cleanup();
        assert_eq!(store.snapshot().connection_status, ConnectionState::Disconnected);
        assert!(!feed.has_pending_reconnect());

        feed.connect().await.expect("reconnect outside the store");
        store.reconcile_connection_status();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.snapshot().connection_status, ConnectionState::Disconnected);
        feed.disconnect();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn liveness_promotes_disconnected_once_feed_is_up() {
        let mut server = TestFeedServer::launch().await;
        let gateway = Arc::new(ScriptedGateway::default());
        let feed = FeedConnection::new(feed_config(&server.url(), 10_000, 3));
        let store = store_with(&gateway, &feed);
        assert_eq!(store.snapshot().connection_status, ConnectionState::Disconnected);

        feed.connect().await.expect("connect");
        let _client = server.next_client().await;
        store.reconcile_connection_status();
        assert_eq!(store.snapshot().connection_status, ConnectionState::Connected);
        feed.disconnect();
    }

    #[tokio::test]
    async fn job_stats_follow_current_jobs() {
        let (gateway, _feed, store) = offline_store();
        gateway.script_jobs(
            0,
            Ok(vec![
                job("1", JobStatus::Pending),
                job("2", JobStatus::Failed),
                job("3", JobStatus::Completed),
                job("4", JobStatus::Rejected),
                job("5", JobStatus::Other("scraped".to_string())),
            ]),
        );
        store.refresh_jobs().await;
        let stats = store.job_stats();
        assert_eq!(
            (stats.total, stats.pending, stats.applied, stats.rejected),
            (5, 2, 1, 1)
        );

        gateway.script_jobs(0, Err(transport("down")));
        store.refresh_jobs().await;
        assert_eq!(store.job_stats(), JobStats::default());
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let (gateway, _feed, store) = offline_store();
        let mut updates = store.subscribe();
        gateway.script_pending(0, Ok(vec![job("1", JobStatus::Matched)]));
        store.refresh_pending().await;
        assert!(updates.has_changed().expect("sender alive"));
        assert_eq!(updates.borrow_and_update().pending.len(), 1);
    }

    #[tokio::test]
    async fn dropped_store_leaves_feed_handlers_inert() {
        let (gateway, feed, store) = offline_store();
        store.attach_push_handlers();
        drop(store);
        feed.dispatch_frame(&frame(json!({"type": "job_retry"})));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gateway.calls().is_empty());
    }
}
