//! The process-wide session coordinator.
//!
//! One actor task owns the only `Session` and is the only writer of the daily
//! counter during live operation. Every inbound message is handled to
//! completion, storage round-trips included, before the next one is looked
//! at, which is what keeps concurrent tabs from double counting.

mod delivery;

pub use delivery::{DeliveryError, DirectiveSender, ObserverLease, RetryPolicy, TabRegistry};

use crate::{
    observer::is_short_form_url,
    protocol::{
        DashboardStatus, Directive, HeartbeatReply, LimitStatus, Request, Response, StatsReply,
        TabId, TabRef, WindowId,
    },
    usage::{Settings, UsageRecord, UsageStore},
};
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

const INBOX_CAPACITY: usize = 256;
/// Time credited past an observer's last report when finalizing on its behalf.
const STALE_REPORT_GRACE_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Tracking(TabId),
}

#[derive(Debug, Clone)]
struct Session {
    tab_id: TabId,
    started_at: DateTime<Utc>,
    last_saved_offset: u64,
    last_reported: u64,
    last_report_at: DateTime<Utc>,
}

impl Session {
    fn new(tab_id: TabId, now: DateTime<Utc>) -> Self {
        Self {
            tab_id,
            started_at: now,
            last_saved_offset: 0,
            last_reported: 0,
            last_report_at: now,
        }
    }

    /// Elapsed seconds the coordinator is willing to vouch for without a
    /// fresh report from the observer.
    fn implied_elapsed(&self, now: DateTime<Utc>) -> u64 {
        let silent = (now - self.last_report_at).num_seconds().max(0) as u64;
        self.last_reported + silent.min(STALE_REPORT_GRACE_SECS)
    }
}

struct Envelope {
    request: Request,
    reply: oneshot::Sender<Response>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session coordinator has shut down")]
    Closed,
    #[error("session coordinator dropped the reply")]
    NoReply,
}

/// Cheap, cloneable handle for sending messages to the coordinator.
#[derive(Clone)]
pub struct CoordinatorClient {
    tx: mpsc::Sender<Envelope>,
}

impl CoordinatorClient {
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::NoReply)
    }

    pub async fn stats(&self) -> Result<StatsReply, ClientError> {
        match self.request(Request::GetCurrentStats).await? {
            Response::Stats(stats) => Ok(*stats),
            other => {
                tracing::warn!(?other, "unexpected reply to GET_CURRENT_STATS");
                Err(ClientError::NoReply)
            }
        }
    }
}

pub struct CoordinatorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Stops the actor after it finalizes any active session.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "session coordinator task failed");
        }
    }
}

pub fn spawn_coordinator(
    store: UsageStore,
    directives: DirectiveSender,
    rollover_every: Duration,
) -> (CoordinatorHandle, CoordinatorClient) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let coordinator = SessionCoordinator::new(store, directives);
    let join = tokio::spawn(coordinator.run(rx, shutdown_rx, rollover_every));
    (
        CoordinatorHandle {
            shutdown: Some(shutdown_tx),
            join,
        },
        CoordinatorClient { tx },
    )
}

pub struct SessionCoordinator {
    store: UsageStore,
    directives: DirectiveSender,
    session: Option<Session>,
    dashboard_open: bool,
    dashboard_window: Option<WindowId>,
    window_focused: bool,
    foreground_tab: Option<TabId>,
    notified_on: Option<NaiveDate>,
}

impl SessionCoordinator {
    pub fn new(store: UsageStore, directives: DirectiveSender) -> Self {
        Self {
            store,
            directives,
            session: None,
            dashboard_open: false,
            dashboard_window: None,
            window_focused: true,
            foreground_tab: None,
            notified_on: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        match &self.session {
            Some(session) => CoordinatorState::Tracking(session.tab_id),
            None => CoordinatorState::Idle,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Envelope>,
        mut shutdown: oneshot::Receiver<()>,
        rollover_every: Duration,
    ) {
        let mut ticker = time::interval(rollover_every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(Envelope { request, reply }) = envelope else {
                        break;
                    };
                    let response = self.handle(request).await;
                    let _ = reply.send(response);
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.store.rollover_if_new_day().await {
                        tracing::warn!(error = %err, "daily rollover check failed");
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        let now = self.now();
        if let Some(session) = self.session.take() {
            tracing::info!(tab_id = session.tab_id, "finalizing active session on shutdown");
            self.finalize(session, now, None).await;
        }
    }

    pub async fn handle(&mut self, request: Request) -> Response {
        tracing::trace!(kind = request.kind(), "coordinator message");
        match request {
            Request::Start { tab_id, url, .. } => self.on_start(tab_id, &url).await,
            Request::Heartbeat {
                tab_id,
                elapsed_seconds,
                url,
            } => Response::Heartbeat(self.on_heartbeat(tab_id, elapsed_seconds, &url).await),
            Request::End {
                tab_id,
                elapsed_seconds,
                ..
            } => self.on_end(tab_id, elapsed_seconds).await,
            Request::CheckLimit { tab_id } => Response::Limit(self.check_limit(tab_id).await),
            Request::GetCurrentStats => Response::Stats(Box::new(self.current_stats().await)),
            Request::IsDashboardOpen => Response::Dashboard(DashboardStatus {
                dashboard_open: self.dashboard_open,
            }),
            Request::DashboardOpened { window_id } => {
                self.dashboard_open = true;
                self.dashboard_window = window_id;
                tracing::debug!(?window_id, "dashboard opened");
                Response::ack(true)
            }
            Request::DashboardClosed => {
                self.on_dashboard_closed();
                Response::ack(true)
            }
            Request::ManualReset { clear_history } => self.on_manual_reset(clear_history).await,
            Request::UpdateSettings {
                daily_limit_seconds,
                redirect_url,
            } => match self
                .store
                .update_settings(daily_limit_seconds, redirect_url)
                .await
            {
                Ok(_) => Response::ack(true),
                Err(err) => {
                    tracing::warn!(error = %err, "rejected settings update");
                    Response::ack(false)
                }
            },
            Request::TabRemoved { tab_id } => {
                self.on_tab_removed(tab_id).await;
                Response::ack(true)
            }
            Request::TabActivated {
                tab_id,
                window_id,
                url,
            } => {
                self.on_tab_activated(tab_id, window_id, url.as_deref());
                Response::ack(true)
            }
            Request::TabUpdated { tab_id, url } => {
                self.directives.registry().note_url(tab_id, &url);
                if is_short_form_url(&url) {
                    self.directives.dispatch(tab_id, Directive::CheckState);
                }
                Response::ack(true)
            }
            Request::WindowFocusChanged {
                window_id,
                active_tab,
            } => {
                self.on_window_focus(window_id, active_tab);
                Response::ack(true)
            }
        }
    }

    async fn on_start(&mut self, tab_id: TabId, url: &str) -> Response {
        self.directives.registry().note_url(tab_id, url);

        let (record, settings) = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(tab_id, error = %err, "storage unavailable, START not accepted");
                return Response::ack(false);
            }
        };

        if settings.limit_reached(&record) {
            tracing::info!(tab_id, "START rejected, daily limit already reached");
            if self.session.as_ref().is_some_and(|s| s.tab_id == tab_id) {
                self.session = None;
            }
            self.enforce_limit(tab_id, &settings);
            return Response::ack(false);
        }

        let now = self.now();
        match self.session.take() {
            Some(current) if current.tab_id == tab_id => {
                self.session = Some(current);
                return Response::ack(true);
            }
            Some(previous) => {
                tracing::info!(
                    from = previous.tab_id,
                    to = tab_id,
                    "switching tracked tab"
                );
                self.finalize(previous, now, None).await;
            }
            None => {}
        }

        self.session = Some(Session::new(tab_id, now));
        tracing::info!(tab_id, %url, "session started");
        Response::ack(true)
    }

    async fn on_heartbeat(&mut self, tab_id: TabId, elapsed: u64, url: &str) -> HeartbeatReply {
        let now = self.now();
        let Some(session) = self.session.as_mut().filter(|s| s.tab_id == tab_id) else {
            tracing::debug!(tab_id, "heartbeat from untracked tab ignored");
            return HeartbeatReply::keep_going();
        };
        self.directives.registry().note_url(tab_id, url);

        if elapsed >= session.last_reported {
            session.last_reported = elapsed;
            session.last_report_at = now;
        }

        let delta = elapsed.saturating_sub(session.last_saved_offset);
        if delta >= 1 {
            match self.store.commit_elapsed(delta).await {
                Ok(outcome) => {
                    if let Some(session) = self.session.as_mut() {
                        session.last_saved_offset = elapsed;
                    }
                    if outcome.limit_reached() {
                        return self.limit_hit(tab_id, &outcome.settings, &outcome.record);
                    }
                }
                Err(err) => {
                    tracing::warn!(tab_id, error = %err, "failed to commit heartbeat");
                }
            }
            return HeartbeatReply::keep_going();
        }

        match self.store.snapshot().await {
            Ok((record, settings)) if settings.limit_reached(&record) => {
                self.limit_hit(tab_id, &settings, &record)
            }
            Ok(_) => HeartbeatReply::keep_going(),
            Err(err) => {
                tracing::warn!(tab_id, error = %err, "limit check failed");
                HeartbeatReply::keep_going()
            }
        }
    }

    fn limit_hit(
        &mut self,
        tab_id: TabId,
        settings: &Settings,
        record: &UsageRecord,
    ) -> HeartbeatReply {
        if let Some(session) = self.session.take() {
            let watched = (self.now() - session.started_at).num_seconds().max(0);
            tracing::info!(
                tab_id,
                watched,
                daily_time = record.daily_time_seconds,
                "daily limit reached, session closed"
            );
        }
        self.enforce_limit(tab_id, settings);
        HeartbeatReply::redirect(settings.redirect_url.clone())
    }

    async fn on_end(&mut self, tab_id: TabId, elapsed: Option<u64>) -> Response {
        match self.session.take() {
            Some(session) if session.tab_id == tab_id => {
                let now = self.now();
                self.finalize(session, now, elapsed).await;
                tracing::info!(tab_id, "session ended");
            }
            other => {
                self.session = other;
                tracing::debug!(tab_id, "END from untracked tab ignored");
            }
        }
        Response::ack(true)
    }

    async fn on_tab_removed(&mut self, tab_id: TabId) {
        self.directives.registry().forget(tab_id);
        if self.foreground_tab == Some(tab_id) {
            self.foreground_tab = None;
        }
        match self.session.take() {
            Some(session) if session.tab_id == tab_id => {
                let now = self.now();
                self.finalize(session, now, None).await;
                tracing::info!(tab_id, "tracked tab closed, session finalized");
            }
            other => self.session = other,
        }
    }

    fn on_tab_activated(&mut self, tab_id: TabId, window_id: WindowId, url: Option<&str>) {
        if let Some(url) = url {
            self.directives.registry().note_url(tab_id, url);
        }
        self.foreground_tab = Some(tab_id);
        self.window_focused = true;
        if self.dashboard_window == Some(window_id) && self.dashboard_open {
            return;
        }

        if let CoordinatorState::Tracking(tracked) = self.state() {
            if tracked != tab_id && !self.dashboard_open {
                tracing::info!(tracked, activated = tab_id, "tab switched away, pausing");
                self.directives.dispatch(tracked, Directive::Pause);
            }
        }
        self.check_state_if_qualifying(tab_id);
    }

    fn on_window_focus(&mut self, window_id: Option<WindowId>, active_tab: Option<TabRef>) {
        let Some(window_id) = window_id else {
            self.window_focused = false;
            if let CoordinatorState::Tracking(tracked) = self.state() {
                if self.dashboard_open {
                    tracing::debug!(tracked, "window blurred while dashboard open, still tracking");
                } else {
                    tracing::info!(tracked, "window lost focus, pausing");
                    self.directives.dispatch(tracked, Directive::Pause);
                }
            }
            return;
        };

        if self.dashboard_open && self.dashboard_window == Some(window_id) {
            return;
        }
        self.window_focused = true;
        if let Some(tab) = active_tab {
            if let Some(url) = tab.url.as_deref() {
                self.directives.registry().note_url(tab.tab_id, url);
            }
            self.foreground_tab = Some(tab.tab_id);
            self.check_state_if_qualifying(tab.tab_id);
        }
    }

    fn on_dashboard_closed(&mut self) {
        self.dashboard_open = false;
        self.dashboard_window = None;
        tracing::debug!("dashboard closed");

        let CoordinatorState::Tracking(tracked) = self.state() else {
            return;
        };
        let backgrounded = self.foreground_tab.is_some_and(|tab| tab != tracked);
        if !self.window_focused || backgrounded {
            tracing::info!(tracked, "dashboard closed with tracked tab inactive, pausing");
            self.directives.dispatch(tracked, Directive::Pause);
        }
    }

    async fn on_manual_reset(&mut self, clear_history: bool) -> Response {
        if let Some(session) = self.session.take() {
            tracing::info!(tab_id = session.tab_id, "manual reset discards active session");
        }
        match self.store.reset_today(clear_history).await {
            Ok(()) => Response::ack(true),
            Err(err) => {
                tracing::warn!(error = %err, "manual reset failed");
                Response::ack(false)
            }
        }
    }

    async fn check_limit(&self, tab_id: Option<TabId>) -> LimitStatus {
        match self.store.snapshot().await {
            Ok((record, settings)) => {
                let limit_reached = settings.limit_reached(&record);
                if limit_reached {
                    tracing::debug!(?tab_id, "limit check: reached");
                }
                LimitStatus {
                    limit_reached,
                    redirect_url: limit_reached.then_some(settings.redirect_url),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "limit check failed");
                LimitStatus {
                    limit_reached: false,
                    redirect_url: None,
                }
            }
        }
    }

    async fn current_stats(&self) -> StatsReply {
        let (stats, settings) = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "stats read failed, reporting defaults");
                (
                    UsageRecord::fresh(self.store.clock().today()),
                    Settings::default(),
                )
            }
        };
        StatsReply {
            stats,
            settings,
            tracking_tab_id: self.session.as_ref().map(|s| s.tab_id),
        }
    }

    /// Commits whatever the session has not committed yet. Always runs to
    /// completion once started.
    async fn finalize(&mut self, session: Session, now: DateTime<Utc>, reported: Option<u64>) {
        let elapsed = reported.unwrap_or_else(|| session.implied_elapsed(now));
        let remainder = elapsed.saturating_sub(session.last_saved_offset);
        if remainder == 0 {
            return;
        }
        match self.store.commit_elapsed(remainder).await {
            Ok(outcome) => tracing::debug!(
                tab_id = session.tab_id,
                remainder,
                committed = outcome.committed,
                daily_time = outcome.record.daily_time_seconds,
                "session finalized"
            ),
            Err(err) => {
                tracing::warn!(tab_id = session.tab_id, error = %err, "failed to commit session remainder")
            }
        }
    }

    /// Notifies once per day and redirects only the tab that asked.
    fn enforce_limit(&mut self, tab_id: TabId, settings: &Settings) {
        let on_short_form = self
            .directives
            .registry()
            .url(tab_id)
            .map_or(true, |url| is_short_form_url(&url));
        if !on_short_form {
            return;
        }

        let host = self.directives.host().clone();
        if let Err(err) = host.redirect_tab(tab_id, &settings.redirect_url) {
            tracing::debug!(tab_id, error = %err, "redirect not delivered to browser");
        }

        let today = self.store.clock().today();
        if self.notified_on != Some(today) {
            self.notified_on = Some(today);
            if let Err(err) = host.notify(
                "Daily Shorts limit reached",
                "You have used today's Shorts budget. Redirecting to your chosen page.",
            ) {
                tracing::debug!(error = %err, "limit notification not delivered");
            }
        }
    }

    fn check_state_if_qualifying(&self, tab_id: TabId) {
        let qualifies = self
            .directives
            .registry()
            .url(tab_id)
            .is_some_and(|url| is_short_form_url(&url));
        if qualifies {
            self.directives.dispatch(tab_id, Directive::CheckState);
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.store.clock().now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        host::ShimHost,
        protocol::HostCommand,
        storage::Storage,
    };
    use chrono::NaiveDate;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tokio::sync::broadcast;

    const SHORT_A: &str = "https://www.youtube.com/shorts/aaaaaaaaaaa";
    const SHORT_B: &str = "https://www.youtube.com/shorts/bbbbbbbbbbb";
    const REDIRECT: &str = "https://example.test/go-outside";

    struct Harness {
        coordinator: SessionCoordinator,
        clock: ManualClock,
        registry: TabRegistry,
        commands: broadcast::Receiver<HostCommand>,
        store: UsageStore,
        _db: NamedTempFile,
    }

    async fn harness(limit: u64) -> Harness {
        let db = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        let clock = ManualClock::new(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        let store = UsageStore::new(storage, Arc::new(clock.clone()));
        store.rollover_if_new_day().await.unwrap();
        store
            .seed_settings(Settings {
                daily_limit_seconds: limit,
                redirect_url: REDIRECT.to_string(),
            })
            .await
            .unwrap();

        let host = ShimHost::new();
        let commands = host.subscribe();
        let registry = TabRegistry::default();
        let directives = DirectiveSender::new(
            registry.clone(),
            Arc::new(host),
            RetryPolicy::new(3, Duration::from_millis(5)),
            Duration::from_millis(5),
        );
        Harness {
            coordinator: SessionCoordinator::new(store.clone(), directives),
            clock,
            registry,
            commands,
            store,
            _db: db,
        }
    }

    impl Harness {
        async fn start(&mut self, tab_id: TabId, url: &str) -> Response {
            let timestamp = self.clock.now();
            self.coordinator
                .handle(Request::Start {
                    tab_id,
                    timestamp,
                    url: url.to_string(),
                })
                .await
        }

        async fn heartbeat(&mut self, tab_id: TabId, elapsed: u64) -> Response {
            self.coordinator
                .handle(Request::Heartbeat {
                    tab_id,
                    elapsed_seconds: elapsed,
                    url: SHORT_A.to_string(),
                })
                .await
        }

        async fn end(&mut self, tab_id: TabId, elapsed: u64) -> Response {
            self.coordinator
                .handle(Request::End {
                    tab_id,
                    start_time: None,
                    end_time: None,
                    elapsed_seconds: Some(elapsed),
                    url: SHORT_A.to_string(),
                })
                .await
        }

        async fn daily_time(&self) -> u64 {
            self.store.snapshot().await.unwrap().0.daily_time_seconds
        }
    }

    fn keep_going() -> Response {
        Response::Heartbeat(HeartbeatReply::keep_going())
    }

    #[tokio::test]
    async fn heartbeat_clamps_and_redirects_at_limit() {
        let mut h = harness(60).await;
        assert_eq!(h.start(1, SHORT_A).await, Response::ack(true));

        h.clock.advance_secs(30);
        assert_eq!(h.heartbeat(1, 30).await, keep_going());
        assert_eq!(h.daily_time().await, 30);

        h.clock.advance_secs(35);
        assert_eq!(
            h.heartbeat(1, 65).await,
            Response::Heartbeat(HeartbeatReply::redirect(REDIRECT.to_string()))
        );
        assert_eq!(h.daily_time().await, 60);
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);

        assert_eq!(
            h.commands.recv().await.unwrap(),
            HostCommand::RedirectTab {
                tab_id: 1,
                url: REDIRECT.to_string()
            }
        );
        assert!(matches!(
            h.commands.recv().await.unwrap(),
            HostCommand::Notify { .. }
        ));
    }

    #[tokio::test]
    async fn monotonic_heartbeats_commit_each_second_once() {
        let mut h = harness(1000).await;
        h.start(1, SHORT_A).await;
        for elapsed in [1, 2, 2, 5, 5, 9, 14] {
            h.clock.advance_secs(1);
            assert_eq!(h.heartbeat(1, elapsed).await, keep_going());
        }
        assert_eq!(h.daily_time().await, 14);

        h.end(1, 14).await;
        assert_eq!(h.daily_time().await, 14);
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn start_on_second_tab_finalizes_first_once() {
        let mut h = harness(1000).await;
        h.start(1, SHORT_A).await;
        h.clock.advance_secs(10);
        h.heartbeat(1, 10).await;
        h.clock.advance_secs(1);

        assert_eq!(h.start(2, SHORT_B).await, Response::ack(true));
        assert_eq!(h.coordinator.state(), CoordinatorState::Tracking(2));
        assert_eq!(h.daily_time().await, 11);

        // Tab 1 has not heard about the switch yet.
        assert_eq!(h.heartbeat(1, 12).await, keep_going());
        h.end(1, 13).await;
        assert_eq!(h.daily_time().await, 11);
        assert_eq!(h.coordinator.state(), CoordinatorState::Tracking(2));
    }

    #[tokio::test]
    async fn interleaved_starts_and_ends_keep_one_session() {
        let mut h = harness(10_000).await;
        let script: &[(TabId, bool)] = &[
            (1, true),
            (2, true),
            (1, false),
            (3, true),
            (2, false),
            (2, true),
            (3, false),
            (2, false),
            (4, true),
        ];
        for &(tab, is_start) in script {
            h.clock.advance_secs(1);
            if is_start {
                h.start(tab, SHORT_A).await;
                assert_eq!(h.coordinator.state(), CoordinatorState::Tracking(tab));
            } else {
                let before = h.coordinator.state();
                h.end(tab, 1).await;
                if before == CoordinatorState::Tracking(tab) {
                    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
                } else {
                    assert_eq!(h.coordinator.state(), before);
                }
            }
        }
        assert_eq!(h.coordinator.state(), CoordinatorState::Tracking(4));
    }

    #[tokio::test]
    async fn start_after_limit_is_rejected_with_redirect() {
        let mut h = harness(10).await;
        h.store.commit_elapsed(10).await.unwrap();

        assert_eq!(h.start(5, SHORT_A).await, Response::ack(false));
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(
            h.commands.recv().await.unwrap(),
            HostCommand::RedirectTab {
                tab_id: 5,
                url: REDIRECT.to_string()
            }
        );

        let limit = h
            .coordinator
            .handle(Request::CheckLimit { tab_id: Some(5) })
            .await;
        assert_eq!(
            limit,
            Response::Limit(LimitStatus {
                limit_reached: true,
                redirect_url: Some(REDIRECT.to_string())
            })
        );
    }

    #[tokio::test]
    async fn heartbeat_after_limit_redirects_only_that_tab() {
        let mut h = harness(20).await;
        h.start(1, SHORT_A).await;
        h.heartbeat(1, 20).await;
        // Drain the first redirect and notification.
        h.commands.recv().await.unwrap();
        h.commands.recv().await.unwrap();

        assert_eq!(h.start(2, SHORT_B).await, Response::ack(false));
        assert_eq!(
            h.commands.recv().await.unwrap(),
            HostCommand::RedirectTab {
                tab_id: 2,
                url: REDIRECT.to_string()
            }
        );
        // Notification is once per day.
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_tracked_tab_commits_remainder() {
        let mut h = harness(1000).await;
        h.start(1, SHORT_A).await;
        h.clock.advance_secs(5);
        h.heartbeat(1, 5).await;
        h.clock.advance_secs(30);

        h.coordinator
            .handle(Request::TabRemoved { tab_id: 1 })
            .await;
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        // Only the grace period beyond the last report is credited.
        assert_eq!(h.daily_time().await, 5 + STALE_REPORT_GRACE_SECS);
    }

    #[tokio::test]
    async fn dashboard_suppresses_pause_until_closed() {
        let mut h = harness(1000).await;
        let (_lease, mut directives) = h.registry.attach(1);
        h.start(1, SHORT_A).await;

        h.coordinator
            .handle(Request::DashboardOpened { window_id: Some(99) })
            .await;
        h.coordinator
            .handle(Request::WindowFocusChanged {
                window_id: None,
                active_tab: None,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(directives.try_recv().is_err());

        h.coordinator.handle(Request::DashboardClosed).await;
        let directive = tokio::time::timeout(Duration::from_secs(1), directives.recv())
            .await
            .unwrap();
        assert_eq!(directive, Some(Directive::Pause));
        // Coordinator waits for the observer's END.
        assert_eq!(h.coordinator.state(), CoordinatorState::Tracking(1));
    }

    #[tokio::test]
    async fn switching_tabs_pauses_tracked_and_checks_new() {
        let mut h = harness(1000).await;
        let (_lease1, mut first) = h.registry.attach(1);
        let (_lease2, mut second) = h.registry.attach(2);
        h.registry.note_url(2, SHORT_B);
        h.start(1, SHORT_A).await;

        h.coordinator
            .handle(Request::TabActivated {
                tab_id: 2,
                window_id: 1,
                url: Some(SHORT_B.to_string()),
            })
            .await;

        let paused = tokio::time::timeout(Duration::from_secs(1), first.recv())
            .await
            .unwrap();
        assert_eq!(paused, Some(Directive::Pause));
        let checked = tokio::time::timeout(Duration::from_secs(1), second.recv())
            .await
            .unwrap();
        assert_eq!(checked, Some(Directive::CheckState));
    }

    #[tokio::test]
    async fn manual_reset_drops_session_without_commit() {
        let mut h = harness(1000).await;
        h.start(1, SHORT_A).await;
        h.clock.advance_secs(8);
        h.heartbeat(1, 8).await;

        let reply = h
            .coordinator
            .handle(Request::ManualReset {
                clear_history: false,
            })
            .await;
        assert_eq!(reply, Response::ack(true));
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
        assert_eq!(h.daily_time().await, 0);

        h.end(1, 20).await;
        assert_eq!(h.daily_time().await, 0);
    }

    #[tokio::test]
    async fn spawned_coordinator_finalizes_on_shutdown() {
        let h = harness(1000).await;
        let store = h.store.clone();
        let clock = h.clock.clone();
        let (handle, client) = spawn_coordinator(
            h.store.clone(),
            h.coordinator.directives.clone(),
            Duration::from_secs(60),
        );

        client
            .request(Request::Start {
                tab_id: 3,
                timestamp: clock.now(),
                url: SHORT_A.to_string(),
            })
            .await
            .unwrap();
        clock.advance_secs(4);
        client
            .request(Request::Heartbeat {
                tab_id: 3,
                elapsed_seconds: 4,
                url: SHORT_A.to_string(),
            })
            .await
            .unwrap();
        clock.advance_secs(1);

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.tracking_tab_id, Some(3));
        assert_eq!(stats.stats.daily_time_seconds, 4);

        handle.shutdown().await;
        assert_eq!(store.snapshot().await.unwrap().0.daily_time_seconds, 5);
        assert!(matches!(
            client.request(Request::IsDashboardOpen).await,
            Err(ClientError::Closed) | Err(ClientError::NoReply)
        ));
    }
}
