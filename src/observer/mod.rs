//! Per-tab playback observer.
//!
//! [`PageObserver`] is a synchronous state machine fed with page samples,
//! user input, dashboard status and coordinator directives; every input
//! returns the lifecycle messages to send. [`run_observer`] drives one
//! against a live coordinator.

mod detect;

pub use detect::{
    ContentQualifier, DetectionStrategy, MediaElement, MediaState, PLATFORM_HOSTS,
    PROGRESS_STALL, PageSnapshot, PlayButtonLabel, PlaybackDetector, ProgressAdvance,
    is_short_form_url,
};

use crate::{
    protocol::{Directive, HeartbeatReply, LimitStatus, Request, Response, TabId},
    session::CoordinatorClient,
};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Watching without any pointer, key, scroll or touch input for this long
/// stops the session.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Loops only stop the session once input has been absent this long.
pub const LOOP_QUIET_PERIOD: Duration = Duration::from_secs(10);
const LOOP_LIMIT: u32 = 2;
/// A position below this after being past it means the clip restarted.
const LOOP_RESTART_SECS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    NotWatching,
    Watching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Qualification, playback or window activity no longer holds.
    Conditions,
    Idle,
    Looping,
    Paused,
    LimitReached,
    Unload,
}

impl StopReason {
    /// Forced stops hold the observer in `NotWatching` until something
    /// releases them; plain condition changes do not.
    fn latches(self) -> bool {
        !matches!(self, StopReason::Conditions | StopReason::Unload)
    }
}

/// Lifecycle messages produced by the observer, in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    Start,
    Heartbeat { elapsed_seconds: u64 },
    End { elapsed_seconds: u64 },
}

pub struct PageObserver {
    qualifier: ContentQualifier,
    detector: Box<dyn PlaybackDetector>,
    state: ObserverState,
    page: PageSnapshot,
    dashboard_open: bool,
    watch_started: Option<Instant>,
    last_heartbeat: Option<Instant>,
    last_input: Instant,
    loops: u32,
    last_position: Option<f64>,
    latch: Option<StopReason>,
}

impl PageObserver {
    pub fn new(strategy: DetectionStrategy, now: Instant) -> Self {
        Self::with_detector(strategy.detector(), now)
    }

    pub fn with_detector(detector: Box<dyn PlaybackDetector>, now: Instant) -> Self {
        Self {
            qualifier: ContentQualifier,
            detector,
            state: ObserverState::NotWatching,
            page: PageSnapshot::default(),
            dashboard_open: false,
            watch_started: None,
            last_heartbeat: None,
            last_input: now,
            loops: 0,
            last_position: None,
            latch: None,
        }
    }

    pub fn state(&self) -> ObserverState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.page.url
    }

    pub fn latched(&self) -> Option<StopReason> {
        self.latch
    }

    /// Page visible and focused, or the dashboard is covering for it.
    pub fn window_active(&self) -> bool {
        self.dashboard_open || self.page_active()
    }

    fn page_active(&self) -> bool {
        self.page.active()
    }

    /// New page sample: a timer poll, a player DOM mutation, a navigation or
    /// a visibility/focus change.
    pub fn observe(&mut self, page: PageSnapshot, now: Instant) -> Vec<Emit> {
        let navigated = page.url != self.page.url;
        let regained = !self.page_active() && page.active();

        if navigated {
            tracing::debug!(from = %self.page.url, to = %page.url, "page navigated");
            self.latch = None;
            self.loops = 0;
            self.last_position = page.position();
            self.detector.reset();
        } else {
            self.track_loop(&page);
        }
        if regained && self.latch == Some(StopReason::Paused) {
            self.latch = None;
        }
        self.page = page;

        let mut emits = self.evaluate(now);
        emits.extend(self.enforce_attention(now));
        emits
    }

    pub fn user_input(&mut self, now: Instant) -> Vec<Emit> {
        self.last_input = now;
        self.loops = 0;
        if self.latch.is_some_and(|reason| reason != StopReason::LimitReached) {
            self.latch = None;
        }
        self.evaluate(now)
    }

    pub fn dashboard_status(&mut self, open: bool, now: Instant) -> Vec<Emit> {
        if self.dashboard_open == open {
            return Vec::new();
        }
        self.dashboard_open = open;
        self.evaluate(now)
    }

    pub fn directive(&mut self, directive: Directive, now: Instant) -> Vec<Emit> {
        match directive {
            Directive::Pause => self.stop(StopReason::Paused, now).into_iter().collect(),
            Directive::CheckState => {
                if self.latch == Some(StopReason::Paused) {
                    self.latch = None;
                }
                self.evaluate(now)
            }
        }
    }

    /// The 1 Hz fallback poll: re-evaluates, applies the idle and loop
    /// policies and emits a heartbeat when one is due.
    pub fn tick(&mut self, now: Instant) -> Vec<Emit> {
        let mut emits = self.evaluate(now);
        emits.extend(self.enforce_attention(now));

        if self.state == ObserverState::Watching {
            let due = self
                .last_heartbeat
                .is_none_or(|last| now.saturating_duration_since(last) >= HEARTBEAT_INTERVAL);
            if due {
                self.last_heartbeat = Some(now);
                emits.push(Emit::Heartbeat {
                    elapsed_seconds: self.elapsed_seconds(now),
                });
            }
        }
        emits
    }

    pub fn unload(&mut self, now: Instant) -> Vec<Emit> {
        self.stop(StopReason::Unload, now).into_iter().collect()
    }

    /// Drops to `NotWatching` without reporting: the coordinator has already
    /// closed or refused the session.
    pub fn abandon(&mut self, reason: StopReason) {
        if self.state == ObserverState::Watching {
            tracing::info!(?reason, "observer session abandoned");
        }
        self.state = ObserverState::NotWatching;
        self.watch_started = None;
        self.last_heartbeat = None;
        if reason.latches() {
            self.latch = Some(reason);
        }
    }

    fn evaluate(&mut self, now: Instant) -> Vec<Emit> {
        let qualifies = self.qualifier.qualifies(&self.page);
        let playing = self.detector.is_playing(&self.page, now);
        let active = self.window_active();
        let watching = qualifies && playing && active;

        match self.state {
            ObserverState::NotWatching if watching && self.latch.is_none() => {
                self.state = ObserverState::Watching;
                self.watch_started = Some(now);
                self.last_heartbeat = Some(now);
                self.loops = 0;
                tracing::debug!(url = %self.page.url, "watching started");
                vec![Emit::Start]
            }
            ObserverState::Watching if !watching => {
                tracing::debug!(qualifies, playing, active, "watching conditions lost");
                self.stop(StopReason::Conditions, now).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn enforce_attention(&mut self, now: Instant) -> Option<Emit> {
        if self.state != ObserverState::Watching {
            return None;
        }
        let quiet = now.saturating_duration_since(self.last_input);
        if quiet > IDLE_TIMEOUT {
            return self.stop(StopReason::Idle, now);
        }
        if self.loops >= LOOP_LIMIT && quiet > LOOP_QUIET_PERIOD {
            return self.stop(StopReason::Looping, now);
        }
        None
    }

    fn track_loop(&mut self, page: &PageSnapshot) {
        let position = page.position();
        if let (Some(previous), Some(current)) = (self.last_position, position) {
            if previous >= LOOP_RESTART_SECS && current < LOOP_RESTART_SECS {
                self.loops += 1;
                tracing::debug!(loops = self.loops, url = %page.url, "clip looped");
            }
        }
        self.last_position = position;
    }

    fn stop(&mut self, reason: StopReason, now: Instant) -> Option<Emit> {
        if reason.latches() {
            self.latch = Some(reason);
        }
        if self.state != ObserverState::Watching {
            return None;
        }
        let elapsed_seconds = self.elapsed_seconds(now);
        self.state = ObserverState::NotWatching;
        self.watch_started = None;
        self.last_heartbeat = None;
        tracing::debug!(?reason, elapsed = elapsed_seconds, "watching stopped");
        Some(Emit::End { elapsed_seconds })
    }

    fn elapsed_seconds(&self, now: Instant) -> u64 {
        self.watch_started
            .map_or(0, |started| now.saturating_duration_since(started).as_secs())
    }
}

/// Signals from the page script.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    Snapshot(PageSnapshot),
    UserInput,
    Unload,
}

/// Instructions back to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCommand {
    Navigate { url: String },
}

/// Drives `observer` for one tab until the page unloads or its event channel
/// closes. Fails only when the coordinator is gone.
pub async fn run_observer(
    tab_id: TabId,
    mut observer: PageObserver,
    client: CoordinatorClient,
    mut events: mpsc::Receiver<PageEvent>,
    mut directives: mpsc::Receiver<Directive>,
    commands: mpsc::Sender<PageCommand>,
) -> Result<()> {
    let mut driver = Driver {
        tab_id,
        client,
        commands,
        started_at: None,
    };
    let mut ticker = time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !observer.page_active() {
                    let open = driver.dashboard_open().await?;
                    let emits = observer.dashboard_status(open, Instant::now());
                    driver.flush(&mut observer, emits).await?;
                }
                let emits = observer.tick(Instant::now());
                driver.flush(&mut observer, emits).await?;
            }
            event = events.recv() => {
                let now = Instant::now();
                let emits = match event {
                    Some(PageEvent::Snapshot(page)) => {
                        // Focus loss only stops the session once the dashboard
                        // is known to be closed.
                        if observer.state() == ObserverState::Watching && !page.active() {
                            let open = driver.dashboard_open().await?;
                            let emits = observer.dashboard_status(open, now);
                            driver.flush(&mut observer, emits).await?;
                        }
                        observer.observe(page, now)
                    }
                    Some(PageEvent::UserInput) => observer.user_input(now),
                    Some(PageEvent::Unload) | None => {
                        let emits = observer.unload(now);
                        driver.flush(&mut observer, emits).await?;
                        tracing::debug!(tab_id, "observer torn down");
                        return Ok(());
                    }
                };
                driver.flush(&mut observer, emits).await?;
            }
            Some(directive) = directives.recv() => {
                tracing::debug!(tab_id, ?directive, "directive received");
                let emits = observer.directive(directive, Instant::now());
                driver.flush(&mut observer, emits).await?;
            }
        }
    }
}

struct Driver {
    tab_id: TabId,
    client: CoordinatorClient,
    commands: mpsc::Sender<PageCommand>,
    started_at: Option<DateTime<Utc>>,
}

impl Driver {
    async fn flush(&mut self, observer: &mut PageObserver, emits: Vec<Emit>) -> Result<()> {
        for emit in emits {
            let url = observer.url().to_string();
            match emit {
                Emit::Start => {
                    let timestamp = Utc::now();
                    self.started_at = Some(timestamp);
                    let reply = self
                        .client
                        .request(Request::Start {
                            tab_id: self.tab_id,
                            timestamp,
                            url,
                        })
                        .await?;
                    if reply == Response::ack(false) {
                        self.started_at = None;
                        observer.abandon(StopReason::Conditions);
                        self.confirm_limit(observer).await?;
                        return Ok(());
                    }
                }
                Emit::Heartbeat { elapsed_seconds } => {
                    let reply = self
                        .client
                        .request(Request::Heartbeat {
                            tab_id: self.tab_id,
                            elapsed_seconds,
                            url,
                        })
                        .await?;
                    if let Response::Heartbeat(HeartbeatReply {
                        should_redirect: true,
                        ..
                    }) = reply
                    {
                        self.started_at = None;
                        observer.abandon(StopReason::Conditions);
                        self.confirm_limit(observer).await?;
                        return Ok(());
                    }
                }
                Emit::End { elapsed_seconds } => {
                    self.client
                        .request(Request::End {
                            tab_id: self.tab_id,
                            start_time: self.started_at.take(),
                            end_time: Some(Utc::now()),
                            elapsed_seconds: Some(elapsed_seconds),
                            url,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Latches and navigates away only once the coordinator confirms the
    /// limit. Any other refusal leaves the observer free to retry on the next
    /// tick.
    async fn confirm_limit(&mut self, observer: &mut PageObserver) -> Result<()> {
        let reply = self
            .client
            .request(Request::CheckLimit {
                tab_id: Some(self.tab_id),
            })
            .await?;
        let Response::Limit(LimitStatus {
            limit_reached: true,
            redirect_url: Some(url),
        }) = reply
        else {
            tracing::debug!(tab_id = self.tab_id, "session refused below the limit, will retry");
            return Ok(());
        };
        observer.abandon(StopReason::LimitReached);
        tracing::info!(tab_id = self.tab_id, %url, "daily limit confirmed, leaving page");
        if self.commands.send(PageCommand::Navigate { url }).await.is_err() {
            tracing::debug!(tab_id = self.tab_id, "page went away before redirect");
        }
        Ok(())
    }

    async fn dashboard_open(&self) -> Result<bool> {
        match self.client.request(Request::IsDashboardOpen).await? {
            Response::Dashboard(status) => Ok(status.dashboard_open),
            other => bail!("unexpected reply to IS_DASHBOARD_OPEN: {other:?}"),
        }
    }
}
