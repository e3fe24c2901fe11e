//! Messages exchanged between page observers, the browser shim, dashboards
//! and the session coordinator.
//!
//! Everything serializes as `{"type": "SCREAMING_SNAKE_CASE", ...camelCase}`
//! so the extension side can post plain JSON objects.

use crate::usage::{Settings, UsageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TabId = i64;
pub type WindowId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRef {
    pub tab_id: TabId,
    #[serde(default)]
    pub url: Option<String>,
}

/// Inbound messages handled by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Start {
        tab_id: TabId,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        tab_id: TabId,
        elapsed_seconds: u64,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    End {
        tab_id: TabId,
        #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
        start_time: Option<DateTime<Utc>>,
        #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
        end_time: Option<DateTime<Utc>>,
        #[serde(default)]
        elapsed_seconds: Option<u64>,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    CheckLimit {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    GetCurrentStats,
    IsDashboardOpen,
    #[serde(rename_all = "camelCase")]
    DashboardOpened {
        #[serde(default)]
        window_id: Option<WindowId>,
    },
    DashboardClosed,
    #[serde(rename_all = "camelCase")]
    ManualReset {
        #[serde(default)]
        clear_history: bool,
    },
    #[serde(rename_all = "camelCase")]
    UpdateSettings {
        #[serde(default)]
        daily_limit_seconds: Option<u64>,
        #[serde(default)]
        redirect_url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabRemoved { tab_id: TabId },
    #[serde(rename_all = "camelCase")]
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabUpdated { tab_id: TabId, url: String },
    #[serde(rename_all = "camelCase")]
    WindowFocusChanged {
        #[serde(default)]
        window_id: Option<WindowId>,
        #[serde(default)]
        active_tab: Option<TabRef>,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Start { .. } => "START",
            Request::Heartbeat { .. } => "HEARTBEAT",
            Request::End { .. } => "END",
            Request::CheckLimit { .. } => "CHECK_LIMIT",
            Request::GetCurrentStats => "GET_CURRENT_STATS",
            Request::IsDashboardOpen => "IS_DASHBOARD_OPEN",
            Request::DashboardOpened { .. } => "DASHBOARD_OPENED",
            Request::DashboardClosed => "DASHBOARD_CLOSED",
            Request::ManualReset { .. } => "MANUAL_RESET",
            Request::UpdateSettings { .. } => "UPDATE_SETTINGS",
            Request::TabRemoved { .. } => "TAB_REMOVED",
            Request::TabActivated { .. } => "TAB_ACTIVATED",
            Request::TabUpdated { .. } => "TAB_UPDATED",
            Request::WindowFocusChanged { .. } => "WINDOW_FOCUS_CHANGED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    pub should_redirect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl HeartbeatReply {
    pub fn keep_going() -> Self {
        Self {
            should_redirect: false,
            redirect_url: None,
        }
    }

    pub fn redirect(url: String) -> Self {
        Self {
            should_redirect: true,
            redirect_url: Some(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub limit_reached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReply {
    pub stats: UsageRecord,
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_tab_id: Option<TabId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    pub dashboard_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

/// Reply shapes; each variant has a distinct required field so the untagged
/// form round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Heartbeat(HeartbeatReply),
    Limit(LimitStatus),
    Stats(Box<StatsReply>),
    Dashboard(DashboardStatus),
    Ack(Ack),
}

impl Response {
    pub fn ack(success: bool) -> Self {
        Response::Ack(Ack { success })
    }
}

/// Coordinator to observer instructions. Only an acknowledgement is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
    Pause,
    CheckState,
}

/// Broadcast to dashboards whenever the usage record changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
    #[serde(rename_all = "camelCase")]
    StatsUpdated { daily_time_seconds: u64 },
    DailyReset,
}

/// Side effects only the browser itself can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCommand {
    #[serde(rename_all = "camelCase")]
    RedirectTab { tab_id: TabId, url: String },
    Notify { title: String, message: String },
    #[serde(rename_all = "camelCase")]
    InjectObserver { tab_id: TabId },
}
