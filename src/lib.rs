//! Daily watch-time budget for short-form video.
//!
//! A single [`session`] coordinator owns the tracked session and is the only
//! writer of the persisted [`usage`] record; per-tab [`observer`]s report
//! playback to it over the [`protocol`] messages served by [`server`].

pub mod app;
pub mod cli;
pub mod clock;
pub mod config;
pub mod host;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod tui;
pub mod usage;
