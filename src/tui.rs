use crate::{
    config::AppConfig,
    protocol::{Notice, Request, Response, StatsReply},
    session::CoordinatorClient,
    usage::{DayEntry, UsageStore},
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Cell, Gauge, Row, Table},
};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    sync::Arc,
    time::Duration,
};
use tokio::{runtime::Handle, sync::broadcast};

const NOTICE_LOG_CAPACITY: usize = 50;

pub async fn run(
    config: Arc<AppConfig>,
    client: CoordinatorClient,
    store: UsageStore,
) -> Result<()> {
    let refresh_hz = config.display.refresh_hz.max(1);
    let tick_rate = Duration::from_millis(1000 / refresh_hz);
    let runtime = Handle::current();
    let notices = store.subscribe();
    let feed = Feed { client };

    tokio::task::spawn_blocking(move || run_blocking(runtime, config, feed, notices, tick_rate))
        .await?
}

/// The terminal view's link to the coordinator. It reads and resets but never
/// announces dashboard presence; only the browser popup does that.
struct Feed {
    client: CoordinatorClient,
}

impl Feed {
    async fn stats(&self) -> Result<StatsReply> {
        self.client
            .stats()
            .await
            .context("failed to fetch current stats")
    }

    async fn reset_today(&self) -> Result<()> {
        let reply = self
            .client
            .request(Request::ManualReset {
                clear_history: false,
            })
            .await
            .context("failed to reset today's usage")?;
        if reply != Response::ack(true) {
            bail!("today's usage was not reset");
        }
        Ok(())
    }
}

fn run_blocking(
    runtime: Handle,
    config: Arc<AppConfig>,
    feed: Feed,
    mut notices: broadcast::Receiver<Notice>,
    tick_rate: Duration,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut notice_log = NoticeLog::default();

    let loop_result: Result<()> = (|| -> Result<()> {
        loop {
            notice_log.drain(&mut notices);
            let stats = runtime.block_on(feed.stats())?;

            terminal.draw(|frame| {
                draw_ui(frame, &config, &stats, &notice_log);
            })?;

            if event::poll(tick_rate)? {
                if let Event::Key(key) = event::read()? {
                    if key.code == KeyCode::Char('q')
                        || (key.code == KeyCode::Char('c')
                            && key.modifiers.contains(KeyModifiers::CONTROL))
                    {
                        break Ok(());
                    }

                    if key.code == KeyCode::Char('r') {
                        if let Err(err) = runtime.block_on(feed.reset_today()) {
                            tracing::warn!(error = %err, "manual reset from dashboard failed");
                        }
                    }
                }
            }
        }
    })();

    let restore_result = restore_terminal(terminal);

    match (loop_result, restore_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(loop_err), Ok(())) => Err(loop_err),
        (Ok(()), Err(restore_err)) => Err(restore_err),
        (Err(loop_err), Err(restore_err)) => Err(loop_err.context(restore_err.to_string())),
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

#[derive(Default)]
struct NoticeLog {
    entries: VecDeque<(DateTime<Local>, Notice)>,
}

impl NoticeLog {
    fn drain(&mut self, rx: &mut broadcast::Receiver<Notice>) {
        loop {
            match rx.try_recv() {
                Ok(notice) => self.push(notice),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "dashboard skipped notices");
                }
                Err(_) => break,
            }
        }
    }

    fn push(&mut self, notice: Notice) {
        self.entries.push_front((Local::now(), notice));
        self.entries.truncate(NOTICE_LOG_CAPACITY);
    }
}

fn draw_ui(frame: &mut Frame, config: &AppConfig, stats: &StatsReply, notices: &NoticeLog) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(7),
            Constraint::Min(5),
        ])
        .split(frame.size());

    render_gauge(frame, layout[0], stats);
    render_summary(frame, layout[1], stats);

    let lower = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(layout[2]);
    render_history(frame, lower[0], config, stats);
    render_notices(frame, lower[1], notices);
}

fn render_gauge(frame: &mut Frame, area: Rect, stats: &StatsReply) {
    let limit = stats.settings.daily_limit_seconds;
    let used = stats.stats.daily_time_seconds;
    let ratio = usage_ratio(used, limit);
    let color = if ratio >= 1.0 {
        Color::Red
    } else if ratio >= 0.8 {
        Color::Yellow
    } else {
        Color::Green
    };

    let gauge = Gauge::default()
        .block(
            Block::default()
                .title("Today (press 'r' to reset, 'q' to quit)")
                .borders(Borders::ALL),
        )
        .gauge_style(Style::default().fg(color))
        .ratio(ratio)
        .label(format!(
            "{} / {}",
            format_duration(used),
            format_duration(limit)
        ));
    frame.render_widget(gauge, area);
}

fn render_summary(frame: &mut Frame, area: Rect, stats: &StatsReply) {
    let label_style = Style::default().add_modifier(Modifier::BOLD);
    let limit = stats.settings.daily_limit_seconds;
    let tracking = stats
        .tracking_tab_id
        .map(|tab| format!("tab {tab}"))
        .unwrap_or_else(|| "idle".to_string());
    let updated = stats
        .stats
        .last_updated_at
        .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "–".to_string());

    let rows = vec![
        summary_row("Remaining", format_duration(stats.stats.remaining(limit)), label_style),
        summary_row("Daily limit", format_duration(limit), label_style),
        summary_row("Tracking", tracking, label_style),
        summary_row("Redirect to", stats.settings.redirect_url.clone(), label_style),
        summary_row("Last update", updated, label_style),
    ];
    let table = Table::new(rows, [Constraint::Length(14), Constraint::Min(0)])
        .block(Block::default().title("Budget").borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn summary_row(label: &'static str, value: String, style: Style) -> Row<'static> {
    Row::new(vec![Cell::from(label).style(style), Cell::from(value)])
}

fn render_history(frame: &mut Frame, area: Rect, config: &AppConfig, stats: &StatsReply) {
    let header = Row::new(vec!["Date", "Watched", "Of limit"]).style(
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );

    let limit = stats.settings.daily_limit_seconds;
    let days = recent_days(&stats.stats.history, config.display.history_days);
    let rows: Vec<Row> = if days.is_empty() {
        vec![Row::new(vec!["–", "No history yet", "–"])]
    } else {
        days.iter()
            .map(|day| {
                Row::new(vec![
                    day.date.format("%a %Y-%m-%d").to_string(),
                    format_duration(day.time_spent_seconds),
                    format!("{:.0}%", usage_ratio(day.time_spent_seconds, limit) * 100.0),
                ])
            })
            .collect()
    };

    let title = match stats.stats.average_history_seconds() {
        Some(avg) => format!("History (avg {})", format_duration(avg)),
        None => "History".to_string(),
    };
    let widths = [
        Constraint::Length(16),
        Constraint::Length(10),
        Constraint::Length(10),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().title(title).borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn render_notices(frame: &mut Frame, area: Rect, notices: &NoticeLog) {
    let header = Row::new(vec!["Time", "Event"]).style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );
    let rows: Vec<Row> = if notices.entries.is_empty() {
        vec![Row::new(vec!["–", "Waiting for activity"])]
    } else {
        notices
            .entries
            .iter()
            .map(|(at, notice)| {
                let row = Row::new(vec![at.format("%H:%M:%S").to_string(), describe(notice)]);
                match notice {
                    Notice::DailyReset => row.style(Style::default().fg(Color::Magenta)),
                    Notice::StatsUpdated { .. } => row,
                }
            })
            .collect()
    };
    let table = Table::new(rows, [Constraint::Length(10), Constraint::Min(0)])
        .header(header)
        .block(Block::default().title("Live").borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn describe(notice: &Notice) -> String {
    match notice {
        Notice::StatsUpdated { daily_time_seconds } => {
            format!("today at {}", format_duration(*daily_time_seconds))
        }
        Notice::DailyReset => "counter reset".to_string(),
    }
}

/// Newest first, at most `days` entries.
fn recent_days(history: &[DayEntry], days: usize) -> Vec<&DayEntry> {
    history.iter().rev().take(days).collect()
}

fn usage_ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 1.0;
    }
    (used as f64 / limit as f64).clamp(0.0, 1.0)
}

fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m {secs:02}s")
    }
}
