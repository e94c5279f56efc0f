use crate::analytics::UsageReport;
use crate::config::AppConfig;
use crate::dashboard::DashboardState;
use crate::error::AppError;
use crate::models::{SeriesProjection, TimeWindow, UsageLevel};
use crate::report::{format_count, NEED_MORE_POINTS_MESSAGE, NO_DATA_MESSAGE};
use crate::service::{LoadResult, UsageService};
use crate::session::{SessionProvider, SessionStore};
use crate::storage::Storage;
use crate::ui::app::{AppState, Screen};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{
    Axis, Block, Borders, Cell, Chart, Clear, Dataset, Gauge, GraphType, Paragraph, Row, Table,
    Wrap,
};
use ratatui::Terminal;
use std::io;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::task::JoinHandle;

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;
const COLOR_ERROR: Color = Color::Red;

struct FetchJob {
    started_at: Instant,
    handle: JoinHandle<Result<LoadResult, AppError>>,
}

pub async fn run_tui(
    cfg: &AppConfig,
    service: Arc<UsageService>,
    sessions: Arc<SessionStore>,
    storage: &mut Storage,
) -> Result<(), AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, cfg, service, sessions, storage).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    cfg: &AppConfig,
    service: Arc<UsageService>,
    sessions: Arc<SessionStore>,
    storage: &mut Storage,
) -> Result<(), AppError> {
    let mut state = AppState::with_window(cfg.default_time_window());
    let mut fetch_jobs: Vec<FetchJob> = Vec::new();
    let mut session_rx = sessions.subscribe();
    let mut last_tick = Instant::now();
    let tick_rate = StdDuration::from_secs(cfg.refresh_seconds.max(10));

    queue_fetch_job(&mut state, &mut fetch_jobs, &service);

    while state.running {
        if fetch_jobs.iter().any(|job| job.handle.is_finished()) {
            process_fetch_jobs(&mut state, &mut fetch_jobs, storage).await;
        }

        if session_rx.has_changed().unwrap_or(false) {
            let signed_in = session_rx.borrow_and_update().is_some();
            handle_session_change(signed_in, &mut state, &mut fetch_jobs, &service);
        }

        terminal.draw(|f| render(f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0))
            .min(StdDuration::from_millis(250));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                handle_key(
                    key.code,
                    key.modifiers,
                    &mut state,
                    cfg,
                    &service,
                    &sessions,
                    &mut fetch_jobs,
                );
            }
        }

        if last_tick.elapsed() >= tick_rate {
            if state.screen == Screen::Dashboard && fetch_jobs.is_empty() {
                queue_fetch_job(&mut state, &mut fetch_jobs, &service);
            }
            last_tick = Instant::now();
        }
    }

    for job in fetch_jobs {
        job.handle.abort();
    }
    Ok(())
}

fn handle_key(
    code: KeyCode,
    modifiers: KeyModifiers,
    state: &mut AppState,
    cfg: &AppConfig,
    service: &Arc<UsageService>,
    sessions: &SessionStore,
    fetch_jobs: &mut Vec<FetchJob>,
) {
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        state.screen = Screen::ConfirmQuit;
        state.confirm_selected = 0;
        return;
    }

    if state.screen == Screen::ConfirmQuit {
        match code {
            KeyCode::Left | KeyCode::Right | KeyCode::Tab => {
                state.confirm_selected = 1 - state.confirm_selected.min(1);
            }
            KeyCode::Char('y') => state.running = false,
            KeyCode::Enter => {
                if state.confirm_selected == 1 {
                    state.running = false;
                } else {
                    state.screen = Screen::Dashboard;
                }
            }
            KeyCode::Esc | KeyCode::Char('n') => state.screen = Screen::Dashboard,
            _ => {}
        }
        return;
    }

    let now = Utc::now();
    match code {
        KeyCode::Char('q') => {
            state.screen = Screen::ConfirmQuit;
            state.confirm_selected = 0;
        }
        KeyCode::Char('r') => queue_fetch_job(state, fetch_jobs, service),
        KeyCode::Char('l') => {
            state.status = "reloading credentials...".into();
            sessions.reload(cfg);
        }
        KeyCode::Char('w') => state.set_window(state.window.next(), now),
        KeyCode::Char('7') => state.set_window(TimeWindow::SevenDays, now),
        KeyCode::Char('3') => state.set_window(TimeWindow::ThirtyDays, now),
        KeyCode::Char('9') => state.set_window(TimeWindow::NinetyDays, now),
        KeyCode::Char('0') => state.set_window(TimeWindow::All, now),
        KeyCode::Char('s') => state.set_series(state.series.next()),
        KeyCode::Char('z') => {
            state.compact_mode = !state.compact_mode;
            state.status = if state.compact_mode {
                "compact mode enabled".into()
            } else {
                "compact mode disabled".into()
            };
        }
        _ => {}
    }
}

fn handle_session_change(
    signed_in: bool,
    state: &mut AppState,
    fetch_jobs: &mut Vec<FetchJob>,
    service: &Arc<UsageService>,
) {
    if signed_in {
        queue_fetch_job(state, fetch_jobs, service);
    } else {
        state.sign_out();
    }
}

fn queue_fetch_job(
    state: &mut AppState,
    fetch_jobs: &mut Vec<FetchJob>,
    service: &Arc<UsageService>,
) {
    let svc = Arc::clone(service);
    let handle = tokio::spawn(async move { svc.load().await });
    fetch_jobs.push(FetchJob {
        started_at: Instant::now(),
        handle,
    });

    if state.snapshot.is_none() || matches!(state.dashboard, DashboardState::Error { .. }) {
        state.dashboard = DashboardState::Loading;
    }
    state.status = "refreshing...".into();
}

async fn process_fetch_jobs(
    state: &mut AppState,
    fetch_jobs: &mut Vec<FetchJob>,
    storage: &mut Storage,
) {
    let (done, pending): (Vec<FetchJob>, Vec<FetchJob>) = std::mem::take(fetch_jobs)
        .into_iter()
        .partition(|job| job.handle.is_finished());
    *fetch_jobs = pending;

    for job in done {
        let elapsed = job.started_at.elapsed();
        match job.handle.await {
            Ok(Ok(LoadResult::Fresh(snapshot))) => {
                if let Err(err) = storage.replace_snapshot(&snapshot) {
                    tracing::warn!(error = %err, "failed to cache usage snapshot");
                }
                state.apply_snapshot(snapshot, Utc::now());
                state.status = format!("ok ({} ms)", elapsed.as_millis());
            }
            Ok(Ok(LoadResult::Superseded)) => {}
            Ok(Err(err)) => {
                state.status = format!("refresh failed: {err}");
                state.dashboard = DashboardState::from_error(&err);
            }
            Err(e) => {
                let message = format!("Background fetch task failed: {e}");
                state.status = message.clone();
                state.dashboard = DashboardState::Error {
                    message,
                    retryable: true,
                };
            }
        }
    }
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let size = f.area();
    let compact = state.compact_mode || size.width < 100;

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(size);

    let header = Paragraph::new(format!(
        " aetheria-usage  ·  {}  ·  {}  ·  {}  ·  {} ",
        state.window.as_label(),
        state.series.as_label(),
        state.status,
        state.last_refresh_label()
    ))
    .block(Block::default().borders(Borders::ALL).title(" Usage "))
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    match &state.dashboard {
        DashboardState::Loading => render_message(
            f,
            root[1],
            " Usage ",
            vec![Line::from("Loading usage...")],
            COLOR_MUTED,
        ),
        DashboardState::Error { message, retryable } => {
            let hint = if *retryable {
                "Press r to retry."
            } else {
                "Sign in again, press l to reload credentials, then r to retry."
            };
            render_message(
                f,
                root[1],
                " Error ",
                vec![
                    Line::from(message.clone()),
                    Line::from(""),
                    Line::from(Span::styled(hint, Style::default().fg(COLOR_MUTED))),
                ],
                COLOR_ERROR,
            )
        }
        DashboardState::Empty { window } => render_message(
            f,
            root[1],
            " Usage ",
            vec![
                Line::from(NO_DATA_MESSAGE),
                Line::from(Span::styled(
                    format!("Nothing recorded in the {} window.", window.as_label()),
                    Style::default().fg(COLOR_MUTED),
                )),
            ],
            COLOR_HEADER,
        ),
        DashboardState::Data(report) => render_report(f, root[1], report, compact),
    }

    let footer = Paragraph::new(footer_text(state))
        .block(Block::default().borders(Borders::TOP))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[2]);

    if state.screen == Screen::ConfirmQuit {
        render_confirm_quit(f, state);
    }
}

fn footer_text(state: &AppState) -> &'static str {
    match state.screen {
        Screen::Dashboard => {
            "r refresh | w window | 7/3/9/0 7d/30d/90d/all | s series | l reload login | z compact | q quit"
        }
        Screen::ConfirmQuit => "Left/Right choose | Enter confirm | Esc cancel",
    }
}

fn level_color(level: UsageLevel) -> Color {
    match level {
        UsageLevel::NoUsage => Color::Gray,
        UsageLevel::Low => Color::Green,
        UsageLevel::Moderate => Color::Blue,
        UsageLevel::High => Color::Yellow,
        UsageLevel::Intensive => Color::Magenta,
    }
}

fn render_message(
    f: &mut ratatui::Frame,
    area: Rect,
    title: &str,
    lines: Vec<Line<'static>>,
    color: Color,
) {
    let content = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .style(Style::default().fg(color))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: true });
    f.render_widget(content, area);
}

fn render_report(f: &mut ratatui::Frame, area: Rect, report: &UsageReport, compact: bool) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(6)])
        .split(area);

    let tiles = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(22),
            Constraint::Percentage(22),
            Constraint::Percentage(22),
        ])
        .split(rows[0]);

    let s = &report.summary;
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Requests · {} ", report.level.label())),
        )
        .gauge_style(Style::default().fg(level_color(report.level)))
        .percent(UsageLevel::fill_percent(s.request_count))
        .label(format_count(s.request_count));
    f.render_widget(gauge, tiles[0]);

    for (area, title, value, color) in [
        (tiles[1], " Input ", s.input_tokens, COLOR_HEADER),
        (tiles[2], " Output ", s.output_tokens, COLOR_HEADER),
        (tiles[3], " Total ", s.total_tokens, COLOR_INFO),
    ] {
        let tile = Paragraph::new(format_count(value))
            .block(Block::default().borders(Borders::ALL).title(title))
            .style(Style::default().fg(color).add_modifier(Modifier::BOLD));
        f.render_widget(tile, area);
    }

    let body = Layout::default()
        .direction(if compact {
            Direction::Vertical
        } else {
            Direction::Horizontal
        })
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_chart(f, body[0], report);
    render_daily_table(f, body[1], report);
}

fn render_chart(f: &mut ratatui::Frame, area: Rect, report: &UsageReport) {
    let title = format!(" {} per day ", report.series_kind.title());
    let series = match &report.chart {
        SeriesProjection::Series(series) => series,
        SeriesProjection::InsufficientData { .. } => {
            render_message(
                f,
                area,
                &title,
                vec![Line::from(NEED_MORE_POINTS_MESSAGE)],
                COLOR_MUTED,
            );
            return;
        }
    };

    let points: Vec<(f64, f64)> = series
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64, *v as f64))
        .collect();
    let peak = series.values.iter().copied().max().unwrap_or(0);
    let first = series.labels.first().cloned().unwrap_or_default();
    let last = series.labels.last().cloned().unwrap_or_default();

    let dataset = Dataset::default()
        .name(report.series_kind.title())
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(COLOR_ACCENT))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .style(Style::default().fg(COLOR_MUTED))
                .bounds([0.0, (points.len().saturating_sub(1)) as f64])
                .labels(vec![first, last]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(COLOR_MUTED))
                .bounds([0.0, peak.max(1) as f64])
                .labels(vec!["0".to_string(), format_count(peak)]),
        );
    f.render_widget(chart, area);
}

fn render_daily_table(f: &mut ratatui::Frame, area: Rect, report: &UsageReport) {
    let rows = report
        .buckets
        .iter()
        .rev()
        .map(|b| {
            Row::new(vec![
                Cell::from(b.date.format("%Y-%m-%d").to_string()),
                Cell::from(format_count(b.request_count)),
                Cell::from(format_count(b.input_tokens)),
                Cell::from(format_count(b.output_tokens)),
                Cell::from(format_count(b.total_tokens)),
            ])
        })
        .collect::<Vec<_>>();

    let table = Table::new(
        rows,
        [
            Constraint::Length(11),
            Constraint::Length(6),
            Constraint::Min(8),
            Constraint::Min(8),
            Constraint::Min(8),
        ],
    )
    .header(
        Row::new(vec!["Date", "Reqs", "Input", "Output", "Total"]).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(" Daily Breakdown "));
    f.render_widget(table, area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn render_confirm_quit(f: &mut ratatui::Frame, state: &AppState) {
    let area = centered_rect(50, 30, f.area());
    f.render_widget(Clear, area);

    let cancel_style = if state.confirm_selected == 0 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let confirm_style = if state.confirm_selected == 1 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Red)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let content = Paragraph::new(vec![
        Line::from("Do you want to exit aetheria-usage?"),
        Line::from(""),
        Line::from(vec![
            Span::styled("[Cancel (Esc)]", cancel_style),
            Span::raw("   "),
            Span::styled("[Quit (Enter)]", confirm_style),
        ]),
        Line::from("Use Left/Right to choose"),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Confirm Quit "))
    .alignment(Alignment::Center);

    f.render_widget(content, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UsageBackend;
    use crate::models::{
        LogUsageRequest, TokenSeriesKind, UsageLogEntry, UsageResponse, UsageSnapshot,
    };
    use crate::session::Session;
    use async_trait::async_trait;

    struct OfflineBackend;

    #[async_trait]
    impl UsageBackend for OfflineBackend {
        fn name(&self) -> &'static str {
            "offline"
        }

        async fn fetch_usage(&self, _session: &Session) -> Result<UsageResponse, AppError> {
            Err(AppError::Network("offline".into()))
        }

        async fn log_usage(
            &self,
            _session: &Session,
            _request: &LogUsageRequest,
        ) -> Result<(), AppError> {
            Ok(())
        }
    }

    struct Harness {
        cfg: AppConfig,
        service: Arc<UsageService>,
        sessions: Arc<SessionStore>,
        state: AppState,
        jobs: Vec<FetchJob>,
    }

    impl Harness {
        fn new() -> Self {
            let sessions = Arc::new(SessionStore::new(Some(Session {
                user_id: None,
                access_token: "tok".into(),
            })));
            let service = Arc::new(UsageService::new(
                Arc::new(OfflineBackend),
                sessions.clone(),
            ));
            Self {
                cfg: AppConfig::default(),
                service,
                sessions,
                state: AppState::default(),
                jobs: Vec::new(),
            }
        }

        fn press(&mut self, code: KeyCode, modifiers: KeyModifiers) {
            handle_key(
                code,
                modifiers,
                &mut self.state,
                &self.cfg,
                &self.service,
                &self.sessions,
                &mut self.jobs,
            );
        }

        fn abort_jobs(&mut self) {
            for job in self.jobs.drain(..) {
                job.handle.abort();
            }
        }
    }

    #[test]
    fn quit_requires_confirmation() {
        let mut h = Harness::new();

        h.press(KeyCode::Char('q'), KeyModifiers::NONE);
        assert_eq!(h.state.screen, Screen::ConfirmQuit);
        assert!(h.state.running);

        h.press(KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(h.state.screen, Screen::Dashboard);

        h.press(KeyCode::Char('c'), KeyModifiers::CONTROL);
        h.press(KeyCode::Right, KeyModifiers::NONE);
        h.press(KeyCode::Enter, KeyModifiers::NONE);
        assert!(!h.state.running);
    }

    #[test]
    fn window_and_series_keys_do_not_fetch() {
        let mut h = Harness::new();

        h.press(KeyCode::Char('7'), KeyModifiers::NONE);
        h.press(KeyCode::Char('s'), KeyModifiers::NONE);
        assert_eq!(h.state.window, TimeWindow::SevenDays);
        assert_eq!(h.state.series, TokenSeriesKind::Input);
        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn each_retry_press_spawns_exactly_one_fetch() {
        let mut h = Harness::new();
        h.state.dashboard = DashboardState::Error {
            message: "boom".into(),
            retryable: true,
        };

        h.press(KeyCode::Char('r'), KeyModifiers::NONE);
        assert_eq!(h.jobs.len(), 1);
        assert_eq!(h.state.dashboard, DashboardState::Loading);

        h.press(KeyCode::Char('r'), KeyModifiers::NONE);
        assert_eq!(h.jobs.len(), 2);
        h.abort_jobs();
    }

    #[tokio::test]
    async fn sign_out_with_cached_data_shows_error_until_next_sign_in() {
        let mut h = Harness::new();
        let now = Utc::now();
        h.state.apply_snapshot(
            UsageSnapshot {
                logs: vec![UsageLogEntry {
                    id: "1".into(),
                    user_id: "user-1".into(),
                    input_tokens: 3,
                    output_tokens: 4,
                    total_tokens: 7,
                    created_at: now,
                }],
                server_totals: None,
                fetched_at: now,
            },
            now,
        );

        handle_session_change(false, &mut h.state, &mut h.jobs, &h.service);
        h.press(KeyCode::Char('7'), KeyModifiers::NONE);
        assert!(h.jobs.is_empty());
        assert!(matches!(h.state.dashboard, DashboardState::Error { .. }));

        handle_session_change(true, &mut h.state, &mut h.jobs, &h.service);
        assert_eq!(h.jobs.len(), 1);
        assert_eq!(h.state.dashboard, DashboardState::Loading);
        h.abort_jobs();
    }

    #[tokio::test]
    async fn window_change_after_failed_refresh_keeps_error() {
        let mut h = Harness::new();
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let mut storage = Storage::open(&tmp.path().join("usage.sqlite")).expect("storage");
        let now = Utc::now();
        h.state.apply_snapshot(
            UsageSnapshot {
                logs: Vec::new(),
                server_totals: None,
                fetched_at: now,
            },
            now,
        );

        h.press(KeyCode::Char('r'), KeyModifiers::NONE);
        while !h.jobs.iter().all(|j| j.handle.is_finished()) {
            tokio::task::yield_now().await;
        }
        process_fetch_jobs(&mut h.state, &mut h.jobs, &mut storage).await;
        h.press(KeyCode::Char('w'), KeyModifiers::NONE);

        assert!(matches!(h.state.dashboard, DashboardState::Error { .. }));
    }

    #[tokio::test]
    async fn failed_fetch_enters_error_state() {
        let mut h = Harness::new();
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let mut storage = Storage::open(&tmp.path().join("usage.sqlite")).expect("storage");

        queue_fetch_job(&mut h.state, &mut h.jobs, &h.service);
        while !h.jobs.iter().all(|j| j.handle.is_finished()) {
            tokio::task::yield_now().await;
        }
        process_fetch_jobs(&mut h.state, &mut h.jobs, &mut storage).await;

        assert!(h.jobs.is_empty());
        assert!(matches!(
            h.state.dashboard,
            DashboardState::Error {
                retryable: true,
                ..
            }
        ));
    }
}
