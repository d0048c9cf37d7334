use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::CutoutError;

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Query,
    Filter,
    Fetch,
    Archive,
    Train,
    Store,
}

impl Phase {
    const ALL: [Phase; 7] = [
        Phase::Resolve,
        Phase::Query,
        Phase::Filter,
        Phase::Fetch,
        Phase::Archive,
        Phase::Train,
        Phase::Store,
    ];

    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Query => "Query",
            Phase::Filter => "Filter",
            Phase::Fetch => "Fetch",
            Phase::Archive => "Archive",
            Phase::Train => "Train",
            Phase::Store => "Store",
        }
    }
}

#[derive(Debug)]
struct DashboardState {
    status: String,
    phase: Phase,
    latency_ms: Option<u128>,
    done: usize,
    total: usize,
    succeeded: usize,
    failed: usize,
    retried: usize,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    finished: bool,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            status: "starting".to_string(),
            phase: Phase::Resolve,
            latency_ms: None,
            done: 0,
            total: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            events: VecDeque::new(),
            logs: VecDeque::new(),
            view: View::Operational,
            started: Instant::now(),
            finished: false,
        }
    }

    fn apply(&mut self, message: &str) {
        if let Some((phase, payload)) = parse_phase(message) {
            self.phase = phase;
            self.status = payload.to_string();
            if phase == Phase::Fetch {
                self.apply_fetch(payload);
            }
        } else {
            self.status = message.to_string();
        }
        if let Some(latency) = parse_latency(message) {
            self.latency_ms = Some(latency);
        }
        push_bounded(&mut self.events, message.to_string(), EVENTS_MAX);
        push_bounded(
            &mut self.logs,
            format!("[{}] {message}", timestamp()),
            LOGS_MAX,
        );
    }

    fn apply_fetch(&mut self, payload: &str) {
        if let Some((done, total)) = parse_done(payload) {
            self.done = done;
            self.total = total;
            if payload.contains(" ok ") {
                self.succeeded += 1;
            } else if payload.contains(" failed ") {
                self.failed += 1;
            }
            if parse_attempts(payload).is_some_and(|attempts| attempts > 1) {
                self.retried += 1;
            }
        }
    }

    fn ratio(&self) -> f64 {
        if self.total == 0 {
            if self.finished { 1.0 } else { 0.0 }
        } else {
            (self.done as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<DashboardState>>,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event.message.trim());
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(DashboardState::new())),
            log_scroll: 0,
        }
    }

    /// Runs `f` on a background thread while drawing its progress. `q` or
    /// Esc leaves the dashboard and reports the run as aborted.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, CutoutError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick))
                    .into_diagnostic()?;
            }

            match rx.try_recv() {
                Ok(result) => {
                    if let Ok(mut state) = self.state.lock() {
                        state.finished = true;
                    }
                    leave_screen()?;
                    handle.join().ok();
                    return result.map_err(miette::Report::new);
                }
                Err(TryRecvError::Disconnected) => {
                    leave_screen()?;
                    return Err(miette::Report::msg("worker thread panicked"));
                }
                Err(TryRecvError::Empty) => {}
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()?
                && let Event::Key(key) = event::read().into_diagnostic()?
                && self.handle_key(key)
            {
                break;
            }

            tick = tick.wrapping_add(1);
        }

        leave_screen()?;
        Err(miette::Report::msg("aborted"))
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::F(4) | KeyCode::Char('l') => {
                state.view = match state.view {
                    View::Operational => View::Logs,
                    View::Logs => View::Operational,
                };
                self.log_scroll = 0;
            }
            KeyCode::Up if state.view == View::Logs => {
                self.log_scroll = self.log_scroll.saturating_add(1);
            }
            KeyCode::Down if state.view == View::Logs => {
                self.log_scroll = self.log_scroll.saturating_sub(1);
            }
            _ => {}
        }
        false
    }
}

fn leave_screen() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &DashboardState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, tui.kind, tick), chunks[0]);

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(state.ratio())
        .label(if state.total > 0 {
            format!("{}/{}", state.done, state.total)
        } else {
            state.phase.label().to_string()
        });
    frame.render_widget(gauge, chunks[1]);

    match state.view {
        View::Operational => {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
                .split(chunks[2]);
            frame.render_widget(draw_status_panel(state), main[0]);
            frame.render_widget(draw_counts_panel(state), main[1]);
        }
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[2]),
    }

    let footer = Paragraph::new(Line::from(Span::styled(
        "q/Esc abort   l/F4 toggle logs   Up/Down scroll logs",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(footer, chunks[3]);
}

fn draw_header(state: &DashboardState, kind: ProgressSinkKind, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Query => "Query",
        ProgressSinkKind::Filter => "Filter",
        ProgressSinkKind::Download => "Download",
        ProgressSinkKind::Train => "Train",
    };
    let phases = Phase::ALL
        .iter()
        .map(|phase| {
            let style = if *phase == state.phase {
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            Span::styled(format!("{} ", phase.label()), style)
        })
        .collect::<Vec<_>>();
    let header_line = Line::from(vec![
        Span::styled(
            "ZOO-CUTOUTS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    Paragraph::new(vec![header_line, Line::from(phases)])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &DashboardState) -> Paragraph<'static> {
    let phase_color = if state.finished {
        Color::Green
    } else {
        Color::Cyan
    };
    let latency = state
        .latency_ms
        .map(|v| format!("{v} ms"))
        .unwrap_or_else(|| "--".to_string());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(state.phase.label(), Style::default().fg(phase_color)),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{:.1}s", state.started.elapsed().as_secs_f64())),
            Span::styled("   Latency: ", Style::default().fg(Color::Gray)),
            Span::raw(latency),
        ]),
        Line::from(vec![
            Span::styled("Now: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev().take(5) {
        lines.push(Line::from(format!("- {event}")));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_counts_panel(state: &DashboardState) -> Paragraph<'static> {
    let row = |label: &'static str, value: usize, color: Color| {
        Line::from(vec![
            Span::styled(label, Style::default().fg(Color::Gray)),
            Span::styled(value.to_string(), Style::default().fg(color)),
        ])
    };
    Paragraph::new(vec![
        Line::from(Span::styled(
            "CUTOUTS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        row("Requested: ", state.total, Color::White),
        row("Succeeded: ", state.succeeded, Color::Green),
        row("Failed:    ", state.failed, Color::Red),
        row("Retried:   ", state.retried, Color::Yellow),
    ])
    .wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &DashboardState, scroll: u16) -> Paragraph<'static> {
    let total = state.logs.len();
    let visible = 12usize;
    let start = total.saturating_sub(scroll as usize + visible);
    let mut lines = Vec::with_capacity(visible + 1);
    lines.push(Line::from(Span::styled(
        "LOGS (scrollable)",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )));
    for line in state.logs.iter().skip(start).take(visible) {
        lines.push(Line::from(line.clone()));
    }
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (label, payload) = rest.split_once(';')?;
    let phase = Phase::ALL
        .into_iter()
        .find(|phase| phase.label() == label.trim())?;
    Some((phase, payload.trim()))
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

fn parse_done(payload: &str) -> Option<(usize, usize)> {
    let value = payload.split("done=").nth(1)?.split_whitespace().next()?;
    let (done, total) = value.split_once('/')?;
    Some((done.parse().ok()?, total.parse().ok()?))
}

fn parse_attempts(payload: &str) -> Option<u32> {
    payload
        .split("attempts=")
        .nth(1)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_events_update_counts() {
        let mut state = DashboardState::new();
        state.apply("phase=Fetch; 587 ok bytes=10 attempts=1 done=1/3");
        state.apply("phase=Fetch; 588 failed (gave up) attempts=5 done=2/3");
        assert_eq!(state.phase, Phase::Fetch);
        assert_eq!((state.done, state.total), (2, 3));
        assert_eq!((state.succeeded, state.failed, state.retried), (1, 1, 1));
    }

    #[test]
    fn unknown_phase_is_plain_status() {
        let mut state = DashboardState::new();
        state.apply("phase=Nope; hello");
        assert_eq!(state.phase, Phase::Resolve);
        assert_eq!(state.status, "phase=Nope; hello");
    }

    #[test]
    fn latency_is_parsed() {
        assert_eq!(parse_latency("phase=Query; tap.response rows=3 latency_ms=42"), Some(42));
    }
}
