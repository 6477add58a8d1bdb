use crate::app::{App, Mode};
use chrono::Utc;
use jobdash_core::discovery::NoticeKind;
use jobdash_core::{Job, JobStatus};
use jobdash_sync::ConnectionState;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};

const COMPACT_WIDTH: u16 = 92;

#[derive(Clone, Copy)]
struct Theme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
    info: Color,
}

fn theme() -> Theme {
    Theme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

pub fn render(frame: &mut ratatui::Frame, app: &App) {
    let size = frame.size();
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(size);
    frame.render_widget(render_header(app, theme, size.width), layout[0]);
    frame.render_widget(render_kpis(app, theme, size.width), layout[1]);
    frame.render_widget(render_body(app, theme, size.width), layout[2]);
    frame.render_widget(render_footer(app, theme, size.width), layout[3]);
    if app.help_open {
        render_help_overlay(frame, app, theme);
    }
}

fn panel(title: &str, theme: Theme, bg: Color) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(bg))
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

fn render_header(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let status = app.state.connection_status;
    let status_fields = vec![
        format!("Mode: {}", app.mode.title()),
        format!("Feed: {}", status.label()),
        loading_label(app),
        format!("API: {}", app.api_base),
    ];
    let status_line = fit_fields(&status_fields, inner_width.max(12));

    let (detail, detail_color) = match (app.status_note.as_deref(), app.state.error.as_deref()) {
        (Some(note), _) => (format!("Last Action: {note}"), status_note_color(note, theme)),
        (None, Some(err)) => (format!("Error: {err}"), theme.critical),
        (None, None) if is_compact(width) => ("Last Action: ready".to_string(), theme.muted),
        (None, None) => (
            "Last Action: ready (Tab mode, r refresh, d discover, ? help)".to_string(),
            theme.muted,
        ),
    };

    Paragraph::new(Text::from(vec![
        Line::from(vec![
            Span::styled("● ", Style::default().fg(connection_color(status, theme))),
            Span::styled(status_line, Style::default().fg(theme.text)),
        ]),
        Line::from(Span::styled(
            ellipsize(&detail, inner_width.max(12)),
            Style::default().fg(detail_color),
        )),
    ]))
    .style(Style::default().fg(theme.text).bg(theme.bg))
    .block(panel("Status", theme, theme.bg))
}

fn loading_label(app: &App) -> String {
    let loading = app.state.loading;
    let busy: Vec<&str> = [
        ("jobs", loading.jobs),
        ("pipeline", loading.pipeline),
        ("pending", loading.pending),
        ("discovery", loading.discovering),
    ]
    .into_iter()
    .filter_map(|(name, on)| on.then_some(name))
    .collect();
    if busy.is_empty() {
        "Idle".to_string()
    } else {
        format!("Loading: {}", busy.join(","))
    }
}

fn render_kpis(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let stats = app.stats;
    let mut fields = vec![
        format!("Jobs: {}", stats.total),
        format!("Open: {}", stats.pending),
        format!("Applied: {}", stats.applied),
        format!("Rejected: {}", stats.rejected),
    ];
    if !is_compact(width) {
        fields.push(format!("Awaiting Review: {}", app.state.pending.len()));
    }
    Paragraph::new(Line::from(Span::styled(
        fit_fields(&fields, inner_width.max(12)),
        Style::default().fg(theme.text),
    )))
    .style(Style::default().fg(theme.text).bg(theme.surface))
    .block(panel("Pipeline KPIs", theme, theme.surface))
}

fn render_body(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let (lines, scroll) = match app.mode {
        Mode::Jobs => (
            job_lines(&app.state.jobs, app.selected_job, theme, inner_width),
            follow_selection(app.selected_job),
        ),
        Mode::Pending => (
            job_lines(&app.state.pending, app.selected_pending, theme, inner_width),
            follow_selection(app.selected_pending),
        ),
        Mode::Pipeline => (pipeline_lines(app, theme), app.scroll),
    };
    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel(app.mode.title(), theme, theme.surface))
        .scroll((scroll, 0))
}

fn follow_selection(selected: usize) -> u16 {
    selected.saturating_sub(8).min(u16::MAX as usize) as u16
}

fn job_lines(jobs: &[Job], selected: usize, theme: Theme, width: usize) -> Vec<Line<'static>> {
    if jobs.is_empty() {
        return vec![Line::from(Span::styled(
            "nothing here yet",
            Style::default().fg(theme.muted),
        ))];
    }
    jobs.iter()
        .enumerate()
        .map(|(index, job)| {
            let marker = if index == selected { ">> " } else { "   " };
            let mut label = job.title();
            if let Some(company) = job.company() {
                label = format!("{label} @ {company}");
            }
            let status = format!("{:<10}", job.status.as_str());
            let budget = width.saturating_sub(marker.len() + status.len() + 8);
            let mut style = Style::default().fg(theme.text);
            if index == selected {
                style = style.add_modifier(Modifier::REVERSED);
            }
            Line::from(vec![
                Span::styled(marker.to_string(), style),
                Span::styled(status, Style::default().fg(status_color(&job.status, theme))),
                Span::styled(format!("#{:<6} ", job.id), Style::default().fg(theme.muted)),
                Span::styled(ellipsize(&label, budget.max(8)), style),
            ])
        })
        .collect()
}

fn pipeline_lines(app: &App, theme: Theme) -> Vec<Line<'static>> {
    let Some(pipeline) = app.state.pipeline.as_ref() else {
        return vec![Line::from(Span::styled(
            "no pipeline snapshot",
            Style::default().fg(theme.muted),
        ))];
    };
    let mut lines = vec![Line::from(Span::styled(
        format!(
            "Captured: {}  Active jobs: {}",
            pipeline.timestamp.as_deref().unwrap_or("unknown"),
            pipeline.active_jobs.len()
        ),
        Style::default().fg(theme.muted),
    ))];
    let peak = pipeline.stage_counts.values().copied().max().unwrap_or(0);
    for (stage, count) in &pipeline.stage_counts {
        lines.push(Line::from(vec![
            Span::styled(format!("{stage:<14}"), Style::default().fg(theme.text)),
            Span::styled(format!("{count:>5} "), Style::default().fg(theme.accent)),
            Span::styled(bar(*count, peak, 30), Style::default().fg(theme.info)),
        ]));
    }
    lines
}

fn bar(value: u64, peak: u64, width: usize) -> String {
    if peak == 0 {
        return String::new();
    }
    let filled = ((value as f64 / peak as f64) * width as f64).round() as usize;
    "█".repeat(filled.min(width))
}

fn render_footer(app: &App, theme: Theme, width: u16) -> Paragraph<'static> {
    let inner_width = width.saturating_sub(4) as usize;
    let line = match app.state.discovery_notification.as_ref() {
        Some(notice) => {
            let age = (Utc::now() - notice.created_at).num_seconds().max(0);
            let color = match notice.kind {
                NoticeKind::Success => theme.ok,
                NoticeKind::Error => theme.critical,
            };
            Line::from(Span::styled(
                ellipsize(&format!("{} ({age}s ago)", notice.message), inner_width.max(12)),
                Style::default().fg(color),
            ))
        }
        None => Line::from(Span::styled(
            ellipsize(
                "j/k select  R retry  a approve  x reject  d discover  q quit",
                inner_width.max(12),
            ),
            Style::default().fg(theme.muted),
        )),
    };
    Paragraph::new(line)
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(panel("Discovery", theme, theme.bg))
}

fn render_help_overlay(frame: &mut ratatui::Frame, app: &App, theme: Theme) {
    let area = centered_rect(70, 60, frame.size());
    let heading = |text: &'static str| {
        Line::from(Span::styled(
            text,
            Style::default()
                .fg(theme.accent)
                .add_modifier(Modifier::BOLD),
        ))
    };
    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                "Controls",
                Style::default()
                    .fg(theme.title)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw("  "),
            Span::styled(
                format!("mode:{}", app.mode.title().to_ascii_lowercase()),
                Style::default().fg(theme.muted),
            ),
        ]),
        heading("Navigation"),
        Line::from("  Tab      cycle mode (Jobs/Pending/Pipeline)"),
        Line::from("  j/k      move selection or scroll"),
        Line::from("  r        refresh jobs, pipeline and pending"),
        Line::from(""),
        heading("Actions"),
        Line::from("  R        retry selected job (Jobs)"),
        Line::from("  a / x    approve / reject selected item (Pending)"),
        Line::from("  d        run discovery"),
        Line::from(""),
        heading("Exit"),
        Line::from("  ? or F1  toggle this help"),
        Line::from("  Esc      close help"),
        Line::from("  q        quit"),
    ];
    if app.state.connection_status != ConnectionState::Connected {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Live feed is down; data refreshes on demand only.",
            Style::default().fg(theme.warn),
        )));
    }
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(Text::from(lines))
            .style(Style::default().fg(theme.text).bg(theme.surface))
            .block(panel("Help", theme, theme.surface))
            .wrap(Wrap { trim: false }),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100u16.saturating_sub(percent_y)) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100u16.saturating_sub(percent_x)) / 2),
        ])
        .split(vertical[1])[1]
}

fn connection_color(status: ConnectionState, theme: Theme) -> Color {
    match status {
        ConnectionState::Connected => theme.ok,
        ConnectionState::Connecting | ConnectionState::Reconnecting => theme.warn,
        ConnectionState::Disconnected => theme.critical,
    }
}

fn status_color(status: &JobStatus, theme: Theme) -> Color {
    match status {
        JobStatus::Completed => theme.ok,
        JobStatus::Failed | JobStatus::Rejected => theme.critical,
        JobStatus::Pending => theme.warn,
        JobStatus::Matched => theme.info,
        JobStatus::Other(_) => theme.muted,
    }
}

fn status_note_color(note: &str, theme: Theme) -> Color {
    let normalized = note.to_ascii_lowercase();
    if normalized.contains("failed") || normalized.contains("error") {
        return theme.critical;
    }
    if normalized.ends_with("...") {
        return theme.info;
    }
    theme.ok
}

fn is_compact(width: u16) -> bool {
    width < COMPACT_WIDTH
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return "...".chars().take(max).collect();
    }
    let prefix: String = input.chars().take(max - 3).collect();
    format!("{prefix}...")
}

fn fit_fields(fields: &[String], max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let mut output = String::new();
    for field in fields {
        if field.trim().is_empty() {
            continue;
        }
        let candidate = if output.is_empty() {
            field.clone()
        } else {
            format!("{output} | {field}")
        };
        if candidate.chars().count() <= max {
            output = candidate;
            continue;
        }
        if output.is_empty() {
            return ellipsize(field, max);
        }
        break;
    }
    output
}
