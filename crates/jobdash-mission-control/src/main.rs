mod app;
mod ui;

use anyhow::Context;
use app::{handle_input, run_action, App, Intent};
use clap::Parser;
use crossterm::{
    event::EventStream,
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use jobdash_sync::{DashboardStore, FeedConnection, HttpGateway, SyncConfig};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    fs::OpenOptions,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const REDRAW_INTERVAL_MS: u64 = 500;

#[derive(Parser, Debug)]
#[command(name = "jobdash-mission-control", about = "Terminal dashboard for the job pipeline")]
struct Args {
    /// Backend base URL; the feed URL is derived from it unless --ws-url is set.
    #[arg(long, env = "JOBDASH_API_URL")]
    api_url: Option<String>,
    #[arg(long, env = "JOBDASH_WS_URL")]
    ws_url: Option<String>,
    #[arg(long, env = "JOBDASH_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = SyncConfig::from_lookup(|key| match key {
        "JOBDASH_API_URL" => args.api_url.clone(),
        "JOBDASH_WS_URL" => args.ws_url.clone(),
        other => std::env::var(other).ok(),
    })
    .context("invalid dashboard configuration")?;
    info!(
        event = "dashboard_start",
        api = %config.api_base_url,
        feed = %config.feed_url
    );

    let gateway = HttpGateway::new(config.api_base_url.clone(), config.request_timeout)
        .context("building http client")?;
    let feed = FeedConnection::new(config.feed());
    let store = DashboardStore::new(Arc::new(gateway), feed, config.store());
    let mut updates = store.subscribe();
    {
        let store = store.clone();
        tokio::spawn(async move { store.initialize().await });
    }

    let mut app = App::new(config.api_base_url.to_string());
    let (note_tx, mut note_rx) = mpsc::unbounded_channel::<String>();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut redraw = tokio::time::interval(Duration::from_millis(REDRAW_INTERVAL_MS));

    loop {
        terminal.draw(|frame| ui::render(frame, &app))?;
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                app.apply_state(state, store.job_stats());
            }
            Some(note) = note_rx.recv() => {
                app.status_note = Some(note);
            }
            _ = redraw.tick() => {}
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    match handle_input(event, &mut app) {
                        Intent::Quit => break,
                        Intent::Run(action) => {
                            app.status_note = Some(action.started_note());
                            let store = store.clone();
                            let note_tx = note_tx.clone();
                            tokio::spawn(async move {
                                let note = run_action(&store, action).await;
                                let _ = note_tx.send(note);
                            });
                        }
                        Intent::None => {}
                    }
                }
            }
        }
    }

    store.cleanup();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn log_filter(debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// The terminal is in raw mode, so logs go to a file, to stdout when asked
/// for explicitly, or nowhere.
fn init_logging(args: &Args) {
    if let Some(path) = args.log_file.as_ref() {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(log_filter(args.debug))
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init();
                return;
            }
            Err(err) => eprintln!("log_file_error: {err}"),
        }
    }
    let stdout_enabled = matches!(
        std::env::var("JOBDASH_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(log_filter(args.debug))
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(log_filter(args.debug))
            .with_writer(io::sink)
            .try_init();
    }
}
