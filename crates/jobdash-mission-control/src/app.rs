use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use jobdash_core::{Job, JobStats};
use jobdash_sync::{DashboardState, DashboardStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Jobs,
    Pending,
    Pipeline,
}

impl Mode {
    pub fn title(self) -> &'static str {
        match self {
            Mode::Jobs => "Jobs",
            Mode::Pending => "Pending Review",
            Mode::Pipeline => "Pipeline",
        }
    }

    fn next(self) -> Self {
        match self {
            Mode::Jobs => Mode::Pending,
            Mode::Pending => Mode::Pipeline,
            Mode::Pipeline => Mode::Jobs,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    RefreshAll,
    Retry(String),
    Approve(String),
    Reject(String),
    Discover,
}

impl Action {
    pub fn started_note(&self) -> String {
        match self {
            Action::RefreshAll => "refreshing...".to_string(),
            Action::Retry(id) => format!("retrying job {id}..."),
            Action::Approve(id) => format!("approving job {id}..."),
            Action::Reject(id) => format!("rejecting job {id}..."),
            Action::Discover => "discovery running...".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Intent {
    None,
    Quit,
    Run(Action),
}

pub struct App {
    pub api_base: String,
    pub state: DashboardState,
    pub stats: JobStats,
    pub mode: Mode,
    pub selected_job: usize,
    pub selected_pending: usize,
    pub scroll: u16,
    pub help_open: bool,
    pub status_note: Option<String>,
}

impl App {
    pub fn new(api_base: String) -> Self {
        Self {
            api_base,
            state: DashboardState::default(),
            stats: JobStats::default(),
            mode: Mode::Jobs,
            selected_job: 0,
            selected_pending: 0,
            scroll: 0,
            help_open: false,
            status_note: None,
        }
    }

    pub fn apply_state(&mut self, state: DashboardState, stats: JobStats) {
        self.selected_job = clamp_index(self.selected_job, state.jobs.len());
        self.selected_pending = clamp_index(self.selected_pending, state.pending.len());
        self.state = state;
        self.stats = stats;
    }

    pub fn selected_job(&self) -> Option<&Job> {
        self.state.jobs.get(self.selected_job)
    }

    pub fn selected_pending(&self) -> Option<&Job> {
        self.state.pending.get(self.selected_pending)
    }

    fn move_selection(&mut self, delta: isize) {
        match self.mode {
            Mode::Jobs => {
                self.selected_job = step(self.selected_job, delta, self.state.jobs.len());
            }
            Mode::Pending => {
                self.selected_pending =
                    step(self.selected_pending, delta, self.state.pending.len());
            }
            Mode::Pipeline => {
                self.scroll = if delta < 0 {
                    self.scroll.saturating_sub(1)
                } else {
                    self.scroll.saturating_add(1)
                };
            }
        }
    }
}

fn clamp_index(index: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        index.min(len - 1)
    }
}

fn step(index: usize, delta: isize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let next = index as isize + delta;
    next.clamp(0, len as isize - 1) as usize
}

pub fn handle_input(event: Event, app: &mut App) -> Intent {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(key, app),
        _ => Intent::None,
    }
}

fn handle_key(key: KeyEvent, app: &mut App) -> Intent {
    if matches!(key.code, KeyCode::Char('?') | KeyCode::F(1)) {
        app.help_open = !app.help_open;
        return Intent::None;
    }
    if key.code == KeyCode::Esc && app.help_open {
        app.help_open = false;
        return Intent::None;
    }
    if app.help_open {
        return Intent::None;
    }

    match key.code {
        KeyCode::Char('q') => Intent::Quit,
        KeyCode::Tab => {
            app.mode = app.mode.next();
            app.scroll = 0;
            Intent::None
        }
        KeyCode::Down | KeyCode::Char('j') => {
            app.move_selection(1);
            Intent::None
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.move_selection(-1);
            Intent::None
        }
        KeyCode::Char('r') => Intent::Run(Action::RefreshAll),
        KeyCode::Char('d') => Intent::Run(Action::Discover),
        KeyCode::Char('R') if app.mode == Mode::Jobs => match app.selected_job() {
            Some(job) => Intent::Run(Action::Retry(job.id.clone())),
            None => {
                app.status_note = Some("no job selected".to_string());
                Intent::None
            }
        },
        KeyCode::Char('a') | KeyCode::Char('x') if app.mode == Mode::Pending => {
            let Some(job) = app.selected_pending() else {
                app.status_note = Some("no pending job selected".to_string());
                return Intent::None;
            };
            let id = job.id.clone();
            if key.code == KeyCode::Char('a') {
                Intent::Run(Action::Approve(id))
            } else {
                Intent::Run(Action::Reject(id))
            }
        }
        _ => Intent::None,
    }
}

/// Runs one user action against the store and returns the note to show.
pub async fn run_action(store: &DashboardStore, action: Action) -> String {
    match action {
        Action::RefreshAll => {
            tokio::join!(
                store.refresh_jobs(),
                store.fetch_pipeline(),
                store.refresh_pending()
            );
            match store.snapshot().error {
                Some(err) => format!("refresh failed: {err}"),
                None => "refreshed".to_string(),
            }
        }
        Action::Retry(id) => match store.retry_job(&id).await {
            Ok(_) => format!("retry queued for job {id}"),
            Err(err) => format!("retry failed for job {id}: {err}"),
        },
        Action::Approve(id) => match store.approve_job(&id).await {
            Ok(_) => format!("approved job {id}"),
            Err(err) => format!("approve failed for job {id}: {err}"),
        },
        Action::Reject(id) => match store.reject_job(&id, None).await {
            Ok(_) => format!("rejected job {id}"),
            Err(err) => format!("reject failed for job {id}: {err}"),
        },
        Action::Discover => match store.discover_jobs().await {
            Ok(summary) => summary.message,
            Err(err) => format!("discovery failed: {err}"),
        },
    }
}
