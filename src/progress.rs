//! Progress reporting
//!
//! The enumerator and the orchestrator describe what they are doing through
//! [`ProgressEvent`]s. The binary renders them on the terminal; tests record them.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Number of cells in the page progress bar
pub const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Authenticating,
    Authenticated,
    AccessDenied { reason: String },
    EnumerationStarted { account: String },
    PageProcessed { account: String, page: u64, total_pages: u64 },
    NoRepositories { account: String },
    EnumerationFinished { account: String, pages: u64, repositories: usize },
    EnumerationFailed { account: String, error: String },
    SyncStarted { account: String },
    RepositoryStarted { name: String, slug: String },
    Cloning { slug: String },
    Cloned { slug: String },
    FetchingBranches { slug: String },
    BranchesFetched { slug: String },
    RepositoryFailed { slug: String, error: String },
    SyncFinished { account: String, repositories: usize },
    Aborted,
}

pub trait Progress: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Fraction of the listing processed after `page` of `total_pages`, within `0.0..=1.0`
pub fn page_fraction(page: u64, total_pages: u64) -> f64 {
    if total_pages == 0 {
        return 0.0;
    }
    (page.min(total_pages) as f64 / total_pages as f64).clamp(0.0, 1.0)
}

/// Filled cells of a [`BAR_WIDTH`] bar after `page` of `total_pages`
pub fn filled_cells(page: u64, total_pages: u64) -> usize {
    (page_fraction(page, total_pages) * BAR_WIDTH as f64).floor() as usize
}

/// The bar drawn after `page` of `total_pages`, e.g. `[==========          ]`
pub fn page_bar(page: u64, total_pages: u64) -> String {
    let filled = filled_cells(page, total_pages);
    format!("[{}{}]", "=".repeat(filled), " ".repeat(BAR_WIDTH - filled))
}

/// Renders events on the terminal: headings, `==>` results and transient `-->` lines
pub struct TerminalProgress {
    transient: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            transient: Mutex::new(None),
        }
    }

    fn heading(&self, text: String) {
        self.clear();
        println!("{}", style(text).bold().yellow());
    }

    fn done(&self, text: String) {
        self.clear();
        println!("==> {}", text);
    }

    fn spin(&self, message: String) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("--> {}", message));
        spinner.enable_steady_tick(Duration::from_millis(120));
        self.replace(spinner);
    }

    fn pages(&self, page: u64, total_pages: u64) {
        let mut slot = self.transient.lock().unwrap_or_else(|e| e.into_inner());
        let bar = match slot.as_ref() {
            Some(bar) if bar.length() == Some(total_pages) => bar.clone(),
            _ => {
                if let Some(old) = slot.take() {
                    old.finish_and_clear();
                }
                let bar = ProgressBar::new(total_pages);
                let bar_style =
                    ProgressStyle::with_template("--> Processing page {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar());
                bar.set_style(bar_style);
                *slot = Some(bar.clone());
                bar
            }
        };
        bar.set_position(page.min(total_pages));
        bar.set_message(page_bar(page, total_pages));
    }

    fn replace(&self, bar: ProgressBar) {
        let mut slot = self.transient.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(bar) {
            old.finish_and_clear();
        }
    }

    fn clear(&self) {
        let mut slot = self.transient.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            old.finish_and_clear();
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for TerminalProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Authenticating => {
                self.heading("Authenticating with Bitbucket".to_string());
                self.spin("Retrieving access token".to_string());
            }
            ProgressEvent::Authenticated => {
                self.done("Access token retrieved".to_string());
                println!();
            }
            ProgressEvent::AccessDenied { reason } => {
                self.clear();
                println!("{}", style("==> Access denied").bold().red());
                println!("    {}", reason);
            }
            ProgressEvent::EnumerationStarted { account } => {
                self.heading(format!("Fetching repositories for {}", account));
            }
            ProgressEvent::PageProcessed {
                page, total_pages, ..
            } => self.pages(page, total_pages),
            ProgressEvent::NoRepositories { .. } => {
                self.done("No repositories found".to_string());
                println!();
            }
            ProgressEvent::EnumerationFinished { pages, .. } => {
                self.done(format!("Processed {} pages", pages));
                println!();
            }
            ProgressEvent::EnumerationFailed { account, error } => {
                self.clear();
                println!(
                    "{}",
                    style(format!("==> Could not list repositories for {}", account))
                        .bold()
                        .red()
                );
                println!("    {}", error);
                println!();
            }
            ProgressEvent::SyncStarted { account } => {
                self.heading(format!("Processing repositories for {}", account));
            }
            ProgressEvent::RepositoryStarted { name, .. } => {
                self.clear();
                println!("{}", style(format!("==> {}", name)).bold());
            }
            ProgressEvent::Cloning { slug } => self.spin(format!("Cloning {}", slug)),
            ProgressEvent::Cloned { slug } => self.done(format!("Cloned {}", slug)),
            ProgressEvent::FetchingBranches { .. } => self.spin("Fetching all branches".to_string()),
            ProgressEvent::BranchesFetched { .. } => {
                self.done("Fetched all branches".to_string());
                println!();
            }
            ProgressEvent::RepositoryFailed { slug, error } => {
                self.clear();
                println!("{}", style(format!("==> Failed {}", slug)).red());
                for line in error.lines().take(5) {
                    println!("    {}", line);
                }
                println!();
            }
            ProgressEvent::SyncFinished { repositories, .. } => {
                if repositories > 0 {
                    self.clear();
                    println!("{}", style("==> Processed all repositories").bold().yellow());
                    println!();
                }
            }
            ProgressEvent::Aborted => {
                self.clear();
                println!("{}", style("==> Interrupted, stopping").bold().red());
            }
        }
    }
}

/// Keeps every event, for assertions
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Progress for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_filled_cells() {
        assert_eq!(filled_cells(1, 2), 10);
        assert_eq!(filled_cells(2, 2), 20);
        assert_eq!(filled_cells(1, 3), 6);
        assert_eq!(filled_cells(0, 0), 0);
        // a page past the advertised total never overflows the bar
        assert_eq!(filled_cells(5, 3), BAR_WIDTH);
    }

    #[test]
    fn test_page_bar() {
        assert_eq!(page_bar(1, 2), format!("[{}{}]", "=".repeat(10), " ".repeat(10)));
        assert_eq!(page_bar(2, 2), format!("[{}]", "=".repeat(BAR_WIDTH)));
        assert_eq!(page_bar(0, 0), format!("[{}]", " ".repeat(BAR_WIDTH)));
    }

    #[quickcheck]
    fn prop_drawn_bar_only_grows(total: u16) -> bool {
        let total = total as u64 % 500 + 1;
        let mut previous = 0;
        for page in 1..=total {
            let bar = page_bar(page, total);
            let filled = bar.chars().filter(|c| *c == '=').count();
            if filled < previous || bar.chars().count() != BAR_WIDTH + 2 {
                return false;
            }
            previous = filled;
        }
        previous == BAR_WIDTH
    }

    #[test]
    fn test_recording_progress_keeps_order() {
        let progress = RecordingProgress::new();
        progress.report(ProgressEvent::Authenticating);
        progress.report(ProgressEvent::Authenticated);
        assert_eq!(
            progress.events(),
            vec![ProgressEvent::Authenticating, ProgressEvent::Authenticated]
        );
    }
}
