// progress.rs

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prettytable::{row, Table};
use std::time::Duration;

/// Severity of a console log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Coarse phase of a run, prefixed to every log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    Setup,
    InputCheck,
    FrequencyComputation,
    Consolidation,
    Statistics,
    Bootstrap,
    PcaAnalysis,
    Export,
}

impl ProcessingStage {
    fn label(&self) -> &'static str {
        match self {
            ProcessingStage::Setup => "setup",
            ProcessingStage::InputCheck => "input",
            ProcessingStage::FrequencyComputation => "frequencies",
            ProcessingStage::Consolidation => "consolidate",
            ProcessingStage::Statistics => "f-stats",
            ProcessingStage::Bootstrap => "bootstrap",
            ProcessingStage::PcaAnalysis => "pca",
            ProcessingStage::Export => "export",
        }
    }
}

static CURRENT_STAGE: Lazy<Mutex<ProcessingStage>> = Lazy::new(|| Mutex::new(ProcessingStage::Setup));

pub fn set_stage(stage: ProcessingStage) {
    *CURRENT_STAGE.lock() = stage;
}

pub fn current_stage() -> ProcessingStage {
    *CURRENT_STAGE.lock()
}

/// Forwards a message to the `log` facade, tagged with the current stage.
pub fn log(level: LogLevel, message: &str) {
    let stage = current_stage().label();
    match level {
        LogLevel::Info => log::info!("[{}] {}", stage, message),
        LogLevel::Warning => log::warn!("[{}] {}", stage, message),
        LogLevel::Error => log::error!("[{}] {}", stage, message),
    }
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.bold.green} {elapsed_precise} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

pub fn create_step_bar(message: &str, len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    bar.set_message(message.to_string());
    bar
}

pub struct StatusBox {
    pub title: String,
    pub stats: Vec<(String, String)>,
}

pub fn display_status_box(status: StatusBox) {
    let mut table = Table::new();
    for (key, value) in &status.stats {
        table.add_row(row![key, r->value]);
    }
    println!("{}", status.title.bold().cyan());
    table.printstd();
}

/// One progress notification emitted by the engine.
///
/// `Step` drives bar-style indicators, `Category` replaces the message shown
/// under a category, and `CategoryLine` addresses a specific line slot of a
/// multi-line category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Step(u32),
    Category { category: String, message: String },
    CategoryLine { category: String, message: String, line: u32 },
}

impl ProgressEvent {
    pub fn category(category: &str, message: impl Into<String>) -> Self {
        ProgressEvent::Category {
            category: category.to_string(),
            message: message.into(),
        }
    }

    pub fn line(category: &str, message: impl Into<String>, line: u32) -> Self {
        ProgressEvent::CategoryLine {
            category: category.to_string(),
            message: message.into(),
            line,
        }
    }
}

/// Receiver of progress notifications. The engine never inspects what a sink
/// does with an event.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for crossbeam_channel::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Terminal sink used by the command-line driver: steps move an indicatif
/// bar, messages become log lines.
pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new(message: &str, steps: u64) -> Self {
        ConsoleProgress {
            bar: create_step_bar(message, steps),
        }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl ProgressSink for ConsoleProgress {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Step(step) => self.bar.set_position(step as u64),
            ProgressEvent::Category { category, message }
            | ProgressEvent::CategoryLine { category, message, .. } => {
                if !message.is_empty() {
                    self.bar.suspend(|| log(LogLevel::Info, &format!("{}: {}", category, message)));
                }
            }
        }
    }
}

pub fn format_duration(seconds: f64) -> String {
    let minutes = (seconds / 60.0).floor() as u64;
    let rest = seconds - minutes as f64 * 60.0;
    format!("{} minutes, {:.1} seconds", minutes, rest)
}
