//! Terminal progress bar fed by engine progress events.

use std::io::{self, IsTerminal};
use std::time::Duration;

use codictate_backup::{ProgressEvent, ProgressSink, Stage};
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} {msg:<16} [{bar:30.cyan/blue}] {percent:>3}% {eta}";

/// Progress bar on stderr; hidden when stderr is not a terminal.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new(enabled: bool) -> Self {
        if !(enabled && io::stderr().is_terminal()) {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarSink {
    fn on_progress(&self, event: &ProgressEvent) {
        self.bar.set_message(stage_label(event.phase));
        self.bar.set_length(event.total.max(event.current));
        self.bar.set_position(event.current);
    }
}

fn stage_label(stage: Stage) -> String {
    match stage {
        Stage::Restore(phase) => format!("restore: {phase}"),
        other => other.to_string(),
    }
}
