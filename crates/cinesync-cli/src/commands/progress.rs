use cinesync_core::ProgressObserver;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Progress bars for interactive runs; structured log lines otherwise.
pub struct RunProgress {
    _multi: MultiProgress,
    overall: ProgressBar,
    spinner: ProgressBar,
    interactive: bool,
}

impl RunProgress {
    pub fn new(enabled: bool) -> Self {
        let interactive = enabled && is_interactive();
        let multi = MultiProgress::new();
        if !interactive {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }

        let overall = multi.add(ProgressBar::new(0));
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        overall.set_message("movies");

        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        if !interactive {
            tracing::debug!(operation = "ui_init", mode = "non_interactive", "Progress bars disabled, using structured logging");
        }

        Self {
            _multi: multi,
            overall,
            spinner,
            interactive,
        }
    }

    pub fn finish(&self) {
        if self.interactive {
            self.spinner.finish_and_clear();
            self.overall.finish_and_clear();
        }
    }
}

impl ProgressObserver for RunProgress {
    fn stage(&self, message: &str) {
        if self.interactive {
            self.spinner.set_message(message.to_string());
            self.spinner.tick();
        } else {
            tracing::info!(operation = "progress", message, "Progress update");
        }
    }

    fn queued(&self, count: usize) {
        self.overall.inc_length(count as u64);
    }

    fn handled(&self, count: usize) {
        self.overall.inc(count as u64);
        if !self.interactive {
            let total = self.overall.length().unwrap_or(0);
            let current = self.overall.position();
            tracing::debug!(
                operation = "progress",
                current,
                total,
                percent = if total == 0 { 100 } else { (current as f64 / total as f64 * 100.0) as u8 },
                "Progress update"
            );
        }
    }
}

pub fn is_interactive() -> bool {
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}
