use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style(mark: &str) -> ProgressStyle {
    let template = format!("[{{prefix}}] {mark} {{msg}}");
    ProgressStyle::default_spinner()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// A single spinner for a multi-step command. Hidden when not drawing to a
/// terminal, so piped and JSON output stay clean.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new(prefix: &str, message: impl Into<String>, visible: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.to_string());
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    pub fn succeed(self, message: impl Into<String>) {
        self.bar.set_style(done_style("\u{2713}"));
        self.bar.finish_with_message(message.into());
    }

    pub fn fail(self, message: impl Into<String>) {
        self.bar.set_style(done_style("\u{2717}"));
        self.bar.finish_with_message(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_spinner_finishes() {
        let spinner = Spinner::new("create", "working", false);
        spinner.set_message("still working");
        assert!(spinner.bar.is_hidden());
        spinner.succeed("done");
    }
}
