use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use filefate_installer::{ProgressEvent, ProgressPhase};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(1);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<8} [{bar:20.cyan/blue}] {bytes:>10}/{total_bytes:10} {elapsed_precise}",
            ) {
                progress_bar.set_style(
                    style
                        .tick_chars(progress_tick_chars(label))
                        .progress_chars("=>-"),
                );
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total: 0,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    /// Feeds one engine progress event into the bar.
    pub(crate) fn observe(&mut self, event: ProgressEvent) {
        match event.phase {
            ProgressPhase::Start => {
                self.total = event.bytes_total;
                if let Some(progress_bar) = &self.progress_bar {
                    progress_bar.set_length(self.total.max(1));
                }
                self.set(event.bytes_done);
            }
            ProgressPhase::Progress | ProgressPhase::Stop => self.set(event.bytes_done),
        }
    }

    fn set(&mut self, current: u64) {
        self.current = current.min(self.total);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };
        progress_bar.set_position(self.current.min(self.total.max(1)));
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "erase" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_u64;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = (bounded_current * width / safe_total) as usize;
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat((width as usize).saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanBytes(current), HumanBytes(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
