//! Progress reporting boundary. Purely observational.

use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressSink: Send + Sync {
    fn total(&self, count: u64);
    fn advance(&self, n: u64);
    fn finish(&self) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn total(&self, _count: u64) {}
    fn advance(&self, _n: u64) {}
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
        bar.set_style(style);
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarProgress {
    fn total(&self, count: u64) {
        self.bar.set_length(count);
    }

    fn advance(&self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_counts() {
        let bar = BarProgress::hidden();
        bar.total(3);
        bar.advance(1);
        bar.advance(2);
        assert_eq!(bar.position(), 3);
        assert_eq!(bar.length(), Some(3));
    }
}
