use std::io::Write;

use piecemeal::Progress;

/// The number of cells in the progress bar.
const BAR_LEN: usize = 50;

/// Redraws the progress line in place.
#[derive(Debug, Default)]
pub struct Printer {
    /// Set once the line of the completed download was ended.
    done: bool,
}

impl Printer {
    /// Rewrites the progress line on stdout.
    pub fn print(&mut self, progress: &Progress) {
        let mut stdout = std::io::stdout();
        let _ = self.write(&mut stdout, progress);
    }

    /// Rewrites the progress line, ending it on the first tick the download
    /// is complete.
    fn write(
        &mut self,
        out: &mut impl Write,
        progress: &Progress,
    ) -> std::io::Result<()> {
        write!(out, "\r{}", render(progress))?;
        if progress.is_complete() && !self.done {
            self.done = true;
            writeln!(out)?;
        }
        out.flush()
    }
}

fn render(progress: &Progress) -> String {
    let percent = progress.fraction * 100.0;
    let filled = ((progress.fraction * BAR_LEN as f64) as usize).min(BAR_LEN);
    format!(
        "Progress: |{}{}| {:.1}% | {:.2} MB | {} Peers",
        "█".repeat(filled),
        "-".repeat(BAR_LEN - filled),
        percent,
        progress.downloaded_mb,
        progress.peer_count
    )
}
