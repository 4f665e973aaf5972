//! Sources of G-code lines. A source is restartable: every call to
//! [GcodeSource::lines] yields a fresh pass over the same sequence.

use std::path::{Path, PathBuf};

use anyhow::Result;

/// A restartable, finite sequence of G-code text lines.
pub trait GcodeSource: Send + Sync {
    /// Iterate the lines from the beginning.
    fn lines(&self) -> Box<dyn Iterator<Item = String> + Send + '_>;

    /// Approximate number of lines, used for progress reporting.
    fn line_count(&self) -> usize;
}

/// An in-memory list of lines. Used for the warmup and cooldown blocks
/// bracketing every build.
pub struct StringListSource(Vec<String>);

impl StringListSource {
    /// A source over the given lines.
    pub fn new(lines: Vec<String>) -> Self {
        Self(lines)
    }

    /// Split a newline-separated block into a source, dropping blank
    /// lines.
    pub fn from_block(block: &str) -> Self {
        Self(
            block
                .lines()
                .map(|l| l.trim().to_owned())
                .filter(|l| !l.is_empty())
                .collect(),
        )
    }
}

impl GcodeSource for StringListSource {
    fn lines(&self) -> Box<dyn Iterator<Item = String> + Send + '_> {
        Box::new(self.0.iter().cloned())
    }

    fn line_count(&self) -> usize {
        self.0.len()
    }
}

/// A G-code file, read into memory once when opened.
pub struct GcodeFile {
    path: PathBuf,
    lines: Vec<String>,
}

impl GcodeFile {
    /// Read the file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self {
            path: path.to_owned(),
            lines: contents.lines().map(str::to_owned).collect(),
        })
    }

    /// The path this file was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GcodeSource for GcodeFile {
    fn lines(&self) -> Box<dyn Iterator<Item = String> + Send + '_> {
        Box::new(self.lines.iter().cloned())
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_list_restarts() {
        let source = StringListSource::new(vec!["G1 X10".into(), "G1 X20".into()]);
        assert_eq!(source.line_count(), 2);
        assert_eq!(source.lines().count(), 2);
        // A second pass starts over.
        assert_eq!(source.lines().next().unwrap(), "G1 X10");
    }

    #[test]
    fn block_drops_blanks() {
        let source = StringListSource::from_block("M104 S200\n\n  M6 T0  \n");
        let lines: Vec<_> = source.lines().collect();
        assert_eq!(lines, vec!["M104 S200", "M6 T0"]);
        assert_eq!(source.line_count(), 2);
    }
}
