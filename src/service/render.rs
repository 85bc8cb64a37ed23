//! Site rendering hook
//!
//! HTML pages and feeds are produced outside this crate from the entry
//! store. The server calls the configured `Renderer` at startup and after
//! each new entry.

use crate::error::AppError;
use crate::federation::model::ApObject;

use super::entry::root_entries;

/// Consumer of the entry store
pub trait Renderer: Send + Sync {
    /// Rebuild the pages of `host` from `entries` (oldest first)
    fn render(&self, host: &str, entries: &[ApObject]) -> Result<(), AppError>;
}

/// Renderer that only reports what would be rendered
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&self, host: &str, entries: &[ApObject]) -> Result<(), AppError> {
        let roots = root_entries(entries).len();
        tracing::info!(
            host,
            entries = entries.len(),
            root_entries = roots,
            "Render requested"
        );
        Ok(())
    }
}
