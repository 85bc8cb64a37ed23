//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services own the local entry store and the rendering hook.

mod entry;
mod render;

pub use entry::{EntryService, NewEntry, PublishedEntry, root_entries};
pub use render::{LogRenderer, Renderer};
