//! Pairwise tick transport over a named local channel
//!
//! One `TickWriter` binds `{dir}/{name}.sock` and streams ticks to exactly
//! one `TickReader`. Delivery is ordered and at-least-once; there is no
//! reconnect, a broken channel stays broken for the life of the instance.

pub mod reader;
pub mod writer;

pub use reader::{AdvanceOutcome, TickHandler, TickReader};
pub use writer::{TickSender, TickWriter};

use std::path::Path;

/// Metrics label for a socket path
pub(crate) fn channel_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
