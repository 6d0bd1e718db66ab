//! Task queue client and maintenance loops

mod client;
mod reaper;
mod retention;

pub use client::TaskQueue;
pub use reaper::{Reaper, ReaperConfig};
pub use retention::{Retention, RetentionConfig};
