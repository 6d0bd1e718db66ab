//! # Ingest Frontend
//!
//! Filesystem-watching grouper for raw correlator output. Each observation
//! arrives as 16 frequency-subband files with a few seconds of timestamp
//! jitter, deposited asynchronously into a watched directory. This crate
//! detects them, canonicalizes their timestamps (renaming in place),
//! assembles them into observation groups, and emits `GroupReady` events the
//! coordination core turns into imaging workflows.
//!
//! ```text
//!  /data/incoming              ┌───────────────────┐
//!  ┌──────────────────┐ notify │ DirectoryWatcher  │  SubbandEvent
//!  │ ..._sb00.hdf5    │ ─────► │ (parse filenames) │ ─────────────┐
//!  │ ..._sb01.hdf5    │        └───────────────────┘              ▼
//!  │ ...              │                                  ┌────────────────┐
//!  └──────────────────┘        ┌───────────────────┐     │    Grouper     │
//!                       rename │  canonical names  │ ◄── │ (canonicalize, │
//!                       ◄───── │                   │     │  track bitmap) │
//!                              └───────────────────┘     └────────────────┘
//!                                                                 │
//!                                              GroupReady events  ▼
//!                                                    (to the scheduler)
//! ```

pub mod filename;
pub mod grouper;
pub mod service;
pub mod watcher;

pub use filename::{canonical_name, canonical_path, FilenameError, SubbandFilename};
pub use grouper::{Disposition, Grouper, GrouperConfig, GrouperError, SweepOutcome};
pub use service::{IngestError, IngestService};
pub use watcher::{DirectoryWatcher, SubbandEvent, WatchError};
