//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                                          |
//! |------|------------------------------------------------------------------|
//! | 0    | Success                                                          |
//! | 1    | Fatal: bad config, missing file, < 2 usable sources, write error |
//! | 1    | Usage error: unknown flag, missing argument or subcommand        |
//! | 2    | Partial: rows skipped or a source dropped; report still written  |
//!
//! Code 2 always means the report and summary are on disk. Help and version
//! output exit 0.

use clap::error::ErrorKind;
use crossdetect_recon::ReconError;

/// Success - every source loaded cleanly and the report was written.
pub const EXIT_SUCCESS: u8 = 0;

/// Fatal error - nothing was written.
pub const EXIT_ERROR: u8 = 1;

/// Partial success - the report was written from the data that loaded.
pub const EXIT_PARTIAL: u8 = 2;

/// Map an engine error to its exit code. Every engine error is fatal.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_)
        | ReconError::ConfigValidation(_)
        | ReconError::UnknownSource(_)
        | ReconError::SourceUnavailable { .. }
        | ReconError::InsufficientSources { .. }
        | ReconError::Write { .. }
        | ReconError::Io(_) => EXIT_ERROR,
    }
}

/// Map a clap parse failure to its exit code. clap's own default (2) would
/// collide with a partial run.
pub fn usage_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_SUCCESS,
        _ => EXIT_ERROR,
    }
}
