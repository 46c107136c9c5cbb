//! CLI Module
//!
//! Exit codes for the diagnostic binary

pub mod exit_codes;

pub use exit_codes::{
    error_code, exit_code_description, from_anyhow, install_panic_hook, internal_error, print_exit_codes, CliResult,
    ExitCodes, UsageError,
};
