//! Tuition class management CLI library.
//!
//! This crate provides the CLI interface over the class ledger, schedule and
//! waitlist stored by `tc-db`.

mod cli;
pub mod commands;
mod config;

pub use cli::{
    Cli, Commands, CreditsAction, EnrollAction, PlacementArgs, RecurringAction, SessionAction,
    SlotsAction, WaitTargetArgs, WaitlistAction,
};
pub use config::Config;
