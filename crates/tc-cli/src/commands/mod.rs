//! CLI subcommand implementations.

pub mod credits;
pub mod detect;
pub mod enroll;
pub mod recurring;
pub mod session;
pub mod slots;
pub mod status;
pub mod util;
pub mod waitlist;

#[cfg(test)]
pub(crate) mod test_support;
