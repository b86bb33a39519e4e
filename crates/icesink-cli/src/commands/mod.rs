//! CLI subcommands.

pub mod commit;
pub mod run;
pub mod validate;
