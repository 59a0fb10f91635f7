#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::cast_possible_truncation,
    clippy::return_self_not_must_use
)]

//! Hestia: job scheduling and sandboxed plugin execution for a personal
//! assistant backend.
//!
//! The two pillars are [`plugins`] (registry, lifecycle, installation) and
//! [`jobs`] (store, scheduler, runner). Plugin execution goes through the
//! [`sandbox`] executor, every state change lands in the [`audit`] log, and
//! per-plugin outcome counters live in [`observability`].

pub mod audit;
pub mod config;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod plugins;
pub mod sandbox;

pub use config::Config;
pub use error::{HestiaError, Result};
