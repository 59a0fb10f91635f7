pub mod schema;

pub use schema::{BackupConfig, Config, JobsConfig, PluginsConfig};
