pub mod broker;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod exec;
pub mod layout;
pub mod port_alloc;
pub mod reconcile;
pub mod relay;
pub mod repository;
pub mod stack;
pub mod supervisor;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use config::DriverConfig;
pub use driver::{CreateOptions, InstanceDetails, LauncherSettings, LocalDriver};
pub use error::DriverError;
pub use repository::{JsonRepository, Repository};
