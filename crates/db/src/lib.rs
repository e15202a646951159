pub mod connection;
pub mod directory;
pub mod migrations;
pub mod store;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use directory::SqlDirectory;
pub use store::SqlWorkflowStore;
