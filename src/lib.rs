pub mod chain;
pub mod clock;
pub mod compare;
pub mod config;
pub mod diff;
pub mod error;
pub mod live;
pub mod model;
pub mod server;
pub mod store;
pub mod tags;

pub use chain::{ChainSettings, CommitOutcome, CommitRequest, RestoreOutcome, RestoreRequest, VersionChain};
pub use compare::ComparisonCache;
pub use config::{load_config, AppConfig};
pub use error::{VaultError, VaultResult};
pub use model::*;
pub use tags::TagStore;
