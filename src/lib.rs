//! tradepulse backend: real-time market-data-to-trade pipeline.
//!
//! The workspace libraries do the work; this crate re-exports them and
//! carries the `tradepulse` binary that wires everything together.
//!
//! - `market_types`: shared domain model and topic naming
//! - `market_bus`: in-process topic bus with consumer groups
//! - `hot_cache`: TTL'd market state (memory or Redis)
//! - `market_store`: durable time-series store on sqlx/SQLite
//! - `exchange_core`: exchange adapters, credentials, paper exchange
//! - `trade_pipeline`: the six supervised components and their wiring

pub use exchange_core;
pub use hot_cache;
pub use market_bus;
pub use market_store;
pub use market_types;
pub use trade_pipeline;
