//! Exchange adapter abstraction and implementations.
//!
//! One trait per exchange family, watch methods returning cancellable
//! streams, a typed error taxonomy the executor's retry policy keys off,
//! and credential handling: key material is decrypted only inside this
//! crate, compiled clients are cached per credential with a TTL.

pub mod adapter;
pub mod binance;
pub mod client_cache;
pub mod credentials;
pub mod paper;

pub use adapter::{
    AccountBalance, ExchangeAdapter, ExchangeError, FillEvent, MarketInfo, OrderAck, OrderRequest,
    WatchStream,
};
pub use binance::BinanceAdapter;
pub use client_cache::ClientCache;
pub use credentials::{CredentialHandle, CredentialVault, Credentials, SecretCipher, StaticVault, StoreVault};
pub use paper::PaperExchange;

pub type Result<T> = std::result::Result<T, adapter::ExchangeError>;
