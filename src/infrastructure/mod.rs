pub mod bitfinex;
pub mod core;
pub mod mock;
pub mod nonce;
pub mod observability;
pub mod persistence;
