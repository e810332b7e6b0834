pub mod events;
pub mod rest;
pub mod signing;
pub mod ws;

pub use rest::{BitfinexRestClient, PaperOrderApi};
pub use ws::{StreamEvent, SubscriptionKey, WsManager, WsSettings};
