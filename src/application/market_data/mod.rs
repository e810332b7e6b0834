pub mod cache;
pub mod facade;
pub mod private_state;

pub use cache::{CandleCache, CandleUpsert, TickerCache};
pub use facade::MarketDataFacade;
pub use private_state::PrivateState;
