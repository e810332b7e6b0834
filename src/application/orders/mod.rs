pub mod bracket;
pub mod idempotency;
pub mod pipeline;

pub use bracket::{BracketGroup, BracketManager, BracketState};
pub use idempotency::TtlCache;
pub use pipeline::{DeadLetter, OrderPipeline, PlaceOrderResult};
