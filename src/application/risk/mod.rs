pub mod engine;
pub mod trading_window;

pub use engine::{RiskDecision, RiskPolicyEngine};
