pub mod checks;
pub mod correlation;
pub mod gatekeeper;

pub use checks::{CheckOutcome, RiskCheck, RiskContext};
pub use correlation::{CorrelationAdjustment, CorrelationCache, correlation_adjustment};
pub use gatekeeper::{AccountState, GateReport, RiskGatekeeper};
