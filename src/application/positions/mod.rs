pub mod dispatcher;
pub mod registry;
pub mod smart_exit;

pub use dispatcher::OrderDispatcher;
pub use registry::{PositionRecord, PositionRegistry, RegistrySummary, SYNC_INTERVAL};
pub use smart_exit::{ExitAction, ExitPlan, SmartExitManager, plan_exits};
