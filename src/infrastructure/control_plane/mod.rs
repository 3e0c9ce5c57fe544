pub mod push;
pub mod rest;

pub use push::{PushChannel, PushEvent};
pub use rest::{
    AlertCategory, CommandOutcome, ControlPlaneClient, HeartbeatReply, LlmConsultReply,
    LlmConsultRequest, PendingCommand, TradeCloseReport, TradeOpenReport,
};
