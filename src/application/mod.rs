// Command handling
pub mod commands;

// Strategy evaluation pipeline
pub mod evaluation;

// The executor aggregate
pub mod executor;

// Bars, quotes, symbol mapping
pub mod market_data;
pub mod symbol_map;

// Position registry, smart exits, order dispatch
pub mod positions;

// Pre-trade risk gating
pub mod risk;

// Process-scoped shared state
pub mod state;

// Metrics, heartbeat, alerts
pub mod telemetry;
