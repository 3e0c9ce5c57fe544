use std::collections::HashMap;

/// Maps strategy symbols to broker symbols.
///
/// Brokers suffix or rename instruments ("EURUSD.m", "EURUSDmicro"); the
/// table is user-extensible and falls back to the identity mapping.
#[derive(Debug, Clone, Default)]
pub struct SymbolMapper {
    table: HashMap<String, String>,
}

impl SymbolMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.table.insert(from.into(), to.into());
    }

    pub fn map<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.table.get(symbol).map(String::as_str).unwrap_or(symbol)
    }
}
