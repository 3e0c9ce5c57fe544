use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which account profile the executor is running against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Demo,
    Live,
}

/// Per-account pre-trade limits enforced by the risk gatekeeper.
///
/// Updates are infrequent and go through a mutex on the executor; the
/// checks themselves only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Absolute daily loss ceiling in account currency.
    pub max_daily_loss: Decimal,
    /// Daily loss ceiling as a percentage of the starting balance.
    pub max_daily_loss_pct: f64,
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub max_positions: usize,
    pub max_lot_size: Decimal,
    pub max_total_exposure: Decimal,
    pub max_correlation: f64,
    pub require_margin_check: bool,
    pub check_trading_hours: bool,
    pub check_news: bool,
    pub allow_high_risk: bool,
    /// Stop all strategies automatically when a hard limit trips.
    pub auto_stop_on_limit: bool,
    pub require_confirmation: bool,
}

impl RiskLimits {
    /// Permissive profile for demo accounts.
    pub fn demo() -> Self {
        Self {
            max_daily_loss: dec!(1000),
            max_daily_loss_pct: 10.0,
            max_drawdown: dec!(3000),
            max_drawdown_pct: 30.0,
            max_positions: 10,
            max_lot_size: dec!(1.0),
            max_total_exposure: dec!(10000),
            max_correlation: 0.9,
            require_margin_check: true,
            check_trading_hours: true,
            check_news: false,
            allow_high_risk: true,
            auto_stop_on_limit: false,
            require_confirmation: false,
        }
    }

    /// Conservative profile for live accounts.
    pub fn live() -> Self {
        Self {
            max_daily_loss: dec!(200),
            max_daily_loss_pct: 2.0,
            max_drawdown: dec!(600),
            max_drawdown_pct: 6.0,
            max_positions: 3,
            max_lot_size: dec!(0.1),
            max_total_exposure: dec!(1000),
            max_correlation: 0.7,
            require_margin_check: true,
            check_trading_hours: true,
            check_news: true,
            allow_high_risk: false,
            auto_stop_on_limit: true,
            require_confirmation: true,
        }
    }

    pub fn preset(kind: AccountKind) -> Self {
        match kind {
            AccountKind::Demo => Self::demo(),
            AccountKind::Live => Self::live(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_is_tighter_than_demo() {
        let demo = RiskLimits::demo();
        let live = RiskLimits::live();
        assert!(live.max_daily_loss < demo.max_daily_loss);
        assert!(live.max_positions < demo.max_positions);
        assert!(live.max_lot_size < demo.max_lot_size);
        assert!(live.max_total_exposure < demo.max_total_exposure);
        assert!(live.require_confirmation);
        assert!(!live.allow_high_risk);
    }

    #[test]
    fn test_preset_dispatch() {
        assert_eq!(RiskLimits::preset(AccountKind::Demo), RiskLimits::demo());
        assert_eq!(RiskLimits::preset(AccountKind::Live), RiskLimits::live());
    }
}
