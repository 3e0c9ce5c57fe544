//! Process-scoped mutable state, threaded through the components instead of
//! living in module globals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// Balances and counters the whole executor shares: daily PnL, the peak for
/// drawdown, the missed-heartbeat counter and the emergency flag.
pub struct ExecutorState {
    inner: Mutex<Balances>,
    missed_heartbeats: AtomicU32,
    emergency: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
struct Balances {
    daily_pnl: Decimal,
    starting_balance: Decimal,
    peak_balance: Decimal,
    last_reset: DateTime<Utc>,
}

impl ExecutorState {
    pub fn new(starting_balance: Decimal) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Balances {
                daily_pnl: Decimal::ZERO,
                starting_balance,
                peak_balance: starting_balance,
                last_reset: Utc::now(),
            }),
            missed_heartbeats: AtomicU32::new(0),
            emergency: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn emergency_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.emergency)
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Idempotent by design: repeated calls leave state unchanged.
    pub fn set_emergency(&self) -> bool {
        !self.emergency.swap(true, Ordering::SeqCst)
    }

    pub fn clear_emergency(&self) {
        self.emergency.store(false, Ordering::SeqCst);
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.inner.lock().expect("state poisoned").daily_pnl
    }

    pub fn starting_balance(&self) -> Decimal {
        self.inner.lock().expect("state poisoned").starting_balance
    }

    pub fn peak_balance(&self) -> Decimal {
        self.inner.lock().expect("state poisoned").peak_balance
    }

    pub fn add_realized_pnl(&self, amount: Decimal) {
        let mut inner = self.inner.lock().expect("state poisoned");
        inner.daily_pnl += amount;
    }

    /// Track the equity high-water mark for drawdown checks.
    pub fn observe_equity(&self, equity: Decimal) {
        let mut inner = self.inner.lock().expect("state poisoned");
        if equity > inner.peak_balance {
            inner.peak_balance = equity;
        }
    }

    /// Midnight reset: zero the daily PnL, rebase the starting balance, and
    /// clear the missed-heartbeat counter.
    pub fn daily_reset(&self, current_balance: Decimal) {
        let mut inner = self.inner.lock().expect("state poisoned");
        inner.daily_pnl = Decimal::ZERO;
        inner.starting_balance = current_balance;
        inner.last_reset = Utc::now();
        drop(inner);
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }

    pub fn last_reset(&self) -> DateTime<Utc> {
        self.inner.lock().expect("state poisoned").last_reset
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::SeqCst)
    }

    pub fn record_heartbeat_failure(&self) -> u32 {
        self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Any successful report zeroes the counter.
    pub fn record_heartbeat_success(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_daily_reset_zeroes_pnl_and_heartbeats() {
        let state = ExecutorState::new(dec!(10000));
        state.add_realized_pnl(dec!(-150));
        state.record_heartbeat_failure();
        state.record_heartbeat_failure();

        state.daily_reset(dec!(9850));
        assert_eq!(state.daily_pnl(), dec!(0));
        assert_eq!(state.starting_balance(), dec!(9850));
        assert_eq!(state.missed_heartbeats(), 0);
    }

    #[test]
    fn test_peak_only_rises() {
        let state = ExecutorState::new(dec!(10000));
        state.observe_equity(dec!(10500));
        state.observe_equity(dec!(10200));
        assert_eq!(state.peak_balance(), dec!(10500));
    }

    #[test]
    fn test_emergency_is_idempotent() {
        let state = ExecutorState::new(dec!(10000));
        assert!(state.set_emergency());
        // Second invocation reports no transition and changes nothing.
        assert!(!state.set_emergency());
        assert!(state.is_emergency());
    }

    #[test]
    fn test_heartbeat_success_resets_counter() {
        let state = ExecutorState::new(dec!(10000));
        assert_eq!(state.record_heartbeat_failure(), 1);
        assert_eq!(state.record_heartbeat_failure(), 2);
        state.record_heartbeat_success();
        assert_eq!(state.missed_heartbeats(), 0);
    }
}
