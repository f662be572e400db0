//! Accounts Ledger
//!
//! The only place user balances live. Cash and per-ticker share balances are
//! split into `available` and `frozen` portions; placing an order moves value
//! available -> frozen (escrow), settlement consumes frozen value, and
//! cancellation moves it back. Externally observable cash is
//! `available + frozen` and buying power is `available`.
//!
//! The market-maker principal bypasses reservation entirely: reserve/release
//! are no-ops for it and settlement debits hit `available` directly, which is
//! allowed to go negative.

use crate::services::exchange::ExchangeError;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Cash balance split into spendable and escrowed portions
#[derive(Debug, Clone, Default)]
pub struct CashBalance {
    pub available: Decimal,
    pub frozen: Decimal,
}

impl CashBalance {
    pub fn total(&self) -> Decimal {
        self.available + self.frozen
    }
}

/// Share balance for one ticker
///
/// Signed so the market-maker principal can run a short inventory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareBalance {
    pub available: i64,
    pub frozen: i64,
}

impl ShareBalance {
    pub fn total(&self) -> i64 {
        self.available + self.frozen
    }
}

/// One user's balances
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: Uuid,
    pub username: String,
    pub cash: CashBalance,
    pub holdings: HashMap<String, ShareBalance>,
    pub is_market_maker: bool,
}

impl Account {
    pub fn new(user_id: Uuid, username: String, cash: Decimal, is_market_maker: bool) -> Self {
        Self {
            user_id,
            username,
            cash: CashBalance {
                available: cash,
                frozen: Decimal::ZERO,
            },
            holdings: HashMap::new(),
            is_market_maker,
        }
    }
}

/// Read-only view of one holding
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HoldingSnapshot {
    pub total: i64,
    pub available: i64,
    pub escrowed: i64,
}

/// Read-only view of one account
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub user_id: Uuid,
    pub username: String,
    /// available + escrowed
    pub cash: Decimal,
    /// cash minus escrowed cash
    pub buying_power: Decimal,
    pub escrowed_cash: Decimal,
    pub holdings: HashMap<String, HoldingSnapshot>,
    pub is_market_maker: bool,
}

/// Concurrent user balance table
///
/// Each account sits behind its own mutex so a check-and-reserve is atomic
/// even when two tickers race on the same user's cash. Critical sections
/// never nest two account locks.
pub struct AccountsLedger {
    accounts: DashMap<Uuid, Mutex<Account>>,
}

impl AccountsLedger {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Register a new account. Fails when the id is already taken.
    pub fn register(&self, account: Account) -> Result<(), ExchangeError> {
        let user_id = account.user_id;
        if self.accounts.contains_key(&user_id) {
            return Err(ExchangeError::InvalidOrder(format!(
                "user {user_id} is already registered"
            )));
        }
        self.accounts.insert(user_id, Mutex::new(account));
        Ok(())
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.accounts.contains_key(&user_id)
    }

    /// Look up a user id by username. Startup-time convenience.
    pub fn find_by_username(&self, username: &str) -> Option<Uuid> {
        self.accounts
            .iter()
            .find(|entry| entry.value().lock().username == username)
            .map(|entry| *entry.key())
    }

    /// Snapshot an account's externally observable state
    pub fn snapshot(&self, user_id: Uuid) -> Option<AccountSnapshot> {
        let entry = self.accounts.get(&user_id)?;
        let account = entry.lock();
        Some(AccountSnapshot {
            user_id: account.user_id,
            username: account.username.clone(),
            cash: account.cash.total(),
            buying_power: account.cash.available,
            escrowed_cash: account.cash.frozen,
            holdings: account
                .holdings
                .iter()
                .map(|(ticker, balance)| {
                    (
                        ticker.clone(),
                        HoldingSnapshot {
                            total: balance.total(),
                            available: balance.available,
                            escrowed: balance.frozen,
                        },
                    )
                })
                .collect(),
            is_market_maker: account.is_market_maker,
        })
    }

    /// Directly credit spendable shares, outside any order flow.
    /// Used when seeding accounts and when recovering persisted holdings.
    pub fn deposit_shares(&self, user_id: Uuid, ticker: &str, quantity: i64) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        account.holdings.entry(ticker.to_string()).or_default().available += quantity;
        Ok(())
    }

    // ========================================================================
    // Escrow
    // ========================================================================

    /// Reserve cash backing a buy order. No-op for the market maker.
    pub fn reserve_cash(&self, user_id: Uuid, amount: Decimal) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        if account.is_market_maker {
            return Ok(());
        }
        if account.cash.available < amount {
            return Err(ExchangeError::InsufficientFunds {
                required: amount,
                available: account.cash.available,
            });
        }
        account.cash.available -= amount;
        account.cash.frozen += amount;
        Ok(())
    }

    /// Release reserved cash back to buying power. No-op for the market maker.
    pub fn release_cash(&self, user_id: Uuid, amount: Decimal) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        if account.is_market_maker {
            return Ok(());
        }
        debug_assert!(account.cash.frozen >= amount);
        account.cash.frozen -= amount;
        account.cash.available += amount;
        Ok(())
    }

    /// Reserve shares backing a sell order. No-op for the market maker.
    pub fn reserve_shares(
        &self,
        user_id: Uuid,
        ticker: &str,
        quantity: u64,
    ) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        if account.is_market_maker {
            return Ok(());
        }
        let quantity = quantity as i64;
        let balance = account.holdings.entry(ticker.to_string()).or_default();
        if balance.available < quantity {
            return Err(ExchangeError::InsufficientShares {
                ticker: ticker.to_string(),
                required: quantity as u64,
                available: balance.available,
            });
        }
        balance.available -= quantity;
        balance.frozen += quantity;
        Ok(())
    }

    /// Release reserved shares back to available. No-op for the market maker.
    pub fn release_shares(
        &self,
        user_id: Uuid,
        ticker: &str,
        quantity: u64,
    ) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        if account.is_market_maker {
            return Ok(());
        }
        let quantity = quantity as i64;
        let balance = account.holdings.entry(ticker.to_string()).or_default();
        debug_assert!(balance.frozen >= quantity);
        balance.frozen -= quantity;
        balance.available += quantity;
        Ok(())
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Consume reserved cash for a fill. The market maker pays from its
    /// spendable balance instead, which may go negative.
    pub fn debit_reserved_cash(&self, user_id: Uuid, amount: Decimal) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        if account.is_market_maker {
            account.cash.available -= amount;
        } else {
            debug_assert!(account.cash.frozen >= amount);
            account.cash.frozen -= amount;
        }
        Ok(())
    }

    /// Credit spendable cash from a fill
    pub fn credit_cash(&self, user_id: Uuid, amount: Decimal) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        entry.lock().cash.available += amount;
        Ok(())
    }

    /// Consume reserved shares for a fill. The market maker delivers from its
    /// spendable inventory instead, which may go short.
    pub fn debit_reserved_shares(
        &self,
        user_id: Uuid,
        ticker: &str,
        quantity: u64,
    ) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        let is_market_maker = account.is_market_maker;
        let quantity = quantity as i64;
        let balance = account.holdings.entry(ticker.to_string()).or_default();
        if is_market_maker {
            balance.available -= quantity;
        } else {
            debug_assert!(balance.frozen >= quantity);
            balance.frozen -= quantity;
        }
        Ok(())
    }

    /// Credit spendable shares from a fill
    pub fn credit_shares(
        &self,
        user_id: Uuid,
        ticker: &str,
        quantity: u64,
    ) -> Result<(), ExchangeError> {
        let entry = self
            .accounts
            .get(&user_id)
            .ok_or(ExchangeError::UnknownUser(user_id))?;
        let mut account = entry.lock();
        account.holdings.entry(ticker.to_string()).or_default().available += quantity as i64;
        Ok(())
    }
}

impl Default for AccountsLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger_with_user(cash: Decimal, is_market_maker: bool) -> (AccountsLedger, Uuid) {
        let ledger = AccountsLedger::new();
        let user_id = Uuid::new_v4();
        ledger
            .register(Account::new(user_id, "alice".to_string(), cash, is_market_maker))
            .unwrap();
        (ledger, user_id)
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let (ledger, user_id) = ledger_with_user(dec!(100), false);
        let dup = Account::new(user_id, "alice".to_string(), dec!(100), false);
        assert!(ledger.register(dup).is_err());
    }

    #[test]
    fn test_reserve_and_release_cash() {
        let (ledger, user_id) = ledger_with_user(dec!(1000), false);

        ledger.reserve_cash(user_id, dec!(400)).unwrap();
        let snap = ledger.snapshot(user_id).unwrap();
        assert_eq!(snap.cash, dec!(1000));
        assert_eq!(snap.buying_power, dec!(600));
        assert_eq!(snap.escrowed_cash, dec!(400));

        ledger.release_cash(user_id, dec!(400)).unwrap();
        let snap = ledger.snapshot(user_id).unwrap();
        assert_eq!(snap.buying_power, dec!(1000));
        assert_eq!(snap.escrowed_cash, dec!(0));
    }

    #[test]
    fn test_reserve_cash_insufficient() {
        let (ledger, user_id) = ledger_with_user(dec!(100), false);
        let err = ledger.reserve_cash(user_id, dec!(100.01)).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientFunds { .. }));
        // Nothing was taken
        assert_eq!(ledger.snapshot(user_id).unwrap().buying_power, dec!(100));
    }

    #[test]
    fn test_reserve_shares_insufficient() {
        let (ledger, user_id) = ledger_with_user(dec!(100), false);
        ledger.deposit_shares(user_id, "ACME", 5).unwrap();

        assert!(ledger.reserve_shares(user_id, "ACME", 5).is_ok());
        let err = ledger.reserve_shares(user_id, "ACME", 1).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientShares { .. }));
    }

    #[test]
    fn test_settlement_moves_value() {
        let (ledger, buyer) = ledger_with_user(dec!(1000), false);
        let seller = Uuid::new_v4();
        ledger
            .register(Account::new(seller, "bob".to_string(), dec!(0), false))
            .unwrap();
        ledger.deposit_shares(seller, "ACME", 10).unwrap();

        // Buyer escrows 10 @ 100, seller escrows 10 shares
        ledger.reserve_cash(buyer, dec!(1000)).unwrap();
        ledger.reserve_shares(seller, "ACME", 10).unwrap();

        // Fill 10 @ 95: buyer pays 950, gets 50 back, seller receives 950
        ledger.debit_reserved_cash(buyer, dec!(950)).unwrap();
        ledger.release_cash(buyer, dec!(50)).unwrap();
        ledger.credit_shares(buyer, "ACME", 10).unwrap();
        ledger.debit_reserved_shares(seller, "ACME", 10).unwrap();
        ledger.credit_cash(seller, dec!(950)).unwrap();

        let buyer_snap = ledger.snapshot(buyer).unwrap();
        assert_eq!(buyer_snap.cash, dec!(50));
        assert_eq!(buyer_snap.buying_power, dec!(50));
        assert_eq!(buyer_snap.holdings["ACME"].total, 10);

        let seller_snap = ledger.snapshot(seller).unwrap();
        assert_eq!(seller_snap.cash, dec!(950));
        assert_eq!(seller_snap.holdings["ACME"].total, 0);
    }

    #[test]
    fn test_market_maker_bypasses_escrow_and_goes_negative() {
        let (ledger, mm) = ledger_with_user(dec!(0), true);

        // Reservation is a no-op
        ledger.reserve_cash(mm, dec!(1_000_000)).unwrap();
        ledger.reserve_shares(mm, "ACME", 1_000_000).unwrap();
        let snap = ledger.snapshot(mm).unwrap();
        assert_eq!(snap.escrowed_cash, dec!(0));

        // Settlement debits hit the spendable balances directly
        ledger.debit_reserved_cash(mm, dec!(500)).unwrap();
        ledger.debit_reserved_shares(mm, "ACME", 25).unwrap();
        let snap = ledger.snapshot(mm).unwrap();
        assert_eq!(snap.cash, dec!(-500));
        assert_eq!(snap.holdings["ACME"].total, -25);
    }

    #[test]
    fn test_unknown_user() {
        let ledger = AccountsLedger::new();
        let err = ledger.reserve_cash(Uuid::new_v4(), dec!(1)).unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownUser(_)));
    }
}
