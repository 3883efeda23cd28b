use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::config::BankConfig;
use crate::error::{BankError, ConfigError, Result};

/// A fixed set of accounts guarded by one lock each.
///
/// Operations lock the accounts they touch in ascending index order and release them in
/// descending order, so two transfers in opposite directions can never deadlock. Every
/// check happens before the first mutation: a rejected operation leaves all balances as
/// they were.
pub struct Bank {
    accounts: Box<[Account]>,
    max_amount: i64,
}

struct Account {
    lock: Mutex<()>,
    // Only written with `lock` held, read without it by `Bank::amount`
    balance: AtomicI64,
}

impl Account {
    fn new() -> Self {
        Account {
            lock: Mutex::new(()),
            balance: AtomicI64::new(0),
        }
    }

    fn balance(&self) -> i64 {
        self.balance.load(Ordering::Acquire)
    }

    fn set_balance(&self, _guard: &MutexGuard<()>, balance: i64) {
        self.balance.store(balance, Ordering::Release);
    }
}

impl Bank {
    /// A bank of `accounts` empty accounts with the default balance ceiling.
    pub fn new(accounts: usize) -> Self {
        Bank::build(BankConfig::new(accounts))
    }

    pub fn with_config(config: BankConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        debug!(accounts = config.accounts, max_amount = config.max_amount, "creating bank");
        Ok(Bank::build(config))
    }

    fn build(config: BankConfig) -> Self {
        Bank {
            accounts: (0..config.accounts).map(|_| Account::new()).collect(),
            max_amount: config.max_amount,
        }
    }

    pub fn number_of_accounts(&self) -> usize {
        self.accounts.len()
    }

    pub fn max_amount(&self) -> i64 {
        self.max_amount
    }

    /// The balance of one account, read without locking.
    pub fn amount(&self, index: usize) -> Result<i64> {
        Ok(self.account(index)?.balance())
    }

    /// The sum of all balances at a single instant.
    ///
    /// Widened to `i128`: every account may hold up to the maximum amount, and the total
    /// of many full accounts does not fit in an `i64`.
    pub fn total_amount(&self) -> i128 {
        let mut guards: Vec<MutexGuard<()>> =
            self.accounts.iter().map(|account| account.lock.lock()).collect();
        let total: i128 = self
            .accounts
            .iter()
            .map(|account| i128::from(account.balance()))
            .sum();
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
        total
    }

    /// Add `amount` to account `index`, returning the new balance.
    /// # Examples
    /// ```
    /// use concurrent_primitives::structures::Bank;
    /// let bank = Bank::new(2);
    /// assert_eq!(bank.deposit(0, 100), Ok(100));
    /// assert_eq!(bank.withdraw(0, 30), Ok(70));
    /// assert!(bank.withdraw(1, 1).is_err());
    /// ```
    pub fn deposit(&self, index: usize, amount: i64) -> Result<i64> {
        check_amount(amount)?;
        let account = self.account(index)?;

        let guard = account.lock.lock();
        let balance = account.balance();
        self.check_room(index, balance, amount)?;
        account.set_balance(&guard, balance + amount);
        Ok(balance + amount)
    }

    /// Take `amount` from account `index`, returning the new balance.
    pub fn withdraw(&self, index: usize, amount: i64) -> Result<i64> {
        check_amount(amount)?;
        let account = self.account(index)?;

        let guard = account.lock.lock();
        let balance = account.balance();
        check_funds(index, balance, amount)?;
        account.set_balance(&guard, balance - amount);
        Ok(balance - amount)
    }

    /// Move `amount` from account `from` to account `to` atomically.
    pub fn transfer(&self, from: usize, to: usize, amount: i64) -> Result<()> {
        check_amount(amount)?;
        if from == to {
            debug!(account = from, "rejecting transfer to the same account");
            return Err(BankError::SameAccount(from));
        }
        let source = self.account(from)?;
        let target = self.account(to)?;

        // Lower index first, guards drop in reverse declaration order
        let (first, second) = if from < to { (source, target) } else { (target, source) };
        let first_guard = first.lock.lock();
        let second_guard = second.lock.lock();
        let (source_guard, target_guard) = if from < to {
            (&first_guard, &second_guard)
        } else {
            (&second_guard, &first_guard)
        };

        let source_balance = source.balance();
        let target_balance = target.balance();
        check_funds(from, source_balance, amount)?;
        self.check_room(to, target_balance, amount)?;

        source.set_balance(source_guard, source_balance - amount);
        target.set_balance(target_guard, target_balance + amount);
        Ok(())
    }

    fn account(&self, index: usize) -> Result<&Account> {
        self.accounts.get(index).ok_or_else(|| {
            debug!(index, accounts = self.accounts.len(), "no such account");
            BankError::NoSuchAccount {
                index,
                accounts: self.accounts.len(),
            }
        })
    }

    fn check_room(&self, index: usize, balance: i64, amount: i64) -> Result<()> {
        if amount > self.max_amount || balance > self.max_amount - amount {
            debug!(index, balance, amount, "deposit would overflow");
            return Err(BankError::Overflow {
                index,
                balance,
                amount,
                max: self.max_amount,
            });
        }
        Ok(())
    }
}

fn check_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        debug!(amount, "rejecting non-positive amount");
        return Err(BankError::InvalidAmount(amount));
    }
    Ok(())
}

fn check_funds(index: usize, balance: i64, amount: i64) -> Result<()> {
    if amount > balance {
        debug!(index, balance, amount, "withdrawal would underflow");
        return Err(BankError::Underflow {
            index,
            balance,
            amount,
        });
    }
    Ok(())
}

impl fmt::Debug for Bank {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let balances: Vec<i64> = self.accounts.iter().map(Account::balance).collect();
        f.debug_struct("Bank")
            .field("balances", &balances)
            .field("max_amount", &self.max_amount)
            .finish()
    }
}
