//! Transfer Engine
//!
//! Moves funds between two accounts in one transaction:
//!
//! 1. insert the `transfers` row
//! 2. insert a negative entry for the payer and a positive one for the payee
//! 3. apply both balance deltas, lower account id first
//!
//! Balance updates are single `balance = balance + $delta` statements so the
//! row lock is taken by the update itself. Locking in ascending id order means
//! two transfers touching the same pair always queue on the same row first
//! and can never wait on each other in a cycle. The overdraft guard is the
//! `CHECK (balance >= 0)` constraint, not an application-side read.

use serde::{Deserialize, Serialize};

use super::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Queries,
    Store, StoreError, Transfer, exec_tx,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    /// Reject requests that must not open a transaction
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.amount <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "transfer amount must be positive, got {}",
                self.amount
            )));
        }
        if self.from_account_id == self.to_account_id {
            return Err(StoreError::InvalidArgument(format!(
                "cannot transfer from account {} to itself",
                self.from_account_id
            )));
        }
        Ok(())
    }
}

/// Everything written by one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Run a transfer against `store`.
///
/// Errors from the data layer are returned unmodified: a missing account is
/// `NotFound` or a foreign key violation, an overdraft is a check violation.
pub async fn transfer_tx<S>(store: &S, arg: TransferTxParams) -> Result<TransferTxResult, StoreError>
where
    S: Store + ?Sized,
{
    arg.validate()?;

    let result = exec_tx(store, move |q| {
        Box::pin(async move {
            let transfer = q
                .create_transfer(CreateTransferParams {
                    from_account_id: arg.from_account_id,
                    to_account_id: arg.to_account_id,
                    amount: arg.amount,
                })
                .await?;

            let from_entry = q
                .create_entry(CreateEntryParams {
                    account_id: arg.from_account_id,
                    amount: -arg.amount,
                })
                .await?;

            let to_entry = q
                .create_entry(CreateEntryParams {
                    account_id: arg.to_account_id,
                    amount: arg.amount,
                })
                .await?;

            let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
                add_money(
                    q,
                    arg.from_account_id,
                    -arg.amount,
                    arg.to_account_id,
                    arg.amount,
                )
                .await?
            } else {
                let (to_account, from_account) = add_money(
                    q,
                    arg.to_account_id,
                    arg.amount,
                    arg.from_account_id,
                    -arg.amount,
                )
                .await?;
                (from_account, to_account)
            };

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        })
    })
    .await;

    match &result {
        Ok(r) => tracing::debug!(
            transfer_id = r.transfer.id,
            from_account_id = arg.from_account_id,
            to_account_id = arg.to_account_id,
            amount = arg.amount,
            "Transfer committed"
        ),
        Err(e) => tracing::warn!(
            from_account_id = arg.from_account_id,
            to_account_id = arg.to_account_id,
            amount = arg.amount,
            error = %e,
            "Transfer failed"
        ),
    }

    result
}

/// Apply two balance deltas in the given order. Callers pass the lower id first.
async fn add_money(
    q: &mut dyn Queries,
    first_id: i64,
    first_amount: i64,
    second_id: i64,
    second_amount: i64,
) -> Result<(Account, Account), StoreError> {
    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            amount: first_amount,
        })
        .await?;
    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            amount: second_amount,
        })
        .await?;
    Ok((first, second))
}
