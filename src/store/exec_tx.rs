//! Transaction runner shared by the composite operations

use futures::future::BoxFuture;

use super::{Queries, Store, StoreError};

/// Run `f` inside one transaction.
///
/// Commits when `f` succeeds. When `f` fails the transaction is rolled back
/// and the original error returned; if the rollback fails as well both causes
/// are reported through [`StoreError::Rollback`]. A handle dropped mid-flight
/// (task cancelled, deadline elapsed) is rolled back by its backend.
pub async fn exec_tx<S, T, F>(store: &S, f: F) -> Result<T, StoreError>
where
    S: Store + ?Sized,
    T: Send,
    F: for<'q> FnOnce(&'q mut dyn Queries) -> BoxFuture<'q, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;

    let result = f(tx.queries()).await;

    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb_err) = tx.rollback().await {
                tracing::error!(error = %err, rollback_error = %rb_err, "Rollback failed");
                return Err(StoreError::Rollback {
                    tx: Box::new(err),
                    rollback: Box::new(rb_err),
                });
            }
            Err(err)
        }
    }
}
