//! User Provisioning Engine
//!
//! Inserts the user row and runs the caller's after-create hook before the
//! transaction commits. A failing hook rolls the insert back, so a user never
//! exists without its follow-up work having been handed off.

use futures::future::BoxFuture;

use super::{CreateUserParams, HookError, Store, StoreError, User, exec_tx};

/// Side effect run with the freshly inserted user, inside the transaction
pub type AfterCreateHook =
    Box<dyn FnOnce(User) -> BoxFuture<'static, Result<(), HookError>> + Send>;

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreateHook,
}

impl CreateUserTxParams {
    pub fn new(params: CreateUserParams, after_create: AfterCreateHook) -> Self {
        Self {
            params,
            after_create,
        }
    }

    /// Params with a hook that does nothing
    pub fn without_hook(params: CreateUserParams) -> Self {
        Self::new(
            params,
            Box::new(|_: User| -> BoxFuture<'static, Result<(), HookError>> {
                Box::pin(async { Ok(()) })
            }),
        )
    }
}

impl std::fmt::Debug for CreateUserTxParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateUserTxParams")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

pub async fn create_user_tx<S>(store: &S, arg: CreateUserTxParams) -> Result<User, StoreError>
where
    S: Store + ?Sized,
{
    let CreateUserTxParams {
        params,
        after_create,
    } = arg;
    let username = params.username.clone();

    let result = exec_tx(store, move |q| {
        Box::pin(async move {
            let user = q.create_user(params).await?;
            after_create(user.clone()).await.map_err(StoreError::Hook)?;
            Ok(user)
        })
    })
    .await;

    match &result {
        Ok(_) => tracing::info!(username = %username, "User created"),
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(username = %username, "Username or email already taken")
        }
        Err(e) => tracing::warn!(username = %username, error = %e, "User creation failed"),
    }

    result
}
