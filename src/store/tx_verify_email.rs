//! Email verification transaction

use serde::{Deserialize, Serialize};

use super::{Store, StoreError, UpdateUserParams, UpdateVerifyEmailParams, User, VerifyEmail, exec_tx};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

/// Consume the verification record and flag its user verified.
///
/// An unknown id, a wrong code, a used record and an expired record all
/// surface as `NotFound`.
pub async fn verify_email_tx<S>(
    store: &S,
    arg: VerifyEmailTxParams,
) -> Result<VerifyEmailTxResult, StoreError>
where
    S: Store + ?Sized,
{
    let email_id = arg.email_id;

    let result = exec_tx(store, move |q| {
        Box::pin(async move {
            let verify_email = q
                .update_verify_email(UpdateVerifyEmailParams {
                    id: arg.email_id,
                    secret_code: arg.secret_code,
                })
                .await?;

            let mut update = UpdateUserParams::new(verify_email.username.clone());
            update.is_email_verified = Some(true);
            let user = q.update_user(update).await?;

            Ok(VerifyEmailTxResult { user, verify_email })
        })
    })
    .await;

    if let Ok(r) = &result {
        tracing::info!(email_id, username = %r.user.username, "Email verified");
    }
    result
}
