use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

use super::password::{self, PasswordError};
use super::validation::{
    EmailAddress, FullName, Password, Username, ValidationError, validate_email_id,
    validate_secret_code,
};
use crate::store::{
    AfterCreateHook, CreateUserParams, CreateUserTxParams, HookError, Store, StoreError,
    UpdateUserParams, User, VerifyEmailTxParams, VerifyEmailTxResult,
};
use crate::worker::{PayloadSendVerifyEmail, QUEUE_CRITICAL, TaskDistributor, TaskOptions};

/// Retry budget for the welcome mail
pub const VERIFY_EMAIL_MAX_RETRY: u32 = 10;

/// Delay before the welcome mail is first attempted, so the user row has
/// committed by the time the handler looks it up
pub const VERIFY_EMAIL_DELAY: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum UserServiceError {
    #[error("Invalid argument: {}", format_violations(.0))]
    InvalidArgument(Vec<ValidationError>),

    #[error("Username or email already exists")]
    AlreadyExists,

    #[error("User not found")]
    NotFound,

    #[error("Verification code is invalid, used or expired")]
    InvalidVerification,

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error(transparent)]
    Store(StoreError),
}

fn format_violations(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl UserServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            UserServiceError::InvalidArgument(_) => "INVALID_ARGUMENT",
            UserServiceError::AlreadyExists => "ALREADY_EXISTS",
            UserServiceError::NotFound => "NOT_FOUND",
            UserServiceError::InvalidVerification => "INVALID_VERIFICATION",
            UserServiceError::IncorrectPassword => "UNAUTHENTICATED",
            UserServiceError::Password(_) => "INTERNAL",
            UserServiceError::Store(e) => e.api_code(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UserServiceError::InvalidArgument(_) => 400,
            UserServiceError::AlreadyExists => 409,
            UserServiceError::NotFound | UserServiceError::InvalidVerification => 404,
            UserServiceError::IncorrectPassword => 401,
            UserServiceError::Password(_) => 500,
            UserServiceError::Store(e) => e.http_status(),
        }
    }

    fn from_store(e: StoreError) -> Self {
        if e.is_unique_violation() {
            UserServiceError::AlreadyExists
        } else if e.is_not_found() {
            UserServiceError::NotFound
        } else {
            UserServiceError::Store(e)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub full_name: String,
    pub email: String,
}

/// Fields left `None` are not changed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// Collects every violation instead of stopping at the first
#[derive(Default)]
struct Violations(Vec<ValidationError>);

impl Violations {
    fn check<T>(&mut self, result: Result<T, ValidationError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.0.push(e);
                None
            }
        }
    }

    fn finish(self) -> Result<(), UserServiceError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(UserServiceError::InvalidArgument(self.0))
        }
    }
}

pub struct UserService {
    store: Arc<dyn Store>,
    distributor: Arc<dyn TaskDistributor>,
}

impl UserService {
    pub fn new(store: Arc<dyn Store>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self { store, distributor }
    }

    /// Register a new user and schedule the verification email.
    ///
    /// The enqueue runs inside the user's transaction: if it fails, no user
    /// is created.
    pub async fn register(&self, req: CreateUserRequest) -> Result<User, UserServiceError> {
        let mut violations = Violations::default();
        let username = violations.check(Username::new(&req.username));
        let password = violations.check(Password::new(&req.password));
        let full_name = violations.check(FullName::new(&req.full_name));
        let email = violations.check(EmailAddress::new(&req.email));
        violations.finish()?;

        let (Some(username), Some(password), Some(full_name), Some(email)) =
            (username, password, full_name, email)
        else {
            return Err(UserServiceError::InvalidArgument(Vec::new()));
        };

        let hashed_password = password::hash_password(password.expose())?;

        let params = CreateUserParams {
            username: username.into_string(),
            hashed_password,
            full_name: full_name.into_string(),
            email: email.into_string(),
        };

        let distributor = self.distributor.clone();
        let after_create: AfterCreateHook =
            Box::new(move |user: User| -> BoxFuture<'static, Result<(), HookError>> {
                Box::pin(async move {
                    let payload = PayloadSendVerifyEmail {
                        username: user.username,
                    };
                    let opts = TaskOptions::default()
                        .max_retry(VERIFY_EMAIL_MAX_RETRY)
                        .process_in(VERIFY_EMAIL_DELAY)
                        .queue(QUEUE_CRITICAL);
                    distributor
                        .distribute_task_send_verify_email(&payload, opts)
                        .await
                        .map(|_| ())
                        .map_err(HookError::from)
                })
            });

        self.store
            .create_user_tx(CreateUserTxParams::new(params, after_create))
            .await
            .map_err(UserServiceError::from_store)
    }

    /// Partial update; a new password also resets `password_changed_at`
    pub async fn update_user(&self, req: UpdateUserRequest) -> Result<User, UserServiceError> {
        let mut violations = Violations::default();
        let username = violations.check(Username::new(&req.username));
        let password = req
            .password
            .as_deref()
            .and_then(|p| violations.check(Password::new(p)));
        let full_name = req
            .full_name
            .as_deref()
            .and_then(|n| violations.check(FullName::new(n)));
        let email = req
            .email
            .as_deref()
            .and_then(|e| violations.check(EmailAddress::new(e)));
        violations.finish()?;

        let Some(username) = username else {
            return Err(UserServiceError::InvalidArgument(Vec::new()));
        };

        let mut arg = UpdateUserParams::new(username.into_string());
        arg.full_name = full_name.map(FullName::into_string);
        arg.email = email.map(EmailAddress::into_string);
        if let Some(password) = password {
            arg.hashed_password = Some(password::hash_password(password.expose())?);
            arg.password_changed_at = Some(Utc::now());
        }

        let mut q = self
            .store
            .acquire()
            .await
            .map_err(UserServiceError::from_store)?;
        let user = q
            .update_user(arg)
            .await
            .map_err(UserServiceError::from_store)?;

        tracing::info!(username = %user.username, "User updated");
        Ok(user)
    }

    /// Consume a verification code from the welcome mail
    pub async fn verify_email(
        &self,
        email_id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmailTxResult, UserServiceError> {
        let mut violations = Violations::default();
        violations.check(validate_email_id(email_id));
        violations.check(validate_secret_code(secret_code));
        violations.finish()?;

        self.store
            .verify_email_tx(VerifyEmailTxParams {
                email_id,
                secret_code: secret_code.to_string(),
            })
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    UserServiceError::InvalidVerification
                } else {
                    UserServiceError::Store(e)
                }
            })
    }

    /// Look up `username` and verify `password` against its hash
    pub async fn check_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<User, UserServiceError> {
        let mut q = self
            .store
            .acquire()
            .await
            .map_err(UserServiceError::from_store)?;
        let user = q
            .get_user(username)
            .await
            .map_err(UserServiceError::from_store)?;

        if !password::check_password(password, &user.hashed_password)? {
            return Err(UserServiceError::IncorrectPassword);
        }
        Ok(user)
    }
}
