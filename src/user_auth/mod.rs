//! User Provisioning
//!
//! Registration, profile updates, password checks and email verification.
//! Registration enqueues the welcome mail from inside the user's transaction.

pub mod password;
pub mod service;
pub mod validation;

pub use password::{PasswordError, check_password, hash_password};
pub use service::{
    CreateUserRequest, UpdateUserRequest, UserService, UserServiceError, VERIFY_EMAIL_DELAY,
    VERIFY_EMAIL_MAX_RETRY,
};
pub use validation::{EmailAddress, FullName, Password, Username, ValidationError};
