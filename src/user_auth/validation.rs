//! Input validation for user fields
//!
//! Validated newtypes: construct through `new()` or not at all.

use std::fmt;

use validator::ValidateEmail;

// ============================================================================
// Validation Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("Invalid length for {field}: expected {min}-{max}, got {actual}")]
    InvalidLength {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("Invalid format for {field}: '{value}' (expected: {expected})")]
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{field} must be a positive integer, got {value}")]
    NotPositive { field: &'static str, value: i64 },
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::InvalidLength { field, .. }
            | ValidationError::InvalidFormat { field, .. }
            | ValidationError::NotPositive { field, .. } => *field,
        }
    }
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual < min || actual > max {
        return Err(ValidationError::InvalidLength {
            field,
            min,
            max,
            actual,
        });
    }
    Ok(())
}

macro_rules! validated_string {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// ============================================================================
// Username
// ============================================================================

/// 3-30 characters from `[a-zA-Z0-9_]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        check_length("username", value, 3, 30)?;
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ValidationError::InvalidFormat {
                field: "username",
                value: value.to_string(),
                expected: "letters, digits or underscore",
            });
        }
        Ok(Self(value.to_string()))
    }
}

validated_string!(Username);

// ============================================================================
// Password
// ============================================================================

/// 6-30 characters. Never displayed.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        check_length("password", value, 6, 30)?;
        Ok(Self(value.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

// ============================================================================
// FullName
// ============================================================================

/// 3-30 characters, letters and spaces only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullName(String);

impl FullName {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        check_length("full_name", value, 3, 30)?;
        if !value.chars().all(|c| c.is_alphabetic() || c == ' ') {
            return Err(ValidationError::InvalidFormat {
                field: "full_name",
                value: value.to_string(),
                expected: "letters or spaces",
            });
        }
        Ok(Self(value.to_string()))
    }
}

validated_string!(FullName);

// ============================================================================
// EmailAddress
// ============================================================================

/// 3-200 characters and a syntactically valid address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn new(value: &str) -> Result<Self, ValidationError> {
        check_length("email", value, 3, 200)?;
        if !value.validate_email() {
            return Err(ValidationError::InvalidFormat {
                field: "email",
                value: value.to_string(),
                expected: "a valid email address",
            });
        }
        Ok(Self(value.to_string()))
    }
}

validated_string!(EmailAddress);

// ============================================================================
// Email verification inputs
// ============================================================================

pub fn validate_email_id(value: i64) -> Result<i64, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NotPositive {
            field: "email_id",
            value,
        });
    }
    Ok(value)
}

/// Exactly 32 characters
pub fn validate_secret_code(value: &str) -> Result<(), ValidationError> {
    check_length("secret_code", value, 32, 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username() {
        assert!(Username::new("alice_01").is_ok());
        assert!(matches!(
            Username::new("al"),
            Err(ValidationError::InvalidLength { actual: 2, .. })
        ));
        assert!(matches!(
            Username::new("alice-01"),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(Username::new(&"a".repeat(31)).is_err());
    }

    #[test]
    fn test_password_length_and_redaction() {
        assert!(Password::new("12345").is_err());
        let pw = Password::new("secret1").unwrap();
        assert_eq!(pw.expose(), "secret1");
        assert_eq!(format!("{:?}", pw), "Password(***)");
    }

    #[test]
    fn test_full_name() {
        assert!(FullName::new("Alice Liddell").is_ok());
        assert!(FullName::new("Alice 2").is_err());
        assert_eq!(FullName::new("Al").unwrap_err().field(), "full_name");
    }

    #[test]
    fn test_email() {
        assert!(EmailAddress::new("alice@example.com").is_ok());
        assert!(EmailAddress::new("not-an-email").is_err());
        assert_eq!(EmailAddress::new("a@").unwrap_err().field(), "email");
    }

    #[test]
    fn test_verification_inputs() {
        assert!(validate_email_id(0).is_err());
        assert_eq!(validate_email_id(5), Ok(5));
        assert!(validate_secret_code(&"x".repeat(31)).is_err());
        assert!(validate_secret_code(&"x".repeat(32)).is_ok());
    }
}
