//! Local checks that run before anything is sent to the service.

use chrono::NaiveTime;
use thiserror::Error;

use crate::{ConnectionConfig, EmailConfig};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter table name")]
    MissingTable,

    #[error("Please provide all email fields (From, To, SendGrid API Key)")]
    IncompleteEmail,

    #[error("Enter scheduled question")]
    MissingQuestion,

    #[error("Invalid time '{0}': expected HH:MM (24h)")]
    InvalidTime(String),

    #[error("Password must be at least 8 characters")]
    WeakPassword,

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Please choose a username")]
    MissingUsername,
}

pub fn require_table(connection: &ConnectionConfig) -> Result<(), ValidationError> {
    if connection.table.trim().is_empty() {
        return Err(ValidationError::MissingTable);
    }
    Ok(())
}

/// Manual email settings must be complete; a partial set is never dropped silently.
pub fn require_email(email: &EmailConfig) -> Result<(), ValidationError> {
    if email.use_env {
        return Ok(());
    }
    if email.from.is_empty() || email.to.is_empty() || email.api_key.is_empty() {
        return Err(ValidationError::IncompleteEmail);
    }
    Ok(())
}

pub fn require_question(question: &str) -> Result<(), ValidationError> {
    if question.trim().is_empty() {
        return Err(ValidationError::MissingQuestion);
    }
    Ok(())
}

pub fn parse_schedule_time(time: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(time.trim(), "%H:%M")
        .map_err(|_| ValidationError::InvalidTime(time.to_string()))
}

pub fn require_username(username: &str) -> Result<(), ValidationError> {
    if username.trim().is_empty() {
        return Err(ValidationError::MissingUsername);
    }
    Ok(())
}

pub fn require_password(password: &str, confirm: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::WeakPassword);
    }
    if password != confirm {
        return Err(ValidationError::PasswordMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_require_table() {
        let mut connection = ConnectionConfig::default();
        assert_eq!(require_table(&connection), Err(ValidationError::MissingTable));
        connection.table = "   ".to_string();
        assert_eq!(require_table(&connection), Err(ValidationError::MissingTable));
        connection.table = "public.emp".to_string();
        assert!(require_table(&connection).is_ok());
    }

    #[test]
    fn test_require_email_partial_manual_is_rejected() {
        let mut email = EmailConfig {
            use_env: false,
            from: "a@b.com".to_string(),
            to: "c@d.com".to_string(),
            api_key: String::new(),
        };
        assert_eq!(require_email(&email), Err(ValidationError::IncompleteEmail));

        email.api_key = "SG.key".to_string();
        assert!(require_email(&email).is_ok());
    }

    #[test]
    fn test_require_email_env_skips_fields() {
        let email = EmailConfig {
            use_env: true,
            ..Default::default()
        };
        assert!(require_email(&email).is_ok());
    }

    #[test]
    fn test_parse_schedule_time() {
        let t = parse_schedule_time("09:30").unwrap();
        assert_eq!((t.hour(), t.minute()), (9, 30));
        assert!(parse_schedule_time("23:59").is_ok());
        assert!(matches!(parse_schedule_time("24:00"), Err(ValidationError::InvalidTime(_))));
        assert!(matches!(parse_schedule_time("9am"), Err(ValidationError::InvalidTime(_))));
    }

    #[test]
    fn test_require_password() {
        assert_eq!(require_password("short", "short"), Err(ValidationError::WeakPassword));
        assert_eq!(
            require_password("longenough", "longenougH"),
            Err(ValidationError::PasswordMismatch)
        );
        assert!(require_password("longenough", "longenough").is_ok());
    }

    #[test]
    fn test_require_username() {
        assert_eq!(require_username("  "), Err(ValidationError::MissingUsername));
        assert!(require_username("alice").is_ok());
    }

    #[test]
    fn test_require_question() {
        assert_eq!(require_question(""), Err(ValidationError::MissingQuestion));
        assert!(require_question("Weekly headcount").is_ok());
    }
}
