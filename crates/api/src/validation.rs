//! Request validation
//!
//! Turns raw sign-up / sign-in payloads into typed values or a non-empty list
//! of field errors.

use serde::{Deserialize, Serialize};

const MAX_EMAIL_LEN: usize = 150;
const MAX_USERNAME_LEN: usize = 100;
const MAX_FULL_NAME_LEN: usize = 100;
const MAX_PASSWORD_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidSignUp {
    pub email: String,
    pub username: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    pub email_or_username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidSignIn {
    pub email_or_username: String,
    pub password: String,
}

impl SignUpRequest {
    pub fn validate(self) -> Result<ValidSignUp, Vec<FieldError>> {
        let mut errors = Vec::new();

        if let Err(e) = check_email(&self.email) {
            errors.push(FieldError::new("email", e));
        }
        if let Err(e) = check_username(&self.username) {
            errors.push(FieldError::new("username", e));
        }
        if let Err(e) = check_password(&self.password) {
            errors.push(FieldError::new("password", e));
        }

        // An empty full name means "not provided"
        let full_name = self.full_name.filter(|n| !n.is_empty());
        if full_name
            .as_ref()
            .is_some_and(|n| n.chars().count() > MAX_FULL_NAME_LEN)
        {
            errors.push(FieldError::new(
                "full_name",
                "Full name length must be at most 100",
            ));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidSignUp {
            email: self.email,
            username: self.username,
            password: self.password,
            full_name,
        })
    }
}

impl SignInRequest {
    pub fn validate(self) -> Result<ValidSignIn, Vec<FieldError>> {
        let mut errors = Vec::new();

        let as_email = check_email(&self.email_or_username);
        let as_username = check_username(&self.email_or_username);
        if let (Err(_), Err(e)) = (as_email, as_username) {
            errors.push(FieldError::new("email_or_username", e));
        }
        if let Err(e) = check_password(&self.password) {
            errors.push(FieldError::new("password", e));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidSignIn {
            email_or_username: self.email_or_username,
            password: self.password,
        })
    }
}

fn check_email(email: &str) -> Result<(), &'static str> {
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err("Email length must be at most 150");
    }
    if !looks_like_email(email) {
        return Err("Not a valid email");
    }
    Ok(())
}

fn check_username(username: &str) -> Result<(), &'static str> {
    if username.is_empty() {
        return Err("Username must not be empty");
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err("Username length must be at most 100");
    }
    Ok(())
}

fn check_password(password: &str) -> Result<(), &'static str> {
    if password.is_empty() {
        return Err("Password must not be empty");
    }
    if password.chars().count() > MAX_PASSWORD_LEN {
        return Err("Password length must be at most 100");
    }
    Ok(())
}

/// `local@domain.tld` with no whitespace and exactly one `@`
fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty() && !tld.is_empty() && !host.starts_with('.') && !host.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_up(email: &str, username: &str, password: &str) -> SignUpRequest {
        SignUpRequest {
            email: email.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            full_name: None,
        }
    }

    #[test]
    fn test_valid_sign_up() {
        let valid = sign_up("alice@x.com", "alice", "pw123").validate().unwrap();
        assert_eq!(valid.email, "alice@x.com");
        assert_eq!(valid.full_name, None);
    }

    #[test]
    fn test_sign_up_collects_every_field_error() {
        let errors = sign_up("not-an-email", "", "").validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["email", "username", "password"]);
    }

    #[test]
    fn test_email_length_limit() {
        let long_email = format!("{}@x.com", "a".repeat(150));
        let errors = sign_up(&long_email, "a", "pw").validate().unwrap_err();
        assert_eq!(errors[0].message, "Email length must be at most 150");
    }

    #[test]
    fn test_full_name_limit_and_empty_full_name() {
        let mut request = sign_up("a@x.com", "a", "pw");
        request.full_name = Some("n".repeat(101));
        let errors = request.validate().unwrap_err();
        assert_eq!(errors[0].field, "full_name");

        let mut request = sign_up("a@x.com", "a", "pw");
        request.full_name = Some(String::new());
        assert_eq!(request.validate().unwrap().full_name, None);
    }

    #[test]
    fn test_email_shapes() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@b.co"));
        assert!(!looks_like_email("a@@b.co"));
        assert!(!looks_like_email("a b@c.co"));
        assert!(!looks_like_email("a@.co"));
    }

    #[test]
    fn test_sign_in_accepts_email_or_username() {
        for id in ["alice@x.com", "alice"] {
            let request = SignInRequest {
                email_or_username: id.to_string(),
                password: "pw123".to_string(),
            };
            assert!(request.validate().is_ok());
        }

        let request = SignInRequest {
            email_or_username: String::new(),
            password: String::new(),
        };
        assert_eq!(request.validate().unwrap_err().len(), 2);
    }
}
