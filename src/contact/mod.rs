//! Contact form validation.
//!
//! Each field is trimmed, checked, and HTML-escaped before it leaves this
//! module. Rejections carry a short message that is safe to return to the
//! browser.

mod outbox;

pub use outbox::{ContactOutbox, OutboxRecord};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 50;
pub const EMAIL_MAX_CHARS: usize = 254;
pub const MESSAGE_MIN_CHARS: usize = 10;
pub const MESSAGE_MAX_CHARS: usize = 2000;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-ZÀ-ÿ\s\-']+$").expect("valid name regex"));

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]{2,}$").expect("valid email regex"));

/// Inline event handler attribute such as `onload=` or `onerror =`.
static EVENT_HANDLER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bon\w+\s*=").expect("valid handler regex"));

const DANGEROUS_SUBSTRINGS: [&str; 7] = [
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "<iframe",
    "<object",
    "<embed",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid name length")]
    NameLength,

    #[error("Invalid name format")]
    NameFormat,

    #[error("Invalid email format")]
    EmailFormat,

    #[error("Invalid message length")]
    MessageLength,

    #[error("Dangerous content detected")]
    DangerousContent,
}

/// Raw form fields as posted by the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "_csrf")]
    pub csrf: Option<String>,
    #[serde(default, rename = "_honeypot")]
    pub honeypot: Option<String>,
}

impl ContactForm {
    /// Bots fill every field, including the hidden one.
    pub fn is_spam(&self) -> bool {
        self.honeypot.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Validated and escaped submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSubmission {
    pub name: String,
    pub email: String,
    pub message: String,
}

pub fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len) {
        return Err(ValidationError::NameLength);
    }
    if !NAME_RE.is_match(name) {
        return Err(ValidationError::NameFormat);
    }
    reject_dangerous(name)?;
    Ok(escape_html(name))
}

pub fn validate_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim().to_lowercase();
    if email.chars().count() > EMAIL_MAX_CHARS || !EMAIL_RE.is_match(&email) {
        return Err(ValidationError::EmailFormat);
    }
    reject_dangerous(&email)?;
    Ok(escape_html(&email))
}

pub fn validate_message(raw: &str) -> Result<String, ValidationError> {
    let message = raw.trim();
    let len = message.chars().count();
    if !(MESSAGE_MIN_CHARS..=MESSAGE_MAX_CHARS).contains(&len) {
        return Err(ValidationError::MessageLength);
    }
    reject_dangerous(message)?;
    Ok(escape_html(message))
}

/// Validate all three fields, reporting the first failure in form order.
pub fn validate_submission(form: &ContactForm) -> Result<ContactSubmission, ValidationError> {
    Ok(ContactSubmission {
        name: validate_name(&form.name)?,
        email: validate_email(&form.email)?,
        message: validate_message(&form.message)?,
    })
}

pub fn contains_dangerous_content(input: &str) -> bool {
    let lower = input.to_lowercase();
    DANGEROUS_SUBSTRINGS.iter().any(|p| lower.contains(p)) || EVENT_HANDLER_RE.is_match(input)
}

fn reject_dangerous(input: &str) -> Result<(), ValidationError> {
    if contains_dangerous_content(input) {
        return Err(ValidationError::DangerousContent);
    }
    Ok(())
}

/// Escape `& < > " '` for safe inclusion in HTML.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}
