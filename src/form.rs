use regex::Regex;
use std::sync::OnceLock;

/// Fields posted by the contact form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDetails {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
}

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$";

fn email_regex() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| match Regex::new(EMAIL_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                log::error!("Email pattern failed to compile: {e}");
                None
            }
        })
        .as_ref()
}

/// Without a usable pattern every address is rejected.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && email_regex().is_some_and(|re| re.is_match(email))
}

/// Bind an `application/x-www-form-urlencoded` body.
pub fn bind(body: &[u8]) -> Result<ContactDetails, String> {
    let mut details = ContactDetails::default();
    for (key, value) in url::form_urlencoded::parse(body) {
        let value = value.trim().to_string();
        match key.as_ref() {
            "name" => details.name = value,
            "email" => details.email = value,
            "subject" => details.subject = value,
            "message" => details.message = value,
            _ => {}
        }
    }

    if !is_valid_email(&details.email) {
        return Err(format!("invalid email address: {:?}", details.email));
    }
    if details.message.is_empty() {
        return Err("message is empty".to_string());
    }
    // These end up in message headers
    for (field, value) in [("name", &details.name), ("subject", &details.subject)] {
        if value.contains(['\r', '\n']) {
            return Err(format!("line break in {field}"));
        }
    }

    Ok(details)
}
