use std::path::PathBuf;

/// Failure to resolve a tenant resource (configuration or template).
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no resource found for domain {domain} (and no default)")]
    NotFound { domain: String },
    #[error("malformed resource {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resource load did not complete: {0}")]
    Interrupted(String),
}

/// Failure talking to the reputation provider. Never cached.
#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("AbuseIPDB request failed: {0}")]
    Transport(String),
    #[error("AbuseIPDB returned status {0}")]
    Status(u16),
    #[error("AbuseIPDB decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid email format")]
    InvalidAddress,
    #[error("failed to resolve MX records for {domain}: {reason}")]
    MxLookup { domain: String, reason: String },
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("{stage} failed: {reply}")]
    Rejected { stage: &'static str, reply: String },
    #[error("{stage} failed: {source}")]
    Io {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{stage} timed out")]
    Timeout { stage: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },
    #[error("failed to generate email: {0}")]
    Message(String),
    #[error("failed to send via relay: {0}")]
    Relay(String),
}

/// Every failure the admission pipeline can surface to a visitor.
#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("Failed to load config")]
    ConfigResolution(#[source] ResourceError),
    #[error("Failed to load template")]
    TemplateResolution(#[source] ResourceError),
    #[error("Access denied: {0}")]
    ReputationProvider(#[source] ReputationError),
    #[error("Access denied: IP {address} blocked due to high abuse confidence score: {score}")]
    ReputationBlocked { address: String, score: i32 },
    #[error("Invalid form data")]
    Validation(String),
    #[error("SMTP test failed: {0}")]
    MailboxProbe(#[source] ProbeError),
    #[error("Failed to send email: {0}")]
    Delivery(#[source] DeliveryError),
    #[error("Too many requests, please try again later")]
    RateLimited,
}
