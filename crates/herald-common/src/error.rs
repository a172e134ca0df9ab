use thiserror::Error;

/// The dispatch error taxonomy.
///
/// Workers decide retry vs. terminal from `is_retryable()` and whether the
/// next attempt should rotate to a different vendor from `rotates_vendor()`.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Request rejected by validation or by a vendor as attributable to the
    /// payload (4xx). Non-retryable.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Local rate limiter denied the operation. The message is released back
    /// to the queue rather than failed.
    #[error("Rate limited: {op} for {client}")]
    RateLimited { op: String, client: String },

    /// Template missing or inactive for the channel. Non-retryable.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Template failed validation or rendering. Non-retryable.
    #[error("Template invalid: {0}")]
    TemplateInvalid(String),

    /// Circuit breaker is open for the vendor. Retryable on another vendor.
    #[error("Circuit open for vendor {vendor}")]
    VendorCircuitOpen { vendor: String },

    /// Transport, auth, or 5xx failure from a vendor. Retryable on another
    /// vendor.
    #[error("Vendor {vendor} unavailable: {reason}")]
    VendorUnavailable { vendor: String, reason: String },

    /// Vendor returned 429. Retryable on the same vendor after its hint.
    #[error("Vendor {vendor} rate limited")]
    RateLimitedByVendor {
        vendor: String,
        retry_after_secs: Option<u64>,
    },

    /// Every configured vendor is excluded or unavailable. Retryable via the
    /// retry scheduler.
    #[error("No vendor available for channel {channel}")]
    NoVendorAvailable { channel: String },

    /// A per-message deadline expired. Retryable.
    #[error("Deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Concurrent template update lost a version compare-and-set.
    #[error("Version conflict on template {name}: expected {expected}")]
    VersionConflict { name: String, expected: i32 },

    /// Anything else. Retryable once, then terminal.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::InvalidPayload(_)
            | DispatchError::TemplateNotFound(_)
            | DispatchError::TemplateInvalid(_)
            | DispatchError::VersionConflict { .. } => false,
            DispatchError::RateLimited { .. }
            | DispatchError::VendorCircuitOpen { .. }
            | DispatchError::VendorUnavailable { .. }
            | DispatchError::RateLimitedByVendor { .. }
            | DispatchError::NoVendorAvailable { .. }
            | DispatchError::Timeout { .. }
            | DispatchError::Internal(_) => true,
        }
    }

    /// Whether the next attempt should exclude the vendor that produced this
    /// error. 429s stay on the same vendor (honoring its Retry-After hint).
    pub fn rotates_vendor(&self) -> bool {
        matches!(
            self,
            DispatchError::VendorCircuitOpen { .. }
                | DispatchError::VendorUnavailable { .. }
                | DispatchError::Timeout { .. }
        )
    }

    /// Stable machine-readable code surfaced by the status endpoint.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidPayload(_) => "invalid_payload",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::TemplateNotFound(_) => "template_not_found",
            DispatchError::TemplateInvalid(_) => "template_invalid",
            DispatchError::VendorCircuitOpen { .. } => "vendor_circuit_open",
            DispatchError::VendorUnavailable { .. } => "vendor_unavailable",
            DispatchError::RateLimitedByVendor { .. } => "vendor_rate_limited",
            DispatchError::NoVendorAvailable { .. } => "no_vendor_available",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::VersionConflict { .. } => "version_conflict",
            DispatchError::Internal(_) => "internal",
        }
    }
}
