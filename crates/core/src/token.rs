use chrono::{DateTime, Duration, Utc};

/// Remaining lifetime at or below which a refresh is attempted.
pub const CRITICAL_WINDOW_DAYS: i64 = 1;
/// Remaining lifetime at or below which the organization is warned.
pub const WARNING_WINDOW_DAYS: i64 = 7;

/// Where a credential sits relative to its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryWindow {
    Healthy,
    Warning,
    Critical,
    Expired,
}

impl ExpiryWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Expired => "expired",
        }
    }
}

/// Whole days until `expiry`, negative once it has passed. `None` when no expiry is known.
pub fn days_until_expiry(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    expiry.map(|expiry| (expiry - now).num_days())
}

/// Classifies the credential. A missing expiry is treated as healthy.
pub fn expiry_window(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ExpiryWindow {
    let Some(expiry) = expiry else {
        return ExpiryWindow::Healthy;
    };
    if expiry <= now {
        return ExpiryWindow::Expired;
    }
    let remaining = expiry - now;
    if remaining <= Duration::days(CRITICAL_WINDOW_DAYS) {
        ExpiryWindow::Critical
    } else if remaining <= Duration::days(WARNING_WINDOW_DAYS) {
        ExpiryWindow::Warning
    } else {
        ExpiryWindow::Healthy
    }
}

/// True when the credential is inside the critical window or already expired.
pub fn needs_refresh(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(
        expiry_window(expiry, now),
        ExpiryWindow::Critical | ExpiryWindow::Expired
    )
}

pub fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expiry_window(expiry, now) == ExpiryWindow::Expired
}
