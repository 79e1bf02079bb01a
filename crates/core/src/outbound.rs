use thiserror::Error;
use url::{Host, Url};

/// Automation platforms the proxy may forward to. Subdomains of each entry are accepted.
pub const ALLOWED_DESTINATION_DOMAINS: &[&str] = &[
    "zapier.com",
    "make.com",
    "integromat.com",
    "n8n.cloud",
    "pipedream.net",
    "ifttt.com",
];

/// Largest request body the proxy forwards.
pub const MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("destination is not a valid absolute URL")]
    InvalidUrl,
    #[error("destination must use https")]
    InsecureScheme,
    #[error("destination host must be a domain name")]
    IpHostNotAllowed,
    #[error("destination port {0} is not allowed")]
    PortNotAllowed(u16),
    #[error("destination host {0} is not on the allowlist")]
    NotAllowed(String),
    #[error("payload exceeds {MAX_PAYLOAD_BYTES} bytes")]
    PayloadTooLarge,
}

impl DestinationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InsecureScheme => "insecure_scheme",
            Self::IpHostNotAllowed => "ip_host_not_allowed",
            Self::PortNotAllowed(_) => "port_not_allowed",
            Self::NotAllowed(_) => "destination_not_allowed",
            Self::PayloadTooLarge => "payload_too_large",
        }
    }
}

/// Parses and checks a forwarding target.
pub fn validate_destination(raw: &str) -> Result<Url, DestinationError> {
    let url = Url::parse(raw.trim()).map_err(|_| DestinationError::InvalidUrl)?;
    if url.scheme() != "https" {
        return Err(DestinationError::InsecureScheme);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(DestinationError::InvalidUrl);
    }
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_ascii_lowercase(),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            return Err(DestinationError::IpHostNotAllowed)
        }
        None => return Err(DestinationError::InvalidUrl),
    };
    // `Url::port` is `None` for the scheme default.
    if let Some(port) = url.port() {
        if port != 443 && port != 80 {
            return Err(DestinationError::PortNotAllowed(port));
        }
    }
    if !is_allowed_host(&host) {
        return Err(DestinationError::NotAllowed(host));
    }
    Ok(url)
}

pub fn is_allowed_host(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    ALLOWED_DESTINATION_DOMAINS.iter().any(|allowed| {
        host == *allowed
            || host
                .strip_suffix(allowed)
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

pub fn check_payload_size(len: usize) -> Result<(), DestinationError> {
    if len > MAX_PAYLOAD_BYTES {
        Err(DestinationError::PayloadTooLarge)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allowlisted_hosts_and_subdomains() {
        assert!(validate_destination("https://hooks.zapier.com/hooks/catch/1/abc").is_ok());
        assert!(validate_destination("https://hook.eu1.make.com/xyz").is_ok());
        assert!(validate_destination("https://zapier.com:443/x").is_ok());
    }

    #[test]
    fn rejects_non_allowlisted_and_lookalike_hosts() {
        assert_eq!(
            validate_destination("https://example.com/").unwrap_err().code(),
            "destination_not_allowed"
        );
        assert_eq!(
            validate_destination("https://evilzapier.com/").unwrap_err().code(),
            "destination_not_allowed"
        );
        assert_eq!(
            validate_destination("https://zapier.com.evil.io/").unwrap_err().code(),
            "destination_not_allowed"
        );
    }

    #[test]
    fn rejects_insecure_scheme() {
        assert_eq!(
            validate_destination("http://hooks.zapier.com/x").unwrap_err(),
            DestinationError::InsecureScheme
        );
    }

    #[test]
    fn rejects_ip_literals_and_odd_ports() {
        assert_eq!(
            validate_destination("https://127.0.0.1/").unwrap_err(),
            DestinationError::IpHostNotAllowed
        );
        assert_eq!(
            validate_destination("https://[::1]/").unwrap_err(),
            DestinationError::IpHostNotAllowed
        );
        assert_eq!(
            validate_destination("https://hooks.zapier.com:8443/").unwrap_err(),
            DestinationError::PortNotAllowed(8443)
        );
    }

    #[test]
    fn rejects_garbage_and_credentials() {
        assert_eq!(
            validate_destination("not a url").unwrap_err(),
            DestinationError::InvalidUrl
        );
        assert_eq!(
            validate_destination("https://user:pw@hooks.zapier.com/").unwrap_err(),
            DestinationError::InvalidUrl
        );
    }

    #[test]
    fn payload_cap() {
        assert!(check_payload_size(MAX_PAYLOAD_BYTES).is_ok());
        assert_eq!(
            check_payload_size(MAX_PAYLOAD_BYTES + 1),
            Err(DestinationError::PayloadTooLarge)
        );
    }
}
