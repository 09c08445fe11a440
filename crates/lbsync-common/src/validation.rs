use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum length of any object name accepted by the backend controller
pub const MAX_OBJECT_NAME_LEN: usize = 255;

/// Cluster names are embedded in every object name, so keep them short
pub const MAX_CLUSTER_NAME_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Invalid object name: {0}")]
    InvalidObjectName(String),

    #[error("Invalid cluster name: {0}")]
    InvalidClusterName(String),

    #[error("Invalid tenant name: {0}")]
    InvalidTenantName(String),

    #[error("Invalid port: {0}")]
    InvalidPort(i32),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

// DNS label regex: alphanumeric and hyphens, 1-63 chars, no leading/trailing hyphen
static LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").expect("valid regex")
});

static CLUSTER_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid regex"));

static OBJECT_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("valid regex"));

/// Validates an IP address (IPv4 or IPv6)
pub fn validate_ip_address(ip: &str) -> ValidationResult<IpAddr> {
    ip.parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidIpAddress(ip.to_string()))
}

/// Validates a DNS hostname (with or without domain)
/// Rules:
/// - Total length: 1-253 characters (RFC 1035)
/// - Labels separated by dots
/// - Each label: 1-63 chars, alphanumeric and hyphens
/// - Cannot start or end with hyphen
/// - Cannot start or end with dot
pub fn validate_hostname(hostname: &str) -> ValidationResult<String> {
    if hostname.is_empty() {
        return Err(ValidationError::InvalidHostname(
            "hostname cannot be empty".to_string(),
        ));
    }

    if hostname.len() > 253 {
        return Err(ValidationError::InvalidHostname(
            "hostname exceeds maximum length of 253 characters".to_string(),
        ));
    }

    if hostname.starts_with('.') || hostname.ends_with('.') {
        return Err(ValidationError::InvalidHostname(
            "hostname cannot start or end with dot".to_string(),
        ));
    }

    for label in hostname.split('.') {
        if !LABEL_REGEX.is_match(label) {
            return Err(ValidationError::InvalidHostname(format!(
                "invalid label '{}' in hostname",
                label
            )));
        }
    }

    Ok(hostname.to_string())
}

/// Validates a generated backend object name.
///
/// Kubernetes names are already DNS-safe, but the generated names concatenate
/// cluster, namespace, service, protocol and port, and can exceed the backend limit.
pub fn validate_object_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::InvalidObjectName(
            "name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err(ValidationError::InvalidObjectName(format!(
            "'{}' exceeds maximum length of {} characters",
            name, MAX_OBJECT_NAME_LEN
        )));
    }

    if !OBJECT_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidObjectName(format!(
            "'{}' contains unsupported characters",
            name
        )));
    }

    Ok(())
}

/// Validates the cluster name used as the prefix of every managed object.
pub fn validate_cluster_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(ValidationError::InvalidClusterName(format!(
            "'{}' must be 1-{} characters",
            name, MAX_CLUSTER_NAME_LEN
        )));
    }

    if !CLUSTER_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidClusterName(format!(
            "'{}' may only contain alphanumerics, '-' and '_'",
            name
        )));
    }

    Ok(())
}

/// Validates a backend tenant name.
///
/// Tenant names travel in a request header and in model keys, so `/` and
/// whitespace are rejected.
pub fn validate_tenant_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::InvalidTenantName(
            "tenant cannot be empty".to_string(),
        ));
    }

    if name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidTenantName(format!(
            "'{}' cannot contain '/' or whitespace",
            name
        )));
    }

    Ok(())
}

/// Validates a service port number
pub fn validate_port(port: i32) -> ValidationResult<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ValidationError::InvalidPort(port))
}

/// Normalizes and validates an L4 protocol. An empty protocol means TCP.
pub fn validate_protocol(protocol: &str) -> ValidationResult<&'static str> {
    match protocol {
        "" | "TCP" => Ok("TCP"),
        "UDP" => Ok("UDP"),
        "SCTP" => Ok("SCTP"),
        other => Err(ValidationError::UnsupportedProtocol(other.to_string())),
    }
}
