// Input validation utilities
//
// All checks here are pure: they run before the orchestrator touches the container runtime.

use regex::Regex;

use crate::error::ValidationError;

/// Lowest non-privileged port. Jira and MySQL are published on user ports only.
pub const MIN_USER_PORT: u32 = 1024;
pub const MAX_PORT: u32 = 65535;

// Docker's own rule for container/network/volume names.
const DOCKER_NAME_PATTERN: &str = r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$";
const MYSQL_IDENT_PATTERN: &str = r"^[A-Za-z0-9_$.]+$";
const IMAGE_REF_PATTERN: &str = r"^[a-z0-9]+([._/:-][a-zA-Z0-9]+)*(@sha256:[a-f0-9]{64})?$";

fn matches(pattern: &str, value: &str) -> Result<bool, ValidationError> {
    let re = Regex::new(pattern).map_err(|e| {
        ValidationError::new(format!("Internal error: failed to compile validation regex: {}", e))
    })?;
    Ok(re.is_match(value))
}

/// Validate a host port (user range only).
pub fn validate_port(field: &str, port: u32) -> Result<u16, ValidationError> {
    if !(MIN_USER_PORT..=MAX_PORT).contains(&port) {
        return Err(ValidationError::new(format!(
            "{} must be between {} and {} (got {})",
            field, MIN_USER_PORT, MAX_PORT, port
        )));
    }
    Ok(port as u16)
}

/// Validate a container, network or volume name.
pub fn validate_resource_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new(format!("{} cannot be empty", field)));
    }
    if name.len() > 128 {
        return Err(ValidationError::new(format!(
            "{} cannot exceed 128 characters",
            field
        )));
    }
    if !matches(DOCKER_NAME_PATTERN, name)? {
        return Err(ValidationError::new(format!(
            "{} '{}' may only contain letters, digits, '_', '.', '-' and must start with a letter or digit",
            field, name
        )));
    }
    Ok(())
}

/// Validate a MySQL database or user name.
pub fn validate_mysql_identifier(field: &str, ident: &str) -> Result<(), ValidationError> {
    if ident.is_empty() {
        return Err(ValidationError::new(format!("{} cannot be empty", field)));
    }
    // MySQL: database names up to 64 chars, user names up to 32.
    let max = if field.contains("user") { 32 } else { 64 };
    if ident.len() > max {
        return Err(ValidationError::new(format!(
            "{} cannot exceed {} characters",
            field, max
        )));
    }
    if !matches(MYSQL_IDENT_PATTERN, ident)? {
        return Err(ValidationError::new(format!(
            "{} '{}' contains invalid characters",
            field, ident
        )));
    }
    Ok(())
}

/// Passwords end up in container environment variables; reject what would break that.
pub fn validate_secret(field: &str, secret: &str) -> Result<(), ValidationError> {
    if secret.is_empty() {
        return Err(ValidationError::new(format!("{} cannot be empty", field)));
    }
    if secret.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
        return Err(ValidationError::new(format!(
            "{} cannot contain control characters",
            field
        )));
    }
    Ok(())
}

/// Validate an image reference such as `mysql:8.0` or `atlassian/jira-software:10.0.0`.
pub fn validate_image_reference(field: &str, image: &str) -> Result<(), ValidationError> {
    if image.is_empty() {
        return Err(ValidationError::new(format!("{} cannot be empty", field)));
    }
    if !matches(IMAGE_REF_PATTERN, image)? {
        return Err(ValidationError::new(format!(
            "{} '{}' is not a valid image reference",
            field, image
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_is_enforced() {
        assert_eq!(validate_port("port", 8080).unwrap(), 8080);
        assert_eq!(validate_port("port", 1024).unwrap(), 1024);
        assert_eq!(validate_port("port", 65535).unwrap(), 65535);
        assert!(validate_port("port", 80).is_err());
        assert!(validate_port("port", 0).is_err());
        assert!(validate_port("port", 70000).is_err());
    }

    #[test]
    fn resource_names_follow_docker_rules() {
        assert!(validate_resource_name("container", "jira10.0.0").is_ok());
        assert!(validate_resource_name("container", "10.0.0_mysql").is_ok());
        assert!(validate_resource_name("network", "jira_network").is_ok());
        assert!(validate_resource_name("container", "").is_err());
        assert!(validate_resource_name("container", "-leading-dash").is_err());
        assert!(validate_resource_name("container", "has space").is_err());
        assert!(validate_resource_name("container", "semi;colon").is_err());
    }

    #[test]
    fn mysql_identifiers() {
        assert!(validate_mysql_identifier("database name", "10.0.0_db").is_ok());
        assert!(validate_mysql_identifier("database user", "jira_user").is_ok());
        assert!(validate_mysql_identifier("database user", &"u".repeat(33)).is_err());
        assert!(validate_mysql_identifier("database name", "drop table;").is_err());
    }

    #[test]
    fn secrets_reject_control_characters() {
        assert!(validate_secret("password", "P@ss=w;ord!").is_ok());
        assert!(validate_secret("password", "").is_err());
        assert!(validate_secret("password", "line\nbreak").is_err());
    }

    #[test]
    fn image_references() {
        assert!(validate_image_reference("image", "mysql:8.0").is_ok());
        assert!(validate_image_reference("image", "atlassian/jira-software:10.0.0").is_ok());
        assert!(validate_image_reference("image", "registry.example.com:5000/team/jira:9.12.1").is_ok());
        assert!(validate_image_reference("image", "").is_err());
        assert!(validate_image_reference("image", "Bad Image").is_err());
    }
}
