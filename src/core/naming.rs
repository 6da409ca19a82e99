//! Naming and addressing: name validation, handle derivation, instance expansion.
//!
//! A handle is `{name}.{type}.drydock.run` with the name sanitized for DNS.
//! Clustered resources expand to `server.{handle}` plus `{i}.client.{handle}`
//! for each client node.

use super::error::NameError;
use super::types::{Resource, ResourceType};

/// Fixed domain suffix of every handle.
pub const DOMAIN: &str = "drydock.run";

/// Maximum resource name length.
pub const MAX_NAME_LENGTH: usize = 128;

/// Validate a resource name: 1–128 characters from `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(NameError::ExceedsMaxLength {
            len: name.len(),
            max: MAX_NAME_LENGTH,
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(NameError::ContainsInvalidCharacters(name.to_string()));
    }
    Ok(())
}

/// Replace each run of characters outside `[A-Za-z0-9.-]` with a single `-`.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

/// Fully-qualified handle for a `(name, type)` pair.
pub fn address(name: &str, resource_type: ResourceType) -> String {
    format!("{}.{}.{}", sanitize(name), resource_type, DOMAIN)
}

/// Addressable units of one resource. Clustered types yield the server
/// first, then clients `1..=client_nodes`. Disabled resources yield nothing.
pub fn instance_addresses(resource: &Resource) -> Vec<String> {
    if resource.disabled {
        return Vec::new();
    }
    let handle = resource.handle();
    if !resource.resource_type.is_clustered() {
        return vec![handle];
    }
    let mut out = vec![format!("server.{}", handle)];
    for i in 1..=resource.client_nodes() {
        out.push(format!("{}.client.{}", i, handle));
    }
    out
}

/// Every loggable handle across `resources`, in order, disabled excluded.
pub fn list_addressable<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> Vec<String> {
    resources
        .into_iter()
        .filter(|r| r.resource_type.is_loggable())
        .flat_map(instance_addresses)
        .collect()
}
