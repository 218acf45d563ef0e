//! Request field validation.

use crate::error::{Error, Result};
use crate::provision::ProvisionRequest;

/// Maximum VM id length. The id names a directory and a hypervisor VM.
pub const MAX_VM_ID_LEN: usize = 63;

/// Maximum runner name length.
pub const MAX_RUNNER_NAME_LEN: usize = 128;

/// Validate a resource name with common API rules.
///
/// Rules:
/// - Length: 1..=max_len characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
/// - No consecutive hyphens
/// - No path separators (/, \)
pub fn validate_resource_name(name: &str, kind: &str, max_len: usize) -> Result<()> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| Error::Validation(format!("{} cannot be empty", kind)))?;

    if name.len() > max_len {
        return Err(Error::Validation(format!(
            "{} too long: {} characters (max {})",
            kind,
            name.len(),
            max_len
        )));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err(Error::Validation(format!(
            "{} must start with a letter or digit",
            kind
        )));
    }

    if name.ends_with('-') {
        return Err(Error::Validation(format!("{} cannot end with a hyphen", kind)));
    }

    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err(Error::Validation(format!(
                    "{} cannot contain consecutive hyphens",
                    kind
                )));
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }

        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            if c == '/' || c == '\\' {
                return Err(Error::Validation(format!(
                    "{} cannot contain path separators",
                    kind
                )));
            }
            return Err(Error::Validation(format!(
                "{} contains invalid character: '{}'",
                kind, c
            )));
        }
    }

    Ok(())
}

/// Validate a VM id.
pub fn validate_vm_id(vm_id: &str) -> Result<()> {
    validate_resource_name(vm_id, "vmId", MAX_VM_ID_LEN)
}

/// Validate a provision request before any resource is taken.
pub fn validate_provision_request(request: &ProvisionRequest) -> Result<()> {
    validate_vm_id(&request.vm_id)?;
    crate::store::validate_object_name(&request.image_name)?;

    if request.runner_name.len() > MAX_RUNNER_NAME_LEN {
        return Err(Error::Validation(format!(
            "runnerName too long: {} characters (max {})",
            request.runner_name.len(),
            MAX_RUNNER_NAME_LEN
        )));
    }
    if request.runner_registration_token.chars().any(char::is_control) {
        return Err(Error::Validation(
            "runnerRegistrationToken contains control characters".into(),
        ));
    }
    if let Some(label) = request
        .runner_labels
        .iter()
        .find(|l| l.is_empty() || l.contains(',') || l.chars().any(char::is_control))
    {
        return Err(Error::Validation(format!("invalid runner label: {:?}", label)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resource_name() {
        let max_len = 40;

        let valid = [
            "test",
            "my-vm",
            "my_vm",
            "test123",
            "123test",
            "a",
            "ci-runner-123",
            "RUNNER_VM",
        ];
        for name in valid {
            assert!(
                validate_resource_name(name, "vmId", max_len).is_ok(),
                "expected '{}' to be valid",
                name
            );
        }

        assert!(validate_resource_name(&"a".repeat(40), "vmId", max_len).is_ok());
        assert!(validate_resource_name(&"a".repeat(41), "vmId", max_len).is_err());

        let invalid = [
            ("", "empty"),
            ("-test", "starts with hyphen"),
            ("_test", "starts with underscore"),
            (".test", "starts with dot"),
            ("test-", "ends with hyphen"),
            ("test--name", "consecutive hyphens"),
            ("test/name", "forward slash"),
            ("test\\name", "backslash"),
            ("test name", "space"),
            ("../test", "path traversal"),
            ("test.name", "dot"),
            ("test:name", "colon"),
        ];
        for (name, desc) in invalid {
            assert!(
                matches!(
                    validate_resource_name(name, "vmId", max_len),
                    Err(Error::Validation(_))
                ),
                "expected '{}' ({}) to be invalid",
                name,
                desc
            );
        }
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            vm_id: "vm-1".into(),
            image_name: "sonoma-14.5.img".into(),
            runner_registration_token: "AAAA".into(),
            runner_name: "runner-1".into(),
            runner_labels: vec!["macos".into(), "arm64".into()],
        }
    }

    #[test]
    fn test_validate_provision_request() {
        validate_provision_request(&request()).unwrap();

        let mut r = request();
        r.image_name = String::new();
        assert!(validate_provision_request(&r).is_err());

        let mut r = request();
        r.image_name = "../etc/passwd".into();
        assert!(validate_provision_request(&r).is_err());

        let mut r = request();
        r.vm_id = "a/b".into();
        assert!(validate_provision_request(&r).is_err());

        let mut r = request();
        r.runner_labels = vec!["macos,linux".into()];
        assert!(validate_provision_request(&r).is_err());

        let mut r = request();
        r.runner_registration_token = "tok\nen".into();
        assert!(validate_provision_request(&r).is_err());
    }

    #[test]
    fn test_runner_fields_are_optional() {
        let r = ProvisionRequest {
            vm_id: "vm-1".into(),
            image_name: "sonoma".into(),
            ..Default::default()
        };
        validate_provision_request(&r).unwrap();
    }
}
