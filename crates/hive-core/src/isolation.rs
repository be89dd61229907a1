//! Volume and network isolation validation.
//!
//! Pure decision functions with no side effects. They run twice in a
//! module's life: at admission, against the spec itself, and at placement
//! time, against every module already hosted on the candidate runner.

use hive_common::error::ConflictError;
use hive_common::spec::validate_address_pattern;
use hive_common::{EngineError, ModuleSpec, VolumeDeclaration};

/// Validate a module spec at admission.
///
/// Checks performed:
/// - the image reference is present
/// - volume mount names and guest paths are unique within the spec
/// - network address patterns are well formed
///
/// A spec that fails admission never leaves `Unloaded`.
pub fn check_admission(spec: &ModuleSpec) -> Result<(), EngineError> {
    if spec.image.is_empty() {
        return Err(EngineError::invalid_spec("missing image reference"));
    }
    if spec.image.contains(char::is_whitespace) {
        return Err(EngineError::invalid_spec(format!(
            "invalid image reference '{}'",
            spec.image
        )));
    }

    for (i, mount) in spec.volume_mounts.iter().enumerate() {
        if mount.name.is_empty() {
            return Err(EngineError::invalid_spec("volume mount with empty name"));
        }
        for other in &spec.volume_mounts[i + 1..] {
            if other.name == mount.name {
                return Err(EngineError::invalid_spec(format!(
                    "volume '{}' mounted more than once",
                    mount.name
                )));
            }
            if other.guest_path == mount.guest_path {
                return Err(EngineError::invalid_spec(format!(
                    "guest path '{}' used by more than one mount",
                    mount.guest_path
                )));
            }
        }
    }

    if let Some(network) = &spec.network {
        for pattern in network.all_patterns() {
            validate_address_pattern(pattern).map_err(EngineError::invalid_spec)?;
        }
    }

    Ok(())
}

/// Decide whether two volume declarations may coexist on one runner.
///
/// Different volume names always coexist. The same name, at any pair of
/// guest paths, requires both declarations to opt in with `shared: true`.
pub fn check_volume_pair(
    a: &VolumeDeclaration,
    b: &VolumeDeclaration,
) -> Result<(), ConflictError> {
    if a.name != b.name {
        return Ok(());
    }
    if a.shared && b.shared {
        Ok(())
    } else {
        Err(ConflictError::VolumeNotShared {
            volume: a.name.clone(),
        })
    }
}

/// Decide whether two modules may be co-located on one runner.
///
/// Symmetric: the verdict does not depend on argument order.
pub fn check_colocation(a: &ModuleSpec, b: &ModuleSpec) -> Result<(), ConflictError> {
    for mount_a in &a.volume_mounts {
        for mount_b in &b.volume_mounts {
            check_volume_pair(mount_a, mount_b)?;
        }
    }

    let ports_b = b.bound_ports();
    for port in a.bound_ports() {
        if ports_b.contains(&port) {
            return Err(ConflictError::PortInUse { port });
        }
    }

    Ok(())
}
