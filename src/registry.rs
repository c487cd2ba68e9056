//! Device enumeration and selection.
//!
//! The registry is a static table of the devices this build knows about:
//! three simulated cameras and the storage backends compiled in. Selection
//! resolves a name or regex pattern to a [`DeviceIdentifier`]; resolving the
//! same name twice yields identical identifiers, which configuration code
//! relies on when echoing identifiers back.

use crate::core::{DeviceIdentifier, DeviceKind};
use crate::error::{AcqError, AcqResult};
use once_cell::sync::Lazy;
use regex::RegexBuilder;

/// Simulated camera names, in enumeration order.
pub static SIMULATED_CAMERAS: [&str; 3] = [
    "simulated: uniform random",
    "simulated: radial sin",
    "simulated: empty",
];

/// Storage backend names, in enumeration order. Compressed variants are
/// present only when the matching codec feature is compiled in.
pub static STORAGE_DEVICES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut names = vec!["raw", "trash", "tiff", "tiff-json", "Zarr"];
    #[cfg(feature = "compress_zstd")]
    names.push("ZarrBlosc1ZstdByteShuffle");
    #[cfg(feature = "compress_lz4")]
    names.push("ZarrBlosc1Lz4ByteShuffle");
    names.push("ZarrV3");
    #[cfg(feature = "compress_zstd")]
    names.push("ZarrV3Blosc1ZstdByteShuffle");
    #[cfg(feature = "compress_lz4")]
    names.push("ZarrV3Blosc1Lz4ByteShuffle");
    names
});

/// One row of the device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// The device's identity; selection returns clones of this.
    pub identifier: DeviceIdentifier,
}

/// Enumerates devices and resolves selection patterns.
///
/// Enumeration is a table walk; no hardware is touched.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_simulated_devices()
    }
}

impl DeviceRegistry {
    /// Build the registry with the built-in simulated cameras (driver 0)
    /// and the compiled-in storage backends (driver 1).
    pub fn with_simulated_devices() -> Self {
        let mut devices = Vec::new();
        for (i, name) in SIMULATED_CAMERAS.iter().enumerate() {
            devices.push(DeviceDescriptor {
                identifier: DeviceIdentifier {
                    id: (0, i as u8),
                    kind: DeviceKind::Camera,
                    name: (*name).to_string(),
                },
            });
        }
        for (i, name) in STORAGE_DEVICES.iter().enumerate() {
            devices.push(DeviceDescriptor {
                identifier: DeviceIdentifier {
                    id: (1, i as u8),
                    kind: DeviceKind::Storage,
                    name: (*name).to_string(),
                },
            });
        }
        Self { devices }
    }

    /// All known devices, cameras first.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Resolve a pattern to a device of the given kind.
    ///
    /// The pattern is a regex searched case-insensitively against device
    /// names; the first match in enumeration order wins. `None` or an empty
    /// pattern selects the first device of that kind. Fails with
    /// [`AcqError::NotFound`] when nothing matches and
    /// [`AcqError::Config`] when the pattern is not a valid regex.
    pub fn select(&self, kind: DeviceKind, pattern: Option<&str>) -> AcqResult<DeviceIdentifier> {
        let of_kind = || self.devices.iter().filter(move |d| d.identifier.kind == kind);

        match pattern {
            None | Some("") => of_kind()
                .next()
                .map(|d| d.identifier.clone())
                .ok_or_else(|| AcqError::NotFound(format!("no {} devices", kind))),
            Some(pattern) => {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        AcqError::Config(format!("invalid device pattern '{}': {}", pattern, e))
                    })?;
                of_kind()
                    .find(|d| re.is_match(&d.identifier.name))
                    .map(|d| d.identifier.clone())
                    .ok_or_else(|| {
                        AcqError::NotFound(format!("no {} device matches '{}'", kind, pattern))
                    })
            }
        }
    }

    /// Resolve the first candidate pattern that matches any device of the
    /// given kind. Returns `None` for an empty list or when no candidate
    /// matches; candidates that fail to compile are skipped.
    pub fn select_one_of<S: AsRef<str>>(
        &self,
        kind: DeviceKind,
        candidates: &[S],
    ) -> Option<DeviceIdentifier> {
        candidates
            .iter()
            .find_map(|c| self.select(kind, Some(c.as_ref())).ok())
    }

    /// Look up a descriptor by identifier. Used by configuration validation
    /// to reject identifiers that did not come from this registry.
    pub fn find(&self, identifier: &DeviceIdentifier) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| &d.identifier == identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_is_consistent() {
        let reg = DeviceRegistry::with_simulated_devices();
        let first = reg.select(DeviceKind::Camera, None).unwrap();
        let again = reg.select(DeviceKind::Camera, Some(&first.name)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_select_empty_string_is_wildcard() {
        let reg = DeviceRegistry::with_simulated_devices();
        assert!(reg.select(DeviceKind::Storage, Some("")).is_ok());
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let reg = DeviceRegistry::with_simulated_devices();
        let id = reg.select(DeviceKind::Storage, Some("Tiff")).unwrap();
        assert_eq!(id.name, "tiff");
        let id = reg.select(DeviceKind::Storage, Some("zarrv3")).unwrap();
        assert_eq!(id.name, "ZarrV3");
    }

    #[test]
    fn test_select_by_regex() {
        let reg = DeviceRegistry::with_simulated_devices();
        let id = reg.select(DeviceKind::Camera, Some("simulated.*sin")).unwrap();
        assert_eq!(id.name, "simulated: radial sin");
        let id = reg.select(DeviceKind::Camera, Some(".*radial.*")).unwrap();
        assert_eq!(id.name, "simulated: radial sin");
    }

    #[test]
    fn test_select_no_match_is_not_found() {
        let reg = DeviceRegistry::with_simulated_devices();
        let err = reg.select(DeviceKind::Camera, Some("does not exist"));
        assert!(matches!(err, Err(AcqError::NotFound(_))));
    }

    #[test]
    fn test_select_invalid_regex_is_config_error() {
        let reg = DeviceRegistry::with_simulated_devices();
        let err = reg.select(DeviceKind::Camera, Some("simulated["));
        assert!(matches!(err, Err(AcqError::Config(_))));
    }

    #[test]
    fn test_select_one_of_first_match_wins() {
        let reg = DeviceRegistry::with_simulated_devices();

        let id = reg.select_one_of(
            DeviceKind::Camera,
            &[
                "does not exist 1",
                "simulated: radial sin",
                "simulated: uniform random",
            ],
        );
        assert_eq!(id.map(|i| i.name).as_deref(), Some("simulated: radial sin"));

        let id = reg.select_one_of(DeviceKind::Camera, &["simulated.*sin"]);
        assert_eq!(id.map(|i| i.name).as_deref(), Some("simulated: radial sin"));

        let none = reg.select_one_of(
            DeviceKind::Camera,
            &["does not exist 1", "does not exist 2", "does not exist 3"],
        );
        assert!(none.is_none());

        let empty: Option<DeviceIdentifier> =
            reg.select_one_of::<&str>(DeviceKind::Camera, &[]);
        assert!(empty.is_none());
    }

    #[test]
    fn test_find_rejects_foreign_identifier() {
        let reg = DeviceRegistry::with_simulated_devices();
        let mut id = reg.select(DeviceKind::Storage, Some("trash")).unwrap();
        assert!(reg.find(&id).is_some());
        id.name = "tampered".to_string();
        assert!(reg.find(&id).is_none());
    }
}
