//! Device enumeration and pattern selection.

use rust_acq::core::DeviceKind;
use rust_acq::error::AcqError;
use rust_acq::registry::DeviceRegistry;

#[test]
fn test_enumeration_order_is_stable() {
    let registry = DeviceRegistry::with_simulated_devices();
    let names: Vec<&str> = registry
        .devices()
        .iter()
        .map(|d| d.identifier.name.as_str())
        .collect();

    // Cameras first, then storage, in driver enumeration order.
    assert_eq!(
        &names[..3],
        &[
            "simulated: uniform random",
            "simulated: radial sin",
            "simulated: empty",
        ]
    );
    assert_eq!(
        &names[3..],
        &[
            "raw",
            "trash",
            "tiff",
            "tiff-json",
            "Zarr",
            "ZarrBlosc1ZstdByteShuffle",
            "ZarrBlosc1Lz4ByteShuffle",
            "ZarrV3",
            "ZarrV3Blosc1ZstdByteShuffle",
            "ZarrV3Blosc1Lz4ByteShuffle",
        ]
    );
    for descriptor in &registry.devices()[..3] {
        assert_eq!(descriptor.identifier.kind, DeviceKind::Camera);
    }
    for descriptor in &registry.devices()[3..] {
        assert_eq!(descriptor.identifier.kind, DeviceKind::Storage);
    }
}

#[test]
fn test_select_matches_are_case_insensitive_substrings() {
    let registry = DeviceRegistry::with_simulated_devices();

    let camera = registry
        .select(DeviceKind::Camera, Some("simulated.*sin"))
        .unwrap();
    assert_eq!(camera.name, "simulated: radial sin");

    let camera = registry
        .select(DeviceKind::Camera, Some(".*radial.*"))
        .unwrap();
    assert_eq!(camera.name, "simulated: radial sin");

    let camera = registry
        .select(DeviceKind::Camera, Some("simulated.*random.*"))
        .unwrap();
    assert_eq!(camera.name, "simulated: uniform random");

    // Uppercase pattern still matches the lowercase device name.
    let storage = registry.select(DeviceKind::Storage, Some("Tiff")).unwrap();
    assert_eq!(storage.name, "tiff");
}

#[test]
fn test_select_first_match_wins() {
    let registry = DeviceRegistry::with_simulated_devices();

    // "Zarr" is a prefix of five storage names; the earliest row wins.
    let storage = registry.select(DeviceKind::Storage, Some("Zarr")).unwrap();
    assert_eq!(storage.name, "Zarr");

    let storage = registry
        .select(DeviceKind::Storage, Some("ZarrV3"))
        .unwrap();
    assert_eq!(storage.name, "ZarrV3");
}

#[test]
fn test_select_without_pattern_takes_first_of_kind() {
    let registry = DeviceRegistry::with_simulated_devices();

    let camera = registry.select(DeviceKind::Camera, None).unwrap();
    assert_eq!(camera.name, "simulated: uniform random");

    let storage = registry.select(DeviceKind::Storage, Some("")).unwrap();
    assert_eq!(storage.name, "raw");
}

#[test]
fn test_select_no_match_is_not_found() {
    let registry = DeviceRegistry::with_simulated_devices();
    let result = registry.select(DeviceKind::Camera, Some("no such camera"));
    assert!(matches!(result, Err(AcqError::NotFound(_))));

    // A camera pattern never resolves to a storage device.
    let result = registry.select(DeviceKind::Storage, Some("radial"));
    assert!(matches!(result, Err(AcqError::NotFound(_))));
}

#[test]
fn test_select_one_of_prefers_earlier_patterns() {
    let registry = DeviceRegistry::with_simulated_devices();

    let storage = registry
        .select_one_of(DeviceKind::Storage, &["no such sink", "tiff-json", "raw"])
        .unwrap();
    assert_eq!(storage.name, "tiff-json");

    assert!(registry
        .select_one_of(DeviceKind::Storage, &["nope", "also nope"])
        .is_none());
}
