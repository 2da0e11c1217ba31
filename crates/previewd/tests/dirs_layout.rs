use previewd::dirs::{PreviewDirs, MAX_SUN_PATH_LEN};

const KEY_A: &str = "/workspace/MyApp.xcodeproj|MyApp|Debug";
const KEY_B: &str = "/workspace/Other.xcodeproj|Other|Debug";

#[test]
fn session_identity_matches_project_device_identity() {
    let combos = [
        (KEY_A, "device-1"),
        (KEY_A, "device-2"),
        (KEY_B, "device-1"),
        (KEY_B, "device-2"),
    ];
    for (key_x, udid_x) in combos {
        for (key_y, udid_y) in combos {
            let x = PreviewDirs::new(key_x, udid_x).unwrap();
            let y = PreviewDirs::new(key_y, udid_y).unwrap();
            let same_inputs = key_x == key_y && udid_x == udid_y;
            assert_eq!(
                x.session == y.session,
                same_inputs,
                "session identity for {:?} vs {:?}",
                (key_x, udid_x),
                (key_y, udid_y)
            );
        }
    }
}

#[test]
fn build_is_shared_exactly_per_project() {
    let a1 = PreviewDirs::new(KEY_A, "device-1").unwrap();
    let a2 = PreviewDirs::new(KEY_A, "device-2").unwrap();
    let b1 = PreviewDirs::new(KEY_B, "device-1").unwrap();

    assert_eq!(a1.build, a2.build);
    assert_ne!(a1.build, b1.build);
}

#[test]
fn socket_is_short_and_outside_the_session() {
    let dirs = PreviewDirs::new(KEY_A, "0A1B2C3D-4E5F-6789-ABCD-EF0123456789").unwrap();
    assert!(dirs.socket.as_os_str().len() < MAX_SUN_PATH_LEN);
    assert!(dirs.socket.starts_with(&dirs.root));
    assert!(!dirs.socket.starts_with(&dirs.session));
}

#[test]
fn session_children_are_disjoint_between_devices() {
    let a = PreviewDirs::new(KEY_A, "device-1").unwrap();
    let b = PreviewDirs::new(KEY_A, "device-2").unwrap();
    for (x, y) in [
        (&a.thunk, &b.thunk),
        (&a.loader, &b.loader),
        (&a.staging, &b.staging),
    ] {
        assert_ne!(x, y);
    }
    // Staging and thunk share the session filesystem subtree, which is
    // what makes the stage→current rename atomic.
    assert!(a.staging.starts_with(&a.session));
    assert!(a.thunk.starts_with(&a.session));
}
