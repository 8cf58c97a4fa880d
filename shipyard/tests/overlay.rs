//! Integration tests for overlay assembly against persisted crates.

use shipyard::layers;
use shipyard::runtime::layout::RootKind;
use shipyard::{ShipStatus, ShipyardError};
use shipyard_test_utils::TestHome;

#[test]
fn mounting_twice_mounts_once() {
    let home = TestHome::new();
    home.build_layer("base", "root");
    let overlays = home.runtime().overlays();
    let chain = layers::resolve(&home.runtime().db().crates(), "base").unwrap();

    let before = home.mounter().count("overlay");
    let first = overlays.create_and_mount(RootKind::Ship, "web", &chain).unwrap();
    let second = overlays.create_and_mount(RootKind::Ship, "web", &chain).unwrap();

    assert_eq!(first, second);
    assert_eq!(home.mounter().count("overlay"), before + 1);
    assert_eq!(home.mounter().count("devpts"), 2);
    assert!(overlays.is_mounted(RootKind::Ship, "web").unwrap());
}

#[test]
fn unmount_releases_virtual_filesystems_first() {
    let home = TestHome::new();
    let overlays = home.runtime().overlays();
    let chain = vec!["root".to_string()];

    overlays.create_and_mount(RootKind::Ship, "web", &chain).unwrap();
    overlays.unmount(RootKind::Ship, "web").unwrap();
    // second unmount is a no-op
    overlays.unmount(RootKind::Ship, "web").unwrap();

    let umounts: Vec<_> = home
        .mounter()
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("umount"))
        .collect();
    assert_eq!(umounts, ["umount pts", "umount proc", "umount dev", "umount sys", "umount web_merge"]);
    assert!(!overlays.is_mounted(RootKind::Ship, "web").unwrap());
}

#[test]
fn mounted_root_directories_are_not_removed() {
    let home = TestHome::new();
    let overlays = home.runtime().overlays();
    overlays
        .create_and_mount(RootKind::Ship, "web", &["root".to_string()])
        .unwrap();

    let err = overlays.remove_dirs(RootKind::Ship, "web").unwrap_err();
    assert!(matches!(err, ShipyardError::InvalidState(_)));

    overlays.unmount(RootKind::Ship, "web").unwrap();
    overlays.remove_dirs(RootKind::Ship, "web").unwrap();
    assert!(!overlays.paths(RootKind::Ship, "web").upper.exists());
}

#[test]
fn chain_through_missing_ancestor_names_it() {
    let home = TestHome::new();
    home.build_layer("base", "root");
    home.build_layer("app", "base");

    // simulate an ancestor whose row disappeared out from under its child
    let base = home.runtime().get_crate("base").unwrap();
    home.runtime()
        .db()
        .crates()
        .delete(base.id)
        .unwrap();

    let err = layers::resolve(&home.runtime().db().crates(), "app").unwrap_err();
    assert!(matches!(err, ShipyardError::LayerNotFound(ref layer) if layer == "base"));
}

#[test]
fn removed_ship_releases_root() {
    let home = TestHome::new();
    let image = home.build_layer("base", "root");
    let ships = home.runtime().db().ships();
    ships.record_spawn_failure("web", image.id).unwrap();
    assert_eq!(home.ship("web").unwrap().status(), ShipStatus::Error);

    home.runtime()
        .overlays()
        .create_and_mount(RootKind::Ship, "web", &["base".to_string(), "root".to_string()])
        .unwrap();

    home.runtime().remove_ship("web").unwrap();
    assert!(home.ship("web").is_none());
    assert!(!home.runtime().overlays().is_mounted(RootKind::Ship, "web").unwrap());
    assert!(!home.runtime().overlays().paths(RootKind::Ship, "web").upper.exists());
}
