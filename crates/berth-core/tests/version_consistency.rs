//! Every workspace crate inherits the workspace version.

use std::path::Path;

fn workspace_root() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .unwrap()
}

#[test]
fn all_crates_use_workspace_version() {
    let root = workspace_root();
    let root_toml: toml::Value = std::fs::read_to_string(root.join("Cargo.toml"))
        .unwrap()
        .parse()
        .unwrap();
    let members = root_toml["workspace"]["members"].as_array().unwrap();
    assert!(!members.is_empty());

    for member in members {
        let dir = root.join(member.as_str().unwrap());
        let manifest: toml::Value = std::fs::read_to_string(dir.join("Cargo.toml"))
            .unwrap()
            .parse()
            .unwrap();
        let inherited = manifest["package"]["version"]
            .get("workspace")
            .and_then(toml::Value::as_bool);
        assert_eq!(
            inherited,
            Some(true),
            "{} should use version.workspace = true",
            dir.display()
        );
    }
}

#[test]
fn library_version_matches_workspace() {
    let root_toml: toml::Value = std::fs::read_to_string(workspace_root().join("Cargo.toml"))
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(
        root_toml["workspace"]["package"]["version"].as_str(),
        Some(berth_core::VERSION)
    );
}
