//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install a log subscriber once per test binary. `RUST_LOG` controls output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create fixture directory");
    }
    std::fs::write(path, content).expect("Failed to write fixture file");
}

/// A project using every kind of layer: a theme chain, a local extend, an
/// npm package and an rc file.
pub fn write_fixture(root: &Path) {
    write(
        root,
        "config.json",
        r#"{
            "theme": "./theme",
            "extends": ["./config.dev", "npm-preset"],
            "colors": {"primary": "user_primary"},
            "configFile": true,
            "overriden": false,
            "array": ["a"],
            "overridenArray": ["a", "b", "c"]
        }"#,
    );
    write(root, ".configrc", "rcFile=true\ntestConfig=true\n");
    write(
        root,
        "theme/config.json",
        r#"{
            "extends": "../base",
            "colors": {"primary": "theme_primary", "secondary": "theme_secondary"}
        }"#,
    );
    write(
        root,
        "base/config.yaml",
        "baseConfig: true\narray:\n  - b\ncolors:\n  primary: base_primary\n  text: base_text\n",
    );
    write(root, "config.dev.json", r#"{"devConfig": true}"#);
    write(
        root,
        "node_modules/npm-preset/config.toml",
        "npmConfig = true\n",
    );
}
