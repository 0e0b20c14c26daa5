// tests/config_test.rs

//! Config-loading tests against the real filesystem and environment, since
//! `Configuration::load`'s XDG search (spec §6) is the one piece of `config`
//! that the in-crate unit tests deliberately don't exercise.

use julea_core::Configuration;
use std::sync::Mutex;

// `Configuration::load` reads process-wide environment variables, which
// `cargo test`'s default multi-threaded runner shares across every test in
// this binary. Serialize just the env-touching tests behind one lock rather
// than relying on `--test-threads=1`, mirroring the teacher corpus's env
// guards for the same hazard.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn load_finds_config_under_xdg_config_home() {
    let _guard = ENV_LOCK.lock().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let julea_dir = dir.path().join("julea");
    std::fs::create_dir_all(&julea_dir).unwrap();
    std::fs::write(
        julea_dir.join("julea-config"),
        "[servers]\nobject = [\"10.0.0.1:4711\"]\n",
    )
    .unwrap();

    unsafe {
        std::env::remove_var("JULEA_CONFIG");
        std::env::set_var("XDG_CONFIG_HOME", dir.path());
        std::env::remove_var("XDG_CONFIG_DIRS");
    }

    let config = Configuration::load("julea-config").unwrap();
    let servers = config.servers(julea_core::config::BackendType::Object);
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0], "10.0.0.1:4711");

    unsafe {
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}

#[test]
fn load_falls_back_to_xdg_config_dirs_when_config_home_misses() {
    let _guard = ENV_LOCK.lock().unwrap();

    let home_dir = tempfile::tempdir().unwrap();
    let dirs_dir = tempfile::tempdir().unwrap();
    let julea_dir = dirs_dir.path().join("julea");
    std::fs::create_dir_all(&julea_dir).unwrap();
    std::fs::write(
        julea_dir.join("julea-config"),
        "[servers]\nobject = [\"10.0.0.9:4711\"]\n",
    )
    .unwrap();

    unsafe {
        std::env::remove_var("JULEA_CONFIG");
        std::env::set_var("XDG_CONFIG_HOME", home_dir.path());
        std::env::set_var("XDG_CONFIG_DIRS", dirs_dir.path());
    }

    let config = Configuration::load("julea-config").unwrap();
    assert_eq!(config.server_count(julea_core::config::BackendType::Object), 1);

    unsafe {
        std::env::remove_var("XDG_CONFIG_HOME");
        std::env::remove_var("XDG_CONFIG_DIRS");
    }
}

#[test]
fn load_honors_an_absolute_julea_config_override() {
    let _guard = ENV_LOCK.lock().unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "[core]\nport = 9999\n").unwrap();

    unsafe {
        std::env::set_var("JULEA_CONFIG", file.path());
    }

    let config = Configuration::load("ignored-leaf-name").unwrap();
    assert_eq!(config.port, 9999);

    unsafe {
        std::env::remove_var("JULEA_CONFIG");
    }
}

#[test]
fn missing_config_file_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();

    unsafe {
        std::env::remove_var("JULEA_CONFIG");
        std::env::remove_var("XDG_CONFIG_HOME");
        std::env::remove_var("XDG_CONFIG_DIRS");
    }

    let err = Configuration::load("no-such-julea-config-anywhere").unwrap_err();
    assert!(matches!(err, julea_core::JuleaError::Config(_)));
}

#[test]
fn rejects_an_unparsable_server_entry() {
    let toml = "[servers]\nobject = [\"not-a-host-port\"]\n";
    assert!(Configuration::from_toml_str(toml).is_err());
}
