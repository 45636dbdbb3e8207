//! Integration tests for pool-config
//!
//! These tests verify the config loading pipeline with real file system operations.

use pool_config::testing::TestEnvironment;
use pool_config::{Config, DiskSpace, PoolSetup};

/// Pool-local config is layered on top of the defaults
#[test]
fn test_load_pool_local_config() {
    let env = TestEnvironment::new().unwrap();
    env.write_local_config(
        r#"
[pool]
name = "pool-42"
volatile = true

[repository]
max_diskspace = "512m"
cached_hold_secs = 60
"#,
    )
    .unwrap();

    let config = Config::load(Some(&env.base_dir)).unwrap();

    assert_eq!(config.pool.name, "pool-42");
    assert!(config.pool.volatile);
    assert_eq!(config.pool.base_dir, env.base_dir);
    assert_eq!(
        config.repository.max_diskspace,
        Some(DiskSpace::Bytes(512 << 20))
    );
    assert_eq!(config.repository.cached_hold_secs, 60);
    // Untouched values keep their defaults
    assert_eq!(config.repository.notification_queue_capacity, 4096);
}

/// A malformed size in the config is reported as a parse error
#[test]
fn test_invalid_size_is_rejected() {
    let env = TestEnvironment::new().unwrap();
    env.write_local_config(
        r#"
[repository]
max_diskspace = "lots"
"#,
    )
    .unwrap();

    assert!(Config::load(Some(&env.base_dir)).is_err());
}

/// Runtime setup survives a reload, as it would across a pool restart
#[test]
fn test_setup_persists_across_restart() {
    let env = TestEnvironment::new().unwrap();
    let path = env.setup_path();

    let mut setup = PoolSetup::load(&path).unwrap();
    setup.max_diskspace = Some("infinity".parse().unwrap());
    setup.save(&path).unwrap();

    let reloaded = PoolSetup::load(&path).unwrap();
    assert_eq!(reloaded.max_diskspace, Some(DiskSpace::Infinite));
    assert_eq!(reloaded.gap, None);
}
