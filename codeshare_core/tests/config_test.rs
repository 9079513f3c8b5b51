use codeshare_core::config::{AppConfig, BackendKind, CONFIG_DIR_ENV, get_config_dir};
use codeshare_core::DeviceClass;

// The only test in this binary that touches the environment
#[test]
fn test_config_persists_under_override_dir() {
    let dir = tempfile::tempdir().unwrap();
    unsafe {
        std::env::set_var(CONFIG_DIR_ENV, dir.path());
    }
    assert_eq!(get_config_dir().as_deref(), Some(dir.path()));

    // Nothing saved yet
    let loaded = AppConfig::load();
    assert_eq!(loaded.backend, BackendKind::File);

    let config = AppConfig {
        backend: BackendKind::Remote,
        remote_url: Some("ws://127.0.0.1:8787/rendezvous".into()),
        device_class: DeviceClass::Mobile,
        low_water_mark: 4096,
        ice_servers: vec!["stun:stun.example.org:3478".into()],
        ..AppConfig::default()
    };
    config.save().unwrap();

    let loaded = AppConfig::load();
    assert_eq!(loaded.backend, BackendKind::Remote);
    assert_eq!(loaded.remote_url.as_deref(), Some("ws://127.0.0.1:8787/rendezvous"));
    assert_eq!(loaded.device_class, DeviceClass::Mobile);
    assert_eq!(loaded.low_water_mark, 4096);
    assert_eq!(loaded.ice_servers, vec!["stun:stun.example.org:3478".to_string()]);
    assert!(loaded.rendezvous_file().starts_with(dir.path()));

    // A corrupt file falls back to defaults
    std::fs::write(dir.path().join("config.json"), "{not json").unwrap();
    assert_eq!(AppConfig::load().backend, BackendKind::File);
}
