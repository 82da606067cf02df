use std::fs;
use std::path::PathBuf;

use turn_server::accounts;
use turn_server::config::Config;

fn scratch_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("turn-server-test-{name}-{:?}", std::thread::current().id()));
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn loads_well_formed_account_lines() {
    let path = scratch_file("accounts-ok", "alice:hunter2:localhost\nbob:swordfish:example.com\n");
    let store = accounts::load(&path).unwrap();
    assert_eq!(store.len(), 2);
    fs::remove_file(path).unwrap();
}

#[test]
fn skips_malformed_lines() {
    let path = scratch_file(
        "accounts-malformed",
        "alice:hunter2:localhost\nnot-an-account-line\n\nbob:swordfish:example.com\n",
    );
    let store = accounts::load(&path).unwrap();
    assert_eq!(store.len(), 2);
    fs::remove_file(path).unwrap();
}

#[test]
fn config_fills_in_defaults_for_absent_keys() {
    let json = r#"{
        "nonce-key": "test-nonce-key",
        "account-file": "/etc/turn-server/accounts.txt",
    }"#;
    let config: Config = serde_json5::from_str(json).unwrap();

    assert_eq!(config.udp_port, 3478);
    assert_eq!(config.tcp_port, 3478);
    assert_eq!(config.realm, "localhost");
    assert_eq!(config.max_client, 4096);
    assert_eq!(config.max_relay_per_client, 16);
    assert_eq!(config.allocation_lifetime, 600);
    assert!(!config.tls);
    assert!(config.cert_file.is_none());
}

#[test]
fn config_honors_explicit_overrides() {
    let json = r#"{
        "listen-address": "192.0.2.1",
        "udp-port": 4000,
        "tcp-port": 4001,
        "tls": true,
        "realm": "example.com",
        "max-client": 10,
        "max-relay-per-client": 2,
        "allocation-lifetime": 120,
        "nonce-key": "test-nonce-key",
        "ca-file": "/etc/turn-server/ca.pem",
        "cert-file": "/etc/turn-server/cert.pem",
        "private-key-file": "/etc/turn-server/key.pem",
        "account-file": "/etc/turn-server/accounts.txt",
    }"#;
    let config: Config = serde_json5::from_str(json).unwrap();

    assert_eq!(config.listen_address, std::net::Ipv4Addr::new(192, 0, 2, 1));
    assert_eq!(config.udp_port, 4000);
    assert_eq!(config.tcp_port, 4001);
    assert!(config.tls);
    assert_eq!(config.realm, "example.com");
    assert_eq!(config.max_client, 10);
    assert_eq!(config.max_relay_per_client, 2);
    assert_eq!(config.allocation_lifetime, 120);
    assert_eq!(config.cert_file.as_deref(), Some("/etc/turn-server/cert.pem"));
}
