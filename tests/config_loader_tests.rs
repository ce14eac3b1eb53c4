use relay_hub::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("RELAY_PROFILE");
        env::remove_var("RELAY_API_BIND_ADDR");
        env::remove_var("RELAY_LOG_LEVEL");
        env::remove_var("RELAY_CRYPTO_KEY");
        env::remove_var("RELAY_OPERATOR_TOKEN");
        env::remove_var("RELAY_OPERATOR_TOKENS");
        env::remove_var("RELAY_QUEUE_OVERRIDE_WEBHOOK_PROCESSING_CONCURRENCY");
        env::remove_var("RELAY_QUEUE_OVERRIDE_NOTIFICATIONS_BACKOFF_BASE_MS");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn empty_dir_loader() -> (TempDir, ConfigLoader) {
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    (temp_dir, loader)
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_OPERATOR_TOKEN", "ops-token");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "development");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.operator_tokens, vec!["ops-token".to_string()]);
    cfg.bind_addr().expect("default bind addr parses");

    // Non-production without RELAY_CRYPTO_KEY falls back to a generated key.
    assert!(cfg.crypto_key_ephemeral);
    assert_eq!(cfg.crypto_key.expect("ephemeral key generated").len(), 32);

    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "RELAY_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "RELAY_API_BIND_ADDR=192.168.0.10:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "RELAY_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "RELAY_PROFILE=test\nRELAY_API_BIND_ADDR=127.0.0.1:4000\nRELAY_OPERATOR_TOKEN=test-token-for-layered-test\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "RELAY_API_BIND_ADDR=127.0.0.1:3000\nRELAY_OPERATOR_TOKEN=test-token-for-env-override\n",
    );

    unsafe {
        env::set_var("RELAY_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");

    clear_env();
}

#[test]
fn operator_tokens_accept_comma_separated_list() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_OPERATOR_TOKENS", "alpha, beta ,,gamma");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let cfg = loader.load().expect("config loads with token list");
    assert_eq!(
        cfg.operator_tokens,
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );

    clear_env();
}

#[test]
fn queue_override_variables_map_to_queue_names() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_OPERATOR_TOKEN", "ops-token");
        env::set_var("RELAY_QUEUE_OVERRIDE_WEBHOOK_PROCESSING_CONCURRENCY", "7");
        env::set_var("RELAY_QUEUE_OVERRIDE_NOTIFICATIONS_BACKOFF_BASE_MS", "250");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let cfg = loader.load().expect("config loads with queue overrides");

    let webhook = cfg
        .queue_overrides
        .get("webhook-processing")
        .expect("webhook-processing override present");
    assert_eq!(webhook.concurrency, Some(7));
    assert_eq!(webhook.backoff_base_ms, None);

    let notifications = cfg
        .queue_overrides
        .get("notifications")
        .expect("notifications override present");
    assert_eq!(notifications.backoff_base_ms, Some(250));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_OPERATOR_TOKEN", "ops-token");
        env::set_var("RELAY_API_BIND_ADDR", "not-an-addr");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn production_requires_crypto_key() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_PROFILE", "production");
        env::set_var("RELAY_OPERATOR_TOKEN", "ops-token");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("production without key should fail");
    assert!(format!("{}", err).contains("crypto key is required in production"));

    clear_env();
}

#[test]
fn missing_operator_tokens_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let (_temp_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("no operator tokens should fail");
    assert!(format!("{}", err).contains("no operator tokens configured"));

    clear_env();
}

#[test]
fn crypto_key_must_decode_to_32_bytes() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("RELAY_OPERATOR_TOKEN", "ops-token");
        // "c2hvcnQ=" is base64 for "short": valid encoding, wrong length.
        env::set_var("RELAY_CRYPTO_KEY", "c2hvcnQ=");
    }

    let (_temp_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("short key should fail");
    assert!(format!("{}", err).contains("exactly 32 bytes"));

    unsafe {
        env::set_var("RELAY_CRYPTO_KEY", "!!!not-base64!!!");
    }
    let (_temp_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("malformed key should fail");
    assert!(format!("{}", err).contains("invalid base64"));

    clear_env();
}
