//! Global subscriber installation. Kept in its own test binary since it sets process-wide state.

use rust_swatch::logging::{self, OutputFormat, TracingConfig};
use rust_swatch::SystemConfig;
use serial_test::serial;
use tracing::Level;

#[test]
#[serial]
fn test_init_is_idempotent() {
    let config = TracingConfig::new(Level::DEBUG)
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    logging::init(config.clone()).unwrap();
    logging::init(config).unwrap();

    tracing::info!("subscriber installed");
}

#[test]
#[serial]
fn test_init_from_config() {
    let config = SystemConfig::from_toml_str(
        r#"
        [system]
        id = "crate1"
        log_level = "trace"
        "#,
    )
    .unwrap();
    logging::init_from_config(&config).unwrap();
}

#[test]
#[serial]
fn test_init_from_config_rejects_bad_level() {
    let config = SystemConfig::from_toml_str(
        r#"
        [system]
        id = "crate1"
        log_level = "loud"
        "#,
    )
    .unwrap();
    assert!(logging::init_from_config(&config).is_err());
}
