//! Unit tests for run-level configuration.

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::EnvGuard;

#[fixture]
fn valid_config() -> KolaConfig {
    KolaConfig {
        platform: String::from("aws"),
        output_dir: String::from("_kola_temp"),
        parallel: 2,
        base_name: String::from("kola"),
        ssh_public_key_file: None,
        no_ssh_key_in_metadata: false,
        boot_timeout_secs: 600,
        boot_interval_secs: 10,
        gc_grace_period_secs: 3600,
        report_version: String::from("unknown"),
        update_payload: None,
        kolet_path: String::from("kolet"),
    }
}

#[rstest]
fn valid_config_passes(valid_config: KolaConfig) {
    valid_config.validate().expect("config should validate");
    assert_eq!(valid_config.platform(), Ok(Platform::Aws));
}

#[rstest]
#[case::platform(KolaConfig { platform: String::new(), ..valid_config() }, "KOLA_PLATFORM")]
#[case::output_dir(KolaConfig { output_dir: String::from("  "), ..valid_config() }, "KOLA_OUTPUT_DIR")]
#[case::base_name(KolaConfig { base_name: String::new(), ..valid_config() }, "KOLA_BASE_NAME")]
fn missing_fields_name_env_var_and_file(#[case] config: KolaConfig, #[case] env_var: &str) {
    let err = config.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = err else {
        panic!("expected MissingField, got {err:?}");
    };
    assert!(message.contains(env_var), "missing {env_var}: {message}");
    assert!(message.contains("kola.toml"), "missing file name: {message}");
}

#[rstest]
fn unknown_platform_is_invalid(valid_config: KolaConfig) {
    let err = KolaConfig {
        platform: String::from("gce"),
        ..valid_config
    }
    .validate()
    .expect_err("gce is not supported");
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("gce")), "got {err}");
}

#[rstest]
fn zero_parallelism_is_invalid(valid_config: KolaConfig) {
    let err = KolaConfig {
        parallel: 0,
        ..valid_config
    }
    .validate()
    .expect_err("parallel must be positive");
    assert!(err.to_string().contains("KOLA_PARALLEL"), "got {err}");
}

#[rstest]
fn derived_durations_follow_settings(valid_config: KolaConfig) {
    let config = KolaConfig {
        boot_timeout_secs: 120,
        boot_interval_secs: 5,
        gc_grace_period_secs: 60,
        ..valid_config
    };
    assert_eq!(
        config.boot_poll(),
        Poll::new(Duration::from_secs(120), Duration::from_secs(5))
    );
    assert_eq!(config.gc_grace_period(), Duration::from_secs(60));
    assert_eq!(config.output_path(), Utf8PathBuf::from("_kola_temp"));
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[("KOLA_PLATFORM", "packet"), ("KOLA_PARALLEL", "4")]).await;

    let config = KolaConfig::load_without_cli_args().expect("config should load");

    assert_eq!(config.platform(), Ok(Platform::Packet));
    assert_eq!(config.parallel, 4);
    assert_eq!(config.output_dir, "_kola_temp");
}

#[rstest]
fn public_key_is_read_and_trimmed(valid_config: KolaConfig) {
    let tmp = tempfile::TempDir::new().expect("tempdir");
    let key_path = tmp.path().join("id_ed25519.pub");
    std::fs::write(&key_path, "ssh-ed25519 AAAA kola@test\n").expect("write key");
    let config = KolaConfig {
        ssh_public_key_file: Some(key_path.to_string_lossy().into_owned()),
        ..valid_config
    };

    let key = config.ssh_public_key().expect("key readable");

    assert_eq!(key.as_deref(), Some("ssh-ed25519 AAAA kola@test"));
}

#[rstest]
fn missing_public_key_names_the_setting(valid_config: KolaConfig) {
    let config = KolaConfig {
        ssh_public_key_file: Some(String::from("/nonexistent/kola/id.pub")),
        ..valid_config
    };

    let err = config.ssh_public_key().expect_err("file is absent");

    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("KOLA_SSH_PUBLIC_KEY_FILE")));
    assert_eq!(
        KolaConfig {
            ssh_public_key_file: None,
            ..config
        }
        .ssh_public_key(),
        Ok(None)
    );
}
