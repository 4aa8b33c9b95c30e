use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use narrator::config::{NarratorConfig, ENV_API_KEYS, ENV_ENDPOINT, ENV_MODEL};
use narrator::ConfigError;

#[test]
fn defaults_are_sane() {
    let config = NarratorConfig::default();
    assert_eq!(config.segmenter.max_length, 1500);
    assert_eq!(config.rate_limit.limit, 9);
    assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
    assert_eq!(config.rate_limit.safety_margin(), Duration::from_millis(500));
    assert_eq!(config.pipeline.look_ahead, 3);
    assert!(!config.pipeline.retain_audio);
    assert_eq!(config.playback.sample_rate, 24_000);
    assert_eq!(config.retry.max_suggested_wait_ms, 300_000);
    assert!(config.validate().is_ok());
}

#[test]
fn partial_json_keeps_other_defaults() {
    let config = NarratorConfig::from_json(
        r#"{ "rate_limit": { "limit": 4 }, "pipeline": { "look_ahead": 1 }, "endpoint": { "api_keys": ["a", "b"] } }"#,
    )
    .unwrap();
    assert_eq!(config.rate_limit.limit, 4);
    assert_eq!(config.rate_limit.window_ms, 60_000);
    assert_eq!(config.pipeline.look_ahead, 1);
    assert_eq!(config.endpoint.api_keys, vec!["a", "b"]);
    assert_eq!(config.segmenter.max_length, 1500);
}

#[test]
fn malformed_json_is_a_parse_error() {
    assert!(matches!(
        NarratorConfig::from_json("{ not json"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn environment_overrides_file_values() {
    let env: HashMap<&str, &str> = [
        (ENV_API_KEYS, " k1, k2 ,,k3 "),
        (ENV_ENDPOINT, "http://localhost:9000/v1"),
        (ENV_MODEL, "tts-test"),
    ]
    .into_iter()
    .collect();

    let mut config = NarratorConfig::default();
    config.endpoint.api_keys = vec!["from-file".into()];
    config.apply_env(|key| env.get(key).map(|v| v.to_string()));

    assert_eq!(config.endpoint.api_keys, vec!["k1", "k2", "k3"]);
    assert_eq!(config.endpoint.base_url, "http://localhost:9000/v1");
    assert_eq!(config.endpoint.model, "tts-test");
}

#[test]
fn blank_key_list_leaves_keys_alone() {
    let mut config = NarratorConfig::default();
    config.endpoint.api_keys = vec!["from-file".into()];
    config.apply_env(|key| (key == ENV_API_KEYS).then(|| " , ".to_string()));
    assert_eq!(config.endpoint.api_keys, vec!["from-file"]);
}

#[test]
fn validate_rejects_zero_limits() {
    let mut config = NarratorConfig::default();
    config.rate_limit.limit = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

    let mut config = NarratorConfig::default();
    config.rate_limit.window_ms = 0;
    assert!(config.validate().is_err());

    let mut config = NarratorConfig::default();
    config.segmenter.max_length = 0;
    assert!(config.validate().is_err());
}

#[test]
fn missing_file_reports_path() {
    let err = NarratorConfig::load(Some(Path::new("/definitely/not/here.json"))).unwrap_err();
    match err {
        ConfigError::Read { path, .. } => assert!(path.contains("not/here.json")),
        other => panic!("expected read error, got {:?}", other),
    }
}
