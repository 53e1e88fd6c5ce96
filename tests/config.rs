use chatrelay::config::{ConversationConfig, StartPolicy};
use chatrelay::error::ConfigError;
use std::collections::HashMap;
use tempfile::TempDir;

fn test_runtime(static_dir: &TempDir) -> chatrelay::app::RuntimeConfig {
    chatrelay::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        static_dir: static_dir.path().to_path_buf(),
    }
}

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn state_builds_pool_from_every_configured_slot() {
    let temp_dir = TempDir::new().expect("temp dir");
    let conversation = ConversationConfig::from_lookup(lookup(&[
        ("AZURE_OPENAI_KEY", "k0"),
        ("AZURE_OPENAI_RESOURCE", "east"),
        ("AZURE_OPENAI_MODEL", "dep0"),
        ("AZURE_OPENAI_MODEL_NAME", "gpt-4"),
        ("AZURE_OPENAI_KEY_US2", "k2"),
        ("AZURE_OPENAI_RESOURCE_US2", "west"),
        ("AZURE_OPENAI_MODEL_US2", "dep2"),
        ("AZURE_OPENAI_MODEL_NAME_US2", "gpt-35-turbo-16k"),
        ("CHATRELAY_START_POLICY", "fixed"),
    ]))
    .expect("config");

    let state = chatrelay::app::load_state_with(test_runtime(&temp_dir), conversation)
        .expect("load state");
    assert_eq!(state.pool.len(), 2);
    assert_eq!(state.pool.policy(), StartPolicy::Fixed);
    assert_eq!(state.pool.initial_index(), 0);
    assert_eq!(state.pool.select(1).resource, "west");
}

#[test]
fn state_can_be_loaded_repeatedly() {
    let temp_dir = TempDir::new().expect("temp dir");
    let conversation = || {
        ConversationConfig::from_lookup(lookup(&[
            ("AZURE_OPENAI_KEY", "k0"),
            ("AZURE_OPENAI_RESOURCE", "east"),
            ("AZURE_OPENAI_MODEL", "dep0"),
            ("AZURE_OPENAI_MODEL_NAME", "gpt-4"),
        ]))
        .expect("config")
    };
    let _first = chatrelay::app::load_state_with(test_runtime(&temp_dir), conversation())
        .expect("first load");
    let _second = chatrelay::app::load_state_with(test_runtime(&temp_dir), conversation())
        .expect("second load");
}

#[test]
fn missing_endpoints_fail_startup() {
    let err = ConversationConfig::from_lookup(lookup(&[])).unwrap_err();
    assert_eq!(err, ConfigError::NoEndpoints);
}
