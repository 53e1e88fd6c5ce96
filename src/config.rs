use crate::error::ConfigError;
use std::str::FromStr;

/// Env suffixes of the endpoint slots, in pool order.
const ENDPOINT_SLOTS: [&str; 3] = ["", "_NC", "_US2"];

const DEFAULT_SYSTEM_MESSAGE: &str = "You are an AI assistant that helps people find information.";
const DEFAULT_PREVIEW_API_VERSION: &str = "2023-06-01-preview";
const CHAT_API_VERSION: &str = "2023-03-15-preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    Fixed,
    Random,
}

impl Default for StartPolicy {
    fn default() -> Self {
        StartPolicy::Random
    }
}

impl FromStr for StartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "random" => Ok(Self::Random),
            _ => Err(ConfigError::InvalidValue {
                variable: "CHATRELAY_START_POLICY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Which attempt failures move on to the next endpoint. Timeouts always do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on_status: bool,
    pub retry_on_transport: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on_status: true,
            retry_on_transport: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub credential: String,
    pub resource: String,
    pub deployment: String,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens: 1000,
            stop: None,
        }
    }
}

/// Raw retrieval settings. Flags stay strings; the request builder interprets them.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub service: String,
    pub index: String,
    pub key: String,
    pub use_semantic_search: String,
    pub semantic_config: String,
    pub top_k: u32,
    pub enable_in_domain: String,
    pub content_columns: Option<String>,
    pub filename_column: Option<String>,
    pub title_column: Option<String>,
    pub url_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub sampling: SamplingConfig,
    pub search: Option<SearchConfig>,
    pub system_message: String,
    pub stream: bool,
    pub preview_api_version: String,
    pub chat_api_version: String,
    pub request_timeout_ms: u64,
    pub start_policy: StartPolicy,
    pub retry: RetryPolicy,
}

impl ConversationConfig {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            sampling: SamplingConfig::default(),
            search: None,
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            stream: true,
            preview_api_version: DEFAULT_PREVIEW_API_VERSION.to_string(),
            chat_api_version: CHAT_API_VERSION.to_string(),
            request_timeout_ms: default_request_timeout_ms(),
            start_policy: StartPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut endpoints = Vec::new();
        for (slot, suffix) in ENDPOINT_SLOTS.iter().enumerate() {
            let names = [
                format!("AZURE_OPENAI_KEY{suffix}"),
                format!("AZURE_OPENAI_RESOURCE{suffix}"),
                format!("AZURE_OPENAI_MODEL{suffix}"),
                format!("AZURE_OPENAI_MODEL_NAME{suffix}"),
            ];
            let values: Vec<Option<String>> = names.iter().map(|n| get(n)).collect();
            if values.iter().all(Option::is_none) {
                continue;
            }
            if let Some(pos) = values.iter().position(Option::is_none) {
                return Err(ConfigError::IncompleteEndpoint {
                    slot,
                    variable: names[pos].clone(),
                });
            }
            let mut values = values.into_iter().flatten();
            endpoints.push(EndpointConfig {
                credential: values.next().unwrap_or_default(),
                resource: values.next().unwrap_or_default(),
                deployment: values.next().unwrap_or_default(),
                model_name: values.next().unwrap_or_default(),
            });
        }
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        let mut config = Self::new(endpoints);
        config.sampling = SamplingConfig {
            temperature: parse_var(&get, "AZURE_OPENAI_TEMPERATURE", 0.0)?,
            top_p: parse_var(&get, "AZURE_OPENAI_TOP_P", 1.0)?,
            max_tokens: parse_var(&get, "AZURE_OPENAI_MAX_TOKENS", 1000)?,
            stop: get("AZURE_OPENAI_STOP_SEQUENCE")
                .map(|s| s.split('|').map(str::to_string).collect()),
        };
        if let Some(msg) = get("AZURE_OPENAI_SYSTEM_MESSAGE") {
            config.system_message = msg;
        }
        if let Some(version) = get("AZURE_OPENAI_PREVIEW_API_VERSION") {
            config.preview_api_version = version;
        }
        config.stream = get("AZURE_OPENAI_STREAM")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        config.request_timeout_ms = parse_var(
            &get,
            "CHATRELAY_REQUEST_TIMEOUT_MS",
            default_request_timeout_ms(),
        )?
        .max(1);
        if let Some(raw) = get("CHATRELAY_START_POLICY") {
            config.start_policy = raw.parse()?;
        }
        config.retry = RetryPolicy {
            retry_on_status: parse_bool(&get, "CHATRELAY_RETRY_ON_STATUS", true)?,
            retry_on_transport: parse_bool(&get, "CHATRELAY_RETRY_ON_TRANSPORT", false)?,
        };

        // Retrieval is on only when service, index and key are all present.
        if let (Some(service), Some(index), Some(key)) = (
            get("AZURE_SEARCH_SERVICE"),
            get("AZURE_SEARCH_INDEX"),
            get("AZURE_SEARCH_KEY"),
        ) {
            config.search = Some(SearchConfig {
                service,
                index,
                key,
                use_semantic_search: get("AZURE_SEARCH_USE_SEMANTIC_SEARCH")
                    .unwrap_or_else(|| "false".to_string()),
                semantic_config: get("AZURE_SEARCH_SEMANTIC_SEARCH_CONFIG")
                    .unwrap_or_else(|| "default".to_string()),
                top_k: parse_var(&get, "AZURE_SEARCH_TOP_K", 5)?,
                enable_in_domain: get("AZURE_SEARCH_ENABLE_IN_DOMAIN")
                    .unwrap_or_else(|| "true".to_string()),
                content_columns: get("AZURE_SEARCH_CONTENT_COLUMNS"),
                filename_column: get("AZURE_SEARCH_FILENAME_COLUMN"),
                title_column: get("AZURE_SEARCH_TITLE_COLUMN"),
                url_column: get("AZURE_SEARCH_URL_COLUMN"),
            });
        }

        Ok(config)
    }
}

fn parse_var<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            variable: name.to_string(),
            value: raw,
        }),
    }
}

fn parse_bool<G>(get: &G, name: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                variable: name.to_string(),
                value: raw,
            }),
        },
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn primary_slot() -> Vec<(&'static str, &'static str)> {
        vec![
            ("AZURE_OPENAI_KEY", "k0"),
            ("AZURE_OPENAI_RESOURCE", "res0"),
            ("AZURE_OPENAI_MODEL", "dep0"),
            ("AZURE_OPENAI_MODEL_NAME", "gpt-4"),
        ]
    }

    #[test]
    fn loads_defaults_with_single_endpoint() {
        let config = ConversationConfig::from_lookup(lookup(&primary_slot())).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].deployment, "dep0");
        assert_eq!(config.sampling, SamplingConfig::default());
        assert!(config.stream);
        assert!(config.search.is_none());
        assert_eq!(config.preview_api_version, "2023-06-01-preview");
        assert_eq!(config.start_policy, StartPolicy::Random);
        assert!(config.retry.retry_on_status);
        assert!(!config.retry.retry_on_transport);
    }

    #[test]
    fn endpoints_keep_slot_order() {
        let mut vars = primary_slot();
        vars.extend([
            ("AZURE_OPENAI_KEY_US2", "k2"),
            ("AZURE_OPENAI_RESOURCE_US2", "res2"),
            ("AZURE_OPENAI_MODEL_US2", "dep2"),
            ("AZURE_OPENAI_MODEL_NAME_US2", "gpt-35-turbo-16k"),
            ("AZURE_OPENAI_KEY_NC", "k1"),
            ("AZURE_OPENAI_RESOURCE_NC", "res1"),
            ("AZURE_OPENAI_MODEL_NC", "dep1"),
            ("AZURE_OPENAI_MODEL_NAME_NC", "gpt-4-32k"),
        ]);
        let config = ConversationConfig::from_lookup(lookup(&vars)).unwrap();
        let resources: Vec<&str> = config
            .endpoints
            .iter()
            .map(|e| e.resource.as_str())
            .collect();
        assert_eq!(resources, vec!["res0", "res1", "res2"]);
    }

    #[test]
    fn partial_endpoint_slot_is_rejected() {
        let mut vars = primary_slot();
        vars.push(("AZURE_OPENAI_KEY_NC", "k1"));
        vars.push(("AZURE_OPENAI_RESOURCE_NC", "res1"));
        let err = ConversationConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::IncompleteEndpoint {
                slot: 1,
                variable: "AZURE_OPENAI_MODEL_NC".to_string(),
            }
        );
    }

    #[test]
    fn no_endpoints_is_rejected() {
        let err = ConversationConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::NoEndpoints);
    }

    #[test]
    fn search_requires_service_index_and_key() {
        let mut vars = primary_slot();
        vars.push(("AZURE_SEARCH_SERVICE", "svc"));
        vars.push(("AZURE_SEARCH_INDEX", "idx"));
        let config = ConversationConfig::from_lookup(lookup(&vars)).unwrap();
        assert!(config.search.is_none());

        vars.push(("AZURE_SEARCH_KEY", "skey"));
        vars.push(("AZURE_SEARCH_TOP_K", "7"));
        let config = ConversationConfig::from_lookup(lookup(&vars)).unwrap();
        let search = config.search.unwrap();
        assert_eq!(search.top_k, 7);
        assert_eq!(search.enable_in_domain, "true");
        assert_eq!(search.semantic_config, "default");
    }

    #[test]
    fn stop_sequence_splits_on_pipe() {
        let mut vars = primary_slot();
        vars.push(("AZURE_OPENAI_STOP_SEQUENCE", "END|STOP"));
        vars.push(("AZURE_OPENAI_STREAM", "False"));
        let config = ConversationConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(
            config.sampling.stop,
            Some(vec!["END".to_string(), "STOP".to_string()])
        );
        assert!(!config.stream);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let mut vars = primary_slot();
        vars.push(("AZURE_OPENAI_MAX_TOKENS", "lots"));
        let err = ConversationConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("AZURE_OPENAI_MAX_TOKENS"));
    }

    #[test]
    fn start_policy_and_retry_knobs_parse() {
        let mut vars = primary_slot();
        vars.push(("CHATRELAY_START_POLICY", "Fixed"));
        vars.push(("CHATRELAY_RETRY_ON_TRANSPORT", "true"));
        vars.push(("CHATRELAY_RETRY_ON_STATUS", "0"));
        let config = ConversationConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.start_policy, StartPolicy::Fixed);
        assert!(config.retry.retry_on_transport);
        assert!(!config.retry.retry_on_status);
    }

    #[test]
    fn unknown_start_policy_is_rejected() {
        let mut vars = primary_slot();
        vars.push(("CHATRELAY_START_POLICY", "roundrobin"));
        let err = ConversationConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                variable: "CHATRELAY_START_POLICY".to_string(),
                value: "roundrobin".to_string(),
            }
        );
        assert_eq!(" Random ".parse::<StartPolicy>(), Ok(StartPolicy::Random));
    }
}
