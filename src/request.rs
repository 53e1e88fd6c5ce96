//! Outbound payload and header construction for one endpoint.

use crate::config::{ConversationConfig, SearchConfig};
use crate::pool::Endpoint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const KNOWN_CHAT_MODELS: [&str; 2] = ["gpt-35-turbo-4k", "gpt-35-turbo-16k"];
const USER_AGENT_HEADER: &str = "x-ms-useragent";
const USER_AGENT_VALUE: &str = "GitHubSampleWebApp/PublicAPI/1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body posted by the web client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConversation {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    pub data_source: Option<DataSource>,
}

impl ConversationRequest {
    /// Combines the client's turns with the configured sampling and retrieval settings.
    pub fn from_client(messages: Vec<ChatMessage>, config: &ConversationConfig) -> Self {
        Self {
            messages,
            temperature: config.sampling.temperature,
            top_p: config.sampling.top_p,
            max_tokens: config.sampling.max_tokens,
            stop: config.sampling.stop.clone(),
            stream: config.stream,
            data_source: config
                .search
                .as_ref()
                .map(|search| DataSource::from_search(search, &config.system_message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub parameters: DataSourceParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceParameters {
    pub endpoint: String,
    pub key: String,
    pub index_name: String,
    pub fields_mapping: FieldsMapping,
    pub in_scope: bool,
    #[serde(rename = "topNDocuments")]
    pub top_n_documents: u32,
    pub query_type: String,
    pub semantic_configuration: String,
    pub role_information: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldsMapping {
    pub content_field: Vec<String>,
    pub title_field: Option<String>,
    pub url_field: Option<String>,
    pub filepath_field: Option<String>,
}

impl DataSource {
    pub fn from_search(search: &SearchConfig, role_information: &str) -> Self {
        let semantic = search.use_semantic_search.eq_ignore_ascii_case("true");
        Self {
            source_type: "AzureCognitiveSearch".to_string(),
            parameters: DataSourceParameters {
                endpoint: format!("https://{}.search.windows.net", search.service),
                key: search.key.clone(),
                index_name: search.index.clone(),
                fields_mapping: FieldsMapping {
                    content_field: search
                        .content_columns
                        .as_deref()
                        .map(|cols| cols.split('|').map(str::to_string).collect())
                        .unwrap_or_default(),
                    title_field: search.title_column.clone(),
                    url_field: search.url_column.clone(),
                    filepath_field: search.filename_column.clone(),
                },
                in_scope: search.enable_in_domain.eq_ignore_ascii_case("true"),
                top_n_documents: search.top_k,
                query_type: if semantic { "semantic" } else { "simple" }.to_string(),
                semantic_configuration: if semantic {
                    search.semantic_config.clone()
                } else {
                    String::new()
                },
                role_information: role_information.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    #[serde(rename = "dataSources", skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<DataSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub payload: Payload,
    pub headers: Vec<(&'static str, String)>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `gpt-4*` anywhere in the name, or one of the known 3.5 chat deployments.
pub fn is_chat_model(model_name: &str) -> bool {
    let lowered = model_name.to_ascii_lowercase();
    lowered.contains("gpt-4") || KNOWN_CHAT_MODELS.contains(&lowered.as_str())
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    config: Arc<ConversationConfig>,
}

impl RequestBuilder {
    pub fn new(config: Arc<ConversationConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, req: &ConversationRequest, endpoint: &Endpoint) -> OutboundRequest {
        let completion_url = self.completion_url(endpoint);
        let (url, messages, data_sources) = match &req.data_source {
            Some(source) => (
                format!(
                    "{}/extensions/chat/completions?api-version={}",
                    endpoint.deployment_url(),
                    self.config.preview_api_version
                ),
                req.messages.clone(),
                vec![source.clone()],
            ),
            None => {
                let mut messages = Vec::with_capacity(req.messages.len() + 1);
                messages.push(ChatMessage {
                    role: "system".to_string(),
                    content: self.config.system_message.clone(),
                });
                messages.extend(req.messages.iter().cloned());
                (completion_url.clone(), messages, Vec::new())
            }
        };

        let payload = Payload {
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            stop: req.stop.clone(),
            stream: req.stream,
            data_sources,
        };
        let headers = vec![
            ("content-type", "application/json".to_string()),
            ("api-key", endpoint.credential.clone()),
            ("chatgpt_url", completion_url),
            ("chatgpt_key", endpoint.credential.clone()),
            (USER_AGENT_HEADER, USER_AGENT_VALUE.to_string()),
        ];
        OutboundRequest {
            url,
            payload,
            headers,
        }
    }

    fn completion_url(&self, endpoint: &Endpoint) -> String {
        let path = if is_chat_model(&endpoint.model_name) {
            "chat/completions"
        } else {
            "completions"
        };
        format!(
            "{}/{}?api-version={}",
            endpoint.deployment_url(),
            path,
            self.config.chat_api_version
        )
    }
}
