use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geo::GeoPoint;
use crate::inputs::Credential;

const NEARBY_SEARCH_PATH: &str = "/nearbysearch/json";

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyQuery {
    pub center: GeoPoint,
    pub radius: f64,
    pub place_type: String,
    pub language: String,
    /// Continuation token from the previous page. When present the API ignores
    /// every other search parameter.
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStatus {
    Ok,
    ZeroResults,
    OverQueryLimit,
    InvalidRequest,
    RequestDenied,
    Other(String),
}

impl SearchStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "OK" => Self::Ok,
            "ZERO_RESULTS" => Self::ZeroResults,
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => Self::OverQueryLimit,
            "INVALID_REQUEST" => Self::InvalidRequest,
            "REQUEST_DENIED" => Self::RequestDenied,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "OK",
            Self::ZeroResults => "ZERO_RESULTS",
            Self::OverQueryLimit => "OVER_QUERY_LIMIT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::RequestDenied => "REQUEST_DENIED",
            Self::Other(value) => value,
        }
    }
}

/// One page of a nearby search. `results` stays undecoded so that each entry
/// can be validated (and rejected) on its own.
#[derive(Debug, Clone)]
pub struct NearbyPage {
    pub status: SearchStatus,
    pub results: Vec<Value>,
    pub next_page_token: Option<String>,
    pub error_message: Option<String>,
}

impl NearbyPage {
    pub fn from_status(status: SearchStatus) -> Self {
        Self {
            status,
            results: Vec::new(),
            next_page_token: None,
            error_message: None,
        }
    }
}

#[async_trait]
pub trait NearbySearch: Send + Sync {
    async fn search_nearby(
        &self,
        credential: &Credential,
        query: &NearbyQuery,
    ) -> AppResult<NearbyPage>;
}

/// Google Places web service client (legacy Nearby Search endpoint).
#[derive(Clone)]
pub struct HttpNearbySearch {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpNearbySearch {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "{}{NEARBY_SEARCH_PATH}",
                config.places_api_base.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl NearbySearch for HttpNearbySearch {
    async fn search_nearby(
        &self,
        credential: &Credential,
        query: &NearbyQuery,
    ) -> AppResult<NearbyPage> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<Value>,
            next_page_token: Option<String>,
            error_message: Option<String>,
        }

        let key = credential.key().expose_secret();
        let params: Vec<(&str, String)> = match &query.page_token {
            Some(token) => vec![("pagetoken", token.clone()), ("key", key.to_string())],
            None => vec![
                (
                    "location",
                    format!("{},{}", query.center.lat, query.center.lon),
                ),
                ("radius", format!("{}", query.radius)),
                ("type", query.place_type.clone()),
                ("language", query.language.clone()),
                ("key", key.to_string()),
            ],
        };

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let parsed: Response = response.json().await?;

        Ok(NearbyPage {
            status: SearchStatus::parse(&parsed.status),
            results: parsed.results,
            next_page_token: parsed.next_page_token.filter(|token| !token.is_empty()),
            error_message: parsed.error_message,
        })
    }
}
