use crate::{Error, LoadSource, Result, error::bounded};
use async_trait::async_trait;
use core::time::Duration;
use serde::Deserialize;

/// Default PromQL for the load signal: POST requests per second against the
/// note creation view. `{window}` is replaced with the lookback window.
pub const DEFAULT_LOAD_QUERY: &str = r#"sum(rate(django_http_requests_total_by_view_transport_method_total{view="note-list",method="POST"}[{window}]))"#;

/// A [`LoadSource`] backed by a Prometheus instant query.
#[derive(Clone, Debug)]
pub struct PrometheusLoad {
    client: reqwest::Client,
    endpoint: String,
    query: String,
    timeout: Duration,
}

impl PrometheusLoad {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `base_url` is not an `http(s)` URL.
    pub fn new(base_url: &str, query: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "PROMETHEUS_URL must start with http:// or https://, got `{base_url}`"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base_url}/api/v1/query"),
            query: query.into(),
            timeout,
        })
    }

    fn render_query(&self, window: Duration) -> String {
        self.query
            .replace("{window}", &format!("{}s", window.as_secs().max(1)))
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    // `[<unix time>, "<value>"]`
    value: (f64, String),
}

fn parse_rate(response: QueryResponse) -> Result<f64> {
    if response.status != "success" {
        return Err(Error::signal(format!(
            "query failed: {}",
            response.error.unwrap_or(response.status)
        )));
    }
    let sample = response
        .data
        .and_then(|data| data.result.into_iter().next())
        .ok_or_else(|| Error::signal("query returned no samples"))?;
    sample
        .value
        .1
        .parse::<f64>()
        .map_err(|e| Error::signal(format!("unparseable sample `{}`: {e}", sample.value.1)))
}

#[async_trait]
impl LoadSource for PrometheusLoad {
    async fn current_rate(&self, window: Duration) -> Result<f64> {
        let query = self.render_query(window);
        let request = async {
            let response = self
                .client
                .get(&self.endpoint)
                .query(&[("query", query.as_str())])
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| Error::signal(e.to_string()))?;
            response
                .json::<QueryResponse>()
                .await
                .map_err(|e| Error::signal(e.to_string()))
        };
        let response = bounded(self.timeout, request, || {
            Error::signal(format!("prometheus query timed out after {:?}", self.timeout))
        })
        .await?;
        parse_rate(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<f64> {
        parse_rate(serde_json::from_str(body).unwrap())
    }

    #[test]
    fn parses_vector_sample() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000.123,"4.75"]}]}}"#;
        assert_eq!(parse(body).unwrap(), 4.75);
    }

    #[test]
    fn empty_result_is_unavailable() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(matches!(parse(body), Err(Error::SignalUnavailable { .. })));
    }

    #[test]
    fn error_status_is_unavailable() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let err = parse(body).unwrap_err();
        assert_eq!(err, Error::signal("query failed: parse error"));
    }

    #[test]
    fn renders_window() {
        let load = PrometheusLoad::new("http://prometheus:9090/", DEFAULT_LOAD_QUERY, Duration::from_secs(2))
            .unwrap();
        assert_eq!(load.endpoint, "http://prometheus:9090/api/v1/query");
        assert!(load.render_query(Duration::from_secs(300)).ends_with("[300s]))"));
    }

    #[test]
    fn rejects_non_http_url() {
        assert!(PrometheusLoad::new("prometheus:9090", DEFAULT_LOAD_QUERY, Duration::from_secs(1)).is_err());
    }
}
