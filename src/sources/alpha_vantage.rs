use super::QuoteSource;
use crate::error::{FetchError, FetchErrorKind};
use crate::types::{CurrencyPair, Rate, RateObservation};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

const SERIES_KEY: &str = "Time Series FX (Daily)";
const CLOSE_KEY: &str = "4. close";

pub struct AlphaVantage {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantage {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl QuoteSource for AlphaVantage {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    async fn fetch_pair(&self, pair: &CurrencyPair) -> Result<Vec<RateObservation>, FetchError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", "FX_DAILY"),
                ("from_symbol", pair.base()),
                ("to_symbol", pair.quote()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::new(pair, e.into()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::new(
                pair,
                FetchErrorKind::Status {
                    status: status.as_u16(),
                    body,
                },
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::new(pair, e.into()))?;

        parse_daily_series(pair, &body)
    }
}

/// Turn an `FX_DAILY` response body into observations.
///
/// A missing series yields no observations. Entries with an unparseable date
/// or close price are skipped; later runs can recover them.
pub fn parse_daily_series(
    pair: &CurrencyPair,
    body: &Value,
) -> Result<Vec<RateObservation>, FetchError> {
    if let Some(message) = body.get("Error Message").and_then(|v| v.as_str()) {
        return Err(FetchError::new(
            pair,
            FetchErrorKind::Rejected(message.to_string()),
        ));
    }

    let Some(series) = body.get(SERIES_KEY) else {
        // Rate-limit notices arrive with HTTP 200 and no series.
        if let Some(notice) = ["Note", "Information"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
        {
            return Err(FetchError::new(
                pair,
                FetchErrorKind::Rejected(notice.to_string()),
            ));
        }
        debug!("{}: response carries no time series", pair);
        return Ok(Vec::new());
    };

    let Some(entries) = series.as_object() else {
        return Err(FetchError::new(
            pair,
            FetchErrorKind::Payload(format!("'{}' is not an object", SERIES_KEY)),
        ));
    };

    let mut observations = Vec::with_capacity(entries.len());
    for (date, fields) in entries {
        let Ok(observed_date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            warn!("{}: skipping entry with invalid date '{}'", pair, date);
            continue;
        };
        let close = match fields.get(CLOSE_KEY) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                warn!("{} {}: skipping entry without close price", pair, date);
                continue;
            }
        };
        let rate = match close.parse::<Rate>() {
            Ok(rate) => rate,
            Err(e) => {
                warn!("{} {}: skipping entry: {}", pair, date, e);
                continue;
            }
        };
        observations.push(RateObservation::new(pair.clone(), rate, observed_date));
    }

    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn usd_eur() -> CurrencyPair {
        CurrencyPair::new("USD", "EUR").unwrap()
    }

    /// Serves one canned HTTP response on a local port and yields the request
    /// line it received.
    async fn serve_once(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            let text = String::from_utf8_lossy(&request).into_owned();
            text.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://{}/query", addr), handle)
    }

    fn source(base_url: String) -> AlphaVantage {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        AlphaVantage::new(client, "test-key".to_string(), base_url)
    }

    #[test]
    fn parses_each_dated_close() {
        let body = json!({
            "Meta Data": { "2. From Symbol": "USD", "3. To Symbol": "EUR" },
            "Time Series FX (Daily)": {
                "2024-03-15": { "1. open": "0.91", "4. close": "0.918700" },
                "2024-03-14": { "1. open": "0.92", "4. close": "0.9150" }
            }
        });
        let mut obs = parse_daily_series(&usd_eur(), &body).unwrap();
        obs.sort_by_key(|o| o.observed_date);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].observed_date, NaiveDate::from_ymd_opt(2024, 3, 14).unwrap());
        assert_eq!(obs[0].rate.to_string(), "0.915000");
        assert_eq!(obs[1].rate.to_string(), "0.918700");
        assert!(obs.iter().all(|o| o.pair == usd_eur()));
    }

    #[test]
    fn missing_series_is_empty_not_error() {
        let obs = parse_daily_series(&usd_eur(), &json!({ "Meta Data": {} })).unwrap();
        assert!(obs.is_empty());

        let obs = parse_daily_series(&usd_eur(), &json!({ "Time Series FX (Daily)": {} })).unwrap();
        assert!(obs.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let body = json!({
            "Time Series FX (Daily)": {
                "2024-03-15": { "4. close": "0.9187" },
                "2024-03-14": { "4. close": "n/a" },
                "not-a-date": { "4. close": "0.91" },
                "2024-03-13": { "1. open": "0.91" },
                "2024-03-12": { "4. close": "-1" },
                "2024-03-11": { "4. close": "10000000000000" }
            }
        });
        let obs = parse_daily_series(&usd_eur(), &body).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].observed_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
    }

    #[test]
    fn error_message_fails_the_pair() {
        let body = json!({ "Error Message": "Invalid API call." });
        let err = parse_daily_series(&usd_eur(), &body).unwrap_err();
        assert_eq!(err.pair, usd_eur());
        assert!(matches!(err.kind, FetchErrorKind::Rejected(_)));
    }

    #[test]
    fn rate_limit_notice_fails_the_pair() {
        let body = json!({ "Note": "Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day." });
        let err = parse_daily_series(&usd_eur(), &body).unwrap_err();
        assert!(matches!(err.kind, FetchErrorKind::Rejected(_)));
    }

    #[tokio::test]
    async fn non_success_status_fails_the_pair() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"oops":true}"#).await;
        let err = source(url).fetch_pair(&usd_eur()).await.unwrap_err();
        server.await.unwrap();

        assert_eq!(err.pair, usd_eur());
        match err.kind {
            FetchErrorKind::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("oops"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn daily_request_carries_pair_and_key() {
        let body = json!({
            "Time Series FX (Daily)": {
                "2024-03-15": { "4. close": "0.9187" },
                "2024-03-14": { "4. close": "0.9150" }
            }
        })
        .to_string();
        let (url, server) = serve_once("200 OK", &body).await;
        let obs = source(url).fetch_pair(&usd_eur()).await.unwrap();
        let request_line = server.await.unwrap();

        assert_eq!(obs.len(), 2);
        assert!(request_line.starts_with("GET /query?"), "{}", request_line);
        for param in ["function=FX_DAILY", "from_symbol=USD", "to_symbol=EUR", "apikey=test-key"] {
            assert!(request_line.contains(param), "missing {} in {}", param, request_line);
        }
    }
}
