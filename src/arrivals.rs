//! # Arrival Fetching
//!
//! Retrieves raw arrival records for one underlying stop id from the schedule backend.
//!
//! ## Backend Contract
//! - **Request**: `GET url_template` with the stop id substituted for `{}`, asking for JSON
//! - **Response**: a map keyed by stop id string:
//! ```json
//! {"231291": {"stop_name": "Patrick St",
//!             "arrivals": [{"route": "208", "headsign": "Lotabeg",
//!                           "scheduled_arrival": "2025-03-21T18:34:10",
//!                           "real_time_arrival": "2025-03-21T18:35:40"}]}}
//! ```
//!
//! ## Memory Budget
//! The body is read into one fixed receive buffer owned by the [`ArrivalFetcher`] and
//! reused for every request. A body that does not fit is a [`FetchError::ResponseTooLarge`],
//! never a reallocation. The buffer is wiped before each request so a short reply can
//! never be parsed together with leftovers from a previous one.
//!
//! ## Validation
//! Records without a headsign or without a real-time arrival are dropped silently. The
//! backend emits plenty of these during its own rebuilds and logging them is just noise.
//! A `null` in any field reads as if the key were missing, so one bad row never costs
//! the rest of the body.

use reqwest::header::ACCEPT;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::time::Duration;
use thiserror::Error;

/// Default receive buffer size in bytes
pub const DEFAULT_RECEIVE_BUFFER: usize = 4096;

/// Errors that can occur while fetching one stop's arrivals.
///
/// None of these touch cached state; the caller keeps whatever it had.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request failed (network, TLS, or protocol error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("backend returned status {0}")]
    Status(u16),

    /// Body did not fit in the receive buffer
    #[error("response exceeds {limit} byte receive buffer")]
    ResponseTooLarge { limit: usize },

    /// Reading the body failed part way
    #[error("receive IO: {0}")]
    Io(#[from] std::io::Error),

    /// Body was not the expected JSON shape
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Treat an explicit `null` the same as a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One arrival row exactly as the backend sent it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ArrivalRecord {
    /// Empty when the backend sent none
    #[serde(default, deserialize_with = "null_as_default")]
    pub route: String,
    #[serde(default)]
    pub headsign: Option<String>,
    #[serde(default)]
    pub scheduled_arrival: Option<String>,
    #[serde(default)]
    pub real_time_arrival: Option<String>,
}

impl ArrivalRecord {
    /// True when both headsign and real-time arrival are present and non-empty.
    pub fn is_complete(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.headsign) && filled(&self.real_time_arrival)
    }

    /// True when the real-time estimate is identical to the timetable.
    pub fn is_scheduled(&self) -> bool {
        self.real_time_arrival == self.scheduled_arrival
    }
}

#[derive(Deserialize)]
struct StopPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    stop_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    arrivals: Vec<ArrivalRecord>,
}

/// Validated result for one underlying stop id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopTimes {
    pub stop_name: String,
    /// Only complete records (see [`ArrivalRecord::is_complete`])
    pub arrivals: Vec<ArrivalRecord>,
}

/// Transport that fills a caller-owned buffer with a response body.
pub trait Backend {
    /// Fetch `url` into `buf`, returning the number of valid bytes.
    fn get(&mut self, url: &str, buf: &mut [u8]) -> Result<usize, FetchError>;
}

/// Blocking HTTP transport.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Backend for HttpBackend {
    fn get(&mut self, url: &str, buf: &mut [u8]) -> Result<usize, FetchError> {
        let mut response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        read_into(&mut response, buf)
    }
}

/// Read `reader` to the end into `buf`.
///
/// Fails with [`FetchError::ResponseTooLarge`] if even one byte remains once `buf` is full.
pub fn read_into(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, FetchError> {
    let mut filled = 0;
    loop {
        let read = if filled == buf.len() {
            let mut peek = [0u8; 1];
            match reader.read(&mut peek) {
                Ok(0) => return Ok(filled),
                Ok(_) => return Err(FetchError::ResponseTooLarge { limit: buf.len() }),
                Err(e) => Err(e),
            }
        } else {
            reader.read(&mut buf[filled..])
        };

        match read {
            Ok(0) => return Ok(filled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Fetches and validates arrivals through a fixed, reused receive buffer.
pub struct ArrivalFetcher<B> {
    backend: B,
    url_template: String,
    buffer: Vec<u8>,
}

impl<B: Backend> ArrivalFetcher<B> {
    /// `url_template` must contain `{}` where the stop id goes.
    pub fn new(backend: B, url_template: impl Into<String>, buffer_bytes: usize) -> Self {
        Self {
            backend,
            url_template: url_template.into(),
            buffer: vec![0; buffer_bytes],
        }
    }

    pub fn url_for(&self, stop_id: u32) -> String {
        self.url_template.replacen("{}", &stop_id.to_string(), 1)
    }

    /// Fetch one stop id.
    ///
    /// `Ok(None)` means the backend answered but knows nothing about this stop.
    pub fn fetch(&mut self, stop_id: u32) -> Result<Option<StopTimes>, FetchError> {
        self.reclaim();

        let url = self.url_for(stop_id);
        let len = self.backend.get(&url, &mut self.buffer)?;

        let mut all_stops: HashMap<String, StopPayload> =
            serde_json::from_slice(&self.buffer[..len])?;

        let Some(stop) = all_stops.remove(&stop_id.to_string()) else {
            return Ok(None);
        };

        Ok(Some(StopTimes {
            stop_name: stop.stop_name,
            arrivals: stop
                .arrivals
                .into_iter()
                .filter(ArrivalRecord::is_complete)
                .collect(),
        }))
    }

    /// Wipe the receive buffer ahead of the next request.
    fn reclaim(&mut self) {
        self.buffer.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Serves canned bodies and remembers the URLs it was asked for.
    struct CannedBackend {
        body: Vec<u8>,
        urls: Vec<String>,
    }

    impl CannedBackend {
        fn new(body: &str) -> Self {
            Self {
                body: body.as_bytes().to_vec(),
                urls: Vec::new(),
            }
        }
    }

    impl Backend for CannedBackend {
        fn get(&mut self, url: &str, buf: &mut [u8]) -> Result<usize, FetchError> {
            self.urls.push(url.to_string());
            read_into(&mut Cursor::new(&self.body), buf)
        }
    }

    const BODY: &str = r#"{
        "231291": {
            "stop_name": "Patrick St",
            "arrivals": [
                {"route": "208", "headsign": "Lotabeg", "scheduled_arrival": "2025-03-21T18:34:10", "real_time_arrival": "2025-03-21T18:35:40"},
                {"route": "208", "headsign": "", "scheduled_arrival": "2025-03-21T18:40:00", "real_time_arrival": "2025-03-21T18:40:00"},
                {"route": "220", "headsign": "Ballincollig", "scheduled_arrival": "2025-03-21T18:45:00", "real_time_arrival": ""},
                {"route": "220", "headsign": null, "scheduled_arrival": "2025-03-21T18:50:00", "real_time_arrival": "2025-03-21T18:50:00"},
                {"route": "226", "scheduled_arrival": "2025-03-21T18:55:00"},
                {"route": "216", "headsign": "Mount Oval", "scheduled_arrival": "2025-03-21T19:00:00", "real_time_arrival": "2025-03-21T19:00:00"}
            ]
        }
    }"#;

    #[test]
    fn test_fetch_keeps_only_complete_records() {
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(BODY), "http://x/{}", 4096);
        let times = fetcher.fetch(231291).unwrap().unwrap();

        assert_eq!(times.stop_name, "Patrick St");
        let routes: Vec<_> = times.arrivals.iter().map(|a| a.route.as_str()).collect();
        assert_eq!(routes, vec!["208", "216"]);
        assert!(!times.arrivals[0].is_scheduled());
        assert!(times.arrivals[1].is_scheduled());
    }

    #[test]
    fn test_null_fields_do_not_sink_the_body() {
        let body = r#"{"5": {"stop_name": null, "arrivals": [
            {"route": "208", "headsign": "Lotabeg", "scheduled_arrival": "2025-03-21T18:34:10", "real_time_arrival": "2025-03-21T18:34:10"},
            {"route": null, "headsign": "Mahon", "scheduled_arrival": null, "real_time_arrival": null}
        ]}}"#;
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(body), "{}", 4096);
        let times = fetcher.fetch(5).unwrap().unwrap();

        assert_eq!(times.stop_name, "");
        let routes: Vec<_> = times.arrivals.iter().map(|a| a.route.as_str()).collect();
        assert_eq!(routes, vec!["208"]);
    }

    #[test]
    fn test_null_route_reads_as_empty() {
        let body = r#"{"5": {"stop_name": "Patrick St", "arrivals": [
            {"route": null, "headsign": "Mahon", "scheduled_arrival": "2025-03-21T18:40:00", "real_time_arrival": "2025-03-21T18:41:00"}
        ]}, "6": {"stop_name": "Elsewhere", "arrivals": null}}"#;
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(body), "{}", 4096);

        let times = fetcher.fetch(5).unwrap().unwrap();
        assert_eq!(times.arrivals.len(), 1);
        assert_eq!(times.arrivals[0].route, "");
        assert_eq!(times.arrivals[0].headsign.as_deref(), Some("Mahon"));

        assert!(fetcher.fetch(6).unwrap().unwrap().arrivals.is_empty());
    }

    #[test]
    fn test_fetch_substitutes_stop_id() {
        let mut fetcher = ArrivalFetcher::new(
            CannedBackend::new(BODY),
            "http://backend/stops/{}?format=json",
            4096,
        );
        fetcher.fetch(231291).unwrap();
        assert_eq!(
            fetcher.backend.urls,
            vec!["http://backend/stops/231291?format=json"]
        );
    }

    #[test]
    fn test_unknown_stop_is_no_data() {
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(BODY), "{}", 4096);
        assert_eq!(fetcher.fetch(42).unwrap(), None);
    }

    #[test]
    fn test_oversized_response_is_an_error() {
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(BODY), "{}", 64);
        let err = fetcher.fetch(231291).unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge { limit: 64 }));
    }

    #[test]
    fn test_body_exactly_filling_buffer_is_accepted() {
        let body = r#"{"7": {"stop_name": "X", "arrivals": []}}"#;
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(body), "{}", body.len());
        let times = fetcher.fetch(7).unwrap().unwrap();
        assert!(times.arrivals.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new("<html>oops</html>"), "{}", 4096);
        assert!(matches!(
            fetcher.fetch(1).unwrap_err(),
            FetchError::Payload(_)
        ));
    }

    #[test]
    fn test_short_reply_does_not_see_previous_bytes() {
        let mut fetcher = ArrivalFetcher::new(CannedBackend::new(BODY), "{}", 4096);
        fetcher.fetch(231291).unwrap();

        fetcher.backend.body = b"{}".to_vec();
        assert_eq!(fetcher.fetch(231291).unwrap(), None);
        assert!(fetcher.buffer[2..].iter().all(|&b| b == 0));
    }
}
