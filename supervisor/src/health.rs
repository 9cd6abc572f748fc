//! # Health & Metrics Scraper
//!
//! Watches the managed neard through its Prometheus endpoint. neard's
//! metric schema is large and untyped, so the parsed form is a flat map
//! from `name{labels}` to the raw value string, with typed accessors for
//! the handful of series the supervisor actually interprets.
//!
//! A failed scrape is not an error by itself: the previous sample stays
//! available and is merely marked stale. The leader only treats the child
//! as unhealthy once staleness exceeds its budget.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::ScrapeError;
use crate::settings::{SCRAPE_TIMEOUT, SCRAPE_UNHEALTHY};

const SYNCING_GAUGE: &str = "near_node_is_syncing";
const HEAD_GAUGE: &str = "near_block_height_head";
const EXPECTED_SHUTDOWN_GAUGE: &str = "near_block_expected_shutdown";
const CONFIG_RELOADS_COUNTER: &str = "near_config_reloads_total";
const SCHEDULE_GAUGE_PREFIX: &str = "near_validator_schedule_upcoming{";

/// Parses Prometheus text exposition into a flat map. Comment lines and
/// blank lines are skipped; label sets stay part of the key verbatim.
pub fn parse_metrics_text(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, rest) = match line.find('{') {
            // Labels present: the key runs through the closing brace.
            Some(open) if open < line.find(' ').unwrap_or(usize::MAX) => {
                match line.rfind('}') {
                    Some(close) => (&line[..=close], &line[close + 1..]),
                    None => continue,
                }
            }
            _ => match line.split_once(' ') {
                Some((key, rest)) => (key, rest),
                None => continue,
            },
        };
        // The value is the first token after the key; a timestamp may follow.
        if let Some(value) = rest.split_whitespace().next() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// One successfully fetched snapshot of neard's metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSample {
    map: HashMap<String, String>,
}

impl MetricsSample {
    pub fn from_text(text: &str) -> Self {
        Self {
            map: parse_metrics_text(text),
        }
    }

    /// Raw access for series without a typed accessor.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    fn u64_metric(&self, name: &'static str) -> Result<u64, ScrapeError> {
        let raw = self
            .map
            .get(name)
            .ok_or(ScrapeError::MissingMetric(name))?;
        parse_number(name, raw)
    }

    /// Whether neard reports itself as still syncing. The supervisor only
    /// competes for the lock once this turns false.
    pub fn is_syncing(&self) -> Result<bool, ScrapeError> {
        Ok(self.u64_metric(SYNCING_GAUGE)? != 0)
    }

    /// Height of the chain head as this node sees it.
    pub fn block_height(&self) -> Result<u64, ScrapeError> {
        self.u64_metric(HEAD_GAUGE)
    }

    /// The block height at which neard will shut itself down, if one is
    /// set through the dynamic configuration. Zero means unset.
    pub fn expected_shutdown(&self) -> Result<Option<u64>, ScrapeError> {
        if !self.map.contains_key(EXPECTED_SHUTDOWN_GAUGE) {
            return Ok(None);
        }
        match self.u64_metric(EXPECTED_SHUTDOWN_GAUGE)? {
            0 => Ok(None),
            height => Ok(Some(height)),
        }
    }

    /// How many times neard has reloaded its dynamic configuration.
    /// Absent until the first reload, which counts as zero.
    pub fn config_reloads(&self) -> Result<u64, ScrapeError> {
        if !self.map.contains_key(CONFIG_RELOADS_COUNTER) {
            return Ok(0);
        }
        self.u64_metric(CONFIG_RELOADS_COUNTER)
    }

    /// Upcoming block heights at which this validator is scheduled to
    /// produce, ascending. Entries with a zero value are ignored.
    pub fn production_slots(&self) -> Vec<u64> {
        let mut slots: Vec<u64> = self
            .map
            .iter()
            .filter(|(key, value)| {
                key.starts_with(SCHEDULE_GAUGE_PREFIX) && value.as_str() != "0"
            })
            .filter_map(|(key, _)| label_value(key, "height")?.parse().ok())
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }
}

fn parse_number(name: &'static str, raw: &str) -> Result<u64, ScrapeError> {
    // Gauges may render integral values as floats.
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(v);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.fract() == 0.0 && *v >= 0.0)
        .map(|v| v as u64)
        .ok_or_else(|| ScrapeError::BadValue {
            name,
            value: raw.to_string(),
        })
}

/// Extracts a label value out of a `name{a="x",b="y"}` key.
fn label_value<'a>(key: &'a str, label: &str) -> Option<&'a str> {
    let open = key.find('{')?;
    let close = key.rfind('}')?;
    for pair in key[open + 1..close].split(',') {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == label {
            return Some(value.trim().trim_matches('"'));
        }
    }
    None
}

/// Periodic scraper of one neard instance. Remembers the last good sample
/// and when it was taken.
pub struct Scraper {
    http: reqwest::Client,
    url: String,
    last_sample: Option<MetricsSample>,
    last_success: Option<Instant>,
}

impl Scraper {
    /// neard serves its metrics on the RPC address; that address is kept
    /// identical across roles so the scraper never needs to re-resolve.
    pub fn new(rpc_addr: SocketAddr) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .expect("building scrape http client");
        Self {
            http,
            url: format!("http://{rpc_addr}/metrics"),
            last_sample: None,
            last_success: None,
        }
    }

    pub async fn scrape(&mut self) -> Result<MetricsSample, ScrapeError> {
        let sample = fetch_sample(&self.http, &self.url).await?;
        self.last_sample = Some(sample.clone());
        self.last_success = Some(Instant::now());
        Ok(sample)
    }

    /// The most recent good sample, however stale.
    pub fn last_sample(&self) -> Option<&MetricsSample> {
        self.last_sample.as_ref()
    }

    /// Time since the last successful scrape.
    pub fn stale_for(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }

    /// Whether staleness has exceeded the health budget. Before the first
    /// success this is false; spawn readiness covers that phase.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self.stale_for(), Some(stale) if stale > SCRAPE_UNHEALTHY)
    }

    /// Forgets scrape history, e.g. across a child restart.
    pub fn reset(&mut self) {
        self.last_sample = None;
        self.last_success = None;
    }
}

/// One-shot fetch used by callers that do not track staleness themselves.
pub async fn fetch_sample(
    http: &reqwest::Client,
    url: &str,
) -> Result<MetricsSample, ScrapeError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| ScrapeError::Unreachable(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(ScrapeError::Unreachable(format!(
            "http status {}",
            resp.status()
        )));
    }
    let text = resp
        .text()
        .await
        .map_err(|e| ScrapeError::Unreachable(e.to_string()))?;
    Ok(MetricsSample::from_text(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# HELP near_block_height_head Height of the current head of the blockchain
# TYPE near_block_height_head gauge
near_block_height_head 1024
near_node_is_syncing 0
near_block_expected_shutdown 0
near_config_reloads_total 2
near_validator_schedule_upcoming{height="1030"} 1
near_validator_schedule_upcoming{height="1028"} 1
near_validator_schedule_upcoming{height="1050"} 0
near_peer_connections{peer="ed25519:abc",direction="in"} 3 1700000000
"#;

    fn sample() -> MetricsSample {
        MetricsSample::from_text(SAMPLE)
    }

    // -- 1. Text parsing ----------------------------------------------------

    #[test]
    fn parses_plain_and_labeled_series() {
        let map = parse_metrics_text(SAMPLE);
        assert_eq!(map.get("near_block_height_head").unwrap(), "1024");
        assert_eq!(
            map.get(r#"near_validator_schedule_upcoming{height="1030"}"#)
                .unwrap(),
            "1"
        );
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let map = parse_metrics_text("# HELP x y\n\n# TYPE x gauge\n");
        assert!(map.is_empty());
    }

    #[test]
    fn trailing_timestamps_are_not_part_of_the_value() {
        let map = parse_metrics_text(SAMPLE);
        assert_eq!(
            map.get(r#"near_peer_connections{peer="ed25519:abc",direction="in"}"#)
                .unwrap(),
            "3"
        );
    }

    // -- 2. Typed accessors -------------------------------------------------

    #[test]
    fn typed_accessors_convert_on_demand() {
        let s = sample();
        assert!(!s.is_syncing().unwrap());
        assert_eq!(s.block_height().unwrap(), 1024);
        assert_eq!(s.expected_shutdown().unwrap(), None);
        assert_eq!(s.config_reloads().unwrap(), 2);
    }

    #[test]
    fn expected_shutdown_zero_means_unset() {
        let s = MetricsSample::from_text("near_block_expected_shutdown 1000\n");
        assert_eq!(s.expected_shutdown().unwrap(), Some(1000));
        let s = MetricsSample::from_text("near_block_expected_shutdown 0\n");
        assert_eq!(s.expected_shutdown().unwrap(), None);
    }

    #[test]
    fn missing_sync_gauge_is_an_error() {
        let s = MetricsSample::from_text("");
        assert!(matches!(
            s.is_syncing(),
            Err(ScrapeError::MissingMetric(_))
        ));
    }

    #[test]
    fn float_rendered_gauges_parse() {
        let s = MetricsSample::from_text("near_block_height_head 1024.0\n");
        assert_eq!(s.block_height().unwrap(), 1024);
    }

    #[test]
    fn garbage_values_are_bad_values() {
        let s = MetricsSample::from_text("near_block_height_head NaN\n");
        assert!(matches!(
            s.block_height(),
            Err(ScrapeError::BadValue { .. })
        ));
    }

    // -- 3. Production schedule ---------------------------------------------

    #[test]
    fn production_slots_are_sorted_and_filtered() {
        assert_eq!(sample().production_slots(), vec![1028, 1030]);
    }

    #[test]
    fn no_schedule_series_means_no_slots() {
        let s = MetricsSample::from_text("near_block_height_head 5\n");
        assert!(s.production_slots().is_empty());
    }

    // -- 4. Label extraction ------------------------------------------------

    #[test]
    fn label_value_handles_multiple_labels() {
        let key = r#"near_peer_connections{peer="ed25519:abc",direction="in"}"#;
        assert_eq!(label_value(key, "direction"), Some("in"));
        assert_eq!(label_value(key, "peer"), Some("ed25519:abc"));
        assert_eq!(label_value(key, "absent"), None);
    }
}
