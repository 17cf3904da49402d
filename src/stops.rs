//! # Stop Cache and Registry
//!
//! A *logical stop* is one configured display entry. It may aggregate several
//! *underlying* backend stop ids (both sides of a street, say) under one name.
//!
//! ## Configuration Lines
//! ```text
//! 231291, 231292, default, name=Patrick St
//! ```
//! Leading integer tokens are stop ids; a repeated id counts once. The first non-integer
//! token and everything after it are preferences: `default` marks the boot stop,
//! `name=<value>` overrides the backend's stop name (an empty value means no override).
//! Anything else is an error.
//!
//! ## Staleness Hold-over
//! The backend periodically drops and rebuilds its cache, which takes anywhere from a few
//! seconds to a minute or two. During a rebuild every stop reports zero arrivals. To keep
//! the sign from flashing "no service" each time, an empty fetch only replaces cached
//! arrivals once the last good update is older than the staleness ceiling (90 s by
//! default). The ceiling stops the last service of the night sticking on screen.

use crate::arrivals::{ArrivalFetcher, ArrivalRecord, Backend, FetchError};
use crate::clock::parse_timestamp;
use crate::Arrival;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Rows on the arrival board unless configured otherwise
pub const DEFAULT_BOARD_ROWS: usize = 4;

/// Seconds an empty fetch is ignored after the last good one
pub const DEFAULT_STALENESS_SECS: i64 = 90;

/// A stop configuration line that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopParseError {
    #[error("no stop IDs were found")]
    NoStopIds,

    #[error("stop ID {0:?} could not be coerced to an integer")]
    BadStopId(String),

    #[error("invalid preference: {0:?}")]
    InvalidPreference(String),
}

/// One parsed configuration line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopConfiguration {
    /// Underlying backend stop ids, in configured order (never empty, no repeats)
    pub stop_ids: Vec<u32>,
    /// Display-name override
    pub name: Option<String>,
    /// Boot default
    pub is_default: bool,
}

fn is_integer(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

impl FromStr for StopConfiguration {
    type Err = StopParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let pieces: Vec<&str> = line.split(',').map(str::trim).collect();
        let split = pieces
            .iter()
            .position(|p| !is_integer(p))
            .unwrap_or(pieces.len());
        let (ids, prefs) = pieces.split_at(split);

        let mut stop_ids = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id
                .parse::<u32>()
                .map_err(|_| StopParseError::BadStopId(id.to_string()))?;
            // the ids form a set; a repeat would put every bus on the board twice
            if !stop_ids.contains(&id) {
                stop_ids.push(id);
            }
        }

        if stop_ids.is_empty() {
            return Err(StopParseError::NoStopIds);
        }

        let mut config = StopConfiguration {
            stop_ids,
            name: None,
            is_default: false,
        };

        for pref in prefs {
            let lower = pref.to_ascii_lowercase();
            if lower == "default" {
                config.is_default = true;
            } else if lower.starts_with("name=") {
                // an empty override leaves the backend's name in place
                config.name = pref
                    .split_once('=')
                    .map(|(_, v)| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string);
            } else {
                return Err(StopParseError::InvalidPreference(pref.to_string()));
            }
        }

        Ok(config)
    }
}

/// Cached arrivals for one underlying stop id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StopCacheEntry {
    pub arrivals: Vec<ArrivalRecord>,
    /// Epoch of the last accepted update
    pub last_good_update: i64,
}

impl StopCacheEntry {
    fn new(arrivals: Vec<ArrivalRecord>, now: i64) -> Self {
        Self {
            arrivals,
            last_good_update: now,
        }
    }

    /// Apply a fresh fetch under the staleness policy. Returns true if it was accepted.
    pub fn update(&mut self, arrivals: Vec<ArrivalRecord>, now: i64, ceiling_secs: i64) -> bool {
        if arrivals.is_empty() && now - self.last_good_update <= ceiling_secs {
            return false;
        }
        self.arrivals = arrivals;
        self.last_good_update = now;
        true
    }
}

/// A logical stop and its per-stop-id cache.
#[derive(Clone, Debug)]
pub struct BusStop {
    config: StopConfiguration,
    name: Option<String>,
    cache: HashMap<u32, StopCacheEntry>,
}

impl BusStop {
    pub fn new(config: StopConfiguration) -> Self {
        Self {
            name: config.name.clone(),
            config,
            cache: HashMap::new(),
        }
    }

    pub fn config(&self) -> &StopConfiguration {
        &self.config
    }

    /// Display name: the configured override, else the first name the backend gave.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cache_entry(&self, stop_id: u32) -> Option<&StopCacheEntry> {
        self.cache.get(&stop_id)
    }

    /// Refresh every underlying stop id; a failure on one does not stop the others.
    pub fn refresh<B: Backend>(
        &mut self,
        fetcher: &mut ArrivalFetcher<B>,
        now: i64,
        ceiling_secs: i64,
    ) -> Vec<(u32, FetchError)> {
        let mut errors = Vec::new();

        for &stop_id in &self.config.stop_ids {
            let times = match fetcher.fetch(stop_id) {
                Ok(times) => times,
                Err(e) => {
                    warn!("fetch for stop {stop_id} failed: {e}");
                    errors.push((stop_id, e));
                    continue;
                }
            };

            let arrivals = match times {
                Some(times) => {
                    if self.name.is_none() && !times.stop_name.is_empty() {
                        info!("stop {stop_id} is named {:?}", times.stop_name);
                        self.name = Some(times.stop_name);
                    }
                    times.arrivals
                }
                None => Vec::new(),
            };

            match self.cache.get_mut(&stop_id) {
                Some(entry) => {
                    if !entry.update(arrivals, now, ceiling_secs) {
                        debug!("stop {stop_id}: empty fetch, holding previous arrivals");
                    }
                }
                None => {
                    self.cache.insert(stop_id, StopCacheEntry::new(arrivals, now));
                }
            }
        }

        errors
    }

    /// Every cached record, grouped by stop id in configured order.
    pub fn all_arrivals(&self) -> impl Iterator<Item = &ArrivalRecord> {
        self.config
            .stop_ids
            .iter()
            .filter_map(|id| self.cache.get(id))
            .flat_map(|entry| entry.arrivals.iter())
    }

    /// The next `count` services, soonest first.
    ///
    /// `now` must be the uncorrected (UTC) epoch. Records whose timestamp will not
    /// parse are dropped. Equal times keep their merge order.
    pub fn arrival_board(
        &self,
        count: usize,
        now: i64,
        name_subs: &HashMap<String, String>,
    ) -> Vec<Arrival> {
        let mut board: Vec<Arrival> = self
            .all_arrivals()
            .filter_map(|record| {
                let headsign = record.headsign.as_deref().filter(|h| !h.is_empty())?;
                let real_time = record.real_time_arrival.as_deref()?;

                let epoch = match parse_timestamp(real_time) {
                    Ok(epoch) => epoch,
                    Err(e) => {
                        warn!("dropping route {} arrival: {e}", record.route);
                        return None;
                    }
                };

                Some(Arrival {
                    route: record.route.clone(),
                    headsign: name_subs
                        .get(headsign)
                        .cloned()
                        .unwrap_or_else(|| headsign.to_string()),
                    seconds: epoch - now,
                    scheduled: record.is_scheduled(),
                })
            })
            .collect();

        board.sort_by_key(|a| a.seconds);
        board.truncate(count);
        board
    }
}

/// Failures collected during one registry refresh.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// (underlying stop id, error) for each failed fetch
    pub errors: Vec<(u32, FetchError)>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// All configured logical stops plus the shared display preferences.
#[derive(Clone, Debug)]
pub struct StopRegistry {
    stops: Vec<BusStop>,
    name_subs: HashMap<String, String>,
    staleness_secs: i64,
}

impl StopRegistry {
    pub fn new(configs: Vec<StopConfiguration>) -> Self {
        Self {
            stops: configs.into_iter().map(BusStop::new).collect(),
            name_subs: HashMap::new(),
            staleness_secs: DEFAULT_STALENESS_SECS,
        }
    }

    /// Headsign substitutions, applied by exact match.
    pub fn with_name_substitutions(mut self, subs: HashMap<String, String>) -> Self {
        self.name_subs = subs;
        self
    }

    pub fn with_staleness_secs(mut self, secs: i64) -> Self {
        self.staleness_secs = secs;
        self
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    pub fn stop(&self, index: usize) -> Option<&BusStop> {
        self.stops.get(index)
    }

    /// Index of the first stop marked `default`, else 0.
    pub fn default_index(&self) -> usize {
        self.stops
            .iter()
            .position(|s| s.config.is_default)
            .unwrap_or(0)
    }

    /// Refresh every underlying stop id of every logical stop.
    pub fn refresh<B: Backend>(&mut self, fetcher: &mut ArrivalFetcher<B>, now: i64) -> RefreshReport {
        let mut report = RefreshReport::default();
        for stop in &mut self.stops {
            report
                .errors
                .extend(stop.refresh(fetcher, now, self.staleness_secs));
        }
        report
    }

    /// Ranked board for the stop at `index`; empty if there is no such stop.
    pub fn arrival_board(&self, index: usize, count: usize, now: i64) -> Vec<Arrival> {
        self.stops
            .get(index)
            .map(|stop| stop.arrival_board(count, now, &self.name_subs))
            .unwrap_or_default()
    }
}
