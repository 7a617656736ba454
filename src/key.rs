//! Identity of one tracked counter instance.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::request::AddAndGetRequest;

/// Identifies one counter: a named limit on a resource, scoped by property
/// and by the start of the time bucket it counts in.
///
/// Equality and hashing cover `(resource, limit_name, property,
/// window_start)` only. `window_length` and `distributed` are carried
/// metadata: two keys naming the same bucket compare equal even if one came
/// from a legacy record that lost its window length.
#[derive(Debug, Clone)]
pub struct LimitKey {
    resource: String,
    limit_name: String,
    property: String,
    distributed: bool,
    window_start: DateTime<Utc>,
    window_length: Duration,
}

impl LimitKey {
    pub fn new(
        resource: impl Into<String>,
        limit_name: impl Into<String>,
        property: impl Into<String>,
        distributed: bool,
        window_start: DateTime<Utc>,
        window_length: Duration,
    ) -> Self {
        Self {
            resource: resource.into(),
            limit_name: limit_name.into(),
            property: property.into(),
            distributed,
            window_start,
            window_length,
        }
    }

    /// Key for the bucket a request's event falls in.
    pub fn from_request(request: &AddAndGetRequest) -> Self {
        Self::new(
            request.resource(),
            request.limit_name(),
            request.property(),
            request.is_distributed(),
            request.window_start(),
            request.window_length(),
        )
    }

    /// Key for the bucket immediately before the request's, used by the
    /// remote carry-over read.
    pub fn previous_from_request(request: &AddAndGetRequest) -> Self {
        Self::new(
            request.resource(),
            request.limit_name(),
            request.property(),
            request.is_distributed(),
            request.previous_window_start(),
            request.window_length(),
        )
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn limit_name(&self) -> &str {
        &self.limit_name
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    /// Grouping key identifying the counter series across buckets.
    ///
    /// The sliding store sums every bucket of one series over its horizon;
    /// that comparison must ignore `window_start`, so it goes through this
    /// explicit secondary key instead of `Eq`.
    pub fn series(&self) -> SeriesKey<'_> {
        SeriesKey { resource: &self.resource, limit_name: &self.limit_name, property: &self.property }
    }

    /// Same key, rebucketed. Used by the sliding store, whose cells live at
    /// slide granularity rather than at the request's window start.
    pub fn with_window_start(mut self, window_start: DateTime<Utc>) -> Self {
        self.window_start = window_start;
        self
    }
}

impl PartialEq for LimitKey {
    fn eq(&self, other: &Self) -> bool {
        self.resource == other.resource
            && self.limit_name == other.limit_name
            && self.property == other.property
            && self.window_start == other.window_start
    }
}

impl Eq for LimitKey {}

impl Hash for LimitKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource.hash(state);
        self.limit_name.hash(state);
        self.property.hash(state);
        self.window_start.hash(state);
    }
}

/// Borrowed `(resource, limit_name, property)` triple, the identity of a
/// counter series independent of bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesKey<'a> {
    pub resource: &'a str,
    pub limit_name: &'a str,
    pub property: &'a str,
}
