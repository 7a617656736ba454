//! The one call shape every storage backend consumes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::window;

/// Everything a backend needs to add `cost` to one counter and report the
/// post-increment total.
///
/// The window start is derived from the event timestamp when the request is
/// built; callers never supply it directly.
#[derive(Debug, Clone, PartialEq)]
pub struct AddAndGetRequest {
    resource: String,
    limit_name: String,
    property: String,
    window_length: Duration,
    event_timestamp: DateTime<Utc>,
    cost: i64,
    distributed: bool,
    capacity: i64,
    window_start: DateTime<Utc>,
}

impl AddAndGetRequest {
    pub fn builder(
        resource: impl Into<String>,
        limit_name: impl Into<String>,
        property: impl Into<String>,
    ) -> AddAndGetRequestBuilder {
        AddAndGetRequestBuilder {
            resource: resource.into(),
            limit_name: limit_name.into(),
            property: property.into(),
            window_length: Duration::ZERO,
            event_timestamp: None,
            cost: 1,
            distributed: false,
            capacity: 0,
        }
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

    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    pub fn event_timestamp(&self) -> DateTime<Utc> {
        self.event_timestamp
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// Capacity of the limit, consulted only by the remote carry-over mode.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Start of the bucket immediately before this request's.
    pub fn previous_window_start(&self) -> DateTime<Utc> {
        self.window_start - window::chrono_duration(self.window_length)
    }

    /// Fraction of the previous bucket still inside the sliding horizon
    /// `(event − window_length, event]`, in `(0, 1]`.
    pub fn previous_bucket_weight(&self) -> f64 {
        let length = self.window_length.as_secs_f64();
        if length <= 0.0 {
            return 1.0;
        }
        let elapsed = (self.event_timestamp - self.window_start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        (1.0 - elapsed / length).clamp(0.0, 1.0)
    }
}

/// Builder for [`AddAndGetRequest`].
///
/// `window_length` should always be set; without it every event becomes its
/// own zero-length bucket. The event timestamp defaults to the wall clock at
/// build time.
#[derive(Debug, Clone)]
pub struct AddAndGetRequestBuilder {
    resource: String,
    limit_name: String,
    property: String,
    window_length: Duration,
    event_timestamp: Option<DateTime<Utc>>,
    cost: i64,
    distributed: bool,
    capacity: i64,
}

impl AddAndGetRequestBuilder {
    pub fn window_length(mut self, window_length: Duration) -> Self {
        self.window_length = window_length;
        self
    }

    pub fn event_timestamp(mut self, event_timestamp: DateTime<Utc>) -> Self {
        self.event_timestamp = Some(event_timestamp);
        self
    }

    pub fn cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }

    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn build(self) -> AddAndGetRequest {
        let event_timestamp = self.event_timestamp.unwrap_or_else(Utc::now);
        let window_start = window::window_start(event_timestamp, self.window_length);
        AddAndGetRequest {
            resource: self.resource,
            limit_name: self.limit_name,
            property: self.property,
            window_length: self.window_length,
            event_timestamp,
            cost: self.cost,
            distributed: self.distributed,
            capacity: self.capacity,
            window_start,
        }
    }
}
