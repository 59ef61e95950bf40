//! Event types ingested by the service
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Analytics event payload, one JSON object per row
pub type Event = serde_json::Value;

/// Default batching of one event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDefaults {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Events,
    Errors,
    WebVitals,
    CustomEvents,
    OutgoingLinks,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Events,
        EventKind::Errors,
        EventKind::WebVitals,
        EventKind::CustomEvents,
        EventKind::OutgoingLinks,
    ];

    /// name of the queue the producers publish into
    pub fn queue_name(self) -> &'static str {
        match self {
            EventKind::Events => "Events",
            EventKind::Errors => "Errors",
            EventKind::WebVitals => "WebVitals",
            EventKind::CustomEvents => "CustomEvents",
            EventKind::OutgoingLinks => "OutgoingLinks",
        }
    }

    /// key of the event type in the `workers` config section
    pub fn key(self) -> &'static str {
        match self {
            EventKind::Events => "events",
            EventKind::Errors => "errors",
            EventKind::WebVitals => "web_vitals",
            EventKind::CustomEvents => "custom_events",
            EventKind::OutgoingLinks => "outgoing_links",
        }
    }

    /// ClickHouse table receiving the batches
    pub fn table(self) -> &'static str {
        match self {
            EventKind::Events => "analytics.events",
            EventKind::Errors => "analytics.errors",
            EventKind::WebVitals => "analytics.web_vitals",
            EventKind::CustomEvents => "analytics.custom_events",
            EventKind::OutgoingLinks => "analytics.outgoing_links",
        }
    }

    /// human readable name used in log records
    pub fn label(self) -> &'static str {
        match self {
            EventKind::Events => "event",
            EventKind::Errors => "error",
            EventKind::WebVitals => "web vitals",
            EventKind::CustomEvents => "custom event",
            EventKind::OutgoingLinks => "outgoing link",
        }
    }

    pub fn defaults(self) -> BatchDefaults {
        match self {
            // page views dominate the traffic
            EventKind::Events => BatchDefaults {
                batch_size: 2000,
                flush_interval: Duration::from_millis(5000),
                concurrency: 2,
            },
            _ => BatchDefaults {
                batch_size: 500,
                flush_interval: Duration::from_millis(3000),
                concurrency: 2,
            },
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}
