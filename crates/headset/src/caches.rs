//! Battery cache and annotation log.

use chrono::{DateTime, Utc};
use headproto::BatteryInfo;
use serde::Serialize;

/// Last battery status pushed by the device
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BatteryCache {
    latest: BatteryInfo,
    updates: u64,
}

impl BatteryCache {
    pub(crate) fn update(&mut self, info: BatteryInfo) {
        self.latest = info;
        self.updates += 1;
    }

    pub(crate) fn latest(&self) -> BatteryInfo {
        self.latest
    }

    pub(crate) fn has_report(&self) -> bool {
        self.updates > 0
    }
}

/// A timestamped marker added while streaming
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Default)]
pub(crate) struct AnnotationLog {
    entries: Vec<Annotation>,
}

impl AnnotationLog {
    pub(crate) fn push(&mut self, text: String) {
        self.entries.push(Annotation {
            timestamp: Utc::now(),
            text,
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<Annotation> {
        self.entries.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
