//! Monitor configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::characteristics::ByteOrder;
use crate::ble::uuids::{ENVIRONMENTAL_SENSING_SERVICE_UUID, TARGET_LOCAL_NAME};

/// Default interval between rescan checks.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(20);

/// Settings for discovering and decoding the sensor peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Advertised local name to connect to (exact match).
    pub target_name: String,
    /// Service UUID to filter scans by, or `None` to scan for everything.
    pub service_filter: Option<Uuid>,
    /// How often the rescan guard runs.
    pub rescan_interval: Duration,
    /// Byte order used when decoding characteristic values.
    pub byte_order: ByteOrder,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_name: TARGET_LOCAL_NAME.to_string(),
            service_filter: Some(ENVIRONMENTAL_SENSING_SERVICE_UUID),
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            byte_order: ByteOrder::default(),
        }
    }
}

impl MonitorConfig {
    /// Set the advertised name to look for.
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = name.into();
        self
    }

    /// Set the scan service filter.
    pub fn with_service_filter(mut self, filter: Option<Uuid>) -> Self {
        self.service_filter = filter;
        self
    }

    /// Set the rescan interval.
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    /// Set the byte order used for decoding.
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.target_name, "shitmeter");
        assert_eq!(config.service_filter, Some(ENVIRONMENTAL_SENSING_SERVICE_UUID));
        assert_eq!(config.rescan_interval, Duration::from_secs(20));
        assert_eq!(config.byte_order, ByteOrder::LittleEndian);
    }

    #[test]
    fn test_builders() {
        let config = MonitorConfig::default()
            .with_target_name("bench")
            .with_service_filter(None)
            .with_rescan_interval(Duration::from_secs(5))
            .with_byte_order(ByteOrder::BigEndian);
        assert_eq!(config.target_name, "bench");
        assert_eq!(config.service_filter, None);
        assert_eq!(config.rescan_interval, Duration::from_secs(5));
        assert_eq!(config.byte_order, ByteOrder::BigEndian);
    }
}
