//! Configuration for stream processors and exporter directors.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`TypedStreamProcessor`](crate::TypedStreamProcessor).
///
/// All fields have defaults via [`EngineConfig::default()`]. Pass to
/// [`StreamProcessorBuilder::config`](crate::StreamProcessorBuilder::config).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use logfold::EngineConfig;
///
/// let config = EngineConfig {
///     partition_id: 3,
///     snapshot_period: Some(Duration::from_secs(60)),
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.producer_id, 0);
/// assert!(!config.multi_tenancy_enabled);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Partition the processor owns. Keys allocated by processors embed it.
    ///
    /// Default: 1.
    pub partition_id: i32,

    /// Producer id written into every record the processor appends.
    ///
    /// Default: 0.
    pub producer_id: i32,

    /// Whether processors must enforce tenant boundaries. Exposed to
    /// processors through the processing context.
    ///
    /// Default: `false`.
    pub multi_tenancy_enabled: bool,

    /// Directory for snapshot artifacts. `None` disables snapshots: every
    /// open replays the log from the start.
    ///
    /// Default: `None`.
    pub snapshot_dir: Option<PathBuf>,

    /// How often to take a snapshot while processing. `None` means snapshots
    /// are only taken on request and on close.
    ///
    /// Default: 5 minutes.
    pub snapshot_period: Option<Duration>,

    /// How many snapshots to keep on disk after taking a new one.
    ///
    /// Default: 2.
    pub snapshots_to_keep: usize,

    /// Delay before retrying a rejected follow-up write or a side-effect hook
    /// that reported failure.
    ///
    /// Default: 100 milliseconds.
    pub retry_delay: Duration,

    /// Upper bound for draining in-flight asynchronous sub-tasks on close.
    ///
    /// Default: 10 seconds.
    pub close_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            producer_id: 0,
            multi_tenancy_enabled: false,
            snapshot_dir: None,
            snapshot_period: Some(Duration::from_secs(300)),
            snapshots_to_keep: 2,
            retry_delay: Duration::from_millis(100),
            close_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for an [`ExporterDirector`](crate::ExporterDirector).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use logfold::ExporterDirectorConfig;
///
/// let config = ExporterDirectorConfig {
///     retry_interval: Duration::from_millis(250),
///     ..ExporterDirectorConfig::default()
/// };
/// assert_eq!(config.batch_size, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ExporterDirectorConfig {
    /// How long to wait before handing a failed record to the same exporter
    /// again, or before re-opening an exporter whose `open` failed. Retries
    /// are unbounded.
    ///
    /// Default: 1 second.
    pub retry_interval: Duration,

    /// How often exporter positions are flushed to the position store file.
    /// Positions are also flushed on close.
    ///
    /// Default: 5 seconds.
    pub flush_interval: Duration,

    /// Records handed to one exporter before the director moves on to the
    /// next exporter.
    ///
    /// Default: 64.
    pub batch_size: usize,
}

impl Default for ExporterDirectorConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(5),
            batch_size: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.partition_id, 1);
        assert!(config.snapshot_dir.is_none());
        assert_eq!(config.snapshot_period, Some(Duration::from_secs(300)));
        assert_eq!(config.close_timeout, Duration::from_secs(10));
    }

    #[test]
    fn director_defaults() {
        let config = ExporterDirectorConfig::default();
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 64);
    }
}
