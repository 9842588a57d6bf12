//! Result sinks.
//!
//! Every test result is fanned out, in production order, to each sink. A
//! sink failing never stops the cycle; the engine logs the error and keeps
//! calling the sink on later events.

mod raw;
mod structured;

pub use raw::RawEventLog;
pub use structured::StructuredRecordSink;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::probe::{ScanResult, TestResult, WifiSnapshot};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One event produced by the engine.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// An elementary test and the link snapshot taken right after it.
    Test {
        result: TestResult,
        link: WifiSnapshot,
    },
    Scan(ScanResult),
}

/// Sensor identity stamped on every record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContext {
    pub sensor_uid: String,
    pub sensor_name: String,
}

impl From<&Config> for RecordContext {
    fn from(config: &Config) -> Self {
        Self {
            sensor_uid: config.sensor_id.clone(),
            sensor_name: config.sensor_name.clone(),
        }
    }
}

pub trait ResultSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn record(&mut self, event: &SensorEvent) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Sinks enabled by `config`, in fan-out order.
pub fn build_sinks(config: &Config) -> Vec<Box<dyn ResultSink>> {
    let context = RecordContext::from(config);
    let mut sinks: Vec<Box<dyn ResultSink>> = Vec::new();
    if config.structured_export_enabled {
        sinks.push(Box::new(StructuredRecordSink::new(
            config.structured_export_path.clone(),
            context.clone(),
        )));
    }
    sinks.push(Box::new(RawEventLog::new(config.log_path.clone(), context)));
    sinks
}

fn io_error(path: &std::path::Path, source: io::Error) -> SinkError {
    SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Open `path` for appending, creating parent directories first.
fn open_append(path: &std::path::Path) -> Result<std::fs::File, SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(path, e))
}
