//! Structured append-only record file.
//!
//! Column order, test-type codes and number formatting match the record
//! export of the reference monitoring appliance so that existing import
//! tooling can consume the file unchanged. Every test writes two rows with
//! the same timestamp: the test row, then a `wifi_data` row carrying the
//! link snapshot.

use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, Local};

use super::{io_error, open_append, RecordContext, ResultSink, SensorEvent, SinkError};
use crate::probe::{TestResult, WifiSnapshot, WIFI_DATA_CODE};

pub const COLUMNS: [&str; 22] = [
    "timestamp",
    "sensor_uid",
    "sensor_name",
    "network_uid",
    "network_alias",
    "interface_type",
    "test_type_code",
    "target",
    "name",
    "ip_address",
    "elapsed_time_seconds",
    "bssid",
    "channel",
    "channel_utilization",
    "frequency",
    "rssi",
    "latency",
    "jitter",
    "packet_loss",
    "download_speed",
    "upload_speed",
    "service_uid",
];

const ELAPSED_DECIMALS: usize = 3;
const METRIC_DECIMALS: usize = 2;

/// Integral values print without decimals; others with `decimals` places,
/// trailing zeros trimmed. Missing or non-finite values print empty.
pub fn fmt_float(value: Option<f64>, decimals: usize) -> String {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return String::new();
    };
    if (value - value.round()).abs() < 1e-9 {
        return format!("{}", value.round() as i64);
    }
    let text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn fmt_timestamp(ts: &DateTime<Local>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// One CSV row, in [`COLUMNS`] order.
type Row = [String; 22];

fn base_row(context: &RecordContext, result: &TestResult, code: &str) -> Row {
    let (name, service_uid) = match &result.service {
        Some(service) => (service.name.clone(), service.uid.clone()),
        None => (String::new(), String::new()),
    };
    let mut row: Row = Default::default();
    row[0] = fmt_timestamp(&result.timestamp);
    row[1] = context.sensor_uid.clone();
    row[2] = context.sensor_name.clone();
    row[3] = result.network.uid.clone();
    row[4] = result.network.alias.clone();
    row[5] = result.network.interface_type.to_string();
    row[6] = code.to_string();
    row[8] = name;
    row[21] = service_uid;
    row
}

pub(crate) fn test_row(context: &RecordContext, result: &TestResult) -> Row {
    let m = &result.measurement;
    let mut row = base_row(context, result, result.kind.record_code());
    row[7] = result.target.clone();
    row[9] = m.ip_address.clone().unwrap_or_default();
    row[10] = fmt_float(m.elapsed_s, ELAPSED_DECIMALS);
    row[16] = fmt_float(m.latency_ms, METRIC_DECIMALS);
    row[17] = fmt_float(m.jitter_ms, METRIC_DECIMALS);
    row[18] = fmt_float(m.packet_loss_pct, METRIC_DECIMALS);
    row[19] = fmt_float(m.download_mbps, METRIC_DECIMALS);
    row[20] = fmt_float(m.upload_mbps, METRIC_DECIMALS);
    row
}

pub(crate) fn wifi_row(context: &RecordContext, result: &TestResult, link: &WifiSnapshot) -> Row {
    let mut row = base_row(context, result, WIFI_DATA_CODE);
    row[11] = link.bssid.clone().unwrap_or_default();
    row[12] = link.channel.map(|c| c.to_string()).unwrap_or_default();
    row[13] = fmt_float(link.channel_busy_pct.map(|p| p / 100.0), METRIC_DECIMALS);
    row[14] = link
        .freq_mhz
        .map(|mhz| (u64::from(mhz) * 1_000_000).to_string())
        .unwrap_or_default();
    row[15] = link.rssi_dbm.map(|r| r.to_string()).unwrap_or_default();
    row
}

pub struct StructuredRecordSink {
    path: PathBuf,
    context: RecordContext,
    writer: Option<csv::Writer<File>>,
}

impl StructuredRecordSink {
    pub fn new(path: PathBuf, context: RecordContext) -> Self {
        Self {
            path,
            context,
            writer: None,
        }
    }

    /// Open the file on first use, writing the header only into an empty file.
    fn writer(&mut self) -> Result<&mut csv::Writer<File>, SinkError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.open()?,
        };
        Ok(self.writer.insert(writer))
    }

    fn open(&self) -> Result<csv::Writer<File>, SinkError> {
        let file = open_append(&self.path)?;
        let empty = file.metadata().map_err(|e| io_error(&self.path, e))?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(COLUMNS)?;
            writer.flush().map_err(|e| io_error(&self.path, e))?;
        }
        tracing::info!("Structured records go to {}", self.path.display());
        Ok(writer)
    }

    fn write_pair(&mut self, result: &TestResult, link: &WifiSnapshot) -> Result<(), SinkError> {
        let test = test_row(&self.context, result);
        let wifi = wifi_row(&self.context, result, link);
        let path = self.path.clone();
        let writer = self.writer()?;
        writer.write_record(&test)?;
        writer.write_record(&wifi)?;
        writer.flush().map_err(|e| io_error(&path, e))
    }
}

impl ResultSink for StructuredRecordSink {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn record(&mut self, event: &SensorEvent) -> Result<(), SinkError> {
        let SensorEvent::Test { result, link } = event else {
            return Ok(());
        };
        let outcome = self.write_pair(result, link);
        if outcome.is_err() {
            // reopen on the next event
            self.writer = None;
        }
        outcome
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| io_error(&self.path, e))?;
        }
        Ok(())
    }
}
