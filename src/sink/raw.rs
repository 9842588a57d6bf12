//! Raw JSON-lines event log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;

use super::{io_error, open_append, RecordContext, ResultSink, SensorEvent, SinkError};
use crate::probe::{AccessPoint, Measurement, ScanResult, TestResult, WifiSnapshot, WIFI_DATA_CODE};

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp: String,
    cycle: u64,
    sensor: &'a str,
    sensor_uid: &'a str,
    network: &'a str,
    network_alias: &'a str,
    interface_type: &'a str,
    test_type: &'a str,
    kind: &'a str,
    scope: &'a str,
    name: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(flatten)]
    measurement: Option<&'a Measurement>,
    #[serde(flatten)]
    link: Option<&'a WifiSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_points: Option<&'a [AccessPoint]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expired: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

pub struct RawEventLog {
    path: PathBuf,
    context: RecordContext,
    writer: Option<BufWriter<File>>,
}

impl RawEventLog {
    pub fn new(path: PathBuf, context: RecordContext) -> Self {
        Self {
            path,
            context,
            writer: None,
        }
    }

    fn test_lines<'a>(&'a self, result: &'a TestResult, link: &'a WifiSnapshot) -> [EventLine<'a>; 2] {
        let (scope, name) = match &result.service {
            Some(service) => (service.scope, service.name.as_str()),
            None => ("", ""),
        };
        let base = || EventLine {
            timestamp: result.timestamp.to_rfc3339(),
            cycle: result.cycle,
            sensor: &self.context.sensor_name,
            sensor_uid: &self.context.sensor_uid,
            network: &result.network.name,
            network_alias: &result.network.alias,
            interface_type: result.network.interface_type,
            test_type: result.kind.record_code(),
            kind: result.kind.as_str(),
            scope,
            name,
            target: "",
            success: None,
            measurement: None,
            link: None,
            access_points: None,
            expired: None,
            error: None,
        };

        let test = EventLine {
            target: &result.target,
            // success and error come from the flattened measurement
            measurement: Some(&result.measurement),
            ..base()
        };
        let wifi = EventLine {
            test_type: WIFI_DATA_CODE,
            kind: WIFI_DATA_CODE,
            link: Some(link),
            ..base()
        };
        [test, wifi]
    }

    fn scan_line<'a>(&'a self, scan: &'a ScanResult) -> EventLine<'a> {
        let kind = crate::probe::TestKind::WifiScan;
        EventLine {
            timestamp: scan.timestamp.to_rfc3339(),
            cycle: scan.cycle,
            sensor: &self.context.sensor_name,
            sensor_uid: &self.context.sensor_uid,
            network: &scan.network.name,
            network_alias: &scan.network.alias,
            interface_type: scan.network.interface_type,
            test_type: kind.record_code(),
            kind: kind.as_str(),
            scope: "",
            name: "",
            target: &scan.iface,
            success: Some(scan.error.is_none()),
            measurement: None,
            link: None,
            access_points: Some(&scan.access_points),
            expired: Some(scan.expired.len()),
            error: scan.error.as_deref(),
        }
    }

    fn write_lines(&mut self, lines: Vec<String>) -> Result<(), SinkError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => BufWriter::new(open_append(&self.path)?),
        };
        let writer = self.writer.insert(writer);
        for line in &lines {
            writeln!(writer, "{}", line).map_err(|e| io_error(&self.path, e))?;
        }
        writer.flush().map_err(|e| io_error(&self.path, e))
    }
}

impl ResultSink for RawEventLog {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn record(&mut self, event: &SensorEvent) -> Result<(), SinkError> {
        let lines = match event {
            SensorEvent::Test { result, link } => self
                .test_lines(result, link)
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?,
            SensorEvent::Scan(scan) => vec![serde_json::to_string(&self.scan_line(scan))?],
        };
        let outcome = self.write_lines(lines);
        if outcome.is_err() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::probe::NetworkRef;
    use crate::sink::testing::{context, icmp_event};
    use chrono::Local;
    use tempfile::TempDir;

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_two_lines_per_test() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("results.jsonl");
        let mut sink = RawEventLog::new(path.clone(), context());
        sink.record(&icmp_event()).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);

        let test = &lines[0];
        assert_eq!(test["test_type"], "ping");
        assert_eq!(test["kind"], "icmp");
        assert_eq!(test["scope"], "external");
        assert_eq!(test["name"], "Google");
        assert_eq!(test["target"], "google.com");
        assert_eq!(test["success"], true);
        assert_eq!(test["latency_ms"], 12.346);
        assert_eq!(test["cycle"], 7);
        assert_eq!(test["sensor"], "lab");
        assert!(test.get("rssi_dbm").is_none());

        let wifi = &lines[1];
        assert_eq!(wifi["test_type"], "wifi_data");
        assert_eq!(wifi["timestamp"], test["timestamp"]);
        assert_eq!(wifi["rssi_dbm"], -58);
        assert_eq!(wifi["bssid"], "aa:bb:cc:dd:ee:ff");
        assert!(wifi.get("success").is_none());
    }

    #[test]
    fn test_scan_line_carries_access_points() {
        let cfg = Config::from_yaml(crate::sink::testing::DOC).unwrap();
        let scan = ScanResult {
            timestamp: Local::now(),
            cycle: 2,
            network: NetworkRef::from(&cfg.networks[0]),
            iface: "wlan0".into(),
            access_points: vec![AccessPoint {
                bssid: "11:22:33:44:55:66".into(),
                ssid: "Guest".into(),
                rssi_dbm: -70.0,
                freq_mhz: Some(2437),
                band: Some("2.4"),
                channel: Some(6),
                width_mhz: 20,
            }],
            expired: Vec::new(),
            error: None,
        };

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut sink = RawEventLog::new(path.clone(), context());
        sink.record(&SensorEvent::Scan(scan)).unwrap();
        sink.flush().unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["kind"], "wifi_scan");
        assert_eq!(lines[0]["access_points"][0]["ssid"], "Guest");
        assert_eq!(lines[0]["expired"], 0);
    }
}
