//! JSON report persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use parking_lot::Mutex;
use serde::Serialize;

use crate::device::{unix_now, DeviceSnapshot};

pub const SUMMARY_FILE: &str = "_summary.json";

/// Destination for finished device reports.
pub trait ReportSink: Send + Sync {
    /// Persist one device report, returning where it went.
    fn store(&self, snapshot: &DeviceSnapshot) -> Result<PathBuf>;
    /// Persist the aggregate of every report stored during a session.
    fn write_summary(&self, reports: &[DeviceSnapshot]) -> Result<PathBuf>;
}

/// One pretty-printed JSON file per device plus `_summary.json`.
///
/// Files are named `<UID>.json`. Devices without a firmware UID get the first
/// free `DEFECT-NNNNN.json` and keep it for the rest of the session.
pub struct JsonReportWriter {
    dir: PathBuf,
    assigned: Mutex<HashMap<String, PathBuf>>,
}

#[derive(Serialize)]
struct Summary<'a> {
    generated: f64,
    count: usize,
    passed: usize,
    devices: &'a [DeviceSnapshot],
}

impl JsonReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, snapshot: &DeviceSnapshot) -> PathBuf {
        if let Some(uid) = snapshot.firmware_uid() {
            return self.dir.join(format!("{uid}.json"));
        }
        let mut assigned = self.assigned.lock();
        if let Some(path) = assigned.get(&snapshot.uid) {
            return path.clone();
        }
        let taken: Vec<&PathBuf> = assigned.values().collect();
        let path = (1..)
            .map(|i| self.dir.join(format!("DEFECT-{i:05}.json")))
            .find(|p| !p.exists() && !taken.contains(&p))
            .unwrap_or_else(|| self.dir.join("DEFECT.json"));
        assigned.insert(snapshot.uid.clone(), path.clone());
        path
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating report directory {}", self.dir.display()))?;
        let text = serde_json::to_string_pretty(value).context("serializing report")?;
        fs::write(path, text).with_context(|| format!("writing {}", path.display()))
    }
}

impl ReportSink for JsonReportWriter {
    fn store(&self, snapshot: &DeviceSnapshot) -> Result<PathBuf> {
        let path = self.path_for(snapshot);
        self.write_json(&path, snapshot)?;
        info!("{}: report written to {}", snapshot.uid, path.display());
        Ok(path)
    }

    fn write_summary(&self, reports: &[DeviceSnapshot]) -> Result<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        let summary = Summary {
            generated: unix_now(),
            count: reports.len(),
            passed: reports.iter().filter(|r| r.ok == Some(true)).count(),
            devices: reports,
        };
        self.write_json(&path, &summary)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::device::{DeviceContext, PollSettings};
    use crate::profile::ProfileSet;
    use crate::scheduler::Mode;

    fn snapshot(port: &str, uid: &str) -> DeviceSnapshot {
        let settings = PollSettings {
            profile: Arc::new(ProfileSet::builtin().get("usb_stand").unwrap()),
            mode: Mode::Normal,
            duration: Duration::ZERO,
            timeout: Duration::from_millis(10),
            retries: 0,
        };
        DeviceContext::new(port, uid.into(), settings).snapshot()
    }

    #[test]
    fn names_by_firmware_uid() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonReportWriter::new(dir.path().join("out"));
        let mut snap = snapshot("/dev/ttyACM0", "ABCDEF");
        snap.meta.uid = Some("ABCDEF".into());
        let path = writer.store(&snap).unwrap();
        assert_eq!(path.file_name().unwrap(), "ABCDEF.json");
        let text = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["uid"], "ABCDEF");
    }

    #[test]
    fn defect_names_are_sequential_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonReportWriter::new(dir.path());
        let a = snapshot("/dev/ttyACM0", "FC-ttyACM0");
        let b = snapshot("/dev/ttyACM1", "FC-ttyACM1");
        let pa = writer.store(&a).unwrap();
        let pb = writer.store(&b).unwrap();
        assert_eq!(pa.file_name().unwrap(), "DEFECT-00001.json");
        assert_eq!(pb.file_name().unwrap(), "DEFECT-00002.json");
        assert_eq!(writer.store(&a).unwrap(), pa);
    }

    #[test]
    fn defect_index_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("DEFECT-00001.json"), "{}").unwrap();
        let writer = JsonReportWriter::new(dir.path());
        let path = writer.store(&snapshot("p", "FC-p")).unwrap();
        assert_eq!(path.file_name().unwrap(), "DEFECT-00002.json");
    }

    #[test]
    fn summary_lists_devices() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonReportWriter::new(dir.path());
        let mut ok = snapshot("a", "A");
        ok.ok = Some(true);
        let failed = snapshot("b", "B");
        let path = writer.write_summary(&[ok, failed]).unwrap();
        assert_eq!(path.file_name().unwrap(), SUMMARY_FILE);
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["count"], 2);
        assert_eq!(value["passed"], 1);
        assert_eq!(value["devices"][1]["uid"], "B");
    }
}
