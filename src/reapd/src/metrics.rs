//! Per-activation metrics, appended as CSV (§4.6, §10.4). Two header layouts exist
//! depending on whether the activation ran with a working-set file built ("trace-replay"
//! mode) or without one ("lazy" mode, every page served straight from the memory image).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use reap_engine::uffd::FaultMetrics;

const LAZY_HEADER: &str = "snapshot_id,instance_id,served,unique,latency_us_mean\n";
const TRACE_REPLAY_HEADER: &str = "snapshot_id,instance_id,served,reused,unique,latency_us_mean\n";

/// One row of per-activation metrics, written by [`append_row`] at deactivation.
#[derive(Debug, Clone)]
pub struct ActivationRow {
    pub snapshot_id: String,
    pub instance_id: String,
    pub metrics: FaultMetrics,
    pub mean_latency_us: f64,
    /// Whether this activation had a working-set file available (selects the header
    /// layout and whether `reused` is meaningful).
    pub trace_replay: bool,
}

/// Appends one row to the metrics CSV at `path`, writing the appropriate header first if
/// the file is empty (checked via `metadata().len() == 0`, matching the source's
/// header-once-if-file-empty convention).
pub fn append_row(path: &Path, row: &ActivationRow) -> std::io::Result<()> {
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    if needs_header {
        file.write_all(if row.trace_replay {
            TRACE_REPLAY_HEADER.as_bytes()
        } else {
            LAZY_HEADER.as_bytes()
        })?;
    }

    if row.trace_replay {
        writeln!(
            file,
            "{},{},{},{},{},{:.3}",
            row.snapshot_id,
            row.instance_id,
            row.metrics.served,
            row.metrics.reused,
            row.metrics.unique,
            row.mean_latency_us,
        )
    } else {
        writeln!(
            file,
            "{},{},{},{},{:.3}",
            row.snapshot_id, row.instance_id, row.metrics.served, row.metrics.unique, row.mean_latency_us,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn test_header_written_once() {
        let tmp = TempFile::new().unwrap();
        let row = ActivationRow {
            snapshot_id: "ss_test".into(),
            instance_id: "in_test".into(),
            metrics: FaultMetrics {
                served: 3,
                reused: 2,
                unique: 1,
            },
            mean_latency_us: 12.5,
            trace_replay: true,
        };
        append_row(tmp.as_path(), &row).unwrap();
        append_row(tmp.as_path(), &row).unwrap();

        let contents = std::fs::read_to_string(tmp.as_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRACE_REPLAY_HEADER.trim_end());
    }

    #[test]
    fn test_lazy_layout_omits_reused() {
        let tmp = TempFile::new().unwrap();
        let row = ActivationRow {
            snapshot_id: "ss_test".into(),
            instance_id: "in_test".into(),
            metrics: FaultMetrics {
                served: 3,
                reused: 0,
                unique: 3,
            },
            mean_latency_us: 4.0,
            trace_replay: false,
        };
        append_row(tmp.as_path(), &row).unwrap();
        let contents = std::fs::read_to_string(tmp.as_path()).unwrap();
        assert!(contents.starts_with(LAZY_HEADER));
    }
}
