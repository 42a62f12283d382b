//! Run output: log backend, binary solution snapshots, the `.runinfo` summary,
//! CSV trajectories and the end-of-run statistics table.
use crate::numerical::stepper_config::LogSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use csv::Writer;
use nalgebra::DVector;
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tabled::builder::Builder;
use tabled::settings::Style;

pub const RUNINFO_FILE: &str = ".runinfo";

/// Console and/or file logging; a second initialization in the same process is ignored.
pub fn init_logger(settings: &LogSettings) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    if settings.console {
        loggers.push(TermLogger::new(
            settings.level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    if let Some(ref filename) = settings.file {
        let file = File::create(filename)?;
        loggers.push(WriteLogger::new(settings.level, Config::default(), file));
    }
    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }
    Ok(())
}

/// `path/NNNNNN`, the zero-padded record index
pub fn snapshot_path(path: &Path, index: usize) -> PathBuf {
    path.join(format!("{:06}", index))
}

/// Writes one record: f64 time, i64 length, then the values, all little-endian.
pub fn write_snapshot(path: &Path, index: usize, t: f64, y: &DVector<f64>) -> Result<()> {
    let file = File::create(snapshot_path(path, index))?;
    let mut out = BufWriter::new(file);
    out.write_all(&t.to_le_bytes())?;
    out.write_all(&(y.len() as i64).to_le_bytes())?;
    for v in y.iter() {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_snapshot(file: &Path) -> Result<(f64, DVector<f64>)> {
    let mut bytes = Vec::new();
    File::open(file)?.read_to_end(&mut bytes)?;
    let word = |i: usize| -> Result<[u8; 8]> {
        bytes
            .get(8 * i..8 * (i + 1))
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| StepperError::Parse(format!("truncated snapshot {}", file.display())))
    };
    let t = f64::from_le_bytes(word(0)?);
    let n = i64::from_le_bytes(word(1)?);
    if n < 0 || bytes.len() != 8 * (2 + n as usize) {
        return Err(StepperError::Parse(format!(
            "snapshot {} declares {} values in {} bytes",
            file.display(),
            n,
            bytes.len()
        )));
    }
    let values = (0..n as usize)
        .map(|i| word(i + 2).map(f64::from_le_bytes))
        .collect::<Result<Vec<f64>>>()?;
    Ok((t, DVector::from_vec(values)))
}

/// Snapshot files of a run directory in record order.
pub fn list_snapshots(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<(usize, PathBuf)> = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() == 6 {
            if let Ok(index) = name.parse::<usize>() {
                files.push((index, entry.path()));
            }
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// `key:value` lines, sorted by key
pub fn write_runinfo(path: &Path, info: &BTreeMap<String, String>) -> Result<()> {
    let mut file = BufWriter::new(File::create(path.join(RUNINFO_FILE))?);
    for (key, value) in info {
        writeln!(file, "{}:{}", key, value)?;
    }
    file.flush()?;
    Ok(())
}

pub fn read_runinfo(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path.join(RUNINFO_FILE))?;
    Ok(text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

/// Collects all snapshots of a run into one CSV table with a `t` column.
pub fn save_trajectory_csv(path: &Path, filename: &Path) -> Result<usize> {
    let snapshots = list_snapshots(path)?;
    let mut writer = Writer::from_path(filename).map_err(io::Error::from)?;
    let mut rows = 0;
    for (i, file) in snapshots.iter().enumerate() {
        let (t, y) = read_snapshot(file)?;
        if i == 0 {
            let mut headers = vec!["t".to_string()];
            headers.extend((0..y.len()).map(|j| format!("y{}", j)));
            writer.write_record(&headers).map_err(io::Error::from)?;
        }
        let mut row = vec![t.to_string()];
        row.extend(y.iter().map(|v| v.to_string()));
        writer.write_record(&row).map_err(io::Error::from)?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

pub fn summary_table(stats: &BTreeMap<String, String>) -> String {
    let mut builder = Builder::default();
    for (key, value) in stats {
        builder.push_record([key.as_str(), value.as_str()]);
    }
    let mut table = builder.build();
    table.with(Style::modern_rounded());
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_round_trip_is_bit_exact() {
        let dir = tempdir().unwrap();
        let y = DVector::from_vec(vec![1.0 / 3.0, -0.0, f64::MIN_POSITIVE, 1e300]);
        write_snapshot(dir.path(), 7, 0.125, &y).unwrap();
        let file = snapshot_path(dir.path(), 7);
        assert_eq!(file.file_name().unwrap(), "000007");
        assert_eq!(fs::metadata(&file).unwrap().len(), 8 * 6);
        let (t, back) = read_snapshot(&file).unwrap();
        assert_eq!(t.to_bits(), 0.125f64.to_bits());
        for (a, b) in y.iter().zip(back.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn truncated_snapshot_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("000000");
        fs::write(&file, [0u8; 12]).unwrap();
        assert!(matches!(read_snapshot(&file), Err(StepperError::Parse(_))));
    }

    #[test]
    fn snapshots_listed_in_order_and_exported() {
        let dir = tempdir().unwrap();
        for i in [2, 0, 1] {
            write_snapshot(dir.path(), i, i as f64, &DVector::from_element(2, i as f64)).unwrap();
        }
        let mut info = BTreeMap::new();
        info.insert("steps".to_string(), "2".to_string());
        write_runinfo(dir.path(), &info).unwrap();
        let files = list_snapshots(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("000000") && files[2].ends_with("000002"));
        let csv_file = dir.path().join("trajectory.csv");
        assert_eq!(save_trajectory_csv(dir.path(), &csv_file).unwrap(), 3);
        let text = fs::read_to_string(csv_file).unwrap();
        assert_eq!(text.lines().next().unwrap(), "t,y0,y1");
        assert_eq!(read_runinfo(dir.path()).unwrap(), info);
    }
}
