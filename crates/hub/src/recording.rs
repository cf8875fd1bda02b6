//! Appends labelled raw samples to a CSV file for offline classifier
//! training.  Toggled from the dashboard through `POST /api/record`.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::telemetry::Reading;

const CSV_HEADER: &str = "voltage,current,power,label\n";

#[derive(Debug, Clone)]
pub struct Recorder {
    path: PathBuf,
}

impl Recorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the file is new.
    pub async fn append(&self, reading: &Reading, label: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut out = String::new();
        if file.metadata().await?.len() == 0 {
            out.push_str(CSV_HEADER);
        }
        out.push_str(&csv_row(reading, label));
        file.write_all(out.as_bytes()).await?;
        file.flush().await
    }
}

fn csv_row(r: &Reading, label: &str) -> String {
    format!("{:.2},{:.3},{:.2},{label}\n", r.voltage, r.current, r.power)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Status;

    fn reading() -> Reading {
        Reading {
            timestamp: 0.0,
            voltage: 230.456,
            current: 0.15,
            power: 34.5,
            status: Status::Normal,
        }
    }

    #[test]
    fn row_format() {
        assert_eq!(csv_row(&reading(), "LEVEL_1"), "230.46,0.150,34.50,LEVEL_1\n");
    }

    #[tokio::test]
    async fn header_written_once() {
        let path = std::env::temp_dir().join(format!(
            "power-hub-recording-{}-{}.csv",
            std::process::id(),
            crate::telemetry::unix_now()
        ));
        let rec = Recorder::new(&path);
        rec.append(&reading(), "LEVEL_1").await.unwrap();
        rec.append(&reading(), "LEVEL_2").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            [
                "voltage,current,power,label",
                "230.46,0.150,34.50,LEVEL_1",
                "230.46,0.150,34.50,LEVEL_2"
            ]
        );
    }
}
