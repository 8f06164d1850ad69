// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use reniec_protocol::load::metrics::MetricsSnapshot;

/// Print the run summary, and write the per-kind CSV to `csv_path` if set.
pub fn publish(snapshot: &MetricsSnapshot, csv_path: Option<&Path>) -> io::Result<()> {
    println!("{snapshot}");
    if let Some(path) = csv_path {
        snapshot.write_csv(BufWriter::new(File::create(path)?))?;
        log::info!("[report] CSV written to {}", path.display());
    }
    Ok(())
}
