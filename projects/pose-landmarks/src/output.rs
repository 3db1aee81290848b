// Output artifact naming
//
// Each run writes a fresh `landmarks_<unix-millis>.csv` under the output root.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn output_file_name(created_at: DateTime<Utc>) -> String {
    format!("landmarks_{}.csv", created_at.timestamp_millis())
}

/// Picks a not-yet-existing output path stamped with the current time,
/// creating `output_root` if needed. The file itself is not created.
pub fn allocate_output_path(output_root: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(output_root)?;

    let mut created_at = Utc::now();
    loop {
        let path = output_root.join(output_file_name(created_at));
        if !path.exists() {
            return Ok(path);
        }
        created_at += chrono::Duration::milliseconds(1);
    }
}
