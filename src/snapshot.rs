use anyhow::Context;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::calc::{Remark, SheetModel};

const SNAPSHOT_DIR: &str = "submissions";

#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub path: PathBuf,
    pub sha256: String,
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn fmt_percent(v: Option<f64>) -> String {
    match v {
        Some(p) => format!("{:.1}", p),
        None => String::new(),
    }
}

fn remark_label(remark: Remark) -> &'static str {
    match remark {
        Remark::Passed => "Passed",
        Remark::Failed => "Failed",
        Remark::Incomplete => "Incomplete",
        Remark::Conditional => "Conditional",
    }
}

fn safe_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Renders the finalized sheet to a CSV under `<workspace>/submissions/` and
/// returns the file's digest. Best-effort from the caller's point of view:
/// a failure here never rolls back the submission itself.
pub fn write_submission_snapshot(
    workspace: &Path,
    course_code: &str,
    term_id: &str,
    sheet: &SheetModel,
) -> anyhow::Result<SnapshotSummary> {
    let dir = workspace.join(SNAPSHOT_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.to_string_lossy()))?;

    let mut body = String::new();
    body.push_str("student,prelim,midterm,finals,tentative,lee,remark\n");
    for row in &sheet.rows {
        if !row.active {
            continue;
        }
        body.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&row.display_name),
            fmt_percent(row.prelim),
            fmt_percent(row.midterm),
            fmt_percent(row.finals),
            format!("{:.1}", row.tentative),
            row.lee.map(|l| format!("{:.2}", l)).unwrap_or_default(),
            remark_label(row.remark),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let sha256 = format!("{:x}", hasher.finalize());

    let path = dir.join(format!(
        "{}-{}.csv",
        safe_file_stem(course_code),
        safe_file_stem(term_id)
    ));
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create snapshot {}", path.to_string_lossy()))?;
    file.write_all(body.as_bytes())
        .with_context(|| format!("failed to write snapshot {}", path.to_string_lossy()))?;

    Ok(SnapshotSummary { path, sha256 })
}
