//! Pre-flight checks run before any parsing or database work.
//!
//! [`validate_structure`] looks at the first three lines of an export only:
//! a metadata banner, a header line carrying the rank and keyword column
//! names, and a first data row with enough fields. Once a file passes, the
//! rest of the pipeline trusts its shape.
//!
//! Exports come in a localized (Chinese) and an English flavour, so each
//! marker lists both spellings.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

const BANNER_MARKERS: &[&str] = &["报告范围", "Reporting Range"];
const RANK_MARKERS: &[&str] = &["搜索频率排名", "Search Frequency Rank"];
const KEYWORD_MARKERS: &[&str] = &["搜索词", "Search Term"];
const SELECTED_DATE_MARKERS: &[&str] = &["选择日期", "Select Date"];

/// Result of the structure check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub message: String,
}

impl Validation {
    fn pass() -> Self {
        Self {
            ok: true,
            message: "File structure is valid".to_string(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Values parsed out of the banner line, used for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BannerMetadata {
    pub report_range: Option<String>,
    pub selected_date: Option<String>,
}

/// Read up to `n` lines without pulling the rest of the file into memory.
fn head_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::with_capacity(n);
    let mut buf = Vec::new();

    while lines.len() < n {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']).trim_start_matches('\u{feff}');
        lines.push(line.to_string());
    }

    Ok(lines)
}

fn contains_any(line: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| line.contains(m))
}

/// Count comma-separated fields, honouring quotes.
fn field_count(line: &str) -> usize {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => record.len(),
        _ => 0,
    }
}

/// Check the banner/header/data layout of an export.
pub fn validate_structure(path: &Path, min_fields: usize) -> Validation {
    let lines = match head_lines(path, 3) {
        Ok(lines) => lines,
        Err(e) => return Validation::fail(format!("File validation failed: {:#}", e)),
    };

    if lines.len() < 3 {
        return Validation::fail(
            "File needs at least 3 lines (metadata banner, header, data)",
        );
    }

    if !contains_any(&lines[0], BANNER_MARKERS) {
        return Validation::fail("Line 1 must contain the report range metadata banner");
    }

    if !contains_any(&lines[1], RANK_MARKERS) || !contains_any(&lines[1], KEYWORD_MARKERS) {
        return Validation::fail("Line 2 must be a header with the rank and keyword columns");
    }

    let data = lines[2].trim();
    if data.is_empty() || field_count(data) < min_fields {
        return Validation::fail(format!(
            "Line 3 must be a data row with at least {} fields",
            min_fields
        ));
    }

    Validation::pass()
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{4})[_-](\d{2})[_-](\d{2})").expect("date pattern is a valid regex")
    })
}

/// Extract the report date from an uploaded file's original name.
///
/// Accepts `YYYY-MM-DD` and `YYYY_MM_DD`. The first match that is a real
/// calendar date wins.
pub fn extract_report_date(filename: &str) -> Option<NaiveDate> {
    date_pattern().captures_iter(filename).find_map(|caps| {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

fn banner_value(line: &str, markers: &[&str]) -> Option<String> {
    markers.iter().find_map(|marker| {
        let rest = line.split(&format!("{}=", marker)).nth(1)?;
        let value = rest.split(',').next()?.trim_matches(|c: char| c == '[' || c == ']' || c == '"');
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

/// Parse `report range` and `selected date` out of the banner line.
pub fn read_banner_metadata(path: &Path) -> Result<BannerMetadata> {
    let lines = head_lines(path, 1)?;
    let Some(first) = lines.first() else {
        return Ok(BannerMetadata::default());
    };

    Ok(BannerMetadata {
        report_range: banner_value(first, BANNER_MARKERS),
        selected_date: banner_value(first, SELECTED_DATE_MARKERS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const BANNER: &str = "报告范围=[\"每日\"],选择日期=[\"2024-01-01\"]";
    const HEADER: &str = "搜索频率排名,搜索词,品牌 #1,品牌 #2,品牌 #3";

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn accepts_well_formed_export() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "a.csv",
            &format!("{}\n{}\n1,shoes,Nike,Adidas,Puma\n", BANNER, HEADER),
        );
        let v = validate_structure(&path, 3);
        assert!(v.ok, "{}", v.message);
    }

    #[test]
    fn accepts_english_markers() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "a.csv",
            "Reporting Range=[\"Daily\"]\nSearch Frequency Rank,Search Term,Brand\n1,shoes,Nike\n",
        );
        assert!(validate_structure(&path, 3).ok);
    }

    #[test]
    fn rejects_short_file() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.csv", &format!("{}\n{}\n", BANNER, HEADER));
        let v = validate_structure(&path, 3);
        assert!(!v.ok);
        assert!(v.message.contains("3 lines"));
    }

    #[test]
    fn rejects_missing_banner() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.csv", &format!("hello\n{}\n1,a,b\n", HEADER));
        let v = validate_structure(&path, 3);
        assert!(!v.ok);
        assert!(v.message.contains("Line 1"));
    }

    #[test]
    fn rejects_header_without_keyword_column() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.csv", &format!("{}\n搜索频率排名,品牌\n1,a,b\n", BANNER));
        let v = validate_structure(&path, 3);
        assert!(!v.ok);
        assert!(v.message.contains("Line 2"));
    }

    #[test]
    fn rejects_thin_data_row() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.csv", &format!("{}\n{}\n1,a\n", BANNER, HEADER));
        assert!(!validate_structure(&path, 3).ok);
    }

    #[test]
    fn quoted_commas_do_not_inflate_field_count() {
        assert_eq!(field_count("1,\"a,b,c\""), 2);
    }

    #[test]
    fn missing_file_fails_validation() {
        let v = validate_structure(Path::new("/nonexistent/x.csv"), 3);
        assert!(!v.ok);
    }

    #[test]
    fn extracts_dates_from_filenames() {
        assert_eq!(
            extract_report_date("US_Top_Search_Terms_Simple_Day_2024_01_02.csv"),
            NaiveDate::from_ymd_opt(2024, 1, 2)
        );
        assert_eq!(
            extract_report_date("weekly-2023-12-31.csv"),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(extract_report_date("no_date_here.csv"), None);
        assert_eq!(extract_report_date("bad_2024_13_45.csv"), None);
    }

    #[test]
    fn reads_banner_values() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.csv", &format!("{}\n{}\n1,a,b\n", BANNER, HEADER));
        let meta = read_banner_metadata(&path).unwrap();
        assert_eq!(meta.report_range.as_deref(), Some("每日"));
        assert_eq!(meta.selected_date.as_deref(), Some("2024-01-01"));
    }
}
