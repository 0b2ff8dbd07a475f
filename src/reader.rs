//! Streaming row-batch reader for ranking exports.
//!
//! [`ChunkReader`] skips the banner and header lines, then yields cleaned
//! [`SearchRow`] batches of at most `batch_size` rows. Only one batch is held
//! in memory at a time. Columns are mapped by position:
//!
//! | idx   | field                                              |
//! |-------|----------------------------------------------------|
//! | 0     | rank                                               |
//! | 1     | keyword                                            |
//! | 2..=4 | brand #1..#3                                       |
//! | 5..=7 | category #1..#3                                    |
//! | 8..=19| product #1..#3: ASIN, title, click, conversion     |
//! | 20    | report date                                        |
//!
//! [`spawn_reader`] moves the blocking file I/O onto a dedicated thread and
//! hands batches to async code through a bounded channel.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::ByteRecord;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{ProductSlot, SearchRow};

/// Lines preceding the data: metadata banner and header.
pub const HEADER_LINES: usize = 2;

const COL_RANK: usize = 0;
const COL_KEYWORD: usize = 1;
const COL_BRAND: usize = 2;
const COL_CATEGORY: usize = 5;
const COL_PRODUCTS: usize = 8;
const PRODUCT_WIDTH: usize = 4;
const COL_REPORT_DATE: usize = 20;

const ESTIMATE_SAMPLE_BYTES: u64 = 64 * 1024;

/// Lazy, non-restartable sequence of cleaned row batches.
pub struct ChunkReader {
    records: csv::ByteRecordsIntoIter<BufReader<File>>,
    batch_size: usize,
    finished: bool,
    skipped: u64,
}

impl ChunkReader {
    pub fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut discard = Vec::new();
        for _ in 0..HEADER_LINES {
            discard.clear();
            reader.read_until(b'\n', &mut discard)?;
        }

        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_byte_records();

        Ok(Self {
            records,
            batch_size: batch_size.max(1),
            finished: false,
            skipped: 0,
        })
    }

    /// Rows dropped so far (empty keyword or unreadable rank).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Vec<SearchRow>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.records.next() {
                Some(Ok(record)) => match clean_record(&record) {
                    Some(row) => batch.push(row),
                    None => self.skipped += 1,
                },
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(anyhow::Error::new(e).context("Failed to read CSV row")));
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

fn field(record: &ByteRecord, idx: usize) -> String {
    record
        .get(idx)
        .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
        .unwrap_or_default()
}

fn strip_number(raw: &str) -> String {
    raw.trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse a rank, tolerating thousands separators and `12.0` spellings.
pub(crate) fn parse_rank(raw: &str) -> Option<i64> {
    let cleaned = strip_number(raw);
    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(n);
    }
    match cleaned.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

/// Parse a share value; anything unreadable becomes 0.
pub(crate) fn parse_share(raw: &str) -> f64 {
    strip_number(raw)
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .unwrap_or(0.0)
}

fn clean_record(record: &ByteRecord) -> Option<SearchRow> {
    let line = record
        .position()
        .map(|p| p.line() + HEADER_LINES as u64)
        .unwrap_or(0);

    let keyword = field(record, COL_KEYWORD);
    if keyword.is_empty() {
        warn!(line, "Skipping row with empty keyword");
        return None;
    }

    let rank_raw = field(record, COL_RANK);
    let Some(rank) = parse_rank(&rank_raw) else {
        warn!(line, keyword = %keyword, rank = %rank_raw, "Skipping row with unreadable rank");
        return None;
    };

    let products = std::array::from_fn(|slot| {
        let base = COL_PRODUCTS + slot * PRODUCT_WIDTH;
        ProductSlot {
            brand: field(record, COL_BRAND + slot),
            category: field(record, COL_CATEGORY + slot),
            asin: field(record, base),
            title: field(record, base + 1),
            click_share: parse_share(&field(record, base + 2)),
            conversion_share: parse_share(&field(record, base + 3)),
        }
    });

    Some(SearchRow {
        rank,
        keyword,
        products,
        report_date: field(record, COL_REPORT_DATE),
    })
}

/// Parse the report-date column. Accepts the separators file names use.
pub fn parse_row_date(raw: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%Y/%m/%d", "%Y_%m_%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw.trim(), fmt).ok())
}

/// Rows whose own report date disagrees with `expected`. Rows with an
/// empty or unparseable date are not counted.
pub fn count_date_mismatches(rows: &[SearchRow], expected: NaiveDate) -> usize {
    rows.iter()
        .filter(|row| parse_row_date(&row.report_date).is_some_and(|d| d != expected))
        .count()
}

/// Run a [`ChunkReader`] on a blocking thread, delivering batches over a
/// channel with room for two in-flight batches.
pub fn spawn_reader(
    path: PathBuf,
    batch_size: usize,
) -> (mpsc::Receiver<Result<Vec<SearchRow>>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(2);

    let handle = tokio::task::spawn_blocking(move || {
        let mut reader = match ChunkReader::open(&path, batch_size) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        for batch in reader.by_ref() {
            if tx.blocking_send(batch).is_err() {
                debug!("Batch receiver dropped; stopping reader");
                return;
            }
        }

        if reader.skipped() > 0 {
            warn!(
                path = %path.display(),
                skipped = reader.skipped(),
                "Rows skipped during cleaning"
            );
        }
    });

    (rx, handle)
}

/// Estimate the number of data rows without reading the whole file.
///
/// Exact when the file fits in the sample; otherwise extrapolated from
/// the average line length of the first 64 KiB.
pub fn estimate_records(path: &Path) -> Result<u64> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();

    let mut sample = Vec::new();
    File::open(path)?
        .take(ESTIMATE_SAMPLE_BYTES)
        .read_to_end(&mut sample)?;

    let newlines = sample.iter().filter(|b| **b == b'\n').count() as u64;
    let lines = if sample.len() as u64 >= size {
        let trailing = match sample.last() {
            Some(b'\n') | None => 0,
            Some(_) => 1,
        };
        newlines + trailing
    } else if newlines == 0 {
        1
    } else {
        let avg = sample.len() as f64 / newlines as f64;
        (size as f64 / avg).round() as u64
    };

    Ok(lines.saturating_sub(HEADER_LINES as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const PREAMBLE: &str = "报告范围=[\"每日\"]\n搜索频率排名,搜索词,品牌 #1\n";

    fn full_row(rank: &str, keyword: &str) -> String {
        format!(
            "{},{},BrandA,BrandB,BrandC,CatA,CatB,CatC,\
             B001,\"Title, with comma\",12.5%,3.1%,\
             B002,Second,\"1,234\",oops,\
             B003,Third,0.5,0.25,2024-01-01",
            rank, keyword
        )
    }

    fn write_csv(rows: &[String]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.csv");
        let mut content = PREAMBLE.to_string();
        for row in rows {
            content.push_str(row);
            content.push('\n');
        }
        fs::write(&path, content).unwrap();
        (tmp, path)
    }

    #[test]
    fn maps_positional_columns() {
        let (_tmp, path) = write_csv(&[full_row("1", " shoes ")]);
        let mut reader = ChunkReader::open(&path, 10).unwrap();
        let batch = reader.next().unwrap().unwrap();
        assert_eq!(batch.len(), 1);

        let row = &batch[0];
        assert_eq!(row.rank, 1);
        assert_eq!(row.keyword, "shoes");
        assert_eq!(row.products[0].brand, "BrandA");
        assert_eq!(row.products[2].category, "CatC");
        assert_eq!(row.products[0].title, "Title, with comma");
        assert_eq!(row.products[0].click_share, 12.5);
        assert_eq!(row.products[1].click_share, 1234.0);
        assert_eq!(row.products[1].conversion_share, 0.0);
        assert_eq!(row.products[2].asin, "B003");
        assert_eq!(row.report_date, "2024-01-01");
        assert!(reader.next().is_none());
    }

    #[test]
    fn row_dates_are_compared_with_the_file_date() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(parse_row_date("2024/01/01"), Some(expected));
        assert_eq!(parse_row_date(" 2024_01_01 "), Some(expected));
        assert_eq!(parse_row_date("01/01/2024"), None);

        let (_tmp, path) = write_csv(&[
            full_row("1", "a"),
            full_row("2", "b").replace("2024-01-01", "2024-01-02"),
            "3,c".to_string(),
            full_row("4", "d").replace("2024-01-01", "garbage"),
        ]);
        let batch = ChunkReader::open(&path, 10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(count_date_mismatches(&batch, expected), 1);
        assert_eq!(
            count_date_mismatches(&batch, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            1
        );
    }

    #[test]
    fn short_rows_are_padded() {
        let (_tmp, path) = write_csv(&["7,boots,OnlyBrand".to_string()]);
        let batch = ChunkReader::open(&path, 10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch[0].products[0].brand, "OnlyBrand");
        assert_eq!(batch[0].products[1].brand, "");
        assert_eq!(batch[0].products[2].conversion_share, 0.0);
        assert_eq!(batch[0].report_date, "");
    }

    #[test]
    fn drops_empty_keywords_and_bad_ranks() {
        let (_tmp, path) = write_csv(&[
            "1,a".to_string(),
            "2,   ".to_string(),
            "x,b".to_string(),
            "4,c".to_string(),
        ]);
        let mut reader = ChunkReader::open(&path, 10).unwrap();
        let batch = reader.next().unwrap().unwrap();
        let keywords: Vec<_> = batch.iter().map(|r| r.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["a", "c"]);
        assert_eq!(reader.skipped(), 2);
    }

    #[test]
    fn yields_fixed_size_batches() {
        let rows: Vec<String> = (1..=5).map(|i| format!("{},kw{}", i, i)).collect();
        let (_tmp, path) = write_csv(&rows);
        let sizes: Vec<usize> = ChunkReader::open(&path, 2)
            .unwrap()
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn empty_data_yields_nothing() {
        let (_tmp, path) = write_csv(&[]);
        assert!(ChunkReader::open(&path, 2).unwrap().next().is_none());
    }

    #[test]
    fn rank_parsing() {
        assert_eq!(parse_rank("1,234"), Some(1234));
        assert_eq!(parse_rank("12.0"), Some(12));
        assert_eq!(parse_rank("12.5"), None);
        assert_eq!(parse_rank(""), None);
    }

    #[test]
    fn estimate_is_exact_for_small_files() {
        let rows: Vec<String> = (1..=9).map(|i| format!("{},kw{}", i, i)).collect();
        let (_tmp, path) = write_csv(&rows);
        assert_eq!(estimate_records(&path).unwrap(), 9);
    }

    #[tokio::test]
    async fn spawned_reader_delivers_all_batches() {
        let rows: Vec<String> = (1..=7).map(|i| format!("{},kw{}", i, i)).collect();
        let (_tmp, path) = write_csv(&rows);

        let (mut rx, handle) = spawn_reader(path, 3);
        let mut total = 0;
        while let Some(batch) = rx.recv().await {
            total += batch.unwrap().len();
        }
        handle.await.unwrap();
        assert_eq!(total, 7);
    }
}
