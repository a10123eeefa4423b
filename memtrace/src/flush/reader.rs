//! Parses per-thread logs back into records

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use memtrace_common::{TraceRecord, RECORD_SIZE};

use super::sink::TraceFormat;
use crate::domain::SinkError;

fn parse_hex(field: &str) -> Option<u64> {
    u64::from_str_radix(field.strip_prefix("0x")?, 16).ok()
}

fn parse_line(line: &str) -> Option<TraceRecord> {
    let mut fields = line.split(',');
    let pc = parse_hex(fields.next()?)?;
    let is_write = match fields.next()? {
        "r" => false,
        "w" => true,
        _ => return None,
    };
    let size = fields.next()?.parse().ok()?;
    let address = parse_hex(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some(TraceRecord::new(is_write, address, size, pc))
}

/// Reads a text log. Header lines (starting with `Format:`) and blank lines
/// are skipped.
///
/// # Errors
/// `Parse` with the 1-based line number of the first malformed line, `Io` on
/// read failure.
pub fn read_text_log<R: BufRead>(reader: R) -> Result<Vec<TraceRecord>, SinkError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("Format:") {
            continue;
        }
        let record = parse_line(trimmed)
            .ok_or_else(|| SinkError::Parse { line: index + 1, text: trimmed.to_string() })?;
        records.push(record);
    }
    Ok(records)
}

/// Splits a binary log into records.
///
/// # Errors
/// `Truncated` if the length is not a whole number of records.
pub fn read_binary_log(bytes: &[u8]) -> Result<Vec<TraceRecord>, SinkError> {
    let trailing = bytes.len() % RECORD_SIZE;
    if trailing != 0 {
        return Err(SinkError::Truncated(trailing));
    }
    Ok(bytes.chunks_exact(RECORD_SIZE).filter_map(TraceRecord::from_bytes).collect())
}

/// Reads a log file written in `format`.
///
/// # Errors
/// `Io` if the file cannot be read, otherwise as the format's reader.
pub fn read_log_file(path: &Path, format: TraceFormat) -> Result<Vec<TraceRecord>, SinkError> {
    match format {
        TraceFormat::Text => read_text_log(BufReader::new(File::open(path)?)),
        TraceFormat::Binary => read_binary_log(&fs::read(path)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::sink::{BinarySink, TextSink, TraceSink};

    fn sample() -> Vec<TraceRecord> {
        vec![
            TraceRecord::new(false, 0x7fff_0010, 4, 0x40_1000),
            TraceRecord::new(true, 0x7fff_0018, 512, 0x40_1004),
        ]
    }

    #[test]
    fn test_text_log_parses_back() {
        let mut out = Vec::new();
        let mut sink = TextSink::new(&mut out).unwrap();
        sink.write_batch(&sample()).unwrap();
        assert_eq!(read_text_log(out.as_slice()).unwrap(), sample());
    }

    #[test]
    fn test_text_log_reports_bad_line() {
        let text = "Format: x\n0x10,r,8,0x20\n0x10,q,8,0x20\n";
        match read_text_log(text.as_bytes()) {
            Err(SinkError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_log_parses_back() {
        let mut out = Vec::new();
        BinarySink::new(&mut out).write_batch(&sample()).unwrap();
        assert_eq!(read_binary_log(&out).unwrap(), sample());
    }

    #[test]
    fn test_binary_log_truncated() {
        let err = read_binary_log(&[0u8; RECORD_SIZE + 5]).unwrap_err();
        assert!(matches!(err, SinkError::Truncated(5)));
    }
}
