//! Progress parsing for supervised workers.
//!
//! Each worker kind ships a parsing discipline for its diagnostic stream:
//! surface readers and zero writers emit byte-and-rate lines
//! (`<bytes> bytes ... copied, <s> s, <rate>`), pattern writers emit
//! percent-complete tokens (`<digits>%`), and health probes emit nothing
//! usable. The parser is fed raw chunks as they arrive, tolerates
//! carriage-returned partial lines, and never hands a regressing byte count
//! to the supervisor.

use std::time::Instant;

/// How a worker's diagnostic output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDiscipline {
    /// `dd status=progress` byte-and-rate lines.
    ByteLines,
    /// Percent tokens, converted to bytes against an expected total.
    PercentTokens { expected_bytes: u64 },
    /// No progress expected (health probes).
    Opaque,
}

/// A single accepted progress observation.
#[derive(Debug, Clone)]
pub struct ProgressSample {
    /// Bytes completed so far. Monotonically non-decreasing.
    pub bytes_done: u64,
    /// Instantaneous rate string as reported by the worker, verbatim.
    pub rate: Option<String>,
    /// When the observation was accepted.
    pub observed_at: Instant,
}

impl ProgressSample {
    /// The zero sample used before a worker reports anything.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            bytes_done: 0,
            rate: None,
            observed_at: Instant::now(),
        }
    }
}

/// Percent complete, clamped to 0..=100.
#[must_use]
pub fn percent(bytes_done: u64, expected_bytes: u64) -> f64 {
    if expected_bytes == 0 {
        return 0.0;
    }
    let pct = (bytes_done as f64 / expected_bytes as f64) * 100.0;
    pct.clamp(0.0, 100.0)
}

/// Incremental parser over a worker's diagnostic stream.
///
/// Feed raw chunks with [`feed`]; the latest accepted sample is available
/// from [`latest`]. Byte counts only move forward: the percent discipline in
/// particular can regress mid-pass (a pattern writer re-reads what it wrote),
/// and a regressing counter would look like reverse progress to the stall
/// detector.
///
/// [`feed`]: ProgressParser::feed
/// [`latest`]: ProgressParser::latest
#[derive(Debug)]
pub struct ProgressParser {
    discipline: ProgressDiscipline,
    pending: String,
    latest: ProgressSample,
}

impl ProgressParser {
    #[must_use]
    pub fn new(discipline: ProgressDiscipline) -> Self {
        Self {
            discipline,
            pending: String::new(),
            latest: ProgressSample::initial(),
        }
    }

    /// The most recently accepted sample.
    #[must_use]
    pub fn latest(&self) -> &ProgressSample {
        &self.latest
    }

    /// Consume a chunk of diagnostic output. Returns `true` if the byte
    /// counter advanced.
    pub fn feed(&mut self, chunk: &str) -> bool {
        if matches!(self.discipline, ProgressDiscipline::Opaque) {
            return false;
        }
        self.pending.push_str(chunk);
        let mut advanced = false;

        // Workers rewrite their status line with bare carriage returns, so
        // both \r and \n terminate a line. The tail after the last
        // terminator stays buffered as a partial line.
        while let Some(pos) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending.drain(..=pos).collect();
            advanced |= self.accept_line(line.trim_end_matches(['\n', '\r']));
        }
        advanced
    }

    fn accept_line(&mut self, line: &str) -> bool {
        let observed = match self.discipline {
            ProgressDiscipline::ByteLines => parse_byte_line(line)
                .map(|(bytes, rate)| (bytes, Some(rate))),
            ProgressDiscipline::PercentTokens { expected_bytes } => parse_percent_token(line)
                .map(|pct| (((pct / 100.0) * expected_bytes as f64) as u64, None)),
            ProgressDiscipline::Opaque => None,
        };
        let Some((bytes, rate)) = observed else {
            return false;
        };
        if bytes < self.latest.bytes_done {
            return false;
        }
        let advanced = bytes > self.latest.bytes_done;
        self.latest = ProgressSample {
            bytes_done: bytes,
            rate: rate.or_else(|| self.latest.rate.clone()),
            observed_at: Instant::now(),
        };
        advanced
    }
}

/// Parse one `dd status=progress` line:
/// `1234567168 bytes (1.2 GB, 1.1 GiB) copied, 19 s, 64.9 MB/s`.
///
/// Returns the byte count and the rate string verbatim.
pub fn parse_byte_line(line: &str) -> Option<(u64, String)> {
    let mut tokens = line.split_whitespace();
    let bytes: u64 = tokens.next()?.parse().ok()?;
    if tokens.next()? != "bytes" {
        return None;
    }
    if !line.contains("copied,") {
        return None;
    }
    let rate = line.rsplit(", ").next()?.trim();
    if rate.is_empty() {
        return None;
    }
    Some((bytes, rate.to_string()))
}

/// Extract a percent-complete token (`12.34%` or `7%`) from a line.
pub fn parse_percent_token(line: &str) -> Option<f64> {
    for token in line.split_whitespace() {
        let Some(stripped) = token.strip_suffix('%') else {
            continue;
        };
        if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        if let Ok(pct) = stripped.parse::<f64>() {
            return Some(pct.clamp(0.0, 100.0));
        }
    }
    None
}
