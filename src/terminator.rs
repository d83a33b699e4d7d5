//! Line terminators and the byte-accumulating line scanner shared by every
//! stream-like backend.
//!
//! Backends only differ in how they obtain the next chunk of bytes; the
//! terminator logic lives here once.

use crate::error::{CommError, CommResult};

/// Remove the longest terminator among `terms` from the end of `msg`.
///
/// Terminator sets may contain both a sequence and one of its suffixes
/// (`"\n"` and `"\r\n"`), so the first match is not good enough.
pub fn remove_longest_term<'a, T: AsRef<[u8]>>(msg: &'a [u8], terms: &[T]) -> &'a [u8] {
    let longest = terms
        .iter()
        .map(AsRef::as_ref)
        .filter(|t| msg.ends_with(t))
        .map(<[u8]>::len)
        .max()
        .unwrap_or(0);
    &msg[..msg.len() - longest]
}

/// Ordered set of byte sequences accepted as line endings on read.
///
/// An empty set means "read everything until the timeout".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Terminators(Vec<Vec<u8>>);

impl Terminators {
    pub fn new<I, T>(terms: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Terminators(
            terms
                .into_iter()
                .map(|t| t.as_ref().to_vec())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    pub fn none() -> Self {
        Terminators(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Every terminator is exactly one byte long, so membership of the last
    /// byte read is enough to detect a line end.
    pub fn single_byte(&self) -> bool {
        self.0.iter().all(|t| t.len() == 1)
    }

    pub fn contains_byte(&self, byte: u8) -> bool {
        self.0.iter().any(|t| t.as_slice() == [byte])
    }

    pub fn matches_end(&self, buf: &[u8]) -> bool {
        self.0.iter().any(|t| buf.ends_with(t))
    }

    pub fn strip<'a>(&self, msg: &'a [u8]) -> &'a [u8] {
        remove_longest_term(msg, &self.0)
    }
}

impl From<&str> for Terminators {
    fn from(term: &str) -> Self {
        Terminators::new([term])
    }
}

impl From<&[u8]> for Terminators {
    fn from(term: &[u8]) -> Self {
        Terminators::new([term])
    }
}

impl From<Vec<&str>> for Terminators {
    fn from(terms: Vec<&str>) -> Self {
        Terminators::new(terms)
    }
}

impl From<Vec<Vec<u8>>> for Terminators {
    fn from(terms: Vec<Vec<u8>>) -> Self {
        Terminators::new(terms)
    }
}

/// What to do when no terminators are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Keep reading blocks until the transport returns nothing (byte streams).
    Drain,
    /// Return after the first block (packetized transports).
    SingleBlock,
}

/// Accumulate bytes from `read_chunk` until a terminator in `terms` ends the
/// buffer.
///
/// `read_chunk(n)` must return at most `n` bytes and an empty vector when the
/// transport timed out. Terminators are scanned one byte at a time; without
/// terminators, blocks of `block_size` bytes are requested instead.
///
/// On timeout, either fails with [`CommError::Timeout`] (terminators were
/// required and `error_on_timeout` is set) or returns the partial buffer.
pub fn read_terms<F>(
    mut read_chunk: F,
    terms: &Terminators,
    block_size: usize,
    error_on_timeout: bool,
    mode: ScanMode,
) -> CommResult<Vec<u8>>
where
    F: FnMut(usize) -> CommResult<Vec<u8>>,
{
    let mut result = Vec::new();
    let single_byte = terms.single_byte();
    let chunk_size = if terms.is_empty() { block_size } else { 1 };

    loop {
        let chunk = read_chunk(chunk_size)?;
        let Some(&last) = chunk.last() else {
            if error_on_timeout && !terms.is_empty() {
                return Err(CommError::Timeout(format!(
                    "timeout during read, {} bytes received without a terminator",
                    result.len()
                )));
            }
            return Ok(result);
        };
        result.extend_from_slice(&chunk);

        if terms.is_empty() {
            if mode == ScanMode::SingleBlock {
                return Ok(result);
            }
        } else if single_byte {
            if terms.contains_byte(last) {
                return Ok(result);
            }
        } else if terms.matches_end(&result) {
            return Ok(result);
        }
    }
}

/// Read lines with `read_once` until one survives the empty-line filter.
///
/// Empty lines are only skipped after terminator removal, and only when both
/// `remove_term` and `skip_empty` are set. A read that returned no bytes at
/// all (a timeout tolerated by the caller) ends the loop.
pub fn readline_loop<F>(
    mut read_once: F,
    terms: &Terminators,
    remove_term: bool,
    skip_empty: bool,
) -> CommResult<Vec<u8>>
where
    F: FnMut() -> CommResult<Vec<u8>>,
{
    loop {
        let mut line = read_once()?;
        if line.is_empty() {
            return Ok(line);
        }
        if remove_term && !terms.is_empty() {
            let len = terms.strip(&line).len();
            line.truncate(len);
        }
        if !(skip_empty && remove_term && line.is_empty()) {
            return Ok(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn source(data: &[u8]) -> impl FnMut(usize) -> CommResult<Vec<u8>> {
        let mut pending: VecDeque<u8> = data.iter().copied().collect();
        move |n| {
            let take = n.min(pending.len());
            Ok(pending.drain(..take).collect())
        }
    }

    #[test]
    fn strips_longest_terminator() {
        let terms = vec![b"\n".to_vec(), b"\r\n".to_vec()];
        assert_eq!(remove_longest_term(b"data\r\n", &terms), b"data");
        assert_eq!(remove_longest_term(b"data\n", &terms), b"data");
        assert_eq!(remove_longest_term(b"data", &terms), b"data");
        assert_eq!(remove_longest_term(b"data\r", &terms), b"data\r");
    }

    #[test]
    fn empty_terminators_are_dropped() {
        let terms = Terminators::new(["", "\n"]);
        assert_eq!(terms.as_slice(), &[b"\n".to_vec()]);
        assert!(Terminators::from("").is_empty());
    }

    #[test]
    fn single_byte_terms_stop_at_first_match() {
        let terms = Terminators::from(vec!["\r", "\n"]);
        assert!(terms.single_byte());
        let mut read = source(b"abc\rdef\n");
        let line = read_terms(&mut read, &terms, 8, true, ScanMode::Drain).unwrap();
        assert_eq!(line, b"abc\r");
        let line = read_terms(&mut read, &terms, 8, true, ScanMode::Drain).unwrap();
        assert_eq!(line, b"def\n");
    }

    #[test]
    fn multi_byte_terms_match_suffix() {
        let terms = Terminators::from(vec!["\n", "\r\n"]);
        assert!(!terms.single_byte());
        let line = read_terms(source(b"xy\r\nrest"), &terms, 8, true, ScanMode::Drain).unwrap();
        assert_eq!(line, b"xy\r\n");
        assert_eq!(terms.strip(&line), b"xy");

        let terms = Terminators::from("END");
        let line = read_terms(source(b"aEbENDc"), &terms, 8, true, ScanMode::Drain).unwrap();
        assert_eq!(line, b"aEbEND");
    }

    #[test]
    fn timeout_without_terminator() {
        let terms = Terminators::from("\n");
        let err = read_terms(source(b"partial"), &terms, 8, true, ScanMode::Drain).unwrap_err();
        assert!(err.is_timeout());

        let partial = read_terms(source(b"partial"), &terms, 8, false, ScanMode::Drain).unwrap();
        assert_eq!(partial, b"partial");
    }

    #[test]
    fn drain_and_single_block_without_terminators() {
        let mut sizes = Vec::new();
        let mut inner = source(b"0123456789abcdefXYZ");
        let all = read_terms(
            |n| {
                sizes.push(n);
                inner(n)
            },
            &Terminators::none(),
            8,
            true,
            ScanMode::Drain,
        )
        .unwrap();
        assert_eq!(all, b"0123456789abcdefXYZ");
        assert!(sizes.iter().all(|&n| n == 8));

        let block = read_terms(
            source(b"0123456789"),
            &Terminators::none(),
            4,
            true,
            ScanMode::SingleBlock,
        )
        .unwrap();
        assert_eq!(block, b"0123");
    }

    #[test]
    fn readline_skips_empty_lines() {
        let terms = Terminators::from("\n");
        let mut read = source(b"\n\nhello\n");
        let line = readline_loop(
            || read_terms(&mut read, &terms, 8, true, ScanMode::Drain),
            &terms,
            true,
            true,
        )
        .unwrap();
        assert_eq!(line, b"hello");
    }

    #[test]
    fn readline_keeps_empty_lines_when_asked() {
        let terms = Terminators::from("\n");
        let mut read = source(b"\nhello\n");
        let line = readline_loop(
            || read_terms(&mut read, &terms, 8, true, ScanMode::Drain),
            &terms,
            true,
            false,
        )
        .unwrap();
        assert!(line.is_empty());

        let mut read = source(b"\nhello\n");
        let raw = readline_loop(
            || read_terms(&mut read, &terms, 8, true, ScanMode::Drain),
            &terms,
            false,
            true,
        )
        .unwrap();
        assert_eq!(raw, b"\n");
    }
}
