//! Chunked blob transfer
//!
//! Writes and reads a blob in bounded chunks so no single call blocks for
//! long, reporting `done / total` after every chunk.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Write `data` in chunks of at most `chunk_size` bytes.
///
/// Returns the number of bytes written. `progress` is called after every
/// chunk with a value that increases monotonically and ends at exactly 1.0.
pub fn write_chunked<W: Write>(
    mut writer: W,
    data: &[u8],
    chunk_size: usize,
    mut progress: impl FnMut(f32),
) -> io::Result<usize> {
    check_chunk_size(chunk_size)?;

    if data.is_empty() {
        progress(1.0);
        return Ok(0);
    }

    let mut written = 0;
    for chunk in data.chunks(chunk_size) {
        writer.write_all(chunk)?;
        written += chunk.len();
        progress(fraction(written, data.len()));
    }
    writer.flush()?;

    log::debug!("Chunked write complete: {} bytes", written);
    Ok(written)
}

/// Read exactly `len` bytes in chunks of at most `chunk_size` bytes.
///
/// A short source is an error (`UnexpectedEof`), not a truncated blob.
pub fn read_chunked<R: Read>(
    mut reader: R,
    len: usize,
    chunk_size: usize,
    mut progress: impl FnMut(f32),
) -> io::Result<Vec<u8>> {
    check_chunk_size(chunk_size)?;

    let mut data = vec![0u8; len];
    if len == 0 {
        progress(1.0);
        return Ok(data);
    }

    let mut read = 0;
    while read < len {
        let end = (read + chunk_size).min(len);
        reader.read_exact(&mut data[read..end])?;
        read = end;
        progress(fraction(read, len));
    }

    log::debug!("Chunked read complete: {} bytes", read);
    Ok(data)
}

fn check_chunk_size(chunk_size: usize) -> io::Result<()> {
    if chunk_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "chunk size must be greater than zero",
        ));
    }
    Ok(())
}

fn fraction(done: usize, total: usize) -> f32 {
    if done >= total {
        1.0
    } else {
        done as f32 / total as f32
    }
}

/// Transfer progress shared between the controller and a device driver.
///
/// Stored as `f32` bits so driver threads can update it without locking.
/// Values only move forward within one transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    bits: Arc<AtomicU32>,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fraction in `0.0..=1.0`
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Record progress, ignoring values lower than the current one
    pub fn report(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut current = self.bits.load(Ordering::Acquire);
        while fraction > f32::from_bits(current) {
            match self.bits.compare_exchange_weak(
                current,
                fraction.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start a new transfer at zero
    pub fn reset(&self) {
        self.bits.store(0f32.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_write_reports_each_chunk() {
        let data = vec![7u8; 2500];
        let mut out = Vec::new();
        let mut reports = Vec::new();

        let written = write_chunked(&mut out, &data, 1000, |p| reports.push(p)).unwrap();

        assert_eq!(written, 2500);
        assert_eq!(out, data);
        assert_eq!(reports, vec![0.4, 0.8, 1.0]);
    }

    #[test]
    fn test_empty_blob_reports_complete() {
        let mut out = Vec::new();
        let mut reports = Vec::new();
        write_chunked(&mut out, &[], 1000, |p| reports.push(p)).unwrap();
        assert_eq!(reports, vec![1.0]);

        let mut reports = Vec::new();
        let data = read_chunked(&[][..], 0, 1000, |p| reports.push(p)).unwrap();
        assert!(data.is_empty());
        assert_eq!(reports, vec![1.0]);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = write_chunked(Vec::new(), b"abc", 0, |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_short_source_is_error() {
        let source = [1u8; 10];
        let err = read_chunked(&source[..], 20, 4, |_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let progress = TransferProgress::new();
        progress.report(0.5);
        progress.report(0.25);
        assert_eq!(progress.get(), 0.5);
        progress.report(2.0);
        assert_eq!(progress.get(), 1.0);
        progress.reset();
        assert_eq!(progress.get(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_progress_monotonic_and_complete(
            data in proptest::collection::vec(any::<u8>(), 0..5000),
            chunk_size in 1usize..2048,
        ) {
            let mut out = Vec::new();
            let mut reports = Vec::new();
            write_chunked(&mut out, &data, chunk_size, |p| reports.push(p)).unwrap();

            prop_assert_eq!(&out, &data);
            prop_assert!(reports.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(reports.last().copied(), Some(1.0));

            let back = read_chunked(&out[..], out.len(), chunk_size, |_| {}).unwrap();
            prop_assert_eq!(back, data);
        }
    }
}
