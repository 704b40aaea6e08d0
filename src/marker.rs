use regex::bytes::Regex;
use std::io::{self, Read};
use std::path::Path;

/// Searches a byte stream for a fixed marker in bounded memory.
///
/// Each chunk is searched together with the last `marker.len() - 1` bytes of
/// the previous one, so a marker straddling a chunk boundary is still found.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    pattern: Regex,
    overlap: usize,
    chunk_size: usize,
}

impl MarkerScanner {
    pub fn new(marker: &str, chunk_size: usize) -> Self {
        let pattern =
            Regex::new(&regex::escape(marker)).expect("Escaped literal is a valid pattern");
        Self {
            pattern,
            overlap: marker.len().saturating_sub(1),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn contains<R: Read>(&self, mut reader: R) -> io::Result<bool> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut window: Vec<u8> = Vec::with_capacity(self.overlap + self.chunk_size);

        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(read) => read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            };

            window.extend_from_slice(&chunk[..read]);
            if self.pattern.is_match(&window) {
                return Ok(true);
            }

            let keep = self.overlap.min(window.len());
            window.drain(..window.len() - keep);
        }
    }

    pub fn file_contains(&self, path: &Path) -> io::Result<bool> {
        self.contains(std::fs::File::open(path)?)
    }
}
