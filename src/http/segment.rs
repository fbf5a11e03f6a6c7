//! Section transfer
//!
//! Streams every incomplete section of a pumping into its part file
//! concurrently. Each section gets its own GET (ranged where needed) and
//! its own file handle; cursors are published through atomics that the
//! worker samples to report progress.
//!
//! The futures here are driven by the worker task itself, never spawned,
//! so once the worker returns nothing can touch the part file.

use crate::error::{NetworkErrorKind, PumpError, Result};
use crate::protocol::Section;

use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Live write cursors of a section plan
#[derive(Debug)]
pub struct SectionCursors {
    offsets: Vec<AtomicU64>,
}

impl SectionCursors {
    pub fn new(sections: &[Section]) -> Self {
        Self {
            offsets: sections.iter().map(|s| AtomicU64::new(s.offset())).collect(),
        }
    }

    pub fn get(&self, index: usize) -> u64 {
        self.offsets[index].load(Ordering::Acquire)
    }

    /// Copy the cursors into `sections`
    pub fn apply(&self, sections: &mut [Section]) {
        for (section, cursor) in sections.iter_mut().zip(&self.offsets) {
            section.set_offset(cursor.load(Ordering::Acquire));
        }
    }

    fn store(&self, index: usize, offset: u64) {
        self.offsets[index].store(offset, Ordering::Release);
    }
}

/// Create the part file if needed and size it for a known length
pub async fn prepare_part_file(part_path: &Path, length: Option<u64>) -> Result<()> {
    if let Some(parent) = part_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PumpError::io(parent, "Create dir failed", e))?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(part_path)
        .await
        .map_err(|e| PumpError::io(part_path, "Open failed", e))?;

    if let Some(length) = length {
        let current = file
            .metadata()
            .await
            .map_err(|e| PumpError::io(part_path, "Stat failed", e))?
            .len();
        if current != length {
            file.set_len(length)
                .await
                .map_err(|e| PumpError::io(part_path, "Pre-allocate failed", e))?;
        }
    }

    Ok(())
}

/// Stream all incomplete sections of a plan into `part_path`
///
/// Returns when every section is complete, on the first error, or with
/// [`PumpError::Cancelled`] once `cancel` fires.
pub async fn fetch_sections(
    client: &Client,
    url: &Url,
    part_path: &Path,
    sections: &[Section],
    cursors: &SectionCursors,
    cancel: &CancellationToken,
) -> Result<()> {
    let multi = sections.len() > 1;

    let transfers = sections
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_complete())
        .map(|(index, section)| {
            fetch_section(
                client, url, part_path, index, *section, multi, cursors, cancel,
            )
        });

    try_join_all(transfers).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_section(
    client: &Client,
    url: &Url,
    part_path: &Path,
    index: usize,
    section: Section,
    multi: bool,
    cursors: &SectionCursors,
    cancel: &CancellationToken,
) -> Result<()> {
    let start = cursors.get(index).max(section.offset());

    let mut file = OpenOptions::new()
        .write(true)
        .open(part_path)
        .await
        .map_err(|e| PumpError::io(part_path, "Open failed", e))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| PumpError::io(part_path, "Seek failed", e))?;

    let result = stream_section(
        client, url, part_path, index, section, start, multi, &mut file, cursors, cancel,
    )
    .await;

    // A pending write must land before the worker may report the section idle
    let flushed = file
        .flush()
        .await
        .map_err(|e| PumpError::io(part_path, "Flush failed", e));

    result.and(flushed)
}

#[allow(clippy::too_many_arguments)]
async fn stream_section(
    client: &Client,
    url: &Url,
    part_path: &Path,
    index: usize,
    section: Section,
    start: u64,
    multi: bool,
    file: &mut tokio::fs::File,
    cursors: &SectionCursors,
    cancel: &CancellationToken,
) -> Result<()> {
    let ranged = multi || start > 0;

    let mut request = client.get(url.clone());
    if ranged {
        let range = match section.last() {
            Some(last) => format!("bytes={}-{}", start, last),
            None => format!("bytes={}-", start),
        };
        request = request.header(header::RANGE, range);
    }

    let response = tokio::select! {
        response = request.send() => response?,
        _ = cancel.cancelled() => return Err(PumpError::Cancelled),
    };

    let status = response.status();

    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        return Err(PumpError::connection(
            NetworkErrorKind::HttpStatus(416),
            format!(
                "Section {} range not satisfiable (file may have changed on server)",
                index
            ),
        ));
    }

    if !status.is_success() {
        return Err(PumpError::connection(
            NetworkErrorKind::HttpStatus(status.as_u16()),
            format!("Section {} HTTP error: {}", index, status),
        ));
    }

    if ranged {
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(PumpError::protocol(format!(
                "Server ignored range request for section {} ({})",
                index, status
            )));
        }
        if let Some(got) = content_range_start(response.headers()) {
            if got != start {
                return Err(PumpError::protocol(format!(
                    "Section {} Content-Range mismatch: requested {}, got {}",
                    index, start, got
                )));
            }
        }
    }

    tracing::debug!(section = index, start, last = ?section.last(), "Section streaming");

    let end = section.last().map(|last| last + 1);

    // A body announced longer than the section cannot be the resource we sized for
    if let (Some(end), Some(announced)) = (end, response.content_length()) {
        if announced > end - start {
            return Err(PumpError::LengthMismatch {
                expected: end - start,
                actual: announced,
            });
        }
    }

    let mut position = start;
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
        };

        let chunk: Bytes = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                return Err(PumpError::connection(
                    NetworkErrorKind::Stream,
                    format!("Section {} stream error: {}", index, e),
                ))
            }
            None => break,
        };

        // Never write past the end of the section; surplus bytes are an error
        if let Some(end) = end {
            if chunk.len() as u64 > end - position {
                return Err(PumpError::LengthMismatch {
                    expected: end - start,
                    actual: position - start + chunk.len() as u64,
                });
            }
        }

        file.write_all(&chunk)
            .await
            .map_err(|e| PumpError::io(part_path, "Write failed", e))?;
        position += chunk.len() as u64;
        cursors.store(index, position);
    }

    if let Some(end) = end {
        if position < end {
            return Err(PumpError::connection(
                NetworkErrorKind::Stream,
                format!(
                    "Section {} ended early at {} of {}",
                    index, position, end
                ),
            ));
        }
    }

    Ok(())
}

/// First byte of a `Content-Range: bytes START-END/TOTAL` header
fn content_range_start(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
