/*
    Tycho, a mission analysis executive
    Copyright (C) 2026-onwards Tycho contributors

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::time::Epoch;
use std::fs::File;
use std::path::Path;

/// Identifier of one registered data stream, allocated once per propagation
/// unit and reused for the life of the command.
pub type StreamId = usize;

/// Receives periodic samples of propagated state for recording or plotting.
pub trait Publisher {
    /// Registers a stream for the given owners and element labels.
    fn register(&mut self, owners: &[String], elements: &[String]) -> StreamId;
    /// Pushes one sample on a registered stream.
    fn publish(&mut self, stream: StreamId, epoch: Epoch, data: &[f64]);
    /// Flushes any buffered samples to their final destination.
    fn flush(&mut self);
}

/// One recorded sample, as kept by [MemoryPublisher].
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub stream: StreamId,
    pub epoch: Epoch,
    pub data: Vec<f64>,
}

/// Publisher that records everything in memory. The workhorse for tests and
/// for callers that post-process samples themselves.
#[derive(Default, Debug)]
pub struct MemoryPublisher {
    pub samples: Vec<Sample>,
    streams: Vec<(Vec<String>, Vec<String>)>,
    pub flush_count: usize,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples published on the given stream.
    pub fn stream(&self, stream: StreamId) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(move |s| s.stream == stream)
    }
}

impl Publisher for MemoryPublisher {
    fn register(&mut self, owners: &[String], elements: &[String]) -> StreamId {
        self.streams.push((owners.to_vec(), elements.to_vec()));
        self.streams.len() - 1
    }

    fn publish(&mut self, stream: StreamId, epoch: Epoch, data: &[f64]) {
        self.samples.push(Sample {
            stream,
            epoch,
            data: data.to_vec(),
        });
    }

    fn flush(&mut self) {
        self.flush_count += 1;
    }
}

/// Publisher backed by a single CSV file: one row per sample, tagged with the
/// stream id and epoch. Write failures are logged, not propagated; publishing
/// is deliberately lenient so a full disk cannot abort a propagation.
pub struct CsvPublisher {
    writer: csv::Writer<File>,
    streams: usize,
}

impl CsvPublisher {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, csv::Error> {
        let writer = csv::Writer::from_path(path)?;
        Ok(Self { writer, streams: 0 })
    }
}

impl Publisher for CsvPublisher {
    fn register(&mut self, owners: &[String], elements: &[String]) -> StreamId {
        let id = self.streams;
        self.streams += 1;
        info!(
            "stream {id} registered for {} ({} elements)",
            owners.join(", "),
            elements.len()
        );
        let mut headers = vec!["stream".to_string(), "epoch".to_string()];
        headers.extend_from_slice(elements);
        if let Err(e) = self.writer.write_record(&headers) {
            warn!("could not write CSV headers: {e}");
        }
        id
    }

    fn publish(&mut self, stream: StreamId, epoch: Epoch, data: &[f64]) {
        let mut record = vec![stream.to_string(), format!("{epoch}")];
        record.extend(data.iter().map(|v| format!("{v:.12e}")));
        if let Err(e) = self.writer.write_record(&record) {
            warn!("could not publish sample: {e}");
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("could not flush published samples: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Epoch;

    #[test]
    fn memory_publisher_keeps_streams_separate() {
        let mut publisher = MemoryPublisher::new();
        let s0 = publisher.register(&["Sat1".to_string()], &["x".to_string()]);
        let s1 = publisher.register(&["Sat2".to_string()], &["x".to_string()]);
        let epoch = Epoch::from_gregorian_utc_at_midnight(2026, 1, 1);
        publisher.publish(s0, epoch, &[1.0]);
        publisher.publish(s1, epoch, &[2.0]);
        publisher.publish(s0, epoch, &[3.0]);
        assert_eq!(publisher.stream(s0).count(), 2);
        assert_eq!(publisher.stream(s1).count(), 1);
        publisher.flush();
        assert_eq!(publisher.flush_count, 1);
    }
}
