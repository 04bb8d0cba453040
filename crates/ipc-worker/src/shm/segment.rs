//! Per-worker request segments.
//!
//! A segment is the private, fixed-capacity slot through which dispatch
//! managers hand a single request to one worker. It holds at most one job at
//! a time: a manager only writes into the segment of a worker it has claimed
//! as idle, and the worker empties it before going idle again.

use crate::types::RequestId;
use bytes::Bytes;
use core::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// A request routed to a worker, together with the admission permit that
/// reserved the worker. The permit returns to the pool when the job drops.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: RequestId,
    pub(crate) payload: Bytes,
    pub(crate) permit: OwnedSemaphorePermit,
}

/// Manager side of a segment.
#[derive(Clone, Debug)]
pub(crate) struct SegmentWriter {
    name: String,
    capacity: usize,
    tx: flume::Sender<Job>,
}

impl SegmentWriter {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes `job` into the segment. Hands the job back if the owning
    /// worker is gone.
    pub(crate) async fn write(&self, job: Job) -> Result<(), Job> {
        debug_assert!(job.payload.len() <= self.capacity);
        self.tx.send_async(job).await.map_err(|e| e.into_inner())
    }
}

/// Outcome of polling a segment.
#[derive(Debug)]
pub(crate) enum Read {
    Job(Job),
    Empty,
    Closed,
}

/// Worker side of a segment.
#[derive(Debug)]
pub(crate) struct SegmentReader {
    rx: flume::Receiver<Job>,
}

impl SegmentReader {
    /// Waits up to `poll` for a job.
    pub(crate) fn read(&self, poll: Duration) -> Read {
        match self.rx.recv_timeout(poll) {
            Ok(job) => Read::Job(job),
            Err(flume::RecvTimeoutError::Timeout) => Read::Empty,
            Err(flume::RecvTimeoutError::Disconnected) => Read::Closed,
        }
    }
}

/// Creates the segment called `name` holding payloads of up to `capacity`
/// bytes.
pub(crate) fn segment(name: String, capacity: usize) -> (SegmentWriter, SegmentReader) {
    let (tx, rx) = flume::bounded(1);
    (SegmentWriter { name, capacity, tx }, SegmentReader { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn job(admission: &Arc<Semaphore>, id: RequestId) -> Job {
        Job {
            id,
            payload: Bytes::from_static(b"job"),
            permit: Arc::clone(admission).try_acquire_owned().unwrap(),
        }
    }

    #[tokio::test]
    async fn written_job_is_read_back_and_releases_its_permit() {
        let admission = Arc::new(Semaphore::new(1));
        let (writer, reader) = segment("g_jid_0".into(), 16);
        assert_eq!(writer.name(), "g_jid_0");
        assert_eq!(writer.capacity(), 16);

        writer.write(job(&admission, 3)).await.unwrap();
        assert_eq!(admission.available_permits(), 0);

        let Read::Job(read) = reader.read(Duration::from_millis(10)) else {
            panic!("expected a job");
        };
        assert_eq!(read.id, 3);
        drop(read);
        assert_eq!(admission.available_permits(), 1);
    }

    #[test]
    fn empty_segment_times_out() {
        let (_writer, reader) = segment("g_jid_1".into(), 16);
        assert!(matches!(reader.read(Duration::from_millis(1)), Read::Empty));
    }

    #[tokio::test]
    async fn write_to_dropped_reader_returns_the_job() {
        let admission = Arc::new(Semaphore::new(1));
        let (writer, reader) = segment("g_jid_2".into(), 16);
        drop(reader);
        let returned = writer.write(job(&admission, 9)).await.unwrap_err();
        assert_eq!(returned.id, 9);
    }

    #[test]
    fn dropped_writer_closes_the_segment() {
        let (writer, reader) = segment("g_jid_3".into(), 16);
        drop(writer);
        assert!(matches!(reader.read(Duration::from_millis(1)), Read::Closed));
    }
}
