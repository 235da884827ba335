use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::router::{ResultSinks, Tracker};
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobSender;

/// How input lines reach the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Read all input first so the total is known for percentage progress.
    Eager,
    /// Forward each line as soon as it is read; the total is never known.
    Streaming,
}

/// Token for one raw input line: a trailing `\r` is stripped and invalid
/// UTF-8 is replaced rather than rejected.
fn token_from_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(token) => token,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl IngestMode {
    pub fn for_progress(show_percentage: bool) -> Self {
        if show_percentage {
            IngestMode::Eager
        } else {
            IngestMode::Streaming
        }
    }
}

/// Turns an input stream into jobs on the shared queue.
///
/// The source is the only owner of the queue's [`JobSender`]: the queue
/// closes when [`JobSource::run`] returns.
pub struct JobSource<R> {
    reader: R,
    mode: IngestMode,
}

impl<R> JobSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, mode: IngestMode) -> Self {
        Self { reader, mode }
    }

    /// Push every input line onto the queue, one job per line. Returns the
    /// number of jobs submitted. Stops early, without error, once `cancel`
    /// fires or every consumer is gone.
    pub async fn run(
        self,
        tx: JobSender<Job>,
        tracker: &Tracker,
        sinks: &ResultSinks,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut lines = SplitStream::new(self.reader.split(b'\n'));

        let submitted = match self.mode {
            IngestMode::Eager => {
                let mut tokens = Vec::new();
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(0),
                        next = lines.next() => next,
                    };
                    match next {
                        Some(line) => tokens.push(token_from_line(line?)),
                        None => break,
                    }
                }

                let total = tokens.len() as u64;
                tracker.set_total(total);
                sinks.info(format!("Total jobs: {}\n", total)).await;
                tracing::info!(total, "Input read, dispatching jobs");

                let mut submitted = 0;
                for (seq, token) in tokens.into_iter().enumerate() {
                    if !Self::push(&tx, Job::new(seq as u64, token), tracker, cancel).await {
                        break;
                    }
                    submitted += 1;
                }
                submitted
            }
            IngestMode::Streaming => {
                let mut submitted = 0;
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = lines.next() => next,
                    };
                    let Some(line) = next else {
                        break;
                    };
                    if !Self::push(&tx, Job::new(submitted, token_from_line(line?)), tracker, cancel).await {
                        break;
                    }
                    submitted += 1;
                }
                submitted
            }
        };

        tracing::debug!(submitted, "Job source exhausted, closing queue");
        Ok(submitted)
    }

    async fn push(
        tx: &JobSender<Job>,
        job: Job,
        tracker: &Tracker,
        cancel: &CancellationToken,
    ) -> bool {
        let sent = tokio::select! {
            _ = cancel.cancelled() => return false,
            sent = tx.send(job) => sent,
        };
        match sent {
            Ok(()) => {
                tracker.record_submitted();
                true
            }
            Err(job) => {
                tracing::warn!(seq = job.seq, "Job queue closed, stopping ingestion");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::router::{MemoryConsole, ResultRouter};
    use crate::scheduler::queue::JobQueue;

    async fn collect(queue: JobQueue<Job>) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(job) = queue.recv().await {
            jobs.push(job);
        }
        jobs
    }

    #[tokio::test]
    async fn eager_mode_sets_total_and_preserves_order() {
        let console = MemoryConsole::new();
        let tracker = Tracker::new();
        let cancel = CancellationToken::new();
        let (sinks, router) =
            ResultRouter::start(console.clone(), tracker.clone(), FailurePolicy::Abort, cancel.clone());

        let (tx, queue) = JobQueue::bounded(100);
        let consumer = tokio::spawn(collect(queue));

        let input: &[u8] = b"a\nb\r\n\nd";
        let submitted = JobSource::new(input, IngestMode::Eager)
            .run(tx, &tracker, &sinks, &cancel)
            .await
            .unwrap();
        drop(sinks);
        router.finish().await;

        assert_eq!(submitted, 4);
        assert_eq!(tracker.progress().total, Some(4));
        assert_eq!(tracker.submitted(), 4);

        let jobs = consumer.await.unwrap();
        let tokens: Vec<&str> = jobs.iter().map(|j| j.token.as_str()).collect();
        assert_eq!(tokens, vec!["a", "b", "", "d"]);
        assert_eq!(jobs[3].seq, 3);
        assert!(console.app_output_text().contains("Total jobs: 4\n"));
    }

    #[tokio::test]
    async fn streaming_mode_leaves_total_unknown() {
        let console = MemoryConsole::new();
        let tracker = Tracker::new();
        let cancel = CancellationToken::new();
        let (sinks, router) =
            ResultRouter::start(console.clone(), tracker.clone(), FailurePolicy::Abort, cancel.clone());

        // Capacity 1 forces the source to wait on the consumer.
        let (tx, queue) = JobQueue::bounded(1);
        let consumer = tokio::spawn(collect(queue));

        let input = "1\n2\n3\n4\n5\n".as_bytes();
        let submitted = JobSource::new(input, IngestMode::Streaming)
            .run(tx, &tracker, &sinks, &cancel)
            .await
            .unwrap();
        drop(sinks);
        router.finish().await;

        assert_eq!(submitted, 5);
        assert_eq!(tracker.progress().total, None);
        assert_eq!(consumer.await.unwrap().len(), 5);
        assert!(!console.app_output_text().contains("Total jobs"));
    }

    #[tokio::test]
    async fn cancelled_source_stops_pushing() {
        let tracker = Tracker::new();
        let cancel = CancellationToken::new();
        let (sinks, router) = ResultRouter::start(
            MemoryConsole::new(),
            tracker.clone(),
            FailurePolicy::Abort,
            cancel.clone(),
        );

        // Nobody consumes, so the source would block forever on a full queue.
        let (tx, _queue) = JobQueue::bounded(2);
        let input = "1\n2\n3\n4\n".as_bytes();
        let source = JobSource::new(input, IngestMode::Streaming);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let submitted = source.run(tx, &tracker, &sinks, &cancel).await.unwrap();
        assert_eq!(submitted, 2);
        drop(sinks);
        router.finish().await;
    }

    #[test]
    fn line_tokens_tolerate_invalid_utf8() {
        assert_eq!(token_from_line(b"plain".to_vec()), "plain");
        assert_eq!(token_from_line(b"crlf\r".to_vec()), "crlf");
        assert_eq!(token_from_line(b"\xff\xfe".to_vec()), "\u{fffd}\u{fffd}");
    }

    #[test]
    fn mode_follows_percentage_flag() {
        assert_eq!(IngestMode::for_progress(true), IngestMode::Eager);
        assert_eq!(IngestMode::for_progress(false), IngestMode::Streaming);
    }
}
