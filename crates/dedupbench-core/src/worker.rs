//! The engine worker: one blocking task that owns the index connection.
//!
//! Hosts never call the pipelines from their own thread. They send
//! [`EngineRequest`]s through an [`EngineHandle`] and await the reply, while
//! progress and log events arrive on the sink given to [`EngineWorker::start`].
//! All requests run one after another on the worker, so each namespace only
//! ever sees a single writer.

use crate::bench::{run_benchmark, BenchmarkPlan};
use crate::config::EngineConfig;
use crate::error::{DedupError, Result};
use crate::events::{CancelFlag, EngineEvent, EventSink, LogLevel, RunContext};
use crate::index::{ConnectionParams, DedupIndex, Namespace};
use crate::metrics::{EngineMetrics, RunResult};
use crate::recover::{run_recovery, RecoverRequest, RecoveryStats};
use crate::segment::{run_segmentation, SegmentRequest, SegmentationStats};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T>>;

/// A unit of work for the engine worker.
#[derive(Debug)]
pub enum EngineRequest {
    /// Open (and create if needed) the database
    Connect {
        /// Where the index lives
        params: ConnectionParams,
        /// Namespaces already present
        reply: Reply<Vec<Namespace>>,
    },
    /// Segment one source
    Segment {
        /// What to segment
        request: SegmentRequest,
        /// Ticket taken at submission
        cancel: CancelFlag,
        /// Run counters
        reply: Reply<SegmentationStats>,
    },
    /// Rebuild one file from a trail
    Recover {
        /// What to recover
        request: RecoverRequest,
        /// Ticket taken at submission
        cancel: CancelFlag,
        /// Run counters
        reply: Reply<RecoveryStats>,
    },
    /// Segment + recover over several block sizes
    Benchmark {
        /// Benchmark plan
        plan: BenchmarkPlan,
        /// Ticket taken at submission
        cancel: CancelFlag,
        /// One row per block size
        reply: Reply<Vec<RunResult>>,
    },
    /// Delete a namespace and its records
    DropNamespace {
        /// Namespace to drop
        namespace: Namespace,
        /// Records removed
        reply: Reply<u64>,
    },
    /// Distinct digests in a namespace
    RowCount {
        /// Namespace to count
        namespace: Namespace,
        /// Row count
        reply: Reply<u64>,
    },
    /// Namespaces in the connected database
    ListNamespaces {
        /// Namespaces
        reply: Reply<Vec<Namespace>>,
    },
    /// Close the connection, optionally deleting the database
    Disconnect {
        /// Remove the database after closing
        drop_database: bool,
        /// Completion
        reply: Reply<()>,
    },
    /// Stop the worker
    Shutdown,
}

/// Snapshot of the worker, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// An index connection is open
    pub connected: bool,
    /// A request is being served
    pub busy: bool,
    /// Requests served so far
    pub requests_served: u64,
}

/// Handle for submitting requests to the engine worker.
pub struct EngineHandle {
    sender: mpsc::Sender<EngineRequest>,
    status: watch::Receiver<WorkerStatus>,
    cancel: CancelFlag,
    metrics: Arc<EngineMetrics>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| DedupError::WorkerStopped)?;
        rx.await.map_err(|_| DedupError::WorkerStopped)?
    }

    /// Connect to the index, replacing any open connection.
    pub async fn connect(&self, params: ConnectionParams) -> Result<Vec<Namespace>> {
        self.call(|reply| EngineRequest::Connect { params, reply }).await
    }

    /// Run segmentation.
    pub async fn segment(&self, request: SegmentRequest) -> Result<SegmentationStats> {
        let cancel = self.cancel.issue();
        self.call(|reply| EngineRequest::Segment {
            request,
            cancel,
            reply,
        })
        .await
    }

    /// Run recovery.
    pub async fn recover(&self, request: RecoverRequest) -> Result<RecoveryStats> {
        let cancel = self.cancel.issue();
        self.call(|reply| EngineRequest::Recover {
            request,
            cancel,
            reply,
        })
        .await
    }

    /// Run a benchmark plan.
    pub async fn benchmark(&self, plan: BenchmarkPlan) -> Result<Vec<RunResult>> {
        let cancel = self.cancel.issue();
        self.call(|reply| EngineRequest::Benchmark {
            plan,
            cancel,
            reply,
        })
        .await
    }

    /// Drop a namespace, returning how many records went with it.
    pub async fn drop_namespace(&self, namespace: Namespace) -> Result<u64> {
        self.call(|reply| EngineRequest::DropNamespace { namespace, reply })
            .await
    }

    /// Distinct digests in a namespace.
    pub async fn row_count(&self, namespace: Namespace) -> Result<u64> {
        self.call(|reply| EngineRequest::RowCount { namespace, reply })
            .await
    }

    /// Namespaces in the connected database.
    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.call(|reply| EngineRequest::ListNamespaces { reply }).await
    }

    /// Close the connection. With `drop_database` the database is deleted.
    pub async fn disconnect(&self, drop_database: bool) -> Result<()> {
        self.call(|reply| EngineRequest::Disconnect {
            drop_database,
            reply,
        })
        .await
    }

    /// Ask the run in progress, and any run still queued, to stop at the
    /// next block boundary. Runs submitted afterwards are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the worker is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Latest worker status.
    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Engine counters.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop the worker, closing any open connection, and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        // an already stopped worker has nothing left to close
        let _ = self.sender.send(EngineRequest::Shutdown).await;
        self.task.await.map_err(|e| {
            DedupError::Io(std::io::Error::other(format!("engine worker panicked: {}", e)))
        })
    }
}

/// State owned by the worker task.
pub struct EngineWorker {
    index: Option<DedupIndex>,
    ctx: RunContext,
    status_tx: watch::Sender<WorkerStatus>,
    status: WorkerStatus,
}

impl EngineWorker {
    /// Spawn the worker on the blocking pool and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &EngineConfig, sink: Arc<dyn EventSink>) -> EngineHandle {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let ctx = RunContext::new(sink).with_progress_interval(config.progress_interval_bytes);
        let cancel = ctx.cancel.clone();
        let metrics = Arc::clone(&ctx.metrics);

        let worker = EngineWorker {
            index: None,
            ctx,
            status_tx,
            status: WorkerStatus::default(),
        };
        let task = tokio::task::spawn_blocking(move || worker.run(rx));

        EngineHandle {
            sender: tx,
            status: status_rx,
            cancel,
            metrics,
            task,
        }
    }

    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        debug!("engine worker started");
        while let Some(request) = rx.blocking_recv() {
            if matches!(request, EngineRequest::Shutdown) {
                break;
            }
            self.set_busy(true);
            self.serve(request);
            self.status.requests_served += 1;
            self.set_busy(false);
        }
        if let Some(index) = self.index.take() {
            if let Err(e) = index.close() {
                warn!(error = %e, "closing index on shutdown failed");
            }
        }
        debug!("engine worker stopped");
    }

    fn set_busy(&mut self, busy: bool) {
        self.status.busy = busy;
        self.status.connected = self.index.is_some();
        let _ = self.status_tx.send(self.status.clone());
    }

    fn connected(&mut self) -> Result<&mut DedupIndex> {
        self.index
            .as_mut()
            .ok_or_else(|| DedupError::IndexUnavailable("not connected".to_string()))
    }

    fn serve(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::Connect { params, reply } => {
                let _ = reply.send(self.connect(params));
            }
            EngineRequest::Segment {
                request,
                cancel,
                reply,
            } => {
                let out = self.segment(&request, cancel);
                let _ = reply.send(out);
            }
            EngineRequest::Recover {
                request,
                cancel,
                reply,
            } => {
                let out = self.recover(&request, cancel);
                let _ = reply.send(out);
            }
            EngineRequest::Benchmark {
                plan,
                cancel,
                reply,
            } => {
                let ctx = self.ctx.clone().with_cancel(cancel);
                let out = self
                    .connected()
                    .and_then(|index| run_benchmark(index, &plan, &ctx));
                let _ = reply.send(out);
            }
            EngineRequest::DropNamespace { namespace, reply } => {
                let out = self.connected().and_then(|index| index.drop_namespace(&namespace));
                let _ = reply.send(out);
            }
            EngineRequest::RowCount { namespace, reply } => {
                let out = self.connected().and_then(|index| index.row_count(&namespace));
                let _ = reply.send(out);
            }
            EngineRequest::ListNamespaces { reply } => {
                let out = self.connected().and_then(|index| index.list_namespaces());
                let _ = reply.send(out);
            }
            EngineRequest::Disconnect {
                drop_database,
                reply,
            } => {
                let _ = reply.send(self.disconnect(drop_database));
            }
            EngineRequest::Shutdown => {}
        }
    }

    fn connect(&mut self, params: ConnectionParams) -> Result<Vec<Namespace>> {
        if let Some(previous) = self.index.take() {
            info!(target = %previous.params().describe(), "replacing open connection");
            previous.close()?;
        }
        match DedupIndex::connect(&params) {
            Ok(index) => {
                let namespaces = index.list_namespaces()?;
                self.ctx.log(
                    LogLevel::Success,
                    format!("connected to {}", params.describe()),
                );
                self.index = Some(index);
                Ok(namespaces)
            }
            Err(e) => {
                self.ctx.log(
                    LogLevel::Error,
                    format!("connection to {} failed: {}", params.describe(), e),
                );
                Err(e)
            }
        }
    }

    fn segment(&mut self, request: &SegmentRequest, cancel: CancelFlag) -> Result<SegmentationStats> {
        let ctx = self.ctx.clone().with_cancel(cancel);
        let stats = run_segmentation(self.connected()?, request, &ctx)?;
        let result = RunResult::new(&request.source, request.algorithm, request.block_size)
            .with_trail(&request.trail)
            .with_segmentation(&stats);
        ctx.sink.emit(EngineEvent::RunResult(result));
        Ok(stats)
    }

    fn recover(&mut self, request: &RecoverRequest, cancel: CancelFlag) -> Result<RecoveryStats> {
        let ctx = self.ctx.clone().with_cancel(cancel);
        let stats = run_recovery(self.connected()?, request, &ctx)?;
        let result = RunResult::for_trail(&request.trail, request.algorithm, request.block_size)
            .with_recovery(&stats);
        ctx.sink.emit(EngineEvent::RunResult(result));
        Ok(stats)
    }

    fn disconnect(&mut self, drop_database: bool) -> Result<()> {
        let index = self
            .index
            .take()
            .ok_or_else(|| DedupError::IndexUnavailable("not connected".to_string()))?;
        let target = index.params().describe();
        if drop_database {
            index.drop_database()?;
            self.ctx
                .log(LogLevel::Info, format!("dropped database {}", target));
        } else {
            index.close()?;
            self.ctx
                .log(LogLevel::Info, format!("disconnected from {}", target));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::fingerprint::HashAlgorithm;

    fn memory_config() -> EngineConfig {
        EngineConfig {
            connection: ConnectionParams::memory(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        let handle = EngineWorker::start(&memory_config(), Arc::new(NullSink));
        let ns = Namespace::new(512, HashAlgorithm::Md5).unwrap();
        assert!(matches!(
            handle.row_count(ns).await,
            Err(DedupError::IndexUnavailable(_))
        ));
        assert!(matches!(
            handle.disconnect(false).await,
            Err(DedupError::IndexUnavailable(_))
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_segment_and_recover_through_worker() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = EngineWorker::start(&memory_config(), Arc::new(tx));
        assert!(handle.connect(ConnectionParams::memory()).await.unwrap().is_empty());

        let seg = handle
            .segment(SegmentRequest {
                source: source.clone(),
                trail: dir.path().join("a.hb"),
                block_size: 1000,
                algorithm: HashAlgorithm::Sha512,
                overwrite: false,
            })
            .await
            .unwrap();
        assert_eq!(seg.total_blocks, 5);

        let rec = handle
            .recover(RecoverRequest {
                trail: dir.path().join("a.hb"),
                output: dir.path().join("a.out"),
                block_size: 1000,
                algorithm: HashAlgorithm::Sha512,
                overwrite: false,
            })
            .await
            .unwrap();
        assert_eq!(rec.recovered, 5);
        assert_eq!(std::fs::read(dir.path().join("a.out")).unwrap(), data);

        let ns = Namespace::new(1000, HashAlgorithm::Sha512).unwrap();
        assert_eq!(handle.row_count(ns).await.unwrap(), seg.distinct);
        assert_eq!(handle.list_namespaces().await.unwrap(), vec![ns]);
        assert_eq!(handle.drop_namespace(ns).await.unwrap(), seg.distinct);
        assert!(handle.metrics().render_text().contains("dedupbench_runs_completed_total 2"));
        assert!(handle.status().requests_served >= 5);

        handle.disconnect(false).await.unwrap();
        handle.shutdown().await.unwrap();

        let mut results = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::RunResult(row) = ev {
                results.push(row);
            }
        }
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_path, source);
        assert_eq!(results[0].total_blocks, 5);
        assert!(results[1].source_path.as_os_str().is_empty());
        assert_eq!(results[1].trail_path, Some(dir.path().join("a.hb")));
        assert_eq!(results[1].recovered_blocks, 5);
    }

    #[tokio::test]
    async fn test_disconnect_can_drop_database() {
        let dir = tempfile::tempdir().unwrap();
        let params = ConnectionParams::wal(dir.path(), "scratch");
        let handle = EngineWorker::start(&EngineConfig::default(), Arc::new(NullSink));
        handle.connect(params.clone()).await.unwrap();
        assert!(DedupIndex::database_exists(&params));
        handle.disconnect(true).await.unwrap();
        assert!(!DedupIndex::database_exists(&params));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_cancel_does_not_abort_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("s");
        std::fs::write(&source, b"0123456789").unwrap();
        let handle = EngineWorker::start(&memory_config(), Arc::new(NullSink));
        handle.connect(ConnectionParams::memory()).await.unwrap();
        handle.cancel();
        let stats = handle
            .segment(SegmentRequest {
                source,
                trail: dir.path().join("s.hb"),
                block_size: 4,
                algorithm: HashAlgorithm::Md5,
                overwrite: false,
            })
            .await
            .unwrap();
        assert_eq!(stats.total_blocks, 3);
        handle.shutdown().await.unwrap();
    }

    /// Holds the worker at its first event until released.
    struct GateSink(std::sync::Mutex<Option<std::sync::mpsc::Receiver<()>>>);

    impl EventSink for GateSink {
        fn emit(&self, _event: EngineEvent) {
            let gate = self.0.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
        }
    }

    /// Poll `fut` once so its request is queued without waiting for the reply.
    async fn enqueue<F: std::future::Future>(fut: std::pin::Pin<&mut F>) {
        tokio::select! {
            biased;
            _ = fut => panic!("request answered while the worker was held"),
            _ = tokio::task::yield_now() => {}
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_queued_request() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("q.bin");
        std::fs::write(&source, vec![1u8; 4096]).unwrap();
        let request = SegmentRequest {
            source,
            trail: dir.path().join("q.hb"),
            block_size: 1024,
            algorithm: HashAlgorithm::Sha1,
            overwrite: true,
        };
        let (release, gate) = std::sync::mpsc::channel();
        let sink = GateSink(std::sync::Mutex::new(Some(gate)));
        let handle = EngineWorker::start(&memory_config(), Arc::new(sink));

        {
            // the worker blocks on the connect log line with the segment queued
            let connect = handle.connect(ConnectionParams::memory());
            tokio::pin!(connect);
            enqueue(connect.as_mut()).await;
            let queued = handle.segment(request.clone());
            tokio::pin!(queued);
            enqueue(queued.as_mut()).await;

            handle.cancel();
            release.send(()).unwrap();
            connect.await.unwrap();
            assert!(matches!(queued.await, Err(DedupError::Cancelled { blocks: 0 })));
        }

        let stats = handle.segment(request).await.unwrap();
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.repeats, 3);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let handle = EngineWorker::start(&memory_config(), Arc::new(NullSink));
        assert!(handle.is_running());
        let sender = handle.sender.clone();
        handle.shutdown().await.unwrap();
        assert!(sender.is_closed());
    }
}
