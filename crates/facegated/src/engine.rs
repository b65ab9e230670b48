use facegate_core::pipeline::{self, AnalysisParams, SearchParams};
use facegate_core::{
    AnalysisResult, FlattenResult, PipelineError, RecognitionEngine, SearchResult, VerificationResult,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, PipelineError>>;

/// Jobs sent from request handlers to the engine thread.
enum EngineRequest {
    Verify {
        images: [PathBuf; 2],
        reply: Reply<VerificationResult>,
    },
    Analyze {
        image: PathBuf,
        params: AnalysisParams,
        reply: Reply<AnalysisResult>,
    },
    Search {
        gallery: PathBuf,
        probe: PathBuf,
        params: SearchParams,
        reply: Reply<SearchResult>,
    },
    Flatten {
        image: PathBuf,
        reply: Reply<FlattenResult>,
    },
}

/// Handle to the engine thread. Clones share one queue.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    pub async fn verify(&self, images: [PathBuf; 2]) -> Result<VerificationResult, PipelineError> {
        self.submit(|reply| EngineRequest::Verify { images, reply }).await
    }

    pub async fn analyze(&self, image: PathBuf, params: AnalysisParams) -> Result<AnalysisResult, PipelineError> {
        self.submit(|reply| EngineRequest::Analyze { image, params, reply })
            .await
    }

    pub async fn search(
        &self,
        gallery: PathBuf,
        probe: PathBuf,
        params: SearchParams,
    ) -> Result<SearchResult, PipelineError> {
        self.submit(|reply| EngineRequest::Search {
            gallery,
            probe,
            params,
            reply,
        })
        .await
    }

    pub async fn flatten(&self, image: PathBuf) -> Result<FlattenResult, PipelineError> {
        self.submit(|reply| EngineRequest::Flatten { image, reply }).await
    }

    /// Queue a job and wait for its answer. Waiting for a queue slot counts
    /// against the same timeout as the job itself.
    async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, PipelineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = make(reply_tx);

        let exchange = async {
            self.tx.send(request).await.map_err(|_| engine_gone())?;
            reply_rx.await.map_err(|_| engine_gone())?
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "engine job timed out");
                Err(PipelineError::EngineTimeout(self.timeout))
            }
        }
    }
}

fn engine_gone() -> PipelineError {
    PipelineError::EngineFatal("engine thread exited".into())
}

/// Owner of the engine thread. Joining waits for the queue to drain and the
/// engine to be finalized.
pub struct EngineWorker {
    thread: JoinHandle<()>,
}

impl EngineWorker {
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("engine thread panicked outside a job");
        }
    }
}

/// Move `engine` onto a dedicated OS thread and return a handle to it.
///
/// Every engine call in the process goes through this thread, one job at a
/// time. The loop ends when the last handle is dropped; the engine is then
/// finalized exactly once.
pub fn spawn_engine(
    mut engine: Box<dyn RecognitionEngine>,
    queue_depth: usize,
    timeout: Duration,
) -> std::io::Result<(EngineHandle, EngineWorker)> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    let thread = std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!(engine = engine.name(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                run(engine.as_mut(), req);
            }

            let ledger = engine.ledger();
            if !ledger.is_quiescent() {
                tracing::warn!(
                    images = ledger.live_images(),
                    templates = ledger.live_templates(),
                    "engine resources still live at shutdown"
                );
            }
            match engine.finalize() {
                Ok(()) => tracing::info!("engine finalized"),
                Err(err) => tracing::error!(error = %err, "engine finalize failed"),
            }
        })?;

    Ok((EngineHandle { tx, timeout }, EngineWorker { thread }))
}

impl EngineRequest {
    fn kind(&self) -> &'static str {
        match self {
            EngineRequest::Verify { .. } => "verify",
            EngineRequest::Analyze { .. } => "analyze",
            EngineRequest::Search { .. } => "search",
            EngineRequest::Flatten { .. } => "flatten",
        }
    }

    /// The caller stopped waiting, usually after its timeout fired.
    fn is_abandoned(&self) -> bool {
        match self {
            EngineRequest::Verify { reply, .. } => reply.is_closed(),
            EngineRequest::Analyze { reply, .. } => reply.is_closed(),
            EngineRequest::Search { reply, .. } => reply.is_closed(),
            EngineRequest::Flatten { reply, .. } => reply.is_closed(),
        }
    }
}

fn run(engine: &mut dyn RecognitionEngine, req: EngineRequest) {
    if req.is_abandoned() {
        tracing::debug!(job = req.kind(), "skipping job nobody is waiting for");
        return;
    }
    match req {
        EngineRequest::Verify { images, reply } => {
            let result = guarded(|| {
                pipeline::verify(&mut *engine, [images[0].as_path(), images[1].as_path()])
            });
            let _ = reply.send(result);
        }
        EngineRequest::Analyze { image, params, reply } => {
            let result = guarded(|| pipeline::analyze(&mut *engine, &image, &params));
            let _ = reply.send(result);
        }
        EngineRequest::Search {
            gallery,
            probe,
            params,
            reply,
        } => {
            let result = guarded(|| pipeline::search(&mut *engine, &gallery, &probe, &params));
            let _ = reply.send(result);
        }
        EngineRequest::Flatten { image, reply } => {
            let result = guarded(|| pipeline::flatten(&mut *engine, &image));
            let _ = reply.send(result);
        }
    }
}

/// Run one job, turning a panic into `EngineFatal` so the thread survives.
fn guarded<T>(job: impl FnOnce() -> Result<T, PipelineError>) -> Result<T, PipelineError> {
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(%message, "engine job panicked");
        Err(PipelineError::EngineFatal(format!("engine panicked: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
