//! Application orchestrator: wires storage, the upload service, the
//! classifier and the WebSocket server together.

use std::sync::Arc;

use cropscan_classifier::{Classifier, CommandClassifier, Labels, UnconfiguredClassifier};
use cropscan_protocol::constants::MessageType;
use cropscan_protocol::envelope::Message;
use cropscan_protocol::messages::{
    CompleteUploadRequest, InitUploadResponse, UploadChunkRequest, UploadStatusRequest,
};
use cropscan_transfer::{
    ChunkStore, Claims, FsChunkStore, Reassembler, Sweeper, UploadError, UploadService,
};
use cropscan_upload_server::{
    BinaryChunk, Handler, HandlerFuture, Sender, ServerConfig, UploadServer,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::{ClassifierConfig, Config};

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Upload core --
    let classifier = build_classifier(&config.classifier)?;
    let service = build_service(&config, classifier)?;

    // -- Orphan sweep --
    let sweeper = match config.orphan_ttl() {
        Some(ttl) => {
            let sweeper = Sweeper::new(&config.chunk_dir, ttl).with_output_dir(&config.output_dir);
            tracing::info!(
                ttl_secs = ttl.as_secs(),
                interval_secs = config.sweep_interval_secs,
                "orphan sweep enabled"
            );
            Some(tokio::spawn(sweeper.run(config.sweep_interval(), cancel.clone())))
        }
        None => {
            tracing::warn!("orphan sweep disabled, abandoned chunks are kept forever");
            None
        }
    };

    // -- WS server --
    let server = UploadServer::new(
        ServerConfig { port: config.port },
        UploadHandler::new(service),
        cancel.clone(),
    );
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!(
        chunk_dir = %config.chunk_dir.display(),
        output_dir = %config.output_dir.display(),
        "upload service ready"
    );

    // -- Main loop: wait for shutdown --
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            None
        }
        result = &mut server_task => Some(result),
    };

    // -- Graceful shutdown --
    cancel.cancel();
    let result = match finished {
        Some(result) => result?,
        None => server_task.await?,
    };
    if let Some(task) = sweeper {
        let _ = task.await;
    }

    result.map_err(Into::into)
}

/// Opens the chunk and output directories and builds the upload service.
pub fn build_service<C: Classifier + ?Sized>(
    config: &Config,
    classifier: Arc<C>,
) -> anyhow::Result<UploadService<FsChunkStore, C>> {
    let store = FsChunkStore::open(&config.chunk_dir)?;
    let reassembler = Reassembler::new(&config.output_dir)?;
    let claims = Claims::new(&config.chunk_dir);

    Ok(UploadService::new(Arc::new(store), claims, reassembler, classifier)
        .with_io_timeout(config.request_timeout()))
}

/// Builds the configured classifier and logs whether it is usable.
pub fn build_classifier(config: &ClassifierConfig) -> anyhow::Result<Arc<dyn Classifier>> {
    let Some(program) = config.program.as_deref() else {
        tracing::warn!("no classifier program configured, completions will fail with a downstream error");
        return Ok(Arc::new(UnconfiguredClassifier));
    };

    let labels = Labels::load_or_default(config.labels_path.as_deref())?;
    let classifier = CommandClassifier::new(program, config.args.clone(), labels)
        .with_timeout(std::time::Duration::from_secs(config.timeout_secs));

    match classifier.resolve_program() {
        Some(path) => tracing::info!(program = %path.display(), "classifier ready"),
        None => tracing::warn!(program, "classifier program not found, completions will fail"),
    }
    Ok(Arc::new(classifier))
}

/// Maps upload protocol messages onto the [`UploadService`].
pub struct UploadHandler<S, C: ?Sized> {
    service: UploadService<S, C>,
}

impl<S: ChunkStore, C: Classifier + ?Sized> UploadHandler<S, C> {
    pub fn new(service: UploadService<S, C>) -> Self {
        Self { service }
    }
}

impl<S: ChunkStore, C: Classifier + ?Sized> Handler for UploadHandler<S, C> {
    fn on_init_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = self
                .service
                .initiate()
                .map(|session_id| InitUploadResponse { session_id });
            respond(&sender, &msg.id, MessageType::UploadInitResponse, result);
        })
    }

    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<UploadChunkRequest>(&msg) {
                Ok(req) => self.service.upload_chunk(req).await,
                Err(e) => Err(e),
            };
            respond(&sender, &msg.id, MessageType::UploadChunkResponse, result);
        })
    }

    fn on_binary_chunk(&self, sender: Sender, chunk: BinaryChunk) -> HandlerFuture<'_> {
        Box::pin(async move {
            let (id, req) = chunk.into_request();
            let result = self.service.upload_chunk(req).await;
            respond(&sender, &id, MessageType::UploadChunkResponse, result);
        })
    }

    fn on_complete_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<CompleteUploadRequest>(&msg) {
                Ok(req) => self.service.complete(req).await,
                Err(e) => Err(e),
            };
            respond(&sender, &msg.id, MessageType::UploadCompleteResponse, result);
        })
    }

    fn on_upload_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let result = match payload::<UploadStatusRequest>(&msg) {
                Ok(req) => self.service.status(req).await,
                Err(e) => Err(e),
            };
            respond(&sender, &msg.id, MessageType::UploadStatusResponse, result);
        })
    }
}

/// Decodes a request payload; an absent payload is an empty request.
fn payload<T: DeserializeOwned + Default>(msg: &Message) -> Result<T, UploadError> {
    msg.parse_payload::<T>()
        .map(Option::unwrap_or_default)
        .map_err(|e| UploadError::invalid("payload", e.to_string()))
}

/// Sends either the success payload or the error envelope for `result`.
fn respond<T: Serialize>(
    sender: &Sender,
    id: &str,
    msg_type: MessageType,
    result: Result<T, UploadError>,
) {
    let reply = match result {
        Ok(body) => match Message::new(id, msg_type, Some(&body)) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(id, "failed to encode response: {e}");
                Message::error(id, cropscan_protocol::ErrorKind::Processing, e.to_string())
            }
        },
        Err(err) => error_message(id, &err),
    };
    if sender.send_msg(reply).is_err() {
        tracing::warn!(id, "client gone before reply was sent");
    }
}

/// Wire form of an upload failure.
pub fn error_message(id: &str, err: &UploadError) -> Message {
    match err {
        UploadError::IncompleteUpload { missing } => Message::missing_chunks(id, missing.clone()),
        other => Message::error(id, other.kind(), other.to_string()),
    }
}
