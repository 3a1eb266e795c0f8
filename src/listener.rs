//! Background change listener.
//!
//! A single long-lived task per engine instance consumes the change
//! stream of the target collection and folds each event into the
//! `modified` store, coalescing repeated operations on the same document.
//! The resume token is persisted on the metadata singleton after every
//! drained batch, so a restarted listener continues where the previous
//! one stopped.
//!
//! Versioning operations synchronize with the listener through a fence: a
//! sentinel write under a reserved id, awaited on an in-memory watermark.
//! Once the watermark carries the sentinel, every write that completed
//! before the fence has been folded into `modified`.

use std::time::Duration;

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::{Collection, Database};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{MetadataStore, ModifiedStore, TrackerOp};

/// Reserved id prefix for fence sentinels.
pub const FENCE_PREFIX: &str = "__vc_fence/";

/// Default bound on waiting for the listener to reach a fence.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on waiting for the listener to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Transient stream failures are retried this many times with doubling
/// backoff before the listener reports itself dead.
const MAX_STREAM_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

/// Handle to a running listener task.
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    watermark: watch::Receiver<Option<String>>,
    status: watch::Receiver<ListenerStatus>,
    target: Collection<Document>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Block the current operation until the listener has drained every
    /// event written before this call.
    pub async fn fence(&self, timeout: Duration) -> Result<()> {
        self.check_status()?;

        let marker = format!("{FENCE_PREFIX}{}", Uuid::new_v4());
        self.target.insert_one(doc! {"_id": &marker}).await?;
        self.target.delete_one(doc! {"_id": &marker}).await?;

        let mut watermark = self.watermark.clone();
        let wait = async {
            loop {
                if watermark.borrow_and_update().as_deref() == Some(marker.as_str()) {
                    return Ok(());
                }
                if watermark.changed().await.is_err() {
                    return Err(Error::OperationFailed(
                        "the change listener is no longer running".into(),
                    ));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.check_status()?;
                Err(Error::ListenerStalled(timeout))
            }
        }
    }

    fn check_status(&self) -> Result<()> {
        match &*self.status.borrow() {
            ListenerStatus::Failed(message) => Err(Error::OperationFailed(format!(
                "the change listener failed: {message}"
            ))),
            ListenerStatus::Stopped => Err(Error::OperationFailed(
                "the change listener has stopped".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Flip the shutdown flag and wait for the task to persist its resume
    /// token and exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the listener for a target collection and wait until it is live.
pub async fn start(database: Database, target_name: String) -> Result<ListenerHandle> {
    let target: Collection<Document> = database.collection(&target_name);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (watermark_tx, watermark_rx) = watch::channel(None);
    let (status_tx, mut status_rx) = watch::channel(ListenerStatus::Starting);

    let worker = ListenerWorker {
        target: target.clone(),
        modified: ModifiedStore::new(&database, &target_name),
        metadata: MetadataStore::new(&database, &target_name),
        shutdown: shutdown_rx,
        watermark: watermark_tx,
        status: status_tx,
    };
    let task = tokio::spawn(worker.run());

    // Writes to the target made before the stream is open would be lost;
    // hold the caller until the listener is actually consuming.
    let startup = async {
        loop {
            let live = !matches!(&*status_rx.borrow_and_update(), ListenerStatus::Starting);
            if live {
                break;
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    };
    if tokio::time::timeout(STARTUP_TIMEOUT, startup).await.is_err() {
        warn!(collection = %target_name, "listener startup timed out");
    }

    let handle = ListenerHandle {
        shutdown: shutdown_tx,
        watermark: watermark_rx,
        status: status_rx,
        target,
        task,
    };
    handle.check_status()?;
    Ok(handle)
}

struct ListenerWorker {
    target: Collection<Document>,
    modified: ModifiedStore,
    metadata: MetadataStore,
    shutdown: watch::Receiver<bool>,
    watermark: watch::Sender<Option<String>>,
    status: watch::Sender<ListenerStatus>,
}

type EventStream = ChangeStream<ChangeStreamEvent<Document>>;

impl ListenerWorker {
    async fn run(mut self) {
        let mut retries = 0_u32;
        let mut backoff = Duration::from_millis(250);

        loop {
            match self.open_stream().await {
                Ok(stream) => {
                    let _ = self.status.send(ListenerStatus::Running);
                    info!(collection = %self.target.name(), "change listener running");
                    match self.consume(stream).await {
                        Ok(()) => {
                            let _ = self.status.send(ListenerStatus::Stopped);
                            return;
                        }
                        Err(err) => {
                            warn!(error = %err, "change stream interrupted");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to open change stream");
                }
            }

            retries += 1;
            if retries > MAX_STREAM_RETRIES {
                let _ = self.status.send(ListenerStatus::Failed(
                    "change stream failed repeatedly".into(),
                ));
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(8));
        }
    }

    async fn open_stream(&self) -> Result<EventStream> {
        let token = self.metadata.load().await.ok().and_then(|m| m.resume_token);
        let stream = match token {
            Some(token) => {
                let token = bson::from_bson(token)?;
                self.target.watch().start_after(token).await?
            }
            None => {
                let stream = self.target.watch().await?;
                // Persist the opening token so a later listener can cover
                // the gap between this process and the next.
                if let Some(token) = stream.resume_token() {
                    self.metadata.save_resume_token(&bson::to_bson(&token)?).await?;
                }
                stream
            }
        };
        Ok(stream)
    }

    async fn consume(&mut self, mut stream: EventStream) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                self.persist_token(stream.resume_token()).await;
                return Ok(());
            }

            let event = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        self.persist_token(stream.resume_token()).await;
                        return Ok(());
                    }
                    continue;
                }
                event = stream.try_next() => event?,
            };
            let Some(event) = event else {
                return Err(Error::OperationFailed("change stream closed".into()));
            };

            self.handle_event(&event).await?;

            // Drain whatever else is already buffered, then persist the
            // token once per batch.
            while let Some(event) = stream.next_if_any().await? {
                self.handle_event(&event).await?;
            }
            self.persist_token(stream.resume_token()).await;
        }
    }

    async fn handle_event(&self, event: &ChangeStreamEvent<Document>) -> Result<()> {
        let op = match event.operation_type {
            OperationType::Insert => TrackerOp::Insert,
            OperationType::Update | OperationType::Replace => TrackerOp::Update,
            OperationType::Delete => TrackerOp::Delete,
            OperationType::Invalidate | OperationType::Drop | OperationType::DropDatabase => {
                return Err(Error::OperationFailed(
                    "the target collection went away under the listener".into(),
                ));
            }
            _ => return Ok(()),
        };

        let Some(id) = event
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id").cloned())
        else {
            return Ok(());
        };

        // Fence sentinels only advance the watermark.
        if let Bson::String(raw) = &id {
            if raw.starts_with(FENCE_PREFIX) {
                if op != TrackerOp::Delete {
                    let _ = self.watermark.send(Some(raw.clone()));
                }
                return Ok(());
            }
        }

        debug!(document_id = %id, ?op, "tracking change");
        let tracked = self.modified.record_event(&id, op, None).await?;
        if tracked {
            self.metadata.set_changed(true).await?;
        }
        Ok(())
    }

    async fn persist_token(&self, token: Option<ResumeToken>) {
        let Some(token) = token else {
            return;
        };
        match bson::to_bson(&token) {
            Ok(token) => {
                if let Err(err) = self.metadata.save_resume_token(&token).await {
                    warn!(error = %err, "failed to persist resume token");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode resume token"),
        }
    }
}
