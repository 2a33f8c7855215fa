//! Single-owner task around [`SplitEnumerator`].
//!
//! Readers hold a cloneable [`EnumeratorHandle`]; every call becomes a command
//! on an mpsc channel answered over a oneshot. After each command the actor
//! publishes an [`EnumeratorStatus`] on a watch channel so waiting readers
//! and monitors see progress without polling.

use sync_core::{MetaRequestEvent, MetaResponseGroup, Offset, Result, SyncError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::checkpoint::EnumeratorCheckpoint;
use crate::state::{Assignment, EnumeratorStatus, SplitEnumerator};

const COMMAND_BUFFER: usize = 64;

enum Command {
    RequestSplit {
        reader_id: String,
        reply: oneshot::Sender<Result<Assignment>>,
    },
    ReportFinished {
        reader_id: String,
        split_id: String,
        low: Offset,
        high: Offset,
        reply: oneshot::Sender<Result<()>>,
    },
    CommitFinished {
        reader_id: String,
        split_id: String,
        low: Offset,
        high: Offset,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfirmDelivered {
        reader_id: String,
        split_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AbortDelivery {
        reader_id: String,
        split_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReturnSplits {
        reader_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    MetaRequest {
        request: MetaRequestEvent,
        reply: oneshot::Sender<Result<MetaResponseGroup>>,
    },
    SetStreamSuspended {
        suspended: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SnapshotState {
        reply: oneshot::Sender<EnumeratorCheckpoint>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct EnumeratorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<EnumeratorStatus>,
}

/// Move `enumerator` into its own task.
pub fn spawn_enumerator(enumerator: SplitEnumerator) -> (EnumeratorHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (status_tx, status_rx) = watch::channel(enumerator.status());
    let task = tokio::spawn(run(enumerator, commands_rx, status_tx));
    (
        EnumeratorHandle {
            commands: commands_tx,
            status: status_rx,
        },
        task,
    )
}

async fn run(
    mut enumerator: SplitEnumerator,
    mut commands: mpsc::Receiver<Command>,
    status: watch::Sender<EnumeratorStatus>,
) {
    info!("Split enumerator task started");
    // Publish before replying.
    while let Some(command) = commands.recv().await {
        match command {
            Command::RequestSplit { reader_id, reply } => {
                let result = enumerator.request_split(&reader_id);
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::ReportFinished {
                reader_id,
                split_id,
                low,
                high,
                reply,
            } => {
                let result = enumerator.report_finished(&reader_id, &split_id, low, high);
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::CommitFinished {
                reader_id,
                split_id,
                low,
                high,
                reply,
            } => {
                let result = enumerator.commit_finished(&reader_id, &split_id, low, high);
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::ConfirmDelivered {
                reader_id,
                split_id,
                reply,
            } => {
                let result = enumerator.confirm_delivered(&reader_id, &split_id);
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::AbortDelivery {
                reader_id,
                split_id,
                reply,
            } => {
                let result = enumerator.abort_delivery(&reader_id, &split_id);
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::ReturnSplits { reader_id, reply } => {
                let returned = enumerator.return_splits(&reader_id);
                publish(&status, &enumerator);
                let _ = reply.send(returned);
            }
            Command::MetaRequest { request, reply } => {
                let _ = reply.send(enumerator.handle_meta_request(&request));
            }
            Command::SetStreamSuspended { suspended, reply } => {
                let result = if suspended {
                    enumerator.suspend_stream()
                } else {
                    enumerator.resume_stream()
                };
                publish(&status, &enumerator);
                let _ = reply.send(result);
            }
            Command::SnapshotState { reply } => {
                let _ = reply.send(enumerator.snapshot_state());
            }
            Command::Close { reply } => {
                enumerator.close();
                publish(&status, &enumerator);
                let _ = reply.send(());
            }
        }
    }
    debug!("All enumerator handles dropped, stopping task");
}

fn publish(status: &watch::Sender<EnumeratorStatus>, enumerator: &SplitEnumerator) {
    status.send_if_modified(|current| {
        let next = enumerator.status();
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

impl EnumeratorHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)
    }

    pub async fn request_split(&self, reader_id: &str) -> Result<Assignment> {
        self.call(|reply| Command::RequestSplit {
            reader_id: reader_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn report_finished(
        &self,
        reader_id: &str,
        split_id: &str,
        low: Offset,
        high: Offset,
    ) -> Result<()> {
        self.call(|reply| Command::ReportFinished {
            reader_id: reader_id.to_string(),
            split_id: split_id.to_string(),
            low,
            high,
            reply,
        })
        .await?
    }

    /// Commit a finished split. Emit its records only once this returns `Ok`,
    /// then call [`confirm_delivered`](Self::confirm_delivered).
    pub async fn commit_finished(
        &self,
        reader_id: &str,
        split_id: &str,
        low: Offset,
        high: Offset,
    ) -> Result<()> {
        self.call(|reply| Command::CommitFinished {
            reader_id: reader_id.to_string(),
            split_id: split_id.to_string(),
            low,
            high,
            reply,
        })
        .await?
    }

    pub async fn confirm_delivered(&self, reader_id: &str, split_id: &str) -> Result<()> {
        self.call(|reply| Command::ConfirmDelivered {
            reader_id: reader_id.to_string(),
            split_id: split_id.to_string(),
            reply,
        })
        .await?
    }

    /// Emitting a committed split failed; put it back for another reader.
    pub async fn abort_delivery(&self, reader_id: &str, split_id: &str) -> Result<()> {
        self.call(|reply| Command::AbortDelivery {
            reader_id: reader_id.to_string(),
            split_id: split_id.to_string(),
            reply,
        })
        .await?
    }

    /// Failure-recovery hook: give back everything `reader_id` holds.
    pub async fn return_splits(&self, reader_id: &str) -> Result<Vec<String>> {
        self.call(|reply| Command::ReturnSplits {
            reader_id: reader_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn request_meta_group(&self, request: MetaRequestEvent) -> Result<MetaResponseGroup> {
        self.call(|reply| Command::MetaRequest { request, reply })
            .await?
    }

    pub async fn suspend_stream(&self) -> Result<()> {
        self.call(|reply| Command::SetStreamSuspended {
            suspended: true,
            reply,
        })
        .await?
    }

    pub async fn resume_stream(&self) -> Result<()> {
        self.call(|reply| Command::SetStreamSuspended {
            suspended: false,
            reply,
        })
        .await?
    }

    pub async fn snapshot_state(&self) -> Result<EnumeratorCheckpoint> {
        self.call(|reply| Command::SnapshotState { reply }).await
    }

    pub async fn close(&self) -> Result<()> {
        self.call(|reply| Command::Close { reply }).await
    }

    /// Latest published status. Eventually consistent.
    pub fn status(&self) -> EnumeratorStatus {
        self.status.borrow().clone()
    }

    pub fn remaining_splits(&self) -> usize {
        self.status.borrow().remaining_splits
    }

    /// A receiver that wakes on every state change.
    ///
    /// The current status counts as seen, so subscribe before a request whose
    /// answer you may want to wait on.
    pub fn subscribe(&self) -> watch::Receiver<EnumeratorStatus> {
        let mut receiver = self.status.clone();
        receiver.borrow_and_update();
        receiver
    }
}
