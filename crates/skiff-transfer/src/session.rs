use std::sync::Arc;

use skiff_protocol::control::ControlPayload;
use skiff_protocol::transfer::FileMetadata;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::DirectChannel;
use crate::config::TransferConfig;
use crate::events::{ReceivedFile, TransferError, TransferEvent};
use crate::fallback::{self, TransferPath};
use crate::receiver::spawn_receiver;
use crate::relay::{relay_download, relay_upload, RelayStore};
use crate::sender::{plan_batch, spawn_sender, OutgoingFile, SenderCommand};

/// Control surface for a running transfer session, either role. Pause and
/// resume only affect chunk admission on the direct path.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SenderCommand>,
}

impl SessionHandle {
    pub fn pause(&self) {
        let _ = self.commands.send(SenderCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(SenderCommand::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(SenderCommand::Cancel);
    }
}

pub struct SenderSessionOptions {
    /// Room code; doubles as the relay batch identity.
    pub code: String,
    pub channel: Arc<dyn DirectChannel>,
    pub relay: Arc<dyn RelayStore>,
    /// Out-of-band control notices (batch summary, fallback notice), to be
    /// delivered to the other peer over signaling by the embedding layer.
    pub control: mpsc::UnboundedSender<ControlPayload>,
    pub config: TransferConfig,
}

pub struct ReceiverSessionOptions {
    pub code: String,
    pub channel: Arc<dyn DirectChannel>,
    pub relay: Arc<dyn RelayStore>,
    /// Fulfilled by the embedding layer when the batch summary control
    /// message arrives over signaling.
    pub batch: oneshot::Receiver<Vec<FileMetadata>>,
    pub config: TransferConfig,
}

pub fn spawn_sender_session(
    options: SenderSessionOptions,
    files: Vec<OutgoingFile>,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<TransferEvent>,
    JoinHandle<Result<(), TransferError>>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_sender_session(options, files, command_rx, event_tx));
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

pub fn spawn_receiver_session(
    options: ReceiverSessionOptions,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<TransferEvent>,
    JoinHandle<Result<Vec<ReceivedFile>, TransferError>>,
) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_receiver_session(options, command_rx, event_tx));
    (
        SessionHandle {
            commands: command_tx,
        },
        event_rx,
        task,
    )
}

/// Wait for the arbiter's first decision, still honoring cancellation.
async fn await_decision(
    path: &mut watch::Receiver<TransferPath>,
    commands: &mut mpsc::UnboundedReceiver<SenderCommand>,
) -> Result<TransferPath, TransferError> {
    loop {
        let current = *path.borrow();
        if current != TransferPath::AttemptingDirect {
            return Ok(current);
        }
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(SenderCommand::Cancel) | None => return Err(TransferError::Cancelled),
                Some(_) => {}
            },
            changed = path.changed() => {
                if changed.is_err() {
                    return Err(TransferError::Channel("fallback arbiter stopped".into()));
                }
            }
        }
    }
}

async fn run_sender_session(
    options: SenderSessionOptions,
    files: Vec<OutgoingFile>,
    mut commands: mpsc::UnboundedReceiver<SenderCommand>,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> Result<(), TransferError> {
    let SenderSessionOptions {
        code,
        channel,
        relay,
        control,
        config,
    } = options;

    let plans = plan_batch(files, &config);

    // Announce the batch over signaling up front: identities and hashes are
    // fixed now, so the receiver can verify uniformly on either path.
    let summary: Vec<FileMetadata> = plans.iter().map(|p| p.meta.clone()).collect();
    let _ = control.send(ControlPayload::Batch { files: summary });

    let (mut path, arbiter) = fallback::drive(channel.events(), config.direct_timeout);
    let decision = await_decision(&mut path, &mut commands).await?;

    if decision == TransferPath::Direct {
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel();
        let (handle, mut task) = spawn_sender(channel.clone(), plans.clone(), config.clone(), inner_tx);

        let mut watching = true;
        let mut commands_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(SenderCommand::Pause) => handle.pause(),
                    Some(SenderCommand::Resume) => handle.resume(),
                    Some(SenderCommand::Cancel) => handle.cancel(),
                    None => {
                        commands_open = false;
                        handle.cancel();
                    }
                },
                Some(event) = inner_rx.recv() => {
                    let _ = events.send(event);
                }
                changed = path.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *path.borrow() == TransferPath::Relay {
                        watching = false;
                        handle.cancel();
                    }
                }
                result = &mut task => break result,
            }
        };
        while let Ok(event) = inner_rx.try_recv() {
            let _ = events.send(event);
        }
        arbiter.abort();

        match outcome {
            Ok(Ok(())) => {
                let _ = events.send(TransferEvent::Completed);
                return Ok(());
            }
            Ok(Err(TransferError::Cancelled)) => {
                // Cancelled by the arbiter flipping to relay, or by the user.
                if *path.borrow() != TransferPath::Relay {
                    return Err(TransferError::Cancelled);
                }
            }
            Ok(Err(TransferError::Channel(reason))) => {
                warn!(%reason, "direct channel failed mid-transfer");
            }
            Ok(Err(err)) => {
                let _ = events.send(TransferEvent::Failed(err.clone()));
                return Err(err);
            }
            Err(join_err) => {
                let err = TransferError::Channel(format!("sender task failed: {join_err}"));
                let _ = events.send(TransferEvent::Failed(err.clone()));
                return Err(err);
            }
        }
    } else {
        arbiter.abort();
    }

    // Relay path: same batch, same identities, store-and-forward delivery.
    let reason = "direct channel unavailable".to_string();
    info!(%code, "engaging relay fallback for outgoing batch");
    let _ = events.send(TransferEvent::FallbackEngaged {
        reason: reason.clone(),
    });
    let _ = control.send(ControlPayload::Fallback { reason });

    let upload = relay_upload(relay.as_ref(), &code, &plans);
    tokio::pin!(upload);
    let result = loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(SenderCommand::Cancel) | None => return Err(TransferError::Cancelled),
                Some(_) => {}
            },
            result = &mut upload => break result,
        }
    };

    match result {
        Ok(_) => {
            let _ = events.send(TransferEvent::Completed);
            Ok(())
        }
        Err(err) => {
            // Both paths have now failed; this is terminal.
            let _ = events.send(TransferEvent::Failed(err.clone()));
            Err(err)
        }
    }
}

async fn run_receiver_session(
    options: ReceiverSessionOptions,
    mut commands: mpsc::UnboundedReceiver<SenderCommand>,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> Result<Vec<ReceivedFile>, TransferError> {
    let ReceiverSessionOptions {
        code,
        channel,
        relay,
        batch,
        config,
    } = options;

    let (mut path, arbiter) = fallback::drive(channel.events(), config.direct_timeout);
    let decision = await_decision(&mut path, &mut commands).await?;

    let mut received: Vec<ReceivedFile> = Vec::new();

    if decision == TransferPath::Direct {
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel();
        let (handle, mut task) = spawn_receiver(channel.clone(), config.clone(), inner_tx);

        let mut watching = true;
        let mut commands_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(SenderCommand::Cancel) => handle.cancel(),
                    Some(_) => {}
                    None => {
                        commands_open = false;
                        handle.cancel();
                    }
                },
                Some(event) = inner_rx.recv() => {
                    if let TransferEvent::FileCompleted(file) = &event {
                        received.push(file.clone());
                    }
                    let _ = events.send(event);
                }
                changed = path.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *path.borrow() == TransferPath::Relay {
                        watching = false;
                        handle.cancel();
                    }
                }
                result = &mut task => break result,
            }
        };
        while let Ok(event) = inner_rx.try_recv() {
            if let TransferEvent::FileCompleted(file) = &event {
                received.push(file.clone());
            }
            let _ = events.send(event);
        }
        arbiter.abort();

        match outcome {
            Ok(Ok(_)) => {
                let _ = events.send(TransferEvent::Completed);
                return Ok(received);
            }
            Ok(Err(TransferError::Cancelled)) => {
                if *path.borrow() != TransferPath::Relay {
                    return Err(TransferError::Cancelled);
                }
            }
            Ok(Err(TransferError::Channel(reason))) => {
                warn!(%reason, "direct channel failed mid-transfer");
            }
            Ok(Err(err)) => {
                let _ = events.send(TransferEvent::Failed(err.clone()));
                return Err(err);
            }
            Err(join_err) => {
                let err = TransferError::Channel(format!("receiver task failed: {join_err}"));
                let _ = events.send(TransferEvent::Failed(err.clone()));
                return Err(err);
            }
        }
    } else {
        arbiter.abort();
    }

    info!(%code, "engaging relay fallback for incoming batch");
    let _ = events.send(TransferEvent::FallbackEngaged {
        reason: "direct channel unavailable".into(),
    });

    // The batch summary travels over signaling, independent of the direct
    // channel, so it is still the source of truth for relay verification.
    let announced =
        match tokio::time::timeout(config.relay_deadline, batch).await {
            Ok(Ok(announced)) => announced,
            Ok(Err(_)) | Err(_) => {
                let err =
                    TransferError::Relay("batch summary never arrived over signaling".into());
                let _ = events.send(TransferEvent::Failed(err.clone()));
                return Err(err);
            }
        };

    let already: Vec<String> = received
        .iter()
        .map(|file| file.metadata.file_id.clone())
        .collect();
    let download = relay_download(relay.as_ref(), &code, &announced, &already, &config, &events);
    tokio::pin!(download);
    let result = loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(SenderCommand::Cancel) | None => return Err(TransferError::Cancelled),
                Some(_) => {}
            },
            result = &mut download => break result,
        }
    };

    match result {
        Ok(files) => {
            received.extend(files);
            let _ = events.send(TransferEvent::Completed);
            Ok(received)
        }
        Err(err) => {
            let _ = events.send(TransferEvent::Failed(err.clone()));
            Err(err)
        }
    }
}
