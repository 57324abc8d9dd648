use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use skiff_protocol::control::ControlPayload;
use skiff_protocol::transfer::{chunk_id, FileMetadata, Frame, TransferMessage};
use skiff_transfer::assembler::sanitize_filename;
use skiff_transfer::channel::{memory_channel_pair, DirectChannel, MemoryChannel};
use skiff_transfer::config::TransferConfig;
use skiff_transfer::events::{SessionState, TransferError, TransferEvent};
use skiff_transfer::hash::content_hash;
use skiff_transfer::receiver::spawn_receiver;
use skiff_transfer::relay::MemoryRelayStore;
use skiff_transfer::sender::{plan_batch, spawn_sender, FilePlan, OutgoingFile};
use skiff_transfer::session::{
    spawn_receiver_session, spawn_sender_session, ReceiverSessionOptions, SenderSessionOptions,
};
use tokio::sync::{mpsc, oneshot};

fn outgoing(name: &str, bytes: Vec<u8>) -> OutgoingFile {
    OutgoingFile {
        filename: name.to_string(),
        mime_type: "application/octet-stream".to_string(),
        bytes: Bytes::from(bytes),
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

/// Forward the sender's out-of-band control notices into the receiver's
/// batch slot, the way an embedding layer would over signaling.
fn wire_control(
    mut control_rx: mpsc::UnboundedReceiver<ControlPayload>,
    batch_tx: oneshot::Sender<Vec<FileMetadata>>,
) {
    tokio::spawn(async move {
        let mut batch_tx = Some(batch_tx);
        while let Some(payload) = control_rx.recv().await {
            if let ControlPayload::Batch { files } = payload {
                if let Some(tx) = batch_tx.take() {
                    let _ = tx.send(files);
                }
            }
        }
    });
}

struct SessionPair {
    sender_channel: Arc<MemoryChannel>,
    receiver_channel: Arc<MemoryChannel>,
    sender: (
        skiff_transfer::session::SessionHandle,
        mpsc::UnboundedReceiver<TransferEvent>,
        tokio::task::JoinHandle<Result<(), TransferError>>,
    ),
    receiver: (
        skiff_transfer::session::SessionHandle,
        mpsc::UnboundedReceiver<TransferEvent>,
        tokio::task::JoinHandle<Result<Vec<skiff_transfer::events::ReceivedFile>, TransferError>>,
    ),
}

fn start_session_pair(files: Vec<OutgoingFile>, config: TransferConfig) -> SessionPair {
    let (sender_channel, receiver_channel) = memory_channel_pair();
    let relay = Arc::new(MemoryRelayStore::new());
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (batch_tx, batch_rx) = oneshot::channel();
    wire_control(control_rx, batch_tx);

    let sender = spawn_sender_session(
        SenderSessionOptions {
            code: "A1B2C3".into(),
            channel: sender_channel.clone(),
            relay: relay.clone(),
            control: control_tx,
            config: config.clone(),
        },
        files,
    );
    let receiver = spawn_receiver_session(ReceiverSessionOptions {
        code: "A1B2C3".into(),
        channel: receiver_channel.clone(),
        relay,
        batch: batch_rx,
        config,
    });

    SessionPair {
        sender_channel,
        receiver_channel,
        sender,
        receiver,
    }
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn direct_transfer_delivers_every_file_intact() {
    let files = vec![
        outgoing("first.bin", patterned(40_000)),
        outgoing("second.bin", patterned(5)),
        outgoing("empty.bin", Vec::new()),
    ];
    let expected: Vec<Vec<u8>> = files.iter().map(|f| f.bytes.to_vec()).collect();

    let mut pair = start_session_pair(files, TransferConfig::default());
    tokio::time::sleep(Duration::from_millis(20)).await;
    pair.sender_channel.mark_open();
    pair.receiver_channel.mark_open();

    pair.sender.2.await.unwrap().unwrap();
    let received = pair.receiver.2.await.unwrap().unwrap();

    assert_eq!(received.len(), 3);
    for (file, expected) in received.iter().zip(expected.iter()) {
        assert_eq!(&file.bytes[..], &expected[..]);
        assert_eq!(
            file.metadata.content_hash,
            content_hash(expected),
            "announced hash must match reassembled bytes"
        );
    }

    let sender_events = drain_events(&mut pair.sender.1);
    assert!(sender_events.contains(&TransferEvent::StateChanged(SessionState::Done)));
    assert!(sender_events.contains(&TransferEvent::Completed));
    // 40000 bytes at the 16 KiB default chunk size is exactly three chunks.
    assert!(sender_events.iter().any(|e| matches!(
        e,
        TransferEvent::FileProgress { total_chunks: 3, total: 40_000, .. }
    )));

    let receiver_events = drain_events(&mut pair.receiver.1);
    assert_eq!(
        receiver_events
            .iter()
            .filter(|e| matches!(e, TransferEvent::FileCompleted(_)))
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn unopened_channel_falls_back_to_relay() {
    let files = vec![
        outgoing("report.pdf", patterned(70_000)),
        outgoing("notes.txt", b"short".to_vec()),
    ];
    let expected: Vec<Vec<u8>> = files.iter().map(|f| f.bytes.to_vec()).collect();

    // Nobody ever marks the channels open: the 6s deadline decides.
    let mut pair = start_session_pair(files, TransferConfig::default());

    pair.sender.2.await.unwrap().unwrap();
    let received = pair.receiver.2.await.unwrap().unwrap();

    assert_eq!(received.len(), 2);
    for (file, expected) in received.iter().zip(expected.iter()) {
        assert_eq!(&file.bytes[..], &expected[..]);
    }

    let sender_events = drain_events(&mut pair.sender.1);
    assert!(sender_events
        .iter()
        .any(|e| matches!(e, TransferEvent::FallbackEngaged { .. })));
    assert!(sender_events.contains(&TransferEvent::Completed));

    // A direct channel opening after the switch changes nothing.
    pair.sender_channel.mark_open();
    pair.receiver_channel.mark_open();
    let late_events = drain_events(&mut pair.sender.1);
    assert!(late_events.is_empty());
}

#[tokio::test(start_paused = true)]
async fn channel_failure_after_open_recovers_via_relay() {
    let files = vec![outgoing("payload.bin", patterned(200_000))];
    let expected = files[0].bytes.to_vec();

    let mut pair = start_session_pair(files, TransferConfig::default());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The channel opens and immediately dies: both arbiters observe the open
    // followed by the failure, and the session must divert to the relay.
    pair.sender_channel.mark_open();
    pair.receiver_channel.mark_open();
    pair.sender_channel.inject_error("transport torn down");
    pair.receiver_channel.inject_error("transport torn down");

    pair.sender.2.await.unwrap().unwrap();
    let received = pair.receiver.2.await.unwrap().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0].bytes[..], &expected[..]);

    let sender_events = drain_events(&mut pair.sender.1);
    assert!(sender_events
        .iter()
        .any(|e| matches!(e, TransferEvent::FallbackEngaged { .. })));
    let receiver_events = drain_events(&mut pair.receiver.1);
    assert!(receiver_events
        .iter()
        .any(|e| matches!(e, TransferEvent::FallbackEngaged { .. })));
}

#[tokio::test]
async fn sender_respects_the_ack_window() {
    let config = TransferConfig {
        chunk_size: 16,
        window: 4,
        ..TransferConfig::default()
    };
    let plans = plan_batch(vec![outgoing("windowed.bin", patterned(160))], &config);
    assert_eq!(plans[0].meta.total_chunks, 10);

    let (sender_channel, peer) = memory_channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_handle, task) = spawn_sender(sender_channel, plans, config.clone(), events_tx);

    let mut outstanding: Vec<String> = Vec::new();
    let mut max_outstanding = 0usize;
    let mut complete = false;
    while !complete {
        let frame = tokio::time::timeout(Duration::from_millis(200), peer.recv()).await;
        match frame {
            Ok(Some(Frame::Text(text))) => match TransferMessage::decode(&text).unwrap() {
                TransferMessage::ChunkHeader { chunk_id, .. } => {
                    outstanding.push(chunk_id);
                    max_outstanding = max_outstanding.max(outstanding.len());
                    assert!(
                        outstanding.len() <= config.window,
                        "sender exceeded the ack window"
                    );
                }
                TransferMessage::TransferComplete { .. } => complete = true,
                _ => {}
            },
            Ok(Some(Frame::Binary(_))) => {}
            Ok(None) => panic!("channel closed unexpectedly"),
            // Sender has gone quiet: it is blocked on the window. Ack.
            Err(_) => {
                for id in outstanding.drain(..) {
                    let ack = TransferMessage::ChunkAck {
                        chunk_id: id,
                        timestamp: 0,
                    };
                    peer.send(ack.encode().unwrap()).await.unwrap();
                }
            }
        }
    }
    assert_eq!(max_outstanding, config.window);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_chunk_exhausts_retries_and_names_itself() {
    let config = TransferConfig::default();
    let bytes = Bytes::from(patterned(40_000));
    let plan = FilePlan {
        meta: FileMetadata {
            file_id: "f1".into(),
            filename: "f1.bin".into(),
            size: bytes.len() as u64,
            mime_type: "application/octet-stream".into(),
            chunk_size: config.chunk_size,
            total_chunks: 3,
            content_hash: content_hash(&bytes),
            file_index: 0,
        },
        bytes,
    };

    let (sender_channel, peer) = memory_channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_handle, task) = spawn_sender(sender_channel, vec![plan], config, events_tx);

    // Ack every chunk except index 2, which is left to time out repeatedly.
    tokio::spawn(async move {
        while let Some(frame) = peer.recv().await {
            let Frame::Text(text) = frame else { continue };
            if let Ok(TransferMessage::ChunkHeader {
                chunk_index,
                chunk_id,
                ..
            }) = TransferMessage::decode(&text)
            {
                if chunk_index != 2 {
                    let ack = TransferMessage::ChunkAck {
                        chunk_id,
                        timestamp: 0,
                    };
                    let _ = peer.send(ack.encode().unwrap()).await;
                }
            }
        }
    });

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        TransferError::RetryExhausted {
            file_id: "f1".into(),
            chunk_index: 2,
            retries: 3,
        }
    );
}

#[tokio::test]
async fn pause_suspends_admission_and_resume_continues() {
    let config = TransferConfig {
        chunk_size: 16,
        window: 2,
        ..TransferConfig::default()
    };
    let plans = plan_batch(vec![outgoing("paused.bin", patterned(160))], &config);

    let (sender_channel, peer) = memory_channel_pair();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (handle, task) = spawn_sender(sender_channel, plans, config, events_tx);
    handle.pause();

    // Drain whatever was admitted before the pause landed (at most the
    // window), acking it so the window cannot be what blocks the sender.
    let mut early_headers: Vec<String> = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), peer.recv()).await {
            Ok(Some(Frame::Text(text))) => {
                if let Ok(TransferMessage::ChunkHeader { chunk_id, .. }) =
                    TransferMessage::decode(&text)
                {
                    early_headers.push(chunk_id);
                }
            }
            Ok(Some(Frame::Binary(_))) => {}
            Ok(None) => panic!("channel closed unexpectedly"),
            Err(_) => break,
        }
    }
    assert!(early_headers.len() <= 2);
    let mut acked = early_headers.len();
    for chunk_id in early_headers.drain(..) {
        let ack = TransferMessage::ChunkAck {
            chunk_id,
            timestamp: 0,
        };
        peer.send(ack.encode().unwrap()).await.unwrap();
    }

    // Window is free, yet nothing flows: the pause alone gates admission.
    let quiet = tokio::time::timeout(Duration::from_millis(150), peer.recv()).await;
    assert!(quiet.is_err(), "paused sender must not admit chunks");

    handle.resume();
    let total_acked = loop {
        match peer.recv().await {
            Some(Frame::Text(text)) => match TransferMessage::decode(&text).unwrap() {
                TransferMessage::ChunkHeader { chunk_id, .. } => {
                    let ack = TransferMessage::ChunkAck {
                        chunk_id,
                        timestamp: 0,
                    };
                    peer.send(ack.encode().unwrap()).await.unwrap();
                    acked += 1;
                }
                TransferMessage::TransferComplete { .. } => break acked,
                _ => {}
            },
            Some(Frame::Binary(_)) => {}
            None => panic!("channel closed unexpectedly"),
        }
    };
    assert_eq!(total_acked, 10);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_is_terminal() {
    let files = vec![outgoing("cancelled.bin", patterned(100_000))];
    let mut pair = start_session_pair(files, TransferConfig::default());
    tokio::time::sleep(Duration::from_millis(20)).await;
    pair.sender_channel.mark_open();
    pair.receiver_channel.mark_open();

    pair.sender.0.cancel();
    let err = pair.sender.2.await.unwrap().unwrap_err();
    assert_eq!(err, TransferError::Cancelled);

    let events = drain_events(&mut pair.sender.1);
    assert!(!events.contains(&TransferEvent::Completed));

    pair.receiver.0.cancel();
    let err = pair.receiver.2.await.unwrap().unwrap_err();
    assert_eq!(err, TransferError::Cancelled);
}

#[tokio::test]
async fn corrupt_announcement_fails_one_file_and_spares_the_batch() {
    let (sender_channel, receiver_channel) = memory_channel_pair();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_handle, task) = spawn_receiver(receiver_channel, TransferConfig::default(), events_tx);

    let good = patterned(600);
    let bad = patterned(300);

    let good_meta = FileMetadata {
        file_id: "good".into(),
        filename: "good.bin".into(),
        size: good.len() as u64,
        mime_type: "application/octet-stream".into(),
        chunk_size: 512,
        total_chunks: 2,
        content_hash: content_hash(&good),
        file_index: 0,
    };
    let bad_meta = FileMetadata {
        file_id: "bad".into(),
        filename: "bad.bin".into(),
        size: bad.len() as u64,
        chunk_size: 512,
        total_chunks: 1,
        // Announced hash does not match the bytes that will arrive.
        content_hash: content_hash(b"different content"),
        file_index: 1,
        ..good_meta.clone()
    };

    let send_text = |msg: TransferMessage| {
        let channel = sender_channel.clone();
        async move { channel.send(msg.encode().unwrap()).await.unwrap() }
    };

    send_text(TransferMessage::FileMetadata(good_meta.clone())).await;
    send_text(TransferMessage::FileMetadata(bad_meta.clone())).await;

    for (meta, bytes) in [(&good_meta, &good), (&bad_meta, &bad)] {
        for index in 0..meta.total_chunks {
            let (start, end) = meta.chunk_span(index);
            let payload = Bytes::copy_from_slice(&bytes[start as usize..end as usize]);
            send_text(TransferMessage::ChunkHeader {
                file_id: meta.file_id.clone(),
                chunk_index: index,
                chunk_id: chunk_id(&meta.file_id, index),
                size: payload.len() as u32,
            })
            .await;
            sender_channel.send(Frame::Binary(payload)).await.unwrap();
        }
    }
    send_text(TransferMessage::TransferComplete { timestamp: 0 }).await;

    let received = task.await.unwrap().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].metadata.file_id, "good");
    assert_eq!(&received[0].bytes[..], &good[..]);

    let mut saw_integrity_failure = false;
    while let Ok(event) = events_rx.try_recv() {
        if let TransferEvent::FileFailed { file_id, error } = event {
            assert_eq!(file_id, "bad");
            assert!(matches!(error, TransferError::IntegrityFailure { .. }));
            saw_integrity_failure = true;
        }
    }
    assert!(saw_integrity_failure);
}

#[tokio::test]
async fn chunk_for_unannounced_file_is_rejected_not_ignored() {
    let (sender_channel, receiver_channel) = memory_channel_pair();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_handle, task) = spawn_receiver(receiver_channel, TransferConfig::default(), events_tx);

    sender_channel
        .send(
            TransferMessage::ChunkHeader {
                file_id: "phantom".into(),
                chunk_index: 0,
                chunk_id: "phantom_0".into(),
                size: 3,
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();
    sender_channel
        .send(Frame::Binary(Bytes::from_static(b"abc")))
        .await
        .unwrap();
    sender_channel
        .send(
            TransferMessage::TransferComplete { timestamp: 0 }
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();

    let received = task.await.unwrap().unwrap();
    assert!(received.is_empty());

    let mut saw_desync = false;
    while let Ok(event) = events_rx.try_recv() {
        if let TransferEvent::FileFailed { file_id, error } = event {
            assert_eq!(file_id, "phantom");
            assert!(matches!(error, TransferError::Desync(_)));
            saw_desync = true;
        }
    }
    assert!(saw_desync);
}

#[test]
fn received_filenames_come_out_sanitized() {
    assert_eq!(sanitize_filename("weird name?.png"), "weird_name_.png");
}
