//! End-to-end behavior of the messaging core over the in-memory stores.

use pulse_chat_core::model::{ChannelKind, DeliveryStatus, MemberRole, Message};
use pulse_chat_core::store::{ChatStore, InMemoryStore, MemoryBlobStore};
use pulse_chat_core::{
    AttachmentConfig, BroadcastReceipt, ChatError, ChatService, ConnectionHandle, ConnectionState,
    CoreConfig, Hub, HubConfig, ModerationAction, NewRule, SendMessage, UploadRequest,
};
use pulse_chat_protocol::{Event, EventKind};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct World {
    service: ChatService,
    store: Arc<InMemoryStore>,
    blobs: Arc<MemoryBlobStore>,
}

async fn world(config: CoreConfig) -> World {
    let store = Arc::new(InMemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let service = ChatService::open(store.clone(), blobs.clone(), config)
        .await
        .unwrap();
    World {
        service,
        store,
        blobs,
    }
}

async fn next_event(handle: &mut ConnectionHandle) -> Event {
    tokio::time::timeout(Duration::from_secs(5), handle.recv_event())
        .await
        .expect("timed out waiting for an event")
        .expect("connection closed")
        .expect("undecodable frame")
}

async fn next_of_kind(handle: &mut ConnectionHandle, kind: EventKind) -> Event {
    loop {
        let event = next_event(handle).await;
        if event.kind == kind {
            return event;
        }
    }
}

#[tokio::test]
async fn general_channel_round_trip() {
    let w = world(CoreConfig::default()).await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let general = w
        .service
        .create_channel("general", ChannelKind::Public, a)
        .await
        .unwrap();
    w.service
        .add_member(general.id, b, b, MemberRole::Member)
        .await
        .unwrap();

    let mut conn_a = w.service.connect(a).await.unwrap();
    let mut conn_b = w.service.connect(b).await.unwrap();

    let sent = w
        .service
        .send_message(SendMessage::new(general.id, a, "hello"))
        .await
        .unwrap();

    for conn in [&mut conn_a, &mut conn_b] {
        let event = next_of_kind(conn, EventKind::MessageCreated).await;
        assert_eq!(event.channel_id, general.id);
        let message: Message = event.payload_as().unwrap();
        assert_eq!(message.id, sent.id);
        assert_eq!(message.content, "hello");
    }

    let delivery = w.service.delivery();
    assert_eq!(delivery.get_unread_count(general.id, b).await.unwrap(), 1);
    w.service.mark_read(sent.id, b).await.unwrap();
    assert_eq!(delivery.get_unread_count(general.id, b).await.unwrap(), 0);

    let event = next_of_kind(&mut conn_a, EventKind::DeliveryStatus).await;
    assert_eq!(event.payload["user_id"], json!(b));
    assert_eq!(event.payload["status"], "read");
}

#[tokio::test]
async fn broadcast_order_matches_submission_order() {
    let w = world(CoreConfig::default()).await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("ordered", ChannelKind::Public, a)
        .await
        .unwrap();
    w.service
        .add_member(channel.id, b, b, MemberRole::Member)
        .await
        .unwrap();
    let mut conn_b = w.service.connect(b).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..200 {
        let message = w
            .service
            .send_message(SendMessage::new(channel.id, a, format!("message {}", i)))
            .await
            .unwrap();
        sent.push(message.id);
        // Keep the outbound queue drained as a live socket would
        let event = next_event(&mut conn_b).await;
        let received: Message = event.payload_as().unwrap();
        assert_eq!(received.id, message.id);
    }
    assert_eq!(sent.len(), 200);
}

#[tokio::test]
async fn full_outbound_queue_drops_only_that_connection() {
    let hub = Hub::with_config(HubConfig {
        dispatch_capacity: 2048,
        ..Default::default()
    });
    let channel = Uuid::new_v4();

    let mut fast: Vec<ConnectionHandle> = (0..99)
        .map(|_| hub.connect_with_capacity(Uuid::new_v4(), 1024))
        .collect();
    let mut slow = hub.connect_with_capacity(Uuid::new_v4(), 16);
    for handle in fast.iter().chain(std::iter::once(&slow)) {
        hub.register(handle.id(), &[channel]).unwrap();
    }

    // Broadcasting never waits on consumers
    for seq in 0..1000u64 {
        let receipt = hub.broadcast_to_channel(channel, EventKind::MessageCreated, &json!({ "seq": seq }));
        assert_eq!(receipt, BroadcastReceipt::Queued);
    }

    for handle in &mut fast {
        for expected in 0..1000u64 {
            let event = next_event(handle).await;
            assert_eq!(event.payload["seq"], expected);
        }
        assert_ne!(handle.state(), ConnectionState::Draining);
    }

    let mut kept = 0;
    while slow.recv().await.is_some() {
        kept += 1;
    }
    assert_eq!(kept, 16);
    assert_eq!(slow.state(), ConnectionState::Closed);

    let stats = hub.stats();
    assert_eq!(stats.dropped_connections, 1);
    assert_eq!(stats.connection_count, 99);
    assert_eq!(hub.listener_count(channel), 99);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_status_never_regresses() {
    let w = world(CoreConfig::default()).await;
    let author = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("busy", ChannelKind::Public, author)
        .await
        .unwrap();
    let readers: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
    for reader in &readers {
        w.service
            .add_member(channel.id, *reader, *reader, MemberRole::Member)
            .await
            .unwrap();
    }
    let message = w
        .service
        .send_message(SendMessage::new(channel.id, author, "ping"))
        .await
        .unwrap();

    let tracker = Arc::clone(w.service.delivery());
    let mut tasks = Vec::new();
    for (i, reader) in readers.iter().copied().enumerate() {
        let tracker = Arc::clone(&tracker);
        let message_id = message.id;
        tasks.push(tokio::spawn(async move {
            let mut observed = Vec::new();
            for round in 0..20 {
                if (i + round) % 3 == 0 {
                    tracker.mark_read(message_id, reader).await.unwrap();
                } else {
                    tracker.mark_delivered(message_id).await.unwrap();
                }
                let record = tracker.status(message_id, reader).await.unwrap().unwrap();
                observed.push(record.status);
            }
            observed
        }));
    }

    for task in tasks {
        let observed = task.await.unwrap();
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(observed.last(), Some(&DeliveryStatus::Read));
    }
    for reader in &readers {
        let record = tracker.status(message.id, *reader).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Read);
    }
}

#[tokio::test]
async fn mark_read_twice_equals_once() {
    let w = world(CoreConfig::default()).await;
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("general", ChannelKind::Public, a)
        .await
        .unwrap();
    w.service
        .add_member(channel.id, b, b, MemberRole::Member)
        .await
        .unwrap();
    let message = w
        .service
        .send_message(SendMessage::new(channel.id, a, "hello"))
        .await
        .unwrap();
    let mut watcher = w.service.connect(a).await.unwrap();

    let first = w.service.mark_read(message.id, b).await.unwrap();
    let second = w.service.mark_read(message.id, b).await.unwrap();
    assert_eq!(first, second);

    let event = next_event(&mut watcher).await;
    assert_eq!(event.kind, EventKind::DeliveryStatus);
    // Nothing else was broadcast for the second call
    tokio::task::yield_now().await;
    assert!(watcher.try_recv().is_err());
}

fn upload_config(max_size: u64) -> CoreConfig {
    CoreConfig {
        attachments: AttachmentConfig {
            max_size,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn message_with_file(w: &World) -> (Message, Uuid) {
    let author = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("files", ChannelKind::Public, author)
        .await
        .unwrap();
    let message = w
        .service
        .send_message(SendMessage::new(channel.id, author, "attached"))
        .await
        .unwrap();
    (message, author)
}

#[tokio::test]
async fn upload_one_byte_over_limit_is_rejected() {
    const MAX: u64 = 4096;
    let w = world(upload_config(MAX)).await;
    let (message, author) = message_with_file(&w).await;

    let result = w
        .service
        .attachments()
        .upload(
            UploadRequest {
                filename: "notes.txt".into(),
                content_type: "text/plain".into(),
                size: MAX + 1,
                message_id: message.id,
                channel_id: message.channel_id,
                uploader_id: author,
            },
            Cursor::new(vec![b'a'; (MAX + 1) as usize]),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(ChatError::AttachmentTooLarge { .. })));
    assert_eq!(w.blobs.store_calls(), 0);
    assert_eq!(w.store.attachment_count(), 0);
}

#[tokio::test]
async fn large_jpeg_is_rejected_before_storage() {
    let w = world(upload_config(2 * 1024 * 1024)).await;
    let (message, author) = message_with_file(&w).await;

    let result = w
        .service
        .attachments()
        .upload(
            UploadRequest {
                filename: "holiday.jpg".into(),
                content_type: "image/jpeg".into(),
                size: 5 * 1024 * 1024,
                message_id: message.id,
                channel_id: message.channel_id,
                uploader_id: author,
            },
            Cursor::new(vec![0u8; 5 * 1024 * 1024]),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(
        result,
        Err(ChatError::AttachmentTooLarge { size, max }) if size == 5 * 1024 * 1024 && max == 2 * 1024 * 1024
    ));
    assert_eq!(w.blobs.store_calls(), 0);
    assert_eq!(w.store.attachment_count(), 0);
    // The message is untouched
    assert!(w.store.get_message(message.id).await.unwrap().is_some());
}

#[tokio::test]
async fn upload_status_events_reach_the_channel() {
    let w = world(CoreConfig::default()).await;
    let (message, author) = message_with_file(&w).await;
    let mut conn = w.service.connect(author).await.unwrap();

    let attachment = w
        .service
        .attachments()
        .upload(
            UploadRequest {
                filename: "readme.txt".into(),
                content_type: "text/plain".into(),
                size: 5,
                message_id: message.id,
                channel_id: message.channel_id,
                uploader_id: author,
            },
            Cursor::new(b"hello".to_vec()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let uploading = next_of_kind(&mut conn, EventKind::AttachmentStatus).await;
    assert_eq!(uploading.payload["status"], "uploading");
    assert_eq!(uploading.payload["progress"], 0);

    let complete = next_of_kind(&mut conn, EventKind::AttachmentStatus).await;
    assert_eq!(complete.payload["status"], "complete");
    assert_eq!(complete.payload["progress"], 100);
    assert_eq!(complete.payload["attachment_id"], json!(attachment.id));
}

#[tokio::test]
async fn boundary_rule_blocks_only_whole_words() {
    let w = world(CoreConfig::default()).await;
    let author = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("general", ChannelKind::Public, author)
        .await
        .unwrap();
    w.service
        .moderation()
        .create_rule(NewRule::new("spam", "no spam", ModerationAction::Delete))
        .await
        .unwrap();

    let flagged = w
        .service
        .send_message(SendMessage::new(channel.id, author, "this is spam content"))
        .await;
    assert!(matches!(flagged, Err(ChatError::Moderated { .. })));

    let allowed = w
        .service
        .send_message(SendMessage::new(channel.id, author, "spammer's delight"))
        .await;
    assert!(allowed.is_ok());

    let violations = w.store.violation_count();
    assert_eq!(violations, 1);
}

#[tokio::test]
async fn mute_blocks_follow_up_messages() {
    let w = world(CoreConfig::default()).await;
    let owner = Uuid::new_v4();
    let troll = Uuid::new_v4();
    let channel = w
        .service
        .create_channel("general", ChannelKind::Public, owner)
        .await
        .unwrap();
    w.service
        .add_member(channel.id, troll, troll, MemberRole::Member)
        .await
        .unwrap();
    w.service
        .moderation()
        .create_rule(NewRule::new("buy now", "advertising", ModerationAction::Mute).with_duration_secs(600))
        .await
        .unwrap();
    let mut watcher = w.service.connect(owner).await.unwrap();

    let first = w
        .service
        .send_message(SendMessage::new(channel.id, troll, "BUY NOW, cheap!"))
        .await;
    assert!(matches!(first, Err(ChatError::Moderated { .. })));

    let event = next_event(&mut watcher).await;
    assert_eq!(event.kind, EventKind::ModerationViolation);
    assert_eq!(event.payload["action"], "mute");

    let second = w
        .service
        .send_message(SendMessage::new(channel.id, troll, "sorry"))
        .await;
    assert!(matches!(second, Err(ChatError::Unauthorized(_))));

    // Other members are unaffected
    w.service
        .send_message(SendMessage::new(channel.id, owner, "carry on"))
        .await
        .unwrap();
}
