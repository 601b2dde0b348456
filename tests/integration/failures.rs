//! Misbehaving peers, timeouts, and shutdown.

use gather_core::wire::ByteRange;
use gather_core::Message;
use gather_services::{NoProgress, TransferError};

use crate::*;

fn ack(sender_id: SenderId, filename: &str, file_size: u64) -> Vec<u8> {
    Message::Ack {
        sender_id,
        filename: filename.into(),
        file_size,
    }
    .encode()
    .unwrap()
    .to_vec()
}

#[tokio::test]
async fn silent_sender_times_out_with_its_id_missing() {
    let scratch = Scratch::new("silent");
    let content = sample_content(60);
    let mut cluster = Cluster::new(port_block());

    let dir = scratch.input(0);
    put_file(&dir, "data.bin", &content);
    cluster.start_sender(0, dir);

    // Sender 1 answers discovery but never listens for its assignment.
    cluster.fake_responder(vec![ack(1, "data.bin", 60)]).await;

    let receiver = cluster.receiver(scratch.output(), Some(Duration::from_secs(2)));
    let err = receiver.run("data.bin", &NoProgress).await.unwrap_err();

    match err.downcast_ref::<TransferError>() {
        Some(TransferError::ReceiveTimedOut {
            received,
            expected,
            missing,
        }) => {
            assert_eq!(*received, 1);
            assert_eq!(*expected, 2);
            assert_eq!(missing, &vec![1]);
        }
        other => panic!("expected ReceiveTimedOut, got {other:?} ({err:#})"),
    }
    assert!(!scratch.output().join("data.bin").exists());
}

#[tokio::test]
async fn discovery_returns_duplicate_acks_as_received() {
    let scratch = Scratch::new("dupes");
    let mut cluster = Cluster::new(port_block());
    cluster
        .fake_responder(vec![ack(3, "data.bin", 10), ack(3, "data.bin", 10)])
        .await;

    let receiver = cluster.receiver(scratch.output(), None);
    let found = receiver.discover("data.bin").await.unwrap();

    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|s| s.id == 3 && s.file_size == 10));
}

#[tokio::test]
async fn discovery_skips_noise_and_other_files() {
    let scratch = Scratch::new("noise");
    let mut cluster = Cluster::new(port_block());
    cluster
        .fake_responder(vec![
            b"HELLO:there".to_vec(),
            b"ACK:not-a-number:data.bin:10".to_vec(),
            ack(4, "other.bin", 99),
            ack(5, "data.bin", 42),
        ])
        .await;

    let receiver = cluster.receiver(scratch.output(), None);
    let found = receiver.discover("data.bin").await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, 5);
    assert_eq!(found[0].file_size, 42);
}

#[tokio::test]
async fn disagreeing_sizes_use_the_first_sender() {
    let scratch = Scratch::new("sizes");
    let content = sample_content(40);
    let mut cluster = Cluster::new(port_block());

    let dir = scratch.input(0);
    put_file(&dir, "data.bin", &content);
    cluster.start_sender(0, dir);

    let receiver = cluster.receiver(scratch.output(), None);
    let mut found = receiver.discover("data.bin").await.unwrap();
    assert_eq!(found.len(), 1);

    // A late, larger claim from another sender does not change the split.
    let mut liar = found[0].clone();
    liar.id = 1;
    liar.file_size = 4096;
    found.push(liar);

    let assignments = gather_core::assign(&found);
    assert_eq!(assignments[0].range, ByteRange { start: 0, end: 20 });
    assert_eq!(assignments[1].range, ByteRange { start: 20, end: 40 });
}

#[tokio::test]
async fn shutdown_stops_both_sender_loops() {
    let scratch = Scratch::new("shutdown");
    let mut cluster = Cluster::new(port_block());
    cluster.start_sender(0, scratch.input(0));

    let tasks = cluster.tasks.pop().unwrap();
    cluster.shutdown.send(()).unwrap();

    let responder = tokio::time::timeout(Duration::from_secs(2), tasks.responder)
        .await
        .expect("responder should stop")
        .unwrap();
    let listener = tokio::time::timeout(Duration::from_secs(2), tasks.listener)
        .await
        .expect("listener should stop")
        .unwrap();

    assert!(responder.is_ok());
    assert!(listener.is_ok());
}
