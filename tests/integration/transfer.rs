//! End-to-end transfers between real senders and a real receiver.

use gather_services::{NoProgress, TransferError};

use crate::*;

#[tokio::test]
async fn three_senders_reassemble_byte_identical_file() {
    let scratch = Scratch::new("three");
    let content = sample_content(100);
    let mut cluster = Cluster::new(port_block());

    for id in 0..3 {
        let dir = scratch.input(id);
        put_file(&dir, "data.bin", &content);
        cluster.start_sender(id, dir);
    }

    let receiver = cluster.receiver(scratch.output(), Some(Duration::from_secs(10)));
    let outcome = receiver.run("data.bin", &NoProgress).await.unwrap();

    assert_eq!(outcome.file_size, 100);
    assert_eq!(outcome.dispatch.failed, Vec::<SenderId>::new());
    assert_eq!(outcome.dispatch.delivered.len(), 3);

    let mut ranges: Vec<(u64, u64)> = outcome
        .assignments
        .iter()
        .map(|a| (a.range.start, a.range.end))
        .collect();
    ranges.sort();
    assert_eq!(ranges, vec![(0, 33), (33, 66), (66, 100)]);

    assert_eq!(outcome.path, scratch.output().join("data.bin"));
    assert_eq!(std::fs::read(&outcome.path).unwrap(), content);
}

#[tokio::test]
async fn single_sender_serves_whole_file() {
    let scratch = Scratch::new("single");
    let content = sample_content(256 * 1024 + 17);
    let mut cluster = Cluster::new(port_block());

    let dir = scratch.input(0);
    put_file(&dir, "big.bin", &content);
    cluster.start_sender(0, dir);

    let receiver = cluster.receiver(scratch.output(), Some(Duration::from_secs(10)));
    let outcome = receiver.run("big.bin", &NoProgress).await.unwrap();

    assert_eq!(outcome.assignments.len(), 1);
    assert_eq!(outcome.assignments[0].range.start, 0);
    assert_eq!(outcome.assignments[0].range.end, content.len() as u64);
    assert_eq!(std::fs::read(&outcome.path).unwrap(), content);
}

#[tokio::test]
async fn sender_without_the_file_stays_out_of_the_transfer() {
    let scratch = Scratch::new("partial");
    let content = sample_content(64);
    let mut cluster = Cluster::new(port_block());

    let holder = scratch.input(0);
    put_file(&holder, "notes.txt", &content);
    cluster.start_sender(0, holder);

    // Sender 1 has an input directory but not the file.
    cluster.start_sender(1, scratch.input(1));

    let receiver = cluster.receiver(scratch.output(), Some(Duration::from_secs(10)));
    let outcome = receiver.run("notes.txt", &NoProgress).await.unwrap();

    let ids: Vec<SenderId> = outcome.assignments.iter().map(|a| a.sender_id).collect();
    assert_eq!(ids, vec![0]);
    assert_eq!(std::fs::read(&outcome.path).unwrap(), content);
}

#[tokio::test]
async fn no_answers_fails_with_no_senders() {
    let scratch = Scratch::new("nobody");
    let mut cluster = Cluster::new(port_block());
    cluster.start_sender(0, scratch.input(0));

    let receiver = cluster.receiver(scratch.output(), None);
    let err = receiver.run("missing.bin", &NoProgress).await.unwrap_err();

    assert_eq!(
        err.downcast_ref::<TransferError>(),
        Some(&TransferError::NoSenders("missing.bin".into()))
    );
    assert!(!scratch.output().join("missing.bin").exists());
}

#[tokio::test]
async fn path_like_filenames_are_not_served() {
    let scratch = Scratch::new("escape");
    let mut cluster = Cluster::new(port_block());

    let dir = scratch.input(0);
    put_file(&scratch.root, "secret.txt", b"outside the input dir");
    cluster.start_sender(0, dir);

    let receiver = cluster.receiver(scratch.output(), None);
    let found = receiver.discover("../secret.txt").await.unwrap();
    assert!(found.is_empty());
}
