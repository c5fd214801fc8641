// ============================================================================
// SinkWriter Tests
// ============================================================================

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, DuplexStream};

use super::SinkWriter;
use crate::error::RelayError;

fn chunk(tag: u8, len: usize) -> Bytes {
    Bytes::from(vec![tag; len])
}

async fn read_to_end(mut reader: DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_writes_arrive_in_order() -> anyhow::Result<()> {
    let (writer, reader) = tokio::io::duplex(1024);
    let reader = tokio::spawn(read_to_end(reader));
    let sink = SinkWriter::spawn(writer, 2);

    for tag in 1..=5u8 {
        sink.write(chunk(tag, 100)).await?;
    }
    sink.finish(Duration::from_secs(5)).await?;

    let out = reader.await?;
    let expected: Vec<u8> = (1..=5u8).flat_map(|tag| vec![tag; 100]).collect();
    assert_eq!(out, expected);
    assert_eq!(sink.stats().frames, 5);
    assert_eq!(sink.stats().bytes, 500);
    Ok(())
}

#[tokio::test]
async fn test_full_queue_suspends_write() -> anyhow::Result<()> {
    let (writer, reader) = tokio::io::duplex(16);
    let sink = SinkWriter::spawn(writer, 1);

    // first buffer is picked up by the writer task and blocks on the pipe,
    // second one sits in the queue
    sink.write(chunk(1, 64)).await?;
    sink.write(chunk(2, 64)).await?;
    let blocked = tokio::time::timeout(Duration::from_millis(100), sink.write(chunk(3, 64))).await;
    assert!(blocked.is_err(), "write should wait for the reader");

    let reader = tokio::spawn(read_to_end(reader));
    sink.write(chunk(3, 64)).await?;
    sink.finish(Duration::from_secs(5)).await?;

    let out = reader.await?;
    let expected: Vec<u8> = (1..=3u8).flat_map(|tag| vec![tag; 64]).collect();
    assert_eq!(out, expected);
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_late_writes() -> anyhow::Result<()> {
    let (writer, reader) = tokio::io::duplex(1024);
    let reader = tokio::spawn(read_to_end(reader));
    let sink = SinkWriter::spawn(writer, 2);

    sink.write(chunk(7, 10)).await?;
    assert!(sink.close());
    assert!(!sink.close());
    assert!(sink.is_closed());

    let err = sink.write(chunk(8, 10)).await.unwrap_err();
    assert!(matches!(err, RelayError::WriteFailure(_)));

    sink.finish(Duration::from_secs(5)).await?;
    assert_eq!(reader.await?, vec![7u8; 10]);
    Ok(())
}

#[tokio::test]
async fn test_broken_pipe_fails_the_sink() {
    let (writer, reader) = tokio::io::duplex(16);
    drop(reader);
    let sink = SinkWriter::spawn(writer, 1);

    let _ = sink.write(chunk(1, 32)).await;
    let err = sink.finish(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, RelayError::WriteFailure(_)));
    assert!(sink.write(chunk(2, 32)).await.is_err());
    assert_eq!(sink.stats().frames, 0);
}

#[tokio::test]
async fn test_monitor_failure_releases_blocked_write() {
    let (writer, _reader) = tokio::io::duplex(16);
    let sink = SinkWriter::spawn(writer, 1);
    let monitor = sink.monitor();

    sink.write(chunk(1, 64)).await.unwrap();
    sink.write(chunk(2, 64)).await.unwrap();

    let failer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.fail(RelayError::sink_unavailable("encoder exited"));
    });

    let err = tokio::time::timeout(Duration::from_secs(5), sink.write(chunk(3, 64)))
        .await
        .expect("write should be released")
        .unwrap_err();
    assert_eq!(err, RelayError::sink_unavailable("encoder exited"));
    failer.await.unwrap();
}

#[tokio::test]
async fn test_finish_times_out_on_stuck_reader() {
    let (writer, _reader) = tokio::io::duplex(16);
    let sink = SinkWriter::spawn(writer, 2);

    sink.write(chunk(1, 64)).await.unwrap();
    sink.write(chunk(2, 64)).await.unwrap();

    let err = sink.finish(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, RelayError::WriteFailure(ref msg) if msg.contains("timed out")));
}

#[tokio::test]
async fn test_drop_closes_the_stream() {
    let (writer, reader) = tokio::io::duplex(1024);
    let reader = tokio::spawn(read_to_end(reader));
    {
        let sink = SinkWriter::spawn(writer, 2);
        sink.write(chunk(4, 8)).await.unwrap();
    }
    let out = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("reader should see EOF")
        .unwrap();
    assert_eq!(out, vec![4u8; 8]);
}

#[tokio::test]
async fn test_failed_resolves_on_monitor_failure() -> anyhow::Result<()> {
    let (writer, _reader) = tokio::io::duplex(1024);
    let sink = SinkWriter::spawn(writer, 1);
    let monitor = sink.monitor();

    // nothing has failed yet
    assert!(
        tokio::time::timeout(Duration::from_millis(20), sink.failed())
            .await
            .is_err()
    );

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.fail(RelayError::sink_unavailable("encoder exited"));
        monitor.fail(RelayError::write_failure("later"));
    });
    let err = tokio::time::timeout(Duration::from_secs(5), sink.failed()).await?;
    assert_eq!(err, RelayError::sink_unavailable("encoder exited"));
    Ok(())
}
