use cairn_core::crypto::new_encryption_key;
use cairn_services::ServerError;

use crate::*;

/// B has no copy of "x", A does. B's fetch pulls it and keeps it.
#[tokio::test]
async fn fetch_pulls_missing_key_from_peer() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let payload = random_bytes(3000);
    a.server.store("x", &mut &payload[..]).await?;

    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;
    assert!(!b.server.has_local("x"));

    let file = b.server.fetch("x").await?;
    assert_eq!(read_all(file).await?, payload);
    assert!(b.server.has_local("x"));

    // Second fetch is local.
    let again = b.server.fetch("x").await?;
    assert_eq!(read_all(again).await?, payload);
    Ok(())
}

/// A node that lost its own file gets it back from the replica a peer holds.
#[tokio::test]
async fn fetch_restores_deleted_file_from_replica() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let payload = random_bytes(1000);
    b.server.store("backup.tar", &mut &payload[..]).await?;
    wait_for_replica(&a, b.server.id(), "backup.tar", 1000).await?;

    b.server.delete_local("backup.tar").await?;
    assert!(!b.server.has_local("backup.tar"));

    let file = b.server.fetch("backup.tar").await?;
    assert_eq!(read_all(file).await?, payload);
    Ok(())
}

#[tokio::test]
async fn fetch_missing_everywhere_is_not_found() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let err = b.server.fetch("ghost").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)), "got {err}");
    assert!(!b.server.has_local("ghost"));

    // The miss reply was drained; the connection still carries replicas.
    b.server.store("after-miss", &mut &b"still framed"[..]).await?;
    wait_for_replica(&a, b.server.id(), "after-miss", 12).await?;
    Ok(())
}

/// Only one of two peers has the key; the other's miss does not break the fetch.
#[tokio::test]
async fn fetch_with_one_holder_among_peers() -> Result<()> {
    let key = new_encryption_key();
    let holder = Node::start(&key, &[]).await?;
    let payload = random_bytes(777);
    holder.server.store("rare", &mut &payload[..]).await?;

    let empty = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[holder.addr, empty.addr]).await?;
    wait_for("b to see both peers", Duration::from_secs(5), || b.peers() == 2).await?;

    let file = b.server.fetch("rare").await?;
    assert_eq!(read_all(file).await?, payload);
    Ok(())
}

/// A fetch from a peer while that same peer pushes a large replica over the
/// same connection: each stream reaches its own consumer.
#[tokio::test]
async fn fetch_while_peer_pushes_replica() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let wanted = random_bytes(5000);
    a.server.store("wanted", &mut &wanted[..]).await?;

    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let pushed = random_bytes(2 * 1024 * 1024);
    let mut pushed_reader = &pushed[..];
    let (stored, fetched) = tokio::join!(
        a.server.store("pushed", &mut pushed_reader),
        b.server.fetch("wanted"),
    );
    stored?;
    assert_eq!(read_all(fetched?).await?, wanted);
    wait_for_replica(&b, a.server.id(), "pushed", pushed.len() as u64).await?;
    Ok(())
}

/// Two nodes fetching from each other at the same moment both finish.
#[tokio::test]
async fn crossed_fetches_both_complete() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let from_a = random_bytes(1024 * 1024);
    let from_b = random_bytes(1024 * 1024);
    a.server.store("a-only", &mut &from_a[..]).await?;
    b.server.store("b-only", &mut &from_b[..]).await?;
    wait_for_replica(&a, b.server.id(), "b-only", from_b.len() as u64).await?;
    wait_for_replica(&b, a.server.id(), "a-only", from_a.len() as u64).await?;
    a.server.delete_local("a-only").await?;
    b.server.delete_local("b-only").await?;

    let (got_a, got_b) = tokio::time::timeout(
        Duration::from_secs(20),
        async { tokio::join!(a.server.fetch("a-only"), b.server.fetch("b-only")) },
    )
    .await?;
    assert_eq!(read_all(got_a?).await?, from_a);
    assert_eq!(read_all(got_b?).await?, from_b);
    Ok(())
}
