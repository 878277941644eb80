use cairn_core::crypto::{hash_key, new_encryption_key, IV_LEN};

use crate::*;

/// A stores 1000 random bytes; B ends up with the plaintext under A's namespace.
#[tokio::test]
async fn store_replicates_to_connected_peer() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let payload = random_bytes(1000);
    let sent = a.server.store("shared.bin", &mut &payload[..]).await?;
    assert_eq!(sent, 1000 + IV_LEN as u64);

    wait_for_replica(&b, a.server.id(), "shared.bin", 1000).await?;
    let (size, file) = b
        .server
        .content_store()
        .read(a.server.id(), &hash_key("shared.bin"))
        .await?;
    assert_eq!(size, 1000);
    assert_eq!(read_all(file).await?, payload);

    assert!(!b.server.has_local("shared.bin"), "replica is not B's own copy");
    Ok(())
}

/// Replication works from the dialing side too.
#[tokio::test]
async fn dialer_replicates_to_listener() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let payload = random_bytes(4096);
    b.server.store("from-b", &mut &payload[..]).await?;

    wait_for_replica(&a, b.server.id(), "from-b", 4096).await?;
    let (_, file) = a
        .server
        .content_store()
        .read(b.server.id(), &hash_key("from-b"))
        .await?;
    assert_eq!(read_all(file).await?, payload);
    Ok(())
}

#[tokio::test]
async fn store_reaches_every_peer() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    let c = Node::start(&key, &[a.addr]).await?;
    wait_for("a to see both peers", Duration::from_secs(5), || a.peers() == 2).await?;

    let payload = random_bytes(2500);
    a.server.store("fanout", &mut &payload[..]).await?;

    for node in [&b, &c] {
        wait_for_replica(node, a.server.id(), "fanout", 2500).await?;
    }
    Ok(())
}

/// Back-to-back stores on one connection keep the framing intact,
/// including payloads bigger than a socket buffer.
#[tokio::test]
async fn consecutive_stores_stay_framed() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let sizes = [0usize, 1, 17, 64 * 1024, 1024 * 1024 + 3];
    for (i, size) in sizes.iter().enumerate() {
        let payload = random_bytes(*size);
        a.server.store(&format!("file-{i}"), &mut &payload[..]).await?;
    }

    for (i, size) in sizes.iter().enumerate() {
        wait_for_replica(&b, a.server.id(), &format!("file-{i}"), *size as u64).await?;
    }
    // The connection is still usable afterwards.
    a.server.store("last", &mut &b"tail"[..]).await?;
    wait_for_replica(&b, a.server.id(), "last", 4).await?;
    Ok(())
}

#[tokio::test]
async fn disconnected_peer_is_dropped_from_broadcast() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    drop(b);
    wait_for("a to notice b leaving", Duration::from_secs(5), || a.peers() == 0).await?;

    let sent = a.server.store("solo", &mut &b"only local"[..]).await?;
    assert_eq!(sent, 0);
    Ok(())
}
