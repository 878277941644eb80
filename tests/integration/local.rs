use cairn_core::crypto::new_encryption_key;
use cairn_services::ServerError;

use crate::*;

/// With no peers, a store is served straight back from local disk.
#[tokio::test]
async fn store_then_fetch_without_peers() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;

    let sent = a.server.store("report.txt", &mut &b"hello world"[..]).await?;
    assert_eq!(sent, 0, "nothing to replicate to");
    assert!(a.server.has_local("report.txt"));

    let file = a.server.fetch("report.txt").await?;
    assert_eq!(read_all(file).await?, b"hello world");
    Ok(())
}

#[tokio::test]
async fn overwrite_replaces_local_copy() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;

    a.server.store("notes", &mut &b"first draft, rather long"[..]).await?;
    a.server.store("notes", &mut &b"final"[..]).await?;
    assert_eq!(read_all(a.server.fetch("notes").await?).await?, b"final");
    Ok(())
}

#[tokio::test]
async fn fetch_unknown_key_without_peers_fails() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;

    let err = a.server.fetch("never-stored").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn delete_local_removes_key() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;

    a.server.store("tmp.bin", &mut &random_bytes(64)[..]).await?;
    assert!(a.server.has_local("tmp.bin"));
    a.server.delete_local("tmp.bin").await?;
    assert!(!a.server.has_local("tmp.bin"));
    Ok(())
}
