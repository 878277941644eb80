//! Wire-level behaviour seen from a raw TCP client.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use cairn_core::crypto::{hash_key, new_encryption_key};
use cairn_core::wire::{encode_message, Decoder, DefaultDecoder, Envelope, FetchIntent, FRAME_STREAM};

use crate::*;

async fn raw_client(node: &Node, expected_peers: usize) -> Result<TcpStream> {
    let conn = TcpStream::connect(node.addr).await?;
    wait_for("raw client to register", Duration::from_secs(5), || {
        node.peers() == expected_peers
    })
    .await?;
    Ok(conn)
}

/// Ask for `key` and return the size the node announces back.
/// For a hit the stream header is checked too, and left unread past it.
async fn get_file(conn: &mut TcpStream, key: &str) -> Result<u64> {
    let frame = Envelope::GetFile(FetchIntent {
        node_id: "raw-client".into(),
        key: hash_key(key),
        request_id: 1,
    })
    .to_frame_bytes()?;
    conn.write_all(&frame).await?;

    let decoder = DefaultDecoder::default();
    let reply = decoder.decode(conn).await?;
    let reply = match Envelope::decode(&reply.payload)? {
        Envelope::GetFileReply(reply) => reply,
        other => bail!("expected get_file_reply, got {other:?}"),
    };
    assert_eq!(reply.request_id, 1);
    assert_eq!(reply.key, hash_key(key));
    if reply.size > 0 {
        assert_eq!(conn.read_u8().await?, FRAME_STREAM);
        assert_eq!(conn.read_u64_le().await?, reply.size);
    }
    Ok(reply.size)
}

#[tokio::test]
async fn unknown_message_type_is_ignored() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let mut conn = raw_client(&a, 1).await?;

    conn.write_all(&encode_message(br#"{"type":"heartbeat","seq":1}"#)?)
        .await?;

    let size = tokio::time::timeout(Duration::from_secs(5), get_file(&mut conn, "none")).await??;
    assert_eq!(size, 0, "explicit miss");
    assert_eq!(a.peers(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_envelope_does_not_stop_dispatch() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    a.server.store("present", &mut &b"12345"[..]).await?;
    let mut conn = raw_client(&a, 1).await?;

    conn.write_all(&encode_message(b"{not json")?).await?;

    let size = tokio::time::timeout(Duration::from_secs(5), get_file(&mut conn, "present")).await??;
    assert_eq!(size, 5 + cairn_core::crypto::IV_LEN as u64);
    Ok(())
}

/// A peer that breaks framing loses its own connection and nothing else.
#[tokio::test]
async fn bad_frame_drops_only_that_connection() -> Result<()> {
    let key = new_encryption_key();
    let a = Node::start(&key, &[]).await?;
    let b = Node::start(&key, &[a.addr]).await?;
    wait_for_peers(&[&a, &b], 1).await?;

    let mut conn = raw_client(&a, 2).await?;
    conn.write_all(&[0x7f]).await?;
    wait_for("bad peer to be dropped", Duration::from_secs(5), || a.peers() == 1).await?;

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut rest)).await??;
    assert_eq!(n, 0, "server closed the connection");

    a.server.store("after-drop", &mut &b"ok"[..]).await?;
    wait_for_replica(&b, a.server.id(), "after-drop", 2).await?;
    Ok(())
}
