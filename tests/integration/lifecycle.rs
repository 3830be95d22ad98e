use crate::*;

use cairn_core::wire::{Message, TAG_MESSAGE};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_ends_serve_and_closes_listener() -> Result<()> {
    let root = temp_root("stop");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let addr = a.addr;
    assert_eq!(a.server.local_addr(), Some(addr));

    a.stop().await?;

    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still accepting after stop");

    cleanup(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_removes_peer() -> Result<()> {
    let root = temp_root("disconnect");
    let a = spawn_node(NodeOpts::new(&root)).await?;

    let client = raw_client(&a).await?;
    assert_eq!(a.server.peers(), vec![client.local_addr()?.to_string()]);

    drop(client);
    wait_for_peers(&a, 0).await?;

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_bootstrap_does_not_abort_startup() -> Result<()> {
    let root = temp_root("dead-bootstrap");
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0")?;
        l.local_addr()?
    };
    let a = spawn_node(NodeOpts::new(&root).bootstrap(&[dead])).await?;

    let mut client = raw_client(&a).await?;
    a.server.store("k", &mut &b"v"[..]).await?;

    // The raw client is a registered peer, so it is sent the replica.
    let (msg, body) = read_file(&mut client).await?;
    assert_eq!(
        msg,
        Message::StoreFile {
            key: "k".into(),
            size: 1,
            reply: false,
        }
    );
    assert_eq!(body, b"v");

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// A hand-written StoreFile + STREAM is stored, and a GetFile for it is
/// answered with a keyed StoreFile reply and exactly `size` bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_client_store_then_get() -> Result<()> {
    let root = temp_root("raw-store");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let mut client = raw_client(&a).await?;

    let content = b"written by hand".to_vec();
    client.write_all(&file_frames("manual", &content, false)?).await?;

    wait_for_content(&a, "manual", &content).await?;

    client
        .write_all(&control(&Message::GetFile { key: "manual".into() })?)
        .await?;
    let reply = read_reply(&mut client, "manual").await?;
    assert_eq!(reply, content);

    // The reply ended exactly at `size`: a second request is framed cleanly.
    client
        .write_all(&control(&Message::GetFile { key: "manual".into() })?)
        .await?;
    assert_eq!(read_reply(&mut client, "manual").await?, content);

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// An undecodable control message is logged and skipped; the connection
/// and the dispatch loop carry on.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_control_message_is_not_fatal() -> Result<()> {
    let root = temp_root("malformed");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    a.server.store("present", &mut &b"still served"[..]).await?;

    let mut client = raw_client(&a).await?;

    let junk = b"{\"type\":\"Nope\"}";
    let mut bytes = vec![TAG_MESSAGE];
    bytes.extend_from_slice(&(junk.len() as u32).to_be_bytes());
    bytes.extend_from_slice(junk);
    client.write_all(&bytes).await?;

    client
        .write_all(&control(&Message::GetFile { key: "present".into() })?)
        .await?;
    let reply = read_reply(&mut client, "present").await?;
    assert_eq!(reply, b"still served");
    assert_eq!(a.server.peer_count(), 1);

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// An unknown frame tag ends that peer's connection, other peers are
/// unaffected.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_tag_drops_only_that_peer() -> Result<()> {
    let root = temp_root("bad-tag");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;

    let mut rogue = TcpStream::connect(a.addr).await?;
    wait_for_peers(&a, 2).await?;
    rogue.write_all(&[0x7f]).await?;
    wait_for_peers(&a, 1).await?;

    a.server.store("fine", &mut &b"unaffected"[..]).await?;
    wait_for_content(&b, "fine", b"unaffected").await?;

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}
