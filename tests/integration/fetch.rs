use crate::*;

use cairn_core::wire::Message;
use tokio::io::AsyncWriteExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_local_hit_needs_no_peers() -> Result<()> {
    let root = temp_root("local-hit");
    let a = spawn_node(NodeOpts::new(&root)).await?;

    a.server.store("alone", &mut &b"just me"[..]).await?;
    let (size, file) = a.server.get("alone").await?;
    assert_eq!(size, 7);
    assert_eq!(read_all(file).await?, b"just me");

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// A deletes its own copy, then gets the file back from B.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_recovers_deleted_file_from_peer() -> Result<()> {
    let root = temp_root("recover");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;

    let data = b"recover me from the network".to_vec();
    a.server.store("precious", &mut data.as_slice()).await?;
    wait_for_content(&b, "precious", &data).await?;

    a.server.store_handle().delete(a.id(), "precious").await?;
    assert!(!a.holds("precious").await);

    let (size, file) = a.server.get("precious").await?;
    assert_eq!(size, data.len() as u64);
    assert_eq!(read_all(file).await?, data);
    assert!(a.holds("precious").await);

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Same as above with encryption: B only ever held ciphertext, A decrypts
/// on the way back to disk.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_recovers_encrypted_file_from_peer() -> Result<()> {
    let root = temp_root("recover-enc");
    let a = spawn_node(NodeOpts::new(&root).encrypt(true)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr]).encrypt(true)).await?;
    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;

    let data: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 256) as u8).collect();
    a.server.store("vault", &mut data.as_slice()).await?;

    let path = b.path_of("vault");
    wait_for("ciphertext on b", || {
        std::fs::metadata(&path)
            .map(|m| m.len() == 16 + data.len() as u64)
            .unwrap_or(false)
    })
    .await?;

    a.server.store_handle().delete(a.id(), "vault").await?;
    let (size, file) = a.server.get("vault").await?;
    assert_eq!(size, data.len() as u64);
    assert_eq!(read_all(file).await?, data);

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_missing_without_peers_is_fetch_error() -> Result<()> {
    let root = temp_root("missing-alone");
    let a = spawn_node(NodeOpts::new(&root)).await?;

    let err = a.server.get("nowhere").await.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(ref key) if key == "nowhere"), "got {err}");

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Peers that don't hold the key stay silent; `get` gives up after the
/// fetch timeout and the connection stays usable.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_missing_everywhere_times_out() -> Result<()> {
    let root = temp_root("missing-everywhere");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;

    let started = Instant::now();
    let err = a.server.get("nowhere").await.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(_)), "got {err}");
    assert!(started.elapsed() >= FETCH_TIMEOUT);

    a.server.store("after", &mut &b"still connected"[..]).await?;
    wait_for_content(&b, "after", b"still connected").await?;

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Run `get(key)` on `node` in the background and return once `client`
/// has been asked for it.
async fn get_in_background(
    node: &Node,
    client: &mut TcpStream,
    key: &str,
) -> Result<JoinHandle<Result<(u64, tokio::fs::File), ServerError>>> {
    let task = {
        let server = node.server.clone();
        let key = key.to_string();
        tokio::spawn(async move { server.get(&key).await })
    };
    let asked = read_control(client).await?;
    assert_eq!(asked, Message::GetFile { key: key.into() });
    Ok(task)
}

/// A reply that arrives after its `get` gave up is dropped. It neither
/// answers the next `get` for a different key nor lands on disk.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_reply_cannot_answer_another_key() -> Result<()> {
    let root = temp_root("late-reply");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let mut client = raw_client(&a).await?;

    let x = get_in_background(&a, &mut client, "x").await?;
    let err = x.await?.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(ref key) if key == "x"), "got {err}");

    let y = get_in_background(&a, &mut client, "y").await?;
    client
        .write_all(&file_frames("x", b"content-of-x", true)?)
        .await?;

    let err = y.await?.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(ref key) if key == "y"), "got {err}");
    assert!(!a.holds("y").await);
    assert!(!a.holds("x").await);

    // The late stream was consumed exactly, the connection is still in sync.
    client
        .write_all(&file_frames("after", b"in sync", false)?)
        .await?;
    wait_for_content(&a, "after", b"in sync").await?;
    assert!(!a.holds("x").await);

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// A reply that announces more bytes than it sends never becomes a local
/// copy, and nothing partial is left once the peer goes away.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_reply_leaves_no_partial_file() -> Result<()> {
    let root = temp_root("short-reply");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let mut client = raw_client(&a).await?;

    let first = get_in_background(&a, &mut client, "z").await?;
    let mut bytes = control(&Message::StoreFile {
        key: "z".into(),
        size: 100,
        reply: true,
    })?;
    bytes.push(cairn_core::wire::TAG_STREAM);
    bytes.extend_from_slice(b"12345");
    client.write_all(&bytes).await?;

    let err = first.await?.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(_)), "got {err}");
    assert!(!a.holds("z").await);

    // Still stalled: a second attempt is not fooled by the partial bytes.
    let second = get_in_background(&a, &mut client, "z").await?;
    let err = second.await?.unwrap_err();
    assert!(matches!(err, ServerError::Fetch(_)), "got {err}");
    assert!(!a.holds("z").await);

    drop(client);
    wait_for_peers(&a, 0).await?;
    wait_for("partial reply to be removed", || entries_beside(&a, "z").is_empty()).await?;
    assert!(!a.holds("z").await);

    a.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Once a fetch has been satisfied, a later reply for the same key does not
/// replace the copy that was served.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_later_reply_does_not_replace_fetched_copy() -> Result<()> {
    let root = temp_root("duplicate-reply");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;
    let mut client = raw_client(&a).await?;

    let data = b"the real content".to_vec();
    a.server.store("dup", &mut data.as_slice()).await?;
    wait_for_content(&b, "dup", &data).await?;
    let (_, replica) = read_file(&mut client).await?;
    assert_eq!(replica, data);

    a.server.store_handle().delete(a.id(), "dup").await?;
    let (_, file) = a.server.get("dup").await?;
    assert_eq!(read_all(file).await?, data);

    let asked = read_control(&mut client).await?;
    assert_eq!(asked, Message::GetFile { key: "dup".into() });
    client
        .write_all(&file_frames("dup", b"an impostor", true)?)
        .await?;

    // Frames from one peer are handled in order, so once this lands the
    // impostor reply has been dealt with.
    client
        .write_all(&file_frames("marker", b"done", false)?)
        .await?;
    wait_for_content(&a, "marker", b"done").await?;

    assert_eq!(tokio::fs::read(a.path_of("dup")).await?, data);
    assert_eq!(entries_beside(&a, "dup").len(), 1);

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}
