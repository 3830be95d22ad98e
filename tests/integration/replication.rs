use crate::*;

/// A stores a file while connected to B; B ends up with the same bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_node_replication() -> Result<()> {
    let root = temp_root("two-node");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;

    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;

    let data = b"my big data file here!".to_vec();
    let n = a.server.store("someGoodPicture", &mut data.as_slice()).await?;
    assert_eq!(n, data.len() as u64);

    assert!(a.holds("someGoodPicture").await);
    wait_for_content(&b, "someGoodPicture", &data).await?;

    // Same root, separate namespaces.
    assert_ne!(a.path_of("someGoodPicture"), b.path_of("someGoodPicture"));

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Every node connected to the storing node receives a copy.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_node_replication() -> Result<()> {
    let root = temp_root("three-node");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    let c = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr, b.addr])).await?;

    wait_for_peers(&a, 2).await?;
    wait_for_peers(&b, 2).await?;
    wait_for_peers(&c, 2).await?;

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    a.server.store("large", &mut data.as_slice()).await?;

    wait_for_content(&b, "large", &data).await?;
    wait_for_content(&c, "large", &data).await?;

    // C is connected to B too, so a store from C reaches both.
    c.server.store("from-c", &mut &b"hello from c"[..]).await?;
    wait_for_content(&a, "from-c", b"hello from c").await?;
    wait_for_content(&b, "from-c", b"hello from c").await?;

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Back-to-back stores over the same connection: each stream is drained
/// before the next control frame is read.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sequential_stores_share_one_connection() -> Result<()> {
    let root = temp_root("sequential");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;

    let files: Vec<(String, Vec<u8>)> = (0..8)
        .map(|i| (format!("file-{i}"), format!("payload number {i}").repeat(i + 1).into_bytes()))
        .collect();

    for (key, data) in &files {
        a.server.store(key, &mut data.as_slice()).await?;
    }
    for (key, data) in &files {
        wait_for_content(&b, key, data).await?;
    }

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

/// Replication works from the dialing side as well as the accepting side.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replication_in_both_directions() -> Result<()> {
    let root = temp_root("both-ways");
    let a = spawn_node(NodeOpts::new(&root)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr])).await?;
    wait_for_peers(&a, 1).await?;
    wait_for_peers(&b, 1).await?;

    b.server.store("from-b", &mut &b"dialer to listener"[..]).await?;
    wait_for_content(&a, "from-b", b"dialer to listener").await?;

    a.server.store("from-a", &mut &b"listener to dialer"[..]).await?;
    wait_for_content(&b, "from-a", b"listener to dialer").await?;

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}

/// With encryption on, peers hold IV-prefixed ciphertext, never plaintext.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_encrypted_replication_stores_ciphertext_on_peers() -> Result<()> {
    let root = temp_root("encrypted");
    let a = spawn_node(NodeOpts::new(&root).encrypt(true)).await?;
    let b = spawn_node(NodeOpts::new(&root).bootstrap(&[a.addr]).encrypt(true)).await?;
    wait_for_peers(&a, 1).await?;

    let data = b"top secret payload".to_vec();
    a.server.store("secret", &mut data.as_slice()).await?;

    // The local copy is plaintext.
    assert_eq!(tokio::fs::read(a.path_of("secret")).await?, data);

    let path = b.path_of("secret");
    wait_for("ciphertext on b", || {
        std::fs::metadata(&path)
            .map(|m| m.len() == 16 + data.len() as u64)
            .unwrap_or(false)
    })
    .await?;
    let held = tokio::fs::read(&path).await?;
    assert_ne!(&held[16..], &data[..]);

    a.stop().await?;
    b.stop().await?;
    cleanup(&root);
    Ok(())
}
