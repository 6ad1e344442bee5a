use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use cairn_network::{BitswapError, Block, BlockStore, Codec, MemorySwitch};
use cairn_util::test::init_logger;
use tokio_util::sync::CancellationToken;

mod common;

fn make_block(len: usize) -> Block {
    let data = (0..len).map(|_| rand::random::<u8>()).collect::<Vec<_>>();
    Block::new(Codec::RAW, Bytes::from(data))
}

#[tokio::test]
async fn fetch_blocks_from_connected_peer() -> Result<()> {
    init_logger("fetch_blocks_from_connected_peer", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 2);
    let (a, b) = (&nodes[0], &nodes[1]);

    let small = make_block(100);
    let large = make_block(4096);
    b.store().put_block(small.clone())?;
    b.store().put_block(large.clone())?;

    a.network().connect_with_info(&b.peer_info()).await?;
    // Wait for both swarms to be updated.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.bitswap().swarm(), vec![*b.peer_id()]);

    let cancelled = CancellationToken::new();
    for block in [&small, &large] {
        let fetched = a.bitswap().get_block(block.cid(), false, &cancelled).await?;
        assert_eq!(fetched.cid(), block.cid());
        assert_eq!(fetched.data(), block.data());

        assert!(!a.bitswap().is_pending(block.cid()));
        assert!(a.store().has_block(block.cid())?);
    }

    assert_eq!(a.bitswap().stats().blocks_received(), 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_of_same_block() -> Result<()> {
    init_logger("concurrent_fetches_of_same_block", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 2);
    let (a, b) = (&nodes[0], &nodes[1]);

    let block = make_block(2048);
    b.store().put_block(block.clone())?;

    a.network().connect_with_info(&b.peer_info()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = CancellationToken::new();
    let (first, second) = tokio::join!(
        a.bitswap().get_block(block.cid(), false, &cancelled),
        a.bitswap().get_block(block.cid(), false, &cancelled),
    );
    assert_eq!(first?.data(), block.data());
    assert_eq!(second?.data(), block.data());
    Ok(())
}

#[tokio::test]
async fn local_block_needs_no_peers() -> Result<()> {
    init_logger("local_block_needs_no_peers", "debug");

    let switch = MemorySwitch::new();
    let node = common::make_node(&switch, common::make_fast_config());

    let block = make_block(10);
    let cid = node.add_block(block.clone()).await?;

    let fetched = node.get_block(&cid, &CancellationToken::new()).await?;
    assert_eq!(fetched.data(), block.data());
    assert_eq!(node.bitswap().stats().messages_received(), 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_fetch_is_closed() -> Result<()> {
    init_logger("cancelled_fetch_is_closed", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 2);
    let (a, b) = (&nodes[0], &nodes[1]);

    a.network().connect_with_info(&b.peer_info()).await?;

    let missing = make_block(64);
    let cancelled = CancellationToken::new();
    tokio::spawn({
        let cancelled = cancelled.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancelled.cancel();
        }
    });

    let res = a.bitswap().get_block(missing.cid(), false, &cancelled).await;
    assert!(matches!(res, Err(BitswapError::Closed)));
    assert!(!a.bitswap().is_pending(missing.cid()));
    Ok(())
}

#[tokio::test]
async fn fetch_timeout_is_reported() -> Result<()> {
    init_logger("fetch_timeout_is_reported", "debug");

    let switch = MemorySwitch::new();
    let mut config = common::make_fast_config();
    config.bitswap.fetch_timeout = Some(Duration::from_millis(300));
    let node = common::make_node(&switch, config);

    let missing = make_block(64);
    let res = node.get_block(missing.cid(), &CancellationToken::new()).await;
    assert!(matches!(res, Err(BitswapError::TimedOut)));
    assert!(!node.bitswap().is_pending(missing.cid()));
    Ok(())
}

#[tokio::test]
async fn root_fetch_discovers_providers() -> Result<()> {
    init_logger("root_fetch_discovers_providers", "debug");

    let switch = MemorySwitch::new();
    let nodes = common::make_nodes(&switch, 3);
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    // a only knows b, c only knows b.
    a.dht().add_peer(b.peer_info());
    c.dht().add_peer(b.peer_info());

    let block = make_block(3000);
    let cid = c.add_block(block.clone()).await?;
    // Provider records are sent without waiting for the remote side.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let fetched = a.get_block(&cid, &CancellationToken::new()).await?;
    assert_eq!(fetched.data(), block.data());
    assert!(a.bitswap().swarm().contains(c.peer_id()));
    Ok(())
}
