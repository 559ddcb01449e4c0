// Framed-protocol sessions over real sockets.

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use meshledger::config::NETWORK_MAX_PAYLOAD_SIZE;
use meshledger::consensus::difficulty::{self, MAX_BITS};
use meshledger::net::protocol::{
    BlockPayload, FramedStream, Message, ProtocolError, VersionPayload,
};
use meshledger::primitives::{merkle, unix_now, Block, Transaction};

fn mined_genesis() -> Block {
    let timestamp = unix_now() - 100;
    let cb = Transaction::coinbase("miner", 0, timestamp as f64);
    let root = merkle::merkle_root(&[cb.tx_hash.clone()]).unwrap();
    let mut nonce = 0u64;
    loop {
        let b = Block::sealed(0, timestamp, None, MAX_BITS.into(), root.clone(), vec![cb.clone()], nonce, None);
        if difficulty::hash_meets_target(&b.hash, MAX_BITS) {
            return b;
        }
        nonce += 1;
    }
}

fn version(height: i64) -> Message {
    Message::Version(VersionPayload {
        protocol_version: 1,
        services: 1,
        timestamp: unix_now(),
        best_height: height,
    })
}

#[tokio::test]
async fn version_then_block_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let block = mined_genesis();
    let served = block.clone();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut s = FramedStream::new(stream);

        match s.recv().await.unwrap().unwrap() {
            Message::Version(v) => assert_eq!(v.best_height, -1),
            other => panic!("expected version, got {}", other.command()),
        }
        s.send(&version(0)).await.unwrap();
        s.send(&Message::Block(BlockPayload { block_data: served })).await.unwrap();
    });

    let mut c = FramedStream::new(TcpStream::connect(addr).await.unwrap());
    c.send(&version(-1)).await.unwrap();

    match c.recv().await.unwrap().unwrap() {
        Message::Version(v) => assert_eq!(v.best_height, 0),
        other => panic!("expected version, got {}", other.command()),
    }
    match c.recv().await.unwrap().unwrap() {
        Message::Block(p) => assert_eq!(p.block_data, block),
        other => panic!("expected block, got {}", other.command()),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn garbage_frame_is_a_disconnect_reason() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut s = FramedStream::new(stream);
        s.recv().await
    });

    let mut raw = TcpStream::connect(addr).await.unwrap();
    // a full-size header whose command is garbage and checksum cannot match
    let mut frame = vec![0xAAu8; 20];
    frame[12..16].copy_from_slice(&4u32.to_le_bytes());
    frame.extend_from_slice(b"ruin");
    raw.write_all(&frame).await.unwrap();
    raw.flush().await.unwrap();

    let got = server.await.unwrap();
    assert!(matches!(got, Err(ProtocolError::ChecksumMismatch)));
}

#[tokio::test]
async fn oversize_payload_rejected_before_read() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut s = FramedStream::new(stream);
        s.recv().await
    });

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut header = [0u8; 20];
    header[..7].copy_from_slice(b"version");
    header[12..16].copy_from_slice(&((NETWORK_MAX_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
    raw.write_all(&header).await.unwrap();
    raw.flush().await.unwrap();

    let got = server.await.unwrap();
    assert!(matches!(got, Err(ProtocolError::OversizePayload(_))));
}

#[tokio::test]
async fn clean_eof_is_not_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut s = FramedStream::new(stream);
        s.recv().await
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    drop(stream);

    let got = server.await.unwrap();
    assert!(matches!(got, Ok(None)));
}
