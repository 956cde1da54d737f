//! `RespCache` against a minimal RESP server.

use issuer_claims::{Cache, RespCache};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Store = Arc<Mutex<HashMap<String, String>>>;

async fn read_command(conn: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
    let mut line = String::new();
    if conn.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        conn.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
        let mut buf = vec![0u8; len + 2];
        conn.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8(buf).ok()?);
    }
    Some(args)
}

async fn serve(stream: TcpStream, store: Store, log: Arc<Mutex<Vec<String>>>) {
    let mut conn = BufReader::new(stream);
    while let Some(args) = read_command(&mut conn).await {
        log.lock().expect("log").push(args.join(" "));
        let reply = match args.first().map(String::as_str) {
            Some("AUTH") if args.get(1).map(String::as_str) == Some("secret") => "+OK\r\n".to_string(),
            Some("AUTH") => "-WRONGPASS invalid password\r\n".to_string(),
            Some("SELECT") => "+OK\r\n".to_string(),
            Some("SET") => {
                store
                    .lock()
                    .expect("store")
                    .insert(args[1].clone(), args[2].clone());
                "+OK\r\n".to_string()
            }
            Some("GET") => match store.lock().expect("store").get(&args[1]) {
                Some(v) => format!("${}\r\n{v}\r\n", v.len()),
                None => "$-1\r\n".to_string(),
            },
            _ => "-ERR unknown command\r\n".to_string(),
        };
        if conn.get_mut().write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn fake_server() -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let store = Store::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let commands = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, store.clone(), commands.clone()));
        }
    });
    (addr.to_string(), log)
}

#[tokio::test]
async fn stores_and_reads_back_values() {
    let (addr, log) = fake_server().await;
    let cache = RespCache::new(&format!("redis://:secret@{addr}/2"), Duration::from_secs(2))
        .expect("cache");

    assert_eq!(cache.get("schema:kyc").await, None);
    cache
        .set("schema:kyc", "{\"a\": \"b c\"}", Duration::from_secs(30))
        .await;
    assert_eq!(
        cache.get("schema:kyc").await.as_deref(),
        Some("{\"a\": \"b c\"}")
    );

    let log = log.lock().expect("log").clone();
    assert_eq!(log[0], "AUTH secret");
    assert_eq!(log[1], "SELECT 2");
    assert!(log.contains(&"SET schema:kyc {\"a\": \"b c\"} EX 30".to_string()));
    assert_eq!(
        log.iter().filter(|c| c.starts_with("AUTH")).count(),
        1,
        "the connection is reused"
    );
}

#[tokio::test]
async fn failures_read_as_misses() {
    let (addr, _) = fake_server().await;
    let cache = RespCache::new(&format!("valkey://:wrong@{addr}"), Duration::from_secs(2))
        .expect("cache");
    cache.set("k", "v", Duration::from_secs(30)).await;
    assert_eq!(cache.get("k").await, None);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let closed = listener.local_addr().expect("addr");
    drop(listener);
    let cache = RespCache::new(&closed.to_string(), Duration::from_millis(500)).expect("cache");
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn oversized_bulk_replies_are_misses() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut conn = BufReader::new(stream);
                while read_command(&mut conn).await.is_some() {
                    let reply = b"$9223372036854775000\r\n";
                    if conn.get_mut().write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let cache = RespCache::new(&addr.to_string(), Duration::from_secs(2)).expect("cache");
    assert_eq!(cache.get("schema:kyc").await, None);
    // The connection was dropped and a fresh one still answers.
    assert_eq!(cache.get("schema:kyc").await, None);
}
