//! Schema document caches.
//!
//! Cache failures never fail a request: a backend error is logged and
//! reads as a miss.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
}

/// Process-local LRU with per-entry expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Instant, String)>>,
}

impl MemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key.to_string(), (Instant::now() + ttl, value.to_string()));
        }
    }
}

/// Cache in a Redis or Valkey server, spoken to over RESP.
///
/// One connection is kept and re-dialed after any error.
pub struct RespCache {
    addr: String,
    password: Option<String>,
    db: u32,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<BufReader<TcpStream>>>,
}

/// Largest bulk string a RESP server may send (Redis's own limit).
const MAX_BULK_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Simple(String),
    Bulk(Option<Vec<u8>>),
    Integer(i64),
}

impl RespCache {
    /// Accepts `redis://[:password@]host:port[/db]`. `valkey://` and a bare
    /// `host:port` work the same way.
    ///
    /// # Errors
    ///
    /// A message for URLs without a host.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, String> {
        let rest = url
            .strip_prefix("redis://")
            .or_else(|| url.strip_prefix("valkey://"))
            .unwrap_or(url);
        let (auth, rest) = match rest.rsplit_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let (addr, db) = match rest.split_once('/') {
            Some((addr, db)) if !db.is_empty() => (
                addr,
                db.parse::<u32>().map_err(|_| format!("invalid database in {url}"))?,
            ),
            Some((addr, _)) => (addr, 0),
            None => (rest, 0),
        };
        if addr.is_empty() {
            return Err(format!("no host in cache url {url}"));
        }
        let password = auth
            .map(|a| a.rsplit_once(':').map_or(a, |(_, p)| p))
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Ok(Self {
            addr: addr.to_string(),
            password,
            db,
            timeout,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn dial(&self) -> Result<BufReader<TcpStream>, String> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| format!("connect {}: {e}", self.addr))?;
        let mut conn = BufReader::new(stream);
        if let Some(password) = &self.password {
            expect_ok(round_trip(&mut conn, &["AUTH", password]).await?)?;
        }
        if self.db != 0 {
            expect_ok(round_trip(&mut conn, &["SELECT", &self.db.to_string()]).await?)?;
        }
        Ok(conn)
    }

    async fn command(&self, args: &[&str]) -> Result<Reply, String> {
        let mut slot = self.conn.lock().await;
        let fut = async {
            if slot.is_none() {
                *slot = Some(self.dial().await?);
            }
            match slot.as_mut() {
                Some(conn) => round_trip(conn, args).await,
                None => Err("no connection".to_string()),
            }
        };
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }
}

fn expect_ok(reply: Reply) -> Result<(), String> {
    match reply {
        Reply::Simple(_) => Ok(()),
        other => Err(format!("unexpected reply {other:?}")),
    }
}

async fn round_trip(conn: &mut BufReader<TcpStream>, args: &[&str]) -> Result<Reply, String> {
    let mut frame = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        frame.extend_from_slice(arg.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    conn.get_mut()
        .write_all(&frame)
        .await
        .map_err(|e| e.to_string())?;
    read_reply(conn).await
}

async fn read_reply(conn: &mut BufReader<TcpStream>) -> Result<Reply, String> {
    let mut line = String::new();
    conn.read_line(&mut line).await.map_err(|e| e.to_string())?;
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(kind) = line.chars().next() else {
        return Err("connection closed".to_string());
    };
    let body = &line[kind.len_utf8()..];
    match kind {
        '+' => Ok(Reply::Simple(body.to_string())),
        '-' => Err(format!("server error: {body}")),
        ':' => body
            .parse()
            .map(Reply::Integer)
            .map_err(|_| format!("bad integer reply {body}")),
        '$' => {
            let len: i64 = body.parse().map_err(|_| format!("bad bulk length {body}"))?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= MAX_BULK_BYTES)
                .ok_or_else(|| format!("bulk reply of {body} bytes exceeds {MAX_BULK_BYTES}"))?;
            let mut buf = vec![0u8; len + 2];
            conn.read_exact(&mut buf).await.map_err(|e| e.to_string())?;
            buf.truncate(len);
            Ok(Reply::Bulk(Some(buf)))
        }
        other => Err(format!("unsupported reply type {other}")),
    }
}

#[async_trait]
impl Cache for RespCache {
    async fn get(&self, key: &str) -> Option<String> {
        match self.command(&["GET", key]).await {
            Ok(Reply::Bulk(Some(bytes))) => String::from_utf8(bytes).ok(),
            Ok(Reply::Bulk(None)) => None,
            Ok(other) => {
                tracing::warn!(key, "unexpected cache reply {:?}", other);
                None
            }
            Err(e) => {
                tracing::warn!(key, "cache read failed: {}", e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let secs = ttl.as_secs().max(1).to_string();
        if let Err(e) = self.command(&["SET", key, value, "EX", &secs]).await {
            tracing::warn!(key, "cache write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn memory_entries_expire() {
        let cache = MemoryCache::new(NonZeroUsize::new(4).expect("non-zero"));
        cache.set("k", "v", Duration::from_secs(10)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn memory_evicts_least_recent() {
        let cache = MemoryCache::new(NonZeroUsize::new(2).expect("non-zero"));
        let ttl = Duration::from_secs(60);
        cache.set("a", "1", ttl).await;
        cache.set("b", "2", ttl).await;
        assert!(cache.get("a").await.is_some());
        cache.set("c", "3", ttl).await;
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
    }

    #[test]
    fn resp_urls() {
        let c = RespCache::new("redis://:secret@cache:6379/2", Duration::from_secs(1)).expect("url");
        assert_eq!(c.addr, "cache:6379");
        assert_eq!(c.password.as_deref(), Some("secret"));
        assert_eq!(c.db, 2);

        let c = RespCache::new("valkey://localhost:6379", Duration::from_secs(1)).expect("url");
        assert_eq!(c.addr, "localhost:6379");
        assert!(c.password.is_none());
        assert_eq!(c.db, 0);

        assert!(RespCache::new("redis://", Duration::from_secs(1)).is_err());
    }
}
