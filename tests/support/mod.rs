//! An in-process DNS responder for the integration tests.
//!
//! Listens on the same ephemeral port over both UDP and TCP and answers
//! according to a scripted [`Behavior`] that tests can change at any
//! time. Queries are counted per transport so tests can assert how much
//! upstream traffic a scenario actually produced.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// What the responder does with a query.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answer with a single A record.
    Answer { addr: [u8; 4], ttl: u32 },

    /// Answer after a delay.
    DelayedAnswer {
        delay: Duration,
        addr: [u8; 4],
        ttl: u32,
    },

    /// Swallow the query; the client has to time out.
    Drop,

    /// Answer with the given rcode and no records.
    Rcode(u8),

    /// Over UDP, answer truncated; over TCP, answer normally.
    Truncate { addr: [u8; 4], ttl: u32 },
}

/// A scripted DNS server on localhost.
pub struct MockServer {
    addr: SocketAddr,
    behavior: Arc<Mutex<Behavior>>,
    udp_queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockServer {
    /// Starts a responder with the given initial behavior.
    pub async fn start(behavior: Behavior) -> MockServer {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();

        let behavior = Arc::new(Mutex::new(behavior));
        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));

        let udp_task = {
            let behavior = behavior.clone();
            let udp_queries = udp_queries.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let Ok((len, peer)) = udp.recv_from(&mut buf).await
                    else {
                        return;
                    };
                    udp_queries.fetch_add(1, Ordering::SeqCst);
                    let behavior = behavior.lock().clone();
                    if let Some(reply) =
                        render_reply(&buf[..len], &behavior, true).await
                    {
                        let _ = udp.send_to(&reply, peer).await;
                    }
                }
            })
        };

        let tcp_task = {
            let behavior = behavior.clone();
            let tcp_queries = tcp_queries.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = tcp.accept().await else {
                        return;
                    };
                    let behavior = behavior.clone();
                    let tcp_queries = tcp_queries.clone();
                    tokio::spawn(async move {
                        serve_tcp(stream, behavior, tcp_queries).await;
                    });
                }
            })
        };

        MockServer {
            addr,
            behavior,
            udp_queries,
            tcp_queries,
            tasks: vec![udp_task, tcp_task],
        }
    }

    /// The `addr:port` string to configure the resolver with.
    pub fn server_string(&self) -> String {
        self.addr.to_string()
    }

    /// The socket address the responder listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replaces the scripted behavior.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Queries received over UDP so far.
    pub fn udp_queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    /// Queries received over TCP so far.
    pub fn tcp_queries(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }

    /// Total queries received so far.
    pub fn queries(&self) -> usize {
        self.udp_queries() + self.tcp_queries()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_tcp(
    mut stream: TcpStream,
    behavior: Arc<Mutex<Behavior>>,
    tcp_queries: Arc<AtomicUsize>,
) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = usize::from(u16::from_be_bytes(len_buf));
        let mut query = vec![0u8; len];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }
        tcp_queries.fetch_add(1, Ordering::SeqCst);
        let behavior = behavior.lock().clone();
        if let Some(reply) = render_reply(&query, &behavior, false).await {
            let frame = (reply.len() as u16).to_be_bytes();
            if stream.write_all(&frame).await.is_err()
                || stream.write_all(&reply).await.is_err()
            {
                return;
            }
        }
    }
}

async fn render_reply(
    query: &[u8],
    behavior: &Behavior,
    is_udp: bool,
) -> Option<Vec<u8>> {
    match behavior {
        Behavior::Drop => None,
        Behavior::Answer { addr, ttl } => Some(answer(query, *addr, *ttl)),
        Behavior::DelayedAnswer { delay, addr, ttl } => {
            tokio::time::sleep(*delay).await;
            Some(answer(query, *addr, *ttl))
        }
        Behavior::Rcode(rcode) => Some(rcode_reply(query, *rcode)),
        Behavior::Truncate { addr, ttl } => {
            if is_udp {
                Some(truncated_reply(query))
            } else {
                Some(answer(query, *addr, *ttl))
            }
        }
    }
}

/// Builds a query packet with the RD bit set and a single A question.
pub fn mk_query(name: &str, id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(0x01); // RD
    buf.push(0x00);
    buf.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&1u16.to_be_bytes()); // A
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf
}

/// Copies the query's header and question into a reply skeleton.
fn reply_base(query: &[u8], ancount: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(query.len() + 16);
    buf.extend_from_slice(&query[..2]);
    buf.push(query[2] | 0x80); // QR
    buf.push(0x80); // RA
    buf.extend_from_slice(&query[4..6]); // QDCOUNT
    buf.extend_from_slice(&ancount.to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&query[12..]);
    buf
}

/// An answer carrying one A record.
fn answer(query: &[u8], addr: [u8; 4], ttl: u32) -> Vec<u8> {
    let mut buf = reply_base(query, 1);
    buf.extend_from_slice(&[0xC0, 0x0C]); // back to the question name
    buf.extend_from_slice(&1u16.to_be_bytes()); // A
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf.extend_from_slice(&ttl.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&addr);
    buf
}

/// An empty answer with the given rcode.
fn rcode_reply(query: &[u8], rcode: u8) -> Vec<u8> {
    let mut buf = reply_base(query, 0);
    buf[3] |= rcode & 0x0F;
    buf
}

/// An empty answer with the TC bit set.
fn truncated_reply(query: &[u8]) -> Vec<u8> {
    let mut buf = reply_base(query, 0);
    buf[2] |= 0x02; // TC
    buf
}

/// Extracts the A record address from a reply built by this responder.
pub fn answer_addr(reply: &[u8]) -> Option<[u8; 4]> {
    if reply.len() < 4 {
        return None;
    }
    reply[reply.len() - 4..].try_into().ok()
}
