//! Snapshot fan-out to TCP subscribers.
//!
//! Every snapshot goes out as one line of JSON to each connected subscriber.
//! All writes of one snapshot share a single deadline, so a stalled client
//! costs at most `send_timeout` per spill. A subscriber whose write fails or
//! times out is disconnected; nothing is retried or queued.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use super::{Delivery, Sink};
use crate::spill::snapshot::Snapshot;

struct Subscriber {
    peer: SocketAddr,
    stream: TcpStream,
}

/// Publishes snapshots to every client connected to a listening socket.
pub struct TcpPublisher {
    local_addr: SocketAddr,
    send_timeout: Duration,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl TcpPublisher {
    /// Binds the listening socket and starts accepting subscribers.
    ///
    /// Fails when the address cannot be bound.
    pub fn bind(addr: SocketAddr, send_timeout: Duration) -> Result<Self> {
        if send_timeout.is_zero() {
            bail!("send timeout must be positive");
        }

        let listener =
            TcpListener::bind(addr).with_context(|| format!("binding publish socket {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("getting publish socket address")?;

        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let acceptor = thread::Builder::new()
            .name("publish-accept".into())
            .spawn({
                let subscribers = Arc::clone(&subscribers);
                let running = Arc::clone(&running);
                move || accept_loop(listener, subscribers, running)
            })
            .context("spawning publish accept thread")?;

        tracing::info!(addr = %local_addr, ?send_timeout, "publishing snapshots");

        Ok(Self {
            local_addr,
            send_timeout,
            subscribers,
            running,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Stops accepting new subscribers and disconnects the current ones.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the acceptor blocked in accept().
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(100));
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        self.subscribers.lock().clear();
    }

    /// Writes one line to every subscriber under a shared deadline.
    fn broadcast(&self, line: &[u8]) -> Delivery {
        let deadline = Instant::now() + self.send_timeout;
        let mut delivered = 0;
        let mut dropped = 0;

        self.subscribers.lock().retain_mut(|sub| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                dropped += 1;
                tracing::debug!(peer = %sub.peer, "send budget exhausted, skipping subscriber");
                return true;
            }

            match write_before(&mut sub.stream, line, deadline) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    dropped += 1;
                    tracing::warn!(peer = %sub.peer, error = %e, "dropping subscriber");
                    false
                }
            }
        });

        Delivery::Published { delivered, dropped }
    }
}

impl Sink for TcpPublisher {
    fn name(&self) -> &str {
        "tcp"
    }

    fn publish(&mut self, snapshot: &Snapshot) -> Result<Delivery> {
        let mut line = snapshot.to_json().context("serializing snapshot")?;
        line.push('\n');
        Ok(self.broadcast(line.as_bytes()))
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes all of `buf`, giving up once `deadline` passes with bytes unsent.
///
/// The socket timeout is re-armed before every `write`, since it bounds each
/// call separately and a slow peer can keep accepting short writes.
fn write_before(stream: &mut TcpStream, mut buf: &[u8], deadline: Instant) -> io::Result<()> {
    while !buf.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("send deadline passed with {} bytes unsent", buf.len()),
            ));
        }
        stream.set_write_timeout(Some(remaining))?;
        match stream.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn accept_loop(
    listener: TcpListener,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    running: Arc<AtomicBool>,
) {
    for conn in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }

        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accepting subscriber");
                continue;
            }
        };

        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(error = %e, "subscriber vanished during accept");
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "setting TCP_NODELAY");
        }

        tracing::info!(peer = %peer, "subscriber connected");
        subscribers.lock().push(Subscriber { peer, stream });
    }
}
