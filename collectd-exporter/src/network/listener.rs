//! UDP listener for collectd's network plugin.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use collectd_common::Sample;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use super::parser::parse_packet;
use super::typesdb::TypesDb;
use crate::config::CollectdConfig;
use crate::ingest::SharedIngestor;

/// Listener statistics.
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    /// Datagrams received.
    pub packets_received: u64,
    /// Datagrams rejected as malformed.
    pub packets_rejected: u64,
}

/// Shared handle to listener statistics.
pub type SharedListenerStats = Arc<RwLock<ListenerStats>>;

/// A bound collectd network listener.
pub struct BinaryListener {
    socket: UdpSocket,
    max_packet_size: usize,
    channel_capacity: usize,
    stats: SharedListenerStats,
}

impl BinaryListener {
    /// Bind the configured address, joining its multicast group if needed.
    pub fn bind(config: &CollectdConfig) -> Result<Self> {
        let listen = config
            .listen
            .as_deref()
            .context("collectd listen address is not configured")?;
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("Invalid collectd listen address: {}", listen))?;

        let socket = bind_socket(addr, config.udp_buffer)
            .with_context(|| format!("Failed to bind UDP socket to {}", addr))?;

        let socket = UdpSocket::from_std(socket.into())
            .with_context(|| format!("Failed to register UDP socket {}", addr))?;

        Ok(Self {
            socket,
            max_packet_size: config.max_packet_size,
            channel_capacity: config.channel_capacity,
            stats: Arc::new(RwLock::new(ListenerStats::default())),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> SharedListenerStats {
        self.stats.clone()
    }

    /// Receive and ingest packets until shutdown.
    ///
    /// Decoding happens on the receive task; a writer task drains decoded
    /// batches into the ingestor. A full channel pauses receiving. A receive
    /// error ends the listener with that error.
    pub async fn run(
        self,
        ingestor: SharedIngestor,
        typesdb: Option<Arc<TypesDb>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!("collectd network listener started on {}", local_addr);

        let (tx, rx) = mpsc::channel::<Vec<Sample>>(self.channel_capacity);
        let writer = tokio::spawn(write_batches(rx, ingestor.clone()));

        let mut buf = vec![0u8; self.max_packet_size];

        let result = loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            break Err(anyhow::Error::new(e)
                                .context(format!("UDP receive error on {}", local_addr)));
                        }
                    };

                    self.stats.write().packets_received += 1;

                    match parse_packet(&buf[..len], typesdb.as_deref()) {
                        Ok(packet) => {
                            if !packet.rejected.is_empty() {
                                for e in &packet.rejected {
                                    tracing::debug!(peer = %peer, error = %e, "Rejected value list");
                                }
                                ingestor.record_rejected(packet.rejected.len());
                            }
                            ingestor.record_skipped_values(packet.skipped_values);

                            if !packet.samples.is_empty() && tx.send(packet.samples).await.is_err() {
                                break Err(anyhow::anyhow!("collectd writer task stopped"));
                            }
                        }
                        Err(e) => {
                            self.stats.write().packets_rejected += 1;
                            tracing::debug!(peer = %peer, error = %e, "Rejected collectd packet");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("collectd network listener shutting down");
                        break Ok(());
                    }
                }
            }
        };

        // Let the writer drain what was already decoded.
        drop(tx);
        if let Err(e) = writer.await {
            tracing::warn!("collectd writer task failed: {}", e);
        }

        result
    }
}

async fn write_batches(mut rx: mpsc::Receiver<Vec<Sample>>, ingestor: SharedIngestor) {
    while let Some(samples) = rx.recv().await {
        let report = ingestor.write_batch(samples);
        if !report.is_complete() {
            tracing::debug!(
                accepted = report.accepted,
                rejected = report.rejected,
                "Partially ingested collectd packet"
            );
        }
    }
}

fn bind_socket(addr: SocketAddr, recv_buffer: usize) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if recv_buffer > 0 {
        socket.set_recv_buffer_size(recv_buffer)?;
    }

    if addr.ip().is_multicast() {
        socket.set_reuse_address(true)?;
        match addr.ip() {
            IpAddr::V4(group) => {
                socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port()).into())?;
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            }
            IpAddr::V6(group) => {
                socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), addr.port()).into())?;
                socket.join_multicast_v6(&group, 0)?;
            }
        }
        tracing::info!("Joined multicast group {}", addr.ip());
    } else {
        socket.bind(&addr.into())?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}
