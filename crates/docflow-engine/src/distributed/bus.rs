//! Control-bus abstraction and its two dialects.
//!
//! The manager/worker protocol is transport-agnostic: a lightweight TCP
//! dialect framing one JSON message per line, and an in-process queue
//! broker with work-queue semantics for tests and single-host runs. Both
//! carry the same [`BusMessage`] encoding.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use docflow_types::BusMessage;

use crate::errors::BuildError;

/// Send-queue capacity sized so control messages are never dropped
/// silently: `max(num_chunks, num_workers) × 2`.
#[must_use]
pub fn high_water_mark(num_chunks: usize, num_workers: usize) -> usize {
    num_chunks.max(num_workers).max(1) * 2
}

/// Manager-side control endpoint.
#[async_trait]
pub trait ManagerBus: Send {
    /// Receive the next message along with the sending endpoint's id.
    async fn recv(&mut self) -> Result<(String, BusMessage), BuildError>;

    /// Send a message to one endpoint.
    async fn send(&mut self, endpoint: &str, message: BusMessage) -> Result<(), BuildError>;

    /// Send a message to every connected endpoint (`EXIT` broadcast).
    async fn broadcast(&mut self, message: BusMessage) -> Result<(), BuildError>;
}

/// Worker-side control endpoint.
#[async_trait]
pub trait WorkerBus: Send {
    async fn send(&mut self, message: BusMessage) -> Result<(), BuildError>;
    async fn recv(&mut self) -> Result<BusMessage, BuildError>;
}

fn frame(message: &BusMessage) -> Result<Vec<u8>, BuildError> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| BuildError::bus(format!("unserializable bus message: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

// ---------------------------------------------------------------------------
// TCP dialect
// ---------------------------------------------------------------------------

/// Manager endpoint bound to a TCP listener; workers connect and send
/// newline-delimited JSON messages.
pub struct TcpManagerBus {
    addr: SocketAddr,
    inbox: mpsc::Receiver<(String, BusMessage)>,
    peers: Arc<Mutex<HashMap<String, OwnedWriteHalf>>>,
}

impl TcpManagerBus {
    /// Bind the control endpoint and start accepting workers.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Bus`] if the address cannot be bound.
    pub async fn bind(addr: &str, hwm: usize) -> Result<Self, BuildError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BuildError::bus(format!("failed to bind {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| BuildError::bus(format!("no local address: {e}")))?;
        let (inbox_tx, inbox) = mpsc::channel(hwm.max(1));
        let peers: Arc<Mutex<HashMap<String, OwnedWriteHalf>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_peers = peers.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer_addr)) = listener.accept().await else {
                    break;
                };
                let endpoint = peer_addr.to_string();
                tracing::debug!(%endpoint, "worker connected");
                let (read_half, write_half) = stream.into_split();
                accept_peers.lock().await.insert(endpoint.clone(), write_half);

                let inbox_tx = inbox_tx.clone();
                let peers = accept_peers.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        match serde_json::from_str::<BusMessage>(&line) {
                            Ok(message) => {
                                if inbox_tx.send((endpoint.clone(), message)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%endpoint, "dropping malformed bus message: {err}");
                            }
                        }
                    }
                    peers.lock().await.remove(&endpoint);
                    tracing::debug!(%endpoint, "worker disconnected");
                });
            }
        });

        Ok(Self {
            addr: local,
            inbox,
            peers,
        })
    }

    /// The bound address, useful when binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl ManagerBus for TcpManagerBus {
    async fn recv(&mut self) -> Result<(String, BusMessage), BuildError> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| BuildError::bus("control endpoint closed"))
    }

    async fn send(&mut self, endpoint: &str, message: BusMessage) -> Result<(), BuildError> {
        let line = frame(&message)?;
        let mut peers = self.peers.lock().await;
        let writer = peers
            .get_mut(endpoint)
            .ok_or_else(|| BuildError::bus(format!("unknown endpoint '{endpoint}'")))?;
        writer
            .write_all(&line)
            .await
            .map_err(|e| BuildError::bus(format!("send to '{endpoint}' failed: {e}")))
    }

    async fn broadcast(&mut self, message: BusMessage) -> Result<(), BuildError> {
        let line = frame(&message)?;
        let mut peers = self.peers.lock().await;
        for (endpoint, writer) in peers.iter_mut() {
            if let Err(err) = writer.write_all(&line).await {
                tracing::warn!(%endpoint, "broadcast failed: {err}");
            }
        }
        Ok(())
    }
}

/// Worker endpoint connected to a manager over TCP.
pub struct TcpWorkerBus {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TcpWorkerBus {
    /// Connect to the manager's control endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Bus`] if the connection fails.
    pub async fn connect(addr: &str) -> Result<Self, BuildError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BuildError::bus(format!("failed to connect to {addr}: {e}")))?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }
}

#[async_trait]
impl WorkerBus for TcpWorkerBus {
    async fn send(&mut self, message: BusMessage) -> Result<(), BuildError> {
        let line = frame(&message)?;
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| BuildError::bus(format!("send to manager failed: {e}")))
    }

    async fn recv(&mut self) -> Result<BusMessage, BuildError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| BuildError::bus(format!("recv from manager failed: {e}")))?
            .ok_or_else(|| BuildError::bus("manager closed the connection"))?;
        serde_json::from_str(&line)
            .map_err(|e| BuildError::bus(format!("malformed manager message: {e}")))
    }
}

// ---------------------------------------------------------------------------
// In-process queue-broker dialect
// ---------------------------------------------------------------------------

type BrokerInbox = mpsc::Receiver<(String, BusMessage)>;

/// In-process queue broker: one manager endpoint, any number of worker
/// endpoints, bounded queues with work-queue semantics.
pub struct LocalBroker {
    hwm: usize,
    to_manager_tx: mpsc::Sender<(String, BusMessage)>,
    to_manager_rx: Option<BrokerInbox>,
    outboxes: Arc<StdMutex<HashMap<String, mpsc::Sender<BusMessage>>>>,
}

impl LocalBroker {
    #[must_use]
    pub fn new(hwm: usize) -> Self {
        let (to_manager_tx, to_manager_rx) = mpsc::channel(hwm.max(1));
        Self {
            hwm: hwm.max(1),
            to_manager_tx,
            to_manager_rx: Some(to_manager_rx),
            outboxes: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Take the single manager endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Bus`] if called twice.
    pub fn manager_endpoint(&mut self) -> Result<LocalManagerBus, BuildError> {
        let inbox = self
            .to_manager_rx
            .take()
            .ok_or_else(|| BuildError::bus("broker already has a manager endpoint"))?;
        Ok(LocalManagerBus {
            inbox,
            outboxes: self.outboxes.clone(),
        })
    }

    /// Register a worker endpoint under `worker_id`.
    pub fn worker_endpoint(&self, worker_id: impl Into<String>) -> LocalWorkerBus {
        let worker_id = worker_id.into();
        let (tx, inbox) = mpsc::channel(self.hwm);
        if let Ok(mut outboxes) = self.outboxes.lock() {
            outboxes.insert(worker_id.clone(), tx);
        }
        LocalWorkerBus {
            worker_id,
            to_manager: self.to_manager_tx.clone(),
            inbox,
        }
    }
}

/// Manager endpoint of a [`LocalBroker`].
pub struct LocalManagerBus {
    inbox: BrokerInbox,
    outboxes: Arc<StdMutex<HashMap<String, mpsc::Sender<BusMessage>>>>,
}

impl LocalManagerBus {
    fn outbox(&self, endpoint: &str) -> Result<mpsc::Sender<BusMessage>, BuildError> {
        let outboxes = self
            .outboxes
            .lock()
            .map_err(|_| BuildError::bus("broker lock poisoned"))?;
        outboxes
            .get(endpoint)
            .cloned()
            .ok_or_else(|| BuildError::bus(format!("unknown endpoint '{endpoint}'")))
    }
}

#[async_trait]
impl ManagerBus for LocalManagerBus {
    async fn recv(&mut self) -> Result<(String, BusMessage), BuildError> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| BuildError::bus("every worker endpoint dropped"))
    }

    async fn send(&mut self, endpoint: &str, message: BusMessage) -> Result<(), BuildError> {
        self.outbox(endpoint)?
            .send(message)
            .await
            .map_err(|_| BuildError::bus(format!("endpoint '{endpoint}' is gone")))
    }

    async fn broadcast(&mut self, message: BusMessage) -> Result<(), BuildError> {
        let targets: Vec<(String, mpsc::Sender<BusMessage>)> = {
            let outboxes = self
                .outboxes
                .lock()
                .map_err(|_| BuildError::bus("broker lock poisoned"))?;
            outboxes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (endpoint, tx) in targets {
            if tx.send(message.clone()).await.is_err() {
                tracing::debug!(%endpoint, "broadcast skipped dead endpoint");
            }
        }
        Ok(())
    }
}

/// Worker endpoint of a [`LocalBroker`].
pub struct LocalWorkerBus {
    worker_id: String,
    to_manager: mpsc::Sender<(String, BusMessage)>,
    inbox: mpsc::Receiver<BusMessage>,
}

#[async_trait]
impl WorkerBus for LocalWorkerBus {
    async fn send(&mut self, message: BusMessage) -> Result<(), BuildError> {
        self.to_manager
            .send((self.worker_id.clone(), message))
            .await
            .map_err(|_| BuildError::bus("manager endpoint is gone"))
    }

    async fn recv(&mut self) -> Result<BusMessage, BuildError> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| BuildError::bus("broker closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_is_twice_the_larger_side() {
        assert_eq!(high_water_mark(3, 2), 6);
        assert_eq!(high_water_mark(1, 4), 8);
        assert_eq!(high_water_mark(0, 0), 2);
    }

    #[tokio::test]
    async fn local_broker_routes_both_ways() {
        let mut broker = LocalBroker::new(4);
        let mut manager = broker.manager_endpoint().unwrap();
        let mut worker = broker.worker_endpoint("w1");

        worker
            .send(BusMessage::Ready {
                worker_id: "w1".into(),
                num_workers: 2,
            })
            .await
            .unwrap();
        let (endpoint, message) = manager.recv().await.unwrap();
        assert_eq!(endpoint, "w1");
        assert!(matches!(message, BusMessage::Ready { .. }));

        manager.send("w1", BusMessage::Exit).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), BusMessage::Exit);
    }

    #[tokio::test]
    async fn local_broker_single_manager() {
        let mut broker = LocalBroker::new(4);
        let _manager = broker.manager_endpoint().unwrap();
        assert!(broker.manager_endpoint().is_err());
    }

    #[tokio::test]
    async fn tcp_bus_roundtrip() {
        let mut manager = TcpManagerBus::bind("127.0.0.1:0", 4).await.unwrap();
        let addr = manager.local_addr().to_string();
        let mut worker = TcpWorkerBus::connect(&addr).await.unwrap();

        worker
            .send(BusMessage::Ready {
                worker_id: "w1".into(),
                num_workers: 1,
            })
            .await
            .unwrap();
        let (endpoint, message) = manager.recv().await.unwrap();
        assert!(matches!(message, BusMessage::Ready { .. }));

        manager
            .send(
                &endpoint,
                BusMessage::Chunk {
                    index: 0,
                    total: 1,
                    builder: serde_json::json!({"type": "copy"}),
                },
            )
            .await
            .unwrap();
        let received = worker.recv().await.unwrap();
        assert!(matches!(received, BusMessage::Chunk { index: 0, .. }));

        manager.broadcast(BusMessage::Exit).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), BusMessage::Exit);
    }
}
