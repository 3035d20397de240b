//! ZeroMQ publication.
//!
//! Binds a PUB socket at construction and sends each ingested record as
//! one message. Overflow toward slow subscribers is bounded by the
//! socket's high-water mark; the ingest queue itself back-pressures the
//! recorders like the file writer does.

use crate::WriterError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

const QUEUE: usize = 1;

pub struct ZmqWriter {
    tx: mpsc::Sender<Vec<u8>>,
    sig: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    done: AtomicBool,
}

impl std::fmt::Debug for ZmqWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqWriter").finish_non_exhaustive()
    }
}

impl ZmqWriter {
    /// Bind `tcp://*:port` and launch the send loop.
    pub fn bind(port: u16, high_water_mark: i32) -> Result<Self, WriterError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_sndhwm(high_water_mark)?;
        socket.bind(&format!("tcp://*:{}", port))?;
        tracing::info!("zmq writer publishing on tcp://*:{}", port);

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(QUEUE);
        let (sig, mut sig_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sig_rx.changed() => {
                        while let Ok(payload) = rx.try_recv() {
                            if let Err(e) = socket.send(payload, 0) {
                                tracing::warn!("zmq send failed: {}", e);
                            }
                        }
                        break;
                    }
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        // PUB drops at the high-water mark instead of blocking.
                        if let Err(e) = socket.send(payload, 0) {
                            tracing::warn!("zmq send failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("zmq writer stopped");
        });

        Ok(Self {
            tx,
            sig,
            task: Mutex::new(Some(task)),
            done: AtomicBool::new(false),
        })
    }

    pub async fn stop(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sig.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl pbtc_recorder::Writer for ZmqWriter {
    async fn line(&self, line: String) {
        let _ = self.tx.send(line.into_bytes()).await;
    }

    async fn bytes(&self, payload: Vec<u8>) {
        let _ = self.tx.send(payload).await;
    }
}
