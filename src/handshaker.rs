//! Handshaker: forwards "ready for handshake" signals onto the pubsub bus
//! (see spec §4.4).
//!
//! Unlike Binder/Tunneler, this component is purely best-effort: no store
//! writes, no coalescing, no retry with backoff. A dropped signal just means
//! the two peers' clients will re-fire the handshake attempt on their own.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::pubsub::Pubsub;

const NUM_HANDSHAKER_WORKERS: usize = 5;
const TOPIC_READY_FOR_HANDSHAKE: &str = "tailnet_ready_for_handshake";

#[derive(Debug, Clone, Copy)]
pub struct ReadyForHandshake {
    pub to: Uuid,
    pub from: Uuid,
}

pub struct Handshaker {
    tx: mpsc::Sender<ReadyForHandshake>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Handshaker {
    pub fn new(pubsub: Arc<dyn Pubsub>) -> Self {
        let (tx, rx) = mpsc::channel(NUM_HANDSHAKER_WORKERS * 4);
        let cancel = CancellationToken::new();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(NUM_HANDSHAKER_WORKERS);
        for _ in 0..NUM_HANDSHAKER_WORKERS {
            workers.push(tokio::spawn(worker_loop(
                pubsub.clone(),
                rx.clone(),
                cancel.clone(),
            )));
        }
        Self {
            tx,
            cancel,
            workers,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<ReadyForHandshake> {
        self.tx.clone()
    }

    pub async fn close(self) {
        self.cancel.cancel();
        for w in self.workers {
            let _ = w.await;
        }
    }
}

async fn worker_loop(
    pubsub: Arc<dyn Pubsub>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ReadyForHandshake>>>,
    cancel: CancellationToken,
) {
    loop {
        let signal = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                maybe = rx.recv() => match maybe {
                    Some(s) => s,
                    None => return,
                },
            }
        };
        let payload = format!("{},{}", signal.to, signal.from);
        if let Err(e) = pubsub
            .publish(TOPIC_READY_FOR_HANDSHAKE, payload.as_bytes())
            .await
        {
            warn!(to = %signal.to, from = %signal.from, error = %e, "failed to publish ready-for-handshake signal");
        }
    }
}
