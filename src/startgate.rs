//! Worker start gate.
//!
//! Binder, Tunneler, and Querier fan-in loops run immediately so that no
//! update is ever dropped, but their worker pools wait for the replica's
//! first heartbeat before writing anything — a freshly started replica
//! shouldn't race other replicas to the store before anyone can see it's
//! alive. See spec §4.6 and the Heartbeats "first heartbeat" signal.

use tokio::sync::watch;

#[derive(Clone)]
pub struct StartGate {
    rx: watch::Receiver<bool>,
}

pub struct StartGateOpener {
    tx: watch::Sender<bool>,
}

pub fn start_gate() -> (StartGateOpener, StartGate) {
    let (tx, rx) = watch::channel(false);
    (StartGateOpener { tx }, StartGate { rx })
}

impl StartGateOpener {
    pub fn open(self) {
        let _ = self.tx.send(true);
    }
}

impl StartGate {
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    /// A gate that is already open; used in tests and single-shot setups
    /// that don't model the heartbeat handshake.
    pub fn open_now() -> Self {
        let (opener, gate) = start_gate();
        opener.open();
        gate
    }
}
