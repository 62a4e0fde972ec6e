use tokio::sync::watch;

pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    fn watch(&self) -> watch::Receiver<bool>;
}

/// Watch-channel backed monitor; the embedding platform layer drives
/// `set_online` from its own reachability callbacks.
pub struct SharedConnectivity {
    tx: watch::Sender<bool>,
}

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }
}

impl ConnectivityMonitor for SharedConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
