pub mod socket;
pub mod stream;

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::{broadcast, mpsc};

use crate::models::InboundMessage;

/// One live persistent-socket session's delivery channel. The session task
/// reads from the receiving half and writes socket frames; the registry
/// only ever touches the sending half — never closes it while holding the
/// map lock.
pub struct SocketHandle {
    pub tx: mpsc::UnboundedSender<InboundMessage>,
    pub replaced_tx: mpsc::UnboundedSender<()>,
}

/// One live event-stream session's delivery channel, carrying the event id
/// the router allocated at fanout time alongside the message.
pub struct StreamHandle {
    pub tx: mpsc::UnboundedSender<(i64, InboundMessage)>,
}

pub const MAX_STREAMS_PER_PRINCIPAL: usize = 2;

/// Principal-id-keyed session maps shared by the router and both session
/// handlers. A `RwLock` per map gives readers (the router, on every
/// fanout decision) snapshot consistency without blocking on session
/// churn.
pub struct SessionRegistry {
    sockets: RwLock<HashMap<String, SocketHandle>>,
    streams: RwLock<HashMap<String, Vec<StreamHandle>>>,
    shutdown: broadcast::Sender<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        SessionRegistry {
            sockets: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            shutdown,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the shutdown signal — every socket/stream session
    /// holds one for the lifetime of its select loop.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Broadcast a graceful shutdown to every live session, so each can
    /// close with its own shutdown code or event.
    pub fn shutdown_all(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn has_socket(&self, principal_id: &str) -> bool {
        self.sockets.read().unwrap().contains_key(principal_id)
    }

    pub fn has_stream(&self, principal_id: &str) -> bool {
        self.streams
            .read()
            .unwrap()
            .get(principal_id)
            .is_some_and(|v| !v.is_empty())
    }

    /// Every principal id with at least one live socket or stream session —
    /// used by the revocation-while-connected watch to find sessions whose
    /// token may have been dropped from the registry since they connected.
    pub fn live_principal_ids(&self) -> std::collections::HashSet<String> {
        let mut ids: std::collections::HashSet<String> =
            self.sockets.read().unwrap().keys().cloned().collect();
        ids.extend(self.streams.read().unwrap().keys().cloned());
        ids
    }

    pub fn stream_count(&self, principal_id: &str) -> usize {
        self.streams
            .read()
            .unwrap()
            .get(principal_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Install a new socket session, returning the prior one (if any) so
    /// the caller can send it `REPLACED` and close it *after* releasing
    /// this lock.
    pub fn install_socket(&self, principal_id: &str, handle: SocketHandle) -> Option<SocketHandle> {
        self.sockets.write().unwrap().insert(principal_id.to_string(), handle)
    }

    /// Remove a socket session, but only if `expect_tx` is still the
    /// installed one — prevents a stale session's cleanup from evicting a
    /// session that has since replaced it.
    pub fn remove_socket_if_current(&self, principal_id: &str, expect_tx: &mpsc::UnboundedSender<InboundMessage>) {
        let mut sockets = self.sockets.write().unwrap();
        if let Some(handle) = sockets.get(principal_id) {
            if handle.tx.same_channel(expect_tx) {
                sockets.remove(principal_id);
            }
        }
    }

    pub fn add_stream(&self, principal_id: &str, handle: StreamHandle) {
        self.streams
            .write()
            .unwrap()
            .entry(principal_id.to_string())
            .or_default()
            .push(handle);
    }

    pub fn remove_stream(&self, principal_id: &str, tx: &mpsc::UnboundedSender<(i64, InboundMessage)>) {
        let mut streams = self.streams.write().unwrap();
        if let Some(handles) = streams.get_mut(principal_id) {
            handles.retain(|h| !h.tx.same_channel(tx));
            if handles.is_empty() {
                streams.remove(principal_id);
            }
        }
    }

    pub fn deliver_socket(&self, principal_id: &str, msg: &InboundMessage) -> bool {
        let sockets = self.sockets.read().unwrap();
        match sockets.get(principal_id) {
            Some(handle) => handle.tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }

    /// Deliver to every live stream for this principal with the same event
    /// id: if multiple streams exist for one principal, all receive the
    /// same event id.
    pub fn deliver_streams(&self, principal_id: &str, event_id: i64, msg: &InboundMessage) -> bool {
        let streams = self.streams.read().unwrap();
        match streams.get(principal_id) {
            Some(handles) if !handles.is_empty() => {
                let mut any = false;
                for handle in handles {
                    if handle.tx.send((event_id, msg.clone())).is_ok() {
                        any = true;
                    }
                }
                any
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderKind;

    fn sample_message() -> InboundMessage {
        InboundMessage {
            message_id: "m1".to_string(),
            room_id: "room-1".to_string(),
            room_name: "general".to_string(),
            sender_username: "alice".to_string(),
            sender_principal_id: None,
            sender_kind: SenderKind::Human,
            content: "hi".to_string(),
            timestamp: "2026-07-27T00:00:00Z".to_string(),
        }
    }

    fn socket_handle() -> (SocketHandle, mpsc::UnboundedReceiver<InboundMessage>, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (replaced_tx, replaced_rx) = mpsc::unbounded_channel();
        (SocketHandle { tx, replaced_tx }, rx, replaced_rx)
    }

    #[test]
    fn install_socket_replaces_prior_for_same_principal() {
        let registry = SessionRegistry::new();
        let (handle1, _rx1, mut replaced_rx1) = socket_handle();
        let (handle2, _rx2, _replaced_rx2) = socket_handle();

        assert!(registry.install_socket("p1", handle1).is_none());
        let prior = registry.install_socket("p1", handle2);
        assert!(prior.is_some());

        // Caller is expected to notify the prior session's replaced channel.
        prior.unwrap().replaced_tx.send(()).unwrap();
        assert!(replaced_rx1.try_recv().is_ok());
        assert!(registry.has_socket("p1"));
    }

    #[test]
    fn remove_socket_if_current_ignores_stale_handle() {
        let registry = SessionRegistry::new();
        let (handle1, _rx1, _r1) = socket_handle();
        let stale_tx = handle1.tx.clone();
        registry.install_socket("p1", handle1);

        let (handle2, _rx2, _r2) = socket_handle();
        registry.install_socket("p1", handle2);

        // The stale session's own cleanup must not evict the new one.
        registry.remove_socket_if_current("p1", &stale_tx);
        assert!(registry.has_socket("p1"));
    }

    #[test]
    fn remove_socket_if_current_removes_matching_handle() {
        let registry = SessionRegistry::new();
        let (handle, _rx, _r) = socket_handle();
        let tx = handle.tx.clone();
        registry.install_socket("p1", handle);
        registry.remove_socket_if_current("p1", &tx);
        assert!(!registry.has_socket("p1"));
    }

    #[test]
    fn deliver_socket_sends_to_installed_handle() {
        let registry = SessionRegistry::new();
        let (handle, mut rx, _r) = socket_handle();
        registry.install_socket("p1", handle);

        assert!(registry.deliver_socket("p1", &sample_message()));
        let received = rx.try_recv().expect("message delivered");
        assert_eq!(received.message_id, "m1");
    }

    #[test]
    fn deliver_socket_to_unknown_principal_returns_false() {
        let registry = SessionRegistry::new();
        assert!(!registry.deliver_socket("nobody", &sample_message()));
    }

    #[test]
    fn stream_cap_is_enforced_by_caller_via_stream_count() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.add_stream("p1", StreamHandle { tx: tx1 });
        registry.add_stream("p1", StreamHandle { tx: tx2 });
        assert_eq!(registry.stream_count("p1"), MAX_STREAMS_PER_PRINCIPAL);
    }

    #[test]
    fn deliver_streams_reaches_every_handle_for_principal() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.add_stream("p1", StreamHandle { tx: tx1 });
        registry.add_stream("p1", StreamHandle { tx: tx2 });

        assert!(registry.deliver_streams("p1", 42, &sample_message()));
        assert_eq!(rx1.try_recv().unwrap().0, 42);
        assert_eq!(rx2.try_recv().unwrap().0, 42);
    }

    #[test]
    fn remove_stream_drops_empty_entry() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add_stream("p1", StreamHandle { tx: tx.clone() });
        assert!(registry.has_stream("p1"));
        registry.remove_stream("p1", &tx);
        assert!(!registry.has_stream("p1"));
    }

    #[test]
    fn live_principal_ids_merges_socket_and_stream_holders() {
        let registry = SessionRegistry::new();
        let (handle, _rx, _r) = socket_handle();
        registry.install_socket("p-socket", handle);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add_stream("p-stream", StreamHandle { tx });

        let live = registry.live_principal_ids();
        assert!(live.contains("p-socket"));
        assert!(live.contains("p-stream"));
        assert_eq!(live.len(), 2);
    }
}
