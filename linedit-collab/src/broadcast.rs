//! Fan-out to every logged-in connection, with dead-peer pruning.
//!
//! ```text
//! broadcast(frame, exclude)
//!   ├─ sweep: try_send to each peer ≠ exclude     (never blocks)
//!   ├─ evict + release every peer that could not take the frame
//!   └─ if anyone was released: sweep USER_LIST to the rest, repeat
//! ```
//!
//! A peer fails delivery when its writer is gone or its outbox is full. A
//! full peer is told to shut down, since it would otherwise keep a stale view
//! of presence and files. Membership strictly shrinks on every repeat, so the
//! loop terminates.
//!
//! Every `USER_LIST` is built and swept under one presence lock, so the last
//! one a peer receives always reflects the latest registry state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::presence::{ConnectionId, Delivery, Peer, SessionRegistry};
use crate::protocol::Frame;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub deliveries: u64,
    pub lagged: u64,
    pub pruned: u64,
}

/// Lock-free counters, read via [`Broadcaster::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    deliveries: AtomicU64,
    lagged: AtomicU64,
    pruned: AtomicU64,
}

/// Outcome of one [`Broadcaster::broadcast`] call, including any presence
/// follow-ups it triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    /// Peers dropped because their outbox was full.
    pub lagged: usize,
    /// Usernames released because their connection failed delivery.
    pub pruned: Vec<String>,
    /// Number of `USER_LIST` sweeps issued after pruning.
    pub presence_followups: usize,
}

pub struct Broadcaster {
    sessions: Arc<SessionRegistry>,
    presence_order: Mutex<()>,
    stats: AtomicBroadcastStats,
}

impl Broadcaster {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            sessions,
            presence_order: Mutex::new(()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Deliver `frame` to every logged-in connection except `exclude`.
    pub async fn broadcast(&self, frame: Frame, exclude: Option<ConnectionId>) -> FanoutReport {
        let mut report = FanoutReport::default();
        let failed = self.sweep(&Arc::new(frame), exclude, &mut report).await;
        if !failed.is_empty() {
            let _presence = self.presence_order.lock().await;
            self.prune(failed, &mut report).await;
        }
        report
    }

    /// `USER_LIST` with the current registry state to every logged-in
    /// connection.
    pub async fn broadcast_presence(&self) -> FanoutReport {
        let mut report = FanoutReport::default();
        let _presence = self.presence_order.lock().await;
        let frame = Arc::new(Frame::user_list(self.sessions.active_usernames().await));
        let failed = self.sweep(&frame, None, &mut report).await;
        self.prune(failed, &mut report).await;
        report
    }

    /// Release `failed` peers and announce presence until a sweep succeeds
    /// everywhere. Caller holds `presence_order`.
    async fn prune(&self, mut failed: Vec<Peer>, report: &mut FanoutReport) {
        while !failed.is_empty() {
            let mut released = 0;
            for peer in failed.drain(..) {
                // Another task may already have cleaned this one up.
                if let Some(username) = self.sessions.release(peer.id()).await {
                    log::info!("Pruned connection {} ({username})", peer.id());
                    report.pruned.push(username);
                    released += 1;
                }
            }
            self.stats.pruned.fetch_add(released as u64, Ordering::Relaxed);
            if released == 0 {
                break;
            }

            let frame = Arc::new(Frame::user_list(self.sessions.active_usernames().await));
            report.presence_followups += 1;
            failed = self.sweep(&frame, None, report).await;
        }
    }

    /// One delivery pass. Returns the peers that could not take the frame;
    /// lagging ones have already been told to shut down.
    async fn sweep(
        &self,
        frame: &Arc<Frame>,
        exclude: Option<ConnectionId>,
        report: &mut FanoutReport,
    ) -> Vec<Peer> {
        let peers = self.sessions.peers().await;
        let mut failed = Vec::new();
        let (mut delivered, mut lagged) = (0, 0);

        for peer in peers.into_iter().filter(|p| Some(p.id()) != exclude) {
            match peer.try_deliver(frame.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Lagged => {
                    log::warn!("Peer {} outbox full at {}, evicting", peer.id(), frame.command);
                    peer.evict();
                    lagged += 1;
                    failed.push(peer);
                }
                Delivery::Closed => failed.push(peer),
            }
        }

        report.delivered += delivered;
        report.lagged += lagged;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.lagged.fetch_add(lagged as u64, Ordering::Relaxed);
        failed
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
            pruned: self.stats.pruned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Outgoing;
    use crate::protocol::Command;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    async fn join(
        registry: &SessionRegistry,
        name: &str,
        capacity: usize,
    ) -> (Peer, mpsc::Receiver<Outgoing>) {
        let (peer, rx) = Peer::channel(capacity);
        registry.claim(&peer, name).await.unwrap();
        (peer, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Arc<Frame>> {
        let mut frames = Vec::new();
        while let Ok(outgoing) = rx.try_recv() {
            frames.push(outgoing.frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = Arc::new(SessionRegistry::new());
        let (_a, mut rx_a) = join(&registry, "alice", 8).await;
        let (_b, mut rx_b) = join(&registry, "bob", 8).await;
        let broadcaster = Broadcaster::new(registry);

        let report = broadcaster.broadcast(Frame::file_list(vec!["f".into()]), None).await;
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut rx_a) = join(&registry, "alice", 8).await;
        let (_b, mut rx_b) = join(&registry, "bob", 8).await;
        let (_c, mut rx_c) = join(&registry, "carol", 8).await;
        let broadcaster = Broadcaster::new(registry);

        let frame = Frame::file_sync("f", &["x".to_string()]);
        let report = broadcaster.broadcast(frame.clone(), Some(a.id())).await;

        assert_eq!(report.delivered, 2);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(*drain(&mut rx_b)[0], frame);
        assert_eq!(*drain(&mut rx_c)[0], frame);
    }

    #[tokio::test]
    async fn test_dead_peer_pruned_with_single_presence_followup() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut rx_a) = join(&registry, "alice", 8).await;
        let (_b, mut rx_b) = join(&registry, "bob", 8).await;
        let (_c, rx_c) = join(&registry, "carol", 8).await;
        drop(rx_c);
        let broadcaster = Broadcaster::new(registry.clone());

        let frame = Frame::file_sync("f", &[]);
        let report = broadcaster.broadcast(frame.clone(), Some(a.id())).await;

        assert_eq!(report.pruned, vec!["carol"]);
        assert_eq!(report.presence_followups, 1);
        assert_eq!(registry.active_usernames().await, vec!["alice", "bob"]);

        // Origin is excluded from the frame but sees the presence update.
        let a_frames = drain(&mut rx_a);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0].command, Command::UserList);
        assert_eq!(a_frames[0].args, vec!["alice", "bob"]);

        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames.len(), 2);
        assert_eq!(*b_frames[0], frame);
        assert_eq!(b_frames[1].command, Command::UserList);

        assert_eq!(broadcaster.stats().pruned, 1);
    }

    #[tokio::test]
    async fn test_all_peers_dead_terminates() {
        let registry = Arc::new(SessionRegistry::new());
        for name in ["a", "b", "c"] {
            let (_peer, rx) = join(&registry, name, 1).await;
            drop(rx);
        }
        let broadcaster = Broadcaster::new(registry.clone());

        let report = broadcaster.broadcast(Frame::user_list(Vec::new()), None).await;
        assert_eq!(report.pruned.len(), 3);
        assert_eq!(report.presence_followups, 1);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_outbox_evicts_and_prunes_peer() {
        let registry = Arc::new(SessionRegistry::new());
        let (slow, mut rx_slow) = join(&registry, "slow", 1).await;
        let (_fast, mut rx_fast) = join(&registry, "fast", 8).await;
        let broadcaster = Broadcaster::new(registry.clone());

        broadcaster.broadcast(Frame::file_list(vec!["1".into()]), None).await;
        let report = broadcaster.broadcast(Frame::file_list(vec!["2".into()]), None).await;

        assert_eq!(report.lagged, 1);
        assert_eq!(report.pruned, vec!["slow"]);
        assert_eq!(report.presence_followups, 1);
        assert_eq!(registry.active_usernames().await, vec!["fast"]);
        timeout(Duration::from_secs(1), slow.evicted())
            .await
            .expect("lagging peer was not evicted");

        // The slow peer keeps only what fit; the others learn it left.
        assert_eq!(drain(&mut rx_slow).len(), 1);
        let fast_frames = drain(&mut rx_fast);
        assert_eq!(fast_frames.len(), 3);
        assert_eq!(fast_frames[2].command, Command::UserList);
        assert_eq!(fast_frames[2].args, vec!["fast"]);
        assert_eq!(broadcaster.stats().lagged, 1);
        assert_eq!(broadcaster.stats().pruned, 1);
    }

    #[tokio::test]
    async fn test_presence_broadcast_prunes_full_peer() {
        let registry = Arc::new(SessionRegistry::new());
        let (_a, _rx_a) = join(&registry, "a", 1).await;
        let broadcaster = Broadcaster::new(registry.clone());

        broadcaster.broadcast_presence().await;
        let (_b, mut rx_b) = join(&registry, "b", 8).await;
        let report = broadcaster.broadcast_presence().await;

        assert_eq!(report.pruned, vec!["a"]);
        let frames = drain(&mut rx_b);
        assert_eq!(frames.last().unwrap().args, vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_presence_matches_registry() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let (_watcher, mut rx) = join(&registry, "watcher", 1024).await;

        let mut tasks = Vec::new();
        for i in 0..40 {
            let registry = registry.clone();
            let broadcaster = broadcaster.clone();
            tasks.push(tokio::spawn(async move {
                let (peer, rx) = Peer::channel(1024);
                registry.claim(&peer, &format!("user{i}")).await.unwrap();
                broadcaster.broadcast_presence().await;
                if i % 2 == 0 {
                    registry.release(peer.id()).await;
                    broadcaster.broadcast_presence().await;
                }
                rx
            }));
        }
        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap());
        }

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.args, registry.active_usernames().await);
        assert_eq!(last.args.len(), 21);
    }

    #[tokio::test]
    async fn test_stats_count_frames() {
        let registry = Arc::new(SessionRegistry::new());
        let (_a, _rx) = join(&registry, "alice", 8).await;
        let broadcaster = Broadcaster::new(registry);

        broadcaster.broadcast(Frame::file_list(Vec::new()), None).await;
        broadcaster.broadcast(Frame::file_list(Vec::new()), None).await;

        let stats = broadcaster.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.deliveries, 2);
    }
}
