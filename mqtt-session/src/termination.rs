// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! `watchClientSessions()` broadcast source (`spec.md` §4.4, §5).

use tokio::sync::mpsc;

use crate::connector::ClientId;

/// Emitted whenever a client's session ends, on the server side
/// (`spec.md` §4.4, §8 scenario 5).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientSessionTerminated {
    pub client_id: ClientId,
}

/// A bounded multi-subscriber broadcast with **drop-newest** overflow,
/// unlike `tokio::sync::broadcast` (which drops the oldest and reports
/// `Lagged` to readers). Each subscriber gets its own bounded `mpsc`
/// channel; a `try_send` that would block because that one subscriber is
/// full just drops the new notification for that subscriber only
/// (`spec.md` §5, §9 Open Question — documented to consumers, not
/// silently fixed).
pub struct TerminationWatcher {
    subscribers: Vec<mpsc::Sender<ClientSessionTerminated>>,
    buffer_size: usize,
}

impl TerminationWatcher {
    pub fn new(buffer_size: usize) -> Self {
        TerminationWatcher {
            subscribers: Vec::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<ClientSessionTerminated> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.push(tx);
        rx
    }

    /// Publish a termination notice to every live subscriber, dropping
    /// the notice (not panicking, not blocking) for any subscriber whose
    /// queue is already full.
    pub fn publish(&mut self, notice: ClientSessionTerminated) {
        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            if tx.try_send(notice.clone()).is_err() {
                log::warn!(
                    "watch_client_sessions: subscriber queue full, dropping termination notice for {}",
                    notice.client_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_the_newest_notice() {
        let mut watcher = TerminationWatcher::new(1);
        let mut rx = watcher.subscribe();
        watcher.publish(ClientSessionTerminated {
            client_id: "a".to_string(),
        });
        watcher.publish(ClientSessionTerminated {
            client_id: "b".to_string(),
        });
        assert_eq!(
            rx.recv().await,
            Some(ClientSessionTerminated {
                client_id: "a".to_string()
            })
        );
        // "b" was dropped because the subscriber's single slot was full.
        drop(watcher);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_notice() {
        let mut watcher = TerminationWatcher::new(4);
        let mut rx1 = watcher.subscribe();
        let mut rx2 = watcher.subscribe();
        watcher.publish(ClientSessionTerminated {
            client_id: "a".to_string(),
        });
        assert_eq!(rx1.recv().await.unwrap().client_id, "a");
        assert_eq!(rx2.recv().await.unwrap().client_id, "a");
    }
}
