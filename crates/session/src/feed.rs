use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Receiving end of a change feed or broadcast subscription. `recv` yields
/// `None` once the publisher side drops the subscription, which is how a lost
/// connection shows up to the supervisor.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
pub(crate) struct Fanout<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<T: Clone> Fanout<T> {
    pub fn subscribe(&mut self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        Subscription { rx }
    }

    pub fn send(&mut self, item: &T) -> usize {
        self.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        self.subscribers.len()
    }

    pub fn senders(&mut self) -> Vec<mpsc::UnboundedSender<T>> {
        self.subscribers.retain(|tx| !tx.is_closed());
        self.subscribers.clone()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.subscribers.len();
        self.subscribers.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_delivers_and_prunes() {
        let mut fanout = Fanout::default();
        let mut a = fanout.subscribe();
        let b = fanout.subscribe();

        assert_eq!(fanout.send(&1u32), 2);
        assert_eq!(a.recv().await, Some(1));

        drop(b);
        assert_eq!(fanout.send(&2u32), 1);
        assert_eq!(a.recv().await, Some(2));

        assert_eq!(fanout.clear(), 1);
        assert_eq!(a.recv().await, None);
    }
}
