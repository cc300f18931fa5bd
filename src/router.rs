//! Type-indexed pub/sub registry.
//!
//! Any message type can be announced or subscribed to without a bespoke
//! channel being threaded through every constructor. Used here to fan out
//! `TranscriptLogEntry` to the persistence task and to broadcast provider
//! availability refreshes, mirroring the teacher's own `Router`.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use tokio::sync::broadcast;

pub const ROUTER_MESSAGE_SIZE: usize = 1024;

#[derive(Default)]
pub struct Router {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn subscribe<M: Send + Sync + Clone + 'static>(&mut self) -> broadcast::Receiver<M> {
        self.announce::<M>().subscribe()
    }

    pub fn announce<M: Send + Sync + Clone + 'static>(&mut self) -> broadcast::Sender<M> {
        self.map
            .entry(TypeId::of::<broadcast::Sender<M>>())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel::<M>(ROUTER_MESSAGE_SIZE);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<M>>()
            .expect("type-indexed entry must match its own TypeId")
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn announce_then_subscribe_delivers() {
        let mut router = Router::new();
        let mut rx: broadcast::Receiver<u32> = router.subscribe();
        let tx: broadcast::Sender<u32> = router.announce();
        tx.send(7).unwrap();
        assert_eq!(rx.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn separate_types_do_not_cross_talk() {
        let mut router = Router::new();
        let mut str_rx: broadcast::Receiver<String> = router.subscribe();
        let int_tx: broadcast::Sender<u32> = router.announce();
        int_tx.send(1).unwrap();
        assert!(str_rx.try_recv().is_err());
    }
}
