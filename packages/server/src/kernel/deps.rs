//! Shared dependency bundle threaded through the kernel and the control
//! surface.

use std::sync::Arc;

use crate::config::Config;

use super::inbox::Inbox;
use super::queue::QueueDriver;
use super::registry::HandlerRegistry;
use super::store::Store;
use super::worker::Heartbeat;

pub struct CoreDeps {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn QueueDriver>,
    pub registry: Arc<HandlerRegistry>,
    pub config: Arc<Config>,
    pub heartbeat: Arc<Heartbeat>,
}

impl CoreDeps {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueDriver>,
        registry: Arc<HandlerRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let heartbeat = Arc::new(Heartbeat::new(queue.name() != "memory"));
        Self {
            store,
            queue,
            registry,
            config,
            heartbeat,
        }
    }

    pub fn inbox(&self) -> Inbox {
        Inbox::new(self.store.clone())
    }
}
