//! API shared state

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    coordinator::{Coordinator, NodeRegistry},
    history::AlertHistory,
    monitors::Monitor,
};

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: NodeRegistry,

    /// The coordinator's monitor holding every reported metric
    pub monitor: Arc<Mutex<Monitor>>,

    pub history: Option<Arc<dyn AlertHistory>>,
}

impl ApiState {
    pub fn new(
        registry: NodeRegistry,
        monitor: Arc<Mutex<Monitor>>,
        history: Option<Arc<dyn AlertHistory>>,
    ) -> Self {
        Self {
            registry,
            monitor,
            history,
        }
    }

    pub fn from_coordinator(coordinator: &Coordinator) -> Self {
        Self::new(
            coordinator.registry().clone(),
            coordinator.monitor(),
            coordinator.history(),
        )
    }
}
