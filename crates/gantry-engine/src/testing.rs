//! Wiring helpers for tests and local tooling: a full [`Services`]
//! assembly over the in-process worker cluster and in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use gantry_state::{SqliteStateBackend, StateBackend};
use gantry_worker::mem::MemCluster;
use gantry_worker::{Encoding, PlacementChain, StepClient, Streamer};

use crate::clock::{Clock, SystemClock};
use crate::delegate::{DelegateFactory, EventSink};
use crate::rate_limit::{RateLimiter, Unlimited};
use crate::Services;

/// Knobs for [`services_for`]; defaults mirror production wiring.
pub struct ServicesConfig {
    pub sink: Option<EventSink>,
    pub clock: Arc<dyn Clock>,
    pub limiter: Arc<dyn RateLimiter>,
    pub state: Option<Arc<dyn StateBackend>>,
    pub encoding: Encoding,
    pub p2p_streaming: bool,
    pub placement: PlacementChain,
    pub grace: Duration,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            sink: None,
            clock: Arc::new(SystemClock),
            limiter: Arc::new(Unlimited),
            state: None,
            encoding: Encoding::Raw,
            p2p_streaming: false,
            placement: PlacementChain::default(),
            grace: Duration::from_secs(1),
        }
    }
}

/// Assemble [`Services`] over an in-process cluster.
///
/// # Panics
///
/// Panics if the in-memory state backend cannot be created; this is a
/// test-support constructor.
#[must_use]
pub fn services_for(cluster: &MemCluster, config: ServicesConfig) -> Arc<Services> {
    let registry = cluster.registry();
    let state: Arc<dyn StateBackend> = config.state.unwrap_or_else(|| {
        Arc::new(SqliteStateBackend::in_memory().expect("in-memory state backend"))
    });
    let streamer = Streamer::new(registry.clone(), config.encoding, config.p2p_streaming);
    let client = StepClient::new(
        registry.clone(),
        streamer.clone(),
        state.clone(),
        config.placement,
        config.grace,
    );
    let delegates = match config.sink {
        Some(sink) => DelegateFactory::new(sink, config.clock.clone()),
        None => DelegateFactory::discard(config.clock.clone()),
    };
    Arc::new(Services {
        state,
        registry,
        client,
        streamer,
        clock: config.clock,
        limiter: config.limiter,
        delegates,
        check_container_expiry: Duration::from_secs(3600),
    })
}

/// Minimal services over an empty cluster; enough for compiling plans.
#[must_use]
pub fn test_services() -> Arc<Services> {
    services_for(&MemCluster::new(), ServicesConfig::default())
}
