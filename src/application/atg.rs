//! Automatic transaction generator
//!
//! Synthetic-load driver: per connector, an idle/charge loop that starts
//! and stops transactions through the engine with randomized think and
//! charge durations. The runtime only consumes the [`TransactionGenerator`]
//! interface; this module also provides the default implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::operations;
use crate::application::services::StopReason;
use crate::domain::template::AutomaticTransactionGeneratorConfiguration;
use crate::station::context::StationContext;

/// Interface the station runtime drives.
pub trait TransactionGenerator: Send + Sync {
    /// Begin generating on the given connectors, or all of them.
    fn start(&self, connector_ids: Option<Vec<u32>>);
    /// Stop generating on the given connectors, or all of them.
    fn stop(&self, connector_ids: Option<Vec<u32>>);
    fn started(&self) -> bool;
}

/// Default generator implementation.
pub struct AutomaticTransactionGenerator {
    ctx: Arc<StationContext>,
    configuration: AutomaticTransactionGeneratorConfiguration,
    started: AtomicBool,
    tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl AutomaticTransactionGenerator {
    pub fn new(
        ctx: Arc<StationContext>,
        configuration: AutomaticTransactionGeneratorConfiguration,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            configuration,
            started: AtomicBool::new(false),
            tasks: Mutex::new(HashMap::new()),
        })
    }
}

impl TransactionGenerator for AutomaticTransactionGenerator {
    fn start(&self, connector_ids: Option<Vec<u32>>) {
        if !self.configuration.enable {
            debug!(
                station_id = self.ctx.station_id().as_str(),
                "Transaction generator disabled by configuration"
            );
            return;
        }
        let connector_ids = connector_ids.unwrap_or_else(|| {
            self.ctx
                .connectors
                .lock()
                .unwrap()
                .chargeable_connector_ids()
        });
        let mut tasks = self.tasks.lock().unwrap();
        for connector_id in connector_ids {
            let ctx = self.ctx.clone();
            let configuration = self.configuration.clone();
            let task = tokio::spawn(async move {
                connector_loop(ctx, configuration, connector_id).await;
            });
            if let Some(previous) = tasks.insert(connector_id, task) {
                previous.abort();
            }
        }
        if !tasks.is_empty() {
            self.started.store(true, Ordering::SeqCst);
        }
    }

    fn stop(&self, connector_ids: Option<Vec<u32>>) {
        let mut tasks = self.tasks.lock().unwrap();
        match connector_ids {
            Some(ids) => {
                for id in ids {
                    if let Some(task) = tasks.remove(&id) {
                        task.abort();
                    }
                }
            }
            None => {
                for (_, task) in tasks.drain() {
                    task.abort();
                }
            }
        }
        if tasks.is_empty() {
            self.started.store(false, Ordering::SeqCst);
        }
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// One connector's idle/charge cycle.
async fn connector_loop(
    ctx: Arc<StationContext>,
    configuration: AutomaticTransactionGeneratorConfiguration,
    connector_id: u32,
) {
    info!(
        station_id = ctx.station_id().as_str(),
        connector_id, "Transaction generator loop started"
    );
    let deadline = configuration
        .stop_after_hours
        .map(|hours| tokio::time::Instant::now() + Duration::from_secs_f64(hours * 3600.0));

    loop {
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            info!(
                station_id = ctx.station_id().as_str(),
                connector_id, "Transaction generator reached its run-time limit"
            );
            break;
        }
        let idle = random_between(
            configuration.min_delay_between_two_transactions,
            configuration.max_delay_between_two_transactions,
        );
        tokio::time::sleep(Duration::from_secs(idle)).await;

        let roll: u8 = rand::thread_rng().gen_range(0..100);
        if roll >= configuration.probability_of_start {
            debug!(
                station_id = ctx.station_id().as_str(),
                connector_id, "Skipping this cycle"
            );
            continue;
        }

        let id_tag = configuration.id_tag.clone();
        if configuration.require_authorize
            && !operations::authorize_id_tag(&ctx, connector_id, &id_tag).await
        {
            warn!(
                station_id = ctx.station_id().as_str(),
                connector_id, "Generator id tag rejected, skipping cycle"
            );
            continue;
        }

        match operations::start_transaction(&ctx, connector_id, &id_tag, false).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    connector_id,
                    error = %e,
                    "Generator StartTransaction failed"
                );
                continue;
            }
        }

        let charge = random_between(configuration.min_duration, configuration.max_duration);
        tokio::time::sleep(Duration::from_secs(charge)).await;

        if let Err(e) =
            operations::stop_transaction(&ctx, connector_id, Some(StopReason::Local)).await
        {
            warn!(
                station_id = ctx.station_id().as_str(),
                connector_id,
                error = %e,
                "Generator StopTransaction failed"
            );
        }
    }
}

fn random_between(min: u64, max: u64) -> u64 {
    if max <= min {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing;

    #[tokio::test]
    async fn disabled_generator_does_not_start() {
        let (ctx, _observed) = testing::context_with_responder();
        let generator = AutomaticTransactionGenerator::new(
            ctx,
            AutomaticTransactionGeneratorConfiguration::default(),
        );
        generator.start(None);
        assert!(!generator.started());
    }

    #[tokio::test]
    async fn start_and_stop_manage_per_connector_tasks() {
        let (ctx, _observed) = testing::context_with_responder();
        let mut configuration = AutomaticTransactionGeneratorConfiguration::default();
        configuration.enable = true;
        let generator = AutomaticTransactionGenerator::new(ctx, configuration);

        generator.start(None);
        assert!(generator.started());
        assert_eq!(generator.tasks.lock().unwrap().len(), 2);

        generator.stop(Some(vec![1]));
        assert!(generator.started());
        assert_eq!(generator.tasks.lock().unwrap().len(), 1);

        generator.stop(None);
        assert!(!generator.started());
    }
}
