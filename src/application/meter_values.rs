//! Per-connector meter-values sampling
//!
//! While a transaction runs, a per-connector task samples the simulated
//! meter on the `MeterValueSampleInterval` period and sends MeterValues.
//! The simulated load follows the resolved smart-charging limit, so an
//! active profile directly shapes the reported energy.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::application::engine::CallOptions;
use crate::application::services::{MeterSample, SampledMeasurand};
use crate::application::smart_charging;
use crate::domain::configuration::METER_VALUES_SAMPLED_DATA_KEY;
use crate::station::context::StationContext;

/// Start the sampling task for a connector, replacing any previous one so a
/// connector never has two active timers.
pub fn start_sampling(ctx: &Arc<StationContext>, connector_id: u32) {
    let interval = ctx.meter_value_sample_interval();
    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the immediate first tick would double-report the begin meter value
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !sample_once(&task_ctx, connector_id, interval.as_secs()).await {
                break;
            }
        }
    });

    let mut tasks = ctx.meter_values_tasks.lock().unwrap();
    if let Some(previous) = tasks.insert(connector_id, task) {
        previous.abort();
    }
}

pub fn stop_sampling(ctx: &StationContext, connector_id: u32) {
    if let Some(task) = ctx.meter_values_tasks.lock().unwrap().remove(&connector_id) {
        task.abort();
    }
}

pub fn stop_all_sampling(ctx: &StationContext) {
    let mut tasks = ctx.meter_values_tasks.lock().unwrap();
    for (_, task) in tasks.drain() {
        task.abort();
    }
}

/// Advance the simulated meter and send one MeterValues message. Returns
/// `false` once the transaction is gone and the task should end.
async fn sample_once(ctx: &Arc<StationContext>, connector_id: u32, interval_secs: u64) -> bool {
    let Some(transaction_id) = ({
        let connectors = ctx.connectors.lock().unwrap();
        connectors.connector(connector_id).and_then(|c| c.transaction_id)
    }) else {
        debug!(
            station_id = ctx.station_id().as_str(),
            connector_id, "No running transaction, meter sampling ends"
        );
        return false;
    };

    // Simulated load: the resolved smart-charging limit, else the
    // connector's share of the station maximum.
    let power_watts = smart_charging::connector_power_limit(ctx, connector_id, Utc::now())
        .map(|resolved| resolved.limit_watts)
        .unwrap_or_else(|| {
            let info = ctx.info.read().unwrap();
            let connectors = ctx.connectors.lock().unwrap();
            info.maximum_power
                / info.power_divider(
                    connectors.number_of_evses(),
                    connectors.number_of_running_transactions(),
                )
        });
    let energy_step_wh = (power_watts * interval_secs as f64 / 3600.0).round() as i64;

    let register_wh = {
        let mut connectors = ctx.connectors.lock().unwrap();
        match connectors.connector_mut(connector_id) {
            Some(connector) => {
                connector.energy_active_import_register += energy_step_wh;
                connector.energy_active_import_register
            }
            None => return false,
        }
    };

    let sampled_data = ctx
        .configuration
        .lock()
        .unwrap()
        .get(METER_VALUES_SAMPLED_DATA_KEY)
        .map(|k| k.value.clone())
        .unwrap_or_else(|| "Energy.Active.Import.Register".to_string());
    let mut values = Vec::new();
    for measurand in sampled_data.split(',').map(str::trim) {
        match measurand {
            "Energy.Active.Import.Register" => {
                values.push(SampledMeasurand::EnergyActiveImportRegister { wh: register_wh })
            }
            "Power.Active.Import" => {
                values.push(SampledMeasurand::PowerActiveImport { w: power_watts })
            }
            "SoC" => values.push(SampledMeasurand::StateOfCharge { percent: 50.0 }),
            other => debug!(
                station_id = ctx.station_id().as_str(),
                measurand = other,
                "Unsupported configured measurand, skipping"
            ),
        }
    }
    if values.is_empty() {
        values.push(SampledMeasurand::EnergyActiveImportRegister { wh: register_wh });
    }

    let sample = MeterSample {
        timestamp: Utc::now(),
        values,
    };
    let request = ctx
        .request
        .meter_values(connector_id, Some(transaction_id), &sample);
    if let Err(e) = ctx
        .engine
        .call(request.action, request.payload, CallOptions::default())
        .await
    {
        warn!(
            station_id = ctx.station_id().as_str(),
            connector_id,
            error = %e,
            "MeterValues failed"
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing;

    #[tokio::test]
    async fn at_most_one_sampling_task_per_connector() {
        let (ctx, _observed) = testing::context_with_responder();
        start_sampling(&ctx, 1);
        start_sampling(&ctx, 1);
        assert_eq!(ctx.meter_values_tasks.lock().unwrap().len(), 1);

        stop_sampling(&ctx, 1);
        assert!(ctx.meter_values_tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sampling_advances_the_energy_register() {
        let (ctx, _observed) = testing::context_with_responder();
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .start_transaction(11, "TAG-1", 1000, Utc::now());
        }

        assert!(sample_once(&ctx, 1, 3600).await);
        let register = {
            let connectors = ctx.connectors.lock().unwrap();
            connectors.connector(1).unwrap().energy_active_import_register
        };
        // one hour at 11 kW (22 kW shared by 2 connectors)
        assert_eq!(register, 1000 + 11_000);
    }

    #[tokio::test]
    async fn sampling_ends_without_a_transaction() {
        let (ctx, _observed) = testing::context_with_responder();
        assert!(!sample_once(&ctx, 1, 60).await);
    }
}
