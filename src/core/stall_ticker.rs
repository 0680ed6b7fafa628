//! Stall ticker (component K).
//!
//! Rather than a separate code path for "no output for N seconds", a
//! single shared ticker periodically compares each running task's
//! silence against `stall_threshold` and, when exceeded, fires the
//! bundled `stall-check` rule through the same pattern-hit/intervention
//! pipeline a line match would use — subject to the same cooldown,
//! quota, and delivery-spacing gates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::core::bus::{Bus, Event};
use crate::core::intervention::InterventionController;
use crate::core::pattern_scanner::RuleAction;
use crate::core::registry::Registry;

/// Runs until the process exits. A no-op if the rule table carries no
/// `Stall`-action rule (an operator may configure a supervisor with the
/// stall check disabled entirely by omitting it).
pub async fn run(
    registry: Arc<Registry>,
    bus: Arc<Bus>,
    controller: Arc<InterventionController>,
    config: Arc<Config>,
) {
    let Some(stall_rule) = config
        .rules
        .iter()
        .find(|r| matches!(r.action, RuleAction::Stall))
    else {
        log::debug!("no stall-action rule configured; stall ticker idle");
        return;
    };
    let rule_id = stall_rule.id.clone();
    let action = stall_rule.action.clone();
    let stall_threshold = config.stall_threshold;

    let tick_interval = (stall_threshold / 4)
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(50));
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for (task_id, record) in registry.running_tasks() {
            let silent_for = record.clock.lock().unwrap().last_output_at.elapsed();
            if silent_for < stall_threshold {
                continue;
            }

            let ready = record
                .scanner
                .lock()
                .unwrap()
                .cooldown_elapsed(&rule_id, stall_threshold);
            if !ready {
                continue;
            }
            record.scanner.lock().unwrap().record_fired(&rule_id);

            bus.publish(Event::PatternHit {
                task_id: task_id.clone(),
                rule_id: rule_id.clone(),
                matched_text: format!("<no output for {silent_for:?}>"),
                ts: Utc::now(),
            });
            controller.handle(&record, &bus, &rule_id, &action).await;
        }
    }
}
