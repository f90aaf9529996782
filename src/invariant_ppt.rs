//! PPT Invariant System: configuration-time invariant enforcement with
//! contract tracking.
//!
//! Only configuration paths call `assert_invariant`. The real-time loop
//! reports through `invariant_rt` instead.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

pub const SIGNAL_RESOLVED: u32 = 1;
pub const COPY_TABLE_COMPLETE: u32 = 2;
pub const SINGLE_SYNC_SIGNAL: u32 = 3;
pub const BROKER_FINALISED: u32 = 4;
pub const GAM_LAYOUT_CONSISTENT: u32 = 5;
pub const BUFFER_ROUTE_VALID: u32 = 6;
pub const DEFAULT_VALUE_APPLIED: u32 = 7;
pub const STATE_PREPARED: u32 = 8;
pub const SCHEDULER_CONFIGURED: u32 = 9;
pub const TIMING_SINK_RESOLVED: u32 = 10;
pub const APPLICATION_CONFIGURED: u32 = 11;

/// Human-readable name of an invariant id, used in failure messages.
pub fn invariant_name(id: u32) -> &'static str {
    match id {
        SIGNAL_RESOLVED => "signal resolved",
        COPY_TABLE_COMPLETE => "copy table complete",
        SINGLE_SYNC_SIGNAL => "single sync signal",
        BROKER_FINALISED => "broker finalised",
        GAM_LAYOUT_CONSISTENT => "gam layout consistent",
        BUFFER_ROUTE_VALID => "buffer route valid",
        DEFAULT_VALUE_APPLIED => "default value applied",
        STATE_PREPARED => "state prepared",
        SCHEDULER_CONFIGURED => "scheduler configured",
        TIMING_SINK_RESOLVED => "timing sink resolved",
        APPLICATION_CONFIGURED => "application configured",
        _ => "unknown",
    }
}

fn failure(id: u32, message: &str, context: Option<&str>) -> String {
    let mut text = format!("invariant {} ({}) violated: {}", id, invariant_name(id), message);
    if let Some(ctx) = context {
        text.push_str(" [");
        text.push_str(ctx);
        text.push(']');
    }
    text
}

#[cfg(feature = "ppt")]
lazy_static! {
    static ref ENFORCED: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

/// Check a configuration invariant. A violation is a programming error in
/// the configuration pipeline, so it panics after logging.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let text = failure(id, message, context);
        log::error!("{}", text);
        panic!("{}", text);
    }
    #[cfg(feature = "ppt")]
    ENFORCED.lock().insert(id);
}

/// Panic unless every id in `required` has been enforced since the last
/// [`clear_invariant_log`]. A no-op without the `ppt` feature.
pub fn contract_test(name: &str, required: &[u32]) {
    #[cfg(feature = "ppt")]
    {
        let missing: Vec<&'static str> = {
            let enforced = ENFORCED.lock();
            required
                .iter()
                .filter(|id| !enforced.contains(*id))
                .map(|&id| invariant_name(id))
                .collect()
        };
        if !missing.is_empty() {
            panic!("contract '{}' not met, never enforced: {:?}", name, missing);
        }
    }
    #[cfg(not(feature = "ppt"))]
    let _ = (name, required);
}

pub fn clear_invariant_log() {
    #[cfg(feature = "ppt")]
    ENFORCED.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "single sync signal")]
    fn violation_names_the_invariant() {
        assert_invariant(SINGLE_SYNC_SIGNAL, false, "two synchronising signals", Some("Gam1"));
    }

    #[test]
    fn enforced_invariant_satisfies_contract() {
        assert_invariant(BUFFER_ROUTE_VALID, true, "route", None);
        contract_test("route contract", &[BUFFER_ROUTE_VALID]);
    }

    #[test]
    fn failure_message_carries_context() {
        let text = failure(STATE_PREPARED, "no routes", Some("Run"));
        assert_eq!(text, "invariant 8 (state prepared) violated: no routes [Run]");
    }
}
