//! Domain events broadcast on the bus.

use serde::{Deserialize, Serialize};

/// Which cached table a `cache:*` invalidation event targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDomain {
    Bootstrap,
    Agent,
    Skills,
    Cron,
    CustomTools,
}

impl CacheDomain {
    /// Event-name form used on the wire and in logs (`cache:agent` etc.).
    pub fn event_name(&self) -> &'static str {
        match self {
            CacheDomain::Bootstrap => "cache:bootstrap",
            CacheDomain::Agent => "cache:agent",
            CacheDomain::Skills => "cache:skills",
            CacheDomain::Cron => "cache:cron",
            CacheDomain::CustomTools => "cache:custom_tools",
        }
    }
}

/// Lifecycle phase carried by run events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// Named domain events delivered to zero or more subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Agent run lifecycle: session key + run id + phase.
    Run {
        session_key: String,
        run_id: String,
        phase: RunPhase,
    },
    /// Delegation lifecycle.
    Delegation {
        delegation_id: String,
        source: String,
        target: String,
        phase: RunPhase,
    },
    /// A cached table must be dropped or refreshed.
    CacheInvalidated(CacheDomain),
    /// Process shutdown has begun: stop intake, drain, exit.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_event_names_are_stable() {
        assert_eq!(CacheDomain::Bootstrap.event_name(), "cache:bootstrap");
        assert_eq!(CacheDomain::CustomTools.event_name(), "cache:custom_tools");
    }

    #[test]
    fn run_event_serializes_with_tag() {
        let e = BusEvent::Run {
            session_key: "k".into(),
            run_id: "r".into(),
            phase: RunPhase::Started,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "run");
        assert_eq!(v["phase"], "started");
    }
}
