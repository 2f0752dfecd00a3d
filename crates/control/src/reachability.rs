/// Signal about the requester's NAT posture, supplied by the caller of
/// `request_exit`. The core carries no network-probing logic; it only
/// threads this hint through to whichever [`ReachabilityPolicy`] the
/// coordinator is configured with.
#[derive(Debug, Clone, Default)]
pub struct NatHint {
    /// Caller-supplied override: if `Some`, short-circuits the policy.
    pub prefer_relay: Option<bool>,
    /// Whether a prior direct-connect attempt against this peer succeeded.
    pub prior_direct_connect_succeeded: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityDecision {
    Direct,
    Relayed,
}

/// Decides whether a given exit allocation should be handed back as a
/// direct endpoint or spliced through a coordinator-side relay. Kept as a
/// pluggable trait rather than a fixed rule: the core ships one trivial,
/// explicitly-configured implementation, and a future network-probing
/// implementation can be swapped in behind the same trait without touching
/// the orchestrator.
pub trait ReachabilityPolicy: Send + Sync {
    fn decide(&self, hint: &NatHint) -> ReachabilityDecision;
}

/// Default policy: an explicit per-request override wins; otherwise fall
/// back to the coordinator's static `relay_by_default` configuration.
pub struct ConfiguredPolicy {
    pub relay_by_default: bool,
}

impl ReachabilityPolicy for ConfiguredPolicy {
    fn decide(&self, hint: &NatHint) -> ReachabilityDecision {
        let relay = hint.prefer_relay.unwrap_or(self.relay_by_default);

        if relay {
            ReachabilityDecision::Relayed
        } else {
            ReachabilityDecision::Direct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins_over_default() {
        let policy = ConfiguredPolicy { relay_by_default: false };
        let hint = NatHint { prefer_relay: Some(true), ..Default::default() };
        assert_eq!(policy.decide(&hint), ReachabilityDecision::Relayed);
    }

    #[test]
    fn falls_back_to_configured_default() {
        let policy = ConfiguredPolicy { relay_by_default: true };
        assert_eq!(policy.decide(&NatHint::default()), ReachabilityDecision::Relayed);

        let policy = ConfiguredPolicy { relay_by_default: false };
        assert_eq!(policy.decide(&NatHint::default()), ReachabilityDecision::Direct);
    }
}
