//! Nomination policies.
//!
//! The base protocol leaves nomination entirely to the controlling
//! agent; these selectable policies automate the common choices. Each
//! policy is a pure function of the validated pairs seen so far, the
//! progress of the remaining checks, and the nomination timer. The
//! session task calls [`decide`] after every event and acts on the
//! returned [`Decision`].

use serde::{Deserialize, Serialize};

use crate::ice::ValidatedPair;

/// Which automatic nomination policy a session runs.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub enum NominationStrategy {
    /// Never nominate; an external controller owns the decision.
    None,
    /// Nominate the first pair that validates.
    FirstValid,
    /// Nominate the highest-priority validated pair, waiting on the
    /// timer while a higher-priority check is still outstanding.
    #[default]
    HighestPriority,
    /// Nominate the first non-relayed pair; a relayed pair is only
    /// nominated after the timer expires with nothing better.
    FirstHostOrReflexiveValid,
    /// Wait for every check to settle, then nominate the validated
    /// pair with the lowest round-trip time.
    BestRtt,
}

/// What the session should do after the latest event.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Decision {
    /// Nominate this pair now.
    Nominate(ValidatedPair),
    /// Arm the nomination timer; a better pair may still show up.
    ArmTimer,
    /// Keep waiting for more validations.
    Wait,
}

/// Everything a policy is allowed to look at.
pub struct NominationContext<'a> {
    /// Pairs validated so far, in validation order.
    pub validated: &'a [ValidatedPair],
    /// Whether a check with priority above the best validated pair is
    /// still unsettled.
    pub outstanding_higher: bool,
    /// Whether every check in the list has settled.
    pub all_checks_settled: bool,
    /// Whether the nomination timer is currently armed.
    pub timer_armed: bool,
    /// Whether an armed nomination timer has expired.
    pub timer_expired: bool,
}

/// Applies `strategy` to the current session snapshot.
///
/// Pure: same snapshot, same decision. The session owns the timer and
/// feeds its state back in through the context.
pub fn decide(strategy: NominationStrategy, ctx: &NominationContext<'_>) -> Decision {
    match strategy {
        NominationStrategy::None => Decision::Wait,
        NominationStrategy::FirstValid => match ctx.validated.first() {
            Some(first) => Decision::Nominate(first.clone()),
            None => Decision::Wait,
        },
        NominationStrategy::HighestPriority => {
            let best = match best_priority(ctx.validated) {
                Some(best) => best,
                None => return Decision::Wait,
            };
            if !ctx.outstanding_higher || ctx.timer_expired {
                Decision::Nominate(best.clone())
            } else if ctx.timer_armed {
                Decision::Wait
            } else {
                Decision::ArmTimer
            }
        }
        NominationStrategy::FirstHostOrReflexiveValid => {
            if let Some(direct) = ctx.validated.iter().find(|p| !p.kind.is_relayed()) {
                return Decision::Nominate(direct.clone());
            }
            match ctx.validated.iter().find(|p| p.kind.is_relayed()) {
                Some(relayed) if ctx.timer_expired => Decision::Nominate(relayed.clone()),
                Some(_) if ctx.timer_armed => Decision::Wait,
                Some(_) => Decision::ArmTimer,
                None => Decision::Wait,
            }
        }
        NominationStrategy::BestRtt => {
            if !ctx.all_checks_settled {
                return Decision::Wait;
            }
            match ctx.validated.iter().min_by_key(|p| p.rtt) {
                Some(best) => Decision::Nominate(best.clone()),
                None => Decision::Wait,
            }
        }
    }
}

fn best_priority(validated: &[ValidatedPair]) -> Option<&ValidatedPair> {
    validated.iter().max_by_key(|p| p.priority)
}
