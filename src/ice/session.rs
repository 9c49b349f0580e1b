//! The per-session driver: consumes pair events, applies the nomination
//! policy, and walks the processing state to its end.
//!
//! The driver task runs from construction and stops when it concludes
//! the session or when the session value is dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::Error;

use super::nomination::{self, Decision, NominationContext};
use super::{CheckList, CheckPair, IceProcessingState, PairState, ValidatedPair};

enum PairEvent {
    Validated(ValidatedPair),
    Settled,
    Nominate(ValidatedPair),
}

struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}
impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One connectivity-establishment session.
///
/// Checks themselves run elsewhere; their outcomes are reported here.
/// The session decides when a pair gets nominated and publishes every
/// state change through a watch channel.
pub struct IceSession {
    state: watch::Sender<IceProcessingState>,
    check_list: CheckList,
    events: flume::Sender<PairEvent>,
    nominated: Arc<Mutex<Option<ValidatedPair>>>,
    _handle: OwnedJoinHandle,
}

impl IceSession {
    pub fn new(config: SessionConfig) -> crate::error::Result<Self> {
        config.check()?;
        let (state, _) = watch::channel(IceProcessingState::Waiting);
        let (events, event_source) = flume::unbounded();
        let check_list = CheckList::new();
        let nominated = Arc::new(Mutex::new(None));
        let handle = tokio::spawn(session_loop(
            config,
            state.clone(),
            check_list.clone(),
            event_source,
            nominated.clone(),
        ));
        Ok(Self {
            state,
            check_list,
            events,
            nominated,
            _handle: OwnedJoinHandle { handle },
        })
    }

    pub fn state(&self) -> IceProcessingState {
        *self.state.borrow()
    }

    /// Watch every state change, starting from the current one.
    pub fn subscribe_state(&self) -> watch::Receiver<IceProcessingState> {
        self.state.subscribe()
    }

    /// The shared check list. Add pairs here before reporting outcomes.
    pub fn check_list(&self) -> CheckList {
        self.check_list.clone()
    }

    pub fn nominated(&self) -> Option<ValidatedPair> {
        self.nominated.lock().clone()
    }

    /// Moves the session from `Waiting` to `Running`.
    pub fn start_checks(&self) -> crate::error::Result<()> {
        advance(&self.state, IceProcessingState::Running)
    }

    /// Records a successful check and feeds it to the nomination policy.
    /// The returned pair is what [`Self::nominate`] accepts.
    pub fn report_validated(
        &self,
        pair: &CheckPair,
        rtt: Duration,
    ) -> crate::error::Result<ValidatedPair> {
        self.guard_running()?;
        pair.settle(PairState::Succeeded);
        let validated = ValidatedPair::from_check(pair, rtt);
        self.events
            .send(PairEvent::Validated(validated.clone()))
            .map_err(|_| Error::SessionOver)?;
        Ok(validated)
    }

    /// Records a failed check.
    pub fn report_failed(&self, pair: &CheckPair) -> crate::error::Result<()> {
        self.guard_running()?;
        pair.settle(PairState::Failed);
        self.events
            .send(PairEvent::Settled)
            .map_err(|_| Error::SessionOver)
    }

    /// Nominates a pair by hand, regardless of the configured policy.
    /// The way to conclude a session under [`NominationStrategy::None`].
    ///
    /// [`NominationStrategy::None`]: super::nomination::NominationStrategy::None
    pub fn nominate(&self, pair: ValidatedPair) -> crate::error::Result<()> {
        self.guard_running()?;
        self.events
            .send(PairEvent::Nominate(pair))
            .map_err(|_| Error::SessionOver)
    }

    /// Resolves once a pair is nominated; fails once the session is over
    /// without one.
    pub async fn wait_established(&self) -> crate::error::Result<ValidatedPair> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_established() {
                return self.nominated().ok_or(Error::SessionOver);
            }
            if state == IceProcessingState::Failed {
                return Err(Error::SessionOver);
            }
            if rx.changed().await.is_err() {
                return Err(Error::SessionOver);
            }
        }
    }

    fn guard_running(&self) -> crate::error::Result<()> {
        let state = self.state();
        if state.is_over() {
            return Err(Error::SessionOver);
        }
        if state != IceProcessingState::Running {
            return Err(Error::InvalidArgument(format!(
                "session is {state:?}, not running"
            )));
        }
        Ok(())
    }
}

/// Applies one transition, refusing anything the state machine does not
/// allow. The watch channel only fires for transitions that happen.
fn advance(
    tx: &watch::Sender<IceProcessingState>,
    next: IceProcessingState,
) -> crate::error::Result<()> {
    let mut previous = IceProcessingState::Waiting;
    let moved = tx.send_if_modified(|state| {
        previous = *state;
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    });
    if moved {
        log::debug!("session state {previous:?} -> {next:?}");
        Ok(())
    } else if previous.is_over() {
        Err(Error::SessionOver)
    } else {
        log::debug!("refusing state change {previous:?} -> {next:?}");
        Err(Error::InvalidArgument(format!(
            "cannot advance from {previous:?} to {next:?}"
        )))
    }
}

async fn session_loop(
    config: SessionConfig,
    state: watch::Sender<IceProcessingState>,
    check_list: CheckList,
    events: flume::Receiver<PairEvent>,
    nominated: Arc<Mutex<Option<ValidatedPair>>>,
) {
    let mut validated: Vec<ValidatedPair> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut timer_expired = false;

    loop {
        let event = tokio::select! {
            event = events.recv_async() => match event {
                Ok(event) => Some(event),
                // Session dropped before concluding.
                Err(_) => break,
            },
            _ = timer_wait(deadline) => {
                log::debug!("nomination timer expired");
                timer_expired = true;
                deadline = None;
                None
            }
        };

        match event {
            Some(PairEvent::Validated(pair)) => validated.push(pair),
            Some(PairEvent::Settled) | None => {}
            Some(PairEvent::Nominate(pair)) => {
                conclude(&state, &nominated, pair, config.grace_period).await;
                return;
            }
        }

        let ctx = NominationContext {
            validated: &validated,
            outstanding_higher: outstanding_higher(&check_list, &validated),
            all_checks_settled: check_list.all_settled(),
            timer_armed: deadline.is_some() || timer_expired,
            timer_expired,
        };
        match nomination::decide(config.strategy, &ctx) {
            Decision::Nominate(pair) => {
                conclude(&state, &nominated, pair, config.grace_period).await;
                return;
            }
            Decision::ArmTimer => {
                if deadline.is_none() && !timer_expired {
                    log::debug!("arming nomination timer {:?}", config.nomination_timeout);
                    deadline = Some(Instant::now() + config.nomination_timeout);
                }
            }
            Decision::Wait => {}
        }

        // Every check settled and none produced a usable pair.
        if validated.is_empty() && !check_list.is_empty() && check_list.all_settled() {
            if advance(&state, IceProcessingState::Failed).is_ok() {
                age_out(&state, config.grace_period).await;
            }
            return;
        }
    }
}

async fn timer_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn outstanding_higher(check_list: &CheckList, validated: &[ValidatedPair]) -> bool {
    match validated.iter().map(|pair| pair.priority).max() {
        Some(best) => check_list.has_unsettled_above(best),
        None => false,
    }
}

async fn conclude(
    state: &watch::Sender<IceProcessingState>,
    nominated: &Mutex<Option<ValidatedPair>>,
    pair: ValidatedPair,
    grace: Duration,
) {
    log::debug!("nominating {} -> {}", pair.local, pair.remote);
    // Stored before the state flips so that established-state observers
    // always see it.
    nominated.lock().replace(pair);
    if advance(state, IceProcessingState::Completed).is_ok() {
        age_out(state, grace).await;
    }
}

async fn age_out(state: &watch::Sender<IceProcessingState>, grace: Duration) {
    tokio::time::sleep(grace).await;
    let _ = advance(state, IceProcessingState::Terminated);
}
