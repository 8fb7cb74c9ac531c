//! Single-threaded event loop shared by all three roles
//!
//! Each role is one actor.  MIO readiness on its descriptors (channel
//! ends, stdin, signal pipes) is forwarded into the actor, which
//! reports how it finished through a `Fwd<Outcome>` just before
//! stopping.  Stopping the actor shuts the loop down.

use crate::error::PipelineError;
use crate::role::Outcome;
use stakker::{fwd_do, ActorOwn, Fwd, Stakker};
use stakker_mio::mio::{Events, Poll};
use stakker_mio::MioPoll;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Longest single wait; the loop only wakes for I/O or timers
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Run one role actor until it stops.  `start` creates the actor;
/// its notify handler should shut down the Stakker (`ret_shutdown!`).
pub fn run<A, F>(start: F) -> Result<Outcome, PipelineError>
where
    A: 'static,
    F: FnOnce(&mut Stakker, Fwd<Outcome>) -> ActorOwn<A>,
{
    let mut stakker0 = Stakker::new(Instant::now());
    let s = &mut stakker0;
    let miopoll = MioPoll::new(s, Poll::new()?, Events::with_capacity(64), 0)?;

    let outcome = Rc::new(Cell::new(None));
    let outcome2 = outcome.clone();
    let done = fwd_do!(move |o: Outcome| outcome2.set(Some(o)));
    let _actor = start(s, done);

    let mut idle_pending = s.run(Instant::now(), false);
    while s.not_shutdown() {
        let maxdur = s.next_wait_max(Instant::now(), MAX_WAIT, idle_pending);
        let activity = miopoll.poll(maxdur)?;
        idle_pending = s.run(Instant::now(), !activity);
    }

    // An actor that died without reporting failed during init
    Ok(outcome.get().unwrap_or(Outcome::Failed))
}
