use crate::error::{Error, Result};
use crate::ids::{ActorId, Lamport, TimeTicket};

/// Pluggable logical clock owned by a document.
pub trait Clock {
    /// Advance past every lamport observed so far and return the new value.
    fn tick(&mut self) -> Result<Lamport>;
    fn observe(&mut self, external: Lamport);
    fn now(&self) -> Lamport;

    /// Issue a ticket strictly greater than any ticket observed so far.
    fn next(&mut self, actor: ActorId) -> Result<TimeTicket> {
        Ok(TimeTicket::new(self.tick()?, 0, actor))
    }
}

/// Basic Lamport clock; the default clock of a document.
#[derive(Clone, Debug, Default)]
pub struct LamportClock {
    counter: Lamport,
}

impl LamportClock {
    pub fn new(start: Lamport) -> Self {
        Self { counter: start }
    }
}

impl Clock for LamportClock {
    fn tick(&mut self) -> Result<Lamport> {
        self.counter = self.counter.checked_add(1).ok_or(Error::ClockOverflow)?;
        Ok(self.counter)
    }

    fn observe(&mut self, external: Lamport) {
        self.counter = self.counter.max(external);
    }

    fn now(&self) -> Lamport {
        self.counter
    }
}
