//! Retried broadcast primitive shared by every client procedure.
//!
//! A round sends one message to every pending member (or once to a group
//! address) and then waits. Progress is edge-triggered: the owner calls
//! `tx_complete()` when the transport finishes a send and `timeout()` when
//! the response window of the round elapsed. Each call returns the next
//! step for the owner to carry out.

use std::collections::{BTreeMap, VecDeque};

use crate::network::Addr;

/// Options of one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOpts {
    /// Wait for a response from every member. Unacked broadcasts finish
    /// after a single round.
    pub acked: bool,
    /// Members that never respond are not reported as timed out.
    pub optional: bool,
    /// Send each round once to this address instead of per member.
    pub group: Option<Addr>,
    /// Extra rounds after the first.
    pub retries: u8,
}

impl RoundOpts {
    pub fn acked(group: Option<Addr>, retries: u8) -> Self {
        Self {
            acked: true,
            optional: false,
            group,
            retries,
        }
    }

    pub fn unacked(group: Option<Addr>) -> Self {
        Self {
            acked: false,
            optional: false,
            group,
            retries: 0,
        }
    }
}

/// What the owner must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcastStep {
    /// Send the round's message to this address, then call `tx_complete()`.
    Send(Addr),
    /// Nothing to do until a response, `tx_complete()` or `timeout()`.
    Wait,
    /// The broadcast is over.
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
struct Member {
    acked: bool,
    timedout: bool,
}

#[derive(Debug)]
pub struct Broadcast {
    members: BTreeMap<Addr, Member>,
    queue: VecDeque<Addr>,
    opts: RoundOpts,
    retries_left: u8,
    in_flight: bool,
    active: bool,
    canceled: bool,
}

impl Default for Broadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcast {
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            queue: VecDeque::new(),
            opts: RoundOpts::unacked(None),
            retries_left: 0,
            in_flight: false,
            active: false,
            canceled: false,
        }
    }

    /// Start a broadcast to `members`. Any previous broadcast is discarded.
    pub fn start(&mut self, opts: RoundOpts, members: impl IntoIterator<Item = Addr>) -> BcastStep {
        self.members = members.into_iter().map(|a| (a, Member::default())).collect();
        self.opts = opts;
        self.retries_left = opts.retries;
        self.in_flight = false;
        self.canceled = false;
        self.queue.clear();

        if self.members.is_empty() {
            self.active = false;
            return BcastStep::Done;
        }

        self.active = true;
        self.fill_round();
        self.next_send()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_member(&self, addr: Addr) -> bool {
        self.members.contains_key(&addr)
    }

    pub fn is_acked(&self, addr: Addr) -> bool {
        self.members.get(&addr).is_some_and(|m| m.acked)
    }

    /// Members that exhausted the retry budget, in address order.
    pub fn timed_out(&self) -> Vec<Addr> {
        self.members
            .iter()
            .filter(|(_, m)| m.timedout)
            .map(|(a, _)| *a)
            .collect()
    }

    /// Members that have not responded yet.
    pub fn pending(&self) -> Vec<Addr> {
        self.members
            .iter()
            .filter(|(_, m)| !m.acked && !m.timedout)
            .map(|(a, _)| *a)
            .collect()
    }

    /// The previous send finished.
    pub fn tx_complete(&mut self) -> BcastStep {
        if !self.active {
            return BcastStep::Wait;
        }
        self.in_flight = false;
        self.next_send()
    }

    /// Record a response. Returns a step only when it ends the broadcast.
    pub fn ack(&mut self, addr: Addr) -> Option<BcastStep> {
        if !self.active {
            return None;
        }
        let member = self.members.get_mut(&addr)?;
        if member.acked {
            return None;
        }
        member.acked = true;
        self.queue.retain(|a| *a != addr);

        if !self.in_flight && self.queue.is_empty() && self.all_acked() {
            self.active = false;
            return Some(BcastStep::Done);
        }
        None
    }

    /// The response window elapsed: start another round or give up.
    pub fn timeout(&mut self) -> BcastStep {
        if !self.active || self.in_flight || !self.queue.is_empty() {
            return BcastStep::Wait;
        }
        if self.retries_left > 0 {
            self.retries_left -= 1;
            self.fill_round();
            return self.next_send();
        }

        let optional = self.opts.optional;
        for member in self.members.values_mut().filter(|m| !m.acked) {
            member.timedout = !optional;
        }
        self.active = false;
        BcastStep::Done
    }

    /// Stop sending. Finishes once an in-flight send completes.
    pub fn cancel(&mut self) -> BcastStep {
        if !self.active {
            return BcastStep::Done;
        }
        self.canceled = true;
        self.queue.clear();
        if self.in_flight {
            return BcastStep::Wait;
        }
        self.active = false;
        BcastStep::Done
    }

    /// Drop the broadcast without a final step.
    pub fn reset(&mut self) {
        self.members.clear();
        self.queue.clear();
        self.in_flight = false;
        self.active = false;
        self.canceled = false;
    }

    fn all_acked(&self) -> bool {
        self.members.values().all(|m| m.acked)
    }

    fn fill_round(&mut self) {
        self.queue.clear();
        match self.opts.group {
            Some(group) => self.queue.push_back(group),
            None => self.queue.extend(
                self.members
                    .iter()
                    .filter(|(_, m)| !m.acked)
                    .map(|(a, _)| *a),
            ),
        }
    }

    fn next_send(&mut self) -> BcastStep {
        if self.canceled {
            self.active = false;
            return BcastStep::Done;
        }
        if self.opts.acked && self.all_acked() {
            self.queue.clear();
            self.active = false;
            return BcastStep::Done;
        }
        if let Some(dst) = self.queue.pop_front() {
            self.in_flight = true;
            return BcastStep::Send(dst);
        }
        if !self.opts.acked {
            self.active = false;
            return BcastStep::Done;
        }
        BcastStep::Wait
    }
}
