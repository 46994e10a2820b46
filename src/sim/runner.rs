//! Event loop tying a distributor and its targets to a [`SimNetwork`].

use std::collections::BTreeMap;

use crate::dfu::{DistPhase, Distributor, DistributorConfig};
use crate::network::Addr;

use super::network::SimNetwork;
use super::target::SimTarget;

/// Drives one campaign to quiescence.
///
/// Time only advances when nothing is in flight: each such window fires
/// the distributor's retry timer, and every `link_timeout_every` windows
/// the targets' link timers.
pub struct SimRunner {
    net: SimNetwork,
    addr: Addr,
    distributor: Distributor,
    targets: BTreeMap<Addr, SimTarget>,
    link_timeout_every: u32,
    windows: u32,
}

impl SimRunner {
    pub fn new(net: SimNetwork, addr: Addr, config: DistributorConfig) -> Self {
        let distributor = Distributor::new(config, net.link(addr));
        Self {
            net,
            addr,
            distributor,
            targets: BTreeMap::new(),
            link_timeout_every: 8,
            windows: 0,
        }
    }

    pub fn with_link_timeout_every(mut self, windows: u32) -> Self {
        self.link_timeout_every = windows.max(1);
        self
    }

    pub fn add_target(&mut self, target: SimTarget) {
        self.targets.insert(target.addr(), target);
    }

    pub fn network(&self) -> &SimNetwork {
        &self.net
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn distributor_mut(&mut self) -> &mut Distributor {
        &mut self.distributor
    }

    pub fn target(&self, addr: Addr) -> Option<&SimTarget> {
        self.targets.get(&addr)
    }

    pub fn target_mut(&mut self, addr: Addr) -> Option<&mut SimTarget> {
        self.targets.get_mut(&addr)
    }

    pub fn targets(&self) -> impl Iterator<Item = &SimTarget> {
        self.targets.values()
    }

    /// Retransmission windows elapsed so far.
    pub fn windows(&self) -> u32 {
        self.windows
    }

    /// Deliver one batch of transmit completions or one message. Returns
    /// false when nothing is in flight.
    pub fn step(&mut self) -> bool {
        let completed = self.net.take_tx_complete(self.addr);
        if completed > 0 {
            for _ in 0..completed {
                self.distributor.tx_complete();
            }
            return true;
        }

        let Some(env) = self.net.pop() else {
            return false;
        };
        for addr in self.targets.keys() {
            self.net.take_tx_complete(*addr);
        }
        let msg = match env.decode() {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(src = env.ctx.src, dst = env.node, "Undecodable message: {}", e);
                return true;
            }
        };
        if env.node == self.addr {
            self.distributor.handle_message(&env.ctx, &msg);
        } else if let Some(target) = self.targets.get_mut(&env.node) {
            target.handle_message(&env.ctx, &msg);
        }
        true
    }

    /// Deliver everything in flight, including the replies it provokes.
    /// Returns the number of steps taken.
    pub fn pump(&mut self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
        }
        steps
    }

    /// Let one retransmission window pass.
    pub fn tick(&mut self) {
        self.windows += 1;
        self.distributor.retry_timeout();
        if self.windows % self.link_timeout_every == 0 {
            for target in self.targets.values_mut() {
                target.link_timeout();
            }
        }
    }

    /// Run until the campaign ends, suspends or waits for `apply()`, or
    /// until `max_windows` windows have passed.
    pub fn run(&mut self, max_windows: u32) -> DistPhase {
        let start = self.windows;
        loop {
            self.pump();
            let phase = self.distributor.phase();
            let settled = !phase.is_busy()
                || matches!(phase, DistPhase::TransferSuccess | DistPhase::TransferSuspended);
            if settled || self.windows - start >= max_windows {
                tracing::debug!(?phase, windows = self.windows - start, "Simulation settled");
                return phase;
            }
            self.tick();
        }
    }
}
