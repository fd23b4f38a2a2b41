use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};

use crate::{protocol::message::Bet, store::SharedStore};

// Each connection only ever sends a handful of control messages,
// so this never fills up in practice
const SYSTEM_BUFFER_SIZE: usize = 1024;

/// Picks the round's winning number from the full persisted bet set.
pub trait DrawRule: Send + Sync {
    fn winning_number(&self, bets: &[Bet]) -> u32;
}

/// Every round is won by the same configured number.
#[derive(Debug, Clone, Copy)]
pub struct FixedDraw(pub u32);

impl DrawRule for FixedDraw {
    fn winning_number(&self, _bets: &[Bet]) -> u32 {
        self.0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LotteryError {
    #[error("The draw coordinator is no longer running")]
    Closed,
}

// Used for communication between the handler and the system
enum Message {
    Ready { agency: u32 },
    AwaitWinners { agency: u32, respond: oneshot::Sender<Vec<Bet>> },
    Abort { agency: u32 },
    Consumed,
    Shutdown,
}

struct Waiter {
    agency: u32,
    respond: oneshot::Sender<Vec<Bet>>,
}

enum Round {
    /// Agencies are still reporting ready; nobody has drawn yet.
    Collecting {
        ready: HashSet<u32>,
        waiters: Vec<Waiter>,
    },

    /// Winners are computed and waiting to be picked up.
    Publishing {
        members: HashSet<u32>,
        winners: HashMap<u32, Vec<Bet>>,
        outstanding: usize,
    },
}

impl Round {
    fn collecting() -> Self {
        Self::Collecting {
            ready: HashSet::new(),
            waiters: Vec::new(),
        }
    }
}

pub struct System {
    store: SharedStore,
    rule: Arc<dyn DrawRule>,
    total_agencies: u32,
    round: Round,

    // signals that arrived while the previous round was still publishing;
    // folded into the fresh round at reset so nothing leaks into a stale one
    next_ready: HashSet<u32>,
    next_waiters: Vec<Waiter>,
}

impl System {
    /// Starts the draw coordinator.
    ///
    /// returns a handler the connection tasks use to talk to it
    ///
    /// note: this function needs to be called from inside a tokio runtime context
    pub fn start(store: SharedStore, rule: Arc<dyn DrawRule>, total_agencies: u32) -> Handler {
        let (tx, mut rx) = mpsc::channel(SYSTEM_BUFFER_SIZE);

        let mut this = Self {
            store,
            rule,
            total_agencies,
            round: Round::collecting(),
            next_ready: HashSet::new(),
            next_waiters: Vec::new(),
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Ready { agency } => this.report_ready(agency),
                    Message::AwaitWinners { agency, respond } => {
                        this.register_waiter(agency, respond)
                    }
                    Message::Abort { agency } => this.abort(agency),
                    Message::Consumed => this.consumed(),
                    Message::Shutdown => break,
                }

                this.advance().await;
            }

            // dropping the state drops every parked waiter,
            // which resolves their receivers with an error
        });

        Handler { sender: tx }
    }

    fn report_ready(&mut self, agency: u32) {
        match &mut self.round {
            Round::Collecting { ready, .. } => {
                if !ready.insert(agency) {
                    tracing::warn!(agency, "agency reported ready twice in one round");
                }
            }
            Round::Publishing { .. } => {
                // previous round is still draining, park the signal for the next one
                self.next_ready.insert(agency);
            }
        }
    }

    fn register_waiter(&mut self, agency: u32, respond: oneshot::Sender<Vec<Bet>>) {
        match &mut self.round {
            Round::Collecting { waiters, .. } => waiters.push(Waiter { agency, respond }),
            Round::Publishing {
                members, winners, ..
            } if members.contains(&agency) => {
                let payout = winners.get(&agency).cloned().unwrap_or_default();
                let _ = respond.send(payout);
            }
            Round::Publishing { .. } => self.next_waiters.push(Waiter { agency, respond }),
        }
    }

    fn consumed(&mut self) {
        match &mut self.round {
            Round::Publishing { outstanding, .. } if *outstanding > 0 => *outstanding -= 1,
            _ => tracing::warn!("consume ack outside of a publishing round"),
        }
    }

    fn abort(&mut self, agency: u32) {
        match &mut self.round {
            Round::Collecting { ready, waiters } => {
                if ready.remove(&agency) {
                    tracing::warn!(agency, "agency dropped out before the draw");
                }
                waiters.retain(|waiter| waiter.agency != agency);
            }
            Round::Publishing {
                members,
                outstanding,
                ..
            } => {
                if members.remove(&agency) {
                    // died between release and ack, count it as consumed
                    tracing::warn!(agency, "agency dropped out before consuming its winners");
                    *outstanding = outstanding.saturating_sub(1);
                } else if self.next_ready.remove(&agency) {
                    self.next_waiters.retain(|waiter| waiter.agency != agency);
                }
            }
        }
    }

    // Runs state transitions until the round settles. Folded-in signals from
    // the next round may already hold quorum, hence the loop.
    async fn advance(&mut self) {
        loop {
            match &self.round {
                Round::Collecting { ready, .. } => {
                    if (ready.len() as u32) < self.total_agencies {
                        break;
                    }
                    self.run_draw().await;
                }
                Round::Publishing { outstanding, .. } => {
                    if *outstanding > 0 {
                        break;
                    }
                    self.finish_round();
                }
            }
        }
    }

    async fn run_draw(&mut self) {
        // advance only calls this in the collecting state
        let Round::Collecting { ready, waiters } =
            std::mem::replace(&mut self.round, Round::collecting())
        else {
            return;
        };

        let bets = match self.store.all().await {
            Ok(bets) => bets,
            Err(err) => {
                tracing::error!(error = %err, "bet store read failed, aborting the round");
                // dropping the waiters resolves their receivers with an error;
                // the agencies have to report ready again on fresh connections
                drop(waiters);
                self.fold_pending();
                return;
            }
        };

        let winning_number = self.rule.winning_number(&bets);
        let mut winners: HashMap<u32, Vec<Bet>> = HashMap::new();
        for bet in bets {
            if bet.number == winning_number {
                winners.entry(bet.agency).or_default().push(bet);
            }
        }

        tracing::info!(
            winning_number,
            agencies = ready.len(),
            "draw complete, publishing winners"
        );

        let outstanding = ready.len();
        for Waiter { agency, respond } in waiters {
            let payout = winners.get(&agency).cloned().unwrap_or_default();
            let _ = respond.send(payout);
        }

        self.round = Round::Publishing {
            members: ready,
            winners,
            outstanding,
        };
    }

    fn finish_round(&mut self) {
        tracing::info!("all agencies consumed their winners, starting a new round");
        self.round = Round::collecting();
        self.fold_pending();
    }

    fn fold_pending(&mut self) {
        if let Round::Collecting { ready, waiters } = &mut self.round {
            ready.extend(self.next_ready.drain());
            waiters.extend(self.next_waiters.drain(..));
        }
    }
}

#[derive(Debug, Clone)]
pub struct Handler {
    sender: mpsc::Sender<Message>,
}

impl Handler {
    /// Marks the agency as ready for the draw.
    pub async fn report_ready(&self, agency: u32) -> Result<(), LotteryError> {
        self.sender
            .send(Message::Ready { agency })
            .await
            .map_err(|_| LotteryError::Closed)
    }

    /// Blocks until the round publishes, then yields this agency's winners.
    ///
    /// an agency with no winning bet gets an empty list, not an error
    pub async fn await_winners(&self, agency: u32) -> Result<Vec<Bet>, LotteryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Message::AwaitWinners {
                agency,
                respond: tx,
            })
            .await
            .map_err(|_| LotteryError::Closed)?;

        rx.await.map_err(|_| LotteryError::Closed)
    }

    /// Acknowledges that this agency's winners made it onto the wire.
    pub async fn ack_consumed(&self) -> Result<(), LotteryError> {
        self.sender
            .send(Message::Consumed)
            .await
            .map_err(|_| LotteryError::Closed)
    }

    /// Corrective decrement for a handler that failed after reporting ready;
    /// without it one dead agency would wedge the barrier for everyone else.
    pub async fn abort_ready(&self, agency: u32) -> Result<(), LotteryError> {
        self.sender
            .send(Message::Abort { agency })
            .await
            .map_err(|_| LotteryError::Closed)
    }

    /// Stops the coordinator; every blocked handler resolves with an error.
    pub async fn shutdown(&self) -> Result<(), LotteryError> {
        self.sender
            .send(Message::Shutdown)
            .await
            .map_err(|_| LotteryError::Closed)
    }
}
