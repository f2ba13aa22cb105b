//! One-shot leader election.
//!
//! The candidate's self-vote is registered up front; vote requests fan out
//! to the remote voters in parallel, and the decision callback fires as
//! soon as either side reaches its threshold. Responses arriving after the
//! decision only contribute lease information.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_core::{Error, HybridTime, PeerId, Result, TermId};
use tracing::{debug, info, warn};

use crate::proxy::PeerProxy;
use crate::rpc::{VoteRequest, VoteResponse};

/// The outcome of an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionDecision {
    /// The candidate won a majority.
    Won,
    /// The candidate cannot win this term.
    Lost,
}

/// The result handed to the election callback.
#[derive(Debug, Clone)]
pub struct ElectionResult {
    /// The term the election ran in.
    pub election_term: TermId,
    /// Won or lost.
    pub decision: ElectionDecision,
    /// Human-readable summary.
    pub message: String,
    /// The maximum remaining old-leader lease reported by any voter.
    pub old_leader_lease_remaining: Option<Duration>,
    /// The maximum old-leader hybrid-time lease reported by any voter.
    pub old_leader_ht_lease_expiration: HybridTime,
    /// The highest term seen in any response (for stepping down).
    pub highest_responder_term: TermId,
}

/// Tallies yes/no votes toward a majority.
#[derive(Debug)]
pub struct VoteCounter {
    num_voters: usize,
    majority: usize,
    yes: HashSet<PeerId>,
    no: HashSet<PeerId>,
}

impl VoteCounter {
    /// Creates a counter over `num_voters` with majority ⌊n/2⌋+1.
    #[must_use]
    pub fn new(num_voters: usize) -> Self {
        Self {
            num_voters,
            majority: num_voters / 2 + 1,
            yes: HashSet::new(),
            no: HashSet::new(),
        }
    }

    /// Registers a vote. Duplicate votes from one peer are rejected.
    ///
    /// # Errors
    /// `InvalidArgument` on a duplicate vote.
    pub fn register_vote(&mut self, voter: PeerId, granted: bool) -> Result<()> {
        if self.yes.contains(&voter) || self.no.contains(&voter) {
            return Err(Error::invalid_argument(format!(
                "{voter} already voted in this election"
            )));
        }
        if granted {
            self.yes.insert(voter);
        } else {
            self.no.insert(voter);
        }
        Ok(())
    }

    /// The decision, as soon as one is forced.
    #[must_use]
    pub fn decision(&self) -> Option<ElectionDecision> {
        if self.yes.len() >= self.majority {
            return Some(ElectionDecision::Won);
        }
        if self.no.len() > self.num_voters - self.majority {
            return Some(ElectionDecision::Lost);
        }
        None
    }

    /// Number of yes votes so far.
    #[must_use]
    pub fn yes_count(&self) -> usize {
        self.yes.len()
    }
}

/// Callback invoked once with the election result.
pub type ElectionCallback = Box<dyn FnOnce(ElectionResult) + Send>;

struct ElectionInner {
    counter: VoteCounter,
    callback: Option<ElectionCallback>,
    old_leader_lease_remaining: Option<Duration>,
    old_leader_ht_lease_expiration: HybridTime,
    highest_responder_term: TermId,
}

/// A single election in flight.
pub struct LeaderElection {
    term: TermId,
    candidate_id: PeerId,
    inner: Mutex<ElectionInner>,
}

impl LeaderElection {
    /// Creates an election; `counter` should already hold the candidate's
    /// self-vote.
    #[must_use]
    pub fn new(
        term: TermId,
        candidate_id: PeerId,
        counter: VoteCounter,
        callback: ElectionCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            term,
            candidate_id,
            inner: Mutex::new(ElectionInner {
                counter,
                callback: Some(callback),
                old_leader_lease_remaining: None,
                old_leader_ht_lease_expiration: HybridTime::MIN,
                highest_responder_term: term,
            }),
        })
    }

    /// Fans the vote request out to the remote voters. May invoke the
    /// callback inline when the self-vote alone decides (single-server
    /// config).
    pub fn run(
        self: &Arc<Self>,
        request: &VoteRequest,
        voters: Vec<(PeerId, Arc<dyn PeerProxy>)>,
        rpc_timeout: Duration,
    ) {
        info!(
            candidate = %self.candidate_id,
            term = self.term.get(),
            remote_voters = voters.len(),
            "starting leader election"
        );
        self.maybe_decide();

        for (voter_id, proxy) in voters {
            let this = Arc::clone(self);
            let mut request = request.clone();
            request.dest_id = voter_id;
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(rpc_timeout, proxy.request_vote(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timed_out("vote request timed out")),
                };
                this.record(voter_id, outcome);
            });
        }
    }

    fn record(&self, voter: PeerId, outcome: Result<VoteResponse>) {
        {
            let mut inner = self.lock();
            match outcome {
                Ok(response) => {
                    if response.responder_term > inner.highest_responder_term {
                        inner.highest_responder_term = response.responder_term;
                    }
                    if let Some(ms) = response.remaining_leader_lease_duration_ms {
                        let reported = Duration::from_millis(ms);
                        inner.old_leader_lease_remaining = Some(
                            inner
                                .old_leader_lease_remaining
                                .map_or(reported, |cur| cur.max(reported)),
                        );
                    }
                    if let Some(ht) = response.leader_ht_lease_expiration {
                        if ht > inner.old_leader_ht_lease_expiration {
                            inner.old_leader_ht_lease_expiration = ht;
                        }
                    }
                    debug!(
                        candidate = %self.candidate_id,
                        %voter,
                        granted = response.vote_granted,
                        code = ?response.error_code,
                        "vote response"
                    );
                    if let Err(e) = inner.counter.register_vote(voter, response.vote_granted) {
                        warn!(%voter, error = %e, "ignoring duplicate vote");
                    }
                }
                Err(e) => {
                    debug!(candidate = %self.candidate_id, %voter, error = %e, "vote request failed");
                    // An unreachable voter counts against the candidate.
                    let _ = inner.counter.register_vote(voter, false);
                }
            }
        }
        self.maybe_decide();
    }

    fn maybe_decide(&self) {
        let (callback, result) = {
            let mut inner = self.lock();
            let Some(decision) = inner.counter.decision() else {
                return;
            };
            let Some(callback) = inner.callback.take() else {
                return;
            };
            let result = ElectionResult {
                election_term: self.term,
                decision,
                message: format!(
                    "election in term {} decided with {} yes votes",
                    self.term,
                    inner.counter.yes_count()
                ),
                old_leader_lease_remaining: inner.old_leader_lease_remaining,
                old_leader_ht_lease_expiration: inner.old_leader_ht_lease_expiration,
                highest_responder_term: inner.highest_responder_term,
            };
            (callback, result)
        };
        callback(result);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ElectionInner> {
        self.inner.lock().expect("election lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_majority_of_three() {
        let mut counter = VoteCounter::new(3);
        counter.register_vote(PeerId::new(1), true).unwrap();
        assert_eq!(counter.decision(), None);
        counter.register_vote(PeerId::new(2), true).unwrap();
        assert_eq!(counter.decision(), Some(ElectionDecision::Won));
    }

    #[test]
    fn test_counter_loses_when_majority_impossible() {
        let mut counter = VoteCounter::new(3);
        counter.register_vote(PeerId::new(1), true).unwrap();
        counter.register_vote(PeerId::new(2), false).unwrap();
        assert_eq!(counter.decision(), None);
        counter.register_vote(PeerId::new(3), false).unwrap();
        assert_eq!(counter.decision(), Some(ElectionDecision::Lost));
    }

    #[test]
    fn test_counter_rejects_duplicate() {
        let mut counter = VoteCounter::new(3);
        counter.register_vote(PeerId::new(1), true).unwrap();
        assert!(counter.register_vote(PeerId::new(1), false).is_err());
    }

    #[test]
    fn test_single_voter_decides_immediately() {
        let mut counter = VoteCounter::new(1);
        counter.register_vote(PeerId::new(1), true).unwrap();
        assert_eq!(counter.decision(), Some(ElectionDecision::Won));
    }

    #[tokio::test]
    async fn test_election_decides_on_self_vote_alone() {
        let mut counter = VoteCounter::new(1);
        counter.register_vote(PeerId::new(1), true).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let election = LeaderElection::new(
            TermId::new(2),
            PeerId::new(1),
            counter,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let request = VoteRequest {
            candidate_id: PeerId::new(1),
            candidate_term: TermId::new(2),
            tablet_id: tessera_core::TabletId::new(1),
            dest_id: PeerId::new(1),
            last_received: tessera_core::OpId::MIN,
            ignore_live_leader: false,
        };
        election.run(&request, Vec::new(), Duration::from_secs(1));

        let result = rx.await.unwrap();
        assert_eq!(result.decision, ElectionDecision::Won);
        assert_eq!(result.election_term, TermId::new(2));
    }
}
