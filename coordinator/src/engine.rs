use std::str::FromStr;

use tracing::{debug, info};

use crate::round::RoundResult;

/// No more threads than this are ever proposed
pub const MAX_THREADS: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// highest thread count at which every node meets the SLA
    Socialite,
    /// thread count with the highest actual throughput that meets the SLA
    ThroughputHillClimb,
}

impl Strategy {
    /// as written to the summary log
    pub fn label(self) -> &'static str {
        match self {
            Strategy::Socialite => "Socialites",
            Strategy::ThroughputHillClimb => "InitialSOAR",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown rating type {0:?}, expected 0 (socialite) or 1 (soar)")]
pub struct UnknownStrategy(String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "0" | "socialite" => Ok(Strategy::Socialite),
            "1" | "soar" => Ok(Strategy::ThroughputHillClimb),
            _ => Err(UnknownStrategy(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bounds {
    Socialite {
        max_satisfied: u32,
        min_unsatisfied: Option<u32>,
    },
    HillClimb {
        best: u32,
        first_regressing: Option<u32>,
        max_throughput: f64,
    },
}

impl Bounds {
    /// Width of the bracket, `None` while there is no upper bound yet
    pub fn gap(&self) -> Option<u32> {
        match *self {
            Bounds::Socialite {
                max_satisfied,
                min_unsatisfied,
            } => min_unsatisfied.map(|upper| upper.saturating_sub(max_satisfied)),
            Bounds::HillClimb {
                best,
                first_regressing,
                ..
            } => first_regressing.map(|upper| upper.saturating_sub(best)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchState {
    pub current_thread_count: u32,
    pub bounds: Bounds,
    /// probing is over, every round from now on is a confirmation round
    pub rating_converged: bool,
    pub final_round_is_backoff: bool,
    pub consecutive_final_failures: u32,
    /// highest confirmed and lowest failed thread count while backing off
    pub final_success: u32,
    pub final_fail: u32,
    /// duration of the next confirmation round
    pub final_duration: u64,
    pub max_monitoring_round: u32,
    warmed_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub initial: u32,
    pub min: u32,
    pub max: u32,
}

/// Round lengths in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Durations {
    pub probe: u64,
    pub full: u64,
    pub monitor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundPlan {
    pub thread_count: u32,
    pub duration_secs: u64,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rated {
        thread_count: u32,
        throughput: f64,
        act_throughput: f64,
    },
    /// the throughput search needs a satisfied first round
    WarmUpFailed { thread_count: u32 },
    /// even the lowest thread count failed its confirmation
    Exhausted { thread_count: u32 },
    Aborted { thread_count: u32 },
}

/// Searches for the thread count to rate at. Probe rounds double and then
/// bisect, a confirmation round at the full duration makes the answer final.
#[derive(Debug, Clone)]
pub struct RatingEngine {
    strategy: Strategy,
    limits: Limits,
    durations: Durations,
    state: SearchState,
    outcome: Option<Outcome>,
}

impl RatingEngine {
    pub fn new(strategy: Strategy, limits: Limits, durations: Durations) -> Self {
        let initial = limits.initial.clamp(limits.min, limits.max);
        let bounds = match strategy {
            Strategy::Socialite => Bounds::Socialite {
                max_satisfied: limits.min,
                min_unsatisfied: None,
            },
            Strategy::ThroughputHillClimb => Bounds::HillClimb {
                best: initial,
                first_regressing: None,
                max_throughput: 0.0,
            },
        };

        Self {
            strategy,
            limits,
            durations,
            state: SearchState {
                current_thread_count: initial,
                bounds,
                rating_converged: false,
                final_round_is_backoff: false,
                consecutive_final_failures: 0,
                final_success: limits.min,
                final_fail: limits.min,
                final_duration: durations.full,
                max_monitoring_round: 0,
                warmed_up: strategy == Strategy::Socialite,
            },
            outcome: None,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// The round to run next, `None` once the rating is decided
    pub fn next_round(&self) -> Option<RoundPlan> {
        if self.outcome.is_some() {
            return None;
        }

        let state = &self.state;
        let plan = if state.rating_converged {
            RoundPlan {
                thread_count: state.current_thread_count,
                duration_secs: state.final_duration,
                is_final: true,
            }
        } else {
            RoundPlan {
                thread_count: state.current_thread_count,
                duration_secs: self.durations.probe,
                is_final: false,
            }
        };
        Some(plan)
    }

    pub fn record(&mut self, result: &RoundResult) {
        if self.outcome.is_some() {
            return;
        }

        if self.state.rating_converged {
            self.record_confirmation(result);
        } else if !self.state.warmed_up {
            self.record_warm_up(result);
        } else {
            match self.strategy {
                Strategy::Socialite => self.record_socialite(result),
                Strategy::ThroughputHillClimb => self.record_hill_climb(result),
            }
        }
        debug!("search state: {:?}", self.state);
    }

    pub fn abort(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Aborted {
                thread_count: self.state.current_thread_count,
            });
        }
    }

    fn converge(&mut self, thread_count: u32) {
        info!("rating converged on {thread_count} threads");
        self.state.current_thread_count = thread_count;
        self.state.rating_converged = true;
        self.state.final_duration = self.durations.full;
    }

    /// Double the thread count up to the ceiling, at the ceiling there is
    /// nowhere left to go
    fn grow(&mut self, current: u32) {
        if current >= self.limits.max {
            self.converge(current);
        } else {
            self.state.current_thread_count = current.saturating_mul(2).min(self.limits.max);
        }
    }

    /// Move to the middle between `lower` and `upper`, or converge on
    /// `accepted` once they are adjacent
    fn bisect(&mut self, lower: u32, upper: u32, accepted: u32) {
        let gap = upper.saturating_sub(lower);
        if gap < 2 {
            self.converge(accepted);
        } else {
            self.state.current_thread_count = lower + gap / 2;
        }
    }

    fn record_warm_up(&mut self, result: &RoundResult) {
        let current = self.state.current_thread_count;
        if !result.fully_satisfied() {
            info!("warm up with {current} threads did not meet the SLA");
            self.outcome = Some(Outcome::WarmUpFailed {
                thread_count: current,
            });
            return;
        }

        self.state.warmed_up = true;
        self.state.bounds = Bounds::HillClimb {
            best: current,
            first_regressing: None,
            max_throughput: result.act_throughput,
        };
        self.grow(current);
    }

    fn record_socialite(&mut self, result: &RoundResult) {
        let current = self.state.current_thread_count;
        let (mut max_satisfied, mut min_unsatisfied) = match self.state.bounds {
            Bounds::Socialite {
                max_satisfied,
                min_unsatisfied,
            } => (max_satisfied, min_unsatisfied),
            Bounds::HillClimb { .. } => unreachable!("socialite search with hill climb bounds"),
        };

        if result.fully_satisfied() {
            max_satisfied = current;
            self.set_socialite(max_satisfied, min_unsatisfied);
            match min_unsatisfied {
                None => self.grow(current),
                Some(upper) => self.bisect(current, upper, max_satisfied),
            }
        } else {
            min_unsatisfied = Some(current);
            self.set_socialite(max_satisfied, min_unsatisfied);
            self.bisect(max_satisfied, current, max_satisfied);
        }
    }

    fn set_socialite(&mut self, max_satisfied: u32, min_unsatisfied: Option<u32>) {
        self.state.bounds = Bounds::Socialite {
            max_satisfied,
            min_unsatisfied,
        };
    }

    fn record_hill_climb(&mut self, result: &RoundResult) {
        let current = self.state.current_thread_count;
        let (mut best, mut first_regressing, mut max_throughput) = match self.state.bounds {
            Bounds::HillClimb {
                best,
                first_regressing,
                max_throughput,
            } => (best, first_regressing, max_throughput),
            Bounds::Socialite { .. } => unreachable!("hill climb search with socialite bounds"),
        };

        let improved = result.fully_satisfied() && result.act_throughput >= max_throughput;
        if improved {
            best = current;
            max_throughput = result.act_throughput;
        } else {
            first_regressing = Some(current);
        }
        self.state.bounds = Bounds::HillClimb {
            best,
            first_regressing,
            max_throughput,
        };

        match (improved, first_regressing) {
            (true, None) => self.grow(current),
            (true, Some(upper)) => self.bisect(current, upper, best),
            (false, _) => self.bisect(best, current, best),
        }
    }

    fn record_confirmation(&mut self, result: &RoundResult) {
        let state = &mut self.state;
        let current = state.current_thread_count;
        state.max_monitoring_round = state.max_monitoring_round.max(result.max_monitoring_round);

        if result.fully_satisfied() {
            info!("confirmation with {current} threads succeeded");
            state.consecutive_final_failures = 0;
            state.final_success = current;
            if !state.final_round_is_backoff {
                self.outcome = Some(Outcome::Rated {
                    thread_count: current,
                    throughput: result.throughput,
                    act_throughput: result.act_throughput,
                });
                return;
            }

            let gap = state.final_fail.saturating_sub(current);
            if gap < 2 {
                // accept this count after one more full round
                state.final_round_is_backoff = false;
                state.final_duration = self.durations.full;
            } else {
                state.current_thread_count = current + gap / 2;
                let probe = u64::from(state.max_monitoring_round) * self.durations.monitor;
                state.final_duration = if probe > 0 {
                    probe
                } else {
                    self.durations.full
                };
            }
            return;
        }

        info!("confirmation with {current} threads failed, backing off");
        state.final_round_is_backoff = true;
        state.final_fail = current;
        if current <= self.limits.min {
            self.outcome = Some(Outcome::Exhausted {
                thread_count: current,
            });
            return;
        }

        let step = 2u32.saturating_pow(state.consecutive_final_failures);
        state.consecutive_final_failures += 1;
        state.current_thread_count = match current.checked_sub(step) {
            Some(lower) if lower > self.limits.min => lower,
            _ => current - 1,
        };
        state.final_duration = self.durations.full;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_le, assert_lt};

    const DURATIONS: Durations = Durations {
        probe: 30,
        full: 600,
        monitor: 10,
    };

    fn limits(initial: u32) -> Limits {
        Limits {
            initial,
            min: 1,
            max: MAX_THREADS,
        }
    }

    fn result(plan: &RoundPlan, satisfied: bool, act_throughput: f64) -> RoundResult {
        RoundResult {
            thread_count: plan.thread_count,
            node_count: 1,
            is_final: plan.is_final,
            throughput: act_throughput / 10.0,
            act_throughput,
            staleness: 0.0,
            confidence: if satisfied { 100.0 } else { 0.0 },
            satisfied: usize::from(satisfied),
            max_monitoring_round: if plan.is_final { 3 } else { 0 },
            nodes: Vec::new(),
        }
    }

    /// Feeds the engine until it decides, returns the plans it made
    fn run(
        engine: &mut RatingEngine,
        oracle: impl Fn(&RoundPlan) -> (bool, f64),
        mut inspect: impl FnMut(&RatingEngine),
    ) -> Vec<RoundPlan> {
        let mut plans = Vec::new();
        while let Some(plan) = engine.next_round() {
            assert_lt!(plans.len(), 200, "search does not terminate");
            let (satisfied, act) = oracle(&plan);
            engine.record(&result(&plan, satisfied, act));
            inspect(engine);
            plans.push(plan);
        }
        plans
    }

    #[test]
    fn socialite_finds_the_last_satisfied_count() {
        let mut engine = RatingEngine::new(Strategy::Socialite, limits(1), DURATIONS);
        let mut gaps = Vec::new();
        let plans = run(
            &mut engine,
            |plan| (plan.thread_count <= 15, 0.0),
            |engine| gaps.extend(engine.state().bounds.gap()),
        );

        let probes: Vec<_> = plans
            .iter()
            .filter(|p| !p.is_final)
            .map(|p| p.thread_count)
            .collect();
        assert_eq!(probes, vec![1, 2, 4, 8, 16, 12, 14, 15]);
        assert!(plans.iter().all(|p| p.is_final || p.duration_secs == 30));

        match engine.outcome() {
            Some(Outcome::Rated { thread_count, .. }) => {
                assert!([14, 15].contains(thread_count))
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // the bracket never widens and shrinks at least every other round
        for pair in gaps.windows(2) {
            assert_le!(pair[1], pair[0]);
        }
        for triple in gaps.windows(3) {
            assert_lt!(triple[2], triple[0]);
        }
    }

    #[test]
    fn hill_climb_stays_below_regressions() {
        let throughput = |threads: u32| {
            let threads = threads as f64;
            if threads <= 20.0 {
                threads * 10.0
            } else {
                200.0 - (threads - 20.0) * 5.0
            }
        };

        let mut engine = RatingEngine::new(Strategy::ThroughputHillClimb, limits(1), DURATIONS);
        let mut regression = u32::MAX;
        let mut proposals = Vec::new();
        run(
            &mut engine,
            |plan| (true, throughput(plan.thread_count)),
            |engine| {
                if let Bounds::HillClimb {
                    first_regressing: Some(bound),
                    ..
                } = engine.state().bounds
                {
                    regression = regression.min(bound);
                }
                proposals.push((engine.state().current_thread_count, regression));
            },
        );

        for (proposal, bound) in proposals {
            assert_lt!(proposal, bound);
        }
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Rated {
                thread_count: 24,
                ..
            })
        ));
    }

    #[test]
    fn failed_warm_up_ends_the_run() {
        let mut engine = RatingEngine::new(Strategy::ThroughputHillClimb, limits(4), DURATIONS);
        let plans = run(&mut engine, |_| (false, 100.0), |_| ());
        assert_eq!(plans.len(), 1);
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::WarmUpFailed { thread_count: 4 })
        );
        assert_eq!(engine.next_round(), None);
    }

    #[test]
    fn failed_confirmation_backs_off_and_refines() {
        let mut engine = RatingEngine::new(Strategy::Socialite, limits(1), DURATIONS);
        let plans = run(
            &mut engine,
            |plan| match plan.is_final {
                false => (plan.thread_count <= 15, 0.0),
                true => (plan.thread_count <= 10, 0.0),
            },
            |_| (),
        );

        let finals: Vec<_> = plans
            .iter()
            .filter(|p| p.is_final)
            .map(|p| (p.thread_count, p.duration_secs))
            .collect();
        assert_eq!(
            finals,
            vec![
                (15, 600),
                (14, 600),
                (12, 600),
                (8, 600),
                // refinement probes last for the monitored rounds seen so far
                (10, 30),
                (11, 30),
                (10, 600),
                (10, 600),
            ]
        );
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Rated {
                thread_count: 10,
                ..
            })
        ));
    }

    #[test]
    fn nothing_left_to_back_off_to() {
        let mut engine = RatingEngine::new(Strategy::Socialite, limits(1), DURATIONS);
        run(
            &mut engine,
            |plan| (!plan.is_final && plan.thread_count <= 3, 0.0),
            |_| (),
        );
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::Exhausted { thread_count: 1 })
        );
    }

    #[test]
    fn doubling_stops_at_the_ceiling() {
        let mut engine = RatingEngine::new(Strategy::Socialite, limits(600_000), DURATIONS);
        let plans = run(&mut engine, |_| (true, 0.0), |_| ());
        assert!(plans.iter().all(|p| p.thread_count <= MAX_THREADS));
        assert_eq!(plans[1].thread_count, MAX_THREADS);
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Rated {
                thread_count: MAX_THREADS,
                ..
            })
        ));
    }

    #[test]
    fn rating_type_names() {
        assert_eq!("0".parse::<Strategy>().unwrap(), Strategy::Socialite);
        assert_eq!("soar".parse::<Strategy>().unwrap(), Strategy::ThroughputHillClimb);
        assert!("2".parse::<Strategy>().is_err());
    }
}
