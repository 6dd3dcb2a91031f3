use std::sync::Arc;

use tracing::debug;

use super::{
    CommonSubexpressionEliminationPass, DeadNodeEliminationPass, GraphPass,
    IdentityEliminationPass, OptimizationLevel, PassContext, PassResult,
};
use crate::error::GraphResult;
use crate::graph::Graph;

const DEFAULT_MAX_SWEEPS: usize = 8;

/// One entry in the schedule of an optimization level.
pub enum LevelStep {
    Run(Arc<dyn GraphPass>),
    /// Sweeps the group until a sweep leaves the graph unchanged, at most
    /// `max_sweeps` times.
    UntilStable {
        max_sweeps: usize,
        group: Vec<LevelStep>,
    },
}

/// Schedule being assembled for one optimization level.
#[derive(Default)]
pub struct LevelSchedule {
    steps: Vec<LevelStep>,
}

impl LevelSchedule {
    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) -> &mut Self {
        self.steps.push(LevelStep::Run(pass));
        self
    }

    pub fn until_stable<F>(&mut self, max_sweeps: usize, group: F) -> &mut Self
    where
        F: FnOnce(&mut LevelSchedule),
    {
        let mut inner = LevelSchedule::default();
        group(&mut inner);
        self.steps.push(LevelStep::UntilStable {
            max_sweeps: max_sweeps.max(1),
            group: inner.steps,
        });
        self
    }
}

/// The cleanup passes run around differentiation and recompute, keyed by
/// optimization level. Owned by one builder session.
pub struct PassManager {
    levels: Vec<(OptimizationLevel, Vec<LevelStep>)>,
}

impl PassManager {
    /// A manager with no registered passes.
    pub fn empty() -> Self {
        PassManager { levels: Vec::new() }
    }

    /// Appends to the schedule of `level`.
    pub fn with_level<F>(mut self, level: OptimizationLevel, schedule: F) -> Self
    where
        F: FnOnce(&mut LevelSchedule),
    {
        let mut builder = LevelSchedule::default();
        schedule(&mut builder);
        match self.levels.iter_mut().find(|(l, _)| *l == level) {
            Some((_, existing)) => existing.extend(builder.steps),
            None => self.levels.push((level, builder.steps)),
        }
        self
    }

    /// Identity and dead-node elimination at `Basic`, CSE plus cleanup at
    /// `Extended`.
    pub fn default_pipeline() -> Self {
        let sweeps = crate::env::pass_max_iters().unwrap_or(DEFAULT_MAX_SWEEPS);
        PassManager::empty()
            .with_level(OptimizationLevel::Basic, |s| {
                s.until_stable(sweeps, |g| {
                    g.pass(Arc::new(IdentityEliminationPass))
                        .pass(Arc::new(DeadNodeEliminationPass));
                });
            })
            .with_level(OptimizationLevel::Extended, |s| {
                s.until_stable(sweeps, |g| {
                    g.pass(Arc::new(CommonSubexpressionEliminationPass))
                        .pass(Arc::new(IdentityEliminationPass))
                        .pass(Arc::new(DeadNodeEliminationPass));
                });
            })
    }

    /// Runs the schedule of exactly `level` with no protected names.
    pub fn apply(&self, graph: &mut Graph, level: OptimizationLevel) -> GraphResult<PassResult> {
        self.apply_with(graph, level, &mut PassContext::default())
    }

    /// Runs the schedule of `level` on a copy; the graph is replaced only if
    /// every pass succeeds.
    pub fn apply_with(
        &self,
        graph: &mut Graph,
        level: OptimizationLevel,
        cx: &mut PassContext,
    ) -> GraphResult<PassResult> {
        let mut staged = graph.clone();
        let mut totals = PassResult::default();
        for (_, steps) in self.levels.iter().filter(|(l, _)| *l == level) {
            totals = totals.merge(run_schedule(steps, &mut staged, cx)?);
        }
        if totals.changed {
            *graph = staged;
        }
        debug!(
            ?level,
            changed = totals.changed,
            erased = totals.erased_nodes,
            rewrites = totals.rewrites_applied,
            "applied optimization level"
        );
        Ok(totals)
    }

    /// Applies every level from `Basic` through `max` in order.
    pub fn apply_up_to(
        &self,
        graph: &mut Graph,
        max: OptimizationLevel,
        cx: &mut PassContext,
    ) -> GraphResult<PassResult> {
        let mut totals = PassResult::default();
        for level in OptimizationLevel::ALL.into_iter().filter(|l| *l <= max) {
            totals = totals.merge(self.apply_with(graph, level, cx)?);
        }
        Ok(totals)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::default_pipeline()
    }
}

/// Runs `steps` once and returns the accumulated statistics; `changed` is set
/// when any pass in the sweep changed the graph.
fn run_schedule(
    steps: &[LevelStep],
    graph: &mut Graph,
    cx: &mut PassContext,
) -> GraphResult<PassResult> {
    let mut sweep = PassResult::default();
    for step in steps {
        match step {
            LevelStep::Run(pass) => {
                let stats = pass.run(graph, cx)?;
                debug!(
                    pass = pass.name(),
                    changed = stats.changed,
                    erased = stats.erased_nodes,
                    rewrites = stats.rewrites_applied,
                    nodes = graph.len(),
                    "pass finished"
                );
                sweep = sweep.merge(stats);
            }
            LevelStep::UntilStable { max_sweeps, group } => {
                for _ in 0..*max_sweeps {
                    let mut round = run_schedule(group, graph, cx)?;
                    round.iterations += 1;
                    let settled = !round.changed;
                    sweep = sweep.merge(round);
                    if settled {
                        break;
                    }
                }
            }
        }
    }
    Ok(sweep)
}
