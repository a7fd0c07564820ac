//! Task scheduler: plans atomic tasks onto workers.
//!
//! The scheduler only plans, it never executes. It walks a simulated
//! clock: compute the ready set, pick a winner under the configured
//! algorithm (ties broken by lower id), occupy a worker for the task's
//! estimate, and advance to the next completion. The dispatcher replans
//! whenever reality diverges from the simulation.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::{SchedulerAlgorithm, SchedulerPolicy};
use crate::domain::models::graph::DependencyGraph;
use crate::domain::models::task::AtomicTask;
use crate::domain::models::worker::Worker;

/// One planned placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: Uuid,
    pub start_order: u32,
}

/// The output of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub assignments: HashMap<Uuid, Assignment>,
    /// Tasks no worker can handle; not failed, just parked
    pub blocked_no_capability: Vec<Uuid>,
}

impl Schedule {
    /// Task ids in start order.
    pub fn ordered_tasks(&self) -> Vec<Uuid> {
        let mut entries: Vec<(&Uuid, &Assignment)> = self.assignments.iter().collect();
        entries.sort_by_key(|(_, a)| a.start_order);
        entries.into_iter().map(|(&id, _)| id).collect()
    }

    pub fn start_order(&self, task: Uuid) -> Option<u32> {
        self.assignments.get(&task).map(|a| a.start_order)
    }
}

/// Millisecond-resolution simulated time (f64 minutes are not Ord).
fn weight_ms(task: &AtomicTask) -> u64 {
    (task.weight() * 60_000.0) as u64
}

struct SimWorker {
    id: Uuid,
    capabilities: std::collections::BTreeSet<String>,
    idle: bool,
    /// Total minutes of work assigned in this plan
    projected_load: f64,
}

impl SimWorker {
    fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.contains(task_type)
    }
}

/// Plans atomic tasks against a worker pool.
pub struct Scheduler {
    policy: SchedulerPolicy,
}

impl Scheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Produce a schedule for every task in `tasks` not already in
    /// `done`. Raises a deadlock error when unfinished work can never
    /// become ready (an upstream invariant was violated).
    pub fn plan(
        &self,
        tasks: &[AtomicTask],
        graph: &DependencyGraph,
        workers: &[Worker],
        done: &HashSet<Uuid>,
    ) -> OrchestratorResult<Schedule> {
        let task_map: HashMap<Uuid, &AtomicTask> = tasks
            .iter()
            .filter(|t| !done.contains(&t.id()))
            .map(|t| (t.id(), t))
            .collect();

        let mut sim_workers: Vec<SimWorker> = workers
            .iter()
            .map(|w| SimWorker {
                id: w.id,
                capabilities: w.capabilities.clone(),
                idle: true,
                projected_load: 0.0,
            })
            .collect();
        // Deterministic worker iteration regardless of caller order.
        sim_workers.sort_by_key(|w| w.id);

        let mut schedule = Schedule::default();
        let mut pending: BTreeSet<Uuid> = task_map.keys().copied().collect();
        let mut completed: HashSet<Uuid> = done.clone();
        let mut ready_since: HashMap<Uuid, u64> = HashMap::new();
        // Min-heap of (finish_time_ms, worker_index, task_id).
        let mut in_flight: BinaryHeap<Reverse<(u64, usize, Uuid)>> = BinaryHeap::new();
        let mut sim_time: u64 = 0;
        let mut next_order: u32 = 0;

        loop {
            let mut ready: Vec<Uuid> = pending
                .iter()
                .filter(|id| {
                    graph
                        .dependencies_of(**id)
                        .map(|deps| deps.iter().all(|d| completed.contains(d)))
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            ready.sort_unstable();
            for &id in &ready {
                ready_since.entry(id).or_insert(sim_time);
            }

            if ready.is_empty() {
                if let Some(Reverse((finish, worker_idx, task_id))) = in_flight.pop() {
                    sim_time = finish;
                    completed.insert(task_id);
                    sim_workers[worker_idx].idle = true;
                    continue;
                }
                if pending.is_empty() {
                    break;
                }
                return Err(OrchestratorError::Deadlock {
                    remaining: pending.len(),
                });
            }

            let Some((winner, worker_idx)) = self.select(
                &ready,
                &task_map,
                graph,
                &sim_workers,
                &ready_since,
                sim_time,
            ) else {
                // A winner exists but every capable worker is busy (or
                // the winner has no capable worker at all).
                let choice = self.pick_task(&ready, &task_map, graph, &ready_since, sim_time);
                let task = task_map[&choice];
                let any_capable = sim_workers
                    .iter()
                    .any(|w| w.can_handle(&task.spec.task_type));
                if !any_capable {
                    schedule.blocked_no_capability.push(choice);
                    pending.remove(&choice);
                    // Readiness-wise the parked task is out of the way;
                    // its dependents stay plannable and the caller
                    // decides what blockage means for them.
                    completed.insert(choice);
                    tracing::warn!(task = %choice, task_type = %task.spec.task_type,
                        "no capable worker, task blocked");
                    continue;
                }
                let Some(Reverse((finish, idx, task_id))) = in_flight.pop() else {
                    // Capable workers exist and none are busy, yet no
                    // placement was possible: nothing can progress.
                    return Err(OrchestratorError::Deadlock {
                        remaining: pending.len(),
                    });
                };
                sim_time = finish;
                completed.insert(task_id);
                sim_workers[idx].idle = true;
                continue;
            };

            let task = task_map[&winner];
            schedule.assignments.insert(
                winner,
                Assignment {
                    worker_id: sim_workers[worker_idx].id,
                    start_order: next_order,
                },
            );
            next_order += 1;
            pending.remove(&winner);
            sim_workers[worker_idx].idle = false;
            sim_workers[worker_idx].projected_load += task.weight();
            in_flight.push(Reverse((sim_time + weight_ms(task), worker_idx, winner)));
        }

        Ok(schedule)
    }

    /// Pick the winning (task, worker) pair, or `None` when no ready
    /// task can be placed on an idle worker right now.
    #[allow(clippy::too_many_arguments)]
    fn select(
        &self,
        ready: &[Uuid],
        task_map: &HashMap<Uuid, &AtomicTask>,
        graph: &DependencyGraph,
        workers: &[SimWorker],
        ready_since: &HashMap<Uuid, u64>,
        sim_time: u64,
    ) -> Option<(Uuid, usize)> {
        if self.policy.algorithm == SchedulerAlgorithm::ResourceBalanced {
            return self.select_resource_balanced(ready, task_map, workers);
        }

        let winner = self.pick_task(ready, task_map, graph, ready_since, sim_time);
        let task = task_map[&winner];
        let worker_idx = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.idle && w.can_handle(&task.spec.task_type))
            .min_by(|(_, a), (_, b)| {
                a.projected_load
                    .partial_cmp(&b.projected_load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(i, _)| i)?;
        Some((winner, worker_idx))
    }

    /// resource_balanced: least-loaded idle worker first, then the
    /// highest-priority ready task it can handle.
    fn select_resource_balanced(
        &self,
        ready: &[Uuid],
        task_map: &HashMap<Uuid, &AtomicTask>,
        workers: &[SimWorker],
    ) -> Option<(Uuid, usize)> {
        let mut idle: Vec<usize> = workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.idle)
            .map(|(i, _)| i)
            .collect();
        idle.sort_by(|&a, &b| {
            workers[a]
                .projected_load
                .partial_cmp(&workers[b].projected_load)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| workers[a].id.cmp(&workers[b].id))
        });

        for worker_idx in idle {
            let candidate = ready
                .iter()
                .filter(|id| workers[worker_idx].can_handle(&task_map[*id].spec.task_type))
                .max_by(|a, b| {
                    let ta = task_map[*a];
                    let tb = task_map[*b];
                    ta.spec
                        .priority
                        .cmp(&tb.spec.priority)
                        // Lower id wins ties.
                        .then_with(|| b.cmp(a))
                });
            if let Some(&task_id) = candidate {
                return Some((task_id, worker_idx));
            }
        }
        None
    }

    /// Rank the ready set and return the winner (ignoring workers).
    fn pick_task(
        &self,
        ready: &[Uuid],
        task_map: &HashMap<Uuid, &AtomicTask>,
        graph: &DependencyGraph,
        ready_since: &HashMap<Uuid, u64>,
        sim_time: u64,
    ) -> Uuid {
        debug_assert!(!ready.is_empty());

        if self.policy.algorithm == SchedulerAlgorithm::EarliestDeadline {
            let with_deadline = ready
                .iter()
                .filter_map(|id| task_map[id].spec.deadline.map(|d| (*id, d)))
                .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| a_id.cmp(b_id)));
            if let Some((id, _)) = with_deadline {
                return id;
            }
            // No deadlines anywhere: fall through to priority_first.
            return self.pick_by_score(ready, |id| {
                let t = task_map[&id];
                (
                    t.spec.priority.weight(),
                    graph.critical_length(id).unwrap_or(0.0),
                )
            });
        }

        match self.policy.algorithm {
            SchedulerAlgorithm::PriorityFirst => self.pick_by_score(ready, |id| {
                let t = task_map[&id];
                (
                    t.spec.priority.weight(),
                    graph.critical_length(id).unwrap_or(0.0),
                )
            }),
            SchedulerAlgorithm::CriticalPath => {
                self.pick_by_score(ready, |id| (graph.critical_length(id).unwrap_or(0.0), 0.0))
            }
            SchedulerAlgorithm::ShortestJob => {
                self.pick_by_score(ready, |id| (-task_map[&id].weight(), 0.0))
            }
            SchedulerAlgorithm::HybridOptimal => {
                let w = &self.policy.hybrid_weights;
                self.pick_by_score(ready, |id| {
                    let t = task_map[&id];
                    let wait_minutes =
                        (sim_time - ready_since.get(&id).copied().unwrap_or(sim_time)) as f64
                            / 60_000.0;
                    let score = w.priority * t.spec.priority.weight()
                        + w.critical_path * graph.critical_length(id).unwrap_or(0.0)
                        + w.inverse_size * (1.0 / t.weight())
                        + w.wait_age * wait_minutes;
                    (score, 0.0)
                })
            }
            // Handled above; unreachable here.
            SchedulerAlgorithm::EarliestDeadline | SchedulerAlgorithm::ResourceBalanced => {
                self.pick_by_score(ready, |id| {
                    (task_map[&id].spec.priority.weight(), 0.0)
                })
            }
        }
    }

    /// Highest score wins; ties go to the lower task id.
    fn pick_by_score(&self, ready: &[Uuid], score: impl Fn(Uuid) -> (f64, f64)) -> Uuid {
        *ready
            .iter()
            .max_by(|a, b| {
                let (a1, a2) = score(**a);
                let (b1, b2) = score(**b);
                a1.partial_cmp(&b1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a2.partial_cmp(&b2).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| b.cmp(a))
            })
            .expect("ready set is non-empty")
    }
}
