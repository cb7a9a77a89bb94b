//! Process-tree construction and metric rollup
//!
//! Links a job's flat process records into a parent/child forest, derives
//! the transitive ancestor/descendant closure, and computes exclusive and
//! inclusive CPU costs plus the job-level aggregate sums.

use crate::models::{ProcSums, Process, TagMap};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

/// Thread-sum fields that make up a process's exclusive CPU time
pub const CPU_TIME_FIELDS: &[&str] = &["usertime", "systemtime"];

/// Tree-construction data-integrity failures
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("process {id} (pid {pid}) resolves to itself as parent")]
    SelfParent { id: u64, pid: u32 },
    #[error("cycle detected in process parentage at process {id}")]
    Cycle { id: u64 },
}

/// Build the forest and roll up metrics for one job's processes
///
/// Fills `parent_id`, `children_ids`, `ancestor_ids`, `descendant_ids`,
/// `depth`, `cpu_time`, and `inclusive_cpu_time` on every record and
/// returns the job-level sums. The computation is deterministic regardless
/// of input ordering: processes are matched in `(start, id)` order.
pub fn build_tree(procs: &mut [Process]) -> Result<ProcSums, TreeError> {
    if procs.is_empty() {
        return Ok(ProcSums::default());
    }

    // Deterministic matching order
    procs.sort_by(|a, b| cmp_start(a.start, b.start).then(a.id.cmp(&b.id)));

    for proc in procs.iter_mut() {
        proc.cpu_time = Some(exclusive_cpu_time(proc));
        proc.parent_id = None;
        proc.children_ids.clear();
        proc.ancestor_ids.clear();
        proc.descendant_ids.clear();
    }

    resolve_parents(procs)?;
    build_closure(procs)?;
    compute_inclusive(procs);

    let sums = roll_up(procs);
    debug!(
        procs = procs.len(),
        hosts = sums.num_hosts,
        "Process tree built"
    );
    Ok(sums)
}

/// Exclusive CPU time: sum of the process's own CPU-field thread sums
fn exclusive_cpu_time(proc: &Process) -> f64 {
    CPU_TIME_FIELDS
        .iter()
        .filter_map(|field| proc.threads_sums.get(*field))
        .sum()
}

/// Resolve each process's parent within the job
///
/// OS pids are reused, so a parent candidate must have started no later
/// than the child; among candidates the latest-starting wins, with ties
/// broken by the smallest process id. A process with no candidate is a
/// forest root, which is expected and not an error.
fn resolve_parents(procs: &mut [Process]) -> Result<(), TreeError> {
    // pid -> positions, in (start, id) order thanks to the caller's sort
    let mut by_pid: HashMap<u32, Vec<usize>> = HashMap::new();
    for (idx, proc) in procs.iter().enumerate() {
        by_pid.entry(proc.pid).or_default().push(idx);
    }

    let mut links: Vec<Option<u64>> = vec![None; procs.len()];
    for (idx, child) in procs.iter().enumerate() {
        if child.ppid == child.pid {
            return Err(TreeError::SelfParent {
                id: child.id,
                pid: child.pid,
            });
        }
        let candidates = match by_pid.get(&child.ppid) {
            Some(c) => c,
            None => continue,
        };
        let mut best: Option<&Process> = None;
        for &cand_idx in candidates {
            let cand = &procs[cand_idx];
            if cand.id == child.id {
                continue;
            }
            if cmp_start(cand.start, child.start) == std::cmp::Ordering::Greater {
                continue;
            }
            best = match best {
                None => Some(cand),
                Some(current) => {
                    // Latest start wins; equal starts prefer the lowest id
                    match cmp_start(current.start, cand.start) {
                        std::cmp::Ordering::Less => Some(cand),
                        std::cmp::Ordering::Greater => Some(current),
                        std::cmp::Ordering::Equal => {
                            if cand.id < current.id {
                                Some(cand)
                            } else {
                                Some(current)
                            }
                        }
                    }
                }
            };
        }
        links[idx] = best.map(|p| p.id);
    }

    for (idx, link) in links.into_iter().enumerate() {
        procs[idx].parent_id = link;
    }
    Ok(())
}

/// Derive children, the ancestor/descendant closure, and depth
///
/// Walking from every node to its root both fills the closure and detects
/// cycles that pid collisions could have introduced.
fn build_closure(procs: &mut [Process]) -> Result<(), TreeError> {
    let index: HashMap<u64, usize> = procs
        .iter()
        .enumerate()
        .map(|(idx, p)| (p.id, idx))
        .collect();

    let mut children: HashMap<u64, BTreeSet<u64>> = HashMap::new();
    for proc in procs.iter() {
        if let Some(parent) = proc.parent_id {
            children.entry(parent).or_default().insert(proc.id);
        }
    }

    let mut ancestors: Vec<BTreeSet<u64>> = vec![BTreeSet::new(); procs.len()];
    let mut descendants: HashMap<u64, BTreeSet<u64>> = HashMap::new();
    for idx in 0..procs.len() {
        let mut chain = BTreeSet::new();
        let mut cursor = procs[idx].parent_id;
        while let Some(ancestor_id) = cursor {
            if ancestor_id == procs[idx].id || !chain.insert(ancestor_id) {
                return Err(TreeError::Cycle { id: procs[idx].id });
            }
            descendants.entry(ancestor_id).or_default().insert(procs[idx].id);
            cursor = index.get(&ancestor_id).and_then(|&i| procs[i].parent_id);
        }
        procs[idx].depth = chain.len() as u32;
        ancestors[idx] = chain;
    }

    for (idx, chain) in ancestors.into_iter().enumerate() {
        procs[idx].ancestor_ids = chain;
        procs[idx].children_ids = children.remove(&procs[idx].id).unwrap_or_default();
        procs[idx].descendant_ids = descendants.remove(&procs[idx].id).unwrap_or_default();
    }
    Ok(())
}

/// Inclusive cost, leaves first: own exclusive cost plus children's inclusive
fn compute_inclusive(procs: &mut [Process]) {
    let mut order: Vec<usize> = (0..procs.len()).collect();
    order.sort_by(|&a, &b| procs[b].depth.cmp(&procs[a].depth));

    let mut inclusive: HashMap<u64, f64> = HashMap::new();
    for idx in order {
        let own = procs[idx].cpu_time.unwrap_or(0.0);
        let from_children: f64 = procs[idx]
            .children_ids
            .iter()
            .filter_map(|child| inclusive.get(child))
            .sum();
        let total = own + from_children;
        inclusive.insert(procs[idx].id, total);
        procs[idx].inclusive_cpu_time = Some(total);
    }
}

/// Job-level aggregate: every numeric metric summed, plus derived fields
fn roll_up(procs: &[Process]) -> ProcSums {
    let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
    let mut hosts: BTreeSet<&str> = BTreeSet::new();
    let mut tag_sets: BTreeSet<TagMap> = BTreeSet::new();

    for proc in procs {
        for (name, value) in &proc.threads_sums {
            *metrics.entry(name.clone()).or_insert(0.0) += value;
        }
        *metrics.entry("cpu_time".to_string()).or_insert(0.0) +=
            proc.cpu_time.unwrap_or(0.0);
        *metrics.entry("numtids".to_string()).or_insert(0.0) += proc.numtids as f64;
        hosts.insert(proc.host.as_str());
        if !proc.tags.is_empty() {
            tag_sets.insert(proc.tags.clone());
        }
    }

    ProcSums {
        metrics,
        num_procs: procs.len(),
        num_hosts: hosts.len(),
        all_proc_tags: tag_sets.into_iter().collect(),
    }
}

/// Order `Option<DateTime>` with missing starts sorted first
fn cmp_start(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn proc(id: u64, pid: u32, ppid: u32, start_secs: i64, cpu: f64) -> Process {
        let mut p = Process::new(id, "42");
        p.pid = pid;
        p.ppid = ppid;
        p.host = "nodeA".to_string();
        p.start = Some(Utc.timestamp_opt(start_secs, 0).unwrap());
        p.threads_sums.insert("usertime".to_string(), cpu);
        p.threads_sums.insert("systemtime".to_string(), 0.0);
        p
    }

    #[test]
    fn test_chain_closure_and_inclusive_cost() {
        // A(pid 100) -> B(pid 200) -> C(pid 300)
        let mut procs = vec![
            proc(1, 100, 1, 10, 4.0),
            proc(2, 200, 100, 20, 2.0),
            proc(3, 300, 200, 30, 1.0),
        ];
        let sums = build_tree(&mut procs).unwrap();

        let c = procs.iter().find(|p| p.id == 3).unwrap();
        assert_eq!(c.ancestor_ids, BTreeSet::from([1, 2]));
        assert_eq!(c.depth, 2);

        let a = procs.iter().find(|p| p.id == 1).unwrap();
        assert_eq!(a.descendant_ids, BTreeSet::from([2, 3]));
        assert_eq!(a.children_ids, BTreeSet::from([2]));
        assert_eq!(a.inclusive_cpu_time, Some(7.0));
        assert_eq!(a.cpu_time, Some(4.0));

        assert_eq!(sums.metrics.get("cpu_time"), Some(&7.0));
        assert_eq!(sums.num_procs, 3);
        assert_eq!(sums.num_hosts, 1);
    }

    #[test]
    fn test_orphan_is_forest_root_not_error() {
        // ppid 999 matches nothing in the job
        let mut procs = vec![proc(1, 100, 999, 10, 1.0), proc(2, 200, 100, 20, 1.0)];
        build_tree(&mut procs).unwrap();

        let orphan = procs.iter().find(|p| p.id == 1).unwrap();
        assert!(orphan.parent_id.is_none());
        assert!(orphan.ancestor_ids.is_empty());
        assert_eq!(orphan.depth, 0);
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let build = |ids: &[usize]| {
            let all = [
                proc(1, 100, 1, 10, 4.0),
                proc(2, 200, 100, 20, 2.0),
                proc(3, 300, 200, 30, 1.0),
                proc(4, 400, 100, 25, 8.0),
            ];
            let mut procs: Vec<Process> = ids.iter().map(|&i| all[i].clone()).collect();
            build_tree(&mut procs).unwrap();
            procs.sort_by_key(|p| p.id);
            procs
                .iter()
                .map(|p| (p.id, p.parent_id, p.inclusive_cpu_time))
                .collect::<Vec<_>>()
        };

        let forward = build(&[0, 1, 2, 3]);
        let shuffled = build(&[3, 1, 0, 2]);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_pid_reuse_prefers_latest_preceding_start() {
        // pid 100 is used twice; the child starting at t=50 must attach to
        // the second incarnation (t=40), not the first (t=10)
        let mut procs = vec![
            proc(1, 100, 1, 10, 1.0),
            proc(2, 100, 1, 40, 1.0),
            proc(3, 300, 100, 50, 1.0),
        ];
        build_tree(&mut procs).unwrap();
        let child = procs.iter().find(|p| p.id == 3).unwrap();
        assert_eq!(child.parent_id, Some(2));
    }

    #[test]
    fn test_parent_must_not_start_after_child() {
        // Only pid-100 incarnation starts after the child; no parent resolves
        let mut procs = vec![proc(1, 100, 1, 60, 1.0), proc(2, 300, 100, 50, 1.0)];
        build_tree(&mut procs).unwrap();
        let child = procs.iter().find(|p| p.id == 2).unwrap();
        assert!(child.parent_id.is_none());
    }

    #[test]
    fn test_tie_break_prefers_lowest_id() {
        let mut procs = vec![
            proc(5, 100, 1, 10, 1.0),
            proc(2, 100, 1, 10, 1.0),
            proc(9, 300, 100, 20, 1.0),
        ];
        build_tree(&mut procs).unwrap();
        let child = procs.iter().find(|p| p.id == 9).unwrap();
        assert_eq!(child.parent_id, Some(2));
    }

    #[test]
    fn test_self_parent_is_integrity_error() {
        let mut procs = vec![proc(1, 100, 100, 10, 1.0)];
        let result = build_tree(&mut procs);
        assert!(matches!(result, Err(TreeError::SelfParent { id: 1, .. })));
    }

    #[test]
    fn test_cycle_is_integrity_error() {
        // Two processes adopt each other through pid reuse at equal starts
        let mut a = proc(1, 100, 200, 10, 1.0);
        let mut b = proc(2, 200, 100, 10, 1.0);
        a.parent_id = None;
        b.parent_id = None;
        let mut procs = vec![a, b];
        let result = build_tree(&mut procs);
        assert!(matches!(result, Err(TreeError::Cycle { .. })));
    }

    #[test]
    fn test_roll_up_collects_tags_and_hosts() {
        let mut p1 = proc(1, 100, 1, 10, 1.0);
        p1.tags.insert("op".to_string(), "read".to_string());
        let mut p2 = proc(2, 200, 100, 20, 2.0);
        p2.host = "nodeB".to_string();
        p2.tags.insert("op".to_string(), "read".to_string());
        let mut p3 = proc(3, 300, 100, 20, 2.0);
        p3.tags.insert("op".to_string(), "write".to_string());

        let mut procs = vec![p1, p2, p3];
        let sums = build_tree(&mut procs).unwrap();
        assert_eq!(sums.num_hosts, 2);
        assert_eq!(sums.all_proc_tags.len(), 2);
        assert_eq!(sums.metrics.get("usertime"), Some(&4.0));
    }

    #[test]
    fn test_empty_job_is_empty_sums() {
        let mut procs: Vec<Process> = Vec::new();
        let sums = build_tree(&mut procs).unwrap();
        assert_eq!(sums.num_procs, 0);
        assert!(sums.metrics.is_empty());
    }
}
