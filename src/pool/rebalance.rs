use crate::config::ThreadRange;


/// Above this smoothed activity ratio a role is considered starved for threads
pub const GROW_THRESHOLD: f64 = 0.75;
/// Below this ratio a role gives one thread back
pub const SHRINK_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoleLoad {
    pub threads: usize,
    pub range: ThreadRange,
    /// share of the role's thread time spent working, smoothed over recent intervals
    pub activity: f64,
}

/// Computes the target number of threads per role. Every role moves by at most one thread per
///  round, never leaves its range, and the sum never exceeds `total_threads`.
///
/// Shrinking happens before growing so that threads released by idle roles are available to
///  busy ones in the same round. Busier roles are served first when the budget is tight.
pub fn plan_rebalance(loads: &[RoleLoad], total_threads: usize) -> Vec<usize> {
    let mut targets: Vec<usize> = loads.iter()
        .map(|l| l.threads.clamp(l.range.min, l.range.max))
        .collect();

    for (target, load) in targets.iter_mut().zip(loads) {
        if load.activity < SHRINK_THRESHOLD && *target > load.range.min {
            *target -= 1;
        }
    }

    let mut growing: Vec<usize> = (0..loads.len())
        .filter(|&i| loads[i].activity > GROW_THRESHOLD && targets[i] < loads[i].range.max)
        .collect();
    growing.sort_by(|&a, &b| loads[b].activity.total_cmp(&loads[a].activity));

    let mut used: usize = targets.iter().sum();
    for i in growing {
        if used >= total_threads {
            break;
        }
        targets[i] += 1;
        used += 1;
    }
    targets
}
