//! Sign consolidation: turning accepted signs into fingerprint candidates
//!
//! Stage one filters every split by every sign on the filter pool and wraps
//! each sign's matches into a single-sign intersection. Stage two repeatedly
//! combines subsets of the current intersections on the subset pool until the
//! intersection count settles or the round budget runs out.

pub mod intersection;
pub mod subsets;

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::engine::{FunctionResult, ResultSender, WorkerPool};
use crate::error::{IdentError, IdentResult};
use crate::packet::{PacketIndex, Split};
pub use intersection::{
    add_intersection, combine_subset, contains_all, intersect, intersect_all, merge_intersections,
    union_signs, Intersection,
};
pub use subsets::Subsets;

/// Intersections found for a batch of signs plus the functions flagged on the way
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consolidation {
    pub intersections: Vec<Intersection>,
    pub bad_functions: BTreeSet<usize>,
}

/// Knobs for one consolidation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsolidationParams {
    pub filter_workers: usize,
    pub subset_workers: usize,
    /// Upper bound on subset combination rounds
    pub max_rounds: usize,
    /// Required share of every member's packets a merged intersection keeps
    pub min_overlap: f64,
    /// More single-sign intersections than this aborts the pass
    pub max_true_signs: usize,
    /// A sign matching more destination ports than this within a split is noise
    pub max_ports: usize,
}

impl Default for ConsolidationParams {
    fn default() -> Self {
        Self {
            filter_workers: 225,
            subset_workers: 32,
            max_rounds: 10,
            min_overlap: 0.90,
            max_true_signs: 15,
            max_ports: 20,
        }
    }
}

/// Matches of one sign within one split
#[derive(Debug, Clone)]
pub struct SignMatches {
    pub sign_idx: usize,
    pub split_idx: usize,
    pub f_idx: usize,
    pub n_ports: usize,
    pub packets: Vec<PacketIndex>,
}

/// Collect the packets of one split a sign matches, counting their destination ports.
///
/// Matches are reported in corpus coordinates.
pub fn filter_by_sign(split_idx: usize, split: &Split, sign_idx: usize, result: &FunctionResult) -> SignMatches {
    let mut ports = HashSet::new();
    let mut packets = Vec::new();
    for (packet_idx, packet) in split.packets.iter().enumerate() {
        if result.sign.matches(packet) {
            ports.insert(packet.dst_port);
            packets.push(split.corpus_index(split_idx, packet_idx));
        }
    }
    SignMatches {
        sign_idx,
        split_idx,
        f_idx: result.index,
        n_ports: ports.len(),
        packets,
    }
}

/// Consolidate accepted signs into intersections.
///
/// Sign `i` of `signs` is recorded under the global sign index
/// `base_index + i`. Signs that look like noise in any split are dropped and
/// their functions reported in `bad_functions`. Returns
/// [`IdentError::TooManyTrueSigns`] carrying the partial result when more than
/// `max_true_signs` signs survive filtering.
///
/// Rounds stop at the round budget, at a fixed point, or early when a round
/// leaves more than `max_true_signs` intersections. The early stop is not an
/// error: the intersections of the last completed round are returned, since
/// enumerating subsets of the larger set is exponential in its size.
pub async fn consolidate_signs(
    splits: Arc<Vec<Split>>,
    signs: Arc<Vec<FunctionResult>>,
    params: ConsolidationParams,
    base_index: usize,
) -> IdentResult<Consolidation> {
    debug!("Filtering packets by {} signs", signs.len());
    let (singles, bad_functions) = filter_signs(splits, signs, params, base_index).await;

    info!("Number of true signs: {}", singles.len());
    if singles.len() > params.max_true_signs {
        return Err(IdentError::TooManyTrueSigns {
            count: singles.len(),
            partial: Box::new(Consolidation {
                intersections: singles,
                bad_functions,
            }),
        });
    }

    debug!(
        "Intersecting filtered packets with at most {} rounds",
        params.max_rounds
    );
    let mut intersections = singles;
    let mut prev_len = 0;
    let mut rounds_left = params.max_rounds;
    while prev_len != intersections.len() && rounds_left > 0 {
        if intersections.len() > params.max_true_signs {
            warn!(
                "Stopping with {} intersections, subset search would exceed the bound of {}",
                intersections.len(),
                params.max_true_signs
            );
            break;
        }
        debug!("Rounds left: {}", rounds_left);
        prev_len = intersections.len();
        intersections = combine_round(intersections, params).await;
        debug!("Got {} intersections", intersections.len());
        rounds_left -= 1;
    }

    Ok(Consolidation {
        intersections,
        bad_functions,
    })
}

/// Stage one: every (split, sign) pair on the filter pool
async fn filter_signs(
    splits: Arc<Vec<Split>>,
    signs: Arc<Vec<FunctionResult>>,
    params: ConsolidationParams,
    base_index: usize,
) -> (Vec<Intersection>, BTreeSet<usize>) {
    let tasks: Vec<(usize, usize)> = (0..splits.len())
        .flat_map(|split_idx| (0..signs.len()).map(move |sign_idx| (split_idx, sign_idx)))
        .collect();
    let pool = WorkerPool::new("filter", params.filter_workers);
    let queue_capacity = tasks.len();
    let shared_signs = signs.clone();
    let matches = pool
        .collect(
            tasks,
            queue_capacity,
            move |(split_idx, sign_idx), tx: ResultSender<SignMatches>| {
                let splits = splits.clone();
                let signs = shared_signs.clone();
                async move {
                    let found = filter_by_sign(split_idx, &splits[split_idx], sign_idx, &signs[sign_idx]);
                    let _ = tx.send(found).await;
                }
            },
        )
        .await;

    // a noisy split disqualifies the sign everywhere
    let mut noisy = BTreeSet::new();
    let mut bad_functions = BTreeSet::new();
    for m in matches.iter().filter(|m| m.n_ports > params.max_ports) {
        noisy.insert(m.sign_idx);
        bad_functions.insert(m.f_idx);
    }

    let mut per_sign: BTreeMap<usize, Vec<SignMatches>> = BTreeMap::new();
    for m in matches {
        if !noisy.contains(&m.sign_idx) {
            per_sign.entry(m.sign_idx).or_default().push(m);
        }
    }

    let singles = per_sign
        .into_iter()
        .map(|(sign_idx, mut parts)| {
            parts.sort_by_key(|m| m.split_idx);
            let packets = parts.into_iter().flat_map(|m| m.packets).collect();
            Intersection::single(base_index + sign_idx, signs[sign_idx].index, packets)
        })
        .collect();

    (singles, bad_functions)
}

/// Stage two, one round: every non-empty subset on the subset pool
async fn combine_round(current: Vec<Intersection>, params: ConsolidationParams) -> Vec<Intersection> {
    let members = Arc::new(current);
    let pool = WorkerPool::new("subset", params.subset_workers);
    let min_overlap = params.min_overlap;
    let queue_capacity = pool.workers() * 4;

    let shared = members.clone();
    let mut results_rx = pool.run(
        Subsets::new(members.len()),
        queue_capacity,
        move |subset: Vec<usize>, tx: ResultSender<Intersection>| {
            let members = shared.clone();
            async move {
                let combined = {
                    let refs: Vec<&Intersection> = subset.iter().map(|i| &members[*i]).collect();
                    combine_subset(&refs, min_overlap)
                };
                for intersection in combined {
                    if tx.send(intersection).await.is_err() {
                        break;
                    }
                }
            }
        },
    );

    let mut next = Vec::with_capacity(members.len());
    while let Some(intersection) = results_rx.recv().await {
        add_intersection(&mut next, intersection);
    }
    next.sort_by(|a, b| a.idxs.cmp(&b.idxs));
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Sign;
    use crate::packet::{Field, Packet};
    use crate::synthesis::PacketFunction;

    fn seq_sign(value: u32, index: usize) -> FunctionResult {
        FunctionResult {
            sign: Sign::new(PacketFunction::seed(Field::Seq), value),
            index,
        }
    }

    fn window_sign(value: u16, index: usize) -> FunctionResult {
        FunctionResult {
            sign: Sign::new(PacketFunction::seed(Field::Window), value as u32),
            index,
        }
    }

    fn packet(seq: u32, window: u16, dst_port: u16) -> Packet {
        Packet {
            seq,
            window,
            dst_port,
            ..Default::default()
        }
    }

    fn params() -> ConsolidationParams {
        ConsolidationParams {
            filter_workers: 4,
            subset_workers: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_by_sign_counts_ports() {
        let split = Split::new(
            "t",
            vec![packet(3, 0, 80), packet(4, 0, 80), packet(3, 0, 443), packet(3, 0, 80)],
        );
        let m = filter_by_sign(2, &split, 0, &seq_sign(3, 9));
        assert_eq!(m.n_ports, 2);
        assert_eq!(m.f_idx, 9);
        assert_eq!(
            m.packets,
            vec![PacketIndex::new(2, 0), PacketIndex::new(2, 2), PacketIndex::new(2, 3)]
        );
    }

    #[test]
    fn test_filter_by_sign_reports_corpus_positions() {
        let split = Split::new("t", vec![packet(3, 0, 80), packet(4, 0, 80), packet(3, 0, 80), packet(3, 0, 80)]);
        let visited: HashSet<PacketIndex> = [PacketIndex::new(0, 0), PacketIndex::new(0, 1)].into_iter().collect();
        let filtered = crate::packet::filter_splits(&visited, &[split]);

        let m = filter_by_sign(0, &filtered[0], 0, &seq_sign(3, 1));
        assert_eq!(m.packets, vec![PacketIndex::new(0, 2), PacketIndex::new(0, 3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_above_true_sign_bound_stops_without_error() {
        // every pair of the four signs shares two packets, no triple shares more than one
        let flags = [(1, 1, 1, 0), (1, 1, 0, 1), (1, 0, 1, 1), (0, 1, 1, 1)];
        let packets = flags
            .iter()
            .map(|&(ip_id, src_port, seq, window)| Packet {
                ip_id,
                src_port,
                seq,
                window,
                ..Default::default()
            })
            .collect();
        let splits = Arc::new(vec![Split::new("t", packets)]);
        let signs = Arc::new(
            [Field::IpId, Field::SrcPort, Field::Seq, Field::Window]
                .iter()
                .enumerate()
                .map(|(index, field)| FunctionResult {
                    sign: Sign::new(PacketFunction::seed(*field), 1),
                    index,
                })
                .collect::<Vec<_>>(),
        );
        let p = ConsolidationParams {
            max_true_signs: 4,
            min_overlap: 0.6,
            max_rounds: 10,
            ..params()
        };

        let result = consolidate_signs(splits, signs, p, 0).await.unwrap();
        let idxs: Vec<Vec<usize>> = result.intersections.iter().map(|i| i.idxs.clone()).collect();
        assert_eq!(
            idxs,
            vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]
        );
        assert!(result.intersections.iter().all(|i| i.size == 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_sign_spans_splits() {
        let splits = Arc::new(vec![
            Split::new("t0", vec![packet(3, 0, 80), packet(1, 0, 80)]),
            Split::new("t1", vec![packet(1, 0, 80), packet(3, 0, 81)]),
        ]);
        let signs = Arc::new(vec![seq_sign(3, 5)]);
        let result = consolidate_signs(splits, signs, params(), 7).await.unwrap();

        assert_eq!(result.intersections.len(), 1);
        let only = &result.intersections[0];
        assert_eq!(only.idxs, vec![7]);
        assert_eq!(only.f_idxs, vec![5]);
        assert_eq!(only.packets, vec![PacketIndex::new(0, 0), PacketIndex::new(1, 1)]);
        assert!(result.bad_functions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_noisy_sign_is_dropped_in_every_split() {
        // sign 0 is clean in t0 but spans 25 ports in t1
        let mut noisy: Vec<Packet> = (0..25).map(|p| packet(3, 0, 1000 + p)).collect();
        noisy.push(packet(9, 0, 22));
        let splits = Arc::new(vec![
            Split::new("t0", vec![packet(3, 0, 80), packet(9, 0, 22)]),
            Split::new("t1", noisy),
        ]);
        let signs = Arc::new(vec![seq_sign(3, 11), seq_sign(9, 12)]);
        let result = consolidate_signs(splits, signs, params(), 0).await.unwrap();

        assert_eq!(result.bad_functions.into_iter().collect::<Vec<_>>(), vec![11]);
        assert_eq!(result.intersections.len(), 1);
        assert_eq!(result.intersections[0].idxs, vec![1]);
        assert_eq!(result.intersections[0].size, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fully_overlapping_signs_merge() {
        let mut packets: Vec<Packet> = (0..40).map(|i| packet(3, 7, 80 + (i % 4))).collect();
        packets.extend((0..60).map(|i| packet(100 + i, 100 + i as u16, 80)));
        let splits = Arc::new(vec![Split::new("t", packets)]);
        let signs = Arc::new(vec![seq_sign(3, 5), window_sign(7, 6)]);

        let result = consolidate_signs(splits, signs, params(), 0).await.unwrap();
        assert_eq!(result.intersections.len(), 1);
        let merged = &result.intersections[0];
        assert_eq!(merged.idxs, vec![0, 1]);
        assert_eq!(merged.f_idxs, vec![5, 6]);
        assert_eq!(merged.size, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_half_overlapping_signs_pass_through() {
        // seq 3 matches packets 0..40, window 7 matches packets 20..60
        let packets: Vec<Packet> = (0..60u32)
            .map(|i| {
                let seq = if i < 40 { 3 } else { 1000 + i };
                let window = if i >= 20 { 7 } else { 500 + i as u16 };
                packet(seq, window, 80)
            })
            .collect();
        let splits = Arc::new(vec![Split::new("t", packets)]);
        let signs = Arc::new(vec![seq_sign(3, 5), window_sign(7, 6)]);
        let p = ConsolidationParams {
            min_overlap: 0.99,
            ..params()
        };

        let result = consolidate_signs(splits, signs, p, 0).await.unwrap();
        let signs: Vec<Vec<usize>> = result.intersections.iter().map(|i| i.idxs.clone()).collect();
        assert_eq!(signs, vec![vec![0], vec![1]]);
        assert!(result.intersections.iter().all(|i| i.size == 40));
    }

    #[tokio::test]
    async fn test_no_signs_yields_nothing() {
        let splits = Arc::new(vec![Split::new("t", vec![packet(1, 1, 1)])]);
        let result = consolidate_signs(splits, Arc::new(Vec::new()), params(), 0)
            .await
            .unwrap();
        assert_eq!(result, Consolidation::default());
    }
}
