//! Reproducible proportional sampling of the packet pool

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

use crate::error::{IdentError, IdentResult};
use crate::packet::Split;

/// Derive the per-iteration seed pair from the base seeds and the iterations left
pub fn rotate_seeds(seed1: u64, seed2: u64, iterations_left: usize) -> (u64, u64) {
    let k = (iterations_left % 64) as u32;
    (seed1.rotate_right(k), seed2.rotate_left(k))
}

/// Generator for one iteration's sample
pub fn iteration_rng(seed1: u64, seed2: u64, iterations_left: usize) -> StdRng {
    let (s0, s1) = rotate_seeds(seed1, seed2, iterations_left);
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&s0.to_le_bytes());
    key[8..16].copy_from_slice(&s1.to_le_bytes());
    StdRng::from_seed(key)
}

/// Draw about `n` packets, each split contributing in proportion to its share
/// of `total`.
///
/// Packets are drawn without replacement within a split. Every repeated pick
/// spends one try of the shared `max_tries` budget; running out of tries is
/// [`IdentError::SamplingExhausted`].
pub fn sample_splits<R: Rng + ?Sized>(
    splits: &[Split],
    n: usize,
    total: usize,
    max_tries: usize,
    rng: &mut R,
) -> IdentResult<Vec<Split>> {
    if total == 0 {
        return Ok(splits.iter().map(|s| Split::new(s.time.clone(), Vec::new())).collect());
    }

    let mut tries_left = max_tries;
    let mut sampled = Vec::with_capacity(splits.len());
    for split in splits {
        let size = split.len();
        let wanted = (n * size / total).min(size);
        let mut seen = HashSet::with_capacity(wanted);
        let mut packets = Vec::with_capacity(wanted);
        let mut origins = Vec::with_capacity(wanted);

        while packets.len() < wanted {
            let pick = ((rng.gen::<f64>() * size as f64) as usize).min(size - 1);
            if !seen.insert(pick) {
                if tries_left == 0 {
                    return Err(IdentError::SamplingExhausted { tries: max_tries });
                }
                tries_left -= 1;
                continue;
            }
            packets.push(split.packets[pick]);
            origins.push(split.origins[pick]);
        }
        sampled.push(Split::from_parts(split.time.clone(), packets, origins));
    }
    Ok(sampled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{split_len, Packet};

    fn split(time: &str, range: std::ops::Range<u32>) -> Split {
        Split::new(
            time,
            range
                .map(|seq| Packet {
                    seq,
                    ..Default::default()
                })
                .collect(),
        )
    }

    #[test]
    fn test_rotate_seeds() {
        assert_eq!(rotate_seeds(1, 1, 1), (1 << 63, 2));
        assert_eq!(rotate_seeds(7, 9, 64), (7, 9));
        assert_eq!(rotate_seeds(7, 9, 0), (7, 9));
    }

    #[test]
    fn test_sample_is_distinct_and_from_source() {
        let splits = vec![split("t0", 0..1000)];
        let mut rng = iteration_rng(11, 12, 5);
        let sample = sample_splits(&splits, 300, 1000, 3000, &mut rng).unwrap();

        assert_eq!(sample[0].len(), 300);
        let distinct: HashSet<u32> = sample[0].packets.iter().map(|p| p.seq).collect();
        assert_eq!(distinct.len(), 300);
        assert!(distinct.iter().all(|seq| *seq < 1000));
        assert_eq!(sample[0].time, "t0");
    }

    #[test]
    fn test_sample_is_proportional() {
        let splits = vec![split("t0", 0..600), split("t1", 600..1000)];
        let mut rng = iteration_rng(1, 2, 3);
        let sample = sample_splits(&splits, 100, 1000, 1000, &mut rng).unwrap();
        assert_eq!(sample[0].len(), 60);
        assert_eq!(sample[1].len(), 40);
        assert!(sample[1].packets.iter().all(|p| p.seq >= 600));
    }

    #[test]
    fn test_sample_keeps_corpus_positions() {
        let splits = vec![split("t0", 0..400)];
        let sample = sample_splits(&splits, 40, 400, 400, &mut iteration_rng(8, 9, 2)).unwrap();
        for (packet, origin) in sample[0].packets.iter().zip(&sample[0].origins) {
            assert_eq!(packet.seq as usize, *origin);
        }
    }

    #[test]
    fn test_sample_is_reproducible_per_iteration() {
        let splits = vec![split("t0", 0..500)];
        let a = sample_splits(&splits, 50, 500, 500, &mut iteration_rng(3, 4, 9)).unwrap();
        let b = sample_splits(&splits, 50, 500, 500, &mut iteration_rng(3, 4, 9)).unwrap();
        let c = sample_splits(&splits, 50, 500, 500, &mut iteration_rng(3, 4, 8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_whole_split_with_no_tries_left_is_exhausted() {
        let splits = vec![split("t0", 0..200)];
        let result = sample_splits(&splits, 200, 200, 0, &mut iteration_rng(5, 6, 1));
        assert!(matches!(result, Err(IdentError::SamplingExhausted { tries: 0 })));
    }

    #[test]
    fn test_empty_pool() {
        let splits = vec![Split::new("t0", Vec::new())];
        let sample = sample_splits(&splits, 10, 0, 100, &mut iteration_rng(0, 0, 0)).unwrap();
        assert_eq!(split_len(&sample), 0);
    }
}
