//! Intersections: candidate fingerprints as sign sets plus the packets they match

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::packet::PacketIndex;

/// A set of signs and the packets all of them match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intersection {
    /// Sign indices into the accumulated function results
    pub idxs: Vec<usize>,
    /// Function indices, parallel to `idxs`
    pub f_idxs: Vec<usize>,
    pub packets: Vec<PacketIndex>,
    pub size: usize,
}

impl Intersection {
    pub fn new(idxs: Vec<usize>, f_idxs: Vec<usize>, packets: Vec<PacketIndex>) -> Self {
        let size = packets.len();
        Self {
            idxs,
            f_idxs,
            packets,
            size,
        }
    }

    /// Intersection of a single sign
    pub fn single(idx: usize, f_idx: usize, packets: Vec<PacketIndex>) -> Self {
        Self::new(vec![idx], vec![f_idx], packets)
    }

    /// Does this intersection carry every sign of `other`
    pub fn covers(&self, other: &Intersection) -> bool {
        contains_all(&self.idxs, &other.idxs)
    }

    fn same_signs(&self, other: &Intersection) -> bool {
        self.covers(other) && other.covers(self)
    }

    /// Deterministic pick between two intersections over the same signs
    fn preferred_over(&self, other: &Intersection) -> bool {
        match self.size.cmp(&other.size) {
            std::cmp::Ordering::Equal => self.packets < other.packets,
            ordering => ordering == std::cmp::Ordering::Greater,
        }
    }
}

/// True when every element of `ys` appears in `xs`
pub fn contains_all(xs: &[usize], ys: &[usize]) -> bool {
    let set: HashSet<usize> = xs.iter().copied().collect();
    ys.iter().all(|y| set.contains(y))
}

/// Merge `item` into `list`, keeping only intersections with maximal sign sets.
///
/// `item` replaces every entry whose signs it covers and is dropped when an
/// entry already covers its signs. Entries over an identical sign set are
/// resolved by size, then by packet order, so the outcome does not depend on
/// the order intersections arrive in.
pub fn add_intersection(list: &mut Vec<Intersection>, item: Intersection) {
    if let Some(pos) = list.iter().position(|existing| existing.same_signs(&item)) {
        if item.preferred_over(&list[pos]) {
            list[pos] = item;
        }
        return;
    }
    if list.iter().any(|existing| existing.covers(&item)) {
        return;
    }
    list.retain(|existing| !item.covers(existing));
    list.push(item);
}

/// Merge several intersections with [`add_intersection`]
pub fn merge_intersections(list: &mut Vec<Intersection>, items: impl IntoIterator<Item = Intersection>) {
    for item in items {
        add_intersection(list, item);
    }
}

/// Packets of `y` that also appear in `x`, in `y`'s order
pub fn intersect(x: &[PacketIndex], y: &[PacketIndex]) -> Vec<PacketIndex> {
    let set: HashSet<&PacketIndex> = x.iter().collect();
    y.iter().filter(|p| set.contains(p)).copied().collect()
}

/// Packets present in every one of the given sets
pub fn intersect_all<'a>(mut sets: impl Iterator<Item = &'a [PacketIndex]>) -> Vec<PacketIndex> {
    let first = match sets.next() {
        Some(first) => first.to_vec(),
        None => return Vec::new(),
    };
    sets.fold(first, |acc, next| intersect(&acc, next))
}

/// Union the sign pairs of several intersections, keeping first-seen order.
///
/// Pairs are keyed by sign index so `idxs` and `f_idxs` stay parallel.
pub fn union_signs(members: &[&Intersection]) -> (Vec<usize>, Vec<usize>) {
    let mut seen = HashSet::new();
    let mut idxs = Vec::new();
    let mut f_idxs = Vec::new();
    for member in members {
        for (idx, f_idx) in member.idxs.iter().zip(&member.f_idxs) {
            if seen.insert(*idx) {
                idxs.push(*idx);
                f_idxs.push(*f_idx);
            }
        }
    }
    (idxs, f_idxs)
}

/// Combine one subset of intersections.
///
/// The members merge into one intersection when their common packets exceed
/// `min_overlap` of every member's size. Otherwise each member is passed
/// through unchanged so it stays available for other combinations.
pub fn combine_subset(members: &[&Intersection], min_overlap: f64) -> Vec<Intersection> {
    let packets = intersect_all(members.iter().map(|m| m.packets.as_slice()));
    let combined = packets.len() as f64;
    let overlaps = members.iter().all(|m| combined > min_overlap * m.size as f64);

    if overlaps && !members.is_empty() {
        let (idxs, f_idxs) = union_signs(members);
        vec![Intersection::new(idxs, f_idxs, packets)]
    } else {
        members.iter().map(|m| (*m).clone()).collect()
    }
}
