//! Packet model: captured TCP/IP header fields grouped into time-bucketed splits

pub mod corpus;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub use corpus::{load_splits, read_time_labels, CorpusOptions};

/// IP identification value ZMap stamps on every scan packet
pub const ZMAP_IP_ID: u16 = 54321;

/// Header fields of one captured packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Packet {
    pub ip_id: u16,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub window: u16,
}

/// The seven packet fields, each usable as a seed extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    IpId,
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    Seq,
    Window,
}

impl Field {
    /// All fields in seed order
    pub const ALL: [Field; 7] = [
        Field::IpId,
        Field::SrcIp,
        Field::DstIp,
        Field::SrcPort,
        Field::DstPort,
        Field::Seq,
        Field::Window,
    ];

    /// Label used when rendering compositions
    pub fn label(&self) -> &'static str {
        match self {
            Field::IpId => "Get IP Id",
            Field::SrcIp => "Get Src IP",
            Field::DstIp => "Get Dst IP",
            Field::SrcPort => "Get Src Port",
            Field::DstPort => "Get Dst Port",
            Field::Seq => "Get Seq",
            Field::Window => "Get Window",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Packets captured within one time bucket.
///
/// `origins[i]` is the position `packets[i]` held in the loaded corpus, so
/// filtered and sampled splits still report packets in corpus coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Split {
    pub packets: Vec<Packet>,
    pub origins: Vec<usize>,
    pub time: String,
}

impl Split {
    /// A split read straight from the corpus: every packet is at its origin
    pub fn new(time: impl Into<String>, packets: Vec<Packet>) -> Self {
        let origins = (0..packets.len()).collect();
        Self {
            packets,
            origins,
            time: time.into(),
        }
    }

    /// A split derived from the corpus, with each packet's corpus position
    pub fn from_parts(time: impl Into<String>, packets: Vec<Packet>, origins: Vec<usize>) -> Self {
        debug_assert_eq!(packets.len(), origins.len());
        Self {
            packets,
            origins,
            time: time.into(),
        }
    }

    /// Corpus coordinates of the packet at `packet_idx` in this split
    pub fn corpus_index(&self, split_idx: usize, packet_idx: usize) -> PacketIndex {
        PacketIndex::new(split_idx, self.origins[packet_idx])
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Identifies one packet by its position in the loaded corpus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketIndex {
    pub split_idx: usize,
    pub packet_idx: usize,
}

impl PacketIndex {
    pub fn new(split_idx: usize, packet_idx: usize) -> Self {
        Self {
            split_idx,
            packet_idx,
        }
    }
}

/// Total number of packets across splits
pub fn split_len(splits: &[Split]) -> usize {
    splits.iter().map(Split::len).sum()
}

/// Look up the packet an index refers to
pub fn resolve<'a>(splits: &'a [Split], index: &PacketIndex) -> Option<&'a Packet> {
    splits
        .get(index.split_idx)
        .and_then(|split| split.packets.get(index.packet_idx))
}

/// Rebuild every split without the visited packets.
///
/// `visited` holds corpus coordinates, so filtering an already filtered
/// corpus with the same set changes nothing. Split positions are kept, so a
/// split may end up empty.
pub fn filter_splits(visited: &HashSet<PacketIndex>, splits: &[Split]) -> Vec<Split> {
    splits
        .par_iter()
        .enumerate()
        .map(|(split_idx, split)| {
            let (packets, origins) = split
                .packets
                .iter()
                .zip(&split.origins)
                .filter(|(_, origin)| !visited.contains(&PacketIndex::new(split_idx, **origin)))
                .map(|(packet, origin)| (*packet, *origin))
                .unzip();
            Split::from_parts(split.time.clone(), packets, origins)
        })
        .collect()
}

/// Fraction of `current`'s packets (compared by value) also present in `previous`
pub fn split_similarity(previous: &[Split], current: &[Split], size: usize) -> f64 {
    if size == 0 {
        return 0.0;
    }
    let seen: HashSet<&Packet> = previous.iter().flat_map(|s| s.packets.iter()).collect();
    let shared = current
        .iter()
        .flat_map(|s| s.packets.iter())
        .filter(|p| seen.contains(p))
        .count();
    shared as f64 / size as f64
}
