//! Corpus loading: reads captured packet records and groups them into splits
//!
//! Records are CSV rows with the header
//! `time,ip_id,src_ip,dst_ip,src_port,dst_port,seq,window`; addresses are the
//! numeric (host order) form of the IPv4 address. Rows are bucketed by `time`.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use super::{Packet, Split, ZMAP_IP_ID};

/// Options applied while loading a corpus
#[derive(Debug, Clone, Default)]
pub struct CorpusOptions {
    /// Time labels to load, in split order. Empty loads every label in order of first appearance
    pub time_labels: Vec<String>,
    /// Maximum number of packets kept per split
    pub limit: Option<usize>,
    /// Drop packets carrying ZMap's fixed IP identification
    pub exclude_zmap: bool,
}

#[derive(Debug, Deserialize)]
struct PacketRecord {
    time: String,
    ip_id: u16,
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    window: u16,
}

impl From<&PacketRecord> for Packet {
    fn from(r: &PacketRecord) -> Self {
        Packet {
            ip_id: r.ip_id,
            src_ip: r.src_ip,
            dst_ip: r.dst_ip,
            src_port: r.src_port,
            dst_port: r.dst_port,
            seq: r.seq,
            window: r.window,
        }
    }
}

/// Read time labels from a file, one per line. Blank lines and `#` comments are skipped
pub fn read_time_labels<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open time label file: {:?}", path.as_ref()))?;
    let mut labels = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let label = line.trim();
        if label.is_empty() || label.starts_with('#') {
            continue;
        }
        labels.push(label.to_string());
    }
    Ok(labels)
}

/// Load the corpus at `path` into splits.
///
/// Returns the splits together with the total number of packets loaded.
pub fn load_splits<P: AsRef<Path>>(path: P, options: &CorpusOptions) -> Result<(Vec<Split>, usize)> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open corpus file: {:?}", path.as_ref()))?;
    let (splits, n_packets) = read_splits(file, options)
        .with_context(|| format!("Failed to read corpus file: {:?}", path.as_ref()))?;
    info!(
        "Loaded {} packets in {} splits from {:?}",
        n_packets,
        splits.len(),
        path.as_ref()
    );
    Ok((splits, n_packets))
}

/// Read splits from any CSV source
pub fn read_splits<R: Read>(source: R, options: &CorpusOptions) -> Result<(Vec<Split>, usize)> {
    let mut reader = csv::Reader::from_reader(source);

    let mut order: Vec<String> = options.time_labels.clone();
    let mut buckets: HashMap<String, Vec<Packet>> = order
        .iter()
        .map(|label| (label.clone(), Vec::new()))
        .collect();
    let restrict = !options.time_labels.is_empty();
    let mut skipped_zmap = 0usize;

    for (line, record) in reader.deserialize::<PacketRecord>().enumerate() {
        let record = record.with_context(|| format!("Invalid packet record at row {}", line + 1))?;

        if options.exclude_zmap && record.ip_id == ZMAP_IP_ID {
            skipped_zmap += 1;
            continue;
        }

        if !buckets.contains_key(&record.time) {
            if restrict {
                continue;
            }
            order.push(record.time.clone());
        }
        let bucket = buckets.entry(record.time.clone()).or_default();

        if options.limit.map_or(true, |limit| bucket.len() < limit) {
            bucket.push(Packet::from(&record));
        }
    }

    if skipped_zmap > 0 {
        debug!("Excluded {} ZMap packets", skipped_zmap);
    }

    let splits: Vec<Split> = order
        .into_iter()
        .map(|label| {
            let packets = buckets.remove(&label).unwrap_or_default();
            if packets.is_empty() {
                warn!("No packets for time label {}", label);
            }
            Split::new(label, packets)
        })
        .collect();

    let n_packets = super::split_len(&splits);
    if n_packets == 0 {
        bail!("Corpus contains no packets");
    }
    Ok((splits, n_packets))
}
