//! Fingerprint reports
//!
//! Accepted intersections are turned into [`Fingerprint`]s and written as one
//! text report per fingerprint, a seeds file for replaying the run, and a JSON
//! summary.

use chrono::{DateTime, Utc};
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::consolidate::Intersection;
use crate::engine::{FunctionResult, Sign};
use crate::error::IdentResult;
use crate::identifier::IdentificationOutcome;
use crate::packet::{resolve, Packet, Split};

/// Sources are listed individually below this count
const LIST_SOURCES_BELOW: usize = 50;
/// Ports are listed individually below this count
const LIST_PORTS_BELOW: usize = 20;

/// The reporting form of an accepted intersection
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub signs: Vec<Sign>,
    /// Function index of every sign
    pub f_idxs: Vec<usize>,
}

impl Fingerprint {
    /// A packet carries the fingerprint when it matches every sign
    pub fn matches(&self, packet: &Packet) -> bool {
        self.signs.iter().all(|sign| sign.matches(packet))
    }

    /// Signs as `{ composition, value }` entries joined by `AND`
    pub fn render(&self, index: usize) -> String {
        let signs: Vec<String> = self
            .signs
            .iter()
            .map(|sign| format!("{{ {}, {} }}\n", sign.function.composition(), sign.value))
            .collect();
        format!("Fingerprint {}:\n{}", index, signs.join("AND\n"))
    }
}

/// Gather the signs of every intersection from the accumulated function results
pub fn build_fingerprints(intersections: &[Intersection], function_results: &[FunctionResult]) -> Vec<Fingerprint> {
    intersections
        .iter()
        .map(|intersection| {
            let (signs, f_idxs) = intersection
                .idxs
                .iter()
                .filter_map(|idx| function_results.get(*idx))
                .map(|result| (result.sign.clone(), result.index))
                .unzip();
            Fingerprint { signs, f_idxs }
        })
        .collect()
}

/// Share of each destination port among an intersection's packets, largest first
pub fn port_ratios(intersection: &Intersection, corpus: &[Split]) -> Vec<(u16, f64)> {
    let mut counts: HashMap<u16, usize> = HashMap::new();
    for index in &intersection.packets {
        if let Some(packet) = resolve(corpus, index) {
            *counts.entry(packet.dst_port).or_insert(0) += 1;
        }
    }
    let size = intersection.size.max(1) as f64;
    let mut ratios: Vec<(u16, f64)> = counts
        .into_iter()
        .map(|(port, count)| (port, count as f64 / size))
        .collect();
    ratios.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ratios
}

/// Full text report of one fingerprint
pub fn render_report(
    index: usize,
    fingerprint: &Fingerprint,
    intersection: &Intersection,
    corpus: &[Split],
    n_packets: usize,
) -> String {
    let mut report = fingerprint.render(index);
    let fraction = intersection.size as f64 / n_packets.max(1) as f64;
    report.push_str(&format!("  , Fraction of packets: {:.6}\n", fraction));
    for (port, ratio) in port_ratios(intersection, corpus) {
        report.push_str(&format!("  Port {}: {:.6},\n", port, ratio));
    }
    report
}

/// Who and what a fingerprint matches across a packet pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintData {
    pub packets: usize,
    pub sources: BTreeMap<u32, usize>,
    pub ports: BTreeMap<u16, usize>,
}

impl FingerprintData {
    /// Scan every split for packets carrying the fingerprint
    pub fn collect(fingerprint: &Fingerprint, splits: &[Split]) -> Self {
        splits
            .par_iter()
            .map(|split| {
                let mut data = FingerprintData::default();
                for packet in split.packets.iter().filter(|p| fingerprint.matches(p)) {
                    data.packets += 1;
                    *data.sources.entry(packet.src_ip).or_insert(0) += 1;
                    *data.ports.entry(packet.dst_port).or_insert(0) += 1;
                }
                data
            })
            .reduce(FingerprintData::default, FingerprintData::merge)
    }

    fn merge(mut self, other: FingerprintData) -> Self {
        self.packets += other.packets;
        for (source, count) in other.sources {
            *self.sources.entry(source).or_insert(0) += count;
        }
        for (port, count) in other.ports {
            *self.ports.entry(port).or_insert(0) += count;
        }
        self
    }

    pub fn render(&self, n_packets: usize) -> String {
        let mut out = format!(
            "N packets: {}, fraction: {:.6}\n",
            self.packets,
            self.packets as f64 / n_packets.max(1) as f64
        );
        out.push_str(&format!("N sources: {}\n", self.sources.len()));
        if self.sources.len() < LIST_SOURCES_BELOW {
            for (source, count) in &self.sources {
                out.push_str(&format!("  {}: {}\n", Ipv4Addr::from(*source), count));
            }
        }
        out.push_str(&format!("N ports: {}\n", self.ports.len()));
        if self.ports.len() < LIST_PORTS_BELOW {
            for (port, count) in &self.ports {
                out.push_str(&format!("  {}: {}\n", port, count));
            }
        }
        out
    }
}

/// JSON summary of a whole run
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRunSummary {
    pub generated_at: DateTime<Utc>,
    pub seeds: (u64, u64),
    pub iterations: usize,
    pub final_threshold: f64,
    pub stop_reason: String,
    pub n_packets: usize,
    pub fingerprinted_packets: usize,
    pub bad_functions: Vec<usize>,
    pub fingerprints: Vec<JsonFingerprint>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonFingerprint {
    pub index: usize,
    pub size: usize,
    pub fraction: f64,
    pub signs: Vec<JsonSign>,
    pub ports: Vec<JsonPortRatio>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonSign {
    pub function_index: usize,
    pub composition: String,
    pub cost: u32,
    pub value: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonPortRatio {
    pub port: u16,
    pub ratio: f64,
}

impl JsonRunSummary {
    pub fn new(outcome: &IdentificationOutcome, n_packets: usize) -> Self {
        let fingerprints = build_fingerprints(&outcome.intersections, &outcome.function_results)
            .iter()
            .zip(&outcome.intersections)
            .enumerate()
            .map(|(index, (fingerprint, intersection))| JsonFingerprint {
                index,
                size: intersection.size,
                fraction: intersection.size as f64 / n_packets.max(1) as f64,
                signs: fingerprint
                    .signs
                    .iter()
                    .zip(&fingerprint.f_idxs)
                    .map(|(sign, f_idx)| JsonSign {
                        function_index: *f_idx,
                        composition: sign.function.composition().to_string(),
                        cost: sign.function.cost(),
                        value: sign.value,
                    })
                    .collect(),
                ports: port_ratios(intersection, &outcome.corpus)
                    .into_iter()
                    .map(|(port, ratio)| JsonPortRatio { port, ratio })
                    .collect(),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            seeds: outcome.seeds,
            iterations: outcome.iterations,
            final_threshold: outcome.threshold,
            stop_reason: outcome.stop_reason.to_string(),
            n_packets,
            fingerprinted_packets: outcome.fingerprinted_packets,
            bad_functions: outcome.bad_functions.iter().copied().collect(),
            fingerprints,
        }
    }
}

/// Writes the report files of a run into one directory
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `seeds`, one `intersection_<i>` per fingerprint and `summary.json`.
    ///
    /// Returns the paths written, in that order.
    pub fn write(&self, outcome: &IdentificationOutcome, n_packets: usize) -> IdentResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let mut written = Vec::new();

        let seeds_path = self.dir.join("seeds");
        fs::write(
            &seeds_path,
            format!("SEEDS: {}, {}\n", outcome.seeds.0, outcome.seeds.1),
        )?;
        written.push(seeds_path);

        let fingerprints = build_fingerprints(&outcome.intersections, &outcome.function_results);
        for (i, (fingerprint, intersection)) in fingerprints.iter().zip(&outcome.intersections).enumerate() {
            let path = self.dir.join(format!("intersection_{}", i));
            let report = render_report(i, fingerprint, intersection, &outcome.corpus, n_packets);
            fs::write(&path, report.as_bytes())?;
            info!("Wrote {} bytes to {}", report.len(), path.display());
            written.push(path);
        }

        let summary_path = self.dir.join("summary.json");
        let summary = JsonRunSummary::new(outcome, n_packets);
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
        written.push(summary_path);

        Ok(written)
    }
}
