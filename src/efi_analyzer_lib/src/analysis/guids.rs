//! Discovery of GUIDs stored in the module image or assembled on the stack.

use super::dataflow::{fill_bytes, guid_from_partial_bytes};
use super::{read_guid, AnalysisContext, FunctionBody};
use crate::intermediate_representation::{BinaryFacts, Segment};
use crate::prelude::*;
use crate::uefi::{is_smm_marker, Guid, GuidDatabase};

/// Where a GUID was found.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum GuidSource {
    /// A 16 byte pattern in a data segment.
    Data,
    /// Immediate stores assembling the GUID in adjacent stack slots.
    Local,
}

/// A GUID found in the module.
///
/// The found address is unique per record,
/// the same GUID value may be found at several addresses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct GuidRecord {
    /// The address of the GUID bytes or of the first store instruction for local GUIDs.
    pub found_address: u64,
    pub value: Guid,
    pub name: Option<String>,
    pub source: GuidSource,
}

/// The segments that may contain GUID data: the non-executable segments,
/// or all segments if the module has no non-executable segment.
fn data_segments(facts: &dyn BinaryFacts) -> Vec<&Segment> {
    let segments: Vec<&Segment> = facts.segments().iter().filter(|segment| !segment.is_code()).collect();
    if segments.is_empty() {
        facts.segments().iter().collect()
    } else {
        segments
    }
}

/// Iterate over the GUID candidates at the given alignment in the data segments.
fn aligned_candidates(facts: &dyn BinaryFacts, alignment: u64) -> impl Iterator<Item = (u64, Guid)> + '_ {
    let alignment = alignment.max(1);
    data_segments(facts).into_iter().flat_map(move |segment| {
        let first = (segment.start + alignment - 1) / alignment * alignment;
        (first..segment.end().saturating_sub(15))
            .step_by(alignment as usize)
            .filter_map(move |address| Some((address, read_guid(facts, address)?)))
            .filter(|(_, guid)| guid.is_plausible())
    })
}

/// Find the GUIDs in the data segments of the module.
///
/// An aligned candidate is reported if it is known to the GUID database
/// or if it is referenced by an instruction.
pub fn find_data_guids(facts: &dyn BinaryFacts, guids: &dyn GuidDatabase, alignment: u64) -> Vec<GuidRecord> {
    aligned_candidates(facts, alignment)
        .filter_map(|(address, value)| {
            let name = guids.name_of(&value).map(str::to_string);
            if name.is_none() && facts.cross_references_to(address).is_empty() {
                return None;
            }
            Some(GuidRecord {
                found_address: address,
                value,
                name,
                source: GuidSource::Data,
            })
        })
        .collect()
}

/// Returns `true` if the data segments contain a GUID that only SMM drivers use.
pub fn has_smm_markers(facts: &dyn BinaryFacts) -> bool {
    aligned_candidates(facts, 4).any(|(_, guid)| is_smm_marker(&guid))
}

/// Find GUIDs assembled by immediate stores to adjacent stack slots of a function.
///
/// The stores of one GUID must lie within `window` instructions.
/// Only GUIDs known to the GUID database are reported.
pub fn find_local_guids(
    context: &AnalysisContext,
    body: &FunctionBody,
    window: usize,
) -> Vec<GuidRecord> {
    let tracer = context.tracer(body);
    let stores: Vec<_> = (0..body.len()).map(|index| tracer.stack_stores(index)).collect();
    let mut records = Vec::new();
    let mut index = 0;
    while index < stores.len() {
        let mut consumed = None;
        for first in &stores[index] {
            let mut bytes = [None; 16];
            for (offset, later) in stores[index..].iter().take(window).enumerate() {
                for store in later {
                    fill_bytes(&mut bytes, store, first.slot, true);
                }
                let Some(value) = guid_from_partial_bytes(&bytes) else {
                    continue;
                };
                if let Some(name) = context.guids.name_of(&value) {
                    records.push(GuidRecord {
                        found_address: first.address,
                        value,
                        name: Some(name.to_string()),
                        source: GuidSource::Local,
                    });
                    consumed = Some(index + offset);
                }
                break;
            }
            if consumed.is_some() {
                break;
            }
        }
        index = consumed.unwrap_or(index) + 1;
    }
    records
}

/// Find all data and local GUIDs of the module, sorted by address.
pub fn find_guids(context: &AnalysisContext) -> Vec<GuidRecord> {
    let mut records = find_data_guids(context.facts, context.guids, context.config.guid_scan_alignment);
    let local = super::parallel_map(&context.bodies, context.config.worker_threads, |body| {
        find_local_guids(context, body, context.config.local_guid_window)
    });
    records.extend(local.into_iter().flatten());
    records.sort();
    records.dedup_by_key(|record| record.found_address);
    records
}
