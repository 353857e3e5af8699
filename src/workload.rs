//! Checksummed record entries and a deterministic workload that drives the
//! cache through its whole lifecycle.
//!
//! A record image is `[len: u32 LE][fnv1a(body): u32 LE][body]`. The length
//! is not known before the header is read, so records are loaded
//! speculatively and verified against their checksum.

use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::class::{
    downcast_payload, downcast_payload_mut, ClassResult, Effects, EntryClass, LoadContext,
    NotifyAction, NotifyContext,
};
use crate::cache::{Address, Cache, FlushFlags, InsertFlags, ProtectFlags, Ring, UnprotectFlags};
use crate::error::{ClassError, Result};
use crate::store::BackingStore;

/// Bytes of header in front of every record body.
pub const HEADER_LEN: usize = 8;

/// Spacing of records in the store.
pub const SLOT_SIZE: u64 = 256;

/// Speculative read length when the caller has no better hint.
const DEFAULT_GUESS: usize = 64;

const MAX_BODY: usize = SLOT_SIZE as usize - HEADER_LEN;

/// 32-bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// In-memory form of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub body: Vec<u8>,
    /// Entry to mark dirty each time this record is written.
    pub touch_on_flush: Option<Address>,
}

impl Record {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            touch_on_flush: None,
        }
    }

    pub fn image_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.image_len()];
        self.encode_into(&mut image);
        image
    }

    fn encode_into(&self, image: &mut [u8]) {
        image[..4].copy_from_slice(&(self.body.len() as u32).to_le_bytes());
        image[4..8].copy_from_slice(&fnv1a(&self.body).to_le_bytes());
        image[HEADER_LEN..].copy_from_slice(&self.body);
    }
}

fn body_len(image: &[u8]) -> ClassResult<usize> {
    if image.len() < HEADER_LEN {
        return Err(ClassError::Malformed(format!(
            "{} bytes is shorter than a record header",
            image.len()
        )));
    }
    let len = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    Ok(len as usize)
}

/// Entry class for [`Record`] payloads.
#[derive(Debug, Default)]
pub struct RecordClass;

impl RecordClass {
    pub const ID: u32 = 0x5245_4344;

    pub fn shared() -> Arc<dyn EntryClass> {
        Arc::new(RecordClass)
    }
}

impl EntryClass for RecordClass {
    fn id(&self) -> u32 {
        Self::ID
    }

    fn name(&self) -> &'static str {
        "record"
    }

    fn initial_load_size(&self, _addr: Address, ctx: LoadContext<'_>) -> ClassResult<usize> {
        Ok(ctx.downcast_ref::<usize>().copied().unwrap_or(DEFAULT_GUESS))
    }

    fn final_load_size(
        &self,
        image: &[u8],
        _initial_size: usize,
        _ctx: LoadContext<'_>,
    ) -> ClassResult<Option<usize>> {
        Ok(Some(HEADER_LEN + body_len(image)?))
    }

    fn has_checksum(&self) -> bool {
        true
    }

    fn verify_checksum(&self, image: &[u8], _ctx: LoadContext<'_>) -> bool {
        match body_len(image) {
            Ok(len) if image.len() == HEADER_LEN + len => {
                let stored = u32::from_le_bytes([image[4], image[5], image[6], image[7]]);
                stored == fnv1a(&image[HEADER_LEN..])
            }
            _ => false,
        }
    }

    fn deserialize(
        &self,
        image: &[u8],
        _addr: Address,
        _ctx: LoadContext<'_>,
    ) -> ClassResult<(Box<dyn Any + Send>, bool)> {
        let len = body_len(image)?;
        let body = image
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| ClassError::Malformed(format!("body of {len} bytes is truncated")))?;
        Ok((Box::new(Record::new(body.to_vec())), false))
    }

    fn image_len(&self, payload: &(dyn Any + Send)) -> ClassResult<usize> {
        Ok(downcast_payload::<Record>(payload, "Record")?.image_len())
    }

    fn serialize(&self, payload: &(dyn Any + Send), image: &mut [u8]) -> ClassResult<()> {
        let record = downcast_payload::<Record>(payload, "Record")?;
        if image.len() != record.image_len() {
            return Err(ClassError::Malformed(format!(
                "record needs {} bytes, entry holds {}",
                record.image_len(),
                image.len()
            )));
        }
        record.encode_into(image);
        Ok(())
    }

    fn wants_notify(&self) -> bool {
        true
    }

    fn notify(
        &self,
        action: NotifyAction,
        ctx: NotifyContext<'_>,
        effects: &mut Effects,
    ) -> ClassResult<()> {
        if action == NotifyAction::AfterFlush {
            let record = downcast_payload_mut::<Record>(ctx.payload, "Record")?;
            if let Some(addr) = record.touch_on_flush {
                effects.mark_dirty(addr);
            }
        }
        Ok(())
    }
}

/// What [`run`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    pub inserted: usize,
    pub dependencies: usize,
    pub updates: usize,
    pub resizes: usize,
    pub reloads: usize,
    pub moves: usize,
    pub expunges: usize,
}

/// Backing-store bytes [`run`] needs for `entries` records.
pub fn store_len(entries: usize) -> u64 {
    (entries as u64 + 4) * SLOT_SIZE
}

fn slot(i: usize) -> Address {
    Address(i as u64 * SLOT_SIZE)
}

fn initial_body(i: usize) -> Vec<u8> {
    let len = 32 + (i * 37) % 128;
    (0..len).map(|b| (i + b) as u8).collect()
}

/// Drive `cache` through insert, dependencies, protect/modify/resize rounds,
/// flushes, eviction and reload, move and expunge.
///
/// Records live at `slot(i)` for `i < entries`. Every eighth record is the
/// flush-dependency parent of the seven after it. A space-map record in the
/// raw-data free-space ring dirties record 0 each time it is written.
pub fn run<S: BackingStore>(
    cache: &mut Cache<S>,
    entries: usize,
    rounds: usize,
) -> Result<WorkloadReport> {
    let class = RecordClass::shared();
    let mut report = WorkloadReport::default();

    for i in 0..entries {
        cache.insert_entry(
            &class,
            slot(i),
            Box::new(Record::new(initial_body(i))),
            InsertFlags::default(),
        )?;
        report.inserted += 1;
    }
    for parent in (0..entries).step_by(8) {
        for child in parent + 1..(parent + 8).min(entries) {
            cache.create_flush_dependency(slot(parent), slot(child))?;
            report.dependencies += 1;
        }
    }

    let space_map = slot(entries + 2);
    if entries > 0 {
        let mut record = Record::new(vec![0xfe; 16]);
        record.touch_on_flush = Some(slot(0));
        cache.insert_entry(
            &class,
            space_map,
            Box::new(record),
            InsertFlags {
                ring: Ring::RAW_DATA_FSM,
                ..Default::default()
            },
        )?;
        report.inserted += 1;
    }
    cache.flush(FlushFlags::default())?;
    info!(entries, dirty = cache.dirty_size(), "Initial records written");

    for round in 0..rounds {
        for i in (round % 3..entries).step_by(3) {
            let addr = slot(i);
            cache.protect(&class, addr, &(), ProtectFlags::default())?;
            let record = cache.payload_mut::<Record>(addr)?;
            let grow = round % 4 == 3 && record.body.len() + 8 <= MAX_BODY;
            if grow {
                record.body.extend_from_slice(&[round as u8; 8]);
            }
            if let Some(b) = record.body.first_mut() {
                *b = b.wrapping_add(1);
            }
            let new_len = record.image_len();
            if grow {
                cache.resize_entry(addr, new_len)?;
                report.resizes += 1;
            }
            cache.unprotect(addr, UnprotectFlags::dirtied())?;
            report.updates += 1;
        }
        // Touch the space map so the next flush re-dirties record 0.
        if entries > 0 && round % 2 == 0 {
            cache.pin_entry(space_map)?;
            cache.mark_entry_dirty(space_map)?;
            cache.unpin_entry(space_map)?;
        }
        cache.reclaim_space()?;
        if round % 2 == 1 {
            cache.flush(FlushFlags::default())?;
        }
        debug!(round, size = cache.size(), dirty = cache.dirty_size(), "Round complete");
    }

    cache.evict()?;
    for i in (1..entries).step_by(5) {
        if cache.contains(slot(i)) {
            continue;
        }
        let guard = cache.protect_scoped(&class, slot(i), &(), ProtectFlags::read_only())?;
        guard.payload::<Record>()?;
        drop(guard);
        report.reloads += 1;
    }

    // A scratch record that is moved, then discarded.
    let scratch = slot(entries);
    let moved = slot(entries + 1);
    cache.insert_entry(
        &class,
        scratch,
        Box::new(Record::new(vec![7; 24])),
        InsertFlags {
            pin: true,
            ..Default::default()
        },
    )?;
    cache.move_entry(scratch, moved)?;
    report.moves += 1;
    cache.unpin_entry(moved)?;
    cache.expunge_entry(&class, moved, true)?;
    report.expunges += 1;

    cache.flush(FlushFlags::default())?;
    info!(
        updates = report.updates,
        reloads = report.reloads,
        entries = cache.len(),
        "Workload complete"
    );
    Ok(report)
}
