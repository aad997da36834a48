//! Write-ahead log, checkpoints, recovery and snapshot reconstruction.
//!
//! Every namespace mutation lands in the log before the inode-location table
//! is repointed, so the record stream plus the last checkpoint is always
//! enough to rebuild the table. Records are packed 63 to a block ("log
//! entry"); the record with sequence `s` lives in log block `log_start +
//! s / 63` at offset `s % 63`, which makes replay a straight scan.
//!
//! A checkpoint freezes the whole table into a chain of checkpoint blocks
//! allocated from the data region. Chains are never reclaimed; the
//! superblock's checkpoint directory keeps one `{id, first block}` pair per
//! checkpoint, and a snapshot mount is nothing more than reading a chain
//! into an in-memory table.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use log::{debug, info, trace};

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::bitmap::Bitmap;
use crate::fs::block::{BlockIndex, BlockStore, BLOCK_SIZE};
use crate::fs::inode::{InodeNumber, SlotIndex};
use crate::fs::itable::InodeLocTable;
use crate::fs::sb::{CheckpointId, Superblock};
use crate::time::Clock;
use crate::uint_display;

/// Magic constant opening every log record.
pub const LOG_RECORD_MAGIC: u64 = 0x4C4F_4752_4543_4F52;

/// Magic constant opening every log entry block.
pub const LOG_ENTRY_MAGIC: u64 = 0x4C4F_4745_4E54_5259;

/// Magic constant opening every checkpoint block.
pub const CHECKPOINT_MAGIC: u64 = 0x4348_4543_4B50_4E54;

/// Log records packed into one entry block.
pub const RECORDS_PER_ENTRY: usize = 63;

/// Table mappings packed into one checkpoint block.
pub const CHECKPOINT_ENTRIES_PER_BLOCK: usize = 507;

/// Global ordering of log records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct LogSequence(pub(crate) u64);

uint_display!(LogSequence);

impl From<LogSequence> for u64 {
    fn from(value: LogSequence) -> Self {
        value.0
    }
}

/// Operation tag of a log record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct LogOpKind(u16);

impl LogOpKind {
    /// A fresh inode number was bound to its first slot.
    pub const INODE_ADD: Self = Self(1);

    /// An inode number was repointed at a new copy-on-write slot.
    pub const INODE_UPDATE: Self = Self(2);

    /// An inode number was unbound.
    pub const INODE_DELETE: Self = Self(3);

    /// A checkpoint chain was persisted; the payload holds its first block.
    pub const CHECKPOINT: Self = Self(4);
}

/// Fixed 40-byte record payload; which fields carry meaning depends on the
/// op kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LogPayload {
    pub inode_num: InodeNumber,
    pub slot: SlotIndex,
    pub block: BlockIndex,
    _reserved: [u8; 28],
}

impl LogPayload {
    /// Payload for `INODE_ADD` / `INODE_UPDATE`.
    pub fn inode_at(inode_num: InodeNumber, slot: SlotIndex) -> Self {
        Self {
            inode_num,
            slot,
            block: BlockIndex::NULL,
            _reserved: [0; 28],
        }
    }

    /// Payload for `INODE_DELETE`.
    pub fn inode_only(inode_num: InodeNumber) -> Self {
        Self {
            inode_num,
            slot: SlotIndex::NULL,
            block: BlockIndex::NULL,
            _reserved: [0; 28],
        }
    }

    /// Payload for `CHECKPOINT`.
    pub fn checkpoint(first_block: BlockIndex) -> Self {
        Self {
            inode_num: InodeNumber::NULL,
            slot: SlotIndex::NULL,
            block: first_block,
            _reserved: [0; 28],
        }
    }
}

/// One 64-byte log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LogRecord {
    pub magic: u64,
    pub sequence: LogSequence,
    pub op: LogOpKind,
    _pad: [u8; 6],
    pub payload: LogPayload,
}

const _: () = assert!(core::mem::size_of::<LogRecord>() == 64);

/// One log entry: a block of up to 63 records behind a 16-byte header.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct LogEntry {
    pub magic: u64,
    pub record_count: u16,
    _pad: [u8; 6],
    pub records: [LogRecord; RECORDS_PER_ENTRY],
}

const _: () = assert!(core::mem::size_of::<LogEntry>() <= BLOCK_SIZE);

impl LogEntry {
    fn empty() -> Self {
        let mut entry: LogEntry = Zeroable::zeroed();
        entry.magic = LOG_ENTRY_MAGIC;
        entry
    }

    fn read_from(store: &BlockStore, block: BlockIndex) -> FsResult<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(block, &mut buf)?;

        let entry: LogEntry =
            bytemuck::pod_read_unaligned(&buf[..core::mem::size_of::<LogEntry>()]);
        if entry.magic != LOG_ENTRY_MAGIC {
            return Err(FsError::CorruptLog);
        }

        Ok(entry)
    }

    fn write_to(&self, store: &BlockStore, block: BlockIndex) -> CanFail<FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[..core::mem::size_of::<LogEntry>()].copy_from_slice(bytemuck::bytes_of(self));

        store.write_block(block, &buf)
    }
}

/// One `{inode number, slot}` mapping inside a checkpoint block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CheckpointEntry {
    pub inode_num: InodeNumber,
    pub slot: SlotIndex,
}

/// One block of a checkpoint chain. The first block of a chain is the
/// header; `sequence` is only meaningful there.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct CheckpointBlock {
    pub magic: u64,
    pub checkpoint_id: CheckpointId,
    pub is_header: u8,
    _pad0: [u8; 3],
    pub sequence: LogSequence,
    pub timestamp: u64,
    pub entry_count: u16,
    _pad1: [u8; 2],
    pub next: BlockIndex,
    pub entries: [CheckpointEntry; CHECKPOINT_ENTRIES_PER_BLOCK],
}

const _: () = assert!(core::mem::size_of::<CheckpointBlock>() == BLOCK_SIZE);

impl CheckpointBlock {
    fn header(id: CheckpointId, sequence: LogSequence, timestamp: u64) -> Self {
        let mut block: CheckpointBlock = Zeroable::zeroed();
        block.magic = CHECKPOINT_MAGIC;
        block.checkpoint_id = id;
        block.is_header = 1;
        block.sequence = sequence;
        block.timestamp = timestamp;
        block.next = BlockIndex::NULL;
        block
    }

    fn continuation(id: CheckpointId) -> Self {
        let mut block: CheckpointBlock = Zeroable::zeroed();
        block.magic = CHECKPOINT_MAGIC;
        block.checkpoint_id = id;
        block.next = BlockIndex::NULL;
        block
    }

    fn read_from(store: &BlockStore, block: BlockIndex) -> FsResult<Self> {
        let mut buf = [0u8; BLOCK_SIZE];
        store.read_block(block, &mut buf)?;

        let cp: CheckpointBlock = bytemuck::pod_read_unaligned(&buf);
        if cp.magic != CHECKPOINT_MAGIC {
            return Err(FsError::Invalid);
        }

        Ok(cp)
    }

    fn write_to(&self, store: &BlockStore, block: BlockIndex) -> CanFail<FsError> {
        let mut buf = [0u8; BLOCK_SIZE];
        buf.copy_from_slice(bytemuck::bytes_of(self));

        store.write_block(block, &buf)
    }
}

/// Public descriptor of one checkpoint, as reported by
/// [`crate::fs::FileSystem::checkpoints`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub id: CheckpointId,
    pub first_block: BlockIndex,
    pub sequence: LogSequence,
    pub timestamp: u64,
}

/// The write-ahead log over its dedicated block range.
///
/// The journal itself is not locked; it lives inside the file system's
/// mutation-locked state, and that lock doubles as the log lock.
pub struct Journal {
    store: Arc<BlockStore>,
    clock: Arc<dyn Clock>,
    log_start: BlockIndex,
    log_blocks: u32,
    next_seq: u64,
    current: LogEntry,
    checkpoint_dir: HashMap<u32, BlockIndex>,
}

impl Journal {
    /// Journal over a freshly formatted log area: sequence numbering starts
    /// at zero.
    pub fn fresh(store: Arc<BlockStore>, clock: Arc<dyn Clock>, sb: &Superblock) -> Self {
        Self {
            store,
            clock,
            log_start: sb.log_start,
            log_blocks: sb.log_blocks,
            next_seq: 0,
            current: LogEntry::empty(),
            checkpoint_dir: HashMap::new(),
        }
    }

    /// Journal over an existing file system: resumes after
    /// `sb.latest_log_seq`, reloading the partially filled tail entry.
    pub fn open(store: Arc<BlockStore>, clock: Arc<dyn Clock>, sb: &Superblock) -> FsResult<Self> {
        let next_seq = sb.latest_log_seq.0 + 1;
        let slot = next_seq % RECORDS_PER_ENTRY as u64;

        let current = if slot == 0 {
            LogEntry::empty()
        } else {
            let block = sb.log_start + (next_seq / RECORDS_PER_ENTRY as u64) as u32;
            LogEntry::read_from(&store, block)?
        };

        let checkpoint_dir = sb
            .directory()
            .iter()
            .map(|entry| (entry.id.0, entry.first_block))
            .collect();

        Ok(Self {
            store,
            clock,
            log_start: sb.log_start,
            log_blocks: sb.log_blocks,
            next_seq,
            current,
            checkpoint_dir,
        })
    }

    fn entry_block(&self, seq: u64) -> FsResult<BlockIndex> {
        let entry_index = seq / RECORDS_PER_ENTRY as u64;
        if entry_index >= u64::from(self.log_blocks) {
            return Err(FsError::Full);
        }

        Ok(self.log_start + entry_index as u32)
    }

    /// Appends one record and makes it durable.
    ///
    /// The entry block is written first, then the superblock's
    /// `latest_log_seq`; the record only counts as committed once both are
    /// down. This per-append superblock write is what lets recovery replay
    /// exactly `[checkpoint sequence, latest_log_seq]`.
    pub fn append(
        &mut self,
        sb: &mut Superblock,
        op: LogOpKind,
        payload: LogPayload,
    ) -> FsResult<LogSequence> {
        let seq = self.next_seq;
        let block = self.entry_block(seq)?;
        let slot = (seq % RECORDS_PER_ENTRY as u64) as usize;

        if slot == 0 {
            self.current = LogEntry::empty();
        }
        self.current.records[slot] = LogRecord {
            magic: LOG_RECORD_MAGIC,
            sequence: LogSequence(seq),
            op,
            _pad: [0; 6],
            payload,
        };
        self.current.record_count = slot as u16 + 1;

        self.current.write_to(&self.store, block)?;
        sb.latest_log_seq = LogSequence(seq);
        sb.write_to(&self.store)?;

        self.next_seq += 1;
        trace!(
            target: "glacierfs::journal",
            "appended record seq={seq} op={op:?} at block {block}"
        );

        Ok(LogSequence(seq))
    }

    /// Freezes `table` into a new checkpoint chain and publishes it.
    ///
    /// Chain blocks come from the data bitmap, so they share the
    /// never-reclaimed lifetime of COW data. Publication order: chain
    /// blocks, `CHECKPOINT` log record, then the superblock directory.
    pub fn create_checkpoint(
        &mut self,
        sb: &mut Superblock,
        table: &InodeLocTable,
        data_bitmap: &Bitmap,
    ) -> FsResult<CheckpointId> {
        if sb.checkpoint_count as usize >= crate::fs::sb::CHECKPOINT_DIR_CAPACITY {
            return Err(FsError::Full);
        }

        let id = sb.next_checkpoint_id();
        let data_region_start = sb.data_region_start;
        let mut alloc = || -> FsResult<BlockIndex> {
            Ok(data_region_start + data_bitmap.allocate()?)
        };

        let first = alloc()?;
        let mut block = CheckpointBlock::header(id, LogSequence(self.next_seq), self.clock.now());
        let mut block_index = first;
        let mut chain_len = 1u32;

        table.for_each_mapping(|inode_num, slot| {
            if block.entry_count as usize == CHECKPOINT_ENTRIES_PER_BLOCK {
                let next = alloc()?;
                block.next = next;
                block.write_to(&self.store, block_index)?;

                block = CheckpointBlock::continuation(id);
                block_index = next;
                chain_len += 1;
            }

            block.entries[block.entry_count as usize] = CheckpointEntry { inode_num, slot };
            block.entry_count += 1;

            Ok(())
        })?;
        block.write_to(&self.store, block_index)?;

        self.append(sb, LogOpKind::CHECKPOINT, LogPayload::checkpoint(first))?;
        sb.push_checkpoint(id, first)?;
        sb.write_to(&self.store)?;
        self.checkpoint_dir.insert(id.0, first);

        info!(
            target: "glacierfs::journal",
            "checkpoint {id} written: {chain_len} block(s) starting at {first}, sequence {}",
            sb.latest_log_seq
        );

        Ok(id)
    }

    /// Walks one checkpoint chain, feeding every mapping to `f`.
    ///
    /// Returns the header's `(sequence, timestamp)`. Any structural problem
    /// (bad magic, id mismatch, misplaced header flag, cycle) is `Invalid`.
    fn walk_chain(
        &self,
        expected_id: CheckpointId,
        first: BlockIndex,
        mut f: impl FnMut(InodeNumber, SlotIndex) -> CanFail<FsError>,
    ) -> FsResult<(LogSequence, u64)> {
        let mut block_index = first;
        let mut visited = 0u32;
        let mut header = None;

        loop {
            let cp = CheckpointBlock::read_from(&self.store, block_index)?;
            if cp.checkpoint_id != expected_id {
                return Err(FsError::Invalid);
            }
            match header {
                None => {
                    if cp.is_header == 0 {
                        return Err(FsError::Invalid);
                    }
                    header = Some((cp.sequence, cp.timestamp));
                }
                Some(_) if cp.is_header != 0 => return Err(FsError::Invalid),
                Some(_) => {}
            }
            if cp.entry_count as usize > CHECKPOINT_ENTRIES_PER_BLOCK {
                return Err(FsError::Invalid);
            }

            for entry in &cp.entries[..cp.entry_count as usize] {
                f(entry.inode_num, entry.slot)?;
            }

            if cp.next.is_null() {
                break;
            }
            block_index = cp.next;

            visited += 1;
            if visited > self.store.block_count() {
                return Err(FsError::Invalid);
            }
        }

        header.ok_or(FsError::Invalid)
    }

    /// Rebuilds the live table: installs the latest checkpoint, then
    /// replays every record committed after it.
    pub fn recover(&self, sb: &Superblock, table: &mut InodeLocTable) -> CanFail<FsError> {
        let latest = sb.latest_checkpoint().ok_or(FsError::Invalid)?;
        let (start_seq, _) =
            self.walk_chain(latest.id, latest.first_block, |num, slot| table.set(num, slot))?;

        let replayed = self.replay(start_seq, sb.latest_log_seq, table)?;
        info!(
            target: "glacierfs::journal",
            "recovered from checkpoint {}: replayed {replayed} record(s) up to sequence {}",
            latest.id, sb.latest_log_seq
        );

        Ok(())
    }

    /// Applies records `[from, to]` to `table`. Replay is idempotent: every
    /// record states the final mapping of its inode number.
    fn replay(
        &self,
        from: LogSequence,
        to: LogSequence,
        table: &mut InodeLocTable,
    ) -> FsResult<u64> {
        let mut cached_block = BlockIndex::NULL;
        let mut cached = LogEntry::empty();
        let mut replayed = 0u64;

        for seq in from.0..=to.0 {
            let block = self.entry_block(seq)?;
            if block != cached_block {
                cached = LogEntry::read_from(&self.store, block)?;
                cached_block = block;
            }

            let record = cached.records[(seq % RECORDS_PER_ENTRY as u64) as usize];
            if record.magic != LOG_RECORD_MAGIC || record.sequence.0 != seq {
                return Err(FsError::CorruptLog);
            }

            match record.op {
                LogOpKind::INODE_ADD | LogOpKind::INODE_UPDATE => {
                    table.set(record.payload.inode_num, record.payload.slot)?;
                }
                LogOpKind::INODE_DELETE => table.clear(record.payload.inode_num)?,
                LogOpKind::CHECKPOINT => {}
                _ => return Err(FsError::CorruptLog),
            }
            replayed += 1;
        }

        Ok(replayed)
    }

    /// Builds an in-memory snapshot table from checkpoint `id`.
    pub fn build_snapshot_table(
        &self,
        sb: &Superblock,
        id: CheckpointId,
    ) -> FsResult<InodeLocTable> {
        let first = self
            .checkpoint_dir
            .get(&id.0)
            .copied()
            .ok_or(FsError::NotFound)?;

        let mut slots = vec![SlotIndex::NULL; sb.inode_count as usize];
        self.walk_chain(id, first, |num, slot| {
            let index = num.0 as usize;
            if index >= slots.len() {
                return Err(FsError::Invalid);
            }
            slots[index] = slot;
            Ok(())
        })?;

        debug!(
            target: "glacierfs::journal",
            "snapshot table built from checkpoint {id} ({} mapped inodes)",
            slots.iter().filter(|s| !s.is_null()).count()
        );

        Ok(InodeLocTable::snapshot(slots))
    }

    /// Reads the directory and each chain header into checkpoint
    /// descriptors.
    pub fn checkpoints(&self, sb: &Superblock) -> FsResult<Vec<CheckpointInfo>> {
        let mut infos = Vec::with_capacity(sb.directory().len());

        for entry in sb.directory() {
            let header = CheckpointBlock::read_from(&self.store, entry.first_block)?;
            if header.is_header == 0 || header.checkpoint_id != entry.id {
                return Err(FsError::Invalid);
            }

            infos.push(CheckpointInfo {
                id: entry.id,
                first_block: entry.first_block,
                sequence: header.sequence,
                timestamp: header.timestamp,
            });
        }

        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemDisk, Partition};
    use crate::time::Clock;

    struct TickClock;

    impl Clock for TickClock {
        fn now(&self) -> u64 {
            7
        }
    }

    struct Rig {
        store: Arc<BlockStore>,
        sb: Superblock,
        table: InodeLocTable,
        data_bitmap: Bitmap,
        journal: Journal,
    }

    fn rig() -> Rig {
        let disk = Arc::new(MemDisk::new(1024 * 8));
        let partition = Partition::new(disk.as_ref(), 0, 1024 * 8).unwrap();
        let store = Arc::new(BlockStore::new(disk, partition).unwrap());

        let sb = Superblock::format_layout(1024, 64).unwrap();
        InodeLocTable::initialize(&store, sb.table_start, sb.table_blocks).unwrap();
        let table = InodeLocTable::live(store.clone(), sb.table_start, sb.inode_count);

        let data_bitmap = Bitmap::new(
            store.clone(),
            sb.data_bitmap_start,
            sb.data_bitmap_blocks,
            sb.data_blocks,
        );
        data_bitmap.initialize().unwrap();

        let journal = Journal::fresh(store.clone(), Arc::new(TickClock), &sb);

        Rig {
            store,
            sb,
            table,
            data_bitmap,
            journal,
        }
    }

    #[test]
    fn on_disk_sizes_are_exact() {
        assert_eq!(core::mem::size_of::<LogRecord>(), 64);
        assert_eq!(core::mem::size_of::<LogEntry>(), 16 + 63 * 64);
        assert_eq!(core::mem::size_of::<CheckpointBlock>(), BLOCK_SIZE);
    }

    #[test]
    fn record_roundtrip_through_entry_block() {
        let mut r = rig();

        let seq = r
            .journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_ADD,
                LogPayload::inode_at(InodeNumber(3), SlotIndex(12)),
            )
            .unwrap();
        assert_eq!(seq, LogSequence(0));
        assert_eq!(r.sb.latest_log_seq, LogSequence(0));

        let entry = LogEntry::read_from(&r.store, r.sb.log_start).unwrap();
        assert_eq!(entry.record_count, 1);
        assert_eq!(entry.records[0].op, LogOpKind::INODE_ADD);
        assert_eq!(entry.records[0].payload.inode_num, InodeNumber(3));
        assert_eq!(entry.records[0].payload.slot, SlotIndex(12));
    }

    #[test]
    fn appends_roll_over_to_the_next_entry_block() {
        let mut r = rig();

        for i in 0..(RECORDS_PER_ENTRY as u32 + 5) {
            r.journal
                .append(
                    &mut r.sb,
                    LogOpKind::INODE_UPDATE,
                    LogPayload::inode_at(InodeNumber(i), SlotIndex(i)),
                )
                .unwrap();
        }

        let first = LogEntry::read_from(&r.store, r.sb.log_start).unwrap();
        assert_eq!(first.record_count, RECORDS_PER_ENTRY as u16);
        let second = LogEntry::read_from(&r.store, r.sb.log_start + 1).unwrap();
        assert_eq!(second.record_count, 5);
        assert_eq!(
            second.records[0].sequence,
            LogSequence(RECORDS_PER_ENTRY as u64)
        );
    }

    #[test]
    fn exhausted_log_area_reports_full() {
        let mut r = rig();
        r.journal.log_blocks = 1;

        for i in 0..RECORDS_PER_ENTRY as u32 {
            r.journal
                .append(
                    &mut r.sb,
                    LogOpKind::INODE_UPDATE,
                    LogPayload::inode_at(InodeNumber(i), SlotIndex(i)),
                )
                .unwrap();
        }
        assert_eq!(
            r.journal.append(
                &mut r.sb,
                LogOpKind::INODE_UPDATE,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(0)),
            ),
            Err(FsError::Full)
        );
    }

    #[test]
    fn recovery_replays_the_suffix_idempotently() {
        let mut r = rig();

        // Base state captured by the checkpoint.
        r.table.set(InodeNumber(0), SlotIndex(0)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_ADD,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(0)),
            )
            .unwrap();
        r.journal
            .create_checkpoint(&mut r.sb, &r.table, &r.data_bitmap)
            .unwrap();

        // Post-checkpoint mutations, logged but applied only to the live
        // table.
        r.table.set(InodeNumber(1), SlotIndex(5)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_ADD,
                LogPayload::inode_at(InodeNumber(1), SlotIndex(5)),
            )
            .unwrap();
        r.table.set(InodeNumber(0), SlotIndex(9)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_UPDATE,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(9)),
            )
            .unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_DELETE,
                LogPayload::inode_only(InodeNumber(1)),
            )
            .unwrap();

        let expect = |table: &InodeLocTable| {
            assert_eq!(table.get(InodeNumber(0)).unwrap(), Some(SlotIndex(9)));
            assert_eq!(table.get(InodeNumber(1)).unwrap(), None);
        };

        // Rebuild a fresh table from disk twice over: same result.
        let journal = Journal::open(r.store.clone(), Arc::new(TickClock), &r.sb).unwrap();
        for _ in 0..2 {
            let mut rebuilt =
                InodeLocTable::snapshot(vec![SlotIndex::NULL; r.sb.inode_count as usize]);
            journal.recover(&r.sb, &mut rebuilt).unwrap();
            expect(&rebuilt);
        }
        expect(&r.table);
    }

    #[test]
    fn snapshot_table_ignores_later_records() {
        let mut r = rig();

        r.table.set(InodeNumber(0), SlotIndex(2)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_ADD,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(2)),
            )
            .unwrap();
        let id = r
            .journal
            .create_checkpoint(&mut r.sb, &r.table, &r.data_bitmap)
            .unwrap();

        r.table.set(InodeNumber(0), SlotIndex(7)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_UPDATE,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(7)),
            )
            .unwrap();

        let snap = r.journal.build_snapshot_table(&r.sb, id).unwrap();
        assert_eq!(snap.get(InodeNumber(0)).unwrap(), Some(SlotIndex(2)));

        assert_eq!(
            r.journal
                .build_snapshot_table(&r.sb, CheckpointId(77))
                .unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn long_checkpoint_spans_multiple_chain_blocks() {
        let mut r = rig();

        // 255 inodes fit in one chain block; force a long chain with an
        // oversized in-memory table instead.
        let mut slots = vec![SlotIndex::NULL; 2 * CHECKPOINT_ENTRIES_PER_BLOCK + 10];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = SlotIndex(i as u32);
        }
        let big_table = InodeLocTable::snapshot(slots);

        let id = r
            .journal
            .create_checkpoint(&mut r.sb, &big_table, &r.data_bitmap)
            .unwrap();

        let mut count = 0u32;
        let (seq, ts) = r
            .journal
            .walk_chain(id, r.sb.find_checkpoint(id).unwrap(), |num, slot| {
                assert_eq!(num.0, slot.0);
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count as usize, 2 * CHECKPOINT_ENTRIES_PER_BLOCK + 10);
        assert_eq!(seq, LogSequence(0));
        assert_eq!(ts, 7);
    }

    #[test]
    fn checkpoint_listing_reads_headers() {
        let mut r = rig();

        r.table.set(InodeNumber(0), SlotIndex(0)).unwrap();
        r.journal
            .append(
                &mut r.sb,
                LogOpKind::INODE_ADD,
                LogPayload::inode_at(InodeNumber(0), SlotIndex(0)),
            )
            .unwrap();
        let a = r
            .journal
            .create_checkpoint(&mut r.sb, &r.table, &r.data_bitmap)
            .unwrap();
        let b = r
            .journal
            .create_checkpoint(&mut r.sb, &r.table, &r.data_bitmap)
            .unwrap();

        let infos = r.journal.checkpoints(&r.sb).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, a);
        assert_eq!(infos[1].id, b);
        assert_eq!(infos[0].timestamp, 7);
        assert!(infos[0].sequence < infos[1].sequence);
    }
}
