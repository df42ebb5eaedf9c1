use crate::error::Error;
use crate::platform::StorageBank;
use crate::raw::{self, BankHeader, RawSlot};
use crate::{Bank, Entry, Key, Kvs, ListEntry};

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Program operations occasionally fail on some parts (e.g. STM32L4 errata
/// 2.2.10); every store is attempted this many times before giving up.
pub(crate) const STORE_RETRIES: usize = 5;

/// Ring of recently copied keys kept during compaction.
const COMPACT_CACHE_KEYS: usize = 16;

impl<B, const KLEN: usize> Kvs<B, KLEN>
where
    B: StorageBank,
{
    pub(crate) const fn slot_size() -> usize {
        raw::entry_size(KLEN, B::WRITE_BLOCK)
    }

    pub(crate) const fn log_offset() -> usize {
        raw::header_size(B::WRITE_BLOCK)
    }

    fn slot_offset(slot: u32) -> usize {
        Self::log_offset() + slot as usize * Self::slot_size()
    }

    pub(crate) fn active_bank(&self) -> &B {
        match self.active {
            Bank::Left => &self.left,
            Bank::Right => &self.right,
        }
    }

    fn active_bank_mut(&mut self) -> &mut B {
        match self.active {
            Bank::Left => &mut self.left,
            Bank::Right => &mut self.right,
        }
    }

    fn read_header(bank: &B) -> Option<BankHeader> {
        let base = bank.base();
        (base.len() >= raw::HEADER_BYTES).then(|| BankHeader::decode(&base[..raw::HEADER_BYTES]))
    }

    pub(crate) fn active_header(&self) -> BankHeader {
        Self::read_header(self.active_bank()).unwrap_or(BankHeader {
            magic: 0,
            version: 0,
            log_size: 0,
        })
    }

    /// Number of log slots that may actually be walked: the header's count,
    /// clamped to what physically fits so a damaged header cannot send
    /// reads past the end of the bank.
    pub(crate) fn log_slot_count(&self) -> u32 {
        let header = self.active_header();
        let avail = (self.active_bank().size() as usize).saturating_sub(Self::log_offset());
        header.log_size.min((avail / Self::slot_size()) as u32)
    }

    fn read_valid_header(&self, which: Bank) -> Option<BankHeader> {
        let bank = match which {
            Bank::Left => &self.left,
            Bank::Right => &self.right,
        };
        self.faults.clear();
        let header = Self::read_header(bank)?;
        let valid = header.is_valid();
        if self.faults.take() {
            #[cfg(feature = "defmt")]
            {
                let (addr, pc) = self.faults.last_fault();
                warn!(
                    "find_current_bank: uncorrectable ECC error at address {} (pc={})",
                    addr, pc
                );
            }
            return None;
        }
        valid.then_some(header)
    }

    /// Decide which bank serves reads and appends, formatting the left one
    /// if the part is blank.
    pub(crate) fn find_current_bank(&mut self) -> Result<(), Error> {
        let left = self.read_valid_header(Bank::Left);
        let right = self.read_valid_header(Bank::Right);

        self.active = match (left, right) {
            (None, None) => {
                Self::initialize_bank(&mut self.left, self.default_log_size)?;
                Bank::Left
            }
            (Some(_), None) => Bank::Left,
            (None, Some(_)) => Bank::Right,
            // Both formatted: the highest sane generation wins.
            (Some(lh), Some(rh)) => {
                if lh.version > rh.version && lh.version != raw::BLANK_WORD {
                    Bank::Left
                } else {
                    Bank::Right
                }
            }
        };
        Ok(())
    }

    fn initialize_bank(bank: &mut B, log_size: u32) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("initialize_bank: log_size {}", log_size);

        if !bank.erase() {
            return Err(Error::MediaWrite);
        }
        let header = BankHeader {
            magic: raw::HEADER_MAGIC,
            version: 0,
            log_size,
        };
        let mut buf = [0xFFu8; raw::MAX_HEADER_SIZE];
        buf[..raw::HEADER_BYTES].copy_from_slice(&header.encode());
        // One write call: the write block may be wider than any one field.
        if !bank.write(0, &buf[..Self::log_offset()]) {
            return Err(Error::MediaWrite);
        }
        Ok(())
    }

    /// Walk the whole log to find the first free slot and the first free
    /// data byte. The full walk (rather than stopping at the first oddity)
    /// is what lets corrupted slots be ignored without losing the entries
    /// after them.
    pub(crate) fn scan_current_bank(&mut self) {
        let header = self.active_header();
        let slots = self.log_slot_count();
        let bank = self.active_bank();
        let base = bank.base();
        let bank_size = bank.size();

        let mut first_free_slot = slots;
        let mut last_valid: Option<RawSlot<KLEN>> = None;

        for i in 0..slots {
            // Clean flag per pass so one bad read cannot poison neighbours.
            self.faults.clear();
            let off = Self::slot_offset(i);
            let slot = RawSlot::<KLEN>::decode(&base[off..off + KLEN + raw::TAIL_BYTES]);

            if slot.is_blank() {
                first_free_slot = i;
                break;
            }

            let mut ok = slot.header_crc == 0
                || bank.crc(&base[off..off + RawSlot::<KLEN>::CRC_SPAN]) == slot.header_crc;
            if slot.start as u64 + slot.len as u64 > bank_size as u64 {
                ok = false;
            }
            if self.faults.take() {
                #[cfg(feature = "defmt")]
                {
                    let (addr, pc) = self.faults.last_fault();
                    warn!(
                        "scan_current_bank: uncorrectable ECC error at address {} (pc={})",
                        addr, pc
                    );
                }
                continue;
            }
            if ok {
                last_valid = Some(slot);
            }
        }

        self.first_free_slot = first_free_slot;
        // Free data accounting only trusts the last valid entry; with an
        // empty log the data region starts right after the log array.
        self.first_free_data = match last_valid {
            Some(slot) => raw::round_up(slot.start + slot.len, B::WRITE_BLOCK),
            None => {
                let end = Self::log_offset() as u64
                    + header.log_size as u64 * Self::slot_size() as u64;
                raw::round_up(end.min(bank_size as u64) as u32, B::WRITE_BLOCK)
            }
        };

        #[cfg(feature = "debug-logs")]
        println!(
            "scan: first free slot {} of {}, first free data 0x{:04x}",
            self.first_free_slot, slots, self.first_free_data
        );
    }

    /// Latest valid version of `key`, if any.
    pub(crate) fn find_internal(&self, key: &Key<KLEN>) -> Option<Entry> {
        let slots = self.log_slot_count();
        let bank = self.active_bank();
        let base = bank.base();
        let bank_size = bank.size();

        let mut newest: Option<Entry> = None;

        for i in 0..slots {
            self.faults.clear();
            let off = Self::slot_offset(i);
            let slot = RawSlot::<KLEN>::decode(&base[off..off + KLEN + raw::TAIL_BYTES]);

            // A blank start means the slot was never written; the log is
            // strictly in order, so nothing past it exists either.
            if slot.start == raw::BLANK_WORD {
                break;
            }

            if slot.key != *key.as_bytes() {
                continue;
            }

            let mut ok = slot.header_crc == 0
                || bank.crc(&base[off..off + RawSlot::<KLEN>::CRC_SPAN]) == slot.header_crc;
            if ok {
                ok = slot.start as u64 + slot.len as u64 <= bank_size as u64
                    && bank.crc(&base[slot.start as usize..(slot.start + slot.len) as usize])
                        == slot.crc;
            }
            if self.faults.take() {
                #[cfg(feature = "defmt")]
                {
                    let (addr, pc) = self.faults.last_fault();
                    warn!(
                        "find: uncorrectable ECC error at address {} (pc={})",
                        addr, pc
                    );
                }
                continue;
            }

            // Valid and matching: newest so far. A damaged newer copy keeps
            // whatever older version was already found.
            if ok {
                newest = Some(Entry {
                    start: slot.start,
                    len: slot.len,
                });
            }
        }

        // A tombstone shadows every older version.
        newest.filter(|entry| entry.len != 0)
    }

    pub(crate) fn store_internal(&mut self, key: &Key<KLEN>, data: &[u8]) -> Result<(), Error> {
        debug_assert!(
            *key.as_bytes() != [0xFF; KLEN],
            "the all-ones key is the blank-slot sentinel and cannot name an object"
        );

        let mut last = Error::MediaWrite;
        for _ in 0..STORE_RETRIES {
            match self.store_attempt(key, data) {
                Ok(()) => return Ok(()),
                Err(err @ Error::OutOfSpace) => return Err(err),
                Err(err) => {
                    #[cfg(feature = "defmt")]
                    warn!("store: attempt failed, retrying");
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn store_attempt(&mut self, key: &Key<KLEN>, data: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(data.len()).map_err(|_| Error::OutOfSpace)?;

        // Make room first; one compaction attempt per resource.
        if self.free_data_space() < len {
            self.compact()?;
            if self.free_data_space() < len {
                return Err(Error::OutOfSpace);
            }
        }
        if self.free_log_entries() < 1 {
            self.compact()?;
            if self.free_log_entries() < 1 {
                return Err(Error::OutOfSpace);
            }
        }

        // Settle on a blank data region before reserving anything, so the
        // committed entry always points at the bytes that get programmed.
        if len > 0 {
            loop {
                let start = self.first_free_data as usize;
                let blank = self.active_bank().base()[start..start + data.len()]
                    .iter()
                    .all(|&b| b == 0xFF);
                if blank {
                    break;
                }
                // Leftovers of an interrupted write; step past them.
                self.first_free_data = raw::round_up(self.first_free_data + 1, B::WRITE_BLOCK);
                if self.free_data_space() < len {
                    self.compact()?;
                    if self.free_data_space() < len {
                        return Err(Error::OutOfSpace);
                    }
                }
            }
        }

        let start = self.first_free_data;
        let slot = self.first_free_slot;
        let slot_off = Self::slot_offset(slot);

        #[cfg(feature = "defmt")]
        trace!("store: slot {} at {}, {} bytes", slot, start, len);

        // Checksum the payload and a scratch copy of the slot.
        let data_crc = self.active_bank().crc(data);
        let mut scratch = [0u8; raw::MAX_KEY_BYTES + raw::TAIL_BYTES];
        scratch[..KLEN].copy_from_slice(key.as_bytes());
        scratch[KLEN..KLEN + 4].copy_from_slice(&start.to_le_bytes());
        scratch[KLEN + 4..KLEN + 8].copy_from_slice(&len.to_le_bytes());
        scratch[KLEN + 8..KLEN + 12].copy_from_slice(&data_crc.to_le_bytes());
        let header_crc = self
            .active_bank()
            .crc(&scratch[..RawSlot::<KLEN>::CRC_SPAN]);

        // Reserve the slot by writing its tail. The key stays blank, so a
        // crash from here on leaves a slot the scanner treats as unused.
        self.first_free_slot += 1;
        let tail_size = Self::slot_size() - KLEN;
        let mut tail = [0xFFu8; raw::MAX_ENTRY_SIZE];
        tail[0..4].copy_from_slice(&start.to_le_bytes());
        tail[4..8].copy_from_slice(&len.to_le_bytes());
        tail[8..12].copy_from_slice(&data_crc.to_le_bytes());
        tail[12..16].copy_from_slice(&header_crc.to_le_bytes());
        if !self
            .active_bank_mut()
            .write((slot_off + KLEN) as u32, &tail[..tail_size])
        {
            return Err(Error::MediaWrite);
        }

        // Program and verify the payload. Tombstones carry none.
        if len > 0 {
            self.first_free_data = raw::round_up(start + len, B::WRITE_BLOCK);
            let bank = self.active_bank_mut();
            if !bank.write(start, data) {
                return Err(Error::MediaWrite);
            }
            if &bank.base()[start as usize..start as usize + data.len()] != data {
                return Err(Error::MediaWrite);
            }
        }

        // Commit by writing the key, then verify it.
        let bank = self.active_bank_mut();
        if !bank.write(slot_off as u32, key.as_bytes()) {
            return Err(Error::MediaWrite);
        }
        if &bank.base()[slot_off..slot_off + KLEN] != key.as_bytes() {
            return Err(Error::MediaWrite);
        }
        Ok(())
    }

    /// Copy the latest valid version of every object into the inactive
    /// bank and flip activity. See [`Kvs::compact`].
    pub(crate) fn compact_banks(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("compact: leaving generation {}", self.active_header().version);

        let new_version = self.active_header().version.wrapping_add(1);
        let log_size = self.default_log_size;
        let used_slots = self.first_free_slot;
        let slot_size = Self::slot_size();
        let log_offset = Self::log_offset();

        let (src, dst) = match self.active {
            Bank::Left => (&self.left, &mut self.right),
            Bank::Right => (&self.right, &mut self.left),
        };
        let src_base = src.base();
        let src_size = src.size();

        // No header bytes are written until the copy completes: the erased
        // state keeps this bank unselectable if power is lost partway.
        if !dst.erase() {
            return Err(Error::MediaWrite);
        }

        // Ring of recently settled keys. Starts all-ones so slots that were
        // reserved but never keyed match immediately and are dropped.
        let mut cache = [[0xFFu8; KLEN]; COMPACT_CACHE_KEYS];
        let mut next_cache = 0usize;

        let mut next_slot: u32 = 0;
        let mut next_data: u32 = raw::round_up(
            (log_offset as u64 + log_size as u64 * slot_size as u64).min(src_size as u64) as u32,
            B::WRITE_BLOCK,
        );

        // Newest first: the first copy seen of each key wins.
        for i in (0..used_slots).rev() {
            self.faults.clear();
            let off = log_offset + i as usize * slot_size;
            let slot = RawSlot::<KLEN>::decode(&src_base[off..off + KLEN + raw::TAIL_BYTES]);
            let in_cache = cache.contains(&slot.key);
            if self.faults.take() {
                #[cfg(feature = "defmt")]
                {
                    let (addr, pc) = self.faults.last_fault();
                    warn!(
                        "compact: uncorrectable ECC error at address {} (pc={})",
                        addr, pc
                    );
                }
                continue;
            }
            if in_cache {
                continue;
            }

            // Cache miss: check what was already written to the output log.
            let mut already_copied = false;
            for j in 0..next_slot {
                self.faults.clear();
                let joff = log_offset + j as usize * slot_size;
                let matches = dst.base()[joff..joff + KLEN] == slot.key;
                if self.faults.take() {
                    continue;
                }
                if matches {
                    already_copied = true;
                    break;
                }
            }
            if already_copied {
                continue;
            }

            // Validate before copying; damaged versions stay behind.
            self.faults.clear();
            let mut ok = slot.header_crc == 0
                || src.crc(&src_base[off..off + RawSlot::<KLEN>::CRC_SPAN]) == slot.header_crc;
            if ok {
                ok = slot.start as u64 + slot.len as u64 <= src_size as u64
                    && src.crc(&src_base[slot.start as usize..(slot.start + slot.len) as usize])
                        == slot.crc;
            }
            if self.faults.take() {
                #[cfg(feature = "defmt")]
                {
                    let (addr, pc) = self.faults.last_fault();
                    warn!(
                        "compact: uncorrectable ECC error at address {} (pc={})",
                        addr, pc
                    );
                }
                continue;
            }
            if !ok {
                continue;
            }

            // Tombstones are dropped here; everything else moves over, the
            // payload ahead of its log entry.
            if slot.len != 0 {
                // Can only trip when the source log is larger than the one
                // we format, i.e. the banks were written with a different
                // configuration.
                if next_slot >= log_size {
                    return Err(Error::OutOfSpace);
                }
                let payload = &src_base[slot.start as usize..(slot.start + slot.len) as usize];
                if !dst.write(next_data, payload) {
                    return Err(Error::MediaWrite);
                }

                let mut out = [0xFFu8; raw::MAX_ENTRY_SIZE];
                out[..KLEN].copy_from_slice(&slot.key);
                out[KLEN..KLEN + 4].copy_from_slice(&next_data.to_le_bytes());
                out[KLEN + 4..KLEN + 8].copy_from_slice(&slot.len.to_le_bytes());
                out[KLEN + 8..KLEN + 12].copy_from_slice(&slot.crc.to_le_bytes());
                // start moved, so the header CRC has to be recomputed
                let header_crc = src.crc(&out[..RawSlot::<KLEN>::CRC_SPAN]);
                out[KLEN + 12..KLEN + 16].copy_from_slice(&header_crc.to_le_bytes());
                if !dst.write(
                    (log_offset + next_slot as usize * slot_size) as u32,
                    &out[..slot_size],
                ) {
                    return Err(Error::MediaWrite);
                }

                next_data = raw::round_up(next_data + slot.len, B::WRITE_BLOCK);
                next_slot += 1;
            }

            // Either way the key is settled now; remember it so older
            // revisions (and tombstoned ones) get skipped cheaply.
            cache[next_cache] = slot.key;
            next_cache = (next_cache + 1) % cache.len();
        }

        // The single header write is the commit point.
        let header = BankHeader {
            magic: raw::HEADER_MAGIC,
            version: new_version,
            log_size,
        };
        let mut buf = [0xFFu8; raw::MAX_HEADER_SIZE];
        buf[..raw::HEADER_BYTES].copy_from_slice(&header.encode());
        if !dst.write(0, &buf[..log_offset]) {
            return Err(Error::MediaWrite);
        }

        self.active = self.active.other();
        self.first_free_slot = next_slot;
        self.first_free_data = next_data;

        #[cfg(feature = "debug-logs")]
        println!(
            "compact: {} objects moved, generation {}, first free data 0x{:04x}",
            next_slot, new_version, next_data
        );

        Ok(())
    }

    /// Insertion-order walk grouping valid entries by key; see
    /// [`Kvs::enumerate`].
    pub(crate) fn enum_objects(&self, list: &mut [ListEntry<KLEN>]) -> usize {
        let slots = self.log_slot_count();
        let bank = self.active_bank();
        let base = bank.base();
        let bank_size = bank.size();

        let mut count = 0usize;
        for i in 0..slots {
            if count == list.len() {
                break;
            }
            self.faults.clear();
            let off = Self::slot_offset(i);
            let slot = RawSlot::<KLEN>::decode(&base[off..off + KLEN + raw::TAIL_BYTES]);

            if slot.start == raw::BLANK_WORD {
                break;
            }

            let mut ok = slot.header_crc == 0
                || bank.crc(&base[off..off + RawSlot::<KLEN>::CRC_SPAN]) == slot.header_crc;
            if ok {
                ok = slot.start as u64 + slot.len as u64 <= bank_size as u64
                    && bank.crc(&base[slot.start as usize..(slot.start + slot.len) as usize])
                        == slot.crc;
            }
            if self.faults.take() {
                #[cfg(feature = "defmt")]
                {
                    let (addr, pc) = self.faults.last_fault();
                    warn!(
                        "enumerate: uncorrectable ECC error at address {} (pc={})",
                        addr, pc
                    );
                }
                continue;
            }
            if !ok {
                continue;
            }

            match list[..count]
                .iter_mut()
                .find(|entry| *entry.key.as_bytes() == slot.key)
            {
                // Seen before: this copy is newer, so its size is current.
                Some(entry) => {
                    entry.size = slot.len;
                    entry.revs += 1;
                }
                None => {
                    list[count] = ListEntry {
                        key: Key::from_raw(slot.key),
                        size: slot.len,
                        revs: 1,
                    };
                    count += 1;
                }
            }
        }

        list[..count].sort_unstable_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));
        count
    }
}
