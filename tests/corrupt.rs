mod common;

mod corrupt {
    use crate::common::{self, key};
    use pretty_assertions::assert_eq;

    /// Offset of a stored payload inside a bank image.
    fn locate(bank: &[u8], payload: &[u8]) -> usize {
        bank.windows(payload.len())
            .position(|w| w == payload)
            .expect("payload not on media")
    }

    #[test]
    fn damaged_payload_falls_back_to_the_previous_version() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("cfg"), b"version one").unwrap();
        kvs.store(&key("cfg"), b"version two!").unwrap();

        let (mut left, right) = kvs.into_banks();
        // single bit flip in the first byte of the latest payload
        let offset = locate(&left.data, b"version two!");
        left.data[offset] ^= 0x01;

        let (l, r, _) = common::pair_from(left.data, right.data);
        let kvs = common::open(l, r);
        let entry = kvs.find(&key("cfg")).unwrap();
        assert_eq!(kvs.map(&entry), b"version one");
    }

    #[test]
    fn damaged_payload_without_history_reads_as_absent() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("only"), b"single copy").unwrap();

        let (mut left, right) = kvs.into_banks();
        let offset = locate(&left.data, b"single copy");
        left.data[offset] ^= 0x80;

        let (l, r, _) = common::pair_from(left.data, right.data);
        let kvs = common::open(l, r);
        assert_eq!(kvs.find(&key("only")), None);
    }

    #[test]
    fn damaged_slot_header_skips_the_entry() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("obj"), b"old").unwrap();
        kvs.store(&key("obj"), b"new").unwrap();

        let (mut left, right) = kvs.into_banks();
        // slot 1 of the log: 12-byte bank header + 32 bytes per slot; flip
        // a bit of its stored len so the header CRC no longer matches
        left.data[12 + 32 + 20] ^= 0x01;

        let (l, r, _) = common::pair_from(left.data, right.data);
        let kvs = common::open(l, r);
        let entry = kvs.find(&key("obj")).unwrap();
        assert_eq!(kvs.map(&entry), b"old");
    }

    #[test]
    fn scan_keeps_entries_past_a_corrupt_slot() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("first"), b"aaaa").unwrap();
        kvs.store(&key("second"), b"bbbb").unwrap();
        kvs.store(&key("third"), b"cccc").unwrap();

        let (mut left, right) = kvs.into_banks();
        // wreck the stored header CRC of the last slot ("third")
        left.data[12 + 2 * 32 + 28] ^= 0x02;

        let (l, r, _) = common::pair_from(left.data, right.data);
        let mut kvs = common::open(l, r);

        // The corrupt slot is neither used nor free; its neighbours are fine
        let entry = kvs.find(&key("first")).unwrap();
        assert_eq!(kvs.map(&entry), b"aaaa");
        let entry = kvs.find(&key("second")).unwrap();
        assert_eq!(kvs.map(&entry), b"bbbb");
        assert_eq!(kvs.find(&key("third")), None);
        assert_eq!(kvs.free_log_entries(), common::LOG_SIZE - 3);

        // Free-data accounting only trusts the last valid entry, which ends
        // before the orphaned "cccc" payload. The blank check steps over
        // those bytes instead of programming on top of them.
        kvs.store(&key("fourth"), b"dddd").unwrap();
        let entry = kvs.find(&key("fourth")).unwrap();
        assert_eq!(kvs.map(&entry), b"dddd");
        let entry = kvs.find(&key("second")).unwrap();
        assert_eq!(kvs.map(&entry), b"bbbb");
    }

    #[test]
    fn compaction_leaves_damaged_versions_behind() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("cfg"), b"version one").unwrap();
        kvs.store(&key("cfg"), b"version two!").unwrap();

        let (mut left, right) = kvs.into_banks();
        let offset = locate(&left.data, b"version two!");
        left.data[offset] ^= 0x40;

        let (l, r, _) = common::pair_from(left.data, right.data);
        let mut kvs = common::open(l, r);
        kvs.compact().unwrap();

        // The older intact version is what survives the copy
        assert!(kvs.is_right_bank_active());
        let entry = kvs.find(&key("cfg")).unwrap();
        assert_eq!(kvs.map(&entry), b"version one");
    }

    #[test]
    fn stale_fault_flag_does_not_poison_lookups() {
        let (left, right, _) = common::bank_pair();
        let mut kvs = common::open(left, right);

        kvs.store(&key("obj"), b"payload").unwrap();

        // A fault reported between operations (e.g. from unrelated code
        // running out of the same flash) must not invalidate anything.
        kvs.on_ecc_fault(0x0800_1000, 0x2000_1234);
        let entry = kvs.find(&key("obj")).unwrap();
        assert_eq!(kvs.map(&entry), b"payload");

        kvs.on_ecc_fault(0x0800_1000, 0x2000_1234);
        kvs.store(&key("obj"), b"rewritten").unwrap();
        let entry = kvs.find(&key("obj")).unwrap();
        assert_eq!(kvs.map(&entry), b"rewritten");
    }
}
