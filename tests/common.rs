#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html

use std::cell::RefCell;
use std::rc::Rc;

use norkvs::platform::StorageBank;
use norkvs::{Key, Kvs};

pub const BANK_SIZE: usize = 32768;
pub const LOG_SIZE: u32 = 128;

pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;

/// One mutating flash operation, as recorded in the shared journal. Crash
/// tests replay a prefix of these over a snapshot to simulate power loss at
/// any point during a store or compaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Write {
        bank: usize,
        offset: u32,
        data: Vec<u8>,
    },
    Erase {
        bank: usize,
    },
}

impl Op {
    pub fn apply(&self, left: &mut [u8], right: &mut [u8]) {
        match self {
            Op::Erase { bank } => {
                let target = if *bank == LEFT { left } else { right };
                target.fill(0xFF);
            }
            Op::Write { bank, offset, data } => {
                let target = if *bank == LEFT { left } else { right };
                for (i, &b) in data.iter().enumerate() {
                    // programming only clears bits
                    target[*offset as usize + i] &= b;
                }
            }
        }
    }
}

/// State shared between the two banks of a pair: the operation journal and
/// the fault-injection counters.
#[derive(Default)]
pub struct Shared {
    pub journal: Vec<Op>,
    /// Mutating operations performed so far.
    pub ops: usize,
    /// All operations from this index on fail (media gone bad for good).
    pub fail_after: Option<usize>,
    /// Exactly this operation index fails (transient program failure).
    pub fail_once_at: Option<usize>,
}

/// A RAM bank with journalling and fault injection. `W` is the simulated
/// write block.
pub struct TestBank<const W: usize = 1> {
    pub id: usize,
    pub data: Vec<u8>,
    pub shared: Rc<RefCell<Shared>>,
}

impl<const W: usize> TestBank<W> {
    fn should_fail(shared: &mut Shared) -> bool {
        let n = shared.ops;
        shared.ops += 1;
        if shared.fail_after.is_some_and(|at| n >= at) {
            return true;
        }
        shared.fail_once_at.is_some_and(|at| n == at)
    }
}

impl<const W: usize> StorageBank for TestBank<W> {
    const WRITE_BLOCK: usize = W;

    fn erase(&mut self) -> bool {
        let mut shared = self.shared.borrow_mut();
        if Self::should_fail(&mut shared) {
            return false;
        }
        shared.journal.push(Op::Erase { bank: self.id });
        self.data.fill(0xFF);
        true
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> bool {
        assert!(
            (offset as usize).is_multiple_of(W),
            "unaligned write at {offset:#x}"
        );
        assert!(!data.is_empty());

        let mut shared = self.shared.borrow_mut();
        if Self::should_fail(&mut shared) {
            return false;
        }
        let offset = offset as usize;
        if offset + data.len() > self.data.len() {
            return false;
        }
        shared.journal.push(Op::Write {
            bank: self.id,
            offset: offset as u32,
            data: data.to_vec(),
        });
        for (i, &b) in data.iter().enumerate() {
            self.data[offset + i] &= b;
        }
        true
    }

    fn base(&self) -> &[u8] {
        &self.data
    }
}

/// A fresh all-ones pair sharing one journal.
pub fn bank_pair() -> (TestBank, TestBank, Rc<RefCell<Shared>>) {
    pair_from(vec![0xFF; BANK_SIZE], vec![0xFF; BANK_SIZE])
}

/// A pair over existing content (e.g. a snapshot), sharing one journal.
pub fn pair_from(left: Vec<u8>, right: Vec<u8>) -> (TestBank, TestBank, Rc<RefCell<Shared>>) {
    let shared = Rc::new(RefCell::new(Shared::default()));
    let l = TestBank {
        id: LEFT,
        data: left,
        shared: Rc::clone(&shared),
    };
    let r = TestBank {
        id: RIGHT,
        data: right,
        shared: Rc::clone(&shared),
    };
    (l, r, shared)
}

pub fn open(left: TestBank, right: TestBank) -> Kvs<TestBank> {
    Kvs::new(left, right, LOG_SIZE).unwrap()
}

pub fn key(name: &str) -> Key<16> {
    Key::from_str(name)
}

/// Rebuild a bank pair as it would look after power loss `upto` operations
/// into a journalled run over the given snapshots.
pub fn replay(
    left0: &[u8],
    right0: &[u8],
    journal: &[Op],
    upto: usize,
) -> (TestBank, TestBank, Rc<RefCell<Shared>>) {
    let mut left = left0.to_vec();
    let mut right = right0.to_vec();
    for op in &journal[..upto] {
        op.apply(&mut left, &mut right);
    }
    pair_from(left, right)
}
