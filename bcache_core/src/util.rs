//! Small shared machinery: EWMA, ring-buffer FIFO, crc64, 64-bit hashing,
//! and the slab-index linked list backing the node-cache LRU and freelists.

/// Exponentially weighted moving average with a power-of-two weight.
///
/// `ewma_add(avg, val, 3)` weights history 7/8, the new sample 1/8.
pub fn ewma_add(avg: u64, val: u64, weight_shift: u32) -> u64 {
    let avg = avg.wrapping_sub(avg >> weight_shift);
    avg.wrapping_add(val >> weight_shift)
}

/// Golden-ratio multiplicative hash over a 64-bit value.
pub fn hash_64(val: u64, bits: u32) -> u64 {
    const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;
    val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)
}

/// Monotonic microseconds since process start.
pub fn monotonic_us() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

const CRC64_POLY: u64 = 0xc96c_5795_d787_0f42; // ECMA-182, reflected

/// crc64 over a byte slice, table-free bitwise form.
///
/// Checksums here guard against torn or misdirected node writes, not
/// adversarial corruption, so the slower bitwise form is fine.
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = u64::MAX;
    for &b in data {
        crc ^= b as u64;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC64_POLY } else { crc >> 1 };
        }
    }
    !crc
}

/// Bounded ring buffer. Modeled on the fifos the allocator keeps its
/// free-bucket reserves in: fixed capacity, push fails when full.
#[derive(Debug)]
pub struct Fifo<T> {
    data: Vec<T>,
    capacity: usize,
    head: usize,
}

impl<T> Fifo<T> {
    pub fn new(capacity: usize) -> Fifo<T> {
        Fifo {
            data: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    /// Push to the tail; returns false (value dropped via Err) when full.
    pub fn push(&mut self, val: T) -> Result<(), T> {
        if self.is_full() {
            return Err(val);
        }
        // Reclaim popped space before the backing Vec grows past capacity.
        if self.data.len() == self.data.capacity() && self.head > 0 {
            self.data.drain(..self.head);
            self.head = 0;
        }
        self.data.push(val);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T>
    where
        T: Copy,
    {
        if self.is_empty() {
            return None;
        }
        let val = self.data[self.head];
        self.head += 1;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
        Some(val)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data[self.head..].iter()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }
}

pub const LRU_NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct LruLink {
    prev: usize,
    next: usize,
    on_list: bool,
}

/// O(1) doubly-linked list over stable slab slots.
///
/// Entries are identified by slot index; each slot can be on at most one
/// list at a time. This is the handle-plus-index rendition of an intrusive
/// list: the owner allocates slots, the list records prev/next per slot.
#[derive(Debug)]
pub struct LruList {
    links: Vec<LruLink>,
    head: usize,
    tail: usize,
    len: usize,
}

impl LruList {
    pub fn new() -> LruList {
        LruList {
            links: Vec::new(),
            head: LRU_NIL,
            tail: LRU_NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ensure_slot(&mut self, slot: usize) {
        while self.links.len() <= slot {
            self.links.push(LruLink {
                prev: LRU_NIL,
                next: LRU_NIL,
                on_list: false,
            });
        }
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < self.links.len() && self.links[slot].on_list
    }

    /// Push to the front (most recently used end).
    pub fn push_front(&mut self, slot: usize) {
        self.ensure_slot(slot);
        assert!(!self.links[slot].on_list);
        self.links[slot] = LruLink {
            prev: LRU_NIL,
            next: self.head,
            on_list: true,
        };
        if self.head != LRU_NIL {
            self.links[self.head].prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
        self.len += 1;
    }

    /// Push to the back (least recently used end).
    pub fn push_back(&mut self, slot: usize) {
        self.ensure_slot(slot);
        assert!(!self.links[slot].on_list);
        self.links[slot] = LruLink {
            prev: self.tail,
            next: LRU_NIL,
            on_list: true,
        };
        if self.tail != LRU_NIL {
            self.links[self.tail].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
    }

    pub fn remove(&mut self, slot: usize) {
        assert!(self.contains(slot));
        let link = self.links[slot];
        match link.prev {
            LRU_NIL => self.head = link.next,
            p => self.links[p].next = link.next,
        }
        match link.next {
            LRU_NIL => self.tail = link.prev,
            n => self.links[n].prev = link.prev,
        }
        self.links[slot].on_list = false;
        self.len -= 1;
    }

    pub fn front(&self) -> Option<usize> {
        if self.head != LRU_NIL { Some(self.head) } else { None }
    }

    pub fn back(&self) -> Option<usize> {
        if self.tail != LRU_NIL { Some(self.tail) } else { None }
    }

    pub fn pop_back(&mut self) -> Option<usize> {
        let slot = self.back()?;
        self.remove(slot);
        Some(slot)
    }

    /// Iterate back-to-front (LRU order) without removing.
    pub fn iter_lru(&self) -> LruIter<'_> {
        LruIter { list: self, cur: self.tail }
    }
}

pub struct LruIter<'a> {
    list: &'a LruList,
    cur: usize,
}

impl Iterator for LruIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == LRU_NIL {
            return None;
        }
        let slot = self.cur;
        self.cur = self.list.links[slot].prev;
        Some(slot)
    }
}

impl Default for LruList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges() {
        let mut avg = 0u64;
        for _ in 0..200 {
            avg = ewma_add(avg, 4096, 3);
        }
        assert!(avg > 3500 && avg <= 4096, "avg = {avg}");
    }

    #[test]
    fn fifo_push_pop_wraps() {
        let mut f: Fifo<u64> = Fifo::new(4);
        for round in 0..10u64 {
            for i in 0..4 {
                f.push(round * 4 + i).unwrap();
            }
            assert!(f.is_full());
            assert!(f.push(99).is_err());
            for i in 0..4 {
                assert_eq!(f.pop(), Some(round * 4 + i));
            }
            assert!(f.is_empty());
        }
    }

    #[test]
    fn fifo_interleaved_does_not_grow() {
        let mut f: Fifo<u64> = Fifo::new(3);
        for i in 0..1000u64 {
            f.push(i).unwrap();
            assert_eq!(f.pop(), Some(i));
        }
        assert!(f.data.capacity() <= 3);
    }

    #[test]
    fn lru_ordering() {
        let mut l = LruList::new();
        l.push_front(0);
        l.push_front(1);
        l.push_front(2);
        assert_eq!(l.pop_back(), Some(0));
        l.remove(1);
        assert_eq!(l.pop_back(), Some(2));
        assert!(l.is_empty());
    }

    #[test]
    fn lru_iter_is_lru_order() {
        let mut l = LruList::new();
        for slot in 0..5 {
            l.push_front(slot);
        }
        let order: Vec<_> = l.iter_lru().collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn crc64_distinguishes() {
        assert_ne!(crc64(b"foo"), crc64(b"bar"));
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn hash_64_spreads_sequential_keys() {
        let h: Vec<_> = (0..8u64).map(|v| hash_64(v, 7)).collect();
        let mut uniq = h.clone();
        uniq.sort_unstable();
        uniq.dedup();
        assert!(uniq.len() >= 6, "{h:?}");
    }
}
