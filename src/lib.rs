//! # brim
//!
//! An open-addressing hash map that can be filled to 100% load factor,
//! combining Robin Hood displacement with 2-choice hashing over fixed
//! 32-slot probe windows.
//!
//! Every lookup inspects at most two SIMD-scanned windows, so reads are
//! worst-case O(1) even with every slot occupied. At full load the map
//! doubles as a minimal perfect hash function: [`BrimMap::get_index`]
//! maps the live key set bijectively onto the slot range.
//!
//! ## Example
//!
//! ```rust
//! use brim::BrimMap;
//!
//! let mut map: BrimMap<u64, u64> = BrimMap::new();
//! map.put(1, 10).unwrap();
//! map.put(2, 20).unwrap();
//!
//! assert_eq!(map.get(&1), Some(&10));
//! assert_eq!(map.len(), 2);
//!
//! // Filled to capacity, slot indices form a minimal perfect hash.
//! let mut dense: BrimMap<u64, ()> = BrimMap::with_capacity(64).unwrap();
//! for i in 0..64u64 {
//!     dense.put(i, ()).unwrap();
//! }
//! assert!(dense.get_index(&7).unwrap() < dense.capacity());
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::mem::{self, MaybeUninit};

use foldhash::fast::FixedState;

// =============================================================================
// Configuration
// =============================================================================

/// Probe window width in slots. Also the minimum table size: a window must
/// never wrap onto itself.
const WINDOW: usize = 32;

/// Metadata byte of a slot that has never held an entry (or was erased).
const EMPTY: u8 = 0x00;

/// Metadata byte of a slot whose entry was removed but which probes may
/// still be routed past.
const TOMBSTONE: u8 = 0x80;

/// Hash-function tag of the primary hash (bits 7..6 = 01).
const HF_PRIMARY: u8 = 0x40;

/// Hash-function tag of the secondary hash (bits 7..6 = 11).
///
/// The encoding makes unsigned byte order coincide with effective-distance
/// order: any secondary placement outranks any tombstone, and any tombstone
/// outranks any primary placement.
const HF_SECONDARY: u8 = 0xC0;

const HF_MASK: u8 = 0xC0;
const DIST_MASK: u8 = 0x1F;

/// Highest metadata byte a primary placement can carry (`h=1`, `d=31`).
const PRIMARY_MAX: u8 = HF_PRIMARY | (WINDOW as u8 - 1);

const MIN_SIZE: usize = WINDOW;

/// Tombstone density that makes an in-place rehash cheaper than growing.
const REHASH_TOMBSTONE_DIVISOR: usize = 4;

/// Default fill threshold. Growing only when placement fails is the whole
/// point of this map; lower thresholds trade memory for shorter chains.
pub const DEFAULT_GROW_AT_PERCENT: u8 = 100;

/// Expected metadata per lane if the probed key were stored at that offset.
const fn expected_row(hf: u8) -> [u8; WINDOW] {
    let mut row = [0u8; WINDOW];
    let mut i = 0;
    while i < WINDOW {
        row[i] = hf | i as u8;
        i += 1;
    }
    row
}

const EXPECTED_PRIMARY: [u8; WINDOW] = expected_row(HF_PRIMARY);
const EXPECTED_SECONDARY: [u8; WINDOW] = expected_row(HF_SECONDARY);

/// Removal scans against this row: a window whose every byte is strictly
/// below `PRIMARY_MAX` cannot contain evidence of a secondary placement.
const REMOVAL_LIMIT: [u8; WINDOW] = [PRIMARY_MAX; WINDOW];

// =============================================================================
// Metadata codec
// =============================================================================

#[inline]
fn is_occupied(meta: u8) -> bool {
    meta != EMPTY && meta != TOMBSTONE
}

#[inline]
fn meta_hf(meta: u8) -> u8 {
    meta & HF_MASK
}

#[inline]
fn meta_dist(meta: u8) -> usize {
    (meta & DIST_MASK) as usize
}

// =============================================================================
// Hash reduction and probe sequence
// =============================================================================

/// Multiplicative reduction of a full 64-bit hash onto `[0, size)`.
///
/// Works for arbitrary (non power-of-two) sizes and uses the high hash bits,
/// leaving the low byte independent enough to serve as the fingerprint.
#[inline]
fn reduce(hash: u64, size: usize) -> usize {
    (((hash as u128) * (size as u128)) >> 64) as usize
}

/// Hash input of the secondary probe window.
#[inline]
fn secondary(hash: u64) -> u64 {
    hash.rotate_left(32)
}

#[inline]
fn fingerprint(hash: u64) -> u8 {
    hash as u8
}

// =============================================================================
// SIMD window scanner
// =============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use core::arch::x86_64::*;

    #[target_feature(enable = "avx2")]
    pub unsafe fn eq_row(window: *const u8, row: *const u8) -> u32 {
        // SAFETY: caller guarantees 32 readable bytes behind both pointers.
        unsafe {
            let w = _mm256_loadu_si256(window.cast());
            let r = _mm256_loadu_si256(row.cast());
            _mm256_movemask_epi8(_mm256_cmpeq_epi8(w, r)) as u32
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn eq_byte(window: *const u8, byte: u8) -> u32 {
        // SAFETY: caller guarantees 32 readable bytes behind `window`.
        unsafe {
            let w = _mm256_loadu_si256(window.cast());
            let b = _mm256_set1_epi8(byte as i8);
            _mm256_movemask_epi8(_mm256_cmpeq_epi8(w, b)) as u32
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn lt_row(window: *const u8, row: *const u8) -> u32 {
        // AVX2 has no unsigned byte compare; flipping the sign bit of both
        // sides turns signed greater-than into unsigned.
        // SAFETY: caller guarantees 32 readable bytes behind both pointers.
        unsafe {
            let bias = _mm256_set1_epi8(i8::MIN);
            let w = _mm256_xor_si256(_mm256_loadu_si256(window.cast()), bias);
            let r = _mm256_xor_si256(_mm256_loadu_si256(row.cast()), bias);
            _mm256_movemask_epi8(_mm256_cmpgt_epi8(r, w)) as u32
        }
    }
}

/// Lanes where `window[i] == row[i]`.
#[inline]
fn window_eq_row(window: &[u8], row: &[u8; WINDOW]) -> u32 {
    debug_assert!(window.len() >= WINDOW);
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 detected at runtime; both inputs hold >= 32 bytes.
            return unsafe { avx2::eq_row(window.as_ptr(), row.as_ptr()) };
        }
    }
    let mut mask = 0u32;
    for i in 0..WINDOW {
        mask |= u32::from(window[i] == row[i]) << i;
    }
    mask
}

/// Lanes where `window[i] == byte`.
#[inline]
fn window_eq_byte(window: &[u8], byte: u8) -> u32 {
    debug_assert!(window.len() >= WINDOW);
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 detected at runtime; `window` holds >= 32 bytes.
            return unsafe { avx2::eq_byte(window.as_ptr(), byte) };
        }
    }
    let mut mask = 0u32;
    for i in 0..WINDOW {
        mask |= u32::from(window[i] == byte) << i;
    }
    mask
}

/// Lanes where `window[i] < row[i]` in unsigned byte order.
#[inline]
fn window_lt_row(window: &[u8], row: &[u8; WINDOW]) -> u32 {
    debug_assert!(window.len() >= WINDOW);
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            // SAFETY: AVX2 detected at runtime; both inputs hold >= 32 bytes.
            return unsafe { avx2::lt_row(window.as_ptr(), row.as_ptr()) };
        }
    }
    let mut mask = 0u32;
    for i in 0..WINDOW {
        mask |= u32::from(window[i] < row[i]) << i;
    }
    mask
}

/// Valid lanes of a chunk that may run past the end of the table.
#[inline]
fn lane_mask(remaining: usize) -> u32 {
    if remaining >= WINDOW {
        u32::MAX
    } else {
        (1u32 << remaining) - 1
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure modes of the fallible map operations. Absent keys are not
/// errors; they are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The allocator could not provide backing memory. The map keeps its
    /// previous backing arrays.
    AllocFailed,
    /// Size arithmetic overflowed `usize` while computing a capacity.
    CapacityOverflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocFailed => write!(f, "allocation of backing arrays failed"),
            Error::CapacityOverflow => write!(f, "requested capacity overflows usize"),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// Backing table
// =============================================================================

/// The three parallel arrays plus their bookkeeping.
///
/// `dst` and `fp` carry `WINDOW` trailing bytes mirroring their leading
/// `WINDOW` bytes, so an unaligned 32-byte load starting at any slot in
/// `[0, size)` sees a correctly wrapped window. `kv` has no mirror; slot
/// indices wrap explicitly.
struct Table<K, V> {
    dst: Vec<u8>,
    fp: Vec<u8>,
    kv: Vec<MaybeUninit<(K, V)>>,
    size: usize,
    tombstones: usize,
}

impl<K, V> Table<K, V> {
    fn unallocated() -> Self {
        Table {
            dst: Vec::new(),
            fp: Vec::new(),
            kv: Vec::new(),
            size: 0,
            tombstones: 0,
        }
    }

    fn alloc(size: usize) -> Result<Self, Error> {
        debug_assert!(size >= MIN_SIZE);
        let bytes = size.checked_add(WINDOW).ok_or(Error::CapacityOverflow)?;
        let mut dst = Vec::new();
        dst.try_reserve_exact(bytes).map_err(|_| Error::AllocFailed)?;
        dst.resize(bytes, EMPTY);
        let mut fp = Vec::new();
        fp.try_reserve_exact(bytes).map_err(|_| Error::AllocFailed)?;
        fp.resize(bytes, 0);
        let mut kv: Vec<MaybeUninit<(K, V)>> = Vec::new();
        kv.try_reserve_exact(size).map_err(|_| Error::AllocFailed)?;
        // SAFETY: MaybeUninit contents are allowed to be uninitialized.
        unsafe { kv.set_len(size) };
        Ok(Table {
            dst,
            fp,
            kv,
            size,
            tombstones: 0,
        })
    }

    #[inline]
    fn wrap(&self, slot: usize) -> usize {
        debug_assert!(slot < 2 * self.size);
        if slot >= self.size {
            slot - self.size
        } else {
            slot
        }
    }

    #[inline]
    fn set_meta(&mut self, slot: usize, meta: u8) {
        debug_assert!(slot < self.size);
        self.dst[slot] = meta;
        if slot < WINDOW {
            self.dst[self.size + slot] = meta;
        }
    }

    #[inline]
    fn set_fp(&mut self, slot: usize, fp: u8) {
        debug_assert!(slot < self.size);
        self.fp[slot] = fp;
        if slot < WINDOW {
            self.fp[self.size + slot] = fp;
        }
    }

    /// Writes an entry into a dead (empty or reclaimed tombstone) slot.
    #[inline]
    fn fill_slot(&mut self, slot: usize, meta: u8, fp: u8, entry: (K, V)) {
        self.kv[slot].write(entry);
        self.set_meta(slot, meta);
        self.set_fp(slot, fp);
    }

    /// Replaces the resident of a live slot, returning it along with its
    /// previous metadata and fingerprint.
    #[inline]
    fn swap_slot(&mut self, slot: usize, meta: u8, fp: u8, entry: (K, V)) -> ((K, V), u8, u8) {
        let prev_meta = self.dst[slot];
        let prev_fp = self.fp[slot];
        let prev = mem::replace(&mut self.kv[slot], MaybeUninit::new(entry));
        self.set_meta(slot, meta);
        self.set_fp(slot, fp);
        // SAFETY: the slot held a live pair; occupied metadata and unplaced
        // rehash markers both guarantee initialization.
        (unsafe { prev.assume_init() }, prev_meta, prev_fp)
    }

    /// Places a homeless entry, displacing residents per the Robin Hood
    /// rule. The key must not already be present.
    ///
    /// Each window attempt takes the first empty slot if there is one, else
    /// evicts the lowest-metadata lane the entry outranks and carries the
    /// evicted resident forward, landing on any later slot whose byte it
    /// ties or outranks. A primary-tagged entry that exhausts its window
    /// retries under the secondary hash; a secondary-tagged one is handed
    /// back to the caller, which must grow or rehash first.
    ///
    /// With `rehashing` set, tombstone bytes mark live entries awaiting
    /// re-placement: they are displacement targets on both passes, and the
    /// swapped-out resident restarts from its own primary window. Every
    /// such swap consumes a marker, so the rehash walk terminates.
    fn displace<S: BuildHasher>(
        &mut self,
        hasher: &S,
        entry: (K, V),
        rehashing: bool,
    ) -> Result<(), (K, V)>
    where
        K: Hash,
    {
        let mut entry = entry;
        let mut hf = HF_PRIMARY;
        let mut hash = hasher.hash_one(&entry.0);

        'window: loop {
            let base = reduce(hash, self.size);
            let mut fp = fingerprint(hash);
            let expected = if hf == HF_PRIMARY {
                &EXPECTED_PRIMARY
            } else {
                &EXPECTED_SECONDARY
            };

            // An empty slot is cheaper than any displacement, and position
            // within the window is irrelevant to lookup, which matches on
            // metadata and fingerprint alone.
            let empty = window_eq_byte(&self.dst[base..], EMPTY);
            if empty != 0 {
                let i = empty.trailing_zeros() as usize;
                let slot = self.wrap(base + i);
                self.fill_slot(slot, hf | i as u8, fp, entry);
                return Ok(());
            }

            // Candidate victims: every lane the entry strictly outranks.
            // Leaving for the secondary window while one exists would break
            // the early-exit guarantee lookups rely on.
            let mut candidates = window_lt_row(&self.dst[base..], expected);
            if rehashing && hf == HF_PRIMARY {
                candidates |= window_eq_byte(&self.dst[base..], TOMBSTONE);
            }
            if candidates == 0 {
                if hf == HF_PRIMARY {
                    hash = secondary(hasher.hash_one(&entry.0));
                    hf = HF_SECONDARY;
                    continue 'window;
                }
                return Err(entry);
            }

            // Evict the lowest metadata among the candidates, ties to the
            // lowest offset.
            let mut victim = 0usize;
            let mut victim_meta = u8::MAX;
            let mut m = candidates;
            while m != 0 {
                let i = m.trailing_zeros() as usize;
                m &= m - 1;
                let meta = self.dst[base + i];
                if meta < victim_meta {
                    victim_meta = meta;
                    victim = i;
                }
            }

            let mut dist = victim;
            let mut slot = self.wrap(base + victim);

            'chain: loop {
                let meta = hf | dist as u8;
                let cur = self.dst[slot];

                if cur == EMPTY {
                    self.fill_slot(slot, meta, fp, entry);
                    return Ok(());
                }
                if cur == TOMBSTONE {
                    if rehashing {
                        let (resident, _, _) = self.swap_slot(slot, meta, fp, entry);
                        entry = resident;
                        hf = HF_PRIMARY;
                        hash = hasher.hash_one(&entry.0);
                        continue 'window;
                    }
                    // Reachable only under the secondary tag: 0x80 never
                    // ties or loses against a primary byte.
                    self.fill_slot(slot, meta, fp, entry);
                    self.tombstones -= 1;
                    return Ok(());
                }

                let (resident, res_meta, res_fp) = self.swap_slot(slot, meta, fp, entry);
                entry = resident;
                hf = meta_hf(res_meta);
                dist = meta_dist(res_meta);
                fp = res_fp;

                // Walk forward until the carried entry ties or outranks a
                // slot. The inclusive compare shifts older entries outward.
                loop {
                    dist += 1;
                    if dist == WINDOW {
                        if hf == HF_PRIMARY {
                            hash = secondary(hasher.hash_one(&entry.0));
                            hf = HF_SECONDARY;
                            continue 'window;
                        }
                        return Err(entry);
                    }
                    slot = self.wrap(slot + 1);
                    let next = self.dst[slot];
                    if next <= (hf | dist as u8) || (rehashing && next == TOMBSTONE) {
                        continue 'chain;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Map
// =============================================================================

/// An open-addressing map over Robin Hood displacement and two fixed-width
/// probe windows per key.
///
/// `grow_at_percent` fixes the fill threshold at construction; at the
/// default of 100 the table grows only when a placement fails outright,
/// which lets it reach every-slot-occupied load.
pub struct BrimMap<K, V, S = FixedState> {
    table: Table<K, V>,
    len: usize,
    grow_at: usize,
    grow_at_percent: u8,
    hasher: S,
}

#[inline]
fn grow_threshold(size: usize, grow_at_percent: u8) -> usize {
    let at = ((size as u128 * grow_at_percent as u128) / 100) as usize;
    at.max(1)
}

impl<K, V> BrimMap<K, V, FixedState> {
    /// An unallocated map with the default hasher and fill threshold.
    pub fn new() -> Self {
        Self::with_hasher(FixedState::default())
    }

    /// A map pre-sized to `capacity` slots (at least one window's worth).
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        Self::with_capacity_and_config(capacity, FixedState::default(), DEFAULT_GROW_AT_PERCENT)
    }

    /// A map sized so that `expected_len` entries fit under the default
    /// fill threshold.
    pub fn for_len(expected_len: usize) -> Result<Self, Error> {
        Self::for_len_with_config(expected_len, FixedState::default(), DEFAULT_GROW_AT_PERCENT)
    }
}

impl<K, V, S> BrimMap<K, V, S> {
    /// An unallocated map using `hasher` and the default fill threshold.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config(hasher, DEFAULT_GROW_AT_PERCENT)
    }

    /// An unallocated map with an explicit fill threshold in percent.
    ///
    /// # Panics
    ///
    /// If `grow_at_percent` is outside `1..=100`.
    pub fn with_config(hasher: S, grow_at_percent: u8) -> Self {
        assert!(
            (1..=100).contains(&grow_at_percent),
            "grow_at_percent must be within 1..=100, got {grow_at_percent}"
        );
        BrimMap {
            table: Table::unallocated(),
            len: 0,
            grow_at: 0,
            grow_at_percent,
            hasher,
        }
    }

    /// A pre-sized map with an explicit hasher and fill threshold.
    pub fn with_capacity_and_config(
        capacity: usize,
        hasher: S,
        grow_at_percent: u8,
    ) -> Result<Self, Error> {
        let mut map = Self::with_config(hasher, grow_at_percent);
        if capacity > 0 {
            map.table = Table::alloc(capacity.max(MIN_SIZE))?;
            map.grow_at = grow_threshold(map.table.size, grow_at_percent);
        }
        Ok(map)
    }

    /// Sizes the table so `expected_len` entries fit under the threshold:
    /// `size = ceil(expected_len * 100 / grow_at_percent)`.
    pub fn for_len_with_config(
        expected_len: usize,
        hasher: S,
        grow_at_percent: u8,
    ) -> Result<Self, Error> {
        assert!(
            (1..=100).contains(&grow_at_percent),
            "grow_at_percent must be within 1..=100, got {grow_at_percent}"
        );
        let size = expected_len
            .checked_mul(100)
            .ok_or(Error::CapacityOverflow)?
            .div_ceil(grow_at_percent as usize);
        Self::with_capacity_and_config(size, hasher, grow_at_percent)
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots in the backing table.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.size
    }

    /// The fill threshold this map was constructed with.
    #[inline]
    pub fn grow_at_percent(&self) -> u8 {
        self.grow_at_percent
    }

    /// Visits every live entry in slot order. Empty and tombstone slots are
    /// skipped a window at a time.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            table: &self.table,
            chunk: 0,
            next_chunk: 0,
            mask: 0,
            remaining: self.len,
        }
    }
}

impl<K, V, S> BrimMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Looks up `key`, returning a reference to its value.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.find(key)?;
        // SAFETY: `find` only returns occupied slots.
        let (_, value) = unsafe { self.table.kv[slot].assume_init_ref() };
        Some(value)
    }

    /// Looks up `key`, returning a mutable reference to its value.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.find(key)?;
        // SAFETY: `find` only returns occupied slots.
        let (_, value) = unsafe { self.table.kv[slot].assume_init_mut() };
        Some(value)
    }

    /// The slot index of `key`. Stable as long as no insertion triggers a
    /// grow or rehash; with the table at full load this is a minimal
    /// perfect hash of the key set.
    pub fn get_index<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    fn find<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.table.size == 0 {
            return None;
        }
        let hash = self.hasher.hash_one(key);
        self.probe(hash, |slot| {
            // SAFETY: `probe` only tests occupied slots.
            let (k, _) = unsafe { self.table.kv[slot].assume_init_ref() };
            k.borrow() == key
        })
    }

    /// The two-window probe. For each window, every lane whose metadata and
    /// fingerprint both match is key-compared; if instead any lane holds a
    /// strictly smaller byte than the key's would-be metadata, the key
    /// would have displaced it, so the search ends early.
    fn probe(&self, hash: u64, mut eq: impl FnMut(usize) -> bool) -> Option<usize> {
        let t = &self.table;
        for (h, expected) in [
            (hash, &EXPECTED_PRIMARY),
            (secondary(hash), &EXPECTED_SECONDARY),
        ] {
            let base = reduce(h, t.size);
            let mut matches = window_eq_row(&t.dst[base..], expected)
                & window_eq_byte(&t.fp[base..], fingerprint(h));
            while matches != 0 {
                let i = matches.trailing_zeros() as usize;
                matches &= matches - 1;
                let slot = t.wrap(base + i);
                if eq(slot) {
                    return Some(slot);
                }
            }
            if window_lt_row(&t.dst[base..], expected) != 0 {
                return None;
            }
        }
        None
    }

    /// Inserts or updates. Returns the previous value when the key was
    /// already present. Fails only on allocation failure or capacity
    /// overflow.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>, Error> {
        if self.table.size == 0 {
            self.grow(MIN_SIZE)?;
        }
        let hash = self.hasher.hash_one(&key);
        let existing = self.probe(hash, |slot| {
            // SAFETY: `probe` only tests occupied slots.
            let (k, _) = unsafe { self.table.kv[slot].assume_init_ref() };
            *k == key
        });
        if let Some(slot) = existing {
            // SAFETY: `probe` returned an occupied slot.
            let (_, v) = unsafe { self.table.kv[slot].assume_init_mut() };
            return Ok(Some(mem::replace(v, value)));
        }

        // The key is confirmed absent from both windows; equality checking
        // is elided from here on.
        if self.len >= self.grow_at {
            let doubled = self
                .table
                .size
                .checked_mul(2)
                .ok_or(Error::CapacityOverflow)?;
            self.grow(doubled)?;
        }
        self.insert_unique((key, value))?;
        self.len += 1;
        Ok(None)
    }

    /// Removes `key`, returning its value.
    ///
    /// The freed slot becomes a true empty when the 32-byte window starting
    /// at it holds no byte `>= 0x5F`: no key can have been routed past this
    /// region by the secondary hash, because a secondary placement pins a
    /// byte `>= 0x5F` at offset 31 of its primary window, and that byte can
    /// only ever decay into a tombstone. Otherwise the slot becomes a
    /// tombstone.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.find(key)?;
        let erasable = window_lt_row(&self.table.dst[slot..], &REMOVAL_LIMIT) == u32::MAX;
        // SAFETY: `find` returned an occupied slot; clearing the metadata
        // below ends the table's ownership of the pair.
        let (_key, value) = unsafe { self.table.kv[slot].assume_init_read() };
        if erasable {
            self.table.set_meta(slot, EMPTY);
        } else {
            self.table.set_meta(slot, TOMBSTONE);
            self.table.tombstones += 1;
        }
        self.len -= 1;
        Some(value)
    }

    /// Re-places every entry in the current backing arrays, turning all
    /// tombstones back into empties. Runs implicitly when tombstones choke
    /// insertion; a map without tombstones has nothing to compact.
    pub fn rehash(&mut self) {
        if self.table.tombstones > 0 {
            self.rehash_in_place();
        }
    }

    fn insert_unique(&mut self, entry: (K, V)) -> Result<(), Error> {
        let mut entry = entry;
        loop {
            match self.table.displace(&self.hasher, entry, false) {
                Ok(()) => return Ok(()),
                Err(homeless) => {
                    entry = homeless;
                    if self.table.tombstones >= self.table.size / REHASH_TOMBSTONE_DIVISOR {
                        self.rehash_in_place();
                    } else {
                        let doubled = self
                            .table
                            .size
                            .checked_mul(2)
                            .ok_or(Error::CapacityOverflow)?;
                        self.grow(doubled)?;
                    }
                }
            }
        }
    }

    /// Moves every entry into a fresh table of at least `min_size` slots.
    /// The old arrays stay intact until the migration commits, so a failed
    /// allocation leaves the map untouched.
    fn grow(&mut self, min_size: usize) -> Result<(), Error> {
        let mut new_size = min_size.max(MIN_SIZE);
        'attempt: loop {
            let mut new_table = Table::alloc(new_size)?;
            for slot in 0..self.table.size {
                if !is_occupied(self.table.dst[slot]) {
                    continue;
                }
                // SAFETY: occupied slots hold initialized pairs. The copy
                // is owned by `new_table` only once the migration commits;
                // an abandoned target frees its memory without dropping.
                let entry = unsafe { self.table.kv[slot].assume_init_read() };
                if let Err(homeless) = new_table.displace(&self.hasher, entry, false) {
                    // The original still lives in the old arrays.
                    mem::forget(homeless);
                    new_size = match new_size.checked_mul(2) {
                        Some(n) => n,
                        None => return Err(Error::CapacityOverflow),
                    };
                    continue 'attempt;
                }
            }
            self.table = new_table;
            self.grow_at = grow_threshold(new_size, self.grow_at_percent);
            return Ok(());
        }
    }

    /// Re-places all entries within the same backing arrays.
    ///
    /// Tombstones revert to empty, live entries are downgraded to unplaced
    /// markers (the tombstone byte), and a strided walk extracts each
    /// marked entry and re-runs the dual-hash placement with marker slots
    /// acting as swappable residents.
    fn rehash_in_place(&mut self) {
        let size = self.table.size;
        for slot in 0..size {
            let meta = self.table.dst[slot];
            if meta == TOMBSTONE {
                self.table.set_meta(slot, EMPTY);
            } else if is_occupied(meta) {
                self.table.set_meta(slot, TOMBSTONE);
            }
        }
        self.table.tombstones = 0;

        let mut base = 0;
        while base < size {
            let mut unplaced =
                window_eq_byte(&self.table.dst[base..], TOMBSTONE) & lane_mask(size - base);
            while unplaced != 0 {
                let i = unplaced.trailing_zeros() as usize;
                unplaced &= unplaced - 1;
                let slot = base + i;
                // A displacement chain may have consumed this marker since
                // the stride was scanned.
                if self.table.dst[slot] != TOMBSTONE {
                    continue;
                }
                // SAFETY: unplaced markers hold initialized pairs; the
                // metadata is cleared before the pair is re-placed.
                let entry = unsafe { self.table.kv[slot].assume_init_read() };
                self.table.set_meta(slot, EMPTY);
                if self.table.displace(&self.hasher, entry, true).is_err() {
                    unreachable!("both probe windows failed during in-place rehash");
                }
            }
            base += WINDOW;
        }
    }
}

// =============================================================================
// Iteration
// =============================================================================

pub struct Iter<'a, K, V> {
    table: &'a Table<K, V>,
    chunk: usize,
    next_chunk: usize,
    mask: u32,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        while self.mask == 0 {
            if self.next_chunk >= self.table.size {
                return None;
            }
            let base = self.next_chunk;
            let dst = &self.table.dst[base..];
            let present = !(window_eq_byte(dst, EMPTY) | window_eq_byte(dst, TOMBSTONE));
            self.mask = present & lane_mask(self.table.size - base);
            self.chunk = base;
            self.next_chunk = base + WINDOW;
        }
        let i = self.mask.trailing_zeros() as usize;
        self.mask &= self.mask - 1;
        self.remaining -= 1;
        let slot = self.chunk + i;
        // SAFETY: the presence mask selects occupied slots only.
        let (k, v) = unsafe { self.table.kv[slot].assume_init_ref() };
        Some((k, v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

impl<'a, K, V, S> IntoIterator for &'a BrimMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Ancillary trait impls
// =============================================================================

impl<K, V, S: Default> Default for BrimMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Drop for BrimMap<K, V, S> {
    fn drop(&mut self) {
        if !mem::needs_drop::<(K, V)>() {
            return;
        }
        for slot in 0..self.table.size {
            if is_occupied(self.table.dst[slot]) {
                // SAFETY: occupied slots hold initialized pairs, and each is
                // dropped exactly once here.
                unsafe { self.table.kv[slot].assume_init_drop() };
            }
        }
    }
}

impl<K: Clone, V: Clone, S: Clone> Clone for BrimMap<K, V, S> {
    fn clone(&self) -> Self {
        let hasher = self.hasher.clone();
        let src = &self.table;
        let mut table = Table {
            // Both byte regions are copied whole, mirror tails included.
            dst: src.dst.clone(),
            fp: src.fp.clone(),
            kv: Vec::new(),
            size: src.size,
            tombstones: src.tombstones,
        };
        table.kv.reserve_exact(src.size);
        // SAFETY: MaybeUninit contents are allowed to be uninitialized.
        unsafe { table.kv.set_len(src.size) };

        // If a pair's clone unwinds, the copied metadata would claim slots
        // that were never initialized; the guard strips those claims.
        struct Guard<'a, K, V> {
            table: &'a mut Table<K, V>,
            done: usize,
        }
        impl<K, V> Drop for Guard<'_, K, V> {
            fn drop(&mut self) {
                for slot in self.done..self.table.size {
                    if is_occupied(self.table.dst[slot]) {
                        self.table.set_meta(slot, EMPTY);
                    }
                }
            }
        }

        let mut guard = Guard {
            table: &mut table,
            done: 0,
        };
        for slot in 0..src.size {
            if is_occupied(src.dst[slot]) {
                // SAFETY: occupied source slots hold initialized pairs.
                let pair = unsafe { src.kv[slot].assume_init_ref() };
                guard.table.kv[slot].write(pair.clone());
            }
            guard.done = slot + 1;
        }
        mem::forget(guard);

        BrimMap {
            table,
            len: self.len,
            grow_at: self.grow_at,
            grow_at_percent: self.grow_at_percent,
            hasher,
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for BrimMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
impl<K, V, S> BrimMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Recomputes the structural invariants from scratch: mirror tails,
    /// slot/metadata agreement, and the occupancy counters.
    fn assert_invariants(&self) {
        let t = &self.table;
        if t.size == 0 {
            assert_eq!(self.len, 0);
            return;
        }
        assert!(t.size >= MIN_SIZE);
        assert_eq!(t.dst.len(), t.size + WINDOW);
        assert_eq!(t.fp.len(), t.size + WINDOW);
        assert_eq!(t.kv.len(), t.size);
        for i in 0..WINDOW {
            assert_eq!(t.dst[t.size + i], t.dst[i], "dst mirror diverges at {i}");
            assert_eq!(t.fp[t.size + i], t.fp[i], "fp mirror diverges at {i}");
        }
        let mut occupied = 0;
        let mut tombstones = 0;
        for slot in 0..t.size {
            let meta = t.dst[slot];
            if meta == EMPTY {
                continue;
            }
            if meta == TOMBSTONE {
                tombstones += 1;
                continue;
            }
            occupied += 1;
            // SAFETY: occupied slots hold initialized pairs.
            let (key, _) = unsafe { t.kv[slot].assume_init_ref() };
            let hash = match meta_hf(meta) {
                HF_PRIMARY => self.hasher.hash_one(key),
                _ => secondary(self.hasher.hash_one(key)),
            };
            let base = reduce(hash, t.size);
            assert_eq!(
                t.wrap(base + meta_dist(meta)),
                slot,
                "metadata does not lead back to slot {slot}"
            );
            assert_eq!(t.fp[slot], fingerprint(hash), "stale fingerprint at {slot}");
        }
        assert_eq!(occupied, self.len);
        assert_eq!(tombstones, t.tombstones);
    }
}


#[cfg(test)]
mod proptests;
