//! Slab allocator and reference translation
//!
//! The allocator exposes one unified reference space: refs below the
//! baseline resolve into the attached file (or buffer), refs at or above
//! it resolve into heap-allocated slabs holding this transaction's
//! uncommitted nodes. Slabs form an ordered sequence tagged by `ref_end`,
//! the first starting exactly at the baseline.
//!
//! Free space is tracked in two disjoint lists: mutable chunks inside
//! slabs, and read-only chunks inside the file which become reclaimable
//! once the commit that freed them is no longer pinned by any reader.

use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::trace;

use crate::constants::{
  HEADER_SIZE, PAGE_SIZE, SLAB_GROWTH_DENOMINATOR, SLAB_GROWTH_NUMERATOR,
  TRANSLATION_CACHE_SIZE,
};
use crate::core::mapping::{AttachConfig, MappedFile};
use crate::core::node::{get_byte_size_from_header, get_capacity_from_header};
use crate::core::section::{matches_boundary, section_base, section_index_of};
use crate::error::{Result, TideError};
use crate::types::Ref;

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachMode {
  None,
  /// Empty scratch-only allocator (in-memory realms)
  OwnedBuffer,
  /// Caller-provided immutable byte buffer
  UsersBuffer,
  /// File attached under lock-file discipline
  SharedFile,
  /// File attached exclusively
  UnsharedFile,
}

/// A contiguous heap buffer holding uncommitted nodes.
/// Covers refs `[prev_end, ref_end)`.
struct Slab {
  ref_end: Ref,
  buf: Box<[u8]>,
}

/// Half-open free interval `[ref, ref + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
  pub start: Ref,
  pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpaceState {
  /// All slab space is accounted for in the free list
  Clean,
  /// Allocations have happened since the last reset
  Dirty,
  /// A free-list push failed; allocations fail until reset
  Invalid,
}

/// Where a translated ref points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
  Buffer,
  InitialMapping,
  AdditionalMapping(usize),
  Slab(usize),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
  r: Ref,
  version: u64,
  source: Source,
  offset: usize,
}

/// Small software cache amortizing repeated translations of hot refs.
/// Entries are versioned; bumping the version invalidates all of them
/// logically in one step.
struct TranslationCache {
  entries: [Option<CacheEntry>; TRANSLATION_CACHE_SIZE],
}

impl TranslationCache {
  fn new() -> Self {
    Self {
      entries: [None; TRANSLATION_CACHE_SIZE],
    }
  }

  fn slot(r: Ref) -> usize {
    let mut h = r ^ (r >> 32);
    h ^= h >> 16;
    h = (h ^ (h >> 8)) & 0xff;
    h as usize
  }
}

// ============================================================================
// Allocator
// ============================================================================

/// Slab allocator over one attached file, buffer, or empty scratch space
pub struct SlabAllocator {
  attach_mode: AttachMode,
  mapped: Option<Arc<MappedFile>>,
  initial_mapping: Option<Arc<Mmap>>,
  buffer: Option<Vec<u8>>,
  /// Size of the contiguous initial chunk (mapping or buffer)
  initial_size: u64,
  /// Section index of the first additional mapping
  first_additional: usize,
  /// Local copy of the per-section mappings (lock-free reads)
  local_mappings: Vec<Arc<Mmap>>,
  /// Smallest ref inside a scratch slab; logical file size
  baseline: Ref,
  slabs: Vec<Slab>,
  free_space: Vec<Chunk>,
  free_read_only: Vec<Chunk>,
  free_space_state: FreeSpaceState,
  cache: Mutex<TranslationCache>,
  cache_version: u64,
  /// Test hook: force the next free-list push to fail
  #[cfg(test)]
  poison_next_push: bool,
}

impl Default for SlabAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl SlabAllocator {
  pub fn new() -> Self {
    Self {
      attach_mode: AttachMode::None,
      mapped: None,
      initial_mapping: None,
      buffer: None,
      initial_size: 0,
      first_additional: 0,
      local_mappings: Vec::new(),
      baseline: 0,
      slabs: Vec::new(),
      free_space: Vec::new(),
      free_read_only: Vec::new(),
      free_space_state: FreeSpaceState::Invalid,
      cache: Mutex::new(TranslationCache::new()),
      cache_version: 0,
      #[cfg(test)]
      poison_next_push: false,
    }
  }

  pub fn is_attached(&self) -> bool {
    self.attach_mode != AttachMode::None
  }

  pub fn baseline(&self) -> Ref {
    self.baseline
  }

  pub fn free_space_state(&self) -> FreeSpaceState {
    self.free_space_state
  }

  /// Largest ref in use: end of the last slab, or the baseline
  pub fn total_ref_end(&self) -> Ref {
    self.slabs.last().map_or(self.baseline, |s| s.ref_end)
  }

  pub fn mapped_file(&self) -> Option<&Arc<MappedFile>> {
    self.mapped.as_ref()
  }

  fn invalidate_cache(&mut self) {
    self.cache_version = self.cache_version.wrapping_add(1);
  }

  // ==========================================================================
  // Attach / detach
  // ==========================================================================

  /// Attach to a database file. Returns the committed top ref.
  pub fn attach_file(&mut self, path: &Path, cfg: &AttachConfig) -> Result<Ref> {
    assert!(!self.is_attached());
    let (mapped, view) = MappedFile::attach(path, cfg)?;
    self.mapped = Some(mapped);
    self.initial_mapping = Some(view.initial_mapping);
    self.initial_size = view.initial_size;
    self.first_additional = view.first_additional;
    self.local_mappings = view.additional;
    self.baseline = if self.local_mappings.is_empty() {
      view.initial_size
    } else {
      section_base(self.first_additional + self.local_mappings.len())
    };
    self.attach_mode = if cfg.is_shared {
      AttachMode::SharedFile
    } else {
      AttachMode::UnsharedFile
    };
    // Any slab placement from an earlier attach is stale; force callers
    // through reset_free_space_tracking before the first alloc.
    self.free_space_state = FreeSpaceState::Invalid;
    self.invalidate_cache();
    Ok(view.top_ref)
  }

  /// Attach to a caller-provided immutable buffer
  pub fn attach_buffer(&mut self, data: Vec<u8>) -> Result<Ref> {
    assert!(!self.is_attached());
    let size = data.len() as u64;
    let top_ref =
      crate::core::header::validate_buffer(&data, size, Path::new("<buffer>"))?;
    self.buffer = Some(data);
    self.initial_size = size;
    self.baseline = size;
    self.attach_mode = AttachMode::UsersBuffer;
    self.free_space_state = FreeSpaceState::Invalid;
    self.invalidate_cache();
    Ok(top_ref)
  }

  /// Attach with no backing storage at all (in-memory realms)
  pub fn attach_empty(&mut self) {
    assert!(!self.is_attached());
    self.attach_mode = AttachMode::OwnedBuffer;
    // No ref may ever be smaller than the header, so the header size is
    // the baseline for a storage-less allocator.
    self.baseline = HEADER_SIZE as Ref;
    self.initial_size = self.baseline;
    self.free_space_state = FreeSpaceState::Invalid;
    self.invalidate_cache();
  }

  /// Release all mappings, slabs and free-space tracking
  pub fn detach(&mut self) {
    self.mapped = None;
    self.initial_mapping = None;
    self.buffer = None;
    self.local_mappings.clear();
    self.initial_size = 0;
    self.first_additional = 0;
    self.baseline = 0;
    // Dropping the slabs forces re-creation after re-attach so they are
    // placed logically after the end of the file again.
    self.slabs.clear();
    self.free_space.clear();
    self.free_read_only.clear();
    self.free_space_state = FreeSpaceState::Invalid;
    self.attach_mode = AttachMode::None;
    self.invalidate_cache();
  }

  // ==========================================================================
  // Allocation
  // ==========================================================================

  /// True iff `r` resolves into committed file space
  pub fn is_read_only(&self, r: Ref) -> bool {
    r < self.baseline
  }

  /// Allocate `size` bytes (a multiple of 8) of scratch space
  pub fn alloc(&mut self, size: usize) -> Result<Ref> {
    assert!(size > 0);
    assert_eq!(size & 0x7, 0, "allocation sizes must be multiples of 8");
    assert!(self.is_attached());

    if self.free_space_state == FreeSpaceState::Invalid {
      return Err(TideError::InvalidFreeSpace);
    }
    self.free_space_state = FreeSpaceState::Dirty;

    let size64 = size as u64;

    // Reuse free space when a chunk is large enough.
    if let Some(index) = self.pick_free_chunk(size64) {
      let chunk = &mut self.free_space[index];
      let r = chunk.start;
      let rest = chunk.size - size64;
      if rest == 0 {
        self.free_space.swap_remove(index);
      } else {
        chunk.start += size64;
        chunk.size = rest;
      }
      trace!(r, size, "alloc from free list");
      debug_assert!(r >= self.baseline);
      return Ok(r);
    }

    // No reusable chunk: grow a new slab. To avoid wasting physical
    // memory on small transactions the slab is at least a page, and at
    // least 20% of the bytes already modified in this transaction.
    let mut new_size = size64.max(PAGE_SIZE as u64);
    let r = if let Some(last) = self.slabs.last() {
      let copy_on_write = last.ref_end - self.baseline;
      let min_size = copy_on_write * SLAB_GROWTH_NUMERATOR / SLAB_GROWTH_DENOMINATOR;
      new_size = new_size.max(min_size);
      last.ref_end
    } else {
      self.baseline
    };

    // Round upwards to page size.
    new_size = ((new_size - 1) | (PAGE_SIZE as u64 - 1)) + 1;

    let ref_end = r.checked_add(new_size).ok_or_else(|| {
      TideError::MaximumFileSizeExceeded(format!("slab ref_end overflow: {r} + {new_size}"))
    })?;

    let buf = vec![0u8; new_size as usize].into_boxed_slice();
    self.slabs.push(Slab { ref_end, buf });

    let unused = new_size - size64;
    if unused > 0 {
      let chunk = Chunk {
        start: r + size64,
        size: unused,
      };
      if self.take_poison() {
        self.free_space_state = FreeSpaceState::Invalid;
        return Err(TideError::InvalidFreeSpace);
      }
      self.free_space.push(chunk);
    }

    trace!(r, size, new_size, "alloc from new slab");
    debug_assert!(r >= self.baseline);
    Ok(r)
  }

  /// Index of the free chunk to allocate from, if any.
  ///
  /// Release builds take the first fit scanning from the back; debug
  /// builds pick a random chunk among the fits to scatter placements and
  /// surface use-after-free bugs earlier.
  fn pick_free_chunk(&self, size: u64) -> Option<usize> {
    let fits = |c: &Chunk| c.size >= size;
    #[cfg(debug_assertions)]
    let pick = {
      use rand::seq::IteratorRandom;
      let mut rng = rand::thread_rng();
      self
        .free_space
        .iter()
        .enumerate()
        .filter(|&(_, c)| fits(c))
        .map(|(i, _)| i)
        .choose(&mut rng)
    };
    #[cfg(not(debug_assertions))]
    let pick = self.free_space.iter().rposition(fits);
    pick
  }

  /// Consume the test-only poison flag
  fn take_poison(&mut self) -> bool {
    #[cfg(test)]
    {
      let poisoned = self.poison_next_push;
      self.poison_next_push = false;
      poisoned
    }
    #[cfg(not(test))]
    false
  }

  #[cfg(test)]
  pub(crate) fn poison_next_free(&mut self) {
    self.poison_next_push = true;
  }

  /// Return `r` to the free list. In the invalid state this is a no-op.
  pub fn free(&mut self, r: Ref) {
    let read_only = self.is_read_only(r);

    // Size comes from the node header: committed nodes report their
    // byte size, mutable nodes their full capacity.
    let size = {
      let header = self.translate(r);
      if read_only {
        get_byte_size_from_header(header)
      } else {
        get_capacity_from_header(header)
      }
    };
    if self.free_space_state == FreeSpaceState::Invalid {
      return;
    }
    // Mutable memory cannot be freed unless it was first allocated, and
    // any allocation puts free-space tracking into the dirty state.
    debug_assert!(read_only || self.free_space_state == FreeSpaceState::Dirty);
    self.free_space_state = FreeSpaceState::Dirty;

    if read_only {
      if self.take_poison() {
        self.free_space_state = FreeSpaceState::Invalid;
        return;
      }
      self.free_read_only.push(Chunk { start: r, size });
      return;
    }

    let ref_end = r + size;
    #[cfg(debug_assertions)]
    for c in &self.free_space {
      let overlaps = (r >= c.start && r < c.start + c.size) || (r < c.start && ref_end > c.start);
      debug_assert!(!overlaps, "double free of ref {r}");
    }

    // Try to merge with the adjacent succeeding chunk, unless that would
    // cross a slab boundary.
    let mut merged_with: Option<usize> = None;
    if !self.slab_ends_at(ref_end) {
      if let Some(i) = self.free_space.iter().position(|c| c.start == ref_end) {
        self.free_space[i].start = r;
        self.free_space[i].size += size;
        merged_with = Some(i);
      }
    }

    // Then with the adjacent preceding chunk, same restriction.
    if !self.slab_ends_at(r) {
      if let Some(i) = self.free_space.iter().position(|c| c.start + c.size == r) {
        if let Some(j) = merged_with {
          let merged_size = self.free_space[j].size;
          self.free_space[i].size += merged_size;
          self.free_space.swap_remove(j);
        } else {
          self.free_space[i].size += size;
        }
        return;
      }
    }

    if merged_with.is_none() {
      if self.take_poison() {
        self.free_space_state = FreeSpaceState::Invalid;
        return;
      }
      self.free_space.push(Chunk { start: r, size });
    }
  }

  fn slab_ends_at(&self, r: Ref) -> bool {
    self.slabs.iter().any(|s| s.ref_end == r)
  }

  /// Best-effort reallocation: new alloc, copy, free
  pub fn realloc(&mut self, r: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
    assert!(new_size > 0);
    assert_eq!(new_size & 0x7, 0, "allocation sizes must be multiples of 8");

    let new_ref = self.alloc(new_size)?;
    let old_bytes = self.translate(r)[..old_size.min(new_size)].to_vec();
    self.write(new_ref, &old_bytes)?;
    self.free(r);
    trace!(r, old_size, new_ref, new_size, "realloc");
    Ok(new_ref)
  }

  // ==========================================================================
  // Translation
  // ==========================================================================

  fn resolve(&self, r: Ref) -> (Source, usize) {
    if r < self.baseline {
      if self.buffer.is_some() {
        return (Source::Buffer, r as usize);
      }
      if r < self.initial_size {
        return (Source::InitialMapping, r as usize);
      }
      // The ref lies inside a section mapped after the initial chunk.
      let section = section_index_of(r);
      let mapping_index = section - self.first_additional;
      debug_assert!(mapping_index < self.local_mappings.len());
      (
        Source::AdditionalMapping(mapping_index),
        (r - section_base(section)) as usize,
      )
    } else {
      let i = self.slabs.partition_point(|s| s.ref_end <= r);
      debug_assert!(i < self.slabs.len(), "ref {r} beyond the last slab");
      let slab_start = if i == 0 {
        self.baseline
      } else {
        self.slabs[i - 1].ref_end
      };
      (Source::Slab(i), (r - slab_start) as usize)
    }
  }

  fn source_bytes(&self, source: Source) -> &[u8] {
    match source {
      Source::Buffer => self.buffer.as_deref().expect("buffer attached"),
      Source::InitialMapping => self.initial_mapping.as_deref().expect("mapping attached"),
      Source::AdditionalMapping(i) => &self.local_mappings[i],
      Source::Slab(i) => &self.slabs[i].buf,
    }
  }

  /// Resolve `r` to the bytes starting at it.
  ///
  /// The returned slice extends to the end of the owning slab, mapping
  /// or buffer; callers slice it down using the node header.
  pub fn translate(&self, r: Ref) -> &[u8] {
    debug_assert!(self.is_attached());
    let slot = TranslationCache::slot(r);
    {
      let cache = self.cache.lock();
      if let Some(entry) = cache.entries[slot] {
        if entry.r == r && entry.version == self.cache_version {
          return &self.source_bytes(entry.source)[entry.offset..];
        }
      }
    }
    let (source, offset) = self.resolve(r);
    let mut cache = self.cache.lock();
    cache.entries[slot] = Some(CacheEntry {
      r,
      version: self.cache_version,
      source,
      offset,
    });
    drop(cache);
    &self.source_bytes(source)[offset..]
  }

  /// Write bytes at a scratch ref. Only slab space is writable.
  pub fn write(&mut self, r: Ref, bytes: &[u8]) -> Result<()> {
    if self.is_read_only(r) {
      return Err(TideError::LogicError(format!(
        "attempt to write committed ref {r}"
      )));
    }
    let (source, offset) = self.resolve(r);
    match source {
      Source::Slab(i) => {
        self.slabs[i].buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
      }
      _ => unreachable!("scratch refs always resolve to slabs"),
    }
  }

  // ==========================================================================
  // Free-space lifecycle
  // ==========================================================================

  /// Sort and merge adjacent chunks in the read-only free list
  pub fn consolidate_free_readonly(&mut self) -> Result<()> {
    if self.free_space_state == FreeSpaceState::Invalid {
      return Err(TideError::InvalidFreeSpace);
    }
    if self.free_read_only.is_empty() {
      return Ok(());
    }
    self.free_read_only.sort_by_key(|c| c.start);
    let mut merged: Vec<Chunk> = Vec::with_capacity(self.free_read_only.len());
    for chunk in self.free_read_only.drain(..) {
      match merged.last_mut() {
        Some(prev) if prev.start + prev.size == chunk.start => prev.size += chunk.size,
        _ => merged.push(chunk),
      }
    }
    self.free_read_only = merged;
    Ok(())
  }

  pub fn free_readonly_chunks(&self) -> Result<&[Chunk]> {
    if self.free_space_state == FreeSpaceState::Invalid {
      return Err(TideError::InvalidFreeSpace);
    }
    Ok(&self.free_read_only)
  }

  pub fn free_mutable_chunks(&self) -> &[Chunk] {
    &self.free_space
  }

  /// Rebuild the free list so that it covers every slab completely.
  /// This is the only way out of the invalid state.
  pub fn reset_free_space_tracking(&mut self) {
    self.invalidate_cache();
    if self.free_space_state == FreeSpaceState::Clean {
      return;
    }
    self.free_read_only.clear();
    self.free_space.clear();

    let mut start = self.baseline;
    for slab in &self.slabs {
      self.free_space.push(Chunk {
        start,
        size: slab.ref_end - start,
      });
      start = slab.ref_end;
    }
    debug_assert!(self.is_all_free());
    self.free_space_state = FreeSpaceState::Clean;
  }

  /// Advance this allocator's view to a newer snapshot's file size.
  ///
  /// Extends the shared mappings as needed (racing growers only ever
  /// increase the mapping count) and rebases the slabs and their free
  /// chunks above the new baseline.
  pub fn update_reader_view(&mut self, file_size: u64) -> Result<()> {
    self.invalidate_cache();
    if file_size <= self.baseline {
      return Ok(());
    }
    assert_eq!(file_size % 8, 0, "file sizes are 8-byte aligned");
    assert!(matches!(
      self.attach_mode,
      AttachMode::SharedFile | AttachMode::UnsharedFile
    ));
    debug_assert!(self.free_space_state == FreeSpaceState::Clean);
    debug_assert!(matches_boundary(file_size));

    self.baseline = file_size;
    let mapped = self.mapped.as_ref().expect("file-attached allocator");
    let (first_additional, additional) = mapped.extend_mappings(file_size)?;
    debug_assert_eq!(first_additional, self.first_additional);
    if additional.len() > self.local_mappings.len() {
      self.local_mappings = additional;
    }

    // Rebase slabs and free list; in the clean state there is exactly
    // one free chunk per slab.
    debug_assert_eq!(self.slabs.len(), self.free_space.len());
    let mut slab_ref = file_size;
    for i in 0..self.slabs.len() {
      let size = self.free_space[i].size;
      self.free_space[i].start = slab_ref;
      let slab_ref_end = slab_ref + size;
      self.slabs[i].ref_end = slab_ref_end;
      slab_ref = slab_ref_end;
    }
    Ok(())
  }

  /// Iterate slabs as `(start_ref, bytes)` pairs (commit promotion)
  pub fn slab_contents(&self) -> impl Iterator<Item = (Ref, &[u8])> {
    let baseline = self.baseline;
    let mut start = baseline;
    self.slabs.iter().map(move |slab| {
      let out = (start, &slab.buf[..]);
      start = slab.ref_end;
      out
    })
  }

  // ==========================================================================
  // Verification
  // ==========================================================================

  /// True iff the free list covers every slab byte exactly
  pub fn is_all_free(&self) -> bool {
    if self.free_space.len() != self.slabs.len() {
      return false;
    }
    let mut slab_start = self.baseline;
    for slab in &self.slabs {
      let size = slab.ref_end - slab_start;
      match self.free_space.iter().find(|c| c.start == slab_start) {
        Some(chunk) if chunk.size == size => {}
        _ => return false,
      }
      slab_start = slab.ref_end;
    }
    true
  }

  /// Debug check: every mutable free chunk lies inside one slab
  pub fn verify(&self) {
    for chunk in &self.free_space {
      let i = self.slabs.partition_point(|s| s.ref_end <= chunk.start);
      assert!(i < self.slabs.len(), "free chunk outside any slab");
      assert!(
        chunk.start + chunk.size <= self.slabs[i].ref_end,
        "free chunk crosses a slab boundary"
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::node;

  fn scratch_alloc() -> SlabAllocator {
    let mut alloc = SlabAllocator::new();
    alloc.attach_empty();
    alloc.reset_free_space_tracking();
    alloc
  }

  /// Allocate a node-shaped block so free() can read a size header
  fn alloc_node(alloc: &mut SlabAllocator, payload: usize) -> Ref {
    let r = node::write_node(alloc, &vec![0xAB; payload]).expect("alloc node");
    r
  }

  #[test]
  fn refs_are_aligned_and_stable() {
    let mut alloc = scratch_alloc();
    let mut refs = Vec::new();
    for i in 1..40 {
      let r = alloc_node(&mut alloc, i * 8);
      assert_eq!(r % 8, 0);
      refs.push((r, i * 8));
    }
    for (r, payload) in refs {
      let bytes = node::read_node(&alloc, r).expect("read node");
      assert_eq!(bytes.len(), payload);
      assert!(bytes.iter().all(|&b| b == 0xAB));
    }
  }

  #[test]
  fn freeing_all_nodes_restores_all_free() {
    let mut alloc = scratch_alloc();
    let refs: Vec<Ref> = (1..20).map(|i| alloc_node(&mut alloc, i * 16)).collect();
    for r in refs {
      alloc.free(r);
    }
    alloc.verify();
    assert!(alloc.is_all_free(), "free list must cover all slabs");
  }

  #[test]
  fn adjacent_frees_merge_within_slab() {
    let mut alloc = scratch_alloc();
    // One page-sized slab: three adjacent 128-byte blocks.
    let a = alloc_node(&mut alloc, 120);
    let b = alloc_node(&mut alloc, 120);
    let c = alloc_node(&mut alloc, 120);
    assert_eq!(b, a + 128);
    assert_eq!(c, a + 256);
    alloc.free(a);
    alloc.free(b);
    alloc.free(c);
    // All three coalesce with each other and with the slab tail.
    assert!(alloc.is_all_free());
    assert_eq!(alloc.free_mutable_chunks().len(), 1);
  }

  #[test]
  fn free_list_poisoning_disables_alloc_until_reset() {
    let mut alloc = scratch_alloc();
    let a = alloc_node(&mut alloc, 64);
    let _b = alloc_node(&mut alloc, 64);
    alloc.poison_next_free();
    alloc.free(a);
    assert_eq!(alloc.free_space_state(), FreeSpaceState::Invalid);
    assert!(matches!(alloc.alloc(64), Err(TideError::InvalidFreeSpace)));
    // free in the invalid state is a no-op
    alloc.free(_b);
    assert_eq!(alloc.free_space_state(), FreeSpaceState::Invalid);

    alloc.reset_free_space_tracking();
    assert_eq!(alloc.free_space_state(), FreeSpaceState::Clean);
    assert!(alloc.alloc(64).is_ok());
  }

  #[test]
  fn realloc_preserves_contents() {
    let mut alloc = scratch_alloc();
    let r = node::write_node(&mut alloc, b"realloc-roundtrip").unwrap();
    let size = node::node_footprint(b"realloc-roundtrip".len());
    let new_ref = alloc.realloc(r, size, size * 2).unwrap();
    let bytes = node::read_node(&alloc, new_ref).unwrap();
    assert_eq!(&bytes, b"realloc-roundtrip");
  }

  #[test]
  fn slab_growth_scales_with_uncommitted_bytes() {
    let mut alloc = scratch_alloc();
    // Fill several pages; the allocator must keep alloc() succeeding
    // and keep every ref translatable.
    let mut total = 0usize;
    while total < 64 * 1024 {
      let r = alloc.alloc(256).expect("alloc");
      assert!(alloc.translate(r).len() >= 256);
      total += 256;
    }
    alloc.verify();
  }

  #[test]
  fn randomized_alloc_free_preserves_invariants() {
    use rand::prelude::*;
    let mut rng = StdRng::seed_from_u64(0x71de);
    let mut alloc = scratch_alloc();
    let mut live: Vec<Ref> = Vec::new();

    for _ in 0..2000 {
      if live.is_empty() || rng.gen_bool(0.6) {
        let payload = (1 + rng.gen_range(0..64)) * 8;
        live.push(alloc_node(&mut alloc, payload));
      } else {
        let i = rng.gen_range(0..live.len());
        let r = live.swap_remove(i);
        alloc.free(r);
      }
      alloc.verify();
    }
    for r in live {
      alloc.free(r);
    }
    alloc.verify();
    assert!(alloc.is_all_free());
  }
}
