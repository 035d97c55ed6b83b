//! Node store
//!
//! Nodes are opaque byte payloads stored behind an 8-byte header:
//!
//! ```text
//! offset  size  field
//! 0       4     capacity  : full allocated footprint, multiple of 8
//! 4       4     byte_size : header + payload bytes actually used
//! ```
//!
//! The allocator reads these fields when freeing: committed nodes are
//! freed by byte size, mutable nodes by capacity.

use crate::constants::NODE_HEADER_SIZE;
use crate::core::alloc::SlabAllocator;
use crate::error::{Result, TideError};
use crate::types::Ref;
use crate::util::binary::{read_u32_at, write_u32_at};

/// Capacity recorded in a node header
pub fn get_capacity_from_header(header: &[u8]) -> u64 {
  read_u32_at(header, 0) as u64
}

/// Used byte size recorded in a node header
pub fn get_byte_size_from_header(header: &[u8]) -> u64 {
  read_u32_at(header, 4) as u64
}

/// Allocated footprint of a node with `payload_len` payload bytes
pub fn node_footprint(payload_len: usize) -> usize {
  (NODE_HEADER_SIZE + payload_len + 7) & !7
}

/// Allocate a node and store `payload` in it
pub fn write_node(alloc: &mut SlabAllocator, payload: &[u8]) -> Result<Ref> {
  let byte_size = NODE_HEADER_SIZE + payload.len();
  let capacity = node_footprint(payload.len());
  if capacity > u32::MAX as usize {
    return Err(TideError::MaximumFileSizeExceeded(format!(
      "node of {} bytes exceeds the node size limit",
      payload.len()
    )));
  }

  let r = alloc.alloc(capacity)?;
  let mut buf = vec![0u8; capacity];
  write_u32_at(&mut buf, 0, capacity as u32);
  write_u32_at(&mut buf, 4, byte_size as u32);
  buf[NODE_HEADER_SIZE..byte_size].copy_from_slice(payload);
  alloc.write(r, &buf)?;
  Ok(r)
}

/// Read a node's payload bytes
pub fn read_node(alloc: &SlabAllocator, r: Ref) -> Result<Vec<u8>> {
  let bytes = alloc.translate(r);
  if bytes.len() < NODE_HEADER_SIZE {
    return Err(TideError::LogicError(format!(
      "ref {r} does not address a node"
    )));
  }
  let byte_size = get_byte_size_from_header(bytes) as usize;
  if byte_size < NODE_HEADER_SIZE || byte_size > bytes.len() {
    return Err(TideError::LogicError(format!(
      "node at ref {r} has corrupt byte size {byte_size}"
    )));
  }
  Ok(bytes[NODE_HEADER_SIZE..byte_size].to_vec())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn footprint_is_header_plus_padded_payload() {
    assert_eq!(node_footprint(0), 8);
    assert_eq!(node_footprint(1), 16);
    assert_eq!(node_footprint(8), 16);
    assert_eq!(node_footprint(9), 24);
  }

  #[test]
  fn node_round_trips_through_scratch_space() {
    let mut alloc = SlabAllocator::new();
    alloc.attach_empty();
    alloc.reset_free_space_tracking();

    let r = write_node(&mut alloc, b"opaque payload").unwrap();
    assert_eq!(read_node(&alloc, r).unwrap(), b"opaque payload");

    let header = alloc.translate(r);
    assert_eq!(get_capacity_from_header(header), node_footprint(14) as u64);
    assert_eq!(
      get_byte_size_from_header(header),
      (NODE_HEADER_SIZE + 14) as u64
    );
  }
}
