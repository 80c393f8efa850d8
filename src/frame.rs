//! UMEM frame addressing.
//!
//! The number of frames per socket and the frame size are both powers of two,
//! so every 64-bit UMEM address can be read as three packed fields:
//!
//! ```text
//! | owner-id | frame-id | in-frame-offset |
//! ```
//!
//! The owner id is the index of the interface whose socket the frame was
//! originally handed to via the fill ring. When a transmit completes on a
//! different interface, the completion address alone tells us which fill ring
//! the frame must be returned to.

/// log2 of the number of UMEM frames owned by each socket.
pub const FRAMES_PER_SOCKET_SHIFT: u32 = 12;

/// Number of UMEM frames owned by each socket (fixed at 4096).
pub const FRAMES_PER_SOCKET: usize = 1 << FRAMES_PER_SOCKET_SHIFT;

// Unaligned-chunk descriptors carry the data offset in the upper 16 address
// bits (see <linux/if_xdp.h>).
const UNALIGNED_OFFSET_SHIFT: u32 = 48;
const UNALIGNED_ADDR_MASK: u64 = (1 << UNALIGNED_OFFSET_SHIFT) - 1;

/// Field layout of UMEM frame addresses for a given frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    owner_shift: u32,
}

impl FrameLayout {
    /// Derive the layout from the configured frame size. With non-power-of-two
    /// frame sizes (unaligned chunks) the shift is taken from the lowest set
    /// bit, matching the slot granularity the kernel uses.
    pub fn new(frame_size: u32) -> FrameLayout {
        FrameLayout {
            owner_shift: FRAMES_PER_SOCKET_SHIFT + frame_size.trailing_zeros(),
        }
    }

    pub fn owner_shift(&self) -> u32 {
        self.owner_shift
    }

    /// The interface that owns the frame behind `addr`.
    #[inline]
    pub fn owner(&self, addr: u64) -> usize {
        (addr >> self.owner_shift) as usize
    }

    /// Build an address from its three fields. The inverse of `owner` plus the
    /// offset extraction; mostly useful for tests and fill-ring priming math.
    pub fn encode(&self, owner: u64, frame: u64, offset: u64) -> u64 {
        (owner << self.owner_shift) | (frame << (self.owner_shift - FRAMES_PER_SOCKET_SHIFT)) | offset
    }
}

/// Resolve a descriptor address to the location of the packet bytes.
///
/// In unaligned-chunk mode the kernel stores the data offset in the upper bits
/// of the address; it must be applied before touching the packet and the
/// original address must be preserved for recycling. In aligned mode the upper
/// bits are zero and this is the identity.
#[inline]
pub fn add_offset_to_addr(addr: u64) -> u64 {
    (addr & UNALIGNED_ADDR_MASK) + (addr >> UNALIGNED_OFFSET_SHIFT)
}

/// Strip the embedded offset, leaving the base chunk address.
#[inline]
pub fn extract_addr(addr: u64) -> u64 {
    addr & UNALIGNED_ADDR_MASK
}

/// The offset embedded in an unaligned-chunk descriptor address.
#[inline]
pub fn extract_offset(addr: u64) -> u64 {
    addr >> UNALIGNED_OFFSET_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_shift_follows_frame_size() {
        assert_eq!(FrameLayout::new(2048).owner_shift(), 12 + 11);
        assert_eq!(FrameLayout::new(4096).owner_shift(), 12 + 12);
    }

    #[test]
    fn owner_roundtrip() {
        let layout = FrameLayout::new(4096);

        for owner in 0..4u64 {
            for frame in &[0u64, 1, 17, 4095] {
                let addr = layout.encode(owner, *frame, 0);
                assert_eq!(layout.owner(addr), owner as usize);
            }
        }
    }

    #[test]
    fn encode_matches_fill_priming() {
        // Priming writes (umem_offset + k) * frame_size; the owner field of
        // those addresses must decode back to the interface index.
        let layout = FrameLayout::new(2048);
        let frame_size = 2048u64;

        for iface in 0..3u64 {
            let umem_offset = iface * FRAMES_PER_SOCKET as u64;
            let first = umem_offset * frame_size;
            let last = (umem_offset + FRAMES_PER_SOCKET as u64 - 1) * frame_size;

            assert_eq!(layout.owner(first), iface as usize);
            assert_eq!(layout.owner(last), iface as usize);
            assert_eq!(first, layout.encode(iface, 0, 0));
        }
    }

    #[test]
    fn owner_survives_in_frame_offset() {
        let layout = FrameLayout::new(4096);
        let addr = layout.encode(2, 100, 256);

        assert_eq!(layout.owner(addr), 2);
        assert_eq!(addr & 0xfff, 256);
    }

    #[test]
    fn unaligned_offset_helpers() {
        let base = 0x1_2000u64;
        let addr = base | (256u64 << 48);

        assert_eq!(add_offset_to_addr(addr), base + 256);
        assert_eq!(extract_addr(addr), base);
        assert_eq!(extract_offset(addr), 256);

        // Aligned-mode addresses pass through untouched.
        assert_eq!(add_offset_to_addr(base), base);
    }
}
