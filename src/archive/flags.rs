//! Feature flags controlling which optional parts of the file system end up in the archive.

use bitflags::bitflags;

use super::EntryKind;

bitflags! {
    pub struct Flags: u64 {
        /// Include device nodes
        const WITH_DEVICE_NODES                = 0x400;
        /// Include FIFOs
        const WITH_FIFOS                       = 0x800;

        /// Preserve Extended Attribute metadata
        const WITH_XATTRS                      = 0x1000_0000;

        /// Default feature flags for the archive writer
        const DEFAULT =
            Flags::WITH_DEVICE_NODES.bits() |
            Flags::WITH_FIFOS.bits() |
            Flags::WITH_XATTRS.bits();
    }
}

impl Default for Flags {
    fn default() -> Flags {
        Flags::DEFAULT
    }
}

impl Flags {
    /// Whether entries of this kind are written at all.
    ///
    /// Sockets are never representable and are not covered by any flag.
    pub fn includes(self, kind: EntryKind) -> bool {
        match kind {
            EntryKind::BlockDevice | EntryKind::CharDevice => {
                self.contains(Flags::WITH_DEVICE_NODES)
            }
            EntryKind::Fifo => self.contains(Flags::WITH_FIFOS),
            _ => true,
        }
    }
}
