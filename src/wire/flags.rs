use bitflags::bitflags;

bitflags! {
    /// Per-variant flags, transmitted as `u16` in every frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataFlags: u16 {
        /// may be sent on the datagram channel if the connection has one
        const UNRELIABLE = 1 << 0;
        /// small and frequent - candidate for packing into shared containers
        const SMALL = 1 << 1;
        /// handling may be deferred to a task rather than run inline on the receiving worker
        const TASKABLE = 1 << 2;
        /// the data context does not generate / expect the standard `ref` / `boundRef` metas
        const NO_STANDARD_META = 1 << 3;
        /// the type-ID in the frame header may be sent as a string table ID
        const SLIM_HEADER = 1 << 4;
        /// owned by the transport core rather than the application
        const CORE_TYPE = 1 << 5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_bits_are_retained() {
        let raw = 0x8001;
        let flags = DataFlags::from_bits_retain(raw);
        assert!(flags.contains(DataFlags::UNRELIABLE));
        assert_eq!(flags.bits(), raw);
    }
}
