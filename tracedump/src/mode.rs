use bitflags::bitflags;

bitflags! {
    /// Composite capture mode. `OPEN` is the base state; `RECORD` and
    /// `CACHE` are mutually exclusive refinements of it. The empty set is
    /// the closed state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceMode: u8 {
        const OPEN = 1 << 0;
        const RECORD = 1 << 1;
        const CACHE = 1 << 2;
    }
}

impl TraceMode {
    pub const CLOSE: TraceMode = TraceMode::empty();

    pub fn is_closed(self) -> bool {
        self.is_empty()
    }

    /// Legal composites are CLOSE, OPEN, OPEN|RECORD and OPEN|CACHE.
    pub fn is_legal(self) -> bool {
        if self.intersects(TraceMode::RECORD | TraceMode::CACHE) && !self.contains(TraceMode::OPEN)
        {
            return false;
        }
        !self.contains(TraceMode::RECORD | TraceMode::CACHE)
    }
}
