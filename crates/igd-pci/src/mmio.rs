use std::sync::Arc;

/// Handler for accesses to a memory-mapped window.
///
/// Offsets are relative to the start of the window the handler is mapped at. Handlers may be
/// called from any vCPU thread, so they take `&self` and do their own synchronization.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, size: usize) -> u64;
    fn write(&self, offset: u64, size: usize, value: u64);
}

struct MmioOverlay {
    name: &'static str,
    offset: u64,
    size: u64,
    priority: i32,
    handler: Arc<dyn MmioHandler>,
}

impl MmioOverlay {
    fn contains(&self, offset: u64, size: usize) -> bool {
        let Some(end) = offset.checked_add(size as u64) else {
            return false;
        };
        offset >= self.offset && end <= self.offset + self.size
    }
}

/// A memory-mapped window (typically a BAR) that can carry overlapping subregions.
///
/// Accesses that fall entirely inside an overlay are routed to the overlay with the highest
/// priority (the most recently added one on ties). Everything else is left to the owner of the
/// region, which usually forwards it to the backing device.
pub struct MmioRegion {
    name: String,
    size: u64,
    overlays: Vec<MmioOverlay>,
}

impl MmioRegion {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            overlays: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Maps `handler` over `offset..offset + size` of this region.
    ///
    /// # Panics
    ///
    /// Panics if the subregion does not fit inside the region.
    pub fn add_subregion_overlap(
        &mut self,
        name: &'static str,
        offset: u64,
        size: u64,
        handler: Arc<dyn MmioHandler>,
        priority: i32,
    ) {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            "subregion {name} at {offset:#x}+{size:#x} does not fit in {} ({:#x} bytes)",
            self.name,
            self.size
        );
        self.overlays.push(MmioOverlay {
            name,
            offset,
            size,
            priority,
            handler,
        });
    }

    /// Removes every subregion registered under `name`. Returns how many were removed.
    pub fn del_subregion(&mut self, name: &str) -> usize {
        let before = self.overlays.len();
        self.overlays.retain(|overlay| overlay.name != name);
        before - self.overlays.len()
    }

    pub fn subregion_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.overlays.iter().map(|overlay| overlay.name)
    }

    /// Routes a read to the covering overlay, if any.
    pub fn dispatch_read(&self, offset: u64, size: usize) -> Option<u64> {
        let overlay = self.resolve(offset, size)?;
        Some(overlay.handler.read(offset - overlay.offset, size))
    }

    /// Routes a write to the covering overlay. Returns `false` when no overlay claimed it.
    pub fn dispatch_write(&self, offset: u64, size: usize, value: u64) -> bool {
        let Some(overlay) = self.resolve(offset, size) else {
            return false;
        };
        overlay.handler.write(offset - overlay.offset, size, value);
        true
    }

    fn resolve(&self, offset: u64, size: usize) -> Option<&MmioOverlay> {
        self.overlays
            .iter()
            .enumerate()
            .filter(|(_, overlay)| overlay.contains(offset, size))
            .max_by_key(|(index, overlay)| (overlay.priority, *index))
            .map(|(_, overlay)| overlay)
    }
}

/// Value returned for reads nobody can serve.
pub fn all_ones(size: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    if size >= 8 {
        return u64::MAX;
    }
    (1u64 << (size * 8)) - 1
}
