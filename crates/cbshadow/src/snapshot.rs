use pipestate::BufferRange;

/// Double-buffered host copy of one group's constant buffer.
///
/// Every refresh shifts `current` into `previous` before the new bytes land,
/// so after refreshing with A then B, `current` holds B and `previous` holds A.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstantSnapshot {
    range: BufferRange,
    current: Vec<u8>,
    previous: Vec<u8>,
    refreshes: u64,
}

impl ConstantSnapshot {
    pub fn new(range: BufferRange) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }

    pub fn range(&self) -> BufferRange {
        self.range
    }

    pub(crate) fn set_range(&mut self, range: BufferRange) {
        self.range = range;
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// `None` until the first refresh.
    pub fn current(&self) -> Option<&[u8]> {
        (self.refreshes > 0).then_some(self.current.as_slice())
    }

    /// `None` until the first refresh; zero-filled after the first one.
    pub fn previous(&self) -> Option<&[u8]> {
        (self.refreshes > 0).then_some(self.previous.as_slice())
    }

    pub fn bytes(&self, previous: bool) -> Option<&[u8]> {
        if previous {
            self.previous()
        } else {
            self.current()
        }
    }

    /// Shifts a freshly captured copy in. A size change reallocates both
    /// buffers zero-filled before the shift.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() != self.current.len() {
            self.current = vec![0; bytes.len()];
            self.previous = vec![0; bytes.len()];
        }
        std::mem::swap(&mut self.current, &mut self.previous);
        self.current.copy_from_slice(bytes);
        self.refreshes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::ResourceHandle;

    #[test]
    fn previous_trails_current_by_one_refresh() {
        let mut snapshot = ConstantSnapshot::new(BufferRange::whole(ResourceHandle(1)));
        assert_eq!(snapshot.current(), None);
        assert_eq!(snapshot.previous(), None);

        snapshot.push(&[0xA; 8]);
        assert_eq!(snapshot.current(), Some(&[0xA; 8][..]));
        assert_eq!(snapshot.previous(), Some(&[0; 8][..]));

        snapshot.push(&[0xB; 8]);
        assert_eq!(snapshot.current(), Some(&[0xB; 8][..]));
        assert_eq!(snapshot.previous(), Some(&[0xA; 8][..]));

        snapshot.push(&[0xC; 8]);
        assert_eq!(snapshot.current(), Some(&[0xC; 8][..]));
        assert_eq!(snapshot.previous(), Some(&[0xB; 8][..]));
        assert_eq!(snapshot.refresh_count(), 3);
    }

    #[test]
    fn size_change_reinitialises_both_buffers() {
        let mut snapshot = ConstantSnapshot::default();
        snapshot.push(&[1; 4]);
        snapshot.push(&[2; 8]);
        assert_eq!(snapshot.len(), 8);
        assert_eq!(snapshot.current(), Some(&[2; 8][..]));
        assert_eq!(snapshot.previous(), Some(&[0; 8][..]));
    }
}
