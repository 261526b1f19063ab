// Buffered-range bookkeeping for subtitle tracks.

/// Contiguous interval of media time already delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    fn contains(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Non-overlapping set of buffered ranges for one track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedRanges {
    ranges: Vec<BufferedRange>,
}

impl BufferedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully processed fragment.
    ///
    /// The range containing `start` is extended to the fragment end; otherwise a
    /// new range is inserted. Ranges that end up touching are coalesced.
    pub fn record_fragment(&mut self, start: f64, duration: f64) {
        let end = start + duration;
        match self.ranges.iter_mut().find(|r| r.contains(start)) {
            Some(range) => range.end = range.end.max(end),
            None => self.ranges.push(BufferedRange::new(start, end)),
        }
        self.coalesce();
    }

    fn coalesce(&mut self) {
        if self.ranges.len() < 2 {
            return;
        }
        self.ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<BufferedRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn as_slice(&self) -> &[BufferedRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Buffer state around a playback position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    /// Seconds buffered ahead of the position
    pub len: f64,
    pub start: f64,
    pub end: f64,
    /// Start of the next range beyond a hole, if any
    pub next_start: Option<f64>,
}

/// Compute how much is buffered ahead of `pos`, treating holes no larger than
/// `max_hole` as contiguous.
pub fn buffered_info(ranges: &[BufferedRange], pos: f64, max_hole: f64) -> BufferInfo {
    let mut sorted = ranges.to_vec();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start).then(b.end.total_cmp(&a.end)));

    let mut joined: Vec<BufferedRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match joined.last_mut() {
            Some(last) if range.start - last.end <= max_hole => {
                last.end = last.end.max(range.end);
            }
            _ => joined.push(range),
        }
    }

    let mut info = BufferInfo {
        len: 0.0,
        start: pos,
        end: pos,
        next_start: None,
    };
    for range in joined {
        if pos + max_hole >= range.start && pos < range.end {
            info.start = range.start;
            info.end = range.end;
            info.len = range.end - pos;
        } else if pos + max_hole < range.start {
            info.next_start = Some(range.start);
            break;
        }
    }
    info
}
