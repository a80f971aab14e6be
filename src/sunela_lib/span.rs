/// Lists of spans (consecutive blocks)
///
/// A span is a half-open interval [start, start + len) of block indices.
/// The list stays sorted by start and coalesces adjacent spans on insertion.
/// Block allocation wants single blocks while erasing wants aligned runs;
/// this is the one place where the two granularities meet.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SpanList {
    spans: Vec<Span>,
}

fn round_up(n: usize, modulus: usize) -> usize {
    let n = n + modulus - 1;
    n - n % modulus
}

impl SpanList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Insert [n, n + len), merging with neighbors.
    pub fn add(&mut self, n: usize, len: usize) {
        debug_assert!(len > 0);
        let i = self.spans.partition_point(|s| s.start < n);
        debug_assert!(i == 0 || self.spans[i - 1].start + self.spans[i - 1].len <= n);
        debug_assert!(i == self.spans.len() || n + len <= self.spans[i].start);
        let merge_prev = i > 0 && self.spans[i - 1].start + self.spans[i - 1].len == n;
        let merge_next = i < self.spans.len() && n + len == self.spans[i].start;
        match (merge_prev, merge_next) {
            (true, true) => {
                self.spans[i - 1].len += len + self.spans[i].len;
                self.spans.remove(i);
            }
            (true, false) => self.spans[i - 1].len += len,
            (false, true) => {
                self.spans[i].start = n;
                self.spans[i].len += len;
            }
            (false, false) => self.spans.insert(i, Span { start: n, len }),
        }
    }

    /// Remove and return the first block of the first span.
    pub fn pop_one(&mut self) -> Option<usize> {
        let first = self.spans.first_mut()?;
        let n = first.start;
        if first.len > 1 {
            first.start += 1;
            first.len -= 1;
        } else {
            self.spans.remove(0);
        }
        Some(n)
    }

    /// Remove and return the base of the lowest erase-aligned sub-run of
    /// `erase_size` blocks fully contained in some span.
    pub fn pop_erase_group(&mut self, erase_size: usize) -> Option<usize> {
        debug_assert!(erase_size > 0);
        let i = self
            .spans
            .iter()
            .position(|s| s.start + s.len >= round_up(s.start, erase_size) + erase_size)?;
        let this = self.spans[i];
        let n = round_up(this.start, erase_size);
        if n == this.start {
            if this.len == erase_size {
                self.spans.remove(i);
            } else {
                self.spans[i].start += erase_size;
                self.spans[i].len -= erase_size;
            }
        } else if this.start + this.len == n + erase_size {
            self.spans[i].len -= erase_size;
        } else {
            self.spans[i].len = n - this.start;
            self.spans.insert(
                i + 1,
                Span {
                    start: n + erase_size,
                    len: this.start + this.len - n - erase_size,
                },
            );
        }
        Some(n)
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total number of blocks covered.
    pub fn total(&self) -> usize {
        self.spans.iter().map(|s| s.len).sum()
    }

    pub fn contains(&self, n: usize) -> bool {
        self.spans
            .iter()
            .any(|s| s.start <= n && n < s.start + s.len)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }
}
