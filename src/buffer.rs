use std::collections::VecDeque;
use std::io::IoSlice;

/// An owned sequence of byte-buffer segments, the unit of queued I/O for
/// the write queue (C3) and the result of the read path (C4).
///
/// Bytes are consumed from the front without reshuffling later segments,
/// so partial writes only ever trim the head segment.
#[derive(Debug, Default)]
pub struct BufferChain {
    segments: VecDeque<Vec<u8>>,
    consumed: usize,
}

impl BufferChain {
    pub fn new() -> BufferChain {
        BufferChain::default()
    }

    pub fn from_vec(data: Vec<u8>) -> BufferChain {
        let mut chain = BufferChain::new();
        chain.push_back(data);
        chain
    }

    pub fn push_back(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.segments.push_back(data);
        }
    }

    pub fn append(&mut self, mut other: BufferChain) {
        if other.consumed > 0 {
            other.drop_consumed_prefix();
        }
        self.segments.append(&mut other.segments);
    }

    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .enumerate()
            .map(|(i, seg)| if i == 0 { seg.len() - self.consumed } else { seg.len() })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segment sizes as currently queued, front offset included. Used by
    /// tests asserting the chunking the read path produced (spec's S6).
    pub fn segment_lens(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .map(|(i, seg)| if i == 0 { seg.len() - self.consumed } else { seg.len() })
            .collect()
    }

    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(self.segments.len());
        for (i, seg) in self.segments.iter().enumerate() {
            let start = if i == 0 { self.consumed } else { 0 };
            if start < seg.len() {
                out.push(IoSlice::new(&seg[start..]));
            }
        }
        out
    }

    /// Drop `n` bytes from the front of the chain, as sent by a
    /// successful `writev`.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.segments.front() else { break };
            let available = front.len() - self.consumed;
            if n < available {
                self.consumed += n;
                n = 0;
            } else {
                n -= available;
                self.segments.pop_front();
                self.consumed = 0;
            }
        }
    }

    fn drop_consumed_prefix(&mut self) {
        if self.consumed == 0 {
            return;
        }
        if let Some(front) = self.segments.front_mut() {
            front.drain(0..self.consumed);
        }
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_spans_segments() {
        let mut chain = BufferChain::new();
        chain.push_back(vec![1, 2, 3]);
        chain.push_back(vec![4, 5]);
        assert_eq!(chain.len(), 5);

        chain.consume(4);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.segment_lens(), vec![1]);
    }

    #[test]
    fn append_keeps_order() {
        let mut chain = BufferChain::from_vec(vec![1, 2]);
        chain.consume(1);

        let mut other = BufferChain::new();
        other.push_back(vec![3, 4]);
        chain.append(other);

        let slices: Vec<u8> = chain.io_slices().iter().flat_map(|s| s.to_vec()).collect();
        assert_eq!(slices, vec![2, 3, 4]);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let mut chain = BufferChain::new();
        chain.push_back(Vec::new());
        assert!(chain.is_empty());
    }
}
