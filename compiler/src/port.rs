// port.rs — Ports and element references
//
// An output port is a fixed-size array of scalar elements owned by its node.
// An input port never owns anything: it holds `PortElements`, an ordered list
// of sub-ranges of other nodes' output ports, addressed by node id. Because
// references are ids rather than pointers, a node's inputs can be freely
// rewritten when a graph is copied or refined.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

// ── References ──────────────────────────────────────────────────────────────

/// A whole output port: `(node, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: NodeId,
    pub port: usize,
}

impl OutputRef {
    pub fn new(node: NodeId, port: usize) -> Self {
        OutputRef { node, port }
    }
}

/// A single scalar element of an output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementRef {
    pub node: NodeId,
    pub port: usize,
    pub index: usize,
}

/// A contiguous sub-range `[start, start + len)` of one output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub node: NodeId,
    pub port: usize,
    pub start: usize,
    pub len: usize,
}

impl PortRange {
    pub fn new(node: NodeId, port: usize, start: usize, len: usize) -> Self {
        PortRange {
            node,
            port,
            start,
            len,
        }
    }

    pub fn output(&self) -> OutputRef {
        OutputRef::new(self.node, self.port)
    }

    /// One past the last element. Saturates for ranges no output could
    /// hold; validation goes through `checked_end`.
    pub fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }

    pub fn checked_end(&self) -> Option<usize> {
        self.start.checked_add(self.len)
    }

    /// Whether `next` continues this range without a gap.
    fn is_followed_by(&self, next: &PortRange) -> bool {
        self.node == next.node
            && self.port == next.port
            && self.checked_end() == Some(next.start)
            && next.checked_end().is_some()
    }
}

/// An ordered concatenation of port ranges, the value an input port reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortElements {
    ranges: Vec<PortRange>,
}

impl PortElements {
    pub fn new() -> Self {
        Self::default()
    }

    /// All elements of port 0 of `node`, which has `size` elements.
    pub fn full(node: NodeId, size: usize) -> Self {
        Self::range(node, 0, 0, size)
    }

    /// All elements of `output`, which has `size` elements.
    pub fn of_output(output: OutputRef, size: usize) -> Self {
        Self::range(output.node, output.port, 0, size)
    }

    pub fn range(node: NodeId, port: usize, start: usize, len: usize) -> Self {
        let mut elements = Self::new();
        elements.push(PortRange::new(node, port, start, len));
        elements
    }

    /// A single element of port 0 of `node`.
    pub fn element_of(node: NodeId, index: usize) -> Self {
        Self::range(node, 0, index, 1)
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = PortRange>) -> Self {
        let mut elements = Self::new();
        for range in ranges {
            elements.push(range);
        }
        elements
    }

    /// Append a range, merging it into the last one when contiguous.
    /// Empty ranges are dropped.
    pub fn push(&mut self, range: PortRange) {
        if range.len == 0 {
            return;
        }
        if let Some(last) = self.ranges.last_mut() {
            if last.is_followed_by(&range) {
                last.len += range.len;
                return;
            }
        }
        self.ranges.push(range);
    }

    pub fn append(&mut self, other: &PortElements) {
        for range in &other.ranges {
            self.push(*range);
        }
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The `index`-th element of the concatenation.
    pub fn element(&self, index: usize) -> Option<ElementRef> {
        let mut offset = index;
        for range in &self.ranges {
            if offset < range.len {
                return Some(ElementRef {
                    node: range.node,
                    port: range.port,
                    index: range.start.checked_add(offset)?,
                });
            }
            offset -= range.len;
        }
        None
    }

    pub fn elements(&self) -> impl Iterator<Item = ElementRef> + '_ {
        self.ranges.iter().flat_map(|r| {
            (r.start..r.end()).map(move |index| ElementRef {
                node: r.node,
                port: r.port,
                index,
            })
        })
    }

    /// Producer node ids in reference order (repeats are kept).
    pub fn nodes(&self) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.ranges.iter().map(|r| r.node)
    }

    /// Elements `[start, start + len)` of the concatenation, or `None` when
    /// the window runs past the end.
    pub fn slice(&self, start: usize, len: usize) -> Option<PortElements> {
        if start.checked_add(len)? > self.len() {
            return None;
        }
        let mut result = PortElements::new();
        let mut skip = start;
        let mut remaining = len;
        for range in &self.ranges {
            if remaining == 0 {
                break;
            }
            if skip >= range.len {
                skip -= range.len;
                continue;
            }
            let take = (range.len - skip).min(remaining);
            result.push(PortRange::new(range.node, range.port, range.start + skip, take));
            remaining -= take;
            skip = 0;
        }
        Some(result)
    }

    /// If these elements are exactly one whole output port of `size`
    /// elements, return that port.
    pub fn as_whole_output(&self, size: usize) -> Option<OutputRef> {
        match self.ranges.as_slice() {
            [only] if only.start == 0 && only.len == size => Some(only.output()),
            _ => None,
        }
    }
}

impl fmt::Display for PortElements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if r.port == 0 {
                write!(f, "{}[{}..{}]", r.node, r.start, r.end())?;
            } else {
                write!(f, "{}.{}[{}..{}]", r.node, r.port, r.start, r.end())?;
            }
        }
        Ok(())
    }
}

// ── Ports ───────────────────────────────────────────────────────────────────

/// A named input port and the elements it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct InputPort {
    pub name: &'static str,
    pub elements: PortElements,
}

/// A named output port of a fixed number of real-valued elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPort {
    pub name: &'static str,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_ranges_are_merged() {
        let mut e = PortElements::range(NodeId(1), 0, 0, 2);
        e.push(PortRange::new(NodeId(1), 0, 2, 3));
        assert_eq!(e.ranges().len(), 1);
        assert_eq!(e.len(), 5);

        e.push(PortRange::new(NodeId(2), 0, 0, 1));
        assert_eq!(e.ranges().len(), 2);
        assert_eq!(e.len(), 6);
    }

    #[test]
    fn ranges_ending_past_usize_max_are_not_merged() {
        let mut e = PortElements::range(NodeId(1), 0, 0, usize::MAX);
        e.push(PortRange::new(NodeId(1), 0, usize::MAX, 1));
        assert_eq!(e.ranges().len(), 2);
        assert_eq!(PortRange::new(NodeId(1), 0, usize::MAX, 1).checked_end(), None);
        assert_eq!(PortRange::new(NodeId(1), 0, usize::MAX, 1).end(), usize::MAX);
        assert_eq!(PortElements::range(NodeId(1), 0, 0, 2).slice(1, usize::MAX), None);
    }

    #[test]
    fn empty_ranges_are_dropped() {
        let e = PortElements::range(NodeId(1), 0, 4, 0);
        assert!(e.is_empty());
        assert_eq!(e.len(), 0);
    }

    #[test]
    fn element_walks_across_ranges() {
        let e = PortElements::from_ranges([
            PortRange::new(NodeId(1), 0, 3, 2),
            PortRange::new(NodeId(2), 0, 0, 2),
        ]);
        assert_eq!(
            e.element(1),
            Some(ElementRef {
                node: NodeId(1),
                port: 0,
                index: 4
            })
        );
        assert_eq!(
            e.element(2),
            Some(ElementRef {
                node: NodeId(2),
                port: 0,
                index: 0
            })
        );
        assert_eq!(e.element(4), None);
        assert_eq!(e.elements().count(), 4);
    }

    #[test]
    fn slice_spanning_two_ranges() {
        let e = PortElements::from_ranges([
            PortRange::new(NodeId(1), 0, 0, 3),
            PortRange::new(NodeId(2), 0, 10, 3),
        ]);
        let s = e.slice(2, 2).unwrap();
        assert_eq!(
            s.ranges(),
            &[
                PortRange::new(NodeId(1), 0, 2, 1),
                PortRange::new(NodeId(2), 0, 10, 1)
            ]
        );
        assert!(e.slice(5, 2).is_none());
    }

    #[test]
    fn whole_output_detection() {
        let e = PortElements::full(NodeId(4), 3);
        assert_eq!(e.as_whole_output(3), Some(OutputRef::new(NodeId(4), 0)));
        assert_eq!(e.as_whole_output(4), None);
        assert_eq!(e.slice(0, 2).unwrap().as_whole_output(3), None);
    }

    #[test]
    fn display_lists_ranges() {
        let e = PortElements::from_ranges([
            PortRange::new(NodeId(1), 0, 0, 3),
            PortRange::new(NodeId(2), 1, 1, 1),
        ]);
        assert_eq!(e.to_string(), "1[0..3], 2.1[1..2]");
    }
}
