//! Word-addressed external memory
//!
//! Matrices live in a [`LinearMemory`] as row-major words of `mem_width`
//! lanes. During a pass the memory is split into a read-only view for the
//! tile reader and an exclusive slice of the C region for the tile writer.

use std::ops::Range;

use crate::error::{GemmError, GemmResult};

/// One memory word: `mem_width` contiguous elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    lanes: Vec<i64>,
}

impl Word {
    pub fn zeroed(width: usize) -> Self {
        Self { lanes: vec![0; width] }
    }

    pub fn from_lanes(lanes: Vec<i64>) -> Self {
        Self { lanes }
    }

    pub fn lanes(&self) -> &[i64] {
        &self.lanes
    }

    pub fn width(&self) -> usize {
        self.lanes.len()
    }
}

impl std::ops::Index<usize> for Word {
    type Output = i64;

    fn index(&self, lane: usize) -> &i64 {
        &self.lanes[lane]
    }
}

/// External linear memory holding every operand of a pass
#[derive(Debug, Clone)]
pub struct LinearMemory {
    width: usize,
    words: Vec<Word>,
}

impl LinearMemory {
    pub fn new(len: usize, width: usize) -> Self {
        Self {
            width,
            words: vec![Word::zeroed(width); len],
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Lanes per word
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn word(&self, addr: usize) -> Option<&Word> {
        self.words.get(addr)
    }

    /// Copy `words` into memory starting at `base`
    pub fn store(&mut self, base: usize, words: &[Word]) -> GemmResult<()> {
        let end = base + words.len();
        if end > self.words.len() {
            return Err(GemmError::config(format!(
                "store of {} words at {} runs past memory end {}",
                words.len(),
                base,
                self.words.len()
            )));
        }
        for word in words {
            if word.width() != self.width {
                return Err(GemmError::config(format!(
                    "word of {} lanes stored into {}-lane memory",
                    word.width(),
                    self.width
                )));
            }
        }
        self.words[base..end].clone_from_slice(words);
        Ok(())
    }

    /// Copy `len` words starting at `base`
    pub fn load(&self, base: usize, len: usize) -> GemmResult<Vec<Word>> {
        self.words
            .get(base..base + len)
            .map(|words| words.to_vec())
            .ok_or_else(|| {
                GemmError::config(format!(
                    "load of {} words at {} runs past memory end {}",
                    len,
                    base,
                    self.words.len()
                ))
            })
    }

    /// Split into a read view of everything outside `region` and an
    /// exclusive slice of `region`
    pub fn split_region(&mut self, region: Range<usize>) -> (ReadView<'_>, &mut [Word]) {
        let (head, rest) = self.words.split_at_mut(region.start);
        let (target, tail) = rest.split_at_mut(region.end - region.start);
        let view = ReadView {
            head,
            tail,
            hole: region,
        };
        (view, target)
    }
}

/// Read-only view of memory with the output region cut out
#[derive(Debug, Clone)]
pub struct ReadView<'a> {
    head: &'a [Word],
    tail: &'a [Word],
    hole: Range<usize>,
}

impl<'a> ReadView<'a> {
    /// Word at an absolute address; `None` inside the hole or past the end
    pub fn word(&self, addr: usize) -> Option<&'a Word> {
        if addr < self.hole.start {
            self.head.get(addr)
        } else if addr >= self.hole.end {
            self.tail.get(addr - self.hole.end)
        } else {
            None
        }
    }
}

/// A half-open word range occupied by one operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub span: Range<usize>,
}

impl Region {
    /// Words touched by `rows` rows of `row_words` words spaced `stride` apart
    pub fn strided(
        name: &'static str,
        base: usize,
        rows: usize,
        row_words: usize,
        stride: usize,
    ) -> GemmResult<Self> {
        if stride < row_words {
            return Err(GemmError::config(format!(
                "{} stride {} is shorter than its {}-word rows",
                name, stride, row_words
            )));
        }
        let len = match rows {
            0 => Some(0),
            _ => (rows - 1)
                .checked_mul(stride)
                .and_then(|n| n.checked_add(row_words)),
        };
        let end = len.and_then(|len| base.checked_add(len)).ok_or_else(|| {
            GemmError::config(format!(
                "{} at word {} with {} rows of stride {} overflows the address space",
                name, base, rows, stride
            ))
        })?;
        Ok(Self {
            name,
            span: base..end,
        })
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.span.start < other.span.end && other.span.start < self.span.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(len: usize) -> LinearMemory {
        let mut memory = LinearMemory::new(len, 2);
        let words: Vec<Word> = (0..len as i64)
            .map(|i| Word::from_lanes(vec![i, -i]))
            .collect();
        memory.store(0, &words).unwrap();
        memory
    }

    #[test]
    fn test_store_and_load() {
        let memory = numbered(4);
        let words = memory.load(1, 2).unwrap();
        assert_eq!(words[0].lanes(), &[1, -1]);
        assert_eq!(words[1][0], 2);
        assert!(memory.load(3, 2).is_err());
    }

    #[test]
    fn test_store_rejects_wrong_width() {
        let mut memory = LinearMemory::new(2, 4);
        let result = memory.store(0, &[Word::zeroed(2)]);
        assert!(matches!(result, Err(GemmError::Config { .. })));
    }

    #[test]
    fn test_split_region() {
        let mut memory = numbered(6);
        let (view, target) = memory.split_region(2..4);
        assert_eq!(target.len(), 2);
        assert_eq!(view.word(1).map(|w| w[0]), Some(1));
        assert_eq!(view.word(2), None);
        assert_eq!(view.word(3), None);
        assert_eq!(view.word(4).map(|w| w[0]), Some(4));
        assert_eq!(view.word(6), None);

        target[0] = Word::from_lanes(vec![7, 7]);
        assert_eq!(memory.word(2).map(|w| w[1]), Some(7));
    }

    #[test]
    fn test_region_overlap() {
        let a = Region::strided("A", 0, 4, 2, 2).unwrap();
        let b = Region::strided("B", 8, 2, 1, 3).unwrap();
        assert_eq!(a.span, 0..8);
        assert_eq!(b.span, 8..12);
        assert!(!a.overlaps(&b));

        let c = Region::strided("C", 7, 1, 1, 1).unwrap();
        assert!(a.overlaps(&c));
        assert!(Region::strided("A", 0, 2, 3, 2).is_err());
    }

    #[test]
    fn test_region_overflow_is_config_error() {
        assert!(matches!(
            Region::strided("A", 0, usize::MAX, 2, 4),
            Err(GemmError::Config { .. })
        ));
        assert!(matches!(
            Region::strided("B", usize::MAX, 2, 1, 1),
            Err(GemmError::Config { .. })
        ));
    }

    #[test]
    fn test_empty_memory() {
        assert!(LinearMemory::new(0, 4).is_empty());
        assert!(!numbered(1).is_empty());
    }
}
