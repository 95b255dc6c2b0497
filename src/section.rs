//! Array subset descriptions: one [`Range`] per dimension, grouped into a
//! [`Section`].

use crate::error::Error;

/// An inclusive, strided span over a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub first: u64,
    pub last: u64,
    pub stride: u64,
}

impl Range {
    pub fn new(first: u64, last: u64, stride: u64) -> Result<Self, Error> {
        if stride == 0 {
            return Err(Error::InvalidRange("stride must be positive".to_string()));
        }
        if last < first {
            return Err(Error::InvalidRange(format!(
                "last {last} precedes first {first}"
            )));
        }
        Ok(Self { first, last, stride })
    }

    /// The whole of a dimension of `length` elements. A zero-length
    /// dimension yields the empty range (`first > last`), which only
    /// this constructor can produce.
    pub fn whole(length: u64) -> Self {
        Self {
            first: if length == 0 { 1 } else { 0 },
            last: length.saturating_sub(1),
            stride: 1,
        }
    }

    /// Number of selected indices.
    pub fn len(&self) -> u64 {
        if self.last < self.first {
            return 0;
        }
        (self.last - self.first) / self.stride + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    /// Index of the `i`th selected element.
    pub fn element(&self, i: u64) -> u64 {
        self.first + i * self.stride
    }

    fn check_bounds(&self, length: u64, dim: usize) -> Result<(), Error> {
        if self.last >= length {
            return Err(Error::InvalidRange(format!(
                "range {}..={} (stride {}) exceeds dimension {} of length {}",
                self.first, self.last, self.stride, dim, length
            )));
        }
        Ok(())
    }
}

/// An ordered list of ranges, one per variable dimension. A `None` entry
/// means "the entire dimension".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    pub ranges: Vec<Option<Range>>,
}

impl Section {
    pub fn new(ranges: Vec<Option<Range>>) -> Self {
        Self { ranges }
    }

    /// Selects everything: a rank-length list of `None`.
    pub fn all(rank: usize) -> Self {
        Self {
            ranges: vec![None; rank],
        }
    }

    pub fn rank(&self) -> usize {
        self.ranges.len()
    }

    /// Resolves `None` entries to whole-dimension ranges and validates
    /// every range against `shape`.
    pub fn resolve(&self, shape: &[u64]) -> Result<Vec<Range>, Error> {
        if self.ranges.len() != shape.len() {
            return Err(Error::InvalidRange(format!(
                "section rank {} does not match variable rank {}",
                self.ranges.len(),
                shape.len()
            )));
        }
        let mut out = Vec::with_capacity(shape.len());
        for (dim, (r, &len)) in self.ranges.iter().zip(shape).enumerate() {
            let resolved = match r {
                None => Range::whole(len),
                Some(r) => {
                    r.check_bounds(len, dim)?;
                    *r
                }
            };
            out.push(resolved);
        }
        Ok(out)
    }

    /// Shape of the selected subset.
    pub fn shape(&self, full_shape: &[u64]) -> Result<Vec<u64>, Error> {
        Ok(self.resolve(full_shape)?.iter().map(Range::len).collect())
    }

    pub fn num_elements(&self, full_shape: &[u64]) -> Result<u64, Error> {
        Ok(self.resolve(full_shape)?.iter().map(Range::len).product())
    }

    /// Composes a request (`inner`, expressed in the coordinates of the
    /// already-sectioned view described by `self`) into a section over
    /// the original variable. Bounds are re-validated against
    /// `original_shape`, not the derived shape.
    pub fn compose(&self, inner: &Section, original_shape: &[u64]) -> Result<Section, Error> {
        let outer = self.resolve(original_shape)?;
        if inner.ranges.len() != outer.len() {
            return Err(Error::InvalidRange(format!(
                "composed section rank {} does not match rank {}",
                inner.ranges.len(),
                outer.len()
            )));
        }
        let mut ranges = Vec::with_capacity(outer.len());
        for (dim, (o, i)) in outer.iter().zip(&inner.ranges).enumerate() {
            let r = match i {
                None => *o,
                Some(i) => {
                    if i.last >= o.len() {
                        return Err(Error::InvalidRange(format!(
                            "inner range {}..={} exceeds derived dimension {} of length {}",
                            i.first,
                            i.last,
                            dim,
                            o.len()
                        )));
                    }
                    let first = o.first + i.first * o.stride;
                    let last = o.first + i.last * o.stride;
                    let r = Range::new(first, last, o.stride * i.stride)?;
                    r.check_bounds(original_shape[dim], dim)?;
                    r
                }
            };
            ranges.push(Some(r));
        }
        Ok(Section { ranges })
    }

    /// True when every resolved range is a full, unit-stride dimension.
    pub fn is_whole(&self, shape: &[u64]) -> Result<bool, Error> {
        Ok(self
            .resolve(shape)?
            .iter()
            .zip(shape)
            .all(|(r, &len)| r.first == 0 && r.stride == 1 && r.last + 1 == len))
    }

    /// True when any resolved range has stride other than 1.
    pub fn has_stride(&self, shape: &[u64]) -> Result<bool, Error> {
        Ok(self.resolve(shape)?.iter().any(|r| r.stride != 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_and_elements() {
        let r = Range::new(1, 7, 3).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r.element(0), 1);
        assert_eq!(r.element(2), 7);
        assert!(Range::new(3, 1, 1).is_err());
        assert!(Range::new(0, 0, 0).is_err());
    }

    #[test]
    fn resolve_fills_whole_dimensions() {
        let s = Section::new(vec![None, Some(Range::new(1, 2, 1).unwrap())]);
        let resolved = s.resolve(&[4, 5]).unwrap();
        assert_eq!(resolved[0], Range::whole(4));
        assert_eq!(resolved[1].len(), 2);
        assert_eq!(s.shape(&[4, 5]).unwrap(), vec![4, 2]);
    }

    #[test]
    fn zero_length_dimension_resolves_to_empty() {
        let whole = Range::whole(0);
        assert!(whole.is_empty());
        assert_eq!(whole.len(), 0);
        let s = Section::all(2);
        assert_eq!(s.shape(&[0, 3]).unwrap(), vec![0, 3]);
        assert_eq!(s.num_elements(&[0, 3]).unwrap(), 0);
        // An explicit range over a zero-length dimension is out of bounds.
        let s = Section::new(vec![Some(Range::new(0, 0, 1).unwrap())]);
        assert!(s.resolve(&[0]).is_err());
    }

    #[test]
    fn resolve_rejects_out_of_bounds() {
        let s = Section::new(vec![Some(Range::new(0, 4, 1).unwrap())]);
        assert!(matches!(s.resolve(&[4]), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn resolve_rejects_rank_mismatch() {
        assert!(Section::all(2).resolve(&[4]).is_err());
    }

    #[test]
    fn compose_offsets_and_multiplies() {
        // Derived view: rows 2..=8 stride 2 of a length-10 axis.
        let outer = Section::new(vec![Some(Range::new(2, 8, 2).unwrap())]);
        // Request elements 1..=3 of the 4-element view.
        let inner = Section::new(vec![Some(Range::new(1, 3, 1).unwrap())]);
        let composed = outer.compose(&inner, &[10]).unwrap();
        assert_eq!(composed.ranges[0], Some(Range::new(4, 8, 2).unwrap()));
    }

    #[test]
    fn compose_validates_against_original_shape() {
        let outer = Section::new(vec![Some(Range::new(2, 8, 2).unwrap())]);
        // Element 4 is outside the 4-element derived view.
        let inner = Section::new(vec![Some(Range::new(0, 4, 1).unwrap())]);
        assert!(outer.compose(&inner, &[10]).is_err());
    }

    #[test]
    fn whole_and_stride_predicates() {
        assert!(Section::all(2).is_whole(&[3, 4]).unwrap());
        assert!(!Section::all(1).has_stride(&[5]).unwrap());
        let strided = Section::new(vec![Some(Range::new(0, 4, 2).unwrap())]);
        assert!(strided.has_stride(&[5]).unwrap());
        assert!(!strided.is_whole(&[5]).unwrap());
    }
}
