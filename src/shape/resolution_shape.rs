use bitvec::vec::BitVec;

use super::{CallShape, Name, PlainShape};

/// The shape a method takes as written, before stub synthesis. Unlike
/// `PlainShape`, a `ResolutionShape` may describe many acceptable call
/// shapes at once: some unnamed parameters may be optional, and some named
/// parameters may have default values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionShape {
    call_shape: CallShape,
    optional_unnamed_count: usize,
    /// One bit per entry in `call_shape.names()`, in the same order: set if
    /// that named parameter has a default value and may be omitted.
    optional_names: BitVec,
}

impl ResolutionShape {
    /// A resolution shape for a static function with `arity` required,
    /// non-block, unnamed parameters and no optionals.
    pub fn new(arity: usize) -> Self {
        Self {
            call_shape: CallShape::positional(arity),
            optional_unnamed_count: 0,
            optional_names: BitVec::new(),
        }
    }

    pub fn from_call_shape(
        call_shape: CallShape,
        optional_unnamed_count: usize,
        optional_names: BitVec,
    ) -> Self {
        debug_assert_eq!(optional_names.len(), call_shape.names().len());
        debug_assert!(optional_unnamed_count <= call_shape.unnamed_non_block_count());
        Self {
            call_shape,
            optional_unnamed_count,
            optional_names,
        }
    }

    pub fn is_setter(&self) -> bool {
        self.call_shape.is_setter()
    }

    /// Upper bound on arity: every parameter supplied, including optionals.
    pub fn max_arity(&self) -> usize {
        self.call_shape.arity()
    }

    pub fn total_block_count(&self) -> usize {
        self.call_shape.total_block_count()
    }

    pub fn min_unnamed_non_block(&self) -> usize {
        self.call_shape.unnamed_non_block_count() - self.optional_unnamed_count
    }

    pub fn max_unnamed_non_block(&self) -> usize {
        self.call_shape.unnamed_non_block_count()
    }

    pub fn unnamed_block_count(&self) -> usize {
        self.call_shape.unnamed_block_count()
    }

    pub fn named_block_count(&self) -> usize {
        self.call_shape.named_block_count()
    }

    pub fn names(&self) -> &[Name] {
        self.call_shape.names()
    }

    pub fn optional_names(&self) -> &BitVec {
        &self.optional_names
    }

    pub fn has_optional_parameters(&self) -> bool {
        if self.is_setter() {
            return false;
        }
        self.optional_unnamed_count != 0 || self.optional_names.any()
    }

    fn required_names(&self) -> impl Iterator<Item = &Name> {
        self.names()
            .iter()
            .zip(self.optional_names.iter())
            .filter(|(_, optional)| !**optional)
            .map(|(name, _)| name)
    }

    /// Whether a call of the given shape would resolve to this method: the
    /// unnamed non-block count falls in range, the block counts match
    /// exactly, every call-site named argument is declared by the method,
    /// and every non-optional named parameter is supplied.
    pub fn accepts(&self, call: &CallShape) -> bool {
        if self.is_setter() != call.is_setter() {
            return false;
        }
        let unnamed_non_block = call.unnamed_non_block_count();
        if unnamed_non_block < self.min_unnamed_non_block()
            || unnamed_non_block > self.max_unnamed_non_block()
        {
            return false;
        }
        if call.unnamed_block_count() != self.unnamed_block_count() {
            return false;
        }
        if call.named_block_count() != self.named_block_count() {
            return false;
        }
        for name in call.names() {
            if !self.names().iter().any(|n| n == name) {
                return false;
            }
        }
        for required in self.required_names() {
            if !call.names().iter().any(|n| n == required) {
                return false;
            }
        }
        true
    }

    /// Whether some call shape would be accepted by both `self` and `other`.
    ///
    /// Both must require the same block counts (a call's block counts are
    /// exact, not ranged), the union of each side's required names must fit
    /// inside the intersection of both sides' declared names, and the
    /// unnamed-non-block ranges must intersect.
    pub fn overlaps_with(&self, other: &ResolutionShape) -> bool {
        if self.is_setter() != other.is_setter() {
            return false;
        }
        if self.unnamed_block_count() != other.unnamed_block_count() {
            return false;
        }
        if self.named_block_count() != other.named_block_count() {
            return false;
        }
        let min = self.min_unnamed_non_block().max(other.min_unnamed_non_block());
        let max = self.max_unnamed_non_block().min(other.max_unnamed_non_block());
        if min > max {
            return false;
        }
        let self_names: Vec<&Name> = self.names().iter().collect();
        let other_names: Vec<&Name> = other.names().iter().collect();
        for required in self.required_names().chain(other.required_names()) {
            if !self_names.contains(&required) || !other_names.contains(&required) {
                return false;
            }
        }
        true
    }

    /// Whether every call shape this method accepts is also accepted by at
    /// least one of `overriders`. On failure, returns a witness call shape
    /// that escapes every overrider (the Rust equivalent of the source's
    /// bool-plus-out-parameter signature).
    pub fn is_fully_shadowed_by(
        &self,
        overriders: &[ResolutionShape],
    ) -> Result<(), CallShape> {
        let optional_positions: Vec<usize> = (0..self.optional_names.len())
            .filter(|&i| self.optional_names[i])
            .collect();
        let subset_count = 1usize << optional_positions.len();

        for unnamed in self.min_unnamed_non_block()..=self.max_unnamed_non_block() {
            for mask in 0..subset_count {
                let mut names: Vec<Name> = Vec::new();
                for (slot, &pos) in optional_positions.iter().enumerate() {
                    if mask & (1 << slot) != 0 {
                        names.push(self.names()[pos].clone());
                    }
                }
                for (i, name) in self.names().iter().enumerate() {
                    if !self.optional_names[i] {
                        names.push(name.clone());
                    }
                }
                names.sort();
                let named_block_count = names
                    .iter()
                    .filter(|n| self.names()[self.names().len() - self.named_block_count()..]
                        .contains(n))
                    .count();
                let candidate = CallShape::new(
                    unnamed + self.unnamed_block_count() + names.len(),
                    self.total_block_count(),
                    names,
                    named_block_count,
                    self.is_setter(),
                );
                if !self.accepts(&candidate) {
                    continue;
                }
                if !overriders.iter().any(|o| o.accepts(&candidate)) {
                    return Err(candidate);
                }
            }
        }
        Ok(())
    }

    /// `self` has no optional parameters: convert directly to a plain shape.
    /// Panics (debug-only) if optionals remain; callers should have run stub
    /// synthesis first, which is precisely the case that calls this.
    pub fn to_plain_shape(&self) -> PlainShape {
        debug_assert!(!self.has_optional_parameters());
        PlainShape::new(self.call_shape.clone())
    }

    /// The shape of the underlying implementation: every declared parameter
    /// supplied, optional or not. This is the call shape adapter stubs tail
    /// call into, regardless of how many optionals the method declares.
    pub fn full_call_shape(&self) -> CallShape {
        self.call_shape.clone()
    }

    /// Deduplicate named parameters that share a textual name by appending a
    /// disambiguating suffix (`#1`, `#2`, ...) to all but the first. This is
    /// a compatibility shim carried over from the original sources rather
    /// than a design choice: front ends may hand this backend a resolution
    /// shape with genuine duplicate names, and rejecting it outright would
    /// be a front-end concern. Diagnostic quality for the renamed parameters
    /// is not this crate's responsibility.
    pub fn dedup_named_parameters(&mut self) {
        let mut seen = std::collections::HashMap::new();
        for name in self.call_shape.names_mut() {
            let count = seen.entry(name.clone()).or_insert(0usize);
            if *count > 0 {
                *name = format!("{name}#{count}");
            }
            *count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution_with_optional_unnamed(required: usize, optional: usize) -> ResolutionShape {
        ResolutionShape {
            call_shape: CallShape::positional(required + optional),
            optional_unnamed_count: optional,
            optional_names: BitVec::new(),
        }
    }

    #[test]
    fn accepts_within_optional_range() {
        let shape = resolution_with_optional_unnamed(1, 1);
        assert!(shape.accepts(&CallShape::positional(1)));
        assert!(shape.accepts(&CallShape::positional(2)));
        assert!(!shape.accepts(&CallShape::positional(0)));
        assert!(!shape.accepts(&CallShape::positional(3)));
    }

    #[test]
    fn plain_shape_round_trip_has_no_optionals() {
        // Property from §8: for every ResolutionShape r and every CallShape
        // c generated by r.to_plain_shape().to_equivalent_call_shape(),
        // r.accepts(c) is true.
        let shape = ResolutionShape::new(3);
        let call = shape.to_plain_shape().to_equivalent_call_shape();
        assert!(shape.accepts(&call));
    }

    #[test]
    fn overlap_requires_matching_block_counts() {
        let a = resolution_with_optional_unnamed(1, 0);
        let mut b = resolution_with_optional_unnamed(1, 0);
        b.call_shape = CallShape::new(2, 1, Vec::new(), 0, false);
        assert!(!a.overlaps_with(&b));
    }

    #[test]
    fn fully_shadowed_detects_escaping_witness() {
        let wide = resolution_with_optional_unnamed(0, 2); // accepts arity 0,1,2
        let narrow = resolution_with_optional_unnamed(0, 1); // accepts arity 0,1
        let overriders = vec![narrow];
        let result = wide.is_fully_shadowed_by(&overriders);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().arity(), 2);
    }

    #[test]
    fn dedup_named_parameters_disambiguates() {
        let mut shape = ResolutionShape {
            call_shape: CallShape::new(
                2,
                0,
                vec!["x".to_string(), "x".to_string()],
                0,
                false,
            ),
            optional_unnamed_count: 0,
            optional_names: BitVec::repeat(false, 2),
        };
        shape.dedup_named_parameters();
        assert_eq!(shape.names(), &["x".to_string(), "x#1".to_string()]);
    }
}
