use super::Name;

/// The shape of a call: how many positional arguments, how many of those
/// are blocks, and which trailing arguments are named.
///
/// Names are sorted section-wise: non-block names alphabetically, then
/// block names alphabetically. `named_block_count` tells where the split
/// falls within `names`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallShape {
    arity: usize,
    total_block_count: usize,
    names: Vec<Name>,
    named_block_count: usize,
    is_setter: bool,
}

impl CallShape {
    /// A call shape for a plain positional call, e.g. a static function call
    /// with no named or block arguments.
    pub fn positional(arity: usize) -> Self {
        Self {
            arity,
            total_block_count: 0,
            names: Vec::new(),
            named_block_count: 0,
            is_setter: false,
        }
    }

    /// Build a shape from its full description. Panics (debug-only) if
    /// `names` is not sorted section-wise, matching the source invariant.
    pub fn new(
        arity: usize,
        total_block_count: usize,
        names: Vec<Name>,
        named_block_count: usize,
        is_setter: bool,
    ) -> Self {
        debug_assert!(named_block_count <= names.len());
        debug_assert!(names.len() <= arity);
        debug_assert!(total_block_count <= arity);
        let shape = Self {
            arity,
            total_block_count,
            names,
            named_block_count,
            is_setter,
        };
        debug_assert!(shape.names_are_sorted());
        shape
    }

    pub fn for_static_getter() -> Self {
        Self::positional(0)
    }

    pub fn for_static_setter() -> Self {
        Self {
            is_setter: true,
            ..Self::positional(1)
        }
    }

    pub fn for_instance_getter() -> Self {
        Self::positional(1)
    }

    pub fn for_instance_setter() -> Self {
        Self {
            is_setter: true,
            ..Self::positional(2)
        }
    }

    pub fn with_implicit_this(&self) -> Self {
        Self::new(
            self.arity + 1,
            self.total_block_count,
            self.names.clone(),
            self.named_block_count,
            self.is_setter,
        )
    }

    pub fn without_implicit_this(&self) -> Self {
        debug_assert!(self.unnamed_non_block_count() > 0);
        Self::new(
            self.arity - 1,
            self.total_block_count,
            self.names.clone(),
            self.named_block_count,
            self.is_setter,
        )
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_setter(&self) -> bool {
        self.is_setter
    }

    pub fn total_block_count(&self) -> usize {
        self.total_block_count
    }

    pub fn named_block_count(&self) -> usize {
        self.named_block_count
    }

    pub fn unnamed_block_count(&self) -> usize {
        self.total_block_count - self.named_block_count
    }

    pub fn named_non_block_count(&self) -> usize {
        self.names.len() - self.named_block_count
    }

    pub fn unnamed_non_block_count(&self) -> usize {
        self.arity - self.names.len() - self.unnamed_block_count()
    }

    pub fn names(&self) -> &[Name] {
        &self.names
    }

    /// Mutable access for in-place parameter renaming (see
    /// `ResolutionShape::dedup_named_parameters`). Does not re-sort: callers
    /// must preserve the section-wise sort invariant themselves.
    pub fn names_mut(&mut self) -> &mut [Name] {
        &mut self.names
    }

    pub fn has_named_arguments(&self) -> bool {
        !self.names.is_empty()
    }

    /// Whether positional argument `i` (0-indexed, in call order) is a block.
    pub fn is_block(&self, i: usize) -> bool {
        let unnamed_args_count = self.arity - self.names.len();
        let unnamed_block_count = self.unnamed_block_count();
        let unnamed_non_blocks = unnamed_args_count - unnamed_block_count;
        if i < unnamed_non_blocks {
            false
        } else if i < unnamed_args_count {
            true
        } else {
            i >= self.arity - self.named_block_count
        }
    }

    /// The name of argument `i`, if it is named.
    pub fn name_for(&self, i: usize) -> Option<&str> {
        let unnamed_args_count = self.arity - self.names.len();
        if i < unnamed_args_count {
            None
        } else {
            Some(&self.names[i - unnamed_args_count])
        }
    }

    fn names_are_sorted(&self) -> bool {
        let non_block = &self.names[..self.names.len() - self.named_block_count];
        let block = &self.names[self.names.len() - self.named_block_count..];
        non_block.windows(2).all(|w| w[0] <= w[1]) && block.windows(2).all(|w| w[0] <= w[1])
    }

    /// This shape, assuming it has no optional parameters: a `CallShape`
    /// with no optionals is already its own plain form.
    pub fn to_plain_shape(&self) -> super::PlainShape {
        super::PlainShape::new(self.clone())
    }
}

/// Total order matching the source's `CallShape::less`, used to keep
/// selector/shape maps (and thus row-displacement packing) deterministic.
impl PartialOrd for CallShape {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CallShape {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.is_setter
            .cmp(&other.is_setter)
            .then(self.arity.cmp(&other.arity))
            .then(self.total_block_count.cmp(&other.total_block_count))
            .then(self.named_block_count.cmp(&other.named_block_count))
            .then(self.names.cmp(&other.names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_shape_has_no_names() {
        let shape = CallShape::positional(3);
        assert_eq!(shape.arity(), 3);
        assert_eq!(shape.unnamed_non_block_count(), 3);
        assert!(!shape.has_named_arguments());
    }

    #[test]
    fn named_args_are_reported_in_call_order() {
        // foo(a, --named b) -> arity 2, one name "named" occupying slot 1.
        let shape = CallShape::new(2, 0, vec!["named".into()], 0, false);
        assert_eq!(shape.name_for(0), None);
        assert_eq!(shape.name_for(1), Some("named"));
        assert!(!shape.is_block(0));
        assert!(!shape.is_block(1));
    }

    #[test]
    fn block_detection_respects_named_block_section() {
        // arity 3: one unnamed non-block, one unnamed block, one named block.
        let shape = CallShape::new(3, 2, vec!["onblock".into()], 1, false);
        assert!(!shape.is_block(0));
        assert!(shape.is_block(1));
        assert!(shape.is_block(2));
        assert_eq!(shape.name_for(2), Some("onblock"));
    }

    #[test]
    fn ordering_prioritizes_setter_then_arity() {
        let getter = CallShape::for_static_getter();
        let setter = CallShape::for_static_setter();
        assert!(getter < setter);
    }
}
