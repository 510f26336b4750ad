use super::{CallShape, Name};

/// A `CallShape` with the further guarantee that no parameter is optional:
/// the post-stub-synthesis signature of a method, or the signature observed
/// at a call site once adapted to its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlainShape {
    call_shape: CallShape,
}

impl PlainShape {
    pub fn new(call_shape: CallShape) -> Self {
        Self { call_shape }
    }

    pub fn is_setter(&self) -> bool {
        self.call_shape.is_setter()
    }

    pub fn arity(&self) -> usize {
        self.call_shape.arity()
    }

    pub fn total_block_count(&self) -> usize {
        self.call_shape.total_block_count()
    }

    pub fn named_block_count(&self) -> usize {
        self.call_shape.named_block_count()
    }

    pub fn unnamed_block_count(&self) -> usize {
        self.call_shape.unnamed_block_count()
    }

    pub fn names(&self) -> &[Name] {
        self.call_shape.names()
    }

    pub fn to_equivalent_call_shape(&self) -> CallShape {
        self.call_shape.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_call_shape() {
        let call = CallShape::new(2, 1, vec!["x".into()], 0, false);
        let plain = call.clone().to_plain_shape();
        assert_eq!(plain.to_equivalent_call_shape(), call);
    }
}
