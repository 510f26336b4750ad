use super::{Name, PlainShape};

/// A method name paired with the shape overload it is declared (or called)
/// with. The dispatch table packer groups methods by `Selector` and treats
/// every distinct `(name, shape)` pair as one column to place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector<S> {
    name: Name,
    shape: S,
}

impl<S> Selector<S> {
    pub fn new(name: Name, shape: S) -> Self {
        Self { name, shape }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn shape(&self) -> &S {
        &self.shape
    }
}

/// The selector form used at dispatch-table build time: a name paired with
/// the plain (post-stub) call shape it resolves to.
pub type DispatchSelector = Selector<PlainShape>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::CallShape;

    #[test]
    fn selectors_with_equal_name_and_shape_are_equal() {
        let a = DispatchSelector::new("foo".into(), CallShape::positional(1).to_plain_shape());
        let b = DispatchSelector::new("foo".into(), CallShape::positional(1).to_plain_shape());
        assert_eq!(a, b);
    }

    #[test]
    fn selectors_differ_by_shape() {
        let a = DispatchSelector::new("foo".into(), CallShape::positional(1).to_plain_shape());
        let b = DispatchSelector::new("foo".into(), CallShape::positional(2).to_plain_shape());
        assert_ne!(a, b);
    }
}
