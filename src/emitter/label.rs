//! Two-tier label system: an in-function `Label` patches a 16-bit forward
//! displacement once its target bci is known; an `AbsoluteLabel` additionally
//! accepts uses recorded from *nested* functions (blocks/lambdas) whose
//! bytecode has already been placed in the image, and resolves them once the
//! label's own owning function is placed too. See §4.2 / §3.

use std::cell::RefCell;
use std::rc::Rc;

use crate::image::ProgramImageSink;

/// A pending forward branch: the byte offset of its 16-bit displacement
/// field, and the stack height in effect at the branch site. The height is
/// recorded so `Label::bind` can assert it matches the height at the bind
/// site, per the Testable Properties in §8 ("the expected stack height at a
/// label bind differs from its use" is a fatal invariant violation).
struct PendingUse {
    displacement_at: usize,
    height: usize,
}

/// A forward/back patch target within one function's bytecode buffer.
#[derive(Default)]
pub struct Label {
    bound_at: Option<usize>,
    bound_height: Option<usize>,
    pending: Vec<PendingUse>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.bound_at.is_some()
    }

    pub fn bound_bci(&self) -> Option<usize> {
        self.bound_at
    }

    /// Record a forward use: `displacement_at` is the offset of the 16-bit
    /// placeholder already written into the buffer (big-endian zero bytes).
    pub(super) fn add_pending_use(&mut self, displacement_at: usize, height: usize) {
        assert!(!self.is_bound(), "forward use recorded after label was bound");
        self.pending.push(PendingUse {
            displacement_at,
            height,
        });
    }

    /// Bind this label at `bci` with the given stack height, patching every
    /// pending forward use's 16-bit displacement in `bytes`.
    pub(super) fn bind(&mut self, bytes: &mut [u8], bci: usize, height: usize) {
        assert!(!self.is_bound(), "label bound twice");
        for use_ in &self.pending {
            assert_eq!(
                use_.height, height,
                "label bind height {height} disagrees with use height {}",
                use_.height
            );
            let displacement = (bci - use_.displacement_at) as u16;
            bytes[use_.displacement_at..use_.displacement_at + 2]
                .copy_from_slice(&displacement.to_be_bytes());
        }
        self.bound_at = Some(bci);
        self.bound_height = Some(height);
    }
}

/// One cross-function use: the already-resolved absolute bci of a 32-bit
/// placeholder living in some other (already-placed) function's bytecode.
struct AbsoluteUse {
    absolute_placeholder_bci: u32,
}

struct AbsoluteReferenceInner {
    local_label: Label,
    uses: Vec<AbsoluteUse>,
}

/// A label bound within one function but reachable from nested
/// blocks/lambdas via a non-local branch. Cheap to create; if no nested
/// scope ever references it, `resolve` patches nothing.
#[derive(Clone)]
pub struct AbsoluteLabel {
    inner: Rc<RefCell<AbsoluteReferenceInner>>,
}

impl Default for AbsoluteLabel {
    fn default() -> Self {
        Self::new()
    }
}

impl AbsoluteLabel {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AbsoluteReferenceInner {
                local_label: Label::new(),
                uses: Vec::new(),
            })),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.borrow().local_label.is_bound()
    }

    pub(super) fn local_label_mut(&self) -> std::cell::RefMut<'_, Label> {
        std::cell::RefMut::map(self.inner.borrow_mut(), |i| &mut i.local_label)
    }

    /// Record a non-local branch whose 32-bit placeholder sits at
    /// `absolute_placeholder_bci` in the final image (the owning function of
    /// that placeholder must already have been placed for this to be a
    /// valid absolute bci).
    pub fn record_absolute_use(&self, absolute_placeholder_bci: u32) {
        self.inner.borrow_mut().uses.push(AbsoluteUse {
            absolute_placeholder_bci,
        });
    }

    /// Resolve every recorded absolute use once the owning function's base
    /// bci is known: `target = base_bci + local_bci`, patched into each
    /// use's placeholder via the image sink.
    pub fn resolve(&self, base_bci: u32, sink: &mut dyn ProgramImageSink) {
        let inner = self.inner.borrow();
        let local_bci = inner
            .local_label
            .bound_bci()
            .expect("absolute label resolved before it was bound") as u32;
        let target = base_bci + local_bci;
        for use_ in &inner.uses {
            sink.patch_uint32_at(use_.absolute_placeholder_bci, target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_bind_patches_pending_forward_use() {
        let mut bytes = vec![0u8, 0, 0, 0, 0];
        let mut label = Label::new();
        label.add_pending_use(1, 0);
        label.bind(&mut bytes, 4, 0);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 3);
    }

    #[test]
    #[should_panic(expected = "disagrees")]
    fn label_bind_height_mismatch_panics() {
        let mut bytes = vec![0u8; 4];
        let mut label = Label::new();
        label.add_pending_use(1, 2);
        label.bind(&mut bytes, 3, 0);
    }
}
