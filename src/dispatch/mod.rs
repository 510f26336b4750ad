//! Dispatch-table construction (§4.3): the six-step row-displacement packing
//! that turns virtual call sites into a single flat method table indexed by
//! `offset_of(selector) + receiver.class_id`.

mod class_ids;
mod packing;

pub use class_ids::assign_class_ids;
pub use packing::{build_rows, collect_selectors, fit_rows, pack_remaining_methods, shortcut_offsets, PackedTable, SelectorRow};

use indexmap::IndexMap;

use crate::config::DispatchTableConfig;
use crate::emitter::Operator;
use crate::ir::{MethodRef, Program};
use crate::shape::DispatchSelector;

/// Everything the emission pass needs to resolve a virtual call or an
/// operator shortcut to a table offset.
pub struct DispatchTable {
    pub table: Vec<Option<MethodRef>>,
    pub selector_offsets: IndexMap<DispatchSelector, isize>,
    pub operator_offsets: IndexMap<Operator, Option<isize>>,
}

impl DispatchTable {
    pub fn offset_of(&self, selector: &DispatchSelector) -> Option<isize> {
        self.selector_offsets.get(selector).copied()
    }

    pub fn slot_for(&self, class_id: u16, offset: isize) -> Option<MethodRef> {
        let index = offset + class_id as isize;
        if index < 0 {
            return None;
        }
        self.table.get(index as usize).copied().flatten()
    }
}

/// Runs the full build: class ids, selector rows, row-displacement fitting,
/// leftover packing, and operator shortcut offsets. Expects every method's
/// `Shape` to already be `Shape::Plain` (stub synthesis runs first — see the
/// driver).
pub fn build(program: &mut Program, config: &DispatchTableConfig) -> DispatchTable {
    assign_class_ids(program);

    let selectors = collect_selectors(program);
    let rows = build_rows(program, &selectors);
    let (mut packed, offsets) = fit_rows(program, &rows, config.initial_capacity);

    let mut selector_offsets = IndexMap::with_capacity(rows.len());
    for (row, offset) in rows.iter().zip(offsets) {
        selector_offsets.insert(row.selector.clone(), offset);
        for &(_, method_ref) in &row.members {
            // A method may be the most-specific override for several holders
            // in its row (e.g. it is also inherited unmodified by a
            // subclass's sub-range); `set_index` is write-once, so only the
            // first assignment sticks — subsequent ones are no-ops here and
            // get finalized by `pack_remaining_methods` instead.
            if program.method(method_ref).index_opt().is_none() {
                if let Some(slot) = find_slot(&packed.table, method_ref) {
                    program.method_mut(method_ref).set_index(slot);
                }
            }
        }
    }

    pack_remaining_methods(program, &mut packed.table);

    let operator_offsets: IndexMap<Operator, Option<isize>> = shortcut_offsets(program, &selector_offsets).into_iter().collect();

    DispatchTable {
        table: packed.table,
        selector_offsets,
        operator_offsets,
    }
}

fn find_slot(table: &[Option<MethodRef>], method_ref: MethodRef) -> Option<usize> {
    table.iter().position(|slot| *slot == Some(method_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchTableConfig;
    use crate::ir::{Class, ClassRef, Expr, Method, MethodKind, Shape};
    use crate::shape::{CallShape, PlainShape};

    fn plain(arity: usize) -> Shape {
        Shape::Plain(PlainShape::new(CallShape::positional(arity).with_implicit_this()))
    }

    /// A <- B, each defines `foo`; B's calls `a.foo()` virtually so both
    /// land in the same row.
    fn two_class_program() -> Program {
        let mut program = Program::default();
        program.classes.push(Class::new("A"));
        program.classes.push(Class::new("B"));
        program.classes[1].super_class = Some(ClassRef(0));
        for c in program.classes.iter_mut() {
            c.is_instantiated = true;
        }
        program.tree_roots = vec![ClassRef(0)];

        let mut foo_a = Method::new("foo", MethodKind::Instance, plain(1));
        foo_a.holder = Some(ClassRef(0));
        foo_a.body = Some(Expr::LiteralNode(crate::ir::Literal::Null));
        program.methods.push(foo_a);
        program.classes[0].methods.push(MethodRef(0));

        let mut foo_b = Method::new("foo", MethodKind::Instance, plain(1));
        foo_b.holder = Some(ClassRef(1));
        foo_b.body = Some(Expr::LiteralNode(crate::ir::Literal::Null));
        program.methods.push(foo_b);
        program.classes[1].methods.push(MethodRef(1));

        let mut caller = Method::new("use_foo", MethodKind::Static, plain(1));
        caller.body = Some(Expr::CallVirtual {
            selector_name: "foo".into(),
            shape: CallShape::positional(1).with_implicit_this(),
            kind: crate::emitter::InvokeVirtualKind::Normal,
            receiver: Box::new(Expr::ParameterRef(0)),
            args: Vec::new(),
        });
        program.methods.push(caller);

        program
    }

    #[test]
    fn overriding_methods_each_get_their_own_class_range_slot() {
        let mut program = two_class_program();
        let config = DispatchTableConfig::default();
        let table = build(&mut program, &config);

        assert_eq!(program.method(MethodRef(0)).index(), program.method(MethodRef(0)).index());
        let a_id = program.class(ClassRef(0)).id();
        let b_id = program.class(ClassRef(1)).id();

        let selector = DispatchSelector::new("foo".into(), CallShape::positional(1).with_implicit_this().to_plain_shape());
        let offset = table.offset_of(&selector).expect("foo selector has a row");
        assert_eq!(table.slot_for(a_id, offset), Some(MethodRef(0)));
        assert_eq!(table.slot_for(b_id, offset), Some(MethodRef(1)));
    }

    #[test]
    fn static_methods_get_a_slot_outside_any_row() {
        let mut program = two_class_program();
        let config = DispatchTableConfig::default();
        build(&mut program, &config);
        assert!(program.method(MethodRef(2)).index_opt().is_some());
    }

    #[test]
    fn every_method_ends_up_with_an_index() {
        let mut program = two_class_program();
        let config = DispatchTableConfig::default();
        build(&mut program, &config);
        for method in &program.methods {
            assert!(method.index_opt().is_some());
        }
    }
}
