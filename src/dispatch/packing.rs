//! Steps 2-6 of dispatch-table build: selector collection, row building,
//! row-displacement fitting, leftover packing, and shortcut offsets (§4.3).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use indexmap::IndexSet;

use crate::emitter::Operator;
use crate::ir::{ClassRef, Expr, MethodRef, Program};
use crate::shape::{CallShape, DispatchSelector};

/// One selector's worth of overriding declarations, most-specific holder
/// first (guaranteed by the class-id pre-ordering: deeper subclasses were
/// assigned higher ids by `class_ids::assign_class_ids`).
#[derive(Debug, Clone)]
pub struct SelectorRow {
    pub selector: DispatchSelector,
    pub members: Vec<(ClassRef, MethodRef)>,
    pub begin: u16,
    pub end: u16,
}

impl SelectorRow {
    fn size(&self) -> usize {
        (self.end - self.begin) as usize
    }
}

/// Walks every method body (including nested blocks/lambdas) collecting the
/// `DispatchSelector` of each virtual call site (§4.3 step 2), plus every
/// interface's synthetic `is-<Name>` selector assigned by stub synthesis —
/// `IS_INTERFACE`/`AS_INTERFACE` resolve through the same dispatch-table row
/// machinery as an ordinary virtual call, so that selector needs a row too
/// even though no `CallVirtual` node ever names it directly.
pub fn collect_selectors(program: &Program) -> IndexSet<DispatchSelector> {
    let mut selectors = IndexSet::new();
    for method in &program.methods {
        if let Some(body) = &method.body {
            collect_from_expr(body, &mut selectors);
        }
    }
    for class in &program.classes {
        if let Some(name) = &class.interface_typecheck_selector {
            let shape = CallShape::positional(0).with_implicit_this().to_plain_shape();
            selectors.insert(DispatchSelector::new(name.clone(), shape));
        }
    }
    selectors
}

fn collect_from_expr(expr: &Expr, out: &mut IndexSet<DispatchSelector>) {
    match expr {
        Expr::CallVirtual { selector_name, shape, receiver, args, .. } => {
            out.insert(DispatchSelector::new(selector_name.clone(), shape.clone().to_plain_shape()));
            collect_from_expr(receiver, out);
            for a in args {
                collect_from_expr(a, out);
            }
        }
        Expr::Sequence(items) => items.iter().for_each(|e| collect_from_expr(e, out)),
        Expr::LiteralNode(_) | Expr::LocalRef(_) | Expr::ParameterRef(_) | Expr::GlobalRef(_) | Expr::OuterRef { .. } => {}
        Expr::FieldRef { receiver, .. } => collect_from_expr(receiver, out),
        Expr::LocalStore(_, v) => collect_from_expr(v, out),
        Expr::FieldStore { receiver, value, .. } => {
            collect_from_expr(receiver, out);
            collect_from_expr(value, out);
        }
        Expr::GlobalStore(_, v) => collect_from_expr(v, out),
        Expr::OuterStore { value, .. } => collect_from_expr(value, out),
        Expr::Typecheck { value, .. } => collect_from_expr(value, out),
        Expr::If { condition, then_branch, else_branch } => {
            collect_from_expr(condition, out);
            collect_from_expr(then_branch, out);
            collect_from_expr(else_branch, out);
        }
        Expr::LogicalBinary { lhs, rhs, .. } => {
            collect_from_expr(lhs, out);
            collect_from_expr(rhs, out);
        }
        Expr::Not(e) => collect_from_expr(e, out),
        Expr::While { condition, body, update } => {
            collect_from_expr(condition, out);
            collect_from_expr(body, out);
            collect_from_expr(update, out);
        }
        Expr::LoopBranch { .. } => {}
        Expr::CodeLiteral(code) => collect_from_expr(&code.body, out),
        Expr::Return(v) | Expr::NonLocalReturn(v) => {
            if let Some(v) = v {
                collect_from_expr(v, out);
            }
        }
        Expr::TryFinally { body, handler } => {
            collect_from_expr(body, out);
            collect_from_expr(handler, out);
        }
        Expr::Throw(e) => collect_from_expr(e, out),
        Expr::Halt(_, v) => {
            if let Some(v) = v {
                collect_from_expr(v, out);
            }
        }
        Expr::CallStatic { args, .. } | Expr::CallIntrinsic { args, .. } | Expr::CallPrimitive { args, .. } => {
            args.iter().for_each(|a| collect_from_expr(a, out));
        }
        Expr::CallBlock { block, args } => {
            collect_from_expr(block, out);
            args.iter().for_each(|a| collect_from_expr(a, out));
        }
        Expr::Allocate(_) => {}
    }
}

/// Step 3: build one row per selector, recording every class that declares
/// (not merely inherits) a matching override.
pub fn build_rows(program: &Program, selectors: &IndexSet<DispatchSelector>) -> Vec<SelectorRow> {
    let mut rows = Vec::new();
    for selector in selectors {
        let mut members = Vec::new();
        for (index, class) in program.classes.iter().enumerate() {
            let class_ref = ClassRef(index);
            for &method_ref in &class.methods {
                let method = program.method(method_ref);
                if method.holder != Some(class_ref) || method.name != *selector.name() {
                    continue;
                }
                if let Some(plain) = method.shape.as_plain() {
                    if plain == selector.shape() {
                        members.push((class_ref, method_ref));
                        break;
                    }
                }
            }
        }
        if members.is_empty() {
            continue;
        }
        let begin = members.iter().map(|(c, _)| program.class(*c).start_id()).min().unwrap();
        let end = members.iter().map(|(c, _)| program.class(*c).end_id()).max().unwrap();
        members.sort_by_key(|(c, _)| std::cmp::Reverse(program.class(*c).start_id()));
        rows.push(SelectorRow {
            selector: selector.clone(),
            members,
            begin,
            end,
        });
    }
    sort_rows(&mut rows);
    rows
}

/// Row order heuristic from §4.3 step 3: `operator==` last, then by
/// decreasing size, then by decreasing begin — known empirically to reduce
/// total holes in row-displacement packing.
fn sort_rows(rows: &mut [SelectorRow]) {
    rows.sort_by(|a, b| {
        let a_eq = a.selector.name() == Operator::Eq.selector_name();
        let b_eq = b.selector.name() == Operator::Eq.selector_name();
        a_eq.cmp(&b_eq)
            .then(b.size().cmp(&a.size()))
            .then(b.begin.cmp(&a.begin))
    });
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Hole {
    size: usize,
    at: usize,
}

impl Ord for Hole {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size.cmp(&other.size).then(other.at.cmp(&self.at))
    }
}

impl PartialOrd for Hole {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The product of steps 4-5: a flat table of method slots plus each
/// selector's chosen offset.
pub struct PackedTable {
    pub table: Vec<Option<MethodRef>>,
}

/// Step 4: row-displacement packing. Returns, per row (in the order given),
/// its chosen offset; also fills `table` in place.
pub fn fit_rows(program: &Program, rows: &[SelectorRow], initial_capacity: usize) -> (PackedTable, Vec<isize>) {
    let mut table: Vec<Option<MethodRef>> = Vec::with_capacity(initial_capacity);
    let mut holes: BinaryHeap<Hole> = BinaryHeap::new();
    let mut used_offsets: HashSet<isize> = HashSet::new();
    let mut offsets = Vec::with_capacity(rows.len());

    for row in rows {
        let size = row.size();
        let mut start = pop_hole_of_at_least(&mut holes, size).unwrap_or(table.len());
        let mut offset = start as isize - row.begin as isize;
        if offset < 0 {
            start = row.begin as usize;
            offset = 0;
        }
        while used_offsets.contains(&offset) {
            holes.push(Hole { size: 1, at: start });
            start += 1;
            offset += 1;
        }
        used_offsets.insert(offset);
        offsets.push(offset);

        let needed_len = offset as usize + row.end as usize;
        if table.len() < needed_len {
            table.resize(needed_len, None);
        }

        let mut filled_right_edge: Vec<usize> = Vec::new();
        for &(holder, method_ref) in &row.members {
            let holder_class = program.class(holder);
            let lo = offset as usize + holder_class.start_id() as usize;
            let hi = offset as usize + holder_class.end_id() as usize;
            let mut id = lo;
            while id < hi {
                if table[id].is_none() {
                    table[id] = Some(method_ref);
                    id += 1;
                } else {
                    // Already filled by a more specific override: skip to
                    // the end of that override's own sub-range.
                    while let Some(&edge) = filled_right_edge.last() {
                        if edge <= id {
                            filled_right_edge.pop();
                        } else {
                            break;
                        }
                    }
                    id = filled_right_edge.last().copied().unwrap_or(id + 1).max(id + 1);
                }
            }
            filled_right_edge.push(hi);
        }

        assert!(
            table[offset as usize + row.end as usize - 1].is_some(),
            "selector row right edge left null after fill"
        );

        // Step 5 tail: any null slot left inside the row's own range becomes
        // a fresh hole for a later row to claim.
        let mut hole_start: Option<usize> = None;
        for id in (offset as usize + row.begin as usize)..(offset as usize + row.end as usize) {
            if table[id].is_none() {
                hole_start.get_or_insert(id);
            } else if let Some(hs) = hole_start.take() {
                holes.push(Hole { size: id - hs, at: hs });
            }
        }
        if let Some(hs) = hole_start {
            holes.push(Hole {
                size: offset as usize + row.end as usize - hs,
                at: hs,
            });
        }
    }

    (PackedTable { table }, offsets)
}

fn pop_hole_of_at_least(holes: &mut BinaryHeap<Hole>, size: usize) -> Option<usize> {
    let top = *holes.peek()?;
    if top.size >= size {
        holes.pop();
        Some(top.at)
    } else {
        None
    }
}

/// Step 5: methods reachable only via super-calls or direct optimized calls
/// and still lacking a slot get the next free null slot (or a fresh append).
pub fn pack_remaining_methods(program: &mut Program, table: &mut Vec<Option<MethodRef>>) {
    for index in 0..program.methods.len() {
        let method_ref = MethodRef(index);
        if program.method(method_ref).index_opt().is_some() {
            continue;
        }
        if program.method(method_ref).is_static_like() {
            let slot = find_or_append_null(table);
            table[slot] = Some(method_ref);
            program.method_mut(method_ref).set_index(slot);
        }
    }
    // Instance methods that already received a slot during row fitting still
    // need their `index` recorded: any slot they occupy will do, so take the
    // first one found.
    for (slot, occupant) in table.iter().enumerate() {
        if let Some(method_ref) = occupant {
            if program.method(*method_ref).index_opt().is_none() {
                program.method_mut(*method_ref).set_index(slot);
            }
        }
    }
    // Finally, any method that still has no slot at all (zero virtual calls
    // ever targeted its selector, and it is not static-like) gets packed too.
    for index in 0..program.methods.len() {
        let method_ref = MethodRef(index);
        if program.method(method_ref).index_opt().is_some() {
            continue;
        }
        let slot = find_or_append_null(table);
        table[slot] = Some(method_ref);
        program.method_mut(method_ref).set_index(slot);
    }
}

fn find_or_append_null(table: &mut Vec<Option<MethodRef>>) -> usize {
    if let Some(pos) = table.iter().position(|slot| slot.is_none()) {
        pos
    } else {
        table.push(None);
        table.len() - 1
    }
}

/// Step 6: for every built-in operator opcode, synthesize its canonical
/// selector and look up the offset the interpreter should fall back to when
/// the optimized opcode misses.
pub fn shortcut_offsets(
    program: &Program,
    selector_offsets: &indexmap::IndexMap<DispatchSelector, isize>,
) -> Vec<(Operator, Option<isize>)> {
    Operator::ALL
        .iter()
        .map(|&operator| {
            let shape = CallShape::positional(operator.arity()).to_plain_shape();
            let selector = DispatchSelector::new(operator.selector_name().to_string(), shape);
            (operator, selector_offsets.get(&selector).copied())
        })
        .collect()
}
