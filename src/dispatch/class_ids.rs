//! Step 1 of dispatch-table build: class id assignment (§4.3).
//!
//! Classes are walked in a post-order that places each class after all its
//! subclasses (children before parents), using arena indices (`ClassRef`)
//! for the super/subclass graph rather than the source's holder/sibling
//! pointer links, per the REDESIGN FLAGS in §9. Instantiated classes get
//! descending ids from `N-1` down to `0`; uninstantiated classes get
//! descending ids from `M-1` down to `N`. `start_id`/`end_id` then mark the
//! contiguous range of *instantiated* ids within each class's own subtree.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

use crate::ir::{ClassRef, Program};

fn children_by_super(program: &Program) -> HashMap<ClassRef, Vec<ClassRef>> {
    let mut children: HashMap<ClassRef, Vec<ClassRef>> = HashMap::new();
    for (index, class) in program.classes.iter().enumerate() {
        if let Some(super_ref) = class.super_class {
            children.entry(super_ref).or_default().push(ClassRef(index));
        }
    }
    children
}

/// The super/subclass relation as a graph, one node per class in `ClassRef`
/// order, edges pointing super -> sub. `petgraph` does the DFS bookkeeping
/// (visited set, explicit stack) that the traversal itself needs; the arena
/// indices (REDESIGN FLAGS, §9) are carried as the node weights so nothing
/// downstream has to know about `NodeIndex` at all.
fn class_hierarchy_graph(program: &Program) -> (DiGraph<ClassRef, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::with_capacity(program.classes.len(), program.classes.len());
    let nodes: Vec<NodeIndex> = (0..program.classes.len()).map(|i| graph.add_node(ClassRef(i))).collect();
    for (index, class) in program.classes.iter().enumerate() {
        if let Some(super_ref) = class.super_class {
            graph.add_edge(nodes[super_ref.0], nodes[index], ());
        }
    }
    (graph, nodes)
}

fn visit_post_order(
    start: ClassRef,
    nodes: &[NodeIndex],
    graph: &DiGraph<ClassRef, ()>,
    visited: &mut [bool],
    order: &mut Vec<ClassRef>,
) {
    let mut dfs = DfsPostOrder::new(graph, nodes[start.0]);
    while let Some(node) = dfs.next(graph) {
        let class_ref = graph[node];
        if !visited[class_ref.0] {
            visited[class_ref.0] = true;
            order.push(class_ref);
        }
    }
}

fn post_order(program: &Program) -> Vec<ClassRef> {
    let (graph, nodes) = class_hierarchy_graph(program);
    let mut order = Vec::with_capacity(program.classes.len());
    let mut visited = vec![false; program.classes.len()];

    for &root in &program.tree_roots {
        visit_post_order(root, &nodes, &graph, &mut visited, &mut order);
    }
    // Defensive: any class unreachable from a declared tree root (should not
    // happen in a well-formed program) still gets an id rather than being
    // silently dropped from the table.
    for index in 0..program.classes.len() {
        visit_post_order(ClassRef(index), &nodes, &graph, &mut visited, &mut order);
    }
    order
}

/// Assigns `id`/`start_id`/`end_id` to every class in `program`. Panics if
/// any class's ids were already assigned (write-once, §5).
pub fn assign_class_ids(program: &mut Program) {
    let order = post_order(program);

    let instantiated_count = order.iter().filter(|c| program.class(**c).is_instantiated).count();
    let total_count = order.len();

    let mut ids: HashMap<ClassRef, u16> = HashMap::with_capacity(total_count);
    let mut next_instantiated = instantiated_count as u16;
    let mut next_uninstantiated = total_count as u16;
    for &c in &order {
        let id = if program.class(c).is_instantiated {
            next_instantiated -= 1;
            next_instantiated
        } else {
            next_uninstantiated -= 1;
            next_uninstantiated
        };
        ids.insert(c, id);
    }

    let children = children_by_super(program);
    let mut subtree_range: HashMap<ClassRef, Option<(u16, u16)>> = HashMap::with_capacity(total_count);
    for &c in &order {
        let mut range: Option<(u16, u16)> = None;
        if let Some(kids) = children.get(&c) {
            for kid in kids {
                if let Some((mn, mx)) = subtree_range[kid] {
                    range = Some(match range {
                        None => (mn, mx),
                        Some((cur_mn, cur_mx)) => (cur_mn.min(mn), cur_mx.max(mx)),
                    });
                }
            }
        }
        let own_id = ids[&c];
        if program.class(c).is_instantiated {
            range = Some(match range {
                None => (own_id, own_id),
                Some((mn, mx)) => (mn.min(own_id), mx.max(own_id)),
            });
        }
        subtree_range.insert(c, range);
    }

    for &c in &order {
        let id = ids[&c];
        let (start, end) = match subtree_range[&c] {
            Some((mn, mx)) => (mn, mx + 1),
            None => (instantiated_count as u16, instantiated_count as u16),
        };
        program.class_mut(c).assign_ids(id, start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Class;

    fn chain_program() -> Program {
        // A <- B <- C, all instantiated, matching §8 scenario 2.
        let mut program = Program::default();
        program.classes.push(Class::new("A"));
        program.classes.push(Class::new("B"));
        program.classes.push(Class::new("C"));
        for c in program.classes.iter_mut() {
            c.is_instantiated = true;
        }
        program.classes[1].super_class = Some(ClassRef(0));
        program.classes[2].super_class = Some(ClassRef(1));
        program.tree_roots = vec![ClassRef(0)];
        program
    }

    #[test]
    fn chain_gets_nested_contiguous_ranges() {
        let mut program = chain_program();
        assign_class_ids(&mut program);
        let a = program.class(ClassRef(0));
        let b = program.class(ClassRef(1));
        let c = program.class(ClassRef(2));
        assert_eq!((a.start_id(), a.end_id()), (0, 3));
        assert_eq!((b.start_id(), b.end_id()), (1, 3));
        assert_eq!((c.start_id(), c.end_id()), (2, 3));
        // A is the root, visited last in post-order, so it gets the lowest id.
        assert_eq!(a.id(), 0);
        assert_eq!(c.id(), 2);
    }

    #[test]
    fn leaf_class_has_singleton_range() {
        let mut program = chain_program();
        assign_class_ids(&mut program);
        let c = program.class(ClassRef(2));
        assert_eq!(c.end_id() - c.start_id(), 1);
    }

    #[test]
    fn uninstantiated_classes_get_ids_above_instantiated_range() {
        let mut program = chain_program();
        program.classes.push(Class::new("Abstract"));
        program.classes[3].super_class = Some(ClassRef(0));
        assign_class_ids(&mut program);
        let uninstantiated = program.class(ClassRef(3));
        assert_eq!(uninstantiated.id(), 3);
        assert!(uninstantiated.id() >= 3); // N == 3
    }
}
