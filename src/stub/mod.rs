//! Stub synthesis (§4.4): the pass that runs after the front end hands off
//! the program and before dispatch-table build. Two independent sub-passes:
//!
//! - Adapter stubs collapse every method's `ResolutionShape` (as written,
//!   possibly with optional parameters) to a concrete `PlainShape`, emitting
//!   one small forwarding method per distinct call shape actually observed
//!   at a virtual call site.
//! - Interface stubs give every class that implements a checked interface a
//!   trivial `is-<Name>` method, so `IS_INTERFACE`/`AS_INTERFACE` can dispatch
//!   through the same virtual-call machinery as everything else.
//!
//! Grounded on `stubs.cc`'s `add_stub_methods_and_switch_to_plain_shapes` and
//! `add_interface_stub_methods`.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use crate::ir::{ClassRef, Expr, Literal, Method, MethodKind, MethodRef, Parameter, Program, Shape, TypecheckTarget};
use crate::shape::CallShape;

/// Runs both stub-synthesis sub-passes. After this returns, every method in
/// `program` has `Shape::Plain` (the dispatch-table builder's precondition).
pub fn run(program: &mut Program) {
    add_stub_methods_and_switch_to_plain_shapes(program);
    add_interface_stub_methods(program);
}

/// Every call shape ever used at a virtual call site, keyed by selector
/// name: a method may need a stub for a shape observed at a call to an
/// *overriding* sibling's selector, not just its own declared shape, so
/// collection happens once over the whole program rather than per-class.
fn collect_call_shapes_by_name(program: &Program) -> HashMap<String, HashSet<CallShape>> {
    let mut out: HashMap<String, HashSet<CallShape>> = HashMap::new();
    for method in &program.methods {
        if let Some(body) = &method.body {
            collect_call_shapes(body, &mut out);
        }
    }
    out
}

fn collect_call_shapes(expr: &Expr, out: &mut HashMap<String, HashSet<CallShape>>) {
    match expr {
        Expr::CallVirtual { selector_name, shape, receiver, args, .. } => {
            out.entry(selector_name.clone()).or_default().insert(shape.clone());
            collect_call_shapes(receiver, out);
            args.iter().for_each(|a| collect_call_shapes(a, out));
        }
        Expr::Sequence(items) => items.iter().for_each(|e| collect_call_shapes(e, out)),
        Expr::LiteralNode(_) | Expr::LocalRef(_) | Expr::ParameterRef(_) | Expr::GlobalRef(_) | Expr::OuterRef { .. } | Expr::LoopBranch { .. } | Expr::Allocate(_) => {}
        Expr::FieldRef { receiver, .. } => collect_call_shapes(receiver, out),
        Expr::LocalStore(_, v) => collect_call_shapes(v, out),
        Expr::FieldStore { receiver, value, .. } => {
            collect_call_shapes(receiver, out);
            collect_call_shapes(value, out);
        }
        Expr::GlobalStore(_, v) => collect_call_shapes(v, out),
        Expr::OuterStore { value, .. } => collect_call_shapes(value, out),
        Expr::Typecheck { value, .. } => collect_call_shapes(value, out),
        Expr::If { condition, then_branch, else_branch } => {
            collect_call_shapes(condition, out);
            collect_call_shapes(then_branch, out);
            collect_call_shapes(else_branch, out);
        }
        Expr::LogicalBinary { lhs, rhs, .. } => {
            collect_call_shapes(lhs, out);
            collect_call_shapes(rhs, out);
        }
        Expr::Not(e) => collect_call_shapes(e, out),
        Expr::While { condition, body, update } => {
            collect_call_shapes(condition, out);
            collect_call_shapes(body, out);
            collect_call_shapes(update, out);
        }
        Expr::CodeLiteral(code) => collect_call_shapes(&code.body, out),
        Expr::Return(v) | Expr::NonLocalReturn(v) => {
            if let Some(v) = v {
                collect_call_shapes(v, out);
            }
        }
        Expr::TryFinally { body, handler } => {
            collect_call_shapes(body, out);
            collect_call_shapes(handler, out);
        }
        Expr::Throw(e) => collect_call_shapes(e, out),
        Expr::Halt(_, v) => {
            if let Some(v) = v {
                collect_call_shapes(v, out);
            }
        }
        Expr::CallStatic { args, .. } | Expr::CallIntrinsic { args, .. } | Expr::CallPrimitive { args, .. } => {
            args.iter().for_each(|a| collect_call_shapes(a, out));
        }
        Expr::CallBlock { block, args } => {
            collect_call_shapes(block, out);
            args.iter().for_each(|a| collect_call_shapes(a, out));
        }
    }
}

/// The position, in `call_shape`'s own parameter order, of the named
/// argument `name` — `None` if `call_shape` doesn't supply it.
fn call_shape_position_for_name(call_shape: &CallShape, name: &str) -> Option<usize> {
    let unnamed_args_count = call_shape.arity() - call_shape.names().len();
    call_shape
        .names()
        .iter()
        .position(|n| n == name)
        .map(|i| unnamed_args_count + i)
}

/// Builds the adapter stub's forwarding argument list: every position the
/// target method declares, mapped back to the stub's own parameter (laid
/// out identically to `call_shape`) where supplied, or a literal null where
/// the caller omitted an optional (§4.4 "null-filled defaults").
fn build_forward_args(target_full: &CallShape, call_shape: &CallShape) -> Vec<Expr> {
    let mut args = Vec::with_capacity(target_full.arity());
    let target_unnamed_args_count = target_full.arity() - target_full.names().len();
    let target_unnamed_non_block = target_unnamed_args_count - target_full.unnamed_block_count();
    let call_unnamed_non_block = call_shape.unnamed_non_block_count();

    for i in 0..target_unnamed_non_block {
        if i < call_unnamed_non_block {
            args.push(Expr::ParameterRef(i));
        } else {
            args.push(Expr::LiteralNode(Literal::Null));
        }
    }
    // Block arguments always match exactly in count between an accepted call
    // shape and the method it resolves to, so they forward by position.
    for i in 0..target_full.unnamed_block_count() {
        args.push(Expr::ParameterRef(call_unnamed_non_block + i));
    }
    for name in target_full.names() {
        match call_shape_position_for_name(call_shape, name) {
            Some(pos) => args.push(Expr::ParameterRef(pos)),
            None => args.push(Expr::LiteralNode(Literal::Null)),
        }
    }
    args
}

fn stub_parameters(call_shape: &CallShape, is_instance: bool) -> Vec<Parameter> {
    (0..call_shape.arity())
        .map(|i| {
            let name = if i == 0 && is_instance {
                "this".to_string()
            } else {
                "<stub-parameter>".to_string()
            };
            Parameter { name, type_name: None }
        })
        .collect()
}

/// Builds one adapter stub forwarding `call_shape` into `target_ref` via a
/// tail call, per §4.4.
fn build_adapter_stub(program: &Program, target_ref: MethodRef, call_shape: &CallShape) -> Method {
    let target = program.method(target_ref);
    let target_resolution = target.shape.as_resolution().expect("adapter stub target still has a resolution shape");
    let target_full = target_resolution.full_call_shape();

    let forward_args = build_forward_args(&target_full, call_shape);
    let forward_call = Expr::CallStatic {
        target: target_ref,
        args: forward_args,
        is_tail_call: true,
    };

    let mut stub = Method::new(
        target.name.clone(),
        MethodKind::AdapterStub,
        Shape::Plain(call_shape.clone().to_plain_shape()),
    );
    stub.holder = target.holder;
    stub.parameters = stub_parameters(call_shape, target.kind == MethodKind::Instance);
    stub.body = Some(Expr::Return(Some(Box::new(forward_call))));
    stub
}

/// §4.4 step 1: for every method with optional parameters, synthesize one
/// adapter stub per distinct call shape actually observed for its selector
/// name, then collapse the method itself (and every method with no
/// optionals) to its plain shape.
fn add_stub_methods_and_switch_to_plain_shapes(program: &mut Program) {
    let call_shapes_by_name = collect_call_shapes_by_name(program);

    for class_index in 0..program.classes.len() {
        let class_ref = ClassRef(class_index);
        let method_refs = program.class(class_ref).methods.clone();
        let mut new_stubs = Vec::new();

        for method_ref in method_refs {
            let method = program.method(method_ref);
            let resolution = match method.shape.as_resolution() {
                Some(r) => r.clone(),
                None => continue,
            };

            if !resolution.has_optional_parameters() {
                program.method_mut(method_ref).shape = Shape::Plain(resolution.to_plain_shape());
                continue;
            }

            let full_shape = resolution.full_call_shape();
            if let Some(observed) = call_shapes_by_name.get(&method.name) {
                for call_shape in observed {
                    if *call_shape == full_shape {
                        continue;
                    }
                    if !resolution.accepts(call_shape) {
                        continue;
                    }
                    new_stubs.push(build_adapter_stub(program, method_ref, call_shape));
                }
            }
            program.method_mut(method_ref).shape = Shape::Plain(full_shape.to_plain_shape());
        }

        for stub in new_stubs {
            let stub_ref = MethodRef(program.methods.len());
            program.methods.push(stub);
            program.class_mut(class_ref).methods.push(stub_ref);
        }
    }

    // Free functions and global/field initializers are never dispatched
    // virtually, so they collapse directly with no adapter needed.
    for method in program.methods.iter_mut() {
        if let Shape::Resolution(r) = &method.shape {
            method.shape = Shape::Plain(r.full_call_shape().to_plain_shape());
        }
    }
}

fn collect_interface_targets(expr: &Expr, out: &mut IndexSet<ClassRef>) {
    match expr {
        Expr::Typecheck { value, target, .. } => {
            if let TypecheckTarget::Interface(class_ref) = target {
                out.insert(*class_ref);
            }
            collect_interface_targets(value, out);
        }
        Expr::Sequence(items) => items.iter().for_each(|e| collect_interface_targets(e, out)),
        Expr::LiteralNode(_) | Expr::LocalRef(_) | Expr::ParameterRef(_) | Expr::GlobalRef(_) | Expr::OuterRef { .. } | Expr::LoopBranch { .. } | Expr::Allocate(_) => {}
        Expr::FieldRef { receiver, .. } => collect_interface_targets(receiver, out),
        Expr::LocalStore(_, v) => collect_interface_targets(v, out),
        Expr::FieldStore { receiver, value, .. } => {
            collect_interface_targets(receiver, out);
            collect_interface_targets(value, out);
        }
        Expr::GlobalStore(_, v) => collect_interface_targets(v, out),
        Expr::OuterStore { value, .. } => collect_interface_targets(value, out),
        Expr::If { condition, then_branch, else_branch } => {
            collect_interface_targets(condition, out);
            collect_interface_targets(then_branch, out);
            collect_interface_targets(else_branch, out);
        }
        Expr::LogicalBinary { lhs, rhs, .. } => {
            collect_interface_targets(lhs, out);
            collect_interface_targets(rhs, out);
        }
        Expr::Not(e) => collect_interface_targets(e, out),
        Expr::While { condition, body, update } => {
            collect_interface_targets(condition, out);
            collect_interface_targets(body, out);
            collect_interface_targets(update, out);
        }
        Expr::CodeLiteral(code) => collect_interface_targets(&code.body, out),
        Expr::Return(v) | Expr::NonLocalReturn(v) => {
            if let Some(v) = v {
                collect_interface_targets(v, out);
            }
        }
        Expr::TryFinally { body, handler } => {
            collect_interface_targets(body, out);
            collect_interface_targets(handler, out);
        }
        Expr::Throw(e) => collect_interface_targets(e, out),
        Expr::Halt(_, v) => {
            if let Some(v) = v {
                collect_interface_targets(v, out);
            }
        }
        Expr::CallStatic { args, .. } | Expr::CallIntrinsic { args, .. } | Expr::CallPrimitive { args, .. } => {
            args.iter().for_each(|a| collect_interface_targets(a, out));
        }
        Expr::CallVirtual { receiver, args, .. } => {
            collect_interface_targets(receiver, out);
            args.iter().for_each(|a| collect_interface_targets(a, out));
        }
        Expr::CallBlock { block, args } => {
            collect_interface_targets(block, out);
            args.iter().for_each(|a| collect_interface_targets(a, out));
        }
    }
}

/// Assigns every interface ever named by an `is`/`as` check a synthetic
/// `"is-<Name>"` selector, in first-seen order for determinism.
fn assign_interface_typecheck_selectors(program: &mut Program) {
    let mut referenced = IndexSet::new();
    for method in &program.methods {
        if let Some(body) = &method.body {
            collect_interface_targets(body, &mut referenced);
        }
    }
    for class_ref in referenced {
        if program.class(class_ref).interface_typecheck_selector.is_none() {
            let selector = format!("is-{}", program.class(class_ref).name);
            program.class_mut(class_ref).interface_typecheck_selector = Some(selector);
        }
    }
}

/// §4.4 step 2: every non-interface class implementing a checked interface
/// gets a trivial `is-<Name>` method that always returns `true` — the body
/// is never executed by a well-typed program (the typecheck only looks the
/// selector up to tell whether the receiver implements the interface at
/// all), but it has to exist for the virtual-dispatch machinery to resolve.
fn add_interface_stub_methods(program: &mut Program) {
    assign_interface_typecheck_selectors(program);

    for class_index in 0..program.classes.len() {
        let class_ref = ClassRef(class_index);
        if program.class(class_ref).is_interface {
            continue;
        }
        let interfaces = program.class(class_ref).interfaces.clone();
        for interface_ref in interfaces {
            let Some(selector) = program.class(interface_ref).interface_typecheck_selector.clone() else {
                continue;
            };
            let shape = CallShape::positional(0).with_implicit_this();
            let mut stub = Method::new(selector, MethodKind::IsInterfaceStub, Shape::Plain(shape.to_plain_shape()));
            stub.holder = Some(class_ref);
            stub.parameters = vec![Parameter { name: "this".to_string(), type_name: None }];
            stub.body = Some(Expr::Return(Some(Box::new(Expr::LiteralNode(Literal::Boolean(true))))));

            let stub_ref = MethodRef(program.methods.len());
            program.methods.push(stub);
            program.class_mut(class_ref).methods.push(stub_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Class, Global};
    use crate::shape::{CallShape, ResolutionShape};
    use bitvec::vec::BitVec;

    fn resolution_with_one_optional() -> ResolutionShape {
        // foo(a, b = default): arity 2 (plus implicit this handled by caller),
        // second unnamed parameter optional.
        ResolutionShape::from_call_shape(CallShape::positional(2).with_implicit_this(), 1, BitVec::new())
    }

    fn program_with_optional_method() -> Program {
        let mut program = Program::default();
        program.classes.push(Class::new("A"));
        program.classes[0].is_instantiated = true;
        program.tree_roots = vec![ClassRef(0)];

        let mut foo = Method::new("foo", MethodKind::Instance, Shape::Resolution(resolution_with_one_optional()));
        foo.holder = Some(ClassRef(0));
        foo.body = Some(Expr::LiteralNode(Literal::Integer(1)));
        program.methods.push(foo);
        program.classes[0].methods.push(MethodRef(0));

        let mut caller = Method::new("use_foo", MethodKind::Static, Shape::Resolution(ResolutionShape::new(1)));
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
    fn optional_parameter_method_gets_one_adapter_stub() {
        let mut program = program_with_optional_method();
        run(&mut program);

        // foo's plain shape is now its full (arity-2) shape; the class gained
        // exactly one stub forwarding the shorter observed call.
        assert_eq!(program.class(ClassRef(0)).methods.len(), 2);
        let stub_ref = program.class(ClassRef(0)).methods[1];
        let stub = program.method(stub_ref);
        assert_eq!(stub.kind, MethodKind::AdapterStub);
        assert_eq!(stub.shape.as_plain().unwrap().arity(), 1);
        match stub.body.as_ref().unwrap() {
            Expr::Return(Some(inner)) => match inner.as_ref() {
                Expr::CallStatic { target, args, is_tail_call } => {
                    assert_eq!(*target, MethodRef(0));
                    assert!(*is_tail_call);
                    assert_eq!(args.len(), 2);
                    assert!(matches!(args[1], Expr::LiteralNode(Literal::Null)));
                }
                other => panic!("expected a tail CallStatic, got {other:?}"),
            },
            other => panic!("expected Return(CallStatic), got {other:?}"),
        }
    }

    #[test]
    fn method_with_no_optionals_gets_no_stub() {
        let mut program = Program::default();
        program.classes.push(Class::new("A"));
        let mut foo = Method::new("foo", MethodKind::Instance, Shape::Resolution(ResolutionShape::new(1)));
        foo.holder = Some(ClassRef(0));
        program.methods.push(foo);
        program.classes[0].methods.push(MethodRef(0));

        run(&mut program);
        assert_eq!(program.class(ClassRef(0)).methods.len(), 1);
        assert!(program.method(MethodRef(0)).shape.as_plain().is_some());
    }

    #[test]
    fn free_functions_collapse_without_stubs() {
        let mut program = Program::default();
        let method = Method::new("main", MethodKind::Static, Shape::Resolution(ResolutionShape::new(0)));
        program.methods.push(method);
        let global = Global::new("g", MethodRef(0));
        program.globals.push(global);
        run(&mut program);
        assert!(program.method(MethodRef(0)).shape.as_plain().is_some());
    }

    #[test]
    fn classes_implementing_a_checked_interface_get_an_is_stub() {
        let mut program = Program::default();
        program.classes.push(Class::new("Comparable")); // interface
        program.classes[0].is_interface = true;
        program.classes.push(Class::new("Box"));
        program.classes[1].interfaces.push(ClassRef(0));
        program.classes[1].is_instantiated = true;
        program.tree_roots = vec![ClassRef(1)];

        let mut checker = Method::new("check", MethodKind::Static, Shape::Resolution(ResolutionShape::new(1)));
        checker.body = Some(Expr::Typecheck {
            value: Box::new(Expr::ParameterRef(0)),
            target: TypecheckTarget::Interface(ClassRef(0)),
            is_as: false,
            nullable: false,
        });
        program.methods.push(checker);

        run(&mut program);

        assert_eq!(program.class(ClassRef(0)).interface_typecheck_selector.as_deref(), Some("is-Comparable"));
        let box_methods = &program.class(ClassRef(1)).methods;
        assert_eq!(box_methods.len(), 1);
        let stub = program.method(box_methods[0]);
        assert_eq!(stub.kind, MethodKind::IsInterfaceStub);
        assert_eq!(stub.name, "is-Comparable");
    }
}
