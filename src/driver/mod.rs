//! The backend driver (§4.6): the ten-step pipeline that turns a fully
//! resolved `Program` into a finished program image. Each step is its own
//! `#[instrument]`-annotated function, so a `RUST_LOG=bc_backend=debug` run
//! traces exactly which phase is running, the same granularity the
//! teacher's own decompilation pipeline logs its stages at.

use std::collections::HashMap;

use tracing::instrument;

use crate::config::BackendConfig;
use crate::dispatch::{self, DispatchTable};
use crate::emitter::Operator;
use crate::error::BackendResult;
use crate::image::{ProgramImageSink, SourceMapSink};
use crate::ir::{ClassRef, Expr, Literal, MethodKind, MethodRef, Program, TypecheckTarget};
use crate::shape::CallShape;
use crate::stub;
use crate::walker::{interface_check_selector, Walker};

/// Counts handed back once the image has been cooked, for the CLI harness
/// to print (§4.6: "the driver returns a ... summary").
#[derive(Debug, Clone, Default)]
pub struct FinishedImage {
    pub classes_registered: usize,
    pub methods_emitted: usize,
    pub dispatch_table_len: usize,
    pub dispatch_table_holes: usize,
}

/// Runs the full pipeline against `program`, emitting through `image` and
/// `source_map`. `program` is mutated in place as the dispatch-table build
/// and stub synthesis fill in their write-once fields (§5: "the IR is
/// read-only... except for the id/index assignments").
#[instrument(skip_all)]
pub fn run(
    program: &mut Program,
    config: &BackendConfig,
    image: &mut dyn ProgramImageSink,
    source_map: &mut dyn SourceMapSink,
) -> BackendResult<FinishedImage> {
    // Step 1: stub synthesis, then dispatch-table build.
    let table = build_dispatch_table(program, config);

    // Step 2: selector offsets go to the source map immediately, before any
    // bytecode referencing them is emitted.
    register_selector_offsets(&table, source_map);

    // Step 3: the image itself is created by the caller; nothing to do here.

    // Step 4: class/interface typecheck usage tables.
    install_typecheck_tables(program, &table, image);

    // Step 5: instantiated classes and the class-bits skeleton.
    register_classes(program, image);

    // Step 6: globals, in declaration order.
    walk_globals(program, &table, image, source_map);

    // Step 7: free methods, then per-class methods (adapter/is-interface
    // stubs included, since stub synthesis already appended them to their
    // holder's `methods` list).
    let method_to_image_id = walk_methods(program, &table, image, source_map);
    install_dispatch_table(&table, &method_to_image_id, image);

    // Step 8: operator shortcut offsets.
    install_operator_shortcuts(&table, image);

    // Step 9: named entry points.
    install_entry_points(program, &table, image);

    // Step 10: finalize.
    image.cook()?;

    Ok(FinishedImage {
        classes_registered: program.instantiated_classes().count(),
        methods_emitted: method_to_image_id.len(),
        dispatch_table_len: table.table.len(),
        dispatch_table_holes: table.table.iter().filter(|slot| slot.is_none()).count(),
    })
}

#[instrument(skip_all)]
fn build_dispatch_table(program: &mut Program, config: &BackendConfig) -> DispatchTable {
    stub::run(program);
    dispatch::build(program, &config.dispatch_table)
}

#[instrument(skip_all)]
fn register_selector_offsets(table: &DispatchTable, source_map: &mut dyn SourceMapSink) {
    for (selector, offset) in &table.selector_offsets {
        source_map.register_selector_offset(*offset as usize, selector.name());
    }
}

/// Walks every method body counting how often each class/interface is named
/// by a typecheck, independently for the two kinds of target (§4.6 step 4).
fn count_typecheck_usages(program: &Program) -> (HashMap<ClassRef, usize>, HashMap<ClassRef, usize>) {
    let mut classes = HashMap::new();
    let mut interfaces = HashMap::new();
    for method in &program.methods {
        if let Some(body) = &method.body {
            count_from_expr(body, &mut classes, &mut interfaces);
        }
    }
    (classes, interfaces)
}

fn count_from_expr(expr: &Expr, classes: &mut HashMap<ClassRef, usize>, interfaces: &mut HashMap<ClassRef, usize>) {
    match expr {
        Expr::Typecheck { value, target, .. } => {
            match target {
                TypecheckTarget::Class(c) => *classes.entry(*c).or_insert(0) += 1,
                TypecheckTarget::Interface(c) => *interfaces.entry(*c).or_insert(0) += 1,
            }
            count_from_expr(value, classes, interfaces);
        }
        Expr::Sequence(items) => items.iter().for_each(|e| count_from_expr(e, classes, interfaces)),
        Expr::LiteralNode(_)
        | Expr::LocalRef(_)
        | Expr::ParameterRef(_)
        | Expr::GlobalRef(_)
        | Expr::OuterRef { .. }
        | Expr::LoopBranch { .. }
        | Expr::Allocate(_) => {}
        Expr::FieldRef { receiver, .. } => count_from_expr(receiver, classes, interfaces),
        Expr::LocalStore(_, v) => count_from_expr(v, classes, interfaces),
        Expr::FieldStore { receiver, value, .. } => {
            count_from_expr(receiver, classes, interfaces);
            count_from_expr(value, classes, interfaces);
        }
        Expr::GlobalStore(_, v) => count_from_expr(v, classes, interfaces),
        Expr::OuterStore { value, .. } => count_from_expr(value, classes, interfaces),
        Expr::If { condition, then_branch, else_branch } => {
            count_from_expr(condition, classes, interfaces);
            count_from_expr(then_branch, classes, interfaces);
            count_from_expr(else_branch, classes, interfaces);
        }
        Expr::LogicalBinary { lhs, rhs, .. } => {
            count_from_expr(lhs, classes, interfaces);
            count_from_expr(rhs, classes, interfaces);
        }
        Expr::Not(e) => count_from_expr(e, classes, interfaces),
        Expr::While { condition, body, update } => {
            count_from_expr(condition, classes, interfaces);
            count_from_expr(body, classes, interfaces);
            count_from_expr(update, classes, interfaces);
        }
        Expr::CodeLiteral(code) => count_from_expr(&code.body, classes, interfaces),
        Expr::Return(v) | Expr::NonLocalReturn(v) => {
            if let Some(v) = v {
                count_from_expr(v, classes, interfaces);
            }
        }
        Expr::TryFinally { body, handler } => {
            count_from_expr(body, classes, interfaces);
            count_from_expr(handler, classes, interfaces);
        }
        Expr::Throw(e) => count_from_expr(e, classes, interfaces),
        Expr::Halt(_, v) => {
            if let Some(v) = v {
                count_from_expr(v, classes, interfaces);
            }
        }
        Expr::CallStatic { args, .. } | Expr::CallIntrinsic { args, .. } | Expr::CallPrimitive { args, .. } => {
            args.iter().for_each(|a| count_from_expr(a, classes, interfaces));
        }
        Expr::CallVirtual { receiver, args, .. } => {
            count_from_expr(receiver, classes, interfaces);
            args.iter().for_each(|a| count_from_expr(a, classes, interfaces));
        }
        Expr::CallBlock { block, args } => {
            count_from_expr(block, classes, interfaces);
            args.iter().for_each(|a| count_from_expr(a, classes, interfaces));
        }
    }
}

/// Sorts by descending usage count, breaking ties by `ClassRef` order for
/// determinism (two classes checked equally often would otherwise race on
/// hash-map iteration order).
fn sort_by_usage_descending(counts: HashMap<ClassRef, usize>) -> Vec<ClassRef> {
    let mut entries: Vec<(ClassRef, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entries.into_iter().map(|(c, _)| c).collect()
}

#[instrument(skip_all)]
fn install_typecheck_tables(program: &mut Program, table: &DispatchTable, image: &mut dyn ProgramImageSink) {
    let (class_counts, interface_counts) = count_typecheck_usages(program);

    let classes_by_usage = sort_by_usage_descending(class_counts);
    let mut indices = HashMap::with_capacity(classes_by_usage.len());
    let mut class_check_ids = Vec::with_capacity(classes_by_usage.len() * 2);
    for (position, class_ref) in classes_by_usage.iter().enumerate() {
        indices.insert(*class_ref, position as u16);
        let class = program.class(*class_ref);
        class_check_ids.push(class.start_id());
        class_check_ids.push(class.end_id());
    }
    program.set_class_typecheck_indices(indices);
    image.set_class_check_ids(class_check_ids);

    let interfaces_by_usage = sort_by_usage_descending(interface_counts);
    let interface_check_offsets = interfaces_by_usage
        .iter()
        .map(|class_ref| {
            let selector = interface_check_selector(program.class(*class_ref));
            table
                .offset_of(&selector)
                .expect("interface typecheck selector missing a dispatch row") as u16
        })
        .collect();
    image.set_interface_check_offsets(interface_check_offsets);
}

#[instrument(skip_all)]
fn register_classes(program: &Program, image: &mut dyn ProgramImageSink) {
    let instantiated_count = program.instantiated_classes().count();
    for class_ref in program.instantiated_classes() {
        let class = program.class(class_ref);
        // §4.6 step 5: "size in bytes computed from total_field_count" — one
        // word per field plus the header word every instance carries.
        let size_bytes = (class.total_field_count as u32 + 1) * 8;
        image.create_class(class.id(), &class.name, size_bytes, class.is_runtime);
    }
    image.create_class_bits_table(instantiated_count);
}

/// Unwraps a constant global initializer's body down to its literal value.
/// Non-lazy globals are required to resolve to exactly one of these shapes
/// (§4.6 step 6); anything else is a front-end contract violation this crate
/// is not responsible for recovering from.
fn constant_literal(expr: &Expr) -> &Literal {
    match expr {
        Expr::LiteralNode(literal) => literal,
        Expr::Return(Some(inner)) => constant_literal(inner),
        Expr::Sequence(items) => match items.as_slice() {
            [only] => constant_literal(only),
            _ => panic!("non-lazy global initializer is not a single constant expression"),
        },
        other => panic!("non-lazy global initializer is not a constant literal: {other:?}"),
    }
}

fn push_constant_literal(image: &mut dyn ProgramImageSink, literal: &Literal) {
    match literal {
        Literal::Null => image.push_null(),
        Literal::Boolean(b) => image.push_boolean(*b),
        Literal::Integer(v) => {
            if (0..=u32::MAX as i64).contains(v) {
                image.push_smi(*v);
            } else {
                image.push_large_integer(*v);
            }
        }
        Literal::LargeInteger(v) => image.push_large_integer(*v),
        Literal::Double(d) => image.push_double(*d),
        Literal::String(s) => image.push_string(s),
        Literal::ByteArray(_) => panic!("byte-array literals are not a valid global constant initializer"),
    }
}

#[instrument(skip_all)]
fn walk_globals(
    program: &mut Program,
    table: &DispatchTable,
    image: &mut dyn ProgramImageSink,
    source_map: &mut dyn SourceMapSink,
) {
    program.finalize_global_ids();
    for index in 0..program.globals.len() {
        let global = &program.globals[index];
        let name = global.name.clone();
        let initializer = global.initializer;
        let is_lazy = global.is_lazy;

        source_map.add_global_entry(index, &name);
        let handle = source_map.register_global(&name);

        if is_lazy {
            let mut walker = Walker::new(program, table, image, source_map);
            let method_id = walker.assemble_method(initializer);
            source_map.finalize(handle, method_id, 0);
            image.push_lazy_initializer_id(method_id);
        } else {
            let body = program
                .method(initializer)
                .body
                .as_ref()
                .expect("non-lazy global initializer has no body");
            let literal = constant_literal(body).clone();
            push_constant_literal(image, &literal);
        }
    }
    image.create_global_variables(program.globals.len());
}

#[instrument(skip_all)]
fn walk_methods(
    program: &Program,
    table: &DispatchTable,
    image: &mut dyn ProgramImageSink,
    source_map: &mut dyn SourceMapSink,
) -> HashMap<MethodRef, usize> {
    let mut free_methods: Vec<MethodRef> = Vec::new();
    for index in 0..program.methods.len() {
        let method_ref = MethodRef(index);
        let method = program.method(method_ref);
        if method.holder.is_none() && !matches!(method.kind, MethodKind::GlobalInitializer) {
            free_methods.push(method_ref);
        }
    }

    let mut method_to_image_id = HashMap::with_capacity(program.methods.len());

    for method_ref in free_methods {
        assemble_and_record(program, table, image, source_map, method_ref, &mut method_to_image_id);
    }
    for class in &program.classes {
        for &method_ref in &class.methods {
            assemble_and_record(program, table, image, source_map, method_ref, &mut method_to_image_id);
        }
    }

    method_to_image_id
}

fn assemble_and_record(
    program: &Program,
    table: &DispatchTable,
    image: &mut dyn ProgramImageSink,
    source_map: &mut dyn SourceMapSink,
    method_ref: MethodRef,
    method_to_image_id: &mut HashMap<MethodRef, usize>,
) {
    let mut walker = Walker::new(program, table, image, source_map);
    let image_id = walker.assemble_method(method_ref);
    method_to_image_id.insert(method_ref, image_id);
}

/// §4.6 step 7's second half: "write the [method] id to every slot ...
/// that contains this method". The dispatch table already recorded *which*
/// `MethodRef` occupies each slot during packing; this just translates that
/// into the id the image assigned once the method was actually emitted, and
/// writes it into every slot that `MethodRef` occupies (an instance method's
/// whole holder subtree range, not just its recorded `index`).
#[instrument(skip_all)]
fn install_dispatch_table(table: &DispatchTable, method_to_image_id: &HashMap<MethodRef, usize>, image: &mut dyn ProgramImageSink) {
    image.create_dispatch_table(table.table.len());
    for (slot, occupant) in table.table.iter().enumerate() {
        if let Some(method_ref) = occupant {
            if let Some(&id) = method_to_image_id.get(method_ref) {
                image.set_dispatch_table_entry(slot, id);
            }
        }
    }
}

#[instrument(skip_all)]
fn install_operator_shortcuts(table: &DispatchTable, image: &mut dyn ProgramImageSink) {
    for (&operator, offset) in &table.operator_offsets {
        if let Some(offset) = offset {
            image.set_invoke_bytecode_offset(operator.opcode(), *offset as usize);
        }
    }
}

#[instrument(skip_all)]
fn install_entry_points(program: &Program, table: &DispatchTable, image: &mut dyn ProgramImageSink) {
    for (slot, (_name, method_ref)) in program.entry_points.iter().enumerate() {
        let dispatch_index = program.method(*method_ref).index();
        image.set_entry_point_index(slot, dispatch_index);
    }

    let mut slot = program.entry_points.len();
    if let Some(lookup_failure) = program.lookup_failure {
        image.set_entry_point_index(slot, program.method(lookup_failure).index());
        slot += 1;
    }
    if let Some(as_check_failure) = program.as_check_failure {
        image.set_entry_point_index(slot, program.method(as_check_failure).index());
    }
}

#[allow(dead_code)]
fn canonical_operator_selector(operator: Operator) -> CallShape {
    CallShape::positional(operator.arity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::image::{RecordingImage, RecordingSourceMap};
    use crate::ir::{Class, Global, Method, MethodKind, Shape};
    use crate::shape::{CallShape, PlainShape};

    fn static_plain(arity: usize) -> Shape {
        Shape::Plain(PlainShape::new(CallShape::positional(arity)))
    }

    fn instance_plain(explicit_arity: usize) -> Shape {
        Shape::Plain(PlainShape::new(CallShape::positional(explicit_arity).with_implicit_this()))
    }

    /// Single free static method `main()` returning the literal `42`, no
    /// classes or globals — the smallest possible program the driver can
    /// run end to end (§8 scenario "single static method returning a
    /// literal").
    fn trivial_program() -> Program {
        let mut program = Program::default();
        let mut main = Method::new("main", MethodKind::Static, static_plain(0));
        main.body = Some(Expr::LiteralNode(Literal::Integer(42)));
        program.methods.push(main);
        program.entry_points.push(("main".to_string(), MethodRef(0)));
        program
    }

    #[test]
    fn trivial_program_cooks_successfully() {
        let mut program = trivial_program();
        let config = BackendConfig::default();
        let mut image = RecordingImage::default();
        let mut source_map = RecordingSourceMap::default();

        let summary = run(&mut program, &config, &mut image, &mut source_map).expect("driver run should succeed");

        assert_eq!(summary.methods_emitted, 1);
        assert!(image.cooked);
        assert_eq!(image.entry_points.get(&0), Some(&program.method(MethodRef(0)).index()));
    }

    /// Two classes, `A` <- `B`, both instantiated; `B` overrides `A`'s `foo`.
    /// A free function calls `foo` virtually, which exercises dispatch-table
    /// build, class registration, and per-class method walking together.
    fn virtual_dispatch_program() -> Program {
        let mut program = Program::default();
        program.classes.push(Class::new("A"));
        program.classes.push(Class::new("B"));
        program.classes[1].super_class = Some(ClassRef(0));
        for c in program.classes.iter_mut() {
            c.is_instantiated = true;
        }
        program.tree_roots = vec![ClassRef(0)];

        let mut foo_a = Method::new("foo", MethodKind::Instance, instance_plain(0));
        foo_a.holder = Some(ClassRef(0));
        foo_a.body = Some(Expr::LiteralNode(Literal::Integer(1)));
        program.methods.push(foo_a);
        program.classes[0].methods.push(MethodRef(0));

        let mut foo_b = Method::new("foo", MethodKind::Instance, instance_plain(0));
        foo_b.holder = Some(ClassRef(1));
        foo_b.body = Some(Expr::LiteralNode(Literal::Integer(2)));
        program.methods.push(foo_b);
        program.classes[1].methods.push(MethodRef(1));

        let mut caller = Method::new("use_foo", MethodKind::Static, static_plain(1));
        caller.body = Some(Expr::CallVirtual {
            selector_name: "foo".into(),
            shape: CallShape::positional(0).with_implicit_this(),
            kind: crate::emitter::InvokeVirtualKind::Normal,
            receiver: Box::new(Expr::ParameterRef(0)),
            args: Vec::new(),
        });
        program.methods.push(caller);
        program.entry_points.push(("use_foo".to_string(), MethodRef(2)));

        program
    }

    #[test]
    fn virtual_dispatch_program_registers_both_classes_and_methods() {
        let mut program = virtual_dispatch_program();
        let config = BackendConfig::default();
        let mut image = RecordingImage::default();
        let mut source_map = RecordingSourceMap::default();

        let summary = run(&mut program, &config, &mut image, &mut source_map).expect("driver run should succeed");

        assert_eq!(summary.classes_registered, 2);
        assert_eq!(image.classes.len(), 2);
        assert_eq!(summary.methods_emitted, 3);
        assert!(image.cooked);
    }

    /// One lazy global and one constant global; both must receive a
    /// contiguous `global_id` in declaration order (§4.6 step 6).
    #[test]
    fn globals_get_ids_equal_to_their_declaration_index() {
        let mut program = Program::default();
        let mut const_init = Method::new("const-init", MethodKind::GlobalInitializer, static_plain(0));
        const_init.body = Some(Expr::LiteralNode(Literal::Integer(7)));
        program.methods.push(const_init);
        let mut lazy_init = Method::new("lazy-init", MethodKind::GlobalInitializer, static_plain(0));
        lazy_init.body = Some(Expr::LiteralNode(Literal::String("hi".into())));
        program.methods.push(lazy_init);

        program.globals.push(Global::new("CONST", MethodRef(0)));
        let mut lazy_global = Global::new("LAZY", MethodRef(1));
        lazy_global.is_lazy = true;
        program.globals.push(lazy_global);

        let config = BackendConfig::default();
        let mut image = RecordingImage::default();
        let mut source_map = RecordingSourceMap::default();
        run(&mut program, &config, &mut image, &mut source_map).expect("driver run should succeed");

        assert_eq!(program.global(crate::ir::GlobalRef(0)).global_id(), 0);
        assert_eq!(program.global(crate::ir::GlobalRef(1)).global_id(), 1);
        assert_eq!(image.global_variable_count, Some(2));
        assert_eq!(image.global_initial_values.len(), 2);
    }
}
