//! The input data model: a fully-resolved, typed program IR (§3). Owned and
//! produced by the front end (out of scope, §1); this crate only reads it,
//! except for the write-once id/index/shape assignments the dispatch-table
//! builder and stub synthesizer perform.

mod expr;

pub use expr::{Code, Expr, Literal, LogicalOp, TypecheckTarget};

use std::collections::HashMap;

use crate::shape::{PlainShape, ResolutionShape};

/// Index into `Program::classes`. Stable for the lifetime of one backend run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassRef(pub usize);

/// Index into `Program::methods`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodRef(pub usize);

/// Index into `Program::globals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalRef(pub usize);

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    /// Index among the declaring class's own fields (not counting inherited
    /// fields above it, which occupy lower indices at the instance level).
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Instance,
    Static,
    Constructor,
    Factory,
    GlobalInitializer,
    FieldInitializer,
    AdapterStub,
    IsInterfaceStub,
    FieldStub,
}

/// A method's signature, in exactly one of two states at a time (§3
/// "Method"): as written (`Resolution`, possibly with optional parameters)
/// or collapsed to its single concrete call shape (`Plain`, post-stub).
#[derive(Debug, Clone)]
pub enum Shape {
    Resolution(ResolutionShape),
    Plain(PlainShape),
}

impl Shape {
    pub fn as_resolution(&self) -> Option<&ResolutionShape> {
        match self {
            Shape::Resolution(r) => Some(r),
            Shape::Plain(_) => None,
        }
    }

    pub fn as_plain(&self) -> Option<&PlainShape> {
        match self {
            Shape::Plain(p) => Some(p),
            Shape::Resolution(_) => None,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Shape::Resolution(r) => r.max_arity(),
            Shape::Plain(p) => p.arity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub holder: Option<ClassRef>,
    pub kind: MethodKind,
    pub shape: Shape,
    pub parameters: Vec<Parameter>,
    pub body: Option<Expr>,
    pub return_type: Option<String>,
    pub is_abstract: bool,
    pub is_dead: bool,
    pub does_not_return: bool,
    pub is_runtime: bool,
    /// The method's slot in the dispatch table. Assigned once during
    /// dispatch-table build (§3 "Invariant: every live method eventually has
    /// a table index"); reading it before that phase runs is a bug in this
    /// crate, not a malformed program, hence the panic rather than `Option`
    /// threaded through every caller.
    index: Option<usize>,
}

impl Method {
    pub fn new(name: impl Into<String>, kind: MethodKind, shape: Shape) -> Self {
        Self {
            name: name.into(),
            holder: None,
            kind,
            shape,
            parameters: Vec::new(),
            body: None,
            return_type: None,
            is_abstract: false,
            is_dead: false,
            does_not_return: false,
            is_runtime: false,
            index: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index.expect("method index read before dispatch-table build assigned it")
    }

    pub fn index_opt(&self) -> Option<usize> {
        self.index
    }

    /// Write-once: the dispatch-table builder is the only caller.
    pub fn set_index(&mut self, index: usize) {
        assert!(self.index.is_none(), "method index assigned twice");
        self.index = Some(index);
    }

    pub fn is_static_like(&self) -> bool {
        matches!(
            self.kind,
            MethodKind::Static
                | MethodKind::Constructor
                | MethodKind::Factory
                | MethodKind::GlobalInitializer
                | MethodKind::FieldInitializer
        )
    }
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub super_class: Option<ClassRef>,
    pub interfaces: Vec<ClassRef>,
    /// Instance methods declared directly on this class (stubs appended by
    /// the stub synthesizer land here too, post-synthesis).
    pub methods: Vec<MethodRef>,
    pub fields: Vec<Field>,
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_runtime: bool,
    pub is_instantiated: bool,
    pub total_field_count: usize,
    /// For interfaces: the synthetic `"is-<Name>"` selector assigned when
    /// first referenced by an `is`/`as` check (§4.4).
    pub interface_typecheck_selector: Option<String>,

    id: Option<u16>,
    start_id: Option<u16>,
    end_id: Option<u16>,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_class: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            is_interface: false,
            is_abstract: false,
            is_runtime: false,
            is_instantiated: false,
            total_field_count: 0,
            interface_typecheck_selector: None,
            id: None,
            start_id: None,
            end_id: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id.expect("class id read before dispatch-table build assigned it")
    }

    pub fn start_id(&self) -> u16 {
        self.start_id.expect("class start_id read before dispatch-table build assigned it")
    }

    pub fn end_id(&self) -> u16 {
        self.end_id.expect("class end_id read before dispatch-table build assigned it")
    }

    pub fn ids_assigned(&self) -> bool {
        self.id.is_some()
    }

    /// Write-once triple, assigned together by the dispatch-table builder's
    /// class-id-assignment step.
    pub fn assign_ids(&mut self, id: u16, start_id: u16, end_id: u16) {
        assert!(self.id.is_none(), "class ids assigned twice");
        debug_assert!(start_id <= end_id);
        self.id = Some(id);
        self.start_id = Some(start_id);
        self.end_id = Some(end_id);
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub initializer: MethodRef,
    /// Write-once, contiguous in `[0, G)`, assigned while the driver walks
    /// globals in order (§4.6 step 6); the invariant "its `global_id` equals
    /// its index" is enforced by `Program::finalize_global_ids`.
    global_id: Option<usize>,
    pub is_lazy: bool,
    pub is_final: bool,
}

impl Global {
    pub fn new(name: impl Into<String>, initializer: MethodRef) -> Self {
        Self {
            name: name.into(),
            initializer,
            global_id: None,
            is_lazy: false,
            is_final: true,
        }
    }

    pub fn global_id(&self) -> usize {
        self.global_id.expect("global id read before it was assigned")
    }

    pub fn set_global_id(&mut self, id: usize) {
        assert!(self.global_id.is_none(), "global id assigned twice");
        self.global_id = Some(id);
    }
}

/// The whole program handed to the backend: every class, method, and global,
/// plus the handful of sentinel/entry-point references the driver needs to
/// wire up (§3 "Program (input)").
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub classes: Vec<Class>,
    pub methods: Vec<Method>,
    pub globals: Vec<Global>,
    pub tree_roots: Vec<ClassRef>,
    pub entry_points: Vec<(String, MethodRef)>,
    pub lookup_failure: Option<MethodRef>,
    pub as_check_failure: Option<MethodRef>,
    /// Per-class/per-interface index into the image's class/interface check
    /// table, assigned once by the driver's usage-count pass (§4.6 step 4)
    /// and consulted by the walker when emitting `IS_CLASS`/`AS_CLASS`/
    /// `IS_INTERFACE`/`AS_INTERFACE`.
    class_typecheck_indices: Option<HashMap<ClassRef, u16>>,
}

impl Program {
    pub fn class(&self, r: ClassRef) -> &Class {
        &self.classes[r.0]
    }

    pub fn class_mut(&mut self, r: ClassRef) -> &mut Class {
        &mut self.classes[r.0]
    }

    pub fn method(&self, r: MethodRef) -> &Method {
        &self.methods[r.0]
    }

    pub fn method_mut(&mut self, r: MethodRef) -> &mut Method {
        &mut self.methods[r.0]
    }

    pub fn global(&self, r: GlobalRef) -> &Global {
        &self.globals[r.0]
    }

    pub fn global_mut(&mut self, r: GlobalRef) -> &mut Global {
        &mut self.globals[r.0]
    }

    pub fn instantiated_classes(&self) -> impl Iterator<Item = ClassRef> + '_ {
        (0..self.classes.len())
            .map(ClassRef)
            .filter(move |r| self.class(*r).is_instantiated)
    }

    /// Write-once: installed by the driver after it has counted typecheck
    /// usage across the whole program and decided on a dense index space.
    pub fn set_class_typecheck_indices(&mut self, indices: HashMap<ClassRef, u16>) {
        assert!(self.class_typecheck_indices.is_none(), "class typecheck indices assigned twice");
        self.class_typecheck_indices = Some(indices);
    }

    pub fn class_typecheck_index(&self, r: ClassRef) -> Option<&u16> {
        self.class_typecheck_indices.as_ref().and_then(|map| map.get(&r))
    }

    /// Assigns each global's `global_id` to its position in declaration
    /// order. Called once by the driver before walking globals (§4.6 step 6).
    pub fn finalize_global_ids(&mut self) {
        for (index, global) in self.globals.iter_mut().enumerate() {
            if global.global_id.is_none() {
                global.set_global_id(index);
            }
        }
    }
}
