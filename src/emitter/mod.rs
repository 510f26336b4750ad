//! Stack-tracked bytecode assembler for one function (method, block, or
//! lambda). Appends opcodes, tracks the abstract expression stack, performs
//! the peephole fusions from §4.2, and picks narrow/wide encodings. See §2.

mod label;

pub use label::{AbsoluteLabel, Label};

use crate::bytecode::Opcode;

/// What an expression-stack slot holds. The walker uses this to assert the
/// stack shape it expects without carrying full type information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackTag {
    Object,
    Block,
    BlockConstructionToken,
}

/// Which invoke-virtual form to emit: ordinary call, getter, or setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeVirtualKind {
    Normal,
    Getter,
    Setter,
}

/// The 18 built-in operator opcodes addressed by dispatch-table shortcut
/// offsets (§4.3 step 6 / §6 GLOSSARY "Shortcut opcode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    Eq,
    Lt,
    Gt,
    Lte,
    Gte,
    BitOr,
    BitXor,
    BitAnd,
    BitShl,
    BitShr,
    BitUshr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    At,
    AtPut,
}

impl Operator {
    pub const ALL: &'static [Operator] = &[
        Operator::Eq,
        Operator::Lt,
        Operator::Gt,
        Operator::Lte,
        Operator::Gte,
        Operator::BitOr,
        Operator::BitXor,
        Operator::BitAnd,
        Operator::BitShl,
        Operator::BitShr,
        Operator::BitUshr,
        Operator::Add,
        Operator::Sub,
        Operator::Mul,
        Operator::Div,
        Operator::Mod,
        Operator::At,
        Operator::AtPut,
    ];

    /// The selector name the dispatch table knows this operator by, e.g.
    /// `"=="` for `Eq`. Used to build the operator's `DispatchSelector`
    /// when computing shortcut offsets (§4.3 step 6).
    pub const fn selector_name(self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::BitAnd => "&",
            Operator::BitShl => "<<",
            Operator::BitShr => ">>",
            Operator::BitUshr => ">>>",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::At => "[]",
            Operator::AtPut => "[]=",
        }
    }

    /// Arity of the operator's call shape, implicit receiver included.
    pub const fn arity(self) -> usize {
        match self {
            Operator::AtPut => 3,
            _ => 2,
        }
    }

    pub const fn opcode(self) -> Opcode {
        match self {
            Operator::Eq => Opcode::InvokeEq,
            Operator::Lt => Opcode::InvokeLt,
            Operator::Gt => Opcode::InvokeGt,
            Operator::Lte => Opcode::InvokeLte,
            Operator::Gte => Opcode::InvokeGte,
            Operator::BitOr => Opcode::InvokeBitOr,
            Operator::BitXor => Opcode::InvokeBitXor,
            Operator::BitAnd => Opcode::InvokeBitAnd,
            Operator::BitShl => Opcode::InvokeBitShl,
            Operator::BitShr => Opcode::InvokeBitShr,
            Operator::BitUshr => Opcode::InvokeBitUshr,
            Operator::Add => Opcode::InvokeAdd,
            Operator::Sub => Opcode::InvokeSub,
            Operator::Mul => Opcode::InvokeMul,
            Operator::Div => Opcode::InvokeDiv,
            Operator::Mod => Opcode::InvokeMod,
            Operator::At => Opcode::InvokeAt,
            Operator::AtPut => Opcode::InvokeAtPut,
        }
    }
}

/// Discriminator for the `HALT` instruction's single byte operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltKind {
    Exit,
    Yield,
    DeepSleep,
}

/// Assembles one function's bytecode. Owned by the walker for the lifetime
/// of that function's body (§5 "Resources are scoped").
pub struct Emitter {
    bytes: Vec<u8>,
    opcode_starts: Vec<usize>,
    stack: Vec<StackTag>,
    max_height: usize,
    arity: usize,
    /// Peephole rewrites are only ever applied to the suffix after the last
    /// bound label, so a fusion can never silently invalidate a forward
    /// branch's recorded displacement offset.
    last_bound_position: usize,
}

impl Emitter {
    pub fn new(arity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            opcode_starts: Vec::new(),
            stack: Vec::new(),
            max_height: 0,
            arity,
            last_bound_position: 0,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn height(&self) -> usize {
        self.stack.len()
    }

    pub fn max_height(&self) -> usize {
        self.max_height
    }

    pub fn bci(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn push(&mut self, tag: StackTag) {
        self.stack.push(tag);
        self.max_height = self.max_height.max(self.stack.len());
    }

    fn pop_tags(&mut self, n: usize) {
        assert!(
            self.stack.len() >= n,
            "stack underflow: popping {n} from height {}",
            self.stack.len()
        );
        for _ in 0..n {
            self.stack.pop();
        }
    }

    /// Adjust the abstract stack height without emitting any bytecode: used
    /// where control has already left via a return, non-local branch, or
    /// unconditional jump, so a trailing pop would be dead code (§4.5
    /// "Sequence" / "avoid popping locals ... it is dead code").
    pub fn forget(&mut self, n: usize) {
        self.pop_tags(n);
    }

    /// The counterpart of `forget`: record that `n` values of `tag` are
    /// logically present without emitting a push, used after a call whose
    /// bytecode already accounts for its own result (e.g. a tail call).
    pub fn remember(&mut self, n: usize, tag: StackTag) {
        for _ in 0..n {
            self.push(tag);
        }
    }

    fn record_opcode(&mut self, start: usize) {
        self.opcode_starts.push(start);
    }

    fn last_opcode_start(&self) -> Option<usize> {
        self.opcode_starts.last().copied()
    }

    /// Whether a peephole rewrite may still touch the byte range starting at
    /// `at`: only the suffix after the last bound label is mutable.
    fn may_rewrite_from(&self, at: usize) -> bool {
        at >= self.last_bound_position
    }

    fn emit_u8(&mut self, opcode: Opcode, operand: u8) {
        let start = self.bci();
        self.bytes.push(opcode as u8);
        self.bytes.push(operand);
        self.record_opcode(start);
    }

    fn emit_u16(&mut self, opcode: Opcode, operand: u16) {
        let start = self.bci();
        self.bytes.push(opcode as u8);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
        self.record_opcode(start);
    }

    fn emit_u32(&mut self, opcode: Opcode, operand: u32) {
        let start = self.bci();
        self.bytes.push(opcode as u8);
        self.bytes.extend_from_slice(&operand.to_be_bytes());
        self.record_opcode(start);
    }

    fn emit_plain(&mut self, opcode: Opcode) {
        let start = self.bci();
        self.bytes.push(opcode as u8);
        self.record_opcode(start);
    }

    /// Picks the narrow or wide form of a `(narrow, wide)` opcode pair based
    /// on whether `operand` fits in a byte, matching §4.2: "the emitter
    /// picks the narrow form if the operand fits ... and the instruction is
    /// not a back-branch target whose displacement grew" (back-branch
    /// growth is handled by `branch_back`, which never calls this path).
    fn emit_narrow_or_wide(&mut self, narrow: Opcode, wide: Opcode, operand: u32) {
        debug_assert_eq!(wide, narrow.wide().expect("opcode has no wide form"));
        if operand <= u8::MAX as u32 {
            self.emit_u8(narrow, operand as u8);
        } else {
            assert!(operand <= u16::MAX as u32, "operand exceeds 16 bits");
            self.emit_u16(wide, operand as u16);
        }
    }

    // ---- locals ---------------------------------------------------

    pub fn load_local(&mut self, index: usize, tag: StackTag) {
        match index {
            0..=5 => {
                let op = [
                    Opcode::LoadLocal0,
                    Opcode::LoadLocal1,
                    Opcode::LoadLocal2,
                    Opcode::LoadLocal3,
                    Opcode::LoadLocal4,
                    Opcode::LoadLocal5,
                ][index];
                self.emit_plain(op);
            }
            _ => self.emit_narrow_or_wide(Opcode::LoadLocal, Opcode::LoadLocalWide, index as u32),
        }
        self.push(tag);
    }

    /// `STORE_LOCAL` has no wide form in the table (locals beyond 255 are a
    /// front-end sizing concern); `store_local` asserts the operand fits.
    pub fn store_local(&mut self, index: usize) {
        assert!(index <= u8::MAX as usize, "local index exceeds 8 bits");
        self.emit_u8(Opcode::StoreLocal, index as u8);
    }

    pub fn load_outer(&mut self, index: usize, tag: StackTag) {
        self.emit_u8(Opcode::LoadOuter, index as u8);
        self.push(tag);
    }

    pub fn store_outer(&mut self, index: usize) {
        self.emit_u8(Opcode::StoreOuter, index as u8);
    }

    /// `POP n` for effect; applies the `POP a + POP b -> POP (a+b)` and
    /// `POP v; LOAD_LOCAL n -> decrement POP, POP_LOAD_LOCAL` fusions.
    pub fn pop(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if n == 1 {
            if let Some(start) = self.last_opcode_start() {
                if self.may_rewrite_from(start) && self.bytes[start] == Opcode::StoreLocal as u8 {
                    let index = self.bytes[start + 1];
                    self.bytes.truncate(start);
                    self.opcode_starts.pop();
                    self.pop_tags(1);
                    self.emit_u8(Opcode::StoreLocalPop, index);
                    return;
                }
                if self.may_rewrite_from(start) && self.bytes[start] == Opcode::StoreField as u8 {
                    let index = self.bytes[start + 1];
                    self.bytes.truncate(start);
                    self.opcode_starts.pop();
                    self.pop_tags(1);
                    self.emit_u8(Opcode::StoreFieldPop, index);
                    return;
                }
            }
        }
        if let Some(start) = self.last_opcode_start() {
            if self.may_rewrite_from(start) && self.bytes[start] == Opcode::Pop as u8 {
                let prev = self.bytes[start + 1] as usize;
                let total = prev + n;
                self.bytes.truncate(start);
                self.opcode_starts.pop();
                self.pop_tags(n);
                if total == 1 {
                    self.emit_plain(Opcode::Pop1);
                } else if total <= u8::MAX as usize {
                    self.emit_u8(Opcode::Pop, total as u8);
                } else {
                    // Wide split: emit as many POP 255 as needed, then the remainder.
                    let mut remaining = total;
                    while remaining > u8::MAX as usize {
                        self.emit_u8(Opcode::Pop, u8::MAX);
                        remaining -= u8::MAX as usize;
                    }
                    if remaining == 1 {
                        self.emit_plain(Opcode::Pop1);
                    } else {
                        self.emit_u8(Opcode::Pop, remaining as u8);
                    }
                }
                return;
            }
            if self.may_rewrite_from(start) && self.bytes[start] == Opcode::Pop1 as u8 {
                let total = 1 + n;
                self.bytes.truncate(start);
                self.opcode_starts.pop();
                self.pop_tags(n);
                if total <= u8::MAX as usize {
                    self.emit_u8(Opcode::Pop, total as u8);
                } else {
                    self.emit_u8(Opcode::Pop, u8::MAX);
                    self.emit_u8(Opcode::Pop, (total - u8::MAX as usize) as u8);
                }
                return;
            }
        }
        self.pop_tags(n);
        if n == 1 {
            self.emit_plain(Opcode::Pop1);
        } else {
            let mut remaining = n;
            while remaining > u8::MAX as usize {
                self.emit_u8(Opcode::Pop, u8::MAX);
                remaining -= u8::MAX as usize;
            }
            self.emit_u8(Opcode::Pop, remaining as u8);
        }
    }

    /// `POP 1; RET_NULL -> RETURN_NULL`, applied by `return_null`, and the
    /// local/field fusions, applied here right after a `pop(1)`-then-load
    /// or store-then-pop pattern is detected.
    pub fn load_field(&mut self, field_index: usize, tag: StackTag) {
        if let Some(start) = self.last_opcode_start() {
            if self.may_rewrite_from(start) && field_index < 16 {
                let local_index = match self.bytes[start] {
                    op if op == Opcode::LoadLocal0 as u8 => Some(0),
                    op if op == Opcode::LoadLocal1 as u8 => Some(1),
                    op if op == Opcode::LoadLocal2 as u8 => Some(2),
                    op if op == Opcode::LoadLocal3 as u8 => Some(3),
                    op if op == Opcode::LoadLocal4 as u8 => Some(4),
                    op if op == Opcode::LoadLocal5 as u8 => Some(5),
                    op if op == Opcode::LoadLocal as u8 && (self.bytes[start + 1] as usize) < 16 => {
                        Some(self.bytes[start + 1] as usize)
                    }
                    _ => None,
                };
                if let Some(local) = local_index {
                    self.bytes.truncate(start);
                    self.opcode_starts.pop();
                    // the LOAD_LOCAL already pushed a tag; replace it with
                    // the field's tag since the net stack effect is the same.
                    self.stack.pop();
                    self.emit_u8(Opcode::LoadFieldLocal, ((field_index << 4) | local) as u8);
                    self.push(tag);
                    return;
                }
            }
        }
        self.emit_narrow_or_wide(Opcode::LoadField, Opcode::LoadFieldWide, field_index as u32);
        self.pop_tags(1);
        self.push(tag);
    }

    /// Leaves the stored value on the stack (the receiver's slot is
    /// repurposed as the result), mirroring `store_local`'s
    /// assignment-as-expression convention; a trailing `pop(1)` fuses into
    /// `STORE_FIELD_POP` for the common for-effect case.
    pub fn store_field(&mut self, field_index: usize) {
        self.emit_narrow_or_wide(Opcode::StoreField, Opcode::StoreFieldWide, field_index as u32);
        self.pop_tags(1);
    }

    // ---- literals ---------------------------------------------------

    pub fn load_null(&mut self) {
        self.emit_plain(Opcode::LoadNull);
        self.push(StackTag::Object);
    }

    pub fn load_smi(&mut self, value: i64, literal_index_for_large: impl FnOnce() -> usize) {
        match value {
            0 => self.emit_plain(Opcode::LoadSmi0),
            1 => self.emit_plain(Opcode::LoadSmi1),
            2..=255 => self.emit_u8(Opcode::LoadSmiU8, value as u8),
            256..=65535 => self.emit_u16(Opcode::LoadSmiU16, value as u16),
            65536..=4294967295 => self.emit_u32(Opcode::LoadSmiU32, value as u32),
            _ => {
                let index = literal_index_for_large();
                self.emit_narrow_or_wide(Opcode::LoadLiteral, Opcode::LoadLiteralWide, index as u32);
            }
        }
        self.push(StackTag::Object);
    }

    pub fn load_literal(&mut self, index: usize) {
        self.emit_narrow_or_wide(Opcode::LoadLiteral, Opcode::LoadLiteralWide, index as u32);
        self.push(StackTag::Object);
    }

    // ---- globals ---------------------------------------------------

    pub fn load_global(&mut self, index: usize, lazy: bool) {
        let (narrow, wide) = if lazy {
            (Opcode::LoadGlobalVarLazy, Opcode::LoadGlobalVarLazyWide)
        } else {
            (Opcode::LoadGlobalVar, Opcode::LoadGlobalVarWide)
        };
        self.emit_narrow_or_wide(narrow, wide, index as u32);
        self.push(StackTag::Object);
    }

    pub fn store_global(&mut self, index: usize) {
        self.emit_narrow_or_wide(Opcode::StoreGlobalVar, Opcode::StoreGlobalVarWide, index as u32);
        self.pop_tags(1);
    }

    // ---- allocation / typechecks ---------------------------------------

    pub fn allocate(&mut self, class_id: usize) {
        self.emit_narrow_or_wide(Opcode::Allocate, Opcode::AllocateWide, class_id as u32);
        self.push(StackTag::Object);
    }

    fn typecheck_operand(type_index: usize, nullable: bool) -> u32 {
        ((type_index as u32) << 1) | (nullable as u32)
    }

    pub fn is_class(&mut self, type_index: usize, nullable: bool) {
        self.emit_narrow_or_wide(
            Opcode::IsClass,
            Opcode::IsClassWide,
            Self::typecheck_operand(type_index, nullable),
        );
        self.pop_tags(1);
        self.push(StackTag::Object);
    }

    pub fn is_interface(&mut self, selector_offset: usize, nullable: bool) {
        self.emit_narrow_or_wide(
            Opcode::IsInterface,
            Opcode::IsInterfaceWide,
            Self::typecheck_operand(selector_offset, nullable),
        );
        self.pop_tags(1);
        self.push(StackTag::Object);
    }

    pub fn as_class(&mut self, type_index: usize, nullable: bool) {
        self.emit_narrow_or_wide(
            Opcode::AsClass,
            Opcode::AsClassWide,
            Self::typecheck_operand(type_index, nullable),
        );
    }

    pub fn as_interface(&mut self, selector_offset: usize, nullable: bool) {
        self.emit_narrow_or_wide(
            Opcode::AsInterface,
            Opcode::AsInterfaceWide,
            Self::typecheck_operand(selector_offset, nullable),
        );
    }

    /// Fused `as T` on a local, valid only when `local_index < 8 && type_index < 32`.
    pub fn as_local(&mut self, local_index: usize, type_index: usize) {
        debug_assert!(local_index < 8 && type_index < 32);
        let operand = ((type_index as u8) << 3) | local_index as u8;
        self.emit_u8(Opcode::AsLocal, operand);
    }

    // ---- calls ---------------------------------------------------

    pub fn invoke_static(&mut self, dispatch_index: usize, args: usize, result_tag: StackTag) {
        self.emit_u16(Opcode::InvokeStatic, dispatch_index as u16);
        self.pop_tags(args);
        self.push(result_tag);
    }

    pub fn invoke_static_tail(&mut self, dispatch_index: usize, arity: usize, locals_to_drop: usize) {
        let start = self.bci();
        self.bytes.push(Opcode::InvokeStaticTail as u8);
        self.bytes.extend_from_slice(&(dispatch_index as u16).to_be_bytes());
        self.bytes.push(arity as u8);
        self.bytes.push(locals_to_drop as u8);
        self.record_opcode(start);
    }

    pub fn invoke_block(&mut self, block_local: usize, args: usize) {
        self.emit_u8(Opcode::InvokeBlock, block_local as u8);
        self.pop_tags(args);
        self.push(StackTag::Object);
    }

    pub fn invoke_virtual(&mut self, offset: usize, args: usize, kind: InvokeVirtualKind) {
        match kind {
            InvokeVirtualKind::Normal => {
                self.emit_narrow_or_wide_invoke(args, offset);
            }
            InvokeVirtualKind::Getter => self.emit_u16(Opcode::InvokeVirtualGet, offset as u16),
            InvokeVirtualKind::Setter => self.emit_u16(Opcode::InvokeVirtualSet, offset as u16),
        }
        self.pop_tags(args);
        self.push(StackTag::Object);
    }

    fn emit_narrow_or_wide_invoke(&mut self, args: usize, offset: usize) {
        let start = self.bci();
        if args <= u8::MAX as usize {
            self.bytes.push(Opcode::InvokeVirtual as u8);
            self.bytes.push(args as u8);
            self.bytes.extend_from_slice(&(offset as u16).to_be_bytes());
        } else {
            self.bytes.push(Opcode::InvokeVirtualWide as u8);
            self.bytes.extend_from_slice(&(args as u16).to_be_bytes());
            self.bytes.extend_from_slice(&(offset as u16).to_be_bytes());
        }
        self.record_opcode(start);
    }

    pub fn invoke_operator(&mut self, operator: Operator) {
        self.emit_plain(operator.opcode());
        self.pop_tags(operator.arity());
        self.push(StackTag::Object);
    }

    // ---- branches ---------------------------------------------------

    /// Forward unconditional/conditional branch. Pops the condition for
    /// conditional forms.
    pub fn branch_forward(&mut self, opcode: Opcode, label: &mut Label) {
        let consumes_condition = matches!(opcode, Opcode::BranchIfTrue | Opcode::BranchIfFalse);
        if consumes_condition {
            self.pop_tags(1);
        }
        let start = self.bci();
        self.bytes.push(opcode as u8);
        let placeholder_at = self.bci();
        self.bytes.extend_from_slice(&[0, 0]);
        self.record_opcode(start);
        label.add_pending_use(placeholder_at, self.height());
    }

    pub fn bind(&mut self, label: &mut Label) {
        label.bind(&mut self.bytes, self.bci(), self.height());
        self.last_bound_position = self.bci();
    }

    pub fn bind_absolute(&mut self, label: &AbsoluteLabel) {
        label
            .local_label_mut()
            .bind(&mut self.bytes, self.bci(), self.height());
        self.last_bound_position = self.bci();
    }

    /// Backward branch to an already-bound label, choosing narrow/wide by
    /// the resulting displacement.
    pub fn branch_back(&mut self, opcode_narrow: Opcode, opcode_wide: Opcode, target_bci: usize, consumes_condition: bool) {
        if consumes_condition {
            self.pop_tags(1);
        }
        let start = self.bci();
        // account for the narrow form's own length when computing displacement
        let narrow_len = opcode_narrow.length() as usize;
        let displacement = start + narrow_len - target_bci;
        if displacement <= u8::MAX as usize {
            self.emit_u8(opcode_narrow, displacement as u8);
        } else {
            let wide_len = opcode_wide.length() as usize;
            let displacement = start + wide_len - target_bci;
            assert!(displacement <= u16::MAX as usize, "back-branch displacement exceeds 16 bits");
            self.emit_u16(opcode_wide, displacement as u16);
        }
    }

    /// Emits a non-local branch with a 32-bit placeholder, returning its
    /// local byte offset so the caller can turn it into an absolute bci once
    /// this function is placed in the image.
    pub fn non_local_branch(&mut self, locals_to_drop: usize) -> usize {
        let start = self.bci();
        self.bytes.push(Opcode::NonLocalBranch as u8);
        self.bytes.push(locals_to_drop as u8);
        let placeholder_at = self.bci();
        self.bytes.extend_from_slice(&[0, 0, 0, 0]);
        self.record_opcode(start);
        placeholder_at
    }

    // ---- returns, try/finally, misc ---------------------------------------------------

    pub fn return_value(&mut self, height: usize, arity: usize) {
        if let Some(start) = self.last_opcode_start() {
            if self.may_rewrite_from(start) && self.bytes[start] == Opcode::Pop1 as u8 {
                // POP_1 + RET_NULL -> RETURN_NULL, height bumped back by 1.
                self.bytes.truncate(start);
                self.opcode_starts.pop();
                self.emit_return_null(height + 1, arity);
                return;
            }
        }
        self.pop_tags(1);
        self.emit_u8_u8(Opcode::Return, height as u8, arity as u8);
    }

    pub fn return_null(&mut self, height: usize, arity: usize) {
        self.emit_return_null(height, arity);
    }

    fn emit_return_null(&mut self, height: usize, arity: usize) {
        self.emit_u8_u8(Opcode::ReturnNull, height as u8, arity as u8);
    }

    fn emit_u8_u8(&mut self, opcode: Opcode, a: u8, b: u8) {
        let start = self.bci();
        self.bytes.push(opcode as u8);
        self.bytes.push(a);
        self.bytes.push(b);
        self.record_opcode(start);
    }

    /// Duplicates the top stack value. Used by `LogicalBinary`'s for-value
    /// short-circuit lowering: the left operand's value is kept around to
    /// become the whole expression's result if it decides the outcome.
    pub fn dup(&mut self) {
        let tag = *self.stack.last().expect("dup on empty stack");
        self.emit_plain(Opcode::Dup);
        self.push(tag);
    }

    /// Non-local return: pops the one return value, targeting the outer
    /// function's frame at `outer_height`/`outer_arity` (walked from the
    /// enclosing-emitter stack by the caller). Always emitted in its wide
    /// form: height and arity each need their own 16-bit field, so there is
    /// no narrower encoding worth picking between.
    pub fn non_local_return(&mut self, outer_height: usize, outer_arity: usize) {
        self.pop_tags(1);
        let start = self.bci();
        self.bytes.push(Opcode::NonLocalReturnWide as u8);
        self.bytes.extend_from_slice(&(outer_height as u16).to_be_bytes());
        self.bytes.extend_from_slice(&(outer_arity as u16).to_be_bytes());
        self.record_opcode(start);
    }

    pub fn throw(&mut self, locals_to_drop: usize) {
        self.emit_u8(Opcode::Throw, locals_to_drop as u8);
        self.pop_tags(1);
    }

    /// Reserves the 4 stack slots try/finally bookkeeping needs (exception,
    /// reason, two internal words). See §4.5 "Try/finally".
    pub fn link(&mut self) {
        self.emit_u8(Opcode::Link, 0);
        for _ in 0..4 {
            self.push(StackTag::Object);
        }
    }

    pub fn unlink(&mut self) {
        self.emit_u8(Opcode::Unlink, 0);
        self.pop_tags(4);
    }

    pub fn unwind(&mut self) {
        self.emit_plain(Opcode::Unwind);
    }

    pub fn primitive(&mut self, module: u8, index: u16) {
        assert_eq!(self.height(), 0, "primitive invoked on a non-empty expression stack");
        let start = self.bci();
        self.bytes.push(Opcode::Primitive as u8);
        self.bytes.push(module);
        self.bytes.extend_from_slice(&index.to_be_bytes());
        self.record_opcode(start);
    }

    pub fn halt(&mut self, kind: HaltKind) {
        let discriminator = match kind {
            HaltKind::Exit => 0,
            HaltKind::Yield => 1,
            HaltKind::DeepSleep => 2,
        };
        self.emit_u8(Opcode::Halt, discriminator);
    }

    pub fn intrinsic(&mut self, opcode: Opcode) {
        debug_assert!(matches!(
            opcode,
            Opcode::IntrinsicSmiRepeat
                | Opcode::IntrinsicArrayDo
                | Opcode::IntrinsicHashFind
                | Opcode::IntrinsicHashDo
        ));
        self.emit_plain(opcode);
    }

    pub fn load_block(&mut self, method_id: usize) {
        self.emit_u8(Opcode::LoadBlock, method_id as u8);
        self.push(StackTag::Block);
    }

    pub fn load_outer_block(&mut self, method_id: usize) {
        self.emit_u8(Opcode::LoadOuterBlock, method_id as u8);
        self.push(StackTag::Block);
    }

    pub fn push_block_construction_token(&mut self) {
        self.push(StackTag::BlockConstructionToken);
    }

    /// Replace the token pushed before assembling a nested function with the
    /// created method reference, per §4.5 ("replaces the token with the
    /// created method reference").
    pub fn replace_block_construction_token(&mut self, method_id: usize, is_outer_capture: bool) {
        assert_eq!(
            self.stack.pop(),
            Some(StackTag::BlockConstructionToken),
            "expected a block-construction token on top of the stack"
        );
        if is_outer_capture {
            self.load_outer_block(method_id);
        } else {
            self.load_block(method_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_local_fast_forms_are_single_byte() {
        let mut emitter = Emitter::new(0);
        emitter.load_local(3, StackTag::Object);
        assert_eq!(emitter.bytes(), &[Opcode::LoadLocal3 as u8]);
        assert_eq!(emitter.height(), 1);
    }

    #[test]
    fn pop_fuses_with_preceding_pop() {
        let mut emitter = Emitter::new(0);
        emitter.load_local(0, StackTag::Object);
        emitter.load_local(0, StackTag::Object);
        emitter.load_local(0, StackTag::Object);
        emitter.pop(2);
        emitter.pop(1);
        // Final state: one fused POP 3 (or POP_1 variants); never POP 2 then POP 1 as two instructions.
        let pop_opcodes: Vec<u8> = emitter
            .bytes()
            .iter()
            .filter(|&&b| b == Opcode::Pop as u8 || b == Opcode::Pop1 as u8)
            .copied()
            .collect();
        assert_eq!(pop_opcodes.len(), 1);
    }

    #[test]
    fn load_field_fuses_with_preceding_load_local() {
        let mut emitter = Emitter::new(0);
        emitter.load_local(3, StackTag::Object);
        emitter.load_field(2, StackTag::Object);
        assert_eq!(emitter.bytes(), &[Opcode::LoadFieldLocal as u8, (2 << 4) | 3]);
        assert_eq!(emitter.height(), 1);
    }

    #[test]
    fn pop1_then_return_null_fuses_to_return_null() {
        let mut emitter = Emitter::new(1);
        emitter.load_null();
        emitter.pop(1);
        emitter.return_null(0, 1);
        assert_eq!(emitter.bytes()[0], Opcode::ReturnNull as u8);
        assert_eq!(emitter.bytes().len(), 3);
    }

    #[test]
    fn forward_branch_patches_correct_displacement() {
        let mut emitter = Emitter::new(0);
        let mut label = Label::new();
        emitter.load_smi(1, || unreachable!());
        emitter.branch_forward(Opcode::BranchIfTrue, &mut label);
        emitter.load_smi(2, || unreachable!());
        emitter.bind(&mut label);
        assert!(label.is_bound());
    }
}
