//! The program-image and source-map sinks: the only channels through which
//! this crate's output reaches the outside world. Both the real serializer
//! and the real debug-info builder are out-of-scope collaborators (§1); this
//! module ships the traits they implement plus an in-memory
//! `RecordingImage`/`RecordingSourceMap` pair so the backend is independently
//! testable. See §6 and §4.7.

use std::collections::HashMap;

use crate::bytecode::Opcode;
use crate::error::BackendError;

/// A stable, app-defined index into the source map's own bookkeeping. The
/// source's `handle.register_block(...) -> handle` chaining style is
/// realized here as plain indices into `RecordingSourceMap`'s internal
/// table rather than returned trait objects, which keeps `SourceMapSink`
/// object-safe and avoids a lifetime on every handle.
pub type SourceMapHandle = usize;

/// Operations the image sink accepts, mirroring §6 verbatim. None may fail
/// once a precondition check has passed, except `cook`, which the in-memory
/// recorder can be configured to reject (used by the `BackendError::Finalize`
/// path's own tests).
pub trait ProgramImageSink {
    fn create_class(&mut self, id: u16, name: &str, instance_size_bytes: u32, is_runtime: bool);
    fn create_method(
        &mut self,
        dispatch_offset_or_neg1: i32,
        is_field_accessor: bool,
        arity: usize,
        bytecodes: Vec<u8>,
        max_height: usize,
    ) -> usize;
    fn create_block(&mut self, arity: usize, bytecodes: Vec<u8>, max_height: usize) -> usize;
    fn create_lambda(
        &mut self,
        captured_count: usize,
        arity: usize,
        bytecodes: Vec<u8>,
        max_height: usize,
    ) -> usize;
    fn absolute_bci_for(&self, method_id: usize) -> u32;
    fn patch_uint32_at(&mut self, absolute_bci: u32, value: u32);

    fn add_string(&mut self, s: &str) -> usize;
    fn add_byte_array(&mut self, bytes: &[u8]) -> usize;
    fn add_double(&mut self, d: f64) -> usize;
    fn add_integer(&mut self, i: i64) -> usize;

    fn push_null(&mut self);
    fn push_boolean(&mut self, b: bool);
    fn push_smi(&mut self, v: i64);
    fn push_large_integer(&mut self, v: i64);
    fn push_string(&mut self, s: &str);
    fn push_double(&mut self, d: f64);
    fn push_lazy_initializer_id(&mut self, id: usize);

    fn create_dispatch_table(&mut self, len: usize);
    fn set_dispatch_table_entry(&mut self, index: usize, id: usize);
    fn set_class_check_ids(&mut self, ids: Vec<u16>);
    fn set_interface_check_offsets(&mut self, offsets: Vec<u16>);
    fn create_class_bits_table(&mut self, instantiated_count: usize);
    fn create_global_variables(&mut self, count: usize);
    fn set_entry_point_index(&mut self, entry_point_slot: usize, dispatch_table_index: usize);
    fn set_invoke_bytecode_offset(&mut self, opcode: Opcode, offset: usize);

    fn cook(&mut self) -> Result<(), BackendError>;
}

/// Source-map / debug-info sink, consumed only for its side effects. A
/// passive collaborator (§1): the backend registers positions, the real
/// debug-info builder decides what to do with them.
pub trait SourceMapSink {
    fn register_selector_offset(&mut self, offset: usize, name: &str);
    fn register_method(&mut self, name: &str) -> SourceMapHandle;
    fn register_global(&mut self, name: &str) -> SourceMapHandle;
    fn register_block(&mut self, parent: SourceMapHandle) -> SourceMapHandle;
    fn register_lambda(&mut self, parent: SourceMapHandle) -> SourceMapHandle;
    fn register_call(&mut self, handle: SourceMapHandle, bci: usize, length: usize);
    fn register_as_check(&mut self, handle: SourceMapHandle, bci: usize, length: usize, type_name: &str);
    fn finalize(&mut self, handle: SourceMapHandle, method_id: usize, bytecode_length: usize);
    fn add_class_entry(&mut self, id: u16, name: &str);
    fn add_global_entry(&mut self, global_id: usize, name: &str);
}

#[derive(Debug, Clone)]
pub struct RecordedMethod {
    pub dispatch_offset_or_neg1: i32,
    pub is_field_accessor: bool,
    pub arity: usize,
    pub bytecodes: Vec<u8>,
    pub max_height: usize,
    pub base_bci: u32,
}

#[derive(Debug, Clone)]
pub struct RecordedClass {
    pub id: u16,
    pub name: String,
    pub instance_size_bytes: u32,
    pub is_runtime: bool,
}

/// In-memory image sink used by the driver's own tests and the CLI harness.
/// Lays every method's bytecode end-to-end in one flat buffer so
/// `absolute_bci_for`/`patch_uint32_at` behave like a real serialized image.
#[derive(Debug, Default)]
pub struct RecordingImage {
    pub classes: Vec<RecordedClass>,
    pub methods: Vec<RecordedMethod>,
    pub flat_bytecode: Vec<u8>,
    pub strings: Vec<String>,
    pub byte_arrays: Vec<Vec<u8>>,
    pub doubles: Vec<f64>,
    pub integers: Vec<i64>,
    pub global_initial_values: Vec<GlobalInitialValue>,
    pub dispatch_table: Vec<Option<usize>>,
    pub class_check_ids: Vec<u16>,
    pub interface_check_offsets: Vec<u16>,
    pub class_bits_table_len: Option<usize>,
    pub global_variable_count: Option<usize>,
    pub entry_points: HashMap<usize, usize>,
    pub invoke_bytecode_offsets: HashMap<Opcode, usize>,
    pub cooked: bool,
    /// When set, `cook` returns this as an error instead of succeeding;
    /// exercises the `BackendError::Finalize` path in tests.
    pub reject_finalize: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GlobalInitialValue {
    Null,
    Boolean(bool),
    Smi(i64),
    LargeInteger(i64),
    String(String),
    Double(f64),
    LazyInitializer(usize),
}

impl ProgramImageSink for RecordingImage {
    fn create_class(&mut self, id: u16, name: &str, instance_size_bytes: u32, is_runtime: bool) {
        self.classes.push(RecordedClass {
            id,
            name: name.to_string(),
            instance_size_bytes,
            is_runtime,
        });
    }

    fn create_method(
        &mut self,
        dispatch_offset_or_neg1: i32,
        is_field_accessor: bool,
        arity: usize,
        bytecodes: Vec<u8>,
        max_height: usize,
    ) -> usize {
        self.place(dispatch_offset_or_neg1, is_field_accessor, arity, bytecodes, max_height)
    }

    fn create_block(&mut self, arity: usize, bytecodes: Vec<u8>, max_height: usize) -> usize {
        self.place(-1, false, arity, bytecodes, max_height)
    }

    fn create_lambda(&mut self, _captured_count: usize, arity: usize, bytecodes: Vec<u8>, max_height: usize) -> usize {
        self.place(-1, false, arity, bytecodes, max_height)
    }

    fn absolute_bci_for(&self, method_id: usize) -> u32 {
        self.methods[method_id].base_bci
    }

    fn patch_uint32_at(&mut self, absolute_bci: u32, value: u32) {
        let at = absolute_bci as usize;
        self.flat_bytecode[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn add_string(&mut self, s: &str) -> usize {
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    fn add_byte_array(&mut self, bytes: &[u8]) -> usize {
        self.byte_arrays.push(bytes.to_vec());
        self.byte_arrays.len() - 1
    }

    fn add_double(&mut self, d: f64) -> usize {
        self.doubles.push(d);
        self.doubles.len() - 1
    }

    fn add_integer(&mut self, i: i64) -> usize {
        self.integers.push(i);
        self.integers.len() - 1
    }

    fn push_null(&mut self) {
        self.global_initial_values.push(GlobalInitialValue::Null);
    }

    fn push_boolean(&mut self, b: bool) {
        self.global_initial_values.push(GlobalInitialValue::Boolean(b));
    }

    fn push_smi(&mut self, v: i64) {
        self.global_initial_values.push(GlobalInitialValue::Smi(v));
    }

    fn push_large_integer(&mut self, v: i64) {
        self.global_initial_values.push(GlobalInitialValue::LargeInteger(v));
    }

    fn push_string(&mut self, s: &str) {
        self.global_initial_values.push(GlobalInitialValue::String(s.to_string()));
    }

    fn push_double(&mut self, d: f64) {
        self.global_initial_values.push(GlobalInitialValue::Double(d));
    }

    fn push_lazy_initializer_id(&mut self, id: usize) {
        self.global_initial_values.push(GlobalInitialValue::LazyInitializer(id));
    }

    fn create_dispatch_table(&mut self, len: usize) {
        self.dispatch_table = vec![None; len];
    }

    fn set_dispatch_table_entry(&mut self, index: usize, id: usize) {
        self.dispatch_table[index] = Some(id);
    }

    fn set_class_check_ids(&mut self, ids: Vec<u16>) {
        self.class_check_ids = ids;
    }

    fn set_interface_check_offsets(&mut self, offsets: Vec<u16>) {
        self.interface_check_offsets = offsets;
    }

    fn create_class_bits_table(&mut self, instantiated_count: usize) {
        self.class_bits_table_len = Some(instantiated_count);
    }

    fn create_global_variables(&mut self, count: usize) {
        self.global_variable_count = Some(count);
    }

    fn set_entry_point_index(&mut self, entry_point_slot: usize, dispatch_table_index: usize) {
        self.entry_points.insert(entry_point_slot, dispatch_table_index);
    }

    fn set_invoke_bytecode_offset(&mut self, opcode: Opcode, offset: usize) {
        self.invoke_bytecode_offsets.insert(opcode, offset);
    }

    fn cook(&mut self) -> Result<(), BackendError> {
        if let Some(reason) = self.reject_finalize.clone() {
            return Err(BackendError::Finalize(reason));
        }
        self.cooked = true;
        Ok(())
    }
}

impl RecordingImage {
    fn place(
        &mut self,
        dispatch_offset_or_neg1: i32,
        is_field_accessor: bool,
        arity: usize,
        bytecodes: Vec<u8>,
        max_height: usize,
    ) -> usize {
        let base_bci = self.flat_bytecode.len() as u32;
        self.flat_bytecode.extend_from_slice(&bytecodes);
        self.methods.push(RecordedMethod {
            dispatch_offset_or_neg1,
            is_field_accessor,
            arity,
            bytecodes,
            max_height,
            base_bci,
        });
        self.methods.len() - 1
    }
}

#[derive(Debug, Clone)]
struct RecordedAsCheck {
    bci: usize,
    length: usize,
    type_name: String,
}

#[derive(Debug, Clone, Default)]
struct SourceMapEntry {
    name: String,
    parent: Option<SourceMapHandle>,
    calls: Vec<(usize, usize)>,
    as_checks: Vec<RecordedAsCheck>,
    finalized_method_id: Option<usize>,
}

/// In-memory source-map sink; records enough to assert "every `as`-check
/// position was recorded" style properties in tests without depending on a
/// real debug-info format.
#[derive(Debug, Default)]
pub struct RecordingSourceMap {
    entries: Vec<SourceMapEntry>,
    pub selector_offsets: HashMap<usize, String>,
    pub class_entries: Vec<(u16, String)>,
    pub global_entries: Vec<(usize, String)>,
}

impl RecordingSourceMap {
    pub fn entry(&self, handle: SourceMapHandle) -> &SourceMapEntry {
        &self.entries[handle]
    }

    fn push_entry(&mut self, name: String, parent: Option<SourceMapHandle>) -> SourceMapHandle {
        self.entries.push(SourceMapEntry {
            name,
            parent,
            ..Default::default()
        });
        self.entries.len() - 1
    }
}

impl SourceMapSink for RecordingSourceMap {
    fn register_selector_offset(&mut self, offset: usize, name: &str) {
        self.selector_offsets.insert(offset, name.to_string());
    }

    fn register_method(&mut self, name: &str) -> SourceMapHandle {
        self.push_entry(name.to_string(), None)
    }

    fn register_global(&mut self, name: &str) -> SourceMapHandle {
        self.push_entry(name.to_string(), None)
    }

    fn register_block(&mut self, parent: SourceMapHandle) -> SourceMapHandle {
        self.push_entry(format!("{}:block", self.entries[parent].name), Some(parent))
    }

    fn register_lambda(&mut self, parent: SourceMapHandle) -> SourceMapHandle {
        self.push_entry(format!("{}:lambda", self.entries[parent].name), Some(parent))
    }

    fn register_call(&mut self, handle: SourceMapHandle, bci: usize, length: usize) {
        self.entries[handle].calls.push((bci, length));
    }

    fn register_as_check(&mut self, handle: SourceMapHandle, bci: usize, length: usize, type_name: &str) {
        self.entries[handle].as_checks.push(RecordedAsCheck {
            bci,
            length,
            type_name: type_name.to_string(),
        });
    }

    fn finalize(&mut self, handle: SourceMapHandle, method_id: usize, _bytecode_length: usize) {
        self.entries[handle].finalized_method_id = Some(method_id);
    }

    fn add_class_entry(&mut self, id: u16, name: &str) {
        self.class_entries.push((id, name.to_string()));
    }

    fn add_global_entry(&mut self, global_id: usize, name: &str) {
        self.global_entries.push((global_id, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_get_stable_increasing_ids() {
        let mut image = RecordingImage::default();
        let a = image.create_method(-1, false, 0, vec![0x01], 1);
        let b = image.create_method(-1, false, 0, vec![0x02], 1);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(image.absolute_bci_for(b), 1);
    }

    #[test]
    fn patch_uint32_at_rewrites_the_placeholder() {
        let mut image = RecordingImage::default();
        image.create_method(-1, false, 0, vec![0, 0, 0, 0, 0], 0);
        image.patch_uint32_at(1, 0xdead_beef);
        assert_eq!(&image.flat_bytecode[1..5], &0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn cook_can_be_made_to_fail() {
        let mut image = RecordingImage {
            reject_finalize: Some("sink rejected".to_string()),
            ..Default::default()
        };
        assert!(image.cook().is_err());
    }
}
