use super::format::BytecodeFormat;

/// Declares the opcode table once and derives the enum, its mnemonics, its
/// wire formats, and the `ALL` slice from it. This replaces the source's
/// macro-expansion style (`BYTECODES(BYTECODE)` re-included for the enum,
/// the length table, and the disassembler) with one array that every
/// consumer reads, per the redesign guidance: one bytecode table, not three
/// copies that can drift apart.
macro_rules! opcode_table {
    ($($variant:ident, $format:ident, $mnemonic:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub const fn format(self) -> BytecodeFormat {
                match self {
                    $(Opcode::$variant => BytecodeFormat::$format,)*
                }
            }

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $mnemonic,)*
                }
            }

            pub const fn length(self) -> u8 {
                self.format().length()
            }
        }
    };
}

opcode_table! {
    LoadLocal, OpBs, "load local";
    LoadLocalWide, OpSs, "load local wide";
    PopLoadLocal, OpBs, "pop, load local";
    StoreLocal, OpBs, "store local";
    StoreLocalPop, OpBs, "store local, pop";
    LoadOuter, OpBs, "load outer";
    StoreOuter, OpBs, "store outer";
    LoadField, OpBu, "load field";
    LoadFieldWide, OpSu, "load field wide";
    LoadFieldLocal, OpBu, "load field local";
    PopLoadFieldLocal, OpBu, "pop, load field local";
    StoreField, OpBu, "store field";
    StoreFieldWide, OpSu, "store field wide";
    StoreFieldPop, OpBu, "store field, pop";

    LoadLocal0, Op, "load local 0";
    LoadLocal1, Op, "load local 1";
    LoadLocal2, Op, "load local 2";
    LoadLocal3, Op, "load local 3";
    LoadLocal4, Op, "load local 4";
    LoadLocal5, Op, "load local 5";

    LoadLiteral, OpBl, "load literal";
    LoadLiteralWide, OpSl, "load literal wide";
    LoadNull, Op, "load null";
    LoadSmi0, Op, "load smi 0";
    LoadSmis0, OpBu, "load smis 0";
    LoadSmi1, Op, "load smi 1";
    LoadSmiU8, OpBu, "load smi";
    LoadSmiU16, OpSu, "load smi";
    LoadSmiU32, OpWu, "load smi";

    LoadGlobalVar, OpBg, "load global var";
    LoadGlobalVarWide, OpSg, "load global var wide";
    LoadGlobalVarDynamic, Op, "load global var dynamic";
    LoadGlobalVarLazy, OpBg, "load global var lazy";
    LoadGlobalVarLazyWide, OpSg, "load global var lazy wide";
    StoreGlobalVar, OpBg, "store global var";
    StoreGlobalVarWide, OpSg, "store global var wide";
    StoreGlobalVarDynamic, Op, "store global var dynamic";
    LoadBlock, OpBu, "load block";
    LoadOuterBlock, OpBu, "load outer block";

    Pop, OpBu, "pop";
    Pop1, Op, "pop 1";
    Dup, Op, "dup";

    Allocate, OpBc, "allocate instance";
    AllocateWide, OpSc, "allocate instance wide";

    IsClass, OpBci, "is class";
    IsClassWide, OpSci, "is class wide";
    IsInterface, OpBii, "is interface";
    IsInterfaceWide, OpSii, "is interface wide";
    AsClass, OpBci, "as class";
    AsClassWide, OpSci, "as class wide";
    AsInterface, OpBii, "as interface";
    AsInterfaceWide, OpSii, "as interface wide";
    AsLocal, OpBlc, "load local, as, pop";

    InvokeStatic, OpSd, "invoke static";
    InvokeStaticTail, OpSdBsBu, "invoke static tail";
    InvokeBlock, OpBs, "invoke block";
    InvokeLambdaTail, OpBf, "invoke lambda tail";
    InvokeInitializerTail, OpBsBu, "invoke initializer tail";

    InvokeVirtual, OpBsSo, "invoke virtual";
    InvokeVirtualWide, OpSsSo, "invoke virtual wide";
    InvokeVirtualGet, OpSo, "invoke virtual get";
    InvokeVirtualSet, OpSo, "invoke virtual set";

    InvokeEq, Op, "invoke eq";
    InvokeLt, Op, "invoke lt";
    InvokeGt, Op, "invoke gt";
    InvokeLte, Op, "invoke lte";
    InvokeGte, Op, "invoke gte";
    InvokeBitOr, Op, "invoke bit or";
    InvokeBitXor, Op, "invoke bit xor";
    InvokeBitAnd, Op, "invoke bit and";
    InvokeBitShl, Op, "invoke bit shl";
    InvokeBitShr, Op, "invoke bit shr";
    InvokeBitUshr, Op, "invoke bit ushr";
    InvokeAdd, Op, "invoke add";
    InvokeSub, Op, "invoke sub";
    InvokeMul, Op, "invoke mul";
    InvokeDiv, Op, "invoke div";
    InvokeMod, Op, "invoke mod";
    InvokeAt, Op, "invoke at";
    InvokeAtPut, Op, "invoke at_put";

    Branch, OpSf, "branch";
    BranchIfTrue, OpSf, "branch if true";
    BranchIfFalse, OpSf, "branch if false";
    BranchBack, OpBb, "branch back";
    BranchBackWide, OpSb, "branch back wide";
    BranchBackIfTrue, OpBb, "branch back if true";
    BranchBackIfTrueWide, OpSb, "branch back if true wide";
    BranchBackIfFalse, OpBb, "branch back if false";
    BranchBackIfFalseWide, OpSb, "branch back if false wide";
    Primitive, OpBuSu, "invoke primitive";
    Throw, OpBu, "throw";
    Return, OpBsBu, "return";
    ReturnNull, OpBsBu, "return null";
    NonLocalReturn, OpBu, "non-local return";
    NonLocalReturnWide, OpSuSu, "non-local return wide";
    NonLocalBranch, OpBuWu, "non-local branch";
    Link, OpBu, "link try";
    Unlink, OpBu, "unlink try";
    Unwind, Op, "unwind";
    Halt, OpBu, "halt";

    IntrinsicSmiRepeat, Op, "intrinsic smi repeat";
    IntrinsicArrayDo, Op, "intrinsic array do";
    IntrinsicHashFind, Op, "intrinsic hash find";
    IntrinsicHashDo, Op, "intrinsic hash do";
}

impl Opcode {
    /// The wide counterpart of a narrow opcode, where one exists. Callers
    /// rely on the invariant that, when present, the wide form's bytecode
    /// immediately follows the narrow form's in the table above: swapping
    /// a narrow instruction for its wide form is just bumping the opcode
    /// byte by one, never a table lookup at runtime.
    pub const fn wide(self) -> Option<Opcode> {
        match self {
            Opcode::LoadLocal => Some(Opcode::LoadLocalWide),
            Opcode::LoadField => Some(Opcode::LoadFieldWide),
            Opcode::StoreField => Some(Opcode::StoreFieldWide),
            Opcode::LoadLiteral => Some(Opcode::LoadLiteralWide),
            Opcode::LoadGlobalVar => Some(Opcode::LoadGlobalVarWide),
            Opcode::LoadGlobalVarLazy => Some(Opcode::LoadGlobalVarLazyWide),
            Opcode::StoreGlobalVar => Some(Opcode::StoreGlobalVarWide),
            Opcode::Allocate => Some(Opcode::AllocateWide),
            Opcode::IsClass => Some(Opcode::IsClassWide),
            Opcode::IsInterface => Some(Opcode::IsInterfaceWide),
            Opcode::AsClass => Some(Opcode::AsClassWide),
            Opcode::AsInterface => Some(Opcode::AsInterfaceWide),
            Opcode::InvokeVirtual => Some(Opcode::InvokeVirtualWide),
            Opcode::BranchBack => Some(Opcode::BranchBackWide),
            Opcode::BranchBackIfTrue => Some(Opcode::BranchBackIfTrueWide),
            Opcode::BranchBackIfFalse => Some(Opcode::BranchBackIfFalseWide),
            Opcode::NonLocalReturn => Some(Opcode::NonLocalReturnWide),
            _ => None,
        }
    }

    pub const fn is_wide(self) -> bool {
        self.mnemonic().ends_with("wide")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_narrow_wide_pair_is_adjacent_in_the_table() {
        for &narrow in Opcode::ALL {
            if let Some(wide) = narrow.wide() {
                let narrow_index = Opcode::ALL.iter().position(|o| *o == narrow).unwrap();
                let wide_index = Opcode::ALL.iter().position(|o| *o == wide).unwrap();
                assert_eq!(
                    wide_index,
                    narrow_index + 1,
                    "{:?} wide form must be the very next table entry",
                    narrow
                );
            }
        }
    }

    #[test]
    fn load_local_0_through_5_are_single_byte() {
        for op in [
            Opcode::LoadLocal0,
            Opcode::LoadLocal1,
            Opcode::LoadLocal2,
            Opcode::LoadLocal3,
            Opcode::LoadLocal4,
            Opcode::LoadLocal5,
        ] {
            assert_eq!(op.length(), 1);
        }
    }

    #[test]
    fn invoke_static_tail_matches_source_length() {
        assert_eq!(Opcode::InvokeStaticTail.length(), 5);
        assert_eq!(Opcode::NonLocalBranch.length(), 6);
    }
}
