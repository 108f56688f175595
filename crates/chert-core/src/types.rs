//! Canonicalized type descriptors.
//!
//! Types are hash-consed by structural identity: equal types always get
//! the same [`Ty`] handle, which makes function-signature comparison and
//! the WebAssembly type-section index lookup O(1). Struct and union
//! bodies live in a side table keyed by [`StructId`], so `TyKind` stays
//! hashable and recursive types share structurally.

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;

use crate::ids::StructId;
use crate::index_vec::IndexVec;
use crate::interner::{Interner, Name};

/// An interned type reference.
///
/// A lightweight handle (just a u32); equal types always have the same
/// `Ty` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ty(pub u32);

impl Ty {
    pub const VOID: Ty = Ty(0);
    pub const CHAR: Ty = Ty(1);
    pub const INT: Ty = Ty(2);
    pub const UINT: Ty = Ty(3);
    pub const LONG: Ty = Ty(4);
    pub const ULONG: Ty = Ty(5);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ty({})", self.0)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ty#{}", self.0)
    }
}

/// Width class of a fixed-point type. Actual byte sizes are a target
/// parameter ([`TargetSizes`]), not part of the type identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum FixnumKind {
    Char,
    Short,
    Int,
    Long,
    LongLong,
    Enum,
}

/// Floating-point width.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FlonumKind {
    Float,
    Double,
}

/// Canonical type representation for interning.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TyKind {
    Void,
    Fixnum { kind: FixnumKind, unsigned: bool },
    Flonum(FlonumKind),
    Ptr(Ty),
    Array { elem: Ty, len: Option<u32> },
    Struct(StructId),
    Func { ret: Ty, params: Vec<Ty>, vararg: bool },
}

bitflags! {
    /// Type qualifiers, carried at the use site (declaration or member),
    /// not inside `TyKind`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Qualifiers: u8 {
        const CONST    = 1 << 0;
        const VOLATILE = 1 << 1;
    }
}

/// Bitfield placement within a struct member's storage unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bitfield {
    pub width: u32,
    pub position: u32,
}

/// One named member of a struct or union.
#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub name: Name,
    pub ty: Ty,
    pub offset: usize,
    pub bitfield: Option<Bitfield>,
}

/// A struct or union body. Created incomplete on first tag mention and
/// completed when the defining declaration is parsed.
#[derive(Clone, Debug)]
pub struct StructDef {
    pub name: Option<Name>,
    pub is_union: bool,
    pub members: Vec<MemberInfo>,
    pub size: usize,
    pub align: usize,
    pub defined: bool,
}

impl StructDef {
    pub fn member(&self, name: Name) -> Option<(usize, &MemberInfo)> {
        self.members
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
    }
}

/// Byte sizes of the fixnum kinds and pointers for one target.
///
/// The `long` model is the piece that actually varies between the two
/// backends, so it is injected at pipeline start rather than baked in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetSizes {
    pub char_size: usize,
    pub short_size: usize,
    pub int_size: usize,
    pub long_size: usize,
    pub llong_size: usize,
    pub enum_size: usize,
    pub ptr_size: usize,
}

impl TargetSizes {
    /// LP64 model used by the native x86-64 backend.
    pub fn lp64() -> Self {
        Self {
            char_size: 1,
            short_size: 2,
            int_size: 4,
            long_size: 8,
            llong_size: 8,
            enum_size: 4,
            ptr_size: 8,
        }
    }

    /// ILP32 model used by the wasm32 backend (`long` is 4 bytes).
    pub fn wasm32() -> Self {
        Self {
            char_size: 1,
            short_size: 2,
            int_size: 4,
            long_size: 4,
            llong_size: 8,
            enum_size: 4,
            ptr_size: 4,
        }
    }

    pub fn fixnum_size(&self, kind: FixnumKind) -> usize {
        match kind {
            FixnumKind::Char => self.char_size,
            FixnumKind::Short => self.short_size,
            FixnumKind::Int => self.int_size,
            FixnumKind::Long => self.long_size,
            FixnumKind::LongLong => self.llong_size,
            FixnumKind::Enum => self.enum_size,
        }
    }
}

/// Type interner that deduplicates types and owns struct bodies.
#[derive(Debug)]
pub struct TypeInterner {
    sizes: TargetSizes,
    cache: HashMap<TyKind, Ty>,
    types: Vec<TyKind>,
    structs: IndexVec<StructId, StructDef>,
}

impl TypeInterner {
    /// Create a new interner with pre-interned common types.
    pub fn new(sizes: TargetSizes) -> Self {
        let mut interner = Self {
            sizes,
            cache: HashMap::new(),
            types: Vec::new(),
            structs: IndexVec::new(),
        };

        // Pre-interned handles MUST match the Ty::* constants.
        assert_eq!(interner.intern(TyKind::Void), Ty::VOID);
        assert_eq!(interner.fixnum(FixnumKind::Char, false), Ty::CHAR);
        assert_eq!(interner.fixnum(FixnumKind::Int, false), Ty::INT);
        assert_eq!(interner.fixnum(FixnumKind::Int, true), Ty::UINT);
        assert_eq!(interner.fixnum(FixnumKind::Long, false), Ty::LONG);
        assert_eq!(interner.fixnum(FixnumKind::Long, true), Ty::ULONG);

        interner
    }

    pub fn sizes(&self) -> &TargetSizes {
        &self.sizes
    }

    /// Intern a type, returning its handle.
    pub fn intern(&mut self, kind: TyKind) -> Ty {
        if let Some(&ty) = self.cache.get(&kind) {
            return ty;
        }

        let ty = Ty(self.types.len() as u32);
        self.types.push(kind.clone());
        self.cache.insert(kind, ty);
        ty
    }

    pub fn kind(&self, ty: Ty) -> &TyKind {
        &self.types[ty.index()]
    }

    pub fn fixnum(&mut self, kind: FixnumKind, unsigned: bool) -> Ty {
        self.intern(TyKind::Fixnum { kind, unsigned })
    }

    pub fn flonum(&mut self, kind: FlonumKind) -> Ty {
        self.intern(TyKind::Flonum(kind))
    }

    pub fn ptr_to(&mut self, pointee: Ty) -> Ty {
        self.intern(TyKind::Ptr(pointee))
    }

    pub fn array_of(&mut self, elem: Ty, len: Option<u32>) -> Ty {
        self.intern(TyKind::Array { elem, len })
    }

    pub fn func(&mut self, ret: Ty, params: Vec<Ty>, vararg: bool) -> Ty {
        self.intern(TyKind::Func { ret, params, vararg })
    }

    /// The signed integer type that holds a pointer difference.
    pub fn ptrdiff(&mut self) -> Ty {
        if self.sizes.ptr_size == self.sizes.long_size {
            Ty::LONG
        } else {
            self.fixnum(FixnumKind::Int, false)
        }
    }

    // ------------------------------------------------------------------
    // Struct bodies
    // ------------------------------------------------------------------

    /// Register an (initially incomplete) struct or union body.
    pub fn add_struct(&mut self, name: Option<Name>, is_union: bool) -> StructId {
        self.structs.push(StructDef {
            name,
            is_union,
            members: Vec::new(),
            size: 0,
            align: 1,
            defined: false,
        })
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id]
    }

    /// Complete a struct body, computing member offsets and total size.
    ///
    /// Consecutive bitfields whose bits fit in the current storage unit
    /// share it; anything else starts a fresh, aligned unit.
    pub fn define_struct(&mut self, id: StructId, mut members: Vec<MemberInfo>) {
        let is_union = self.structs[id].is_union;
        let mut size = 0usize;
        let mut align = 1usize;
        let mut bit_unit_offset = 0usize;
        let mut bit_unit_size = 0usize;
        let mut bit_pos = 0u32;

        for member in members.iter_mut() {
            let msize = self.size_of(member.ty);
            let malign = self.align_of(member.ty);
            align = align.max(malign);

            if is_union {
                member.offset = 0;
                size = size.max(msize);
                continue;
            }

            match member.bitfield {
                Some(ref mut bf) => {
                    let unit_bits = (msize * 8) as u32;
                    if bit_unit_size != msize || bit_pos + bf.width > unit_bits {
                        bit_unit_offset = align_to(size, malign);
                        size = bit_unit_offset + msize;
                        bit_unit_size = msize;
                        bit_pos = 0;
                    }
                    member.offset = bit_unit_offset;
                    bf.position = bit_pos;
                    bit_pos += bf.width;
                }
                None => {
                    bit_unit_size = 0;
                    bit_pos = 0;
                    member.offset = align_to(size, malign);
                    size = member.offset + msize;
                }
            }
        }

        let def = &mut self.structs[id];
        def.members = members;
        def.align = align;
        def.size = align_to(size, align);
        def.defined = true;
    }

    // ------------------------------------------------------------------
    // Size and classification queries
    // ------------------------------------------------------------------

    pub fn size_of(&self, ty: Ty) -> usize {
        match self.kind(ty) {
            TyKind::Void => 1,
            TyKind::Fixnum { kind, .. } => self.sizes.fixnum_size(*kind),
            TyKind::Flonum(FlonumKind::Float) => 4,
            TyKind::Flonum(FlonumKind::Double) => 8,
            TyKind::Ptr(_) | TyKind::Func { .. } => self.sizes.ptr_size,
            TyKind::Array { elem, len } => {
                self.size_of(*elem) * len.unwrap_or(0) as usize
            }
            TyKind::Struct(id) => self.structs[*id].size,
        }
    }

    pub fn align_of(&self, ty: Ty) -> usize {
        match self.kind(ty) {
            TyKind::Array { elem, .. } => self.align_of(*elem),
            TyKind::Struct(id) => self.structs[*id].align,
            _ => self.size_of(ty),
        }
    }

    pub fn is_void(&self, ty: Ty) -> bool {
        ty == Ty::VOID
    }

    pub fn is_fixnum(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Fixnum { .. })
    }

    pub fn is_flonum(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Flonum(_))
    }

    pub fn is_number(&self, ty: Ty) -> bool {
        self.is_fixnum(ty) || self.is_flonum(ty)
    }

    pub fn is_ptr(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Ptr(_))
    }

    pub fn is_array(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Array { .. })
    }

    pub fn is_func(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Func { .. })
    }

    pub fn is_struct(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TyKind::Struct(_))
    }

    /// Scalar = something that fits a register: number or pointer.
    pub fn is_scalar(&self, ty: Ty) -> bool {
        self.is_number(ty) || self.is_ptr(ty)
    }

    /// Unsignedness as the code generators see it: pointers compare
    /// unsigned, floats are neither.
    pub fn is_unsigned(&self, ty: Ty) -> bool {
        match self.kind(ty) {
            TyKind::Fixnum { unsigned, .. } => *unsigned,
            TyKind::Ptr(_) => true,
            _ => false,
        }
    }

    pub fn pointee(&self, ty: Ty) -> Option<Ty> {
        match self.kind(ty) {
            TyKind::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    pub fn array_elem(&self, ty: Ty) -> Option<Ty> {
        match self.kind(ty) {
            TyKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic conversions
    // ------------------------------------------------------------------

    fn fixnum_kind(&self, ty: Ty) -> FixnumKind {
        match self.kind(ty) {
            TyKind::Fixnum { kind, .. } => *kind,
            _ => FixnumKind::Int,
        }
    }

    /// Integer promotion: anything narrower than `int` becomes `int`.
    pub fn promote(&mut self, ty: Ty) -> Ty {
        match *self.kind(ty) {
            TyKind::Fixnum { kind, unsigned } => {
                if self.sizes.fixnum_size(kind) < self.sizes.int_size
                    || kind == FixnumKind::Enum
                {
                    Ty::INT
                } else {
                    self.fixnum(kind, unsigned)
                }
            }
            _ => ty,
        }
    }

    /// Usual arithmetic conversions: the common type both operands of an
    /// arithmetic binary operator are converted to.
    pub fn usual_arith(&mut self, lhs: Ty, rhs: Ty) -> Ty {
        match (self.kind(lhs).clone(), self.kind(rhs).clone()) {
            (TyKind::Flonum(l), TyKind::Flonum(r)) => {
                if l == FlonumKind::Double || r == FlonumKind::Double {
                    self.flonum(FlonumKind::Double)
                } else {
                    self.flonum(FlonumKind::Float)
                }
            }
            (TyKind::Flonum(_), _) => lhs,
            (_, TyKind::Flonum(_)) => rhs,
            _ => {
                let lp = self.promote(lhs);
                let rp = self.promote(rhs);
                if lp == rp {
                    return lp;
                }
                let (ls, rs) = (self.size_of(lp), self.size_of(rp));
                if ls != rs {
                    return if ls > rs { lp } else { rp };
                }
                // Same size: unsigned wins; at equal signedness the
                // higher-ranked kind does.
                match (self.is_unsigned(lp), self.is_unsigned(rp)) {
                    (true, false) => lp,
                    (false, true) => rp,
                    _ => {
                        let (lk, rk) = (self.fixnum_kind(lp), self.fixnum_kind(rp));
                        if lk >= rk {
                            lp
                        } else {
                            rp
                        }
                    }
                }
            }
        }
    }

    /// Human-readable rendering for diagnostics.
    pub fn display(&self, ty: Ty, names: &Interner) -> String {
        match self.kind(ty) {
            TyKind::Void => "void".to_string(),
            TyKind::Fixnum { kind, unsigned } => {
                let base = match kind {
                    FixnumKind::Char => "char",
                    FixnumKind::Short => "short",
                    FixnumKind::Int => "int",
                    FixnumKind::Long => "long",
                    FixnumKind::LongLong => "long long",
                    FixnumKind::Enum => "enum",
                };
                if *unsigned {
                    format!("unsigned {}", base)
                } else {
                    base.to_string()
                }
            }
            TyKind::Flonum(FlonumKind::Float) => "float".to_string(),
            TyKind::Flonum(FlonumKind::Double) => "double".to_string(),
            TyKind::Ptr(p) => format!("{}*", self.display(*p, names)),
            TyKind::Array { elem, len } => match len {
                Some(n) => format!("{}[{}]", self.display(*elem, names), n),
                None => format!("{}[]", self.display(*elem, names)),
            },
            TyKind::Struct(id) => {
                let def = &self.structs[*id];
                let tag = match (def.is_union, def.name) {
                    (false, Some(n)) => format!("struct {}", names.str(n)),
                    (true, Some(n)) => format!("union {}", names.str(n)),
                    (false, None) => "struct <anonymous>".to_string(),
                    (true, None) => "union <anonymous>".to_string(),
                };
                tag
            }
            TyKind::Func { ret, params, vararg } => {
                let mut s = format!("{}(", self.display(*ret, names));
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&self.display(*p, names));
                }
                if *vararg {
                    if !params.is_empty() {
                        s.push_str(", ");
                    }
                    s.push_str("...");
                }
                s.push(')');
                s
            }
        }
    }
}

pub fn align_to(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interner() -> TypeInterner {
        TypeInterner::new(TargetSizes::lp64())
    }

    #[test]
    fn test_interning_deduplicates() {
        let mut types = interner();
        let a = types.fixnum(FixnumKind::Int, false);
        let b = types.fixnum(FixnumKind::Int, false);
        let c = types.fixnum(FixnumKind::Int, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Ty::INT);
    }

    #[test]
    fn test_function_type_structural_equality() {
        let mut types = interner();
        let f1 = types.func(Ty::INT, vec![Ty::INT, Ty::LONG], false);
        let f2 = types.func(Ty::INT, vec![Ty::INT, Ty::LONG], false);
        let f3 = types.func(Ty::INT, vec![Ty::LONG, Ty::INT], false);
        let f4 = types.func(Ty::INT, vec![Ty::INT, Ty::LONG], true);
        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
        assert_ne!(f1, f4);
    }

    #[test]
    fn test_target_size_models() {
        let lp64 = TypeInterner::new(TargetSizes::lp64());
        assert_eq!(lp64.size_of(Ty::LONG), 8);

        let wasm = TypeInterner::new(TargetSizes::wasm32());
        assert_eq!(wasm.size_of(Ty::LONG), 4);
        assert_eq!(wasm.sizes().ptr_size, 4);
    }

    #[test]
    fn test_usual_arith() {
        let mut types = interner();
        let short = types.fixnum(FixnumKind::Short, false);
        let uchar = types.fixnum(FixnumKind::Char, true);
        let double = types.flonum(FlonumKind::Double);

        // Narrow integers promote to int.
        assert_eq!(types.usual_arith(short, uchar), Ty::INT);
        // Same size, one side unsigned: unsigned wins.
        assert_eq!(types.usual_arith(Ty::INT, Ty::UINT), Ty::UINT);
        // The wider side wins.
        assert_eq!(types.usual_arith(Ty::INT, Ty::LONG), Ty::LONG);
        // Floating point dominates.
        assert_eq!(types.usual_arith(Ty::LONG, double), double);
    }

    #[test]
    fn test_struct_layout() {
        let mut types = interner();
        let id = types.add_struct(None, false);
        types.define_struct(
            id,
            vec![
                MemberInfo { name: Name(0), ty: Ty::CHAR, offset: 0, bitfield: None },
                MemberInfo { name: Name(1), ty: Ty::INT, offset: 0, bitfield: None },
                MemberInfo { name: Name(2), ty: Ty::CHAR, offset: 0, bitfield: None },
            ],
        );
        let def = types.struct_def(id);
        assert_eq!(def.members[0].offset, 0);
        assert_eq!(def.members[1].offset, 4);
        assert_eq!(def.members[2].offset, 8);
        assert_eq!(def.size, 12);
        assert_eq!(def.align, 4);
    }

    #[test]
    fn test_union_layout() {
        let mut types = interner();
        let id = types.add_struct(None, true);
        types.define_struct(
            id,
            vec![
                MemberInfo { name: Name(0), ty: Ty::CHAR, offset: 0, bitfield: None },
                MemberInfo { name: Name(1), ty: Ty::LONG, offset: 0, bitfield: None },
            ],
        );
        let def = types.struct_def(id);
        assert_eq!(def.members[1].offset, 0);
        assert_eq!(def.size, 8);
    }

    #[test]
    fn test_bitfield_packing() {
        let mut types = interner();
        let id = types.add_struct(None, false);
        types.define_struct(
            id,
            vec![
                MemberInfo {
                    name: Name(0),
                    ty: Ty::INT,
                    offset: 0,
                    bitfield: Some(Bitfield { width: 3, position: 0 }),
                },
                MemberInfo {
                    name: Name(1),
                    ty: Ty::INT,
                    offset: 0,
                    bitfield: Some(Bitfield { width: 5, position: 0 }),
                },
                MemberInfo {
                    name: Name(2),
                    ty: Ty::INT,
                    offset: 0,
                    bitfield: Some(Bitfield { width: 30, position: 0 }),
                },
            ],
        );
        let def = types.struct_def(id);
        // First two share a unit; the third does not fit and starts anew.
        assert_eq!(def.members[0].offset, def.members[1].offset);
        assert_eq!(def.members[0].bitfield.unwrap().position, 0);
        assert_eq!(def.members[1].bitfield.unwrap().position, 3);
        assert_ne!(def.members[2].offset, def.members[0].offset);
        assert_eq!(def.members[2].bitfield.unwrap().position, 0);
    }

    #[test]
    fn test_pointer_scaling_inputs() {
        let mut types = interner();
        let p = types.ptr_to(Ty::INT);
        assert!(types.is_ptr(p));
        assert!(types.is_unsigned(p));
        assert_eq!(types.pointee(p), Some(Ty::INT));
        assert_eq!(types.size_of(p), 8);
    }

    mod conversion_properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Copy, Debug)]
        enum AnyNumber {
            Fix(FixnumKind, bool),
            Flo(FlonumKind),
        }

        fn any_number() -> impl Strategy<Value = AnyNumber> {
            prop_oneof![
                (
                    prop_oneof![
                        Just(FixnumKind::Char),
                        Just(FixnumKind::Short),
                        Just(FixnumKind::Int),
                        Just(FixnumKind::Long),
                        Just(FixnumKind::LongLong),
                    ],
                    any::<bool>()
                )
                    .prop_map(|(k, u)| AnyNumber::Fix(k, u)),
                prop_oneof![Just(FlonumKind::Float), Just(FlonumKind::Double)]
                    .prop_map(AnyNumber::Flo),
            ]
        }

        fn materialize(types: &mut TypeInterner, n: AnyNumber) -> Ty {
            match n {
                AnyNumber::Fix(kind, unsigned) => types.fixnum(kind, unsigned),
                AnyNumber::Flo(kind) => types.flonum(kind),
            }
        }

        proptest! {
            /// For any `a op b`, the common type the parser converts
            /// both sides to obeys the standard rules.
            #[test]
            fn test_common_type_obeys_conversion_rules(a in any_number(), b in any_number()) {
                let mut types = interner();
                let ta = materialize(&mut types, a);
                let tb = materialize(&mut types, b);
                let common = types.usual_arith(ta, tb);
                let swapped = types.usual_arith(tb, ta);

                // Symmetric in its operands.
                prop_assert_eq!(common, swapped);
                // Floating-point operands dominate.
                if types.is_flonum(ta) || types.is_flonum(tb) {
                    prop_assert!(types.is_flonum(common));
                } else {
                    // Integer results are at least promoted width and
                    // wide enough for both sides.
                    prop_assert!(types.size_of(common) >= types.size_of(Ty::INT));
                    let pa = types.promote(ta);
                    let pb = types.promote(tb);
                    prop_assert!(types.size_of(common) >= types.size_of(pa));
                    prop_assert!(types.size_of(common) >= types.size_of(pb));
                    // Unsignedness only appears when an operand of the
                    // same (promoted) width demanded it.
                    if types.is_unsigned(common) {
                        prop_assert!(
                            (types.is_unsigned(pa)
                                && types.size_of(pa) == types.size_of(common))
                                || (types.is_unsigned(pb)
                                    && types.size_of(pb) == types.size_of(common))
                        );
                    }
                }
                // Converting an operand already of the common type is
                // the identity.
                prop_assert_eq!(types.usual_arith(common, common), common);
            }
        }
    }
}
