//! Type information produced by checking.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use vela_runtime::native::NativeFunction;
use vela_runtime::types::TypeHandle;
use vela_runtime::value::CellRef;
use vela_syntax::ast::{File, NodeId};

use crate::constant::ConstValue;
use crate::universe::Builtin;

/// Property bits of an [`ExprInfo`]. An expression is either a value, a
/// type, or a package reference; the bits distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties(u16);

impl Properties {
    pub const IS_TYPE: Properties = Properties(1 << 0);
    pub const IS_PACKAGE: Properties = Properties(1 << 1);
    pub const IS_BUILTIN: Properties = Properties(1 << 2);
    pub const IS_NATIVE: Properties = Properties(1 << 3);
    pub const ADDRESSABLE: Properties = Properties(1 << 4);
    pub const UNTYPED: Properties = Properties(1 << 5);
    pub const HAS_VALUE: Properties = Properties(1 << 6);

    pub fn with(self, other: Properties) -> Properties {
        Properties(self.0 | other.0)
    }

    pub fn has(self, other: Properties) -> bool {
        self.0 & other.0 != 0
    }
}

/// Attached to every checked expression.
#[derive(Debug, Clone, Default)]
pub struct ExprInfo {
    /// Resolved type; `None` only for nil and for package/builtin refs.
    pub typ: Option<TypeHandle>,
    /// Constant value, when the expression is constant.
    pub value: Option<ConstValue>,
    pub properties: Properties,
    /// For calls with more than one result: the full result list.
    pub multi: Option<Vec<TypeHandle>>,
    /// Owning native package, for native declarations.
    pub native_pkg: Option<String>,
}

impl ExprInfo {
    pub fn value_of(typ: TypeHandle) -> ExprInfo {
        ExprInfo {
            typ: Some(typ),
            ..Default::default()
        }
    }

    pub fn addressable_value(typ: TypeHandle) -> ExprInfo {
        ExprInfo {
            typ: Some(typ),
            properties: Properties::ADDRESSABLE,
            ..Default::default()
        }
    }

    pub fn constant(value: ConstValue, typ: Option<TypeHandle>) -> ExprInfo {
        let untyped = typ.is_none();
        let mut properties = Properties::HAS_VALUE;
        if untyped {
            properties = properties.with(Properties::UNTYPED);
        }
        ExprInfo {
            typ,
            value: Some(value),
            properties,
            ..Default::default()
        }
    }

    pub fn is_type(&self) -> bool {
        self.properties.has(Properties::IS_TYPE)
    }

    pub fn is_package(&self) -> bool {
        self.properties.has(Properties::IS_PACKAGE)
    }

    pub fn is_constant(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_untyped(&self) -> bool {
        self.properties.has(Properties::UNTYPED)
    }

    pub fn is_addressable(&self) -> bool {
        self.properties.has(Properties::ADDRESSABLE)
    }

    /// Whether this is the untyped nil.
    pub fn is_nil(&self) -> bool {
        self.typ.is_none() && self.value.is_none() && !self.is_type() && !self.is_package()
    }
}

/// What an identifier (or package selector) denotes.
#[derive(Debug, Clone)]
pub enum Entity {
    /// A local variable, keyed by its declaring identifier's node id.
    Local { decl: NodeId },
    /// A package-level variable slot.
    Global { index: u16 },
    /// A function declared in the source package.
    Func { name: String },
    NativeFunc(Rc<NativeFunction>),
    /// A folded constant (source or native).
    Const {
        value: ConstValue,
        typ: Option<TypeHandle>,
    },
    Builtin(Builtin),
    TypeName(TypeHandle),
    Package { path: String },
    /// The predeclared nil.
    Nil,
}

/// A declared variable (local or parameter).
#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub typ: TypeHandle,
    /// Function nesting depth of the declaration.
    pub depth: usize,
}

/// One captured variable of a function literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Declaring identifier of the captured variable.
    pub decl: NodeId,
    /// Whether the variable is declared in the literal's immediately
    /// enclosing function (captured from a register cell) or further out
    /// (captured from the enclosing literal's capture vector).
    pub from_parent_frame: bool,
}

/// A package-level variable slot assigned by the checker.
#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub pkg: String,
    pub name: String,
    pub typ: TypeHandle,
    /// Host cell for native variables.
    pub cell: Option<CellRef>,
}

#[derive(Debug, Default)]
pub struct TypeInfo {
    /// Every checked expression.
    pub exprs: HashMap<NodeId, ExprInfo>,
    /// Every checked type expression.
    pub type_exprs: HashMap<NodeId, TypeHandle>,
    /// Identifier and selector resolutions.
    pub uses: HashMap<NodeId, Entity>,
    /// Declared variables, by declaring identifier.
    pub defs: HashMap<NodeId, VarDef>,
    /// Locals captured by some literal (they live in cells).
    pub captured: HashSet<NodeId>,
    /// Capture list per function literal, in capture order.
    pub captures: HashMap<NodeId, Vec<Capture>>,
}

impl TypeInfo {
    pub fn expr(&self, id: NodeId) -> &ExprInfo {
        self.exprs.get(&id).expect("expression was not checked")
    }

    pub fn type_expr(&self, id: NodeId) -> &TypeHandle {
        self.type_exprs
            .get(&id)
            .expect("type expression was not checked")
    }

    pub fn entity(&self, id: NodeId) -> &Entity {
        self.uses.get(&id).expect("identifier was not resolved")
    }
}

/// Where a declaration lives in the input files.
pub type DeclRef = (usize, usize);

/// The checker's output: the input AST plus everything the emitter needs.
#[derive(Debug)]
pub struct CheckedProgram {
    pub files: Vec<File>,
    pub info: TypeInfo,
    /// Package-level declarations in dependency order (imports, types,
    /// constants, variables, functions).
    pub sorted_decls: Vec<DeclRef>,
    pub globals: Vec<GlobalInfo>,
    /// `init` functions in source order.
    pub inits: Vec<DeclRef>,
    /// The `main` function, when building a program.
    pub main: Option<DeclRef>,
}
