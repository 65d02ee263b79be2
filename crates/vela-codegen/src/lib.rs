//! Bytecode emission for checked Vela programs.
//!
//! Walks the checked AST producing one [`Function`] per source function
//! and literal plus the implicit `$initvars` function, and assembles the
//! [`Module`] the VM executes. The emitted `main` prologue runs
//! `$initvars` and then every `init` function in source order.
//!
//! Structural invariants are asserted: a violation indicates a checker
//! bug and aborts the build.

mod expr;
mod func;
mod stmt;

use std::collections::HashMap;

use tracing::debug;

use vela_analysis::{CheckedProgram, Entity};
use vela_runtime::function::{Function, Global, Module};
use vela_runtime::instruction::{encode_int16, Instruction, Opcode};
use vela_runtime::types::{Bank, Type, TypeHandle};
use vela_syntax::ast::{Decl, FuncDecl, NodeId};

pub use func::{FuncBuilder, VarLoc};

/// Compiles a checked program into a runnable module.
pub fn emit_program(checked: &CheckedProgram) -> Module {
    let mut ctx = Ctx {
        checked,
        module: Module::new(),
        fn_ids: HashMap::new(),
        initvars_id: 0,
    };

    // Placeholders for every package function, so calls resolve by id
    // regardless of order.
    let mut decls: Vec<(&FuncDecl, u32)> = Vec::new();
    for &(fi, di) in &checked.sorted_decls {
        if let Decl::Func(fd) = &checked.files[fi].decls[di] {
            let sig = fn_sig(checked, fd);
            let id = ctx
                .module
                .add_function(Function::new("main", fd.name.name.clone(), sig));
            if fd.name.name != "init" {
                ctx.fn_ids.insert(fd.name.name.clone(), id);
            }
            decls.push((fd, id));
        }
    }

    // The implicit initializer function for package-level variables.
    ctx.initvars_id = ctx.module.add_function(Function::new(
        "main",
        "$initvars",
        Type::func(vec![], vec![], false),
    ));
    let initvars = emit_initvars(&mut ctx);
    ctx.module.functions[ctx.initvars_id as usize] = initvars;

    let init_ids: Vec<u32> = checked
        .inits
        .iter()
        .filter_map(|&(fi, di)| match &checked.files[fi].decls[di] {
            Decl::Func(fd) => decls
                .iter()
                .find(|(d, _)| std::ptr::eq(*d, fd))
                .map(|(_, id)| *id),
            _ => None,
        })
        .collect();

    let main_ref = checked.main;
    for (fd, id) in decls {
        let is_main = main_ref
            .map(|(fi, di)| match &checked.files[fi].decls[di] {
                Decl::Func(m) => std::ptr::eq(m, fd),
                _ => false,
            })
            .unwrap_or(false);
        debug!(name = %fd.name.name, id, "emit function");
        let built = emit_function(&mut ctx, fd, is_main, &init_ids);
        ctx.module.functions[id as usize] = built;
        if is_main {
            ctx.module.entry = id;
        }
    }

    // Globals: constant initializers become initial values directly;
    // the rest are zeroed at load and filled by $initvars.
    ctx.module.globals = checked
        .globals
        .iter()
        .map(|g| {
            let mut global = Global::new(g.pkg.clone(), g.name.clone(), g.typ.clone());
            global.cell = g.cell.clone();
            global
        })
        .collect();

    ctx.module
}

pub(crate) struct Ctx<'a> {
    pub checked: &'a CheckedProgram,
    pub module: Module,
    pub fn_ids: HashMap<String, u32>,
    pub initvars_id: u32,
}

fn fn_sig(checked: &CheckedProgram, fd: &FuncDecl) -> TypeHandle {
    // Rebuilt from the checked parameter/result type expressions.
    let params = fd
        .typ
        .params
        .iter()
        .map(|p| checked.info.type_expr(p.typ.id).clone())
        .collect::<Vec<_>>();
    let results = fd
        .typ
        .results
        .iter()
        .map(|r| checked.info.type_expr(r.typ.id).clone())
        .collect::<Vec<_>>();
    let params = if fd.typ.variadic {
        let mut p = params;
        let last = p.pop().expect("variadic without parameters");
        p.push(Type::slice(last));
        p
    } else {
        params
    };
    Type::func(params, results, fd.typ.variadic)
}

/// The emitter for one function.
pub(crate) struct Emitter<'a, 'c> {
    pub ctx: &'a mut Ctx<'c>,
    pub fb: FuncBuilder,
    /// Result registers, in declaration order.
    pub ret_regs: Vec<(Bank, i8)>,
    pub loops: Vec<LoopCtx>,
    /// Static nesting depth of range loops (the VM's iterator slot).
    pub range_depth: i8,
}

pub(crate) struct LoopCtx {
    pub break_label: u32,
    pub continue_label: u32,
}

impl<'a, 'c> Emitter<'a, 'c> {
    pub fn new(ctx: &'a mut Ctx<'c>, fn_: Function) -> Emitter<'a, 'c> {
        Emitter {
            ctx,
            fb: FuncBuilder::new(fn_),
            ret_regs: Vec::new(),
            loops: Vec::new(),
            range_depth: 0,
        }
    }

    /// Allocates result registers then parameter registers, in order, so
    /// the frame layout is per bank: results first, then parameters.
    pub fn setup_frame(
        &mut self,
        typ: &vela_syntax::ast::FuncTypeExpr,
        sig: &TypeHandle,
        captures: &[vela_analysis::Capture],
    ) {
        let ft = match &**sig {
            Type::Func(ft) => ft.clone(),
            _ => unreachable!("signature is a func type"),
        };
        for rt in &ft.results {
            let (bank, r) = self.fb.new_register_for(rt);
            self.ret_regs.push((bank, r));
        }
        // Captured variables resolve through the closure's vector.
        for (idx, cap) in captures.iter().enumerate() {
            let def = self
                .ctx
                .checked
                .info
                .defs
                .get(&cap.decl)
                .expect("captured variable without definition");
            self.fb.bind_var(
                cap.decl,
                VarLoc::Capture {
                    idx: idx as i8,
                    bank: def.typ.bank(),
                },
            );
        }
        for (p, pt) in typ.params.iter().zip(&ft.params) {
            let (bank, r) = self.fb.new_register_for(pt);
            if let Some(name) = &p.name {
                if name.is_blank() {
                    continue;
                }
                if self.ctx.checked.info.captured.contains(&name.id) {
                    // A captured parameter moves into a fresh cell.
                    let cell = self.fb.new_register(Bank::General);
                    let t_idx = self.fb.add_type(pt);
                    self.fb
                        .emit(Instruction::new(Opcode::New, 0, t_idx, cell));
                    self.emit_bank_move(bank, r, -cell, pt);
                    self.fb.bind_var(name.id, VarLoc::Cell { r: cell });
                } else {
                    self.fb.bind_var(name.id, VarLoc::Reg { bank, r });
                }
            }
        }
    }

    /// Resolves an identifier's entity from the checker's tables.
    pub fn entity(&self, id: NodeId) -> &Entity {
        self.ctx.checked.info.entity(id)
    }
}

fn emit_initvars(ctx: &mut Ctx) -> Function {
    let fn_ = Function::new("main", "$initvars", Type::func(vec![], vec![], false));
    let checked = ctx.checked;
    let mut em = Emitter::new(ctx, fn_);
    for &(fi, di) in &checked.sorted_decls {
        if let Decl::Var(vd, _) = &checked.files[fi].decls[di] {
            em.emit_global_var_init(vd);
        }
    }
    em.fb.end()
}

fn emit_function(ctx: &mut Ctx, fd: &FuncDecl, is_main: bool, init_ids: &[u32]) -> Function {
    let sig = fn_sig(ctx.checked, fd);
    let fn_ = {
        let mut f = Function::new("main", fd.name.name.clone(), sig.clone());
        f.file = ctx
            .checked
            .files
            .first()
            .map(|file| file.path.clone())
            .unwrap_or_default();
        f.line = fd.pos.line;
        f
    };
    let initvars_id = ctx.initvars_id;
    let mut em = Emitter::new(ctx, fn_);
    em.setup_frame(&fd.typ, &sig, &[]);

    if is_main {
        // Prologue: package variable initializers, then init functions
        // in source order.
        em.emit_plain_call(initvars_id);
        for &id in init_ids {
            em.emit_plain_call(id);
        }
    }
    em.emit_block(&fd.body);
    em.fb.end()
}

impl Emitter<'_, '_> {
    /// A no-argument, no-result call to a module function.
    pub(crate) fn emit_plain_call(&mut self, target: u32) {
        let idx = self.fb.add_function(target);
        let shift = self.fb.stack_shift();
        self.fb.emit(Instruction::new(Opcode::Call, idx, 0, 0));
        self.fb.emit(Instruction::quad(shift));
    }

    /// Copies a register across within one bank (or through a cell for
    /// negative operands).
    pub(crate) fn emit_bank_move(&mut self, bank: Bank, src: i8, dst: i8, typ: &TypeHandle) {
        let _ = typ;
        if src == dst {
            return;
        }
        self.fb
            .emit(Instruction::new(Opcode::Move, bank as i8, src, dst));
    }

    pub(crate) fn emit_set_var(&mut self, index: u16, src: i8, k: bool) {
        let (b, c) = encode_int16(index as i16);
        self.fb
            .emit(Instruction::with_k(Opcode::SetVar, k, src, b, c));
    }

    pub(crate) fn emit_get_var(&mut self, index: u16, dst: i8) {
        let (a, b) = encode_int16(index as i16);
        self.fb
            .emit(Instruction::new(Opcode::GetVar, a, b, dst));
    }
}
