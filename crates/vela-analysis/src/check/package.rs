//! Package-level declaration ordering.
//!
//! Builds the dependency graph between global declarations, detects
//! initialization cycles in three passes — constants, variables, types —
//! and topologically sorts so every declaration is checked after its
//! dependencies. Declarations whose dependencies never resolve are
//! appended last; the checking pass then reports the underlying
//! "undefined" error. The final order is types, constants, variables,
//! functions (imports are resolved before sorting).

use std::collections::{HashMap, HashSet};

use vela_common::Position;
use vela_syntax::ast::{
    CompositeElem, Decl, Expr, ExprKind, File, Stmt, StmtKind, TypeExpr, TypeExprKind,
};

use super::errors::CheckError;
use super::type_info::DeclRef;
use super::Checker;

#[derive(Clone, Copy, PartialEq, Eq)]
enum DeclKind {
    Type,
    Const,
    Var,
    Func,
}

struct Entry {
    decl: DeclRef,
    kind: DeclKind,
    names: Vec<String>,
    pos: Position,
    /// Free identifiers appearing in the declaration, with use positions.
    deps: Vec<(String, Position)>,
}

pub(crate) fn sort_declarations(
    checker: &Checker,
    files: &[File],
) -> Result<Vec<DeclRef>, CheckError> {
    let mut entries: Vec<Entry> = Vec::new();
    for (fi, file) in files.iter().enumerate() {
        for (di, decl) in file.decls.iter().enumerate() {
            let (kind, names) = match decl {
                Decl::Type(td, _) => (DeclKind::Type, vec![td.name.name.clone()]),
                Decl::Const(cd, _) => (
                    DeclKind::Const,
                    cd.names.iter().map(|n| n.name.clone()).collect(),
                ),
                Decl::Var(vd, _) => (
                    DeclKind::Var,
                    vd.names.iter().map(|n| n.name.clone()).collect(),
                ),
                Decl::Func(fd) => (DeclKind::Func, vec![fd.name.name.clone()]),
            };
            let mut deps = Vec::new();
            collect_decl(decl, &mut deps);
            entries.push(Entry {
                decl: (fi, di),
                kind,
                names,
                pos: decl.pos(),
                deps,
            });
        }
    }

    // Restrict dependencies to package-level names, dropping
    // self-references within a declaration.
    let mut owner: HashMap<&str, usize> = HashMap::new();
    for (i, e) in entries.iter().enumerate() {
        for n in &e.names {
            owner.entry(n.as_str()).or_insert(i);
        }
    }
    let edges: Vec<Vec<(usize, String, Position)>> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            e.deps
                .iter()
                .filter_map(|(name, pos)| {
                    owner
                        .get(name.as_str())
                        .filter(|&&j| j != i)
                        .map(|&j| (j, name.clone(), *pos))
                })
                .collect()
        })
        .collect();

    detect_loops(checker, &entries, &edges)?;

    // Topological sort per kind bucket: types, then constants, then
    // variables; functions keep source order.
    let mut sorted: Vec<DeclRef> = Vec::new();
    for kind in [DeclKind::Type, DeclKind::Const, DeclKind::Var] {
        let mut pending: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == kind)
            .map(|(i, _)| i)
            .collect();
        let mut resolved: HashSet<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| kind_rank(e.kind) < kind_rank(kind))
            .map(|(i, _)| i)
            .collect();
        while !pending.is_empty() {
            let next = pending.iter().position(|&i| {
                edges[i]
                    .iter()
                    .all(|(j, _, _)| resolved.contains(j) || entries[*j].kind == DeclKind::Func)
            });
            match next {
                Some(p) => {
                    let i = pending.remove(p);
                    resolved.insert(i);
                    sorted.push(entries[i].decl);
                }
                None => {
                    // Unresolvable dependencies: append as-is; checking
                    // reports the undefined name.
                    for i in pending.drain(..) {
                        sorted.push(entries[i].decl);
                    }
                }
            }
        }
    }
    for e in &entries {
        if e.kind == DeclKind::Func {
            sorted.push(e.decl);
        }
    }
    Ok(sorted)
}

fn kind_rank(k: DeclKind) -> u8 {
    match k {
        DeclKind::Type => 0,
        DeclKind::Const => 1,
        DeclKind::Var => 2,
        DeclKind::Func => 3,
    }
}

/// The three cycle passes, each with its own diagnostic.
fn detect_loops(
    checker: &Checker,
    entries: &[Entry],
    edges: &[Vec<(usize, String, Position)>],
) -> Result<(), CheckError> {
    for (i, e) in entries.iter().enumerate() {
        if e.kind != DeclKind::Const {
            continue;
        }
        if let Some(path) = find_cycle(i, entries, edges) {
            let mut msg = "constant definition loop\n".to_string();
            for (from, used, pos) in &path[..path.len() - 1] {
                msg.push_str(&format!(
                    "\t{}:{}: {} uses {}\n",
                    checker.path, pos, entries[*from].names[0], used
                ));
            }
            return Err(CheckError::new(&checker.path, e.pos, msg.trim_end()));
        }
    }
    for (i, e) in entries.iter().enumerate() {
        if e.kind != DeclKind::Var {
            continue;
        }
        if let Some(path) = find_cycle(i, entries, edges) {
            let mut msg = format!("typechecking loop involving {}\n", e.names.join(", "));
            for (_, name, pos) in &path {
                msg.push_str(&format!("\t{}:{}: {}\n", checker.path, pos, name));
            }
            return Err(CheckError::new(&checker.path, e.pos, msg.trim_end()));
        }
    }
    for (i, e) in entries.iter().enumerate() {
        if e.kind != DeclKind::Type {
            continue;
        }
        if let Some(path) = find_cycle(i, entries, edges) {
            let mut msg = format!("invalid recursive type alias {}\n", e.names[0]);
            for (_, name, pos) in &path {
                msg.push_str(&format!("\t{}:{}: {}\n", checker.path, pos, name));
            }
            return Err(CheckError::new(&checker.path, e.pos, msg.trim_end()));
        }
    }
    Ok(())
}

/// Finds a dependency path from `start` back to itself. The returned
/// path lists `(entry, used-name, use-position)` steps.
fn find_cycle(
    start: usize,
    entries: &[Entry],
    edges: &[Vec<(usize, String, Position)>],
) -> Option<Vec<(usize, String, Position)>> {
    fn walk(
        at: usize,
        start: usize,
        entries: &[Entry],
        edges: &[Vec<(usize, String, Position)>],
        visiting: &mut Vec<usize>,
        path: &mut Vec<(usize, String, Position)>,
    ) -> bool {
        for (j, name, pos) in &edges[at] {
            if *j == start {
                path.push((at, name.clone(), *pos));
                path.push((*j, entries[*j].names[0].clone(), entries[*j].pos));
                return true;
            }
            if visiting.contains(j) {
                continue;
            }
            visiting.push(*j);
            path.push((at, name.clone(), *pos));
            if walk(*j, start, entries, edges, visiting, path) {
                return true;
            }
            path.pop();
        }
        false
    }
    let mut visiting = vec![start];
    let mut path = Vec::new();
    if walk(start, start, entries, edges, &mut visiting, &mut path) {
        Some(path)
    } else {
        None
    }
}

// =============================================================================
// Free-identifier collection
// =============================================================================
//
// Syntactic over-approximation: every identifier appearing in the
// declaration counts as a potential dependency; names that are not
// package-level declarations are filtered by the caller. Local shadowing
// inside function bodies can produce spurious edges, which at worst
// over-constrains the sort for functions (sorted last anyway).

fn collect_decl(decl: &Decl, out: &mut Vec<(String, Position)>) {
    match decl {
        Decl::Type(td, _) => collect_type(&td.typ, out),
        Decl::Const(cd, _) => {
            if let Some(t) = &cd.typ {
                collect_type(t, out);
            }
            for v in &cd.values {
                collect_expr(v, out);
            }
        }
        Decl::Var(vd, _) => {
            if let Some(t) = &vd.typ {
                collect_type(t, out);
            }
            for v in &vd.values {
                collect_expr(v, out);
            }
        }
        Decl::Func(fd) => {
            for p in &fd.typ.params {
                collect_type(&p.typ, out);
            }
            for r in &fd.typ.results {
                collect_type(&r.typ, out);
            }
            for s in &fd.body {
                collect_stmt(s, out);
            }
        }
    }
}

fn collect_type(t: &TypeExpr, out: &mut Vec<(String, Position)>) {
    match &t.kind {
        TypeExprKind::Name(id) => out.push((id.name.clone(), id.pos)),
        TypeExprKind::Qualified(_, _) => {}
        TypeExprKind::Slice(e) | TypeExprKind::Pointer(e) | TypeExprKind::Chan(_, e) => {
            collect_type(e, out)
        }
        TypeExprKind::Array(n, e) => {
            collect_expr(n, out);
            collect_type(e, out);
        }
        TypeExprKind::Map(k, v) => {
            collect_type(k, out);
            collect_type(v, out);
        }
        TypeExprKind::Func(ft) => {
            for p in &ft.params {
                collect_type(&p.typ, out);
            }
            for r in &ft.results {
                collect_type(&r.typ, out);
            }
        }
        TypeExprKind::Struct(fields) => {
            for f in fields {
                collect_type(&f.typ, out);
            }
        }
        TypeExprKind::Interface(methods) => {
            for m in methods {
                for p in &m.typ.params {
                    collect_type(&p.typ, out);
                }
                for r in &m.typ.results {
                    collect_type(&r.typ, out);
                }
            }
        }
    }
}

fn collect_expr(e: &Expr, out: &mut Vec<(String, Position)>) {
    match &e.kind {
        ExprKind::Ident(id) => out.push((id.name.clone(), id.pos)),
        ExprKind::IntLit(_)
        | ExprKind::FloatLit(_)
        | ExprKind::StringLit(_)
        | ExprKind::RuneLit(_) => {}
        ExprKind::TypeLit(t) => collect_type(t, out),
        ExprKind::Composite(lit) => {
            if let Some(t) = &lit.typ {
                collect_type(t, out);
            }
            for CompositeElem { key, value } in &lit.elems {
                if let Some(k) = key {
                    collect_expr(k, out);
                }
                collect_expr(value, out);
            }
        }
        ExprKind::FuncLit(fl) => {
            for p in &fl.typ.params {
                collect_type(&p.typ, out);
            }
            for r in &fl.typ.results {
                collect_type(&r.typ, out);
            }
            for s in &fl.body {
                collect_stmt(s, out);
            }
        }
        ExprKind::Unary(_, x) | ExprKind::Receive(x) | ExprKind::Paren(x) => collect_expr(x, out),
        ExprKind::Binary(_, l, r) => {
            collect_expr(l, out);
            collect_expr(r, out);
        }
        ExprKind::Call(call) => {
            collect_expr(&call.fun, out);
            for a in &call.args {
                collect_expr(a, out);
            }
        }
        ExprKind::Index(b, i) => {
            collect_expr(b, out);
            collect_expr(i, out);
        }
        ExprKind::Slicing(s) => {
            collect_expr(&s.expr, out);
            if let Some(low) = &s.low {
                collect_expr(low, out);
            }
            if let Some(high) = &s.high {
                collect_expr(high, out);
            }
        }
        ExprKind::Selector(b, _) => collect_expr(b, out),
        ExprKind::TypeAssert(b, t) => {
            collect_expr(b, out);
            if let Some(t) = t {
                collect_type(t, out);
            }
        }
    }
}

fn collect_stmt(s: &Stmt, out: &mut Vec<(String, Position)>) {
    match &s.kind {
        StmtKind::Expr(e) | StmtKind::Go(e) | StmtKind::Defer(e) => collect_expr(e, out),
        StmtKind::Send(ch, v) => {
            collect_expr(ch, out);
            collect_expr(v, out);
        }
        StmtKind::IncDec(e, _) => collect_expr(e, out),
        StmtKind::Assign(a) => {
            for e in a.lhs.iter().chain(&a.rhs) {
                collect_expr(e, out);
            }
        }
        StmtKind::Var(vd) => {
            if let Some(t) = &vd.typ {
                collect_type(t, out);
            }
            for v in &vd.values {
                collect_expr(v, out);
            }
        }
        StmtKind::Const(cd) => {
            if let Some(t) = &cd.typ {
                collect_type(t, out);
            }
            for v in &cd.values {
                collect_expr(v, out);
            }
        }
        StmtKind::Type(td) => collect_type(&td.typ, out),
        StmtKind::Block(body) => {
            for s in body {
                collect_stmt(s, out);
            }
        }
        StmtKind::If(stmt) => {
            if let Some(init) = &stmt.init {
                collect_stmt(init, out);
            }
            collect_expr(&stmt.cond, out);
            for s in &stmt.then {
                collect_stmt(s, out);
            }
            if let Some(els) = &stmt.els {
                collect_stmt(els, out);
            }
        }
        StmtKind::For(stmt) => {
            if let Some(init) = &stmt.init {
                collect_stmt(init, out);
            }
            if let Some(cond) = &stmt.cond {
                collect_expr(cond, out);
            }
            if let Some(post) = &stmt.post {
                collect_stmt(post, out);
            }
            for s in &stmt.body {
                collect_stmt(s, out);
            }
        }
        StmtKind::ForRange(stmt) => {
            collect_expr(&stmt.expr, out);
            for s in &stmt.body {
                collect_stmt(s, out);
            }
        }
        StmtKind::Switch(stmt) => {
            if let Some(init) = &stmt.init {
                collect_stmt(init, out);
            }
            if let Some(tag) = &stmt.tag {
                collect_expr(tag, out);
            }
            for case in &stmt.cases {
                for v in &case.values {
                    collect_expr(v, out);
                }
                for s in &case.body {
                    collect_stmt(s, out);
                }
            }
        }
        StmtKind::TypeSwitch(stmt) => {
            if let Some(init) = &stmt.init {
                collect_stmt(init, out);
            }
            collect_expr(&stmt.expr, out);
            for case in &stmt.cases {
                for t in &case.types {
                    collect_type(t, out);
                }
                for s in &case.body {
                    collect_stmt(s, out);
                }
            }
        }
        StmtKind::Select(stmt) => {
            for case in &stmt.cases {
                match &case.comm {
                    vela_syntax::ast::SelectComm::Send(ch, v) => {
                        collect_expr(ch, out);
                        collect_expr(v, out);
                    }
                    vela_syntax::ast::SelectComm::Recv { chan, .. } => collect_expr(chan, out),
                    vela_syntax::ast::SelectComm::Default => {}
                }
                for s in &case.body {
                    collect_stmt(s, out);
                }
            }
        }
        StmtKind::Return(values) => {
            for v in values {
                collect_expr(v, out);
            }
        }
        StmtKind::Break | StmtKind::Continue | StmtKind::Fallthrough => {}
    }
}
