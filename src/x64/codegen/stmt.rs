//! Statement lowering and structured control flow

use crate::ast::{CondBranch, Expr, Span, Stmt, StmtKind, SymbolId, ValueType};
use crate::error::{CompileError, Result};

use super::super::encoding::Cond;
use super::super::registers::Reg64;
use super::super::tables::Label;
use super::{LoopLabels, X64Codegen};

/// Operands of a counted loop
struct CountedLoop<'s> {
    label: Option<&'s str>,
    var: SymbolId,
    start: &'s Expr,
    end: &'s Expr,
    step: Option<&'s Expr>,
    inclusive: bool,
    body: &'s [Stmt],
}

impl X64Codegen<'_> {
    pub(super) fn gen_block(&mut self, body: &[Stmt]) -> Result<()> {
        body.iter().try_for_each(|stmt| self.gen_stmt(stmt))
    }

    pub(super) fn gen_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Let { var, init } => {
                let ty = self.symbol(*var)?.ty;
                match init {
                    Some(init) => {
                        let init_ty = self.gen_expr(init)?;
                        self.coerce(init_ty, ty, init.span)?;
                    }
                    None => self.zero_value(ty),
                }
                self.store_symbol(*var, stmt.span)
            }
            StmtKind::Expr(e) => self.gen_expr(e).map(|_| ()),
            StmtKind::If {
                branches,
                else_body,
            } => self.gen_if(branches, else_body.as_deref()),
            StmtKind::While { label, cond, body } => {
                self.gen_while(label.as_deref(), cond, body)
            }
            StmtKind::For {
                label,
                var,
                start,
                end,
                step,
                inclusive,
                body,
            } => self.gen_for(
                CountedLoop {
                    label: label.as_deref(),
                    var: *var,
                    start,
                    end,
                    step: step.as_ref(),
                    inclusive: *inclusive,
                    body,
                },
                stmt.span,
            ),
            StmtKind::Break { label } => {
                let target = self.find_loop(label.as_deref(), "break", stmt.span)?.exit;
                self.jump(target);
                Ok(())
            }
            StmtKind::Continue { label } => {
                let target = self
                    .find_loop(label.as_deref(), "continue", stmt.span)?
                    .continue_to;
                self.jump(target);
                Ok(())
            }
            StmtKind::Return(value) => self.gen_return(value.as_ref()),
            StmtKind::Block(body) => self.gen_block(body),
            StmtKind::Function(decl) => Err(CompileError::unsupported(
                format!("nested function '{}'", decl.name),
                stmt.span,
            )),
        }
    }

    /// Jump to `target` when `cond` is false
    fn branch_false(&mut self, cond: &Expr, target: Label) -> Result<()> {
        self.gen_truth(cond)?;
        self.code.test_r64_r64(Reg64::RAX, Reg64::RAX);
        self.jump_if(Cond::E, target);
        Ok(())
    }

    fn gen_if(&mut self, branches: &[CondBranch], else_body: Option<&[Stmt]>) -> Result<()> {
        let end = self.labels.new_label();
        for branch in branches {
            let next = self.labels.new_label();
            self.branch_false(&branch.cond, next)?;
            self.gen_block(&branch.body)?;
            self.jump(end);
            self.bind(next)?;
        }
        if let Some(body) = else_body {
            self.gen_block(body)?;
        }
        self.bind(end)
    }

    fn gen_while(&mut self, label: Option<&str>, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let head = self.labels.new_label();
        let exit = self.labels.new_label();
        self.bind(head)?;
        self.branch_false(cond, exit)?;
        self.gen_loop_body(label, head, exit, body)?;
        self.jump(head);
        self.bind(exit)
    }

    /// `for var in start..end step s` (or `..=`); a negative step counts down
    fn gen_for(&mut self, l: CountedLoop<'_>, span: Span) -> Result<()> {
        let var_ty = self.symbol(l.var)?.ty;
        if !var_ty.is_integral() {
            return Err(CompileError::unsupported(
                format!("counted loop over a {} variable", var_ty),
                span,
            ));
        }
        let (end_disp, step_disp) = self.func()?.frame.next_loop_slots()?;

        let ty = self.gen_expr(l.start)?;
        self.coerce(ty, var_ty, l.start.span)?;
        self.store_symbol(l.var, span)?;

        let ty = self.gen_expr(l.end)?;
        self.coerce(ty, ValueType::Int, l.end.span)?;
        self.code.mov_mem_r64(Reg64::RBP, end_disp, Reg64::RAX);

        match l.step {
            Some(step) => {
                let ty = self.gen_expr(step)?;
                self.coerce(ty, ValueType::Int, step.span)?;
            }
            None => self.code.mov_r64_imm32(Reg64::RAX, 1),
        }
        self.code.mov_mem_r64(Reg64::RBP, step_disp, Reg64::RAX);

        let check = self.labels.new_label();
        let descending = self.labels.new_label();
        let body = self.labels.new_label();
        let next = self.labels.new_label();
        let exit = self.labels.new_label();

        self.bind(check)?;
        self.load_symbol(l.var, span)?;
        self.code.mov_r64_mem(Reg64::RCX, Reg64::RBP, end_disp);
        self.code.mov_r64_mem(Reg64::RDX, Reg64::RBP, step_disp);
        self.code.test_r64_r64(Reg64::RDX, Reg64::RDX);
        self.jump_if(Cond::S, descending);

        self.code.cmp_r64_r64(Reg64::RAX, Reg64::RCX);
        self.jump_if(if l.inclusive { Cond::G } else { Cond::GE }, exit);
        self.jump(body);

        self.bind(descending)?;
        self.code.cmp_r64_r64(Reg64::RAX, Reg64::RCX);
        self.jump_if(if l.inclusive { Cond::L } else { Cond::LE }, exit);

        self.bind(body)?;
        self.gen_loop_body(l.label, next, exit, l.body)?;

        self.bind(next)?;
        self.load_symbol(l.var, span)?;
        self.code.mov_r64_mem(Reg64::RCX, Reg64::RBP, step_disp);
        self.code.add_r64_r64(Reg64::RAX, Reg64::RCX);
        self.store_symbol(l.var, span)?;
        self.jump(check);
        self.bind(exit)
    }

    fn gen_loop_body(
        &mut self,
        name: Option<&str>,
        continue_to: Label,
        exit: Label,
        body: &[Stmt],
    ) -> Result<()> {
        self.func()?.loops.push(LoopLabels {
            name: name.map(str::to_string),
            continue_to,
            exit,
        });
        let result = self.gen_block(body);
        self.func()?.loops.pop();
        result
    }

    /// Innermost loop, or the innermost one carrying `label`
    fn find_loop(&mut self, label: Option<&str>, keyword: &str, span: Span) -> Result<LoopLabels> {
        let found = self
            .func()?
            .loops
            .iter()
            .rev()
            .find(|l| label.map_or(true, |name| l.name.as_deref() == Some(name)))
            .cloned();
        found.ok_or_else(|| match label {
            Some(name) => CompileError::control_flow(
                format!("`{}` to unknown loop label '{}'", keyword, name),
                span,
            ),
            None => CompileError::control_flow(format!("`{}` outside of a loop", keyword), span),
        })
    }

    fn gen_return(&mut self, value: Option<&Expr>) -> Result<()> {
        let (ret, epilogue) = {
            let state = self.func()?;
            (state.ret, state.epilogue)
        };
        match value {
            Some(value) => {
                let ty = self.gen_expr(value)?;
                self.coerce(ty, ret, value.span)?;
            }
            None => self.zero_value(ret),
        }
        self.jump(epilogue);
        Ok(())
    }
}
