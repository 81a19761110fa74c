//! Expression lowering

use crate::ast::{BinaryOp, Builtin, Callee, Expr, ExprKind, Span, UnaryOp, ValueType};
use crate::error::{CompileError, Result};

use super::super::encoding::Cond;
use super::super::registers::{Reg64, Xmm, SYSV_ARG_REGS, TEXT_LEN_REG};
use super::{Helper, X64Codegen};

impl X64Codegen<'_> {
    /// Static type of the value `expr` produces
    pub(super) fn static_type(&self, expr: &Expr) -> Result<ValueType> {
        match &expr.kind {
            ExprKind::Var(id) => Ok(self.symbol(*id)?.ty),
            ExprKind::Assign { target, .. } => Ok(self.symbol(*target)?.ty),
            ExprKind::Call {
                callee: Callee::Function(name),
                ..
            } => Ok(self.functions.get(name).map_or(expr.ty, |f| f.ret)),
            _ => Ok(expr.ty),
        }
    }

    /// Generate `expr` into the result registers and return its type
    pub(super) fn gen_expr(&mut self, expr: &Expr) -> Result<ValueType> {
        match &expr.kind {
            ExprKind::Int(value) => {
                self.code.mov_r64_imm(Reg64::RAX, *value);
                Ok(ValueType::Int)
            }
            ExprKind::Bool(value) => {
                self.code.mov_r64_imm32(Reg64::RAX, *value as i32);
                Ok(ValueType::Bool)
            }
            ExprKind::Float(value) => {
                let offset = self.pool.intern_f64(*value);
                let site = self.code.movsd_xmm_rip(Xmm::XMM0);
                self.rip_const(site, offset);
                Ok(ValueType::Float)
            }
            ExprKind::Text(value) => {
                let offset = self.pool.intern_str(value.as_bytes());
                let site = self.code.lea_r64_rip(Reg64::RAX);
                self.rip_const(site, offset);
                self.code.mov_r64_imm(TEXT_LEN_REG, value.len() as i64);
                Ok(ValueType::Text)
            }
            ExprKind::Null => {
                self.zero_value(ValueType::Text);
                if expr.ty == ValueType::Float {
                    self.zero_value(ValueType::Float);
                }
                Ok(expr.ty)
            }
            ExprKind::Var(id) => self.load_symbol(*id, expr.span),
            ExprKind::Assign { target, value } => {
                let target_ty = self.symbol(*target)?.ty;
                let value_ty = self.gen_expr(value)?;
                self.coerce(value_ty, target_ty, value.span)?;
                self.store_symbol(*target, expr.span)?;
                Ok(target_ty)
            }
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs, expr.span),
            ExprKind::Unary { op, operand } => self.gen_unary(*op, operand, expr.span),
            ExprKind::Call {
                callee: Callee::Builtin(Builtin::Print),
                args,
            } => {
                self.gen_print(args, expr.span)?;
                Ok(ValueType::Void)
            }
            ExprKind::Call {
                callee: Callee::Function(name),
                args,
            } => self.gen_call(name, args, expr.span),
        }
    }

    /// Generate `expr` as a 0/1 truth value in RAX
    pub(super) fn gen_truth(&mut self, expr: &Expr) -> Result<()> {
        let ty = self.gen_expr(expr)?;
        match ty {
            ValueType::Int | ValueType::Bool => self.code.test_r64_r64(Reg64::RAX, Reg64::RAX),
            ValueType::Float => {
                self.code.xorpd(Xmm::XMM1, Xmm::XMM1);
                self.code.ucomisd(Xmm::XMM0, Xmm::XMM1);
            }
            // Non-empty text is true
            ValueType::Text => self.code.test_r64_r64(TEXT_LEN_REG, TEXT_LEN_REG),
            ValueType::Void => {
                return Err(CompileError::unsupported("void value used as a condition", expr.span))
            }
        }
        self.set_bool(Cond::NE);
        Ok(())
    }

    /// setcc al; movzx rax, al
    fn set_bool(&mut self, cond: Cond) {
        self.code.setcc(cond, Reg64::RAX);
        self.code.movzx_r64_r8(Reg64::RAX, Reg64::RAX);
    }

    fn gen_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<ValueType> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.gen_logical(op, lhs, rhs);
        }

        let lhs_ty = self.static_type(lhs)?;
        let rhs_ty = self.static_type(rhs)?;
        match (lhs_ty, rhs_ty) {
            (ValueType::Text, ValueType::Text) => self.gen_text_binary(op, lhs, rhs, span),
            (ValueType::Float, other) | (other, ValueType::Float)
                if other == ValueType::Float || other.is_integral() =>
            {
                self.gen_float_binary(op, lhs, rhs, span)
            }
            (l, r) if l.is_integral() && r.is_integral() => self.gen_int_binary(op, lhs, rhs),
            (l, r) => Err(CompileError::unsupported(
                format!("operator '{}' on {} and {}", op, l, r),
                span,
            )),
        }
    }

    /// Short-circuit `&&` / `||`
    fn gen_logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<ValueType> {
        let end = self.labels.new_label();
        self.gen_truth(lhs)?;
        self.code.test_r64_r64(Reg64::RAX, Reg64::RAX);
        let cond = if op == BinaryOp::And { Cond::E } else { Cond::NE };
        self.jump_if(cond, end);
        self.gen_truth(rhs)?;
        self.bind(end)?;
        Ok(ValueType::Bool)
    }

    /// Integer operands: left in RAX, right in RCX
    fn gen_int_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<ValueType> {
        self.gen_expr(lhs)?;
        self.code.push_r64(Reg64::RAX);
        self.gen_expr(rhs)?;
        self.code.mov_r64_r64(Reg64::RCX, Reg64::RAX);
        self.code.pop_r64(Reg64::RAX);

        let (rax, rcx) = (Reg64::RAX, Reg64::RCX);
        match op {
            BinaryOp::Add => self.code.add_r64_r64(rax, rcx),
            BinaryOp::Sub => self.code.sub_r64_r64(rax, rcx),
            BinaryOp::Mul => self.code.imul_r64_r64(rax, rcx),
            BinaryOp::Div => {
                self.code.cqo();
                self.code.idiv_r64(rcx);
            }
            BinaryOp::Mod => {
                self.code.cqo();
                self.code.idiv_r64(rcx);
                self.code.mov_r64_r64(rax, Reg64::RDX);
            }
            BinaryOp::BitAnd => self.code.and_r64_r64(rax, rcx),
            BinaryOp::BitOr => self.code.or_r64_r64(rax, rcx),
            BinaryOp::BitXor => self.code.xor_r64_r64(rax, rcx),
            BinaryOp::Shl => self.code.shl_r64_cl(rax),
            BinaryOp::Shr => self.code.sar_r64_cl(rax),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let cond = match op {
                    BinaryOp::Eq => Cond::E,
                    BinaryOp::Ne => Cond::NE,
                    BinaryOp::Lt => Cond::L,
                    BinaryOp::Le => Cond::LE,
                    BinaryOp::Gt => Cond::G,
                    _ => Cond::GE,
                };
                self.code.cmp_r64_r64(rax, rcx);
                self.set_bool(cond);
                return Ok(ValueType::Bool);
            }
            BinaryOp::And | BinaryOp::Or => {
                return Err(CompileError::internal("logical operator reached integer lowering"))
            }
        }
        Ok(ValueType::Int)
    }

    /// Double operands: left in XMM0, right in XMM1
    fn gen_float_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<ValueType> {
        let cond = match op {
            BinaryOp::Eq => Some(Cond::E),
            BinaryOp::Ne => Some(Cond::NE),
            BinaryOp::Lt => Some(Cond::B),
            BinaryOp::Le => Some(Cond::BE),
            BinaryOp::Gt => Some(Cond::A),
            BinaryOp::Ge => Some(Cond::AE),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => None,
            _ => {
                return Err(CompileError::unsupported(
                    format!("operator '{}' on float", op),
                    span,
                ))
            }
        };

        let lhs_ty = self.gen_expr(lhs)?;
        self.coerce(lhs_ty, ValueType::Float, lhs.span)?;
        self.code.movq_r64_xmm(Reg64::RAX, Xmm::XMM0);
        self.code.push_r64(Reg64::RAX);
        let rhs_ty = self.gen_expr(rhs)?;
        self.coerce(rhs_ty, ValueType::Float, rhs.span)?;
        self.code.movsd_xmm_xmm(Xmm::XMM1, Xmm::XMM0);
        self.code.pop_r64(Reg64::RAX);
        self.code.movq_xmm_r64(Xmm::XMM0, Reg64::RAX);

        if let Some(cond) = cond {
            self.code.ucomisd(Xmm::XMM0, Xmm::XMM1);
            self.set_bool(cond);
            return Ok(ValueType::Bool);
        }
        match op {
            BinaryOp::Add => self.code.addsd(Xmm::XMM0, Xmm::XMM1),
            BinaryOp::Sub => self.code.subsd(Xmm::XMM0, Xmm::XMM1),
            BinaryOp::Mul => self.code.mulsd(Xmm::XMM0, Xmm::XMM1),
            _ => self.code.divsd(Xmm::XMM0, Xmm::XMM1),
        }
        Ok(ValueType::Float)
    }

    /// Text operands: left in RDI/RSI, right in RDX/RCX
    fn gen_text_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<ValueType> {
        if !matches!(op, BinaryOp::Add | BinaryOp::Eq | BinaryOp::Ne) {
            return Err(CompileError::unsupported(
                format!("operator '{}' on text", op),
                span,
            ));
        }

        self.gen_expr(lhs)?;
        self.code.push_r64(TEXT_LEN_REG);
        self.code.push_r64(Reg64::RAX);
        self.gen_expr(rhs)?;
        self.code.mov_r64_r64(Reg64::RDX, Reg64::RAX);
        self.code.mov_r64_r64(Reg64::RCX, TEXT_LEN_REG);
        self.code.pop_r64(Reg64::RDI);
        self.code.pop_r64(Reg64::RSI);

        match op {
            BinaryOp::Add => {
                self.call_helper(Helper::Concat);
                Ok(ValueType::Text)
            }
            BinaryOp::Eq => {
                self.call_helper(Helper::TextEq);
                Ok(ValueType::Bool)
            }
            _ => {
                self.call_helper(Helper::TextEq);
                self.code.test_r64_r64(Reg64::RAX, Reg64::RAX);
                self.set_bool(Cond::E);
                Ok(ValueType::Bool)
            }
        }
    }

    fn gen_unary(&mut self, op: UnaryOp, operand: &Expr, span: Span) -> Result<ValueType> {
        match op {
            UnaryOp::Not => {
                self.gen_truth(operand)?;
                self.code.test_r64_r64(Reg64::RAX, Reg64::RAX);
                self.set_bool(Cond::E);
                Ok(ValueType::Bool)
            }
            UnaryOp::Neg => match self.gen_expr(operand)? {
                ValueType::Float => {
                    self.code.movsd_xmm_xmm(Xmm::XMM1, Xmm::XMM0);
                    self.code.xorpd(Xmm::XMM0, Xmm::XMM0);
                    self.code.subsd(Xmm::XMM0, Xmm::XMM1);
                    Ok(ValueType::Float)
                }
                ty if ty.is_integral() => {
                    self.code.neg_r64(Reg64::RAX);
                    Ok(ValueType::Int)
                }
                ty => Err(CompileError::unsupported(format!("negation of {}", ty), span)),
            },
            UnaryOp::BitNot => match self.gen_expr(operand)? {
                ty if ty.is_integral() => {
                    self.code.not_r64(Reg64::RAX);
                    Ok(ValueType::Int)
                }
                ty => Err(CompileError::unsupported(format!("bitwise not of {}", ty), span)),
            },
        }
    }

    /// print(x): dispatch to the runtime helper for x's type
    fn gen_print(&mut self, args: &[Expr], span: Span) -> Result<()> {
        let [arg] = args else {
            return Err(CompileError::unsupported(
                format!("print with {} arguments", args.len()),
                span,
            ));
        };
        match self.gen_expr(arg)? {
            ValueType::Int | ValueType::Bool => {
                self.code.mov_r64_r64(Reg64::RDI, Reg64::RAX);
                self.call_helper(Helper::PrintInt);
            }
            ValueType::Float => self.call_helper(Helper::PrintFloat),
            ValueType::Text => {
                self.code.mov_r64_r64(Reg64::RDI, Reg64::RAX);
                self.code.mov_r64_r64(Reg64::RSI, TEXT_LEN_REG);
                self.call_helper(Helper::PrintText);
            }
            ValueType::Void => {
                return Err(CompileError::unsupported("print of a void value", arg.span))
            }
        }
        Ok(())
    }

    /// Call a user function: push right to left, pop the first six words into registers
    fn gen_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<ValueType> {
        let entry = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownFunction {
                name: name.to_string(),
                span,
            })?;
        if entry.params.len() != args.len() {
            return Err(CompileError::InvalidInput {
                message: format!(
                    "'{}' takes {} arguments but {} were given",
                    name,
                    entry.params.len(),
                    args.len()
                ),
            });
        }

        for (arg, &param_ty) in args.iter().zip(&entry.params).rev() {
            let ty = self.gen_expr(arg)?;
            self.coerce(ty, param_ty, arg.span)?;
            self.push_value(param_ty);
        }

        let words = entry.arg_words() as usize;
        for &reg in SYSV_ARG_REGS.iter().take(words) {
            self.code.pop_r64(reg);
        }
        self.call_label(entry.label);

        let extra = words.saturating_sub(SYSV_ARG_REGS.len());
        if extra > 0 {
            self.code.add_r64_imm32(Reg64::RSP, 8 * extra as i32);
        }
        Ok(entry.ret)
    }

    /// Push the result registers as argument words (first word on top)
    fn push_value(&mut self, ty: ValueType) {
        match ty {
            ValueType::Text => {
                self.code.push_r64(TEXT_LEN_REG);
                self.code.push_r64(Reg64::RAX);
            }
            ValueType::Float => {
                self.code.movq_r64_xmm(Reg64::RAX, Xmm::XMM0);
                self.code.push_r64(Reg64::RAX);
            }
            _ => self.code.push_r64(Reg64::RAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{BinaryOp, Expr, Program, Span, Stmt, Storage, UnaryOp, ValueType};
    use crate::error::CompileError;
    use crate::x64::codegen::X64Codegen;

    fn code_for(program: &Program) -> Vec<u8> {
        X64Codegen::new(program).generate().unwrap().code
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_int_division_sequence() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Mod, Expr::int(7), Expr::int(3), ValueType::Int);
        program.items.push(Stmt::print(e));
        let code = code_for(&program);
        // mov rcx, rax; pop rax; cqo; idiv rcx; mov rax, rdx
        assert!(contains(
            &code,
            &[0x48, 0x89, 0xC1, 0x58, 0x48, 0x99, 0x48, 0xF7, 0xF9, 0x48, 0x89, 0xD0]
        ));
    }

    #[test]
    fn test_int_comparison_uses_setcc() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Lt, Expr::int(1), Expr::int(2), ValueType::Bool);
        program.items.push(Stmt::print(e));
        let code = code_for(&program);
        // cmp rax, rcx; setl al; movzx rax, al
        assert!(contains(&code, &[0x48, 0x39, 0xC8, 0x0F, 0x9C, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]));
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_float() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Add, Expr::int(1), Expr::float(0.5), ValueType::Float);
        program.items.push(Stmt::print(e));
        let code = code_for(&program);
        // cvtsi2sd xmm0, rax for the int side, addsd xmm0, xmm1 for the sum
        assert!(contains(&code, &[0xF2, 0x48, 0x0F, 0x2A, 0xC0]));
        assert!(contains(&code, &[0xF2, 0x0F, 0x58, 0xC1]));
    }

    #[test]
    fn test_float_modulo_unsupported() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Mod, Expr::float(1.0), Expr::float(2.0), ValueType::Float)
            .at(Span::new(0, 3, 4, 2));
        program.items.push(Stmt::print(e));
        let err = X64Codegen::new(&program).generate().unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
        assert_eq!(err.span().map(|s| s.line), Some(4));
    }

    #[test]
    fn test_text_ordering_unsupported() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Lt, Expr::text("a"), Expr::text("b"), ValueType::Bool);
        program.items.push(Stmt::print(e));
        assert!(X64Codegen::new(&program).generate().is_err());
    }

    #[test]
    fn test_text_and_int_mix_unsupported() {
        let mut program = Program::new();
        let e = Expr::binary(BinaryOp::Add, Expr::text("a"), Expr::int(1), ValueType::Text);
        program.items.push(Stmt::print(e));
        let err = X64Codegen::new(&program).generate().unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    #[test]
    fn test_print_arity_checked() {
        let mut program = Program::new();
        let mut e = Expr::print(Expr::int(1));
        if let crate::ast::ExprKind::Call { args, .. } = &mut e.kind {
            args.push(Expr::int(2));
        }
        program.items.push(Stmt::expr(e));
        let err = X64Codegen::new(&program).generate().unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    #[test]
    fn test_print_void_unsupported() {
        let mut program = Program::new();
        program.items.push(Stmt::print(Expr::print(Expr::int(1))));
        assert!(X64Codegen::new(&program).generate().is_err());
    }

    #[test]
    fn test_negation_of_float() {
        let mut program = Program::new();
        let e = Expr::unary(UnaryOp::Neg, Expr::float(2.0), ValueType::Float);
        program.items.push(Stmt::print(e));
        let code = code_for(&program);
        // movsd xmm1, xmm0; xorpd xmm0, xmm0; subsd xmm0, xmm1
        assert!(contains(
            &code,
            &[0xF2, 0x0F, 0x10, 0xC8, 0x66, 0x0F, 0x57, 0xC0, 0xF2, 0x0F, 0x5C, 0xC1]
        ));
    }

    #[test]
    fn test_global_assignment_records_rip_patch() {
        let mut program = Program::new();
        let g = program.declare("g", ValueType::Int, Storage::Global { index: 0 });
        program.items.push(Stmt::expr(Expr::assign(g, Expr::int(5))));
        let machine = X64Codegen::new(&program).generate().unwrap();
        assert_eq!(machine.rip_patches.len(), 1);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let mut program = Program::new();
        program.items.push(Stmt::new(crate::ast::StmtKind::Function(crate::ast::FunctionDecl {
            name: "f".into(),
            params: vec![],
            ret: ValueType::Int,
            body: vec![],
        })));
        program.items.push(Stmt::print(Expr::call("f", vec![Expr::int(1)], ValueType::Int)));
        let err = X64Codegen::new(&program).generate().unwrap_err();
        assert!(matches!(err, CompileError::InvalidInput { .. }));
    }
}
