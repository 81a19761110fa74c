//! Per-function stack frame layout
//!
//! One flat frame per function. Slot `s` lives at `[rbp - 8*(s+1)]`; a text
//! value occupies slots `s` (pointer) and `s+1` (length). Each counted loop
//! additionally reserves two hidden words (end value, step) placed after the
//! highest declared slot, handed out in pre-order so the generator and this
//! scan agree on which loop owns which pair.

use crate::ast::{Expr, ExprKind, Program, Stmt, StmtKind, Storage, SymbolId};
use crate::error::{CompileError, Result};

/// Frames larger than this are rejected as malformed input
const MAX_FRAME_WORDS: u32 = 1 << 24;

#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// Words used by locals, parameters and hidden loop slots
    words: u32,
    /// Hidden slot base for each counted loop, in pre-order
    loop_bases: Vec<u32>,
    next_loop: usize,
}

impl FrameLayout {
    /// Scan a function's parameters and body for every local slot it touches
    pub fn for_function(program: &Program, params: &[SymbolId], body: &[Stmt]) -> Result<Self> {
        let mut scan = FrameScan {
            program,
            words: 0,
            loops: 0,
        };
        for &param in params {
            scan.note(param)?;
        }
        for stmt in body {
            scan.stmt(stmt)?;
        }

        let total = scan
            .loops
            .checked_mul(2)
            .and_then(|hidden| hidden.checked_add(scan.words))
            .filter(|&total| total <= MAX_FRAME_WORDS)
            .ok_or_else(|| CompileError::InvalidInput {
                message: format!(
                    "stack frame of {} words and {} counted loops is too large",
                    scan.words, scan.loops
                ),
            })?;
        let loop_bases = (0..scan.loops).map(|i| scan.words + 2 * i).collect();
        Ok(Self {
            words: total,
            loop_bases,
            next_loop: 0,
        })
    }

    /// Bytes to reserve below RBP, rounded to 16
    pub fn size(&self) -> i32 {
        let bytes = self.words * 8;
        ((bytes + 15) & !15) as i32
    }

    /// RBP-relative displacement of a slot
    pub fn slot_disp(slot: u32) -> i32 {
        -8 * (slot as i32 + 1)
    }

    /// Hidden (end, step) displacements for the next counted loop
    pub fn next_loop_slots(&mut self) -> Result<(i32, i32)> {
        let base = *self.loop_bases.get(self.next_loop).ok_or_else(|| {
            CompileError::internal("counted loop without reserved frame slots")
        })?;
        self.next_loop += 1;
        Ok((Self::slot_disp(base), Self::slot_disp(base + 1)))
    }
}

struct FrameScan<'a> {
    program: &'a Program,
    words: u32,
    loops: u32,
}

impl FrameScan<'_> {
    fn note(&mut self, id: SymbolId) -> Result<()> {
        let symbol = self.program.symbol(id).ok_or_else(|| CompileError::InvalidInput {
            message: format!("reference to undeclared symbol #{}", id.0),
        })?;
        if let Storage::Local { slot } = symbol.storage {
            let end = slot
                .checked_add(symbol.ty.words())
                .filter(|&end| end <= MAX_FRAME_WORDS)
                .ok_or_else(|| CompileError::InvalidInput {
                    message: format!("local '{}' uses out-of-range slot {}", symbol.name, slot),
                })?;
            self.words = self.words.max(end);
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Let { var, init } => {
                self.note(*var)?;
                if let Some(init) = init {
                    self.expr(init)?;
                }
            }
            StmtKind::Expr(e) => self.expr(e)?,
            StmtKind::If {
                branches,
                else_body,
            } => {
                for branch in branches {
                    self.expr(&branch.cond)?;
                    self.block(&branch.body)?;
                }
                if let Some(body) = else_body {
                    self.block(body)?;
                }
            }
            StmtKind::While { cond, body, .. } => {
                self.expr(cond)?;
                self.block(body)?;
            }
            StmtKind::For {
                var,
                start,
                end,
                step,
                body,
                ..
            } => {
                self.loops += 1;
                self.note(*var)?;
                self.expr(start)?;
                self.expr(end)?;
                if let Some(step) = step {
                    self.expr(step)?;
                }
                self.block(body)?;
            }
            StmtKind::Return(Some(e)) => self.expr(e)?,
            StmtKind::Block(body) => self.block(body)?,
            // Function bodies get their own frame
            StmtKind::Function(_)
            | StmtKind::Return(None)
            | StmtKind::Break { .. }
            | StmtKind::Continue { .. } => {}
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt]) -> Result<()> {
        body.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn expr(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Var(id) => self.note(*id),
            ExprKind::Assign { target, value } => {
                self.note(*target)?;
                self.expr(value)
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Call { args, .. } => args.iter().try_for_each(|arg| self.expr(arg)),
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Text(_)
            | ExprKind::Bool(_)
            | ExprKind::Null => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ValueType;

    #[test]
    fn test_slot_displacements() {
        assert_eq!(FrameLayout::slot_disp(0), -8);
        assert_eq!(FrameLayout::slot_disp(3), -32);
    }

    #[test]
    fn test_frame_covers_text_and_params() {
        let mut program = Program::new();
        let a = program.declare("a", ValueType::Int, Storage::Local { slot: 0 });
        let s = program.declare("s", ValueType::Text, Storage::Local { slot: 1 });
        let g = program.declare("g", ValueType::Int, Storage::Global { index: 0 });
        let body = vec![
            Stmt::let_(s, Some(Expr::text("hi"))),
            Stmt::expr(Expr::assign(g, Expr::int(1))),
        ];
        let frame = FrameLayout::for_function(&program, &[a], &body).unwrap();
        // a: slot 0, s: slots 1..=2 -> 3 words -> 24 bytes -> 32 aligned
        assert_eq!(frame.size(), 32);
    }

    #[test]
    fn test_counted_loops_get_hidden_slots_in_order() {
        let mut program = Program::new();
        let i = program.declare("i", ValueType::Int, Storage::Local { slot: 0 });
        let j = program.declare("j", ValueType::Int, Storage::Local { slot: 1 });
        let inner = Stmt::new(StmtKind::For {
            label: None,
            var: j,
            start: Expr::int(0),
            end: Expr::int(2),
            step: None,
            inclusive: false,
            body: vec![],
        });
        let outer = Stmt::new(StmtKind::For {
            label: None,
            var: i,
            start: Expr::int(0),
            end: Expr::int(3),
            step: None,
            inclusive: false,
            body: vec![inner],
        });
        let mut frame = FrameLayout::for_function(&program, &[], &[outer]).unwrap();
        // 2 user words + 2 loops * 2 hidden words = 6 words = 48 bytes
        assert_eq!(frame.size(), 48);
        assert_eq!(frame.next_loop_slots().unwrap(), (-24, -32));
        assert_eq!(frame.next_loop_slots().unwrap(), (-40, -48));
        assert!(frame.next_loop_slots().unwrap_err().is_internal());
    }

    #[test]
    fn test_undeclared_symbol_rejected() {
        let program = Program::new();
        let body = vec![Stmt::print(Expr::var(SymbolId(4), ValueType::Int))];
        let err = FrameLayout::for_function(&program, &[], &body).unwrap_err();
        assert!(matches!(err, CompileError::InvalidInput { .. }));
    }

    #[test]
    fn test_out_of_range_slot_rejected() {
        let mut program = Program::new();
        let i = program.declare("i", ValueType::Int, Storage::Local { slot: u32::MAX - 1 });
        let body = vec![Stmt::new(StmtKind::For {
            label: None,
            var: i,
            start: Expr::int(0),
            end: Expr::int(3),
            step: None,
            inclusive: false,
            body: vec![],
        })];
        let err = FrameLayout::for_function(&program, &[], &body).unwrap_err();
        assert!(
            matches!(err, CompileError::InvalidInput { ref message } if message.contains("'i'"))
        );

        // last slot that still fits, plus a loop, overflows the frame limit
        let mut program = Program::new();
        let i = program.declare("i", ValueType::Int, Storage::Local { slot: MAX_FRAME_WORDS - 1 });
        let mut body = body;
        if let StmtKind::For { var, .. } = &mut body[0].kind {
            *var = i;
        }
        let err = FrameLayout::for_function(&program, &[], &body).unwrap_err();
        assert!(matches!(err, CompileError::InvalidInput { .. }));
    }
}
