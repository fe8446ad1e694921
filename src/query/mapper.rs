//! Value mapper - symbol assignment and expression rewriting
//!
//! Walks each field's expression tree once, assigns every distinct call
//! and bare variable reference a stable symbol (`valN`), and rewrites the
//! tree so those nodes become typed synthetic references. The collected
//! reference set feeds the auxiliary field list; the collected call set
//! drives per-call iterator construction.
//!
//! Identical sub-expressions (same canonical string) share one symbol,
//! within and across fields of the same statement. Math calls are never
//! assigned a symbol; the mapper descends into their arguments instead,
//! so a field like `sqrt(mean(x))` maps `mean(x)` and leaves the `sqrt`
//! to per-row evaluation.

use crate::query::ast::{Call, Expr, Field, VarRef};
use crate::query::error::QueryResult;
use crate::query::functions;
use std::collections::HashMap;

/// Symbol table and rewrite pass scoped to one statement.
#[derive(Default)]
pub struct ValueMapper {
    symbols: HashMap<String, String>,
    calls: Vec<(Call, String)>,
    call_index: HashMap<String, usize>,
    refs: Vec<(VarRef, String)>,
    ref_index: HashMap<String, usize>,
    next: usize,
}

impl ValueMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one field: collect symbols from its expression and return the
    /// field with the rewritten tree.
    pub fn map(&mut self, field: &Field) -> QueryResult<Field> {
        self.walk(&field.expr);
        let expr = self.rewrite(&field.expr)?;
        Ok(Field {
            expr,
            alias: field.alias.clone(),
        })
    }

    /// Distinct mapped calls, in first-seen order, with their symbols
    pub fn calls(&self) -> &[(Call, String)] {
        &self.calls
    }

    /// Distinct mapped references, in first-seen order, with their symbols
    pub fn refs(&self) -> &[(VarRef, String)] {
        &self.refs
    }

    /// The symbol assigned to a canonical sub-expression string, if any
    pub fn symbol(&self, canonical: &str) -> Option<&str> {
        self.symbols.get(canonical).map(|s| s.as_str())
    }

    fn walk(&mut self, expr: &Expr) {
        match expr {
            Expr::Call(call) => {
                if functions::is_math_function(&call.name) {
                    for arg in &call.args {
                        self.walk(arg);
                    }
                    return;
                }
                // The call swallows its arguments; they become invisible
                // to the top-level field list.
                let canonical = call.to_string();
                let symbol = self.assign(&canonical);
                if !self.call_index.contains_key(&canonical) {
                    self.call_index.insert(canonical, self.calls.len());
                    self.calls.push((call.clone(), symbol));
                }
            }
            Expr::VarRef(r) => {
                let canonical = r.to_string();
                let symbol = self.assign(&canonical);
                if !self.ref_index.contains_key(&canonical) {
                    self.ref_index.insert(canonical, self.refs.len());
                    self.refs.push((r.clone(), symbol));
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.walk(lhs);
                self.walk(rhs);
            }
            Expr::Paren(inner) => self.walk(inner),
            Expr::Literal(_) => {}
        }
    }

    fn assign(&mut self, canonical: &str) -> String {
        if let Some(existing) = self.symbols.get(canonical) {
            return existing.clone();
        }
        let symbol = format!("val{}", self.next);
        self.next += 1;
        self.symbols.insert(canonical.to_string(), symbol.clone());
        symbol
    }

    fn rewrite(&self, expr: &Expr) -> QueryResult<Expr> {
        match expr {
            Expr::Call(call) if !functions::is_math_function(&call.name) => {
                self.synthetic_ref(expr, &call.to_string())
            }
            Expr::Call(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    args.push(self.rewrite(arg)?);
                }
                Ok(Expr::Call(Call::new(call.name.clone(), args)))
            }
            Expr::VarRef(r) => self.synthetic_ref(expr, &r.to_string()),
            Expr::Binary { op, lhs, rhs } => Ok(Expr::Binary {
                op: *op,
                lhs: Box::new(self.rewrite(lhs)?),
                rhs: Box::new(self.rewrite(rhs)?),
            }),
            Expr::Paren(inner) => Ok(Expr::Paren(Box::new(self.rewrite(inner)?))),
            Expr::Literal(_) => Ok(expr.clone()),
        }
    }

    fn synthetic_ref(&self, original: &Expr, canonical: &str) -> QueryResult<Expr> {
        let symbol = match self.symbols.get(canonical) {
            Some(s) => s.clone(),
            None => return Ok(original.clone()),
        };
        let ty = functions::infer_type(original)?;
        Ok(Expr::VarRef(VarRef { name: symbol, ty }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{BinaryOp, Literal};
    use crate::types::FieldType;

    fn float_ref(name: &str) -> Expr {
        Expr::var(name, FieldType::Float)
    }

    #[test]
    fn test_call_gets_symbol_and_swallows_args() {
        let mut mapper = ValueMapper::new();
        let field = Field::new(Expr::call("mean", vec![float_ref("usage")]));
        let mapped = mapper.map(&field).unwrap();

        assert_eq!(mapped.expr, Expr::var("val0", FieldType::Float));
        assert_eq!(mapper.calls().len(), 1);
        assert_eq!(mapper.calls()[0].1, "val0");
        // The argument ref was swallowed by the call.
        assert!(mapper.refs().is_empty());
    }

    #[test]
    fn test_shared_symbol_across_fields() {
        let mut mapper = ValueMapper::new();
        let call = Expr::call("mean", vec![float_ref("x")]);

        let a = mapper.map(&Field::new(call.clone())).unwrap();
        let b = mapper
            .map(&Field::new(Expr::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(call),
                rhs: Box::new(Expr::Literal(Literal::Integer(1))),
            }))
            .unwrap();

        assert_eq!(a.expr, Expr::var("val0", FieldType::Float));
        match &b.expr {
            Expr::Binary { lhs, .. } => {
                assert_eq!(**lhs, Expr::var("val0", FieldType::Float));
            }
            other => panic!("unexpected rewrite: {:?}", other),
        }
        // One distinct call, computed once.
        assert_eq!(mapper.calls().len(), 1);
    }

    #[test]
    fn test_math_calls_are_transparent() {
        let mut mapper = ValueMapper::new();
        let field = Field::new(Expr::call(
            "sqrt",
            vec![Expr::call("mean", vec![float_ref("x")])],
        ));
        let mapped = mapper.map(&field).unwrap();

        // The math call survives; its argument became a symbol.
        match &mapped.expr {
            Expr::Call(c) => {
                assert_eq!(c.name, "sqrt");
                assert_eq!(c.args[0], Expr::var("val0", FieldType::Float));
            }
            other => panic!("unexpected rewrite: {:?}", other),
        }
        assert_eq!(mapper.calls().len(), 1);
        assert!(mapper.refs().is_empty());
    }

    #[test]
    fn test_bare_refs_are_mapped() {
        let mut mapper = ValueMapper::new();
        let mapped = mapper.map(&Field::new(float_ref("usage"))).unwrap();

        assert_eq!(mapped.expr, Expr::var("val0", FieldType::Float));
        assert_eq!(mapper.refs().len(), 1);
        assert_eq!(mapper.refs()[0].0.name, "usage");
    }

    #[test]
    fn test_ref_and_call_symbols_are_distinct() {
        let mut mapper = ValueMapper::new();
        mapper
            .map(&Field::new(Expr::call("mean", vec![float_ref("x")])))
            .unwrap();
        mapper.map(&Field::new(float_ref("x"))).unwrap();

        assert_eq!(mapper.symbol("mean(x)"), Some("val0"));
        assert_eq!(mapper.symbol("x"), Some("val1"));
    }
}
