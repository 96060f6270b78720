//! Conversion of evalexpr AST nodes into the internal expression representation.
//!
//! Rate expressions and the right hand sides of substitutions are parsed with evalexpr
//! and converted here into [`Expr`] trees, which the rest of the crate manipulates
//! symbolically. Variables stay named; no variable map is needed.
//!
//! The main entry points are [`build_ast`], which recursively traverses an evalexpr AST,
//! and [`parse_expr`], which parses a string first.

use crate::{
    errors::{ConvertError, ModelError},
    expr::Expr,
};
use evalexpr::{build_operator_tree, Node, Operator};
use std::collections::HashMap;

/// Parses an expression string into an [`Expr`].
///
/// # Arguments
/// * `text` - Expression in evalexpr syntax, e.g. `"2*k*A^2"`
///
/// # Returns
/// * `Result<Expr, ModelError>` - The converted expression or the parse/convert error
pub fn parse_expr(text: &str) -> Result<Expr, ModelError> {
    let node: Node = build_operator_tree(text)?;
    Ok(build_ast(&node)?)
}

/// Converts an evalexpr AST node into our internal expression representation.
///
/// # Supported operations
/// * Basic arithmetic: +, -, *, / and unary minus
/// * Variables: any identifier, kept by name
/// * Constants: integer and floating point numbers
/// * Functions: exp, ln, log (natural), sqrt
/// * Exponentiation: x^c where c is a constant expression
pub fn build_ast(node: &Node) -> Result<Expr, ConvertError> {
    let children = node.children();
    match node.operator() {
        // Addition and multiplication fold any number of children into a binary chain
        Operator::Add | Operator::Mul => {
            let (first, rest) = children
                .split_first()
                .ok_or_else(|| ConvertError::Arity(format!("{:?}", node.operator())))?;
            let is_add = matches!(node.operator(), Operator::Add);
            rest.iter().try_fold(build_ast(first)?, |acc, child| {
                let rhs = Box::new(build_ast(child)?);
                Ok(if is_add {
                    Expr::Add(Box::new(acc), rhs)
                } else {
                    Expr::Mul(Box::new(acc), rhs)
                })
            })
        }
        Operator::Sub | Operator::Div => {
            let [left, right] = children else {
                return Err(ConvertError::Arity(format!("{:?}", node.operator())));
            };
            let (l, r) = (Box::new(build_ast(left)?), Box::new(build_ast(right)?));
            Ok(if matches!(node.operator(), Operator::Sub) {
                Expr::Sub(l, r)
            } else {
                Expr::Div(l, r)
            })
        }
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => Ok(Expr::Var(identifier.to_string())),
        Operator::Neg => {
            let [child] = children else {
                return Err(ConvertError::Arity("Neg".to_string()));
            };
            Ok(Expr::Neg(Box::new(build_ast(child)?)))
        }
        Operator::FunctionIdentifier { identifier } => {
            let [child] = children else {
                return Err(ConvertError::Arity(identifier.to_string()));
            };
            let arg = Box::new(build_ast(child)?);
            match identifier.as_str() {
                "ln" | "log" => Ok(Expr::Ln(arg)),
                "sqrt" => Ok(Expr::Sqrt(arg)),
                "exp" => Ok(Expr::Exp(arg)),
                _ => Err(ConvertError::UnsupportedFunction(identifier.to_string())),
            }
        }
        // Root node (also produced by parentheses) wraps exactly one child
        Operator::RootNode => match children {
            [child] => build_ast(child),
            _ => Err(ConvertError::RootNode(format!("{} children", children.len()))),
        },
        // Exponentiation - the exponent must evaluate to a constant
        Operator::Exp => {
            let [base, exponent] = children else {
                return Err(ConvertError::Arity("Exp".to_string()));
            };
            let exponent = build_ast(exponent)?;
            let value = exponent
                .eval(&HashMap::new())
                .map_err(|symbol| ConvertError::ExpOperator(format!("{exponent} (symbol {symbol})")))?;
            let base = Box::new(build_ast(base)?);
            if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                Ok(Expr::Pow(base, value as i64))
            } else {
                Ok(Expr::PowFloat(base, value))
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}
