// Copyright 2025 Cornell University
// released under MIT License

use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::PrattParser;
use pest::Parser;
use pest_derive::Parser;
use std::fmt;

use crate::errors::ParseError;

#[derive(Parser)]
#[grammar = "expr.pest"]
struct ExprParser;

lazy_static::lazy_static! {
    static ref PRATT_PARSER: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        // Precedence is defined lowest to highest
        PrattParser::new()
            .op(Op::infix(or, Left))
            .op(Op::infix(and, Left))
            .op(Op::infix(eq, Left) | Op::infix(neq, Left))
            .op(Op::infix(lt, Left) | Op::infix(le, Left) | Op::infix(gt, Left) | Op::infix(ge, Left))
            .op(Op::infix(add, Left) | Op::infix(sub, Left))
            .op(Op::infix(mul, Left) | Op::infix(div, Left) | Op::infix(rem, Left))
            .op(Op::prefix(not) | Op::prefix(neg))
            .op(Op::postfix(member) | Op::postfix(index))
    };
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::Or | BinOp::And)
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem
        )
    }
}

/// Syntax tree of the expression micro-language
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    // literals
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Array(Vec<Ast>),
    // names
    Ident(String),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    // operators
    Unary(UnaryOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    /// Function call, `Math.` prefixes are already stripped
    Call(String, Vec<Ast>),
}

impl Ast {
    /// Returns the root identifier of a name path such as `a.b[i].c`
    pub fn root_ident(&self) -> Option<&str> {
        match self {
            Ast::Ident(name) => Some(name),
            Ast::Member(base, _) | Ast::Index(base, _) => base.root_ident(),
            _ => None,
        }
    }

    /// Collects the root identifiers read by this expression, in order of
    /// first occurrence.
    pub fn free_roots(&self) -> Vec<String> {
        let mut out = vec![];
        self.free_roots_helper(&mut out);
        out
    }

    fn free_roots_helper(&self, out: &mut Vec<String>) {
        match self {
            Ast::Bool(_) | Ast::Int(_) | Ast::Real(_) | Ast::Str(_) => {}
            Ast::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Ast::Member(base, _) => base.free_roots_helper(out),
            Ast::Index(base, idx) => {
                base.free_roots_helper(out);
                idx.free_roots_helper(out);
            }
            Ast::Unary(_, e) => e.free_roots_helper(out),
            Ast::Binary(_, a, b) => {
                a.free_roots_helper(out);
                b.free_roots_helper(out);
            }
            Ast::Ternary(c, t, e) => {
                c.free_roots_helper(out);
                t.free_roots_helper(out);
                e.free_roots_helper(out);
            }
            Ast::Call(_, args) | Ast::Array(args) => {
                for arg in args {
                    arg.free_roots_helper(out);
                }
            }
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::Neg => write!(f, "-"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        };
        write!(f, "{}", s)
    }
}

/// Pretty-printer for `Ast`s, nested operators are parenthesized
impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ast::Bool(b) => write!(f, "{}", b),
            Ast::Int(i) => write!(f, "{}", i),
            Ast::Real(r) => write!(f, "{:?}", r),
            Ast::Str(s) => write!(f, "'{}'", s),
            Ast::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Ast::Ident(name) => write!(f, "{}", name),
            Ast::Member(base, field) => write!(f, "{}.{}", base, field),
            Ast::Index(base, idx) => write!(f, "{}[{}]", base, idx),
            Ast::Unary(op, e) => match e.as_ref() {
                Ast::Binary(..) | Ast::Ternary(..) => write!(f, "{}({})", op, e),
                _ => write!(f, "{}{}", op, e),
            },
            Ast::Binary(op, a, b) => {
                write_operand(f, a)?;
                write!(f, " {} ", op)?;
                write_operand(f, b)
            }
            Ast::Ternary(c, t, e) => write!(f, "{} ? {} : {}", c, t, e),
            Ast::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Ast) -> fmt::Result {
    match e {
        Ast::Binary(..) | Ast::Ternary(..) => write!(f, "({})", e),
        _ => write!(f, "{}", e),
    }
}

/// Reads one expression
pub fn parse_expression(text: &str) -> Result<Ast, ParseError> {
    let error = |message: String| ParseError {
        input: text.to_string(),
        message,
    };
    let mut pairs = ExprParser::parse(Rule::program, text).map_err(|e| error(e.to_string()))?;
    let program = pairs
        .next()
        .ok_or_else(|| error("empty input".to_string()))?;
    let ternary = program
        .into_inner()
        .next()
        .ok_or_else(|| error("empty input".to_string()))?;
    parse_ternary(ternary).map_err(error)
}

fn parse_ternary(pair: Pair<Rule>) -> Result<Ast, String> {
    let mut inner = pair.into_inner();
    let cond = inner
        .next()
        .ok_or_else(|| "expected expression".to_string())?;
    let cond = parse_expr(cond.into_inner())?;
    match (inner.next(), inner.next()) {
        (Some(then), Some(otherwise)) => Ok(Ast::Ternary(
            Box::new(cond),
            Box::new(parse_ternary(then)?),
            Box::new(parse_ternary(otherwise)?),
        )),
        _ => Ok(cond),
    }
}

fn parse_list(pairs: Pairs<Rule>) -> Result<Vec<Ast>, String> {
    pairs.map(parse_ternary).collect()
}

fn parse_expr(pairs: Pairs<Rule>) -> Result<Ast, String> {
    PRATT_PARSER
        .map_primary(|primary| match primary.as_rule() {
            Rule::integer => primary
                .as_str()
                .parse::<i64>()
                .map(Ast::Int)
                .map_err(|e| format!("integer literal {}: {}", primary.as_str(), e)),
            Rule::real => primary
                .as_str()
                .parse::<f64>()
                .map(Ast::Real)
                .map_err(|e| format!("real literal {}: {}", primary.as_str(), e)),
            Rule::boolean => Ok(Ast::Bool(primary.as_str() == "true")),
            Rule::string => {
                let s = primary.as_str();
                Ok(Ast::Str(s[1..s.len() - 1].to_string()))
            }
            Rule::ident => Ok(Ast::Ident(primary.as_str().to_string())),
            Rule::array => Ok(Ast::Array(parse_list(primary.into_inner())?)),
            Rule::call => {
                let mut inner = primary.into_inner();
                let name = inner
                    .next()
                    .map(|p| p.as_str().to_string())
                    .ok_or_else(|| "expected function name".to_string())?;
                let name = name
                    .strip_prefix("Math.")
                    .map(str::to_string)
                    .unwrap_or(name);
                Ok(Ast::Call(name, parse_list(inner)?))
            }
            Rule::ternary => parse_ternary(primary),
            rule => Err(format!("expected an atom, found {:?}", rule)),
        })
        .map_prefix(|op, arg| {
            let op = match op.as_rule() {
                Rule::not => UnaryOp::Not,
                Rule::neg => UnaryOp::Neg,
                rule => return Err(format!("expected a prefix operator, found {:?}", rule)),
            };
            let arg = arg?;
            // fold negative literals right away
            Ok(match (op, arg) {
                (UnaryOp::Neg, Ast::Int(i)) => Ast::Int(-i),
                (UnaryOp::Neg, Ast::Real(r)) => Ast::Real(-r),
                (op, arg) => Ast::Unary(op, Box::new(arg)),
            })
        })
        .map_postfix(|base, op| {
            let base = base?;
            match op.as_rule() {
                Rule::member => {
                    let field = op
                        .into_inner()
                        .next()
                        .map(|p| p.as_str().to_string())
                        .ok_or_else(|| "expected field name".to_string())?;
                    Ok(Ast::Member(Box::new(base), field))
                }
                Rule::index => {
                    let idx = op
                        .into_inner()
                        .next()
                        .ok_or_else(|| "expected index".to_string())?;
                    Ok(Ast::Index(Box::new(base), Box::new(parse_ternary(idx)?)))
                }
                rule => Err(format!("expected a postfix operator, found {:?}", rule)),
            }
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or => BinOp::Or,
                Rule::and => BinOp::And,
                Rule::eq => BinOp::Eq,
                Rule::neq => BinOp::Neq,
                Rule::lt => BinOp::Lt,
                Rule::le => BinOp::Le,
                Rule::gt => BinOp::Gt,
                Rule::ge => BinOp::Ge,
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::rem => BinOp::Rem,
                rule => return Err(format!("expected an infix operator, found {:?}", rule)),
            };
            Ok(Ast::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: &str) -> String {
        parse_expression(text).unwrap().to_string()
    }

    #[test]
    fn precedence() {
        assert_eq!(roundtrip("1 + 2 * 3"), "1 + (2 * 3)");
        assert_eq!(roundtrip("(1 + 2) * 3"), "(1 + 2) * 3");
        assert_eq!(roundtrip("a < b && !c || d"), "((a < b) && !c) || d");
        assert_eq!(roundtrip("a - -b"), "a - -b");
        assert_eq!(roundtrip("x == 1 ? 2 : y"), "x == 1 ? 2 : y");
    }

    #[test]
    fn paths_and_calls() {
        let ast = parse_expression("_msg.points[i + 1].x").unwrap();
        assert_eq!(ast.root_ident(), Some("_msg"));
        assert_eq!(ast.to_string(), "_msg.points[i + 1].x");
        assert_eq!(roundtrip("Math.floor(t / 2)"), "floor(t / 2)");
        assert_eq!(roundtrip("max(a, b.length)"), "max(a, b.length)");
        assert_eq!(roundtrip("[1, 2, 3]"), "[1, 2, 3]");
        assert_eq!(roundtrip("'ok' == s"), "'ok' == s");
    }

    #[test]
    fn literals() {
        assert_eq!(parse_expression("-5").unwrap(), Ast::Int(-5));
        assert_eq!(parse_expression("2.5e1").unwrap(), Ast::Real(25.0));
        assert_eq!(parse_expression("true").unwrap(), Ast::Bool(true));
        assert_eq!(
            parse_expression("true_flag").unwrap(),
            Ast::Ident("true_flag".to_string())
        );
        assert_eq!(
            parse_expression("a === b").unwrap(),
            Ast::Binary(
                BinOp::Eq,
                Box::new(Ast::Ident("a".to_string())),
                Box::new(Ast::Ident("b".to_string()))
            )
        );
    }

    #[test]
    fn free_roots_in_order() {
        let ast = parse_expression("b[a] + c.x * b.length").unwrap();
        assert_eq!(ast.free_roots(), vec!["b", "a", "c"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expression("1 +").is_err());
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("").is_err());
        assert!(parse_expression("99999999999999999999").is_err());
    }
}
