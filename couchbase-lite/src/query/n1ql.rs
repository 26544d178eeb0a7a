//! Recursive descent parser of N1QL `SELECT` subset

use super::{
    exec::{ResultColumn, Select, SourceRef},
    expr::{AggFunc, BinaryOp, Expr, Func, MetaProp, PathElem, QValue, UnaryOp},
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    /// backtick quoted identifier, never a keyword
    Quoted(String),
    Str(String),
    Int(i64),
    Float(f64),
    Param(String),
    Sym(&'static str),
    Eof,
}

const SYMBOLS: &[&str] = &[
    "||", "==", "!=", "<>", "<=", ">=", "(", ")", "[", "]", "{", "}", ",", ".", "*", "+", "-",
    "/", "%", "=", "<", ">", ":", ";",
];

const KEYWORDS: &[&str] = &[
    "SELECT", "DISTINCT", "ALL", "FROM", "WHERE", "ORDER", "BY", "LIMIT", "OFFSET", "AS", "AND",
    "OR", "NOT", "IS", "NULL", "MISSING", "VALUED", "LIKE", "IN", "BETWEEN", "ASC", "DESC", "TRUE",
    "FALSE", "GROUP", "HAVING", "JOIN",
];

static EOF: Tok = Tok::Eof;

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek_char(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn err(&self, pos: usize, msg: impl Into<String>) -> Error {
        Error::InvalidQuery {
            pos: i32::try_from(pos).unwrap_or(i32::MAX),
            query_expr: self.source.into(),
            err: msg.into(),
        }
    }

    /// Tokens with character position of their start
    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>> {
        let mut ret = Vec::new();
        loop {
            while self.peek_char(0).map_or(false, char::is_whitespace) {
                self.pos += 1;
            }
            let start = self.pos;
            let Some(c) = self.peek_char(0) else {
                ret.push((Tok::Eof, start));
                return Ok(ret);
            };
            let tok = if c.is_ascii_digit()
                || (c == '.' && self.peek_char(1).map_or(false, |c| c.is_ascii_digit()))
            {
                self.number()?
            } else if c.is_alphabetic() || c == '_' {
                Tok::Ident(self.take_while(|c| c.is_alphanumeric() || c == '_'))
            } else if c == '$' {
                self.pos += 1;
                let name = self.take_while(|c| c.is_alphanumeric() || c == '_');
                if name.is_empty() {
                    return Err(self.err(start, "parameter name expected after '$'"));
                }
                Tok::Param(name)
            } else if c == '`' {
                Tok::Quoted(self.quoted('`')?)
            } else if c == '"' || c == '\'' {
                Tok::Str(self.quoted(c)?)
            } else {
                let rest: String = self.chars[self.pos..].iter().take(2).map(|(_, c)| *c).collect();
                match SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
                    Some(sym) => {
                        self.pos += sym.chars().count();
                        Tok::Sym(*sym)
                    }
                    None => return Err(self.err(start, format!("unexpected character '{}'", c))),
                }
            };
            ret.push((tok, start));
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek_char(0).filter(|c| pred(*c)) {
            s.push(c);
            self.pos += 1;
        }
        s
    }

    fn number(&mut self) -> Result<Tok> {
        let start = self.pos;
        let mut s = self.take_while(|c| c.is_ascii_digit() || c == '.');
        if matches!(self.peek_char(0), Some('e' | 'E')) {
            s.push('e');
            self.pos += 1;
            if let Some(sign @ ('+' | '-')) = self.peek_char(0) {
                s.push(sign);
                self.pos += 1;
            }
            s.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if !s.contains(['.', 'e']) {
            if let Ok(x) = s.parse() {
                return Ok(Tok::Int(x));
            }
        }
        s.parse()
            .map(Tok::Float)
            .map_err(|_| self.err(start, format!("invalid number '{}'", s)))
    }

    /// String or identifier in quotes, doubled quote char is escaped quote
    fn quoted(&mut self, quote: char) -> Result<String> {
        let start = self.pos;
        self.pos += 1;
        let mut s = String::new();
        loop {
            match self.peek_char(0) {
                None => return Err(self.err(start, "unterminated string")),
                Some(c) if c == quote => {
                    if self.peek_char(1) == Some(quote) {
                        s.push(quote);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(s);
                    }
                }
                Some('\\') if quote != '`' => {
                    let escaped = match self.peek_char(1) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(c) => c,
                        None => return Err(self.err(start, "unterminated string")),
                    };
                    s.push(escaped);
                    self.pos += 2;
                }
                Some(c) => {
                    s.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

struct Parser<'a> {
    source: &'a str,
    toks: Vec<(Tok, usize)>,
    idx: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Tok {
        self.toks.get(self.idx).map_or(&EOF, |(t, _)| t)
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        self.toks.get(self.idx + ahead).map_or(&EOF, |(t, _)| t)
    }

    fn pos(&self) -> usize {
        self.toks
            .get(self.idx)
            .or_else(|| self.toks.last())
            .map_or(0, |(_, p)| *p)
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.idx < self.toks.len() {
            self.idx += 1;
        }
        tok
    }

    fn err<T>(&self, msg: impl Into<String>) -> Result<T> {
        Err(Error::InvalidQuery {
            pos: i32::try_from(self.pos()).unwrap_or(i32::MAX),
            query_expr: self.source.into(),
            err: msg.into(),
        })
    }

    fn is_kw(&self, kw: &str) -> bool {
        is_keyword(self.peek(), kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.err(format!("expected {}", kw))
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            self.err(format!("expected '{}'", sym))
        }
    }

    /// Identifier that is not reserved word
    fn identifier(&mut self) -> Result<String> {
        match self.peek().clone() {
            Tok::Quoted(s) => {
                self.idx += 1;
                Ok(s)
            }
            Tok::Ident(s) if !is_reserved(&s) => {
                self.idx += 1;
                Ok(s)
            }
            _ => self.err("identifier expected"),
        }
    }

    fn at_identifier(&self) -> bool {
        match self.peek() {
            Tok::Quoted(_) => true,
            Tok::Ident(s) => !is_reserved(s),
            _ => false,
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.eat_sym(";");
        if *self.peek() != Tok::Eof {
            return self.err("unexpected token after end of query");
        }
        Ok(())
    }

    fn select(&mut self) -> Result<Select> {
        self.expect_kw("SELECT")?;
        let mut ret = Select::default();
        if self.eat_kw("DISTINCT") {
            ret.distinct = true;
        } else {
            self.eat_kw("ALL");
        }
        loop {
            ret.columns.push(self.result_column()?);
            if !self.eat_sym(",") {
                break;
            }
        }
        if self.eat_kw("FROM") {
            let mut src = SourceRef::default();
            let first = self.identifier()?;
            if self.eat_sym(".") {
                src.scope = Some(first);
                src.name = Some(self.identifier()?);
            } else {
                src.name = Some(first);
            }
            if self.eat_kw("AS") || self.at_identifier() {
                src.alias = Some(self.identifier()?);
            }
            ret.from = Some(src);
        }
        if self.is_kw("JOIN") || self.is_kw("GROUP") || self.is_kw("HAVING") {
            return self.err("JOIN, GROUP BY and HAVING are not supported");
        }
        if self.eat_kw("WHERE") {
            ret.where_ = Some(self.expr()?);
        }
        if self.eat_kw("ORDER") {
            self.expect_kw("BY")?;
            loop {
                let e = self.expr()?;
                let desc = if self.eat_kw("DESC") {
                    true
                } else {
                    self.eat_kw("ASC");
                    false
                };
                ret.order_by.push((e, desc));
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        if self.eat_kw("LIMIT") {
            ret.limit = Some(self.expr()?);
        }
        if self.eat_kw("OFFSET") {
            ret.offset = Some(self.expr()?);
        }
        self.finish()?;
        Ok(ret)
    }

    fn result_column(&mut self) -> Result<ResultColumn> {
        if self.eat_sym("*") {
            return Ok(ResultColumn {
                expr: Expr::Property(Vec::new()),
                name: None,
            });
        }
        let expr = self.expr()?;
        let name = if self.eat_kw("AS") || self.at_identifier() {
            Some(self.identifier()?)
        } else {
            None
        };
        Ok(ResultColumn { expr, name })
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat_kw("OR") {
            lhs = Expr::binary(BinaryOp::Or, lhs, self.and_expr()?);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.eat_kw("AND") {
            lhs = Expr::binary(BinaryOp::And, lhs, self.not_expr()?);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_kw("NOT") {
            return Ok(Expr::unary(UnaryOp::Not, self.not_expr()?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Tok::Sym("=" | "==") => Some(BinaryOp::Eq),
            Tok::Sym("!=" | "<>") => Some(BinaryOp::Ne),
            Tok::Sym("<") => Some(BinaryOp::Lt),
            Tok::Sym("<=") => Some(BinaryOp::Le),
            Tok::Sym(">") => Some(BinaryOp::Gt),
            Tok::Sym(">=") => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.idx += 1;
            return Ok(Expr::binary(op, lhs, self.additive()?));
        }
        if self.eat_kw("IS") {
            let negated = self.eat_kw("NOT");
            let op = if self.eat_kw("NULL") {
                Some((UnaryOp::IsNull, UnaryOp::IsNotNull))
            } else if self.eat_kw("MISSING") {
                Some((UnaryOp::IsMissing, UnaryOp::IsNotMissing))
            } else if self.eat_kw("VALUED") {
                Some((UnaryOp::IsValued, UnaryOp::IsNotValued))
            } else {
                None
            };
            return Ok(match op {
                Some((pos, neg)) => Expr::unary(if negated { neg } else { pos }, lhs),
                None => {
                    let op = if negated { BinaryOp::IsNot } else { BinaryOp::Is };
                    Expr::binary(op, lhs, self.additive()?)
                }
            });
        }
        let negated = if self.is_kw("NOT")
            && ["LIKE", "IN", "BETWEEN"]
                .iter()
                .any(|kw| is_keyword(self.peek_at(1), kw))
        {
            self.idx += 1;
            true
        } else {
            false
        };
        if self.eat_kw("LIKE") {
            let op = if negated {
                BinaryOp::NotLike
            } else {
                BinaryOp::Like
            };
            return Ok(Expr::binary(op, lhs, self.additive()?));
        }
        if self.eat_kw("IN") {
            return Ok(Expr::In(Box::new(lhs), Box::new(self.additive()?), negated));
        }
        if self.eat_kw("BETWEEN") {
            let lo = self.additive()?;
            self.expect_kw("AND")?;
            let hi = self.additive()?;
            return Ok(Expr::Between(
                Box::new(lhs),
                Box::new(lo),
                Box::new(hi),
                negated,
            ));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("+") => BinaryOp::Add,
                Tok::Sym("-") => BinaryOp::Sub,
                Tok::Sym("||") => BinaryOp::Concat,
                _ => return Ok(lhs),
            };
            self.idx += 1;
            lhs = Expr::binary(op, lhs, self.multiplicative()?);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("*") => BinaryOp::Mul,
                Tok::Sym("/") => BinaryOp::Div,
                Tok::Sym("%") => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.idx += 1;
            lhs = Expr::binary(op, lhs, self.unary()?);
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_sym("-") {
            return Ok(match self.unary()? {
                Expr::Literal(QValue::Int(x)) => Expr::Literal(QValue::Int(-x)),
                Expr::Literal(QValue::Float(x)) => Expr::Literal(QValue::Float(-x)),
                e => Expr::unary(UnaryOp::Neg, e),
            });
        }
        if self.eat_sym("+") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut e = self.primary()?;
        loop {
            if self.eat_sym(".") {
                let key = self.identifier()?;
                match &mut e {
                    Expr::Property(path) => path.push(PathElem::Key(key)),
                    _ => return self.err("property access on non-property expression"),
                }
            } else if matches!(self.peek(), Tok::Sym("[")) && matches!(e, Expr::Property(_)) {
                self.idx += 1;
                let index = match self.next() {
                    Tok::Int(i) => i,
                    Tok::Sym("-") => match self.next() {
                        Tok::Int(i) => -i,
                        _ => return self.err("array index expected"),
                    },
                    _ => return self.err("array index expected"),
                };
                self.expect_sym("]")?;
                if let Expr::Property(path) = &mut e {
                    path.push(PathElem::Index(index));
                }
            } else {
                return Ok(e);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let tok = self.peek().clone();
        match tok {
            Tok::Int(x) => {
                self.idx += 1;
                Ok(Expr::Literal(QValue::Int(x)))
            }
            Tok::Float(x) => {
                self.idx += 1;
                Ok(Expr::Literal(QValue::Float(x)))
            }
            Tok::Str(s) => {
                self.idx += 1;
                Ok(Expr::Literal(QValue::String(s)))
            }
            Tok::Param(name) => {
                self.idx += 1;
                Ok(Expr::Param(name))
            }
            Tok::Sym("(") => {
                self.idx += 1;
                let e = self.expr()?;
                self.expect_sym(")")?;
                Ok(e)
            }
            Tok::Sym("[") => {
                self.idx += 1;
                let items = self.list("]")?;
                Ok(Expr::Array(items))
            }
            Tok::Sym("{") => {
                self.idx += 1;
                let mut items = Vec::new();
                if !self.eat_sym("}") {
                    loop {
                        let key = match self.next() {
                            Tok::Str(s) | Tok::Ident(s) | Tok::Quoted(s) => s,
                            _ => return self.err("dictionary key expected"),
                        };
                        self.expect_sym(":")?;
                        items.push((key, self.expr()?));
                        if !self.eat_sym(",") {
                            break;
                        }
                    }
                    self.expect_sym("}")?;
                }
                Ok(Expr::Dict(items))
            }
            Tok::Ident(ref word)
                if word.eq_ignore_ascii_case("TRUE") || word.eq_ignore_ascii_case("FALSE") =>
            {
                self.idx += 1;
                Ok(Expr::Literal(QValue::Bool(word.eq_ignore_ascii_case("TRUE"))))
            }
            Tok::Ident(ref word) if word.eq_ignore_ascii_case("NULL") => {
                self.idx += 1;
                Ok(Expr::Literal(QValue::Null))
            }
            Tok::Ident(ref word) if word.eq_ignore_ascii_case("MISSING") => {
                self.idx += 1;
                Ok(Expr::Literal(QValue::Missing))
            }
            Tok::Ident(ref name) if matches!(self.peek_at(1), Tok::Sym("(")) => {
                self.idx += 2;
                self.function(name)
            }
            Tok::Ident(_) | Tok::Quoted(_) => {
                let name = self.identifier()?;
                Ok(Expr::Property(vec![PathElem::Key(name)]))
            }
            _ => self.err("expression expected"),
        }
    }

    fn list(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat_sym(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym(close)?;
        Ok(items)
    }

    /// Called after `name(`
    fn function(&mut self, name: &str) -> Result<Expr> {
        if name.eq_ignore_ascii_case("META") {
            if self.at_identifier() {
                self.identifier()?;
            }
            self.expect_sym(")")?;
            self.expect_sym(".")?;
            let prop = self.identifier()?;
            return match MetaProp::from_name(&prop) {
                Some(meta) => Ok(Expr::Meta(meta)),
                None => self.err(format!("unknown META() property '{}'", prop)),
            };
        }
        if let Some(agg) = AggFunc::from_name(name) {
            if agg == AggFunc::Count && self.eat_sym("*") {
                self.expect_sym(")")?;
                return Ok(Expr::Aggregate(agg, None, 0));
            }
            let distinct_unsupported = self.is_kw("DISTINCT");
            if distinct_unsupported {
                return self.err("DISTINCT inside aggregate is not supported");
            }
            let arg = self.expr()?;
            self.expect_sym(")")?;
            return Ok(Expr::Aggregate(agg, Some(Box::new(arg)), 0));
        }
        let Some((func, min, max)) = Func::from_name(name) else {
            return self.err(format!("unknown function '{}'", name));
        };
        let mut args = Vec::new();
        if matches!(func, Func::Match | Func::Rank) {
            let index = match self.next() {
                Tok::Ident(s) | Tok::Quoted(s) | Tok::Str(s) => s,
                _ => return self.err("index name expected"),
            };
            args.push(Expr::Literal(QValue::String(index)));
            if self.eat_sym(",") {
                args.extend(self.list(")")?);
            } else {
                self.expect_sym(")")?;
            }
        } else {
            args = self.list(")")?;
        }
        if args.len() < min || args.len() > max {
            return self.err(format!(
                "wrong number of arguments to {}(): {}",
                name,
                args.len()
            ));
        }
        Ok(Expr::Func(func, args))
    }
}

fn is_keyword(tok: &Tok, kw: &str) -> bool {
    matches!(tok, Tok::Ident(s) if s.eq_ignore_ascii_case(kw))
}

fn is_reserved(word: &str) -> bool {
    KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

fn parser(source: &str) -> Result<Parser<'_>> {
    let toks = Lexer::new(source).tokenize()?;
    Ok(Parser {
        source,
        toks,
        idx: 0,
    })
}

pub(crate) fn parse_select(source: &str) -> Result<Select> {
    parser(source)?.select()
}

/// Comma separated expressions of index definition
pub(crate) fn parse_expression_list(source: &str) -> Result<Vec<Expr>> {
    let mut p = parser(source)?;
    let mut ret = Vec::new();
    loop {
        ret.push(p.expr()?);
        if !p.eat_sym(",") {
            break;
        }
    }
    p.finish()?;
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_n1ql_select() {
        let q = parse_select(
            "SELECT META().id AS id, name.first, COUNT(*) FROM inventory.users u \
             WHERE u.age BETWEEN 18 AND $max AND NOT tags[0] LIKE 'a%' \
             ORDER BY u.age DESC, name LIMIT 10 OFFSET 2",
        )
        .unwrap();
        assert_eq!(q.columns.len(), 3);
        assert!(matches!(q.columns[0].expr, Expr::Meta(MetaProp::Id)));
        assert_eq!(q.columns[0].name.as_deref(), Some("id"));
        assert_eq!(q.columns[1].expr.describe(), "name.first");
        assert!(matches!(q.columns[2].expr, Expr::Aggregate(AggFunc::Count, None, _)));
        let from = q.from.unwrap();
        assert_eq!(from.scope.as_deref(), Some("inventory"));
        assert_eq!(from.name.as_deref(), Some("users"));
        assert_eq!(from.alias.as_deref(), Some("u"));
        assert_eq!(
            q.where_.unwrap().describe(),
            r#"((u.age BETWEEN Int(18) AND $max) And Not((tags[0] Like String("a%"))))"#
        );
        assert_eq!(q.order_by.len(), 2);
        assert!(q.order_by[0].1);
        assert!(!q.order_by[1].1);
        assert!(q.limit.is_some() && q.offset.is_some());
    }

    #[test]
    fn test_parse_n1ql_expressions() {
        let q = parse_select(
            "SELECT * FROM _ WHERE `select` IS NOT MISSING AND x NOT IN [1, 2] \
             AND MATCH(ftsIdx, 'word') AND a || \"b\" = 'ab';",
        )
        .unwrap();
        assert!(matches!(&q.columns[0].expr, Expr::Property(p) if p.is_empty()));
        assert_eq!(
            q.where_.unwrap().describe(),
            "(((IsNotMissing(select) And (x IN NOT [Int(1), Int(2)])) \
             And Match(String(\"ftsIdx\"), String(\"word\"))) \
             And ((a Concat String(\"b\")) Eq String(\"ab\")))"
        );
        let exprs = parse_expression_list("lower(name), -age * 2").unwrap();
        assert_eq!(exprs.len(), 2);
        assert_eq!(exprs[1].describe(), "(Neg(age) Mul Int(2))");
    }

    #[test]
    fn test_parse_n1ql_error_position() {
        match parse_select("SELECT name FROM _ WHERE age >") {
            Err(Error::InvalidQuery { pos, .. }) => assert_eq!(pos, 30),
            _ => panic!("error expected"),
        }
        match parse_select("SELECT name FRM _") {
            Err(Error::InvalidQuery { pos, .. }) => assert_eq!(pos, 16),
            _ => panic!("error expected"),
        }
        assert!(parse_select("SELECT 'unterminated").is_err());
        assert!(parse_select("SELECT x FROM _ GROUP BY x").is_err());
    }
}
