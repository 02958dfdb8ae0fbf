// textscan.rs — Token-level scanning of boundary statement text
//
// Blocks and footprint traces arrive keyed by raw statement text (§6 inputs
// may be produced by an external front end, not by our own renderer). The
// scheduler and the parallelization planner need small structural facts about
// those strings: the assignment target, whether a line is a call site, what a
// `for` header iterates over. This module answers those questions with a
// lexer rather than string surgery so that spacing and nesting differences do
// not change the answer.
//
// Failure modes: none — unscannable text yields `None`, never an error.

use logos::Logos;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
enum Tok {
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("==")]
    EqEq,
    #[token("=")]
    Eq,
    #[regex(r"[+\-*/%]=")]
    AugEq,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,
    #[regex(r#"'([^'\\]|\\.)*'|"([^"\\]|\\.)*""#, |lex| lex.slice().to_owned())]
    Str(String),
    #[regex(r"\*\*|//|<=|>=|!=|[+\-*/%<>!]")]
    Op,
}

fn scan(line: &str) -> Option<Vec<Tok>> {
    let mut toks = Vec::new();
    for tok in Tok::lexer(line) {
        toks.push(tok.ok()?);
    }
    Some(toks)
}

/// The assigned variable of `x = …` or `x += …`, if the line is an
/// assignment at all.
pub fn lhs_of(line: &str) -> Option<String> {
    let toks = scan(line)?;
    match toks.as_slice() {
        [Tok::Ident(name), Tok::Eq, ..] | [Tok::Ident(name), Tok::AugEq, ..] => {
            Some(name.clone())
        }
        _ => None,
    }
}

/// A user-function call site parsed out of statement text.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub target: String,
    pub callee: String,
    /// Plain identifier arguments, in call order.
    pub args: Vec<String>,
}

/// Parse `<target> = <callee>(<ident>, …)`. Anything else — expressions in
/// argument position included — is not a chunkable call and yields `None`.
pub fn parse_call(line: &str) -> Option<CallSite> {
    let toks = scan(line)?;
    let mut it = toks.iter();
    let target = match it.next()? {
        Tok::Ident(name) => name.clone(),
        _ => return None,
    };
    if it.next() != Some(&Tok::Eq) {
        return None;
    }
    let callee = match it.next()? {
        Tok::Ident(name) => name.clone(),
        _ => return None,
    };
    if it.next() != Some(&Tok::LParen) {
        return None;
    }
    let mut args = Vec::new();
    loop {
        match it.next()? {
            Tok::RParen => break,
            Tok::Ident(name) if args.is_empty() => args.push(name.clone()),
            Tok::Comma => match it.next()? {
                Tok::Ident(name) => args.push(name.clone()),
                _ => return None,
            },
            _ => return None,
        }
    }
    if it.next().is_some() {
        return None;
    }
    Some(CallSite {
        target,
        callee,
        args,
    })
}

/// A `for` loop header found in reconstructed source text.
#[derive(Debug, Clone, PartialEq)]
pub struct ForHeader {
    pub var: String,
    /// Base identifier of the iterable (`data` in `for row in data[1:]:`).
    /// `None` when the header iterates a call such as `range(…)`.
    pub iterable: Option<String>,
}

/// Parse `for <var> in <iterable>…:`.
pub fn parse_for(line: &str) -> Option<ForHeader> {
    let toks = scan(line)?;
    let mut it = toks.iter();
    if it.next() != Some(&Tok::For) {
        return None;
    }
    let var = match it.next()? {
        Tok::Ident(name) => name.clone(),
        _ => return None,
    };
    if it.next() != Some(&Tok::In) {
        return None;
    }
    let iterable = match (it.next()?, it.next()) {
        // `range(…)`, `enumerate(…)` — iterates values, not a variable.
        (Tok::Ident(_), Some(Tok::LParen)) => None,
        (Tok::Ident(name), _) => Some(name.clone()),
        _ => return None,
    };
    Some(ForHeader { var, iterable })
}

/// Extract the `"op:variable"` spec from an aggregation marker line
/// (`aggregation = "s:sum_values"`), with either quote style.
pub fn aggregation_spec(line: &str) -> Option<String> {
    let toks = scan(line)?;
    match toks.as_slice() {
        [Tok::Ident(name), Tok::Eq, Tok::Str(s)] if name == "aggregation" => {
            Some(s[1..s.len() - 1].to_owned())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lhs_of_assignments() {
        assert_eq!(lhs_of("x = a + 1"), Some("x".to_string()));
        assert_eq!(lhs_of("total += a[i][j]"), Some("total".to_string()));
        assert_eq!(lhs_of("return x"), None);
        assert_eq!(lhs_of("if x == 1:"), None);
        assert_eq!(lhs_of("xs.append(5)"), None);
    }

    #[test]
    fn call_sites() {
        assert_eq!(
            parse_call("result = calculate_sum(data)"),
            Some(CallSite {
                target: "result".into(),
                callee: "calculate_sum".into(),
                args: vec!["data".into()],
            })
        );
        assert_eq!(
            parse_call("m = combine(a, b)").map(|c| c.args),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        // Expression arguments are not chunkable.
        assert_eq!(parse_call("y = f(data[1:])"), None);
        assert_eq!(parse_call("y = f(1)"), None);
        assert_eq!(parse_call("xs = [1, 2]"), None);
    }

    #[test]
    fn for_headers() {
        assert_eq!(
            parse_for("for row in data[1:]:"),
            Some(ForHeader {
                var: "row".into(),
                iterable: Some("data".into()),
            })
        );
        assert_eq!(
            parse_for("for i in range(10):"),
            Some(ForHeader {
                var: "i".into(),
                iterable: None,
            })
        );
        assert_eq!(parse_for("total = 0"), None);
    }

    #[test]
    fn aggregation_markers() {
        assert_eq!(
            aggregation_spec("aggregation = \"s:sum_values\""),
            Some("s:sum_values".to_string())
        );
        assert_eq!(
            aggregation_spec("aggregation = 's:total'"),
            Some("s:total".to_string())
        );
        assert_eq!(aggregation_spec("other = \"s:x\""), None);
        assert_eq!(aggregation_spec("aggregation = 5"), None);
    }

    #[test]
    fn unscannable_text_is_none() {
        assert_eq!(lhs_of("x = 'unterminated"), None);
        assert_eq!(parse_call("y = f(`odd`)"), None);
    }
}
