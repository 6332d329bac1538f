// Parser for NMODL statement blocks.
//
// Parses a token stream (from the lexer) into a `StatementBlock`. Uses
// chumsky combinators with recursive expression and statement grammars.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub block: Option<StatementBlock>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse the body of a model block. Lexes then parses.
///
/// Returns an AST (if parsing succeeded) plus any errors.
pub fn parse_block(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = block_parser(source);
    let (block, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        block,
        errors: all_errors,
    }
}

/// Parse a single expression (TABLE bounds, `changed_dt`).
pub fn parse_expr(source: &str) -> Result<Expr, Vec<Rich<'static, Token, SimpleSpan>>> {
    let result = parse_block(source);
    if !result.errors.is_empty() {
        return Err(result.errors);
    }
    let span: SimpleSpan = (0..source.len()).into();
    match result.block.map(|b| b.statements) {
        Some(mut stmts) if stmts.len() == 1 => match stmts.remove(0) {
            Stmt::Expr(e) => Ok(e),
            _ => Err(vec![Rich::custom(span, "expected an expression")]),
        },
        _ => Err(vec![Rich::custom(span, "expected a single expression")]),
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `block_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn block_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, StatementBlock, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Expressions ──

    let expr = recursive(|expr| {
        let literal = select! {
            Token::Integer(n) = e => Expr::Integer(n, e.span()),
            Token::StringLit(s) = e => Expr::Str(s, e.span()),
        }
        .or(just(Token::Real).map_with(move |_, e| {
            let span: SimpleSpan = e.span();
            Expr::Real(source[span.start()..span.end()].to_string(), span)
        }));

        let call = ident
            .clone()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map_with(|(name, args), e| Expr::Call(Call {
                name,
                args,
                span: e.span(),
            }));

        let indexed = ident
            .clone()
            .then(
                expr.clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket)),
            )
            .map(|(name, idx)| Expr::Indexed(name, Box::new(idx)));

        let paren = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|inner, e| Expr::Paren(Box::new(inner), e.span()));

        let atom = literal
            .or(call)
            .or(indexed)
            .or(ident.clone().map(Expr::Name))
            .or(paren)
            .boxed();

        // Unary binds looser than `^`, so `-x^2` is `-(x^2)`; the exponent
        // may itself carry a sign (`x^-1`). `^` is right-associative.
        let unary = recursive(|unary| {
            let pow = atom
                .clone()
                .then(just(Token::Caret).ignore_then(unary).or_not())
                .map(|(base, exp)| match exp {
                    Some(exp) => Expr::binary(base, BinaryOp::Pow, exp),
                    None => base,
                });
            let prefix = just(Token::Minus)
                .to(UnaryOp::Neg)
                .or(just(Token::Bang).to(UnaryOp::Not))
                .map_with(|op, e| {
                    let span: SimpleSpan = e.span();
                    (op, span)
                });
            prefix
                .repeated()
                .foldr(pow, |(op, op_span), rhs: Expr| {
                    let span: SimpleSpan = (op_span.start..rhs.span().end).into();
                    Expr::Unary(op, Box::new(rhs), span)
                })
                .boxed()
        });

        let product = unary.clone().foldl(
            just(Token::Star)
                .to(BinaryOp::Mul)
                .or(just(Token::Slash).to(BinaryOp::Div))
                .then(unary)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(lhs, op, rhs),
        );

        let sum = product.clone().foldl(
            just(Token::Plus)
                .to(BinaryOp::Add)
                .or(just(Token::Minus).to(BinaryOp::Sub))
                .then(product)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(lhs, op, rhs),
        );

        let compare_op = select! {
            Token::Lt => BinaryOp::Lt,
            Token::Gt => BinaryOp::Gt,
            Token::Le => BinaryOp::Le,
            Token::Ge => BinaryOp::Ge,
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
        };
        let comparison = sum
            .clone()
            .foldl(compare_op.then(sum).repeated(), |lhs, (op, rhs)| {
                Expr::binary(lhs, op, rhs)
            });

        let conjunction = comparison.clone().foldl(
            just(Token::AndAnd)
                .to(BinaryOp::And)
                .then(comparison)
                .repeated(),
            |lhs, (op, rhs)| Expr::binary(lhs, op, rhs),
        );

        conjunction
            .clone()
            .foldl(
                just(Token::OrOr).to(BinaryOp::Or).then(conjunction).repeated(),
                |lhs, (op, rhs)| Expr::binary(lhs, op, rhs),
            )
            .boxed()
    });

    let paren_expr = expr
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    // ── Statements ──

    let stmt = recursive(|stmt| {
        let block = stmt
            .repeated()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|statements, e| StatementBlock {
                statements,
                span: e.span(),
            })
            .boxed();

        let local_var = ident
            .clone()
            .then(
                select! { Token::Integer(n) => n }
                    .delimited_by(just(Token::LBracket), just(Token::RBracket))
                    .or_not(),
            )
            .map(|(name, length)| LocalVar { name, length });

        let local = just(Token::Local)
            .ignore_then(
                local_var
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map_with(|vars, e| Stmt::Local(vars, e.span()));

        let else_if = just(Token::Else)
            .ignore_then(just(Token::If))
            .ignore_then(paren_expr.clone())
            .then(block.clone());

        let if_stmt = just(Token::If)
            .ignore_then(paren_expr.clone())
            .then(block.clone())
            .then(else_if.repeated().collect::<Vec<_>>())
            .then(just(Token::Else).ignore_then(block.clone()).or_not())
            .map_with(|(((cond, then_block), else_ifs), else_block), e| {
                Stmt::If(IfStmt {
                    cond,
                    then_block,
                    else_ifs,
                    else_block,
                    span: e.span(),
                })
            });

        let while_stmt = just(Token::While)
            .ignore_then(paren_expr.clone())
            .then(block.clone())
            .map_with(|(cond, body), e| Stmt::While {
                cond,
                body,
                span: e.span(),
            });

        let from_stmt = just(Token::From)
            .ignore_then(ident.clone())
            .then_ignore(just(Token::Equals))
            .then(expr.clone())
            .then_ignore(just(Token::To))
            .then(expr.clone())
            .then(just(Token::By).ignore_then(expr.clone()).or_not())
            .then(block.clone())
            .map_with(|((((var, from), to), by), body), e| Stmt::From {
                var,
                from,
                to,
                by,
                body,
                span: e.span(),
            });

        let watch_clause = paren_expr
            .clone()
            .then(expr.clone())
            .map(|(cond, flag)| WatchClause { cond, flag });

        let watch = just(Token::Watch)
            .ignore_then(
                watch_clause
                    .separated_by(just(Token::Comma))
                    .at_least(1)
                    .collect::<Vec<_>>(),
            )
            .map_with(|clauses, e| {
                Stmt::Watch(WatchStmt {
                    clauses,
                    span: e.span(),
                    slot: None,
                })
            });

        let for_netcon = just(Token::ForNetcon)
            .ignore_then(
                ident
                    .clone()
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then(block.clone())
            .map_with(|(params, body), e| Stmt::ForNetcon {
                params,
                body,
                span: e.span(),
            });

        let verbatim = select! {
            Token::Verbatim(text) = e => Stmt::Verbatim(text, e.span()),
        };

        let derivimplicit = just(Token::DerivImplicit)
            .ignore_then(ident.clone())
            .map(Stmt::DerivImplicit);

        let initial = just(Token::Initial)
            .ignore_then(block)
            .map(Stmt::Initial);

        let target = ident
            .clone()
            .then(
                expr.clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket))
                    .or_not(),
            )
            .map(|(name, idx)| match idx {
                Some(idx) => Expr::Indexed(name, Box::new(idx)),
                None => Expr::Name(name),
            });

        let assign = target
            .then_ignore(just(Token::Equals))
            .then(expr.clone())
            .map_with(|(target, value), e| Stmt::Assign {
                target,
                value,
                span: e.span(),
            });

        let expr_stmt = expr.clone().map(Stmt::Expr);

        choice((
            local,
            if_stmt,
            while_stmt,
            from_stmt,
            watch,
            for_netcon,
            verbatim,
            derivimplicit,
            initial,
            assign,
            expr_stmt,
        ))
        .boxed()
    });

    stmt.repeated()
        .collect::<Vec<_>>()
        .map_with(|statements, e| StatementBlock {
            statements,
            span: e.span(),
        })
        .then_ignore(end())
}

// ── Tests ──
