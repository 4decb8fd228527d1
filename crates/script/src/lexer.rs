//! Lexer for the restricted expression language.
//!
//! Tokens that have no place in the grammar at all (assignment, bitwise
//! operators, template literals, braces) are rejected here, before the
//! parser ever sees them.

use cf_domain::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,

    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$' || c == '@'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    let reject = |what: &str| Err(Error::ExpressionRejected(format!("{what} in '{source}'")));

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    return reject("exponentiation operator '**' not supported");
                }
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::EqEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::EqEq);
                        i += 2;
                    }
                } else {
                    return reject("assignment is not allowed");
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        tokens.push(Token::NotEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::NotEq);
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'<') {
                    return reject("bitwise shift is not allowed");
                }
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'>') {
                    return reject("bitwise shift is not allowed");
                }
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return reject("bitwise '&' is not allowed");
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return reject("bitwise '|' is not allowed");
                }
            }
            '^' | '~' => return reject("bitwise operators are not allowed"),
            '`' => return reject("template literals are not allowed"),
            '{' | '}' | ';' => return reject("statement syntax is not allowed"),
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::ExpressionRejected(format!(
                                "unterminated string in '{source}'"
                            )));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                Error::ExpressionRejected(format!(
                                    "dangling escape in '{source}'"
                                ))
                            })?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if matches!(chars.get(i), Some('e') | Some('E')) {
                    let mut j = i + 1;
                    if matches!(chars.get(j), Some('+') | Some('-')) {
                        j += 1;
                    }
                    if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    Error::ExpressionRejected(format!("bad number '{text}' in '{source}'"))
                })?;
                tokens.push(Token::Num(num));
            }
            c if is_ident_start(c) => {
                let start = i;
                i += 1;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    "new" => return reject("'new' is not allowed"),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(Error::ExpressionRejected(format!(
                    "unexpected character '{other}' in '{source}'"
                )));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_arithmetic() {
        let tokens = tokenize("1 + 2.5 * x").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Num(1.0),
                Token::Plus,
                Token::Num(2.5),
                Token::Star,
                Token::Ident("x".into()),
            ]
        );
    }

    #[test]
    fn distinguishes_equality_flavours() {
        assert_eq!(tokenize("==").unwrap(), vec![Token::EqEq]);
        assert_eq!(tokenize("===").unwrap(), vec![Token::EqEqEq]);
        assert_eq!(tokenize("!=").unwrap(), vec![Token::NotEq]);
        assert_eq!(tokenize("!==").unwrap(), vec![Token::NotEqEq]);
    }

    #[test]
    fn string_quotes_and_escapes() {
        let tokens = tokenize(r#" 'it\'s' + "a\nb" "#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Str("it's".into()),
                Token::Plus,
                Token::Str("a\nb".into()),
            ]
        );
    }

    #[test]
    fn rejects_assignment_and_bitwise() {
        assert!(tokenize("x = 1").is_err());
        assert!(tokenize("a & b").is_err());
        assert!(tokenize("a | b").is_err());
        assert!(tokenize("a ^ b").is_err());
        assert!(tokenize("a << 2").is_err());
        assert!(tokenize("~a").is_err());
    }

    #[test]
    fn rejects_template_literals_and_new() {
        assert!(tokenize("`hi ${x}`").is_err());
        assert!(tokenize("new Thing()").is_err());
    }

    #[test]
    fn rejection_is_expression_rejected() {
        match tokenize("x = 1") {
            Err(Error::ExpressionRejected(_)) => {}
            other => panic!("expected ExpressionRejected, got {other:?}"),
        }
    }
}
