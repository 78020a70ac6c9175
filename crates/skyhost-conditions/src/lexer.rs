//! Tokenizer for condition expressions

use crate::error::{ConditionError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Minus,
}

/// A token and its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        let single = |token| Spanned { token, pos };

        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push(single(Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push(single(Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push(single(Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push(single(Token::RBracket));
                i += 1;
            }
            ',' => {
                tokens.push(single(Token::Comma));
                i += 1;
            }
            '.' if !peek.map_or(false, |p| p.is_ascii_digit()) => {
                tokens.push(single(Token::Dot));
                i += 1;
            }
            '-' => {
                tokens.push(single(Token::Minus));
                i += 1;
            }
            '=' if peek == Some('=') => {
                tokens.push(single(Token::Eq));
                i += 2;
            }
            '!' if peek == Some('=') => {
                tokens.push(single(Token::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(single(Token::Not));
                i += 1;
            }
            '<' if peek == Some('=') => {
                tokens.push(single(Token::Le));
                i += 2;
            }
            '<' => {
                tokens.push(single(Token::Lt));
                i += 1;
            }
            '>' if peek == Some('=') => {
                tokens.push(single(Token::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(single(Token::Gt));
                i += 1;
            }
            '&' if peek == Some('&') => {
                tokens.push(single(Token::And));
                i += 2;
            }
            '|' if peek == Some('|') => {
                tokens.push(single(Token::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    let (_, ch) = chars[i];
                    if ch == '\\' {
                        match chars.get(i + 1).map(|(_, c)| *c) {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        }
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(ConditionError::syntax(pos, "unterminated string"));
                }
                tokens.push(single(Token::Str(value)));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::syntax(pos, format!("invalid number '{}'", text)))?;
                tokens.push(single(Token::Number(number)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                tokens.push(single(token));
            }
            other => {
                return Err(ConditionError::syntax(
                    pos,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            kinds(r#"vars.item == "x""#),
            vec![
                Token::Ident("vars".into()),
                Token::Dot,
                Token::Ident("item".into()),
                Token::Eq,
                Token::Str("x".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            kinds("!a && b || c != 1.5 <= >= < > in"),
            vec![
                Token::Not,
                Token::Ident("a".into()),
                Token::And,
                Token::Ident("b".into()),
                Token::Or,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Number(1.5),
                Token::Le,
                Token::Ge,
                Token::Lt,
                Token::Gt,
                Token::In,
            ]
        );
    }

    #[test]
    fn test_tokenize_single_quotes_and_escapes() {
        assert_eq!(kinds(r#"'it\'s'"#), vec![Token::Str("it's".into())]);
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize(r#"a == "open"#),
            Err(ConditionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_single_ampersand_rejected() {
        assert!(tokenize("a & b").is_err());
    }
}
