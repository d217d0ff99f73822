use crate::errors::SensorGraphError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    LParen,
    RParen,
    /// Property name, keyword or boolean/null literal.
    Word(String),
    Str(String),
    Int(i64),
    Float(f64),
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, SensorGraphError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch.is_whitespace() {
            pos += 1;
        } else if ch == '(' {
            tokens.push(Token::LParen);
            pos += 1;
        } else if ch == ')' {
            tokens.push(Token::RParen);
            pos += 1;
        } else if ch == '\'' {
            let (text, next) = read_string(&chars, pos)?;
            tokens.push(Token::Str(text));
            pos = next;
        } else if ch.is_ascii_digit()
            || (ch == '-' && chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit()))
        {
            let (token, next) = read_number(&chars, pos)?;
            tokens.push(token);
            pos = next;
        } else if is_word_char(ch) {
            let start = pos;
            while pos < chars.len() && is_word_char(chars[pos]) {
                pos += 1;
            }
            tokens.push(Token::Word(chars[start..pos].iter().collect()));
        } else {
            return Err(SensorGraphError::syntax(format!(
                "unexpected character '{ch}' at offset {pos}"
            )));
        }
    }
    Ok(tokens)
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '@' | '.' | '/' | '$')
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), SensorGraphError> {
    let mut text = String::new();
    let mut pos = start + 1;
    while pos < chars.len() {
        if chars[pos] == '\'' {
            if chars.get(pos + 1) == Some(&'\'') {
                text.push('\'');
                pos += 2;
                continue;
            }
            return Ok((text, pos + 1));
        }
        text.push(chars[pos]);
        pos += 1;
    }
    Err(SensorGraphError::syntax(format!(
        "unterminated string literal at offset {start}"
    )))
}

fn read_number(chars: &[char], start: usize) -> Result<(Token, usize), SensorGraphError> {
    let mut pos = start;
    if chars[pos] == '-' {
        pos += 1;
    }
    let mut is_float = false;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch.is_ascii_digit() {
            pos += 1;
        } else if ch == '.' && !is_float {
            is_float = true;
            pos += 1;
        } else if (ch == 'e' || ch == 'E') && pos > start {
            is_float = true;
            pos += 1;
            if matches!(chars.get(pos), Some('+') | Some('-')) {
                pos += 1;
            }
        } else {
            break;
        }
    }
    if pos < chars.len() && is_word_char(chars[pos]) {
        return Err(SensorGraphError::syntax(format!(
            "malformed number at offset {start}"
        )));
    }
    let text: String = chars[start..pos].iter().collect();
    let token = if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| SensorGraphError::syntax(format!("malformed number '{text}'")))?
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| SensorGraphError::syntax(format!("integer out of range '{text}'")))?
    };
    Ok((token, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_without_spaces() {
        let tokens = tokenize("name eq'Datastream1'").expect("tokens");
        assert_eq!(
            tokens,
            vec![
                Token::Word("name".into()),
                Token::Word("eq".into()),
                Token::Str("Datastream1".into()),
            ]
        );
    }

    #[test]
    fn numbers_and_escaped_quotes() {
        let tokens = tokenize("result ge -1.5e2 or name eq 'O''Brien' or x lt 7").expect("tokens");
        assert!(tokens.contains(&Token::Float(-150.0)));
        assert!(tokens.contains(&Token::Str("O'Brien".into())));
        assert!(tokens.contains(&Token::Int(7)));
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(matches!(
            tokenize("name eq 'abc"),
            Err(SensorGraphError::QuerySyntaxError(_))
        ));
    }

    #[test]
    fn rejects_stray_symbols() {
        assert!(tokenize("name == 'a'").is_err());
        assert!(tokenize("result eq 12abc").is_err());
    }
}
