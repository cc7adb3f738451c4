//! Static port discovery for exported workflow scripts.
//!
//! The scanner never runs a workflow. It tokenizes the script, records every
//! `var = NODE_CLASS_MAPPINGS["<Hook>"]()` binding for the known hook classes
//! and then collects each `var.execute(...)` call on such a binding together
//! with its literal keyword arguments, in source order.

use std::collections::HashMap;

const NODE_CLASS_MAPPINGS: &str = "NODE_CLASS_MAPPINGS";
const EXECUTE_METHOD: &str = "execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookClass {
    StringInput,
    IntegerInput,
    ImageInput,
    StringOutput,
    ImageOutput,
}

impl HookClass {
    pub const ALL: [HookClass; 5] = [
        HookClass::StringInput,
        HookClass::IntegerInput,
        HookClass::ImageInput,
        HookClass::StringOutput,
        HookClass::ImageOutput,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            Self::StringInput => "AppIO_StringInput",
            Self::IntegerInput => "AppIO_IntegerInput",
            Self::ImageInput => "AppIO_ImageInput",
            Self::StringOutput => "AppIO_StringOutput",
            Self::ImageOutput => "AppIO_ImageOutput",
        }
    }

    pub fn from_class_name(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.class_name() == raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KwValue {
    Literal(Literal),
    /// Anything that is not a plain literal, kept as rendered source text.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookSite {
    pub class: HookClass,
    pub node_id: String,
    pub line: usize,
    pub kwargs: Vec<(String, KwValue)>,
}

impl HookSite {
    pub fn kwarg(&self, name: &str) -> Option<&KwValue> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct ScanError {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(String),
    Punct(char),
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    line: usize,
}

pub fn scan_hook_sites(source: &str) -> Result<Vec<HookSite>, ScanError> {
    let tokens = tokenize(source)?;
    let mut hook_vars: HashMap<String, HookClass> = HashMap::new();
    let mut sites = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if let Some((var, class, next)) = match_hook_binding(&tokens, i) {
            hook_vars.insert(var, class);
            i = next;
            continue;
        }
        if let Some((node_id, class, args_start)) = match_execute_call(&tokens, i, &hook_vars) {
            let line = tokens[i].line;
            let (kwargs, next) = parse_call_arguments(&tokens, args_start, line)?;
            sites.push(HookSite {
                class,
                node_id,
                line,
                kwargs,
            });
            i = next;
            continue;
        }
        i += 1;
    }

    Ok(sites)
}

fn ident_at<'a>(tokens: &'a [Spanned], i: usize) -> Option<&'a str> {
    match tokens.get(i).map(|t| &t.token) {
        Some(Token::Ident(name)) => Some(name.as_str()),
        _ => None,
    }
}

fn punct_at(tokens: &[Spanned], i: usize, expected: char) -> bool {
    matches!(tokens.get(i).map(|t| &t.token), Some(Token::Punct(ch)) if *ch == expected)
}

fn is_assignment_at(tokens: &[Spanned], i: usize) -> bool {
    punct_at(tokens, i, '=') && !punct_at(tokens, i + 1, '=')
}

// var = NODE_CLASS_MAPPINGS["<Hook>"]()
fn match_hook_binding(tokens: &[Spanned], i: usize) -> Option<(String, HookClass, usize)> {
    let var = ident_at(tokens, i)?;
    if !is_assignment_at(tokens, i + 1) || ident_at(tokens, i + 2) != Some(NODE_CLASS_MAPPINGS) {
        return None;
    }
    if !punct_at(tokens, i + 3, '[') {
        return None;
    }
    let Some(Token::Str(class_name)) = tokens.get(i + 4).map(|t| &t.token) else {
        return None;
    };
    if !punct_at(tokens, i + 5, ']') || !punct_at(tokens, i + 6, '(') || !punct_at(tokens, i + 7, ')')
    {
        return None;
    }
    let class = HookClass::from_class_name(class_name.trim())?;
    Some((var.to_string(), class, i + 8))
}

// [target =] var.execute(
fn match_execute_call(
    tokens: &[Spanned],
    i: usize,
    hook_vars: &HashMap<String, HookClass>,
) -> Option<(String, HookClass, usize)> {
    let is_call_on = |at: usize| -> Option<HookClass> {
        let var = ident_at(tokens, at)?;
        let class = hook_vars.get(var)?;
        if punct_at(tokens, at + 1, '.')
            && ident_at(tokens, at + 2) == Some(EXECUTE_METHOD)
            && punct_at(tokens, at + 3, '(')
        {
            Some(*class)
        } else {
            None
        }
    };

    if let Some(target) = ident_at(tokens, i) {
        if is_assignment_at(tokens, i + 1) {
            if let Some(class) = is_call_on(i + 2) {
                return Some((target.to_string(), class, i + 6));
            }
        }
    }
    if i > 0 && punct_at(tokens, i - 1, '.') {
        return None;
    }
    let class = is_call_on(i)?;
    let var = ident_at(tokens, i)?;
    Some((var.to_string(), class, i + 4))
}

fn parse_call_arguments(
    tokens: &[Spanned],
    start: usize,
    line: usize,
) -> Result<(Vec<(String, KwValue)>, usize), ScanError> {
    let unclosed = || ScanError {
        line,
        reason: "unclosed `execute(` call".to_string(),
    };
    let mut kwargs = Vec::new();
    let mut i = start;

    loop {
        match tokens.get(i).map(|t| &t.token) {
            None => return Err(unclosed()),
            Some(Token::Punct(')')) => return Ok((kwargs, i + 1)),
            _ => {}
        }

        let arg_start = i;
        let mut depth = 0usize;
        while let Some(spanned) = tokens.get(i) {
            match spanned.token {
                Token::Punct('(' | '[' | '{') => depth += 1,
                Token::Punct(')' | ']' | '}') if depth == 0 => break,
                Token::Punct(')' | ']' | '}') => depth -= 1,
                Token::Punct(',') if depth == 0 => break,
                _ => {}
            }
            i += 1;
        }
        if i >= tokens.len() {
            return Err(unclosed());
        }

        let arg = &tokens[arg_start..i];
        if let Some(name) = ident_at(arg, 0) {
            if is_assignment_at(arg, 1) {
                kwargs.push((name.to_string(), classify_value(&arg[2..])));
            }
        }
        if punct_at(tokens, i, ',') {
            i += 1;
        }
    }
}

fn classify_value(tokens: &[Spanned]) -> KwValue {
    let plain: Vec<&Token> = tokens.iter().map(|t| &t.token).collect();
    let literal = match plain.as_slice() {
        [Token::Int(value)] => Some(Literal::Int(*value)),
        [Token::Punct('-'), Token::Int(value)] => value.checked_neg().map(Literal::Int),
        [Token::Punct('+'), Token::Int(value)] => Some(Literal::Int(*value)),
        [Token::Float(raw)] => Some(Literal::Float(raw.clone())),
        [Token::Punct('-'), Token::Float(raw)] => Some(Literal::Float(format!("-{raw}"))),
        [Token::Ident(word)] => match word.as_str() {
            "True" => Some(Literal::Bool(true)),
            "False" => Some(Literal::Bool(false)),
            "None" => Some(Literal::None),
            _ => None,
        },
        parts if !parts.is_empty() && parts.iter().all(|t| matches!(t, Token::Str(_))) => {
            // adjacent string literals concatenate
            let joined = parts
                .iter()
                .filter_map(|t| match t {
                    Token::Str(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<String>();
            Some(Literal::Str(joined))
        }
        _ => None,
    };

    match literal {
        Some(literal) => KwValue::Literal(literal),
        None => KwValue::Expr(render_tokens(&plain)),
    }
}

fn render_tokens(tokens: &[&Token]) -> String {
    tokens
        .iter()
        .map(|token| match token {
            Token::Ident(name) => name.clone(),
            Token::Str(value) => format!("{value:?}"),
            Token::Int(value) => value.to_string(),
            Token::Float(raw) => raw.clone(),
            Token::Punct(ch) => ch.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_string_prefix(word: &str) -> bool {
    word.len() <= 2 && word.chars().all(|ch| "rRbBuUfF".contains(ch))
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, ScanError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\n' {
            line += 1;
            i += 1;
        } else if ch.is_whitespace() {
            i += 1;
        } else if ch == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if ch == '"' || ch == '\'' {
            let (value, next, newlines) = read_string(&chars, i, false, line)?;
            tokens.push(Spanned {
                token: Token::Str(value),
                line,
            });
            line += newlines;
            i = next;
        } else if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if is_string_prefix(&word) && matches!(chars.get(i), Some('"' | '\'')) {
                let raw = word.contains(['r', 'R']);
                let (value, next, newlines) = read_string(&chars, i, raw, line)?;
                tokens.push(Spanned {
                    token: Token::Str(value),
                    line,
                });
                line += newlines;
                i = next;
            } else {
                tokens.push(Spanned {
                    token: Token::Ident(word),
                    line,
                });
            }
        } else if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.'))
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            tokens.push(Spanned {
                token: number_token(&raw),
                line,
            });
        } else {
            tokens.push(Spanned {
                token: Token::Punct(ch),
                line,
            });
            i += 1;
        }
    }

    Ok(tokens)
}

fn number_token(raw: &str) -> Token {
    let digits = raw.replace('_', "");
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()
    } else {
        digits.parse::<i64>().ok()
    };
    match parsed {
        Some(value) => Token::Int(value),
        None => Token::Float(raw.to_string()),
    }
}

/// Reads a quoted literal starting at `start`; returns the decoded value, the
/// index after the closing quote and the number of newlines consumed.
fn read_string(
    chars: &[char],
    start: usize,
    raw: bool,
    line: usize,
) -> Result<(String, usize, usize), ScanError> {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = if triple { start + 3 } else { start + 1 };
    let mut value = String::new();
    let mut newlines = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            if raw {
                value.push(ch);
                value.push(next);
            } else {
                match next {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' | '\'' | '"' => value.push(next),
                    '\n' => {}
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            }
            if next == '\n' {
                newlines += 1;
            }
            i += 2;
            continue;
        }
        if ch == quote {
            if !triple {
                return Ok((value, i + 1, newlines));
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return Ok((value, i + 3, newlines));
            }
        }
        if ch == '\n' {
            if !triple {
                return Err(ScanError {
                    line,
                    reason: "unterminated string literal".to_string(),
                });
            }
            newlines += 1;
        }
        value.push(ch);
        i += 1;
    }

    Err(ScanError {
        line,
        reason: "unterminated string literal".to_string(),
    })
}
