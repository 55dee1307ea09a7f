//! URI template (RFC 6570, levels 1-4) to regex conversion.
//!
//! Mercure topic selectors use URI templates as match patterns rather than
//! expansion sources, so each template is compiled once into an anchored
//! regular expression that accepts every possible expansion of the template:
//!
//! - each operator contributes its leading literal (`#`, `.`, `/`, `;`, `?`,
//!   `&`) and joins multiple variables with its separator;
//! - variables under `+` and `#` accept reserved characters, all others
//!   exclude `/`, `?` and `#`;
//! - `:n` prefix truncation bounds the repetition, `*` explode repeats the
//!   value with the operator's separator;
//! - an expression whose variables are all undefined expands to nothing, so
//!   every expression group is optional.
//!
//! Compiled templates are memoized process-wide, keyed by the template
//! string. The cache is bounded; when full it drops the whole generation
//! rather than tracking per-entry recency.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

/// Upper bound on memoized compiled templates.
const CACHE_CAPACITY: usize = 10_000;

static CACHE: LazyLock<DashMap<String, Arc<CompiledTemplate>>> = LazyLock::new(DashMap::new);

/// A URI template compiled to an anchored regex matcher.
#[derive(Debug)]
pub struct CompiledTemplate {
    source: String,
    pattern: Regex,
}

/// An error produced while compiling a URI template.
#[derive(Debug, Error)]
#[error("failed to compile URI template \"{template}\": {kind}")]
pub struct TemplateError {
    template: String,
    kind: TemplateErrorKind,
}

#[derive(Debug, Error)]
pub enum TemplateErrorKind {
    #[error("unterminated expression")]
    UnterminatedExpression,
    #[error("empty expression")]
    EmptyExpression,
    #[error("operator \"{0}\" is reserved for future extension")]
    ReservedOperator(char),
    #[error("invalid variable name \"{0}\"")]
    InvalidVarName(String),
    #[error("prefix length {0} out of range (1..=9999)")]
    PrefixOutOfRange(u64),
    #[error("generated pattern rejected by the regex engine: {0}")]
    Pattern(#[from] regex::Error),
}

impl TemplateError {
    /// The template string that failed to compile.
    pub fn template(&self) -> &str {
        &self.template
    }
}

/// Expansion behavior of one RFC 6570 operator.
struct Operator {
    /// Literal prefix the first defined variable contributes.
    first: &'static str,
    /// Separator between variables (and between exploded values).
    separator: char,
    /// Whether expansions carry `name=value` pairs.
    named: bool,
    /// Whether an empty value drops the `=` (`;` style) instead of keeping it.
    trailing_eq: bool,
    /// Whether values may contain reserved characters.
    reserved: bool,
}

fn operator(first_char: Option<char>) -> Result<(Operator, bool), TemplateErrorKind> {
    // Returns the operator and whether its character was consumed.
    let op = match first_char {
        Some('+') => Operator {
            first: "",
            separator: ',',
            named: false,
            trailing_eq: false,
            reserved: true,
        },
        Some('#') => Operator {
            first: "#",
            separator: ',',
            named: false,
            trailing_eq: false,
            reserved: true,
        },
        Some('.') => Operator {
            first: ".",
            separator: '.',
            named: false,
            trailing_eq: false,
            reserved: false,
        },
        Some('/') => Operator {
            first: "/",
            separator: '/',
            named: false,
            trailing_eq: false,
            reserved: false,
        },
        Some(';') => Operator {
            first: ";",
            separator: ';',
            named: true,
            trailing_eq: false,
            reserved: false,
        },
        Some('?') => Operator {
            first: "?",
            separator: '&',
            named: true,
            trailing_eq: true,
            reserved: false,
        },
        Some('&') => Operator {
            first: "&",
            separator: '&',
            named: true,
            trailing_eq: true,
            reserved: false,
        },
        Some(c @ ('=' | ',' | '!' | '@' | '|')) => {
            return Err(TemplateErrorKind::ReservedOperator(c));
        }
        _ => {
            return Ok((
                Operator {
                    first: "",
                    separator: ',',
                    named: false,
                    trailing_eq: false,
                    reserved: false,
                },
                false,
            ));
        }
    };
    Ok((op, true))
}

#[derive(Debug, PartialEq)]
enum Modifier {
    None,
    Prefix(u64),
    Explode,
}

struct VarSpec {
    name: String,
    modifier: Modifier,
}

/// Compiles a URI template, consulting the process-wide cache first.
pub fn compile(template: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
    if let Some(hit) = CACHE.get(template) {
        return Ok(Arc::clone(hit.value()));
    }

    let pattern = convert(template).map_err(|kind| TemplateError {
        template: template.to_owned(),
        kind,
    })?;
    let compiled = Arc::new(CompiledTemplate {
        source: template.to_owned(),
        pattern,
    });

    if CACHE.len() >= CACHE_CAPACITY {
        CACHE.clear();
    }
    CACHE.insert(template.to_owned(), Arc::clone(&compiled));

    Ok(compiled)
}

impl CompiledTemplate {
    /// The template string this matcher was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether `candidate` is a possible expansion of this template.
    pub fn matches(&self, candidate: &str) -> bool {
        self.pattern.is_match(candidate)
    }
}

fn convert(template: &str) -> Result<Regex, TemplateErrorKind> {
    let mut out = String::with_capacity(template.len() * 2);
    out.push('^');

    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&regex::escape(&rest[..open]));
        let after_open = &rest[open + 1..];
        let close = after_open
            .find('}')
            .ok_or(TemplateErrorKind::UnterminatedExpression)?;
        let expression = &after_open[..close];
        if expression.is_empty() {
            return Err(TemplateErrorKind::EmptyExpression);
        }
        out.push_str(&convert_expression(expression)?);
        rest = &after_open[close + 1..];
    }
    out.push_str(&regex::escape(rest));
    out.push('$');

    Ok(Regex::new(&out)?)
}

fn convert_expression(expression: &str) -> Result<String, TemplateErrorKind> {
    let (op, consumed) = operator(expression.chars().next())?;
    let var_list = if consumed {
        &expression[1..]
    } else {
        expression
    };

    let vars = var_list
        .split(',')
        .map(parse_varspec)
        .collect::<Result<Vec<_>, _>>()?;
    if vars.is_empty() {
        return Err(TemplateErrorKind::EmptyExpression);
    }

    let parts: Vec<String> = vars.iter().map(|var| var_pattern(var, &op)).collect();
    let alternation = if parts.len() == 1 {
        format!("(?:{})", parts[0])
    } else {
        format!("(?:{})", parts.join("|"))
    };

    let first = regex::escape(op.first);
    let separator = regex::escape(&op.separator.to_string());
    let pattern = if vars.len() == 1 {
        format!("(?:{first}{alternation})?")
    } else {
        format!(
            "(?:{first}{alternation}(?:{separator}{alternation}){{0,{}}})?",
            vars.len() - 1
        )
    };
    Ok(pattern)
}

fn parse_varspec(raw: &str) -> Result<VarSpec, TemplateErrorKind> {
    let (name, modifier) = if let Some(stripped) = raw.strip_suffix('*') {
        (stripped, Modifier::Explode)
    } else if let Some((name, len)) = raw.split_once(':') {
        let len: u64 = len
            .parse()
            .map_err(|_| TemplateErrorKind::InvalidVarName(raw.to_owned()))?;
        if len == 0 || len > 9999 {
            return Err(TemplateErrorKind::PrefixOutOfRange(len));
        }
        (name, Modifier::Prefix(len))
    } else {
        (raw, Modifier::None)
    };

    if name.is_empty() || !valid_varname(name) {
        return Err(TemplateErrorKind::InvalidVarName(raw.to_owned()));
    }

    Ok(VarSpec {
        name: name.to_owned(),
        modifier,
    })
}

fn valid_varname(name: &str) -> bool {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => i += 1,
            // varname may contain dots between varchars, but not lead with one
            b'.' if i > 0 && i + 1 < bytes.len() => i += 1,
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                i += 3;
            }
            _ => return false,
        }
    }
    true
}

/// Character class for a single expanded character of this variable.
fn value_class(op: &Operator) -> String {
    if op.reserved {
        ".".to_owned()
    } else if op.named {
        // Honor the pair separator so one value cannot swallow the next pair.
        format!("[^/?#{}]", op.separator)
    } else {
        "[^/?#]".to_owned()
    }
}

fn var_pattern(var: &VarSpec, op: &Operator) -> String {
    let class = value_class(op);
    let value = match var.modifier {
        Modifier::Prefix(n) => format!("{class}{{0,{n}}}"),
        _ => format!("{class}*"),
    };

    if op.named {
        let separator = regex::escape(&op.separator.to_string());
        match var.modifier {
            Modifier::Explode => {
                // Exploded lists repeat `name=value`; exploded maps substitute
                // their own keys, so accept any key in name position.
                let key = format!("[^/?#={}]+", op.separator);
                let pair = if op.trailing_eq {
                    format!("{key}={value}")
                } else {
                    format!("{key}(?:={value})?")
                };
                format!("{pair}(?:{separator}{pair})*")
            }
            _ => {
                let name = regex::escape(&var.name);
                if op.trailing_eq {
                    format!("{name}={value}")
                } else {
                    format!("{name}(?:={value})?")
                }
            }
        }
    } else {
        match var.modifier {
            Modifier::Explode => {
                let separator = regex::escape(&op.separator.to_string());
                format!("{value}(?:{separator}{value})*")
            }
            _ => value,
        }
    }
}
