//! Format-string tokenizer shared by the parse and build directions.
//!
//! A format string is turned into a tree of [`Item`]s once, then interpreted
//! against the slot or value array. Malformed strings raise `SystemError`,
//! matching how the C API reports programmer errors.

use smallvec::SmallVec;

use crate::exception_private::{ExcType, RunError, RunResult};

/// A single conversion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Code {
    /// `b`: `unsigned char`, range checked.
    Byte,
    /// `h`: `short`.
    Short,
    /// `i`: `int`.
    Int,
    /// `l`: `long`.
    Long,
    /// `L`: `long long`.
    LongLong,
    /// `n`: `Py_ssize_t`.
    Ssize,
    /// `k`: `unsigned long`, low bits only.
    ULongMask,
    /// `K`: `unsigned long long`, low bits only.
    ULongLongMask,
    /// `d`: `double`.
    Double,
    /// `f`: `float`.
    Float,
    /// `p`: truth value as `int`.
    Predicate,
    /// `s`: UTF-8 text.
    Str,
    /// `z`: UTF-8 text or `None`.
    NullableStr,
    /// `y`: bytes.
    Bytes,
    /// `U`: a `str` object.
    StrObject,
    /// `S`: a `bytes` object.
    BytesObject,
    /// `O`: any object.
    Object,
    /// `O!`: an object of a given type.
    CheckedObject,
    /// `N`: any object, reference stolen.
    Steal,
}

impl Code {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'b' => Self::Byte,
            'h' => Self::Short,
            'i' => Self::Int,
            'l' => Self::Long,
            'L' => Self::LongLong,
            'n' => Self::Ssize,
            'k' => Self::ULongMask,
            'K' => Self::ULongLongMask,
            'd' => Self::Double,
            'f' => Self::Float,
            'p' => Self::Predicate,
            's' => Self::Str,
            'z' => Self::NullableStr,
            'y' => Self::Bytes,
            'U' => Self::StrObject,
            'S' => Self::BytesObject,
            'O' => Self::Object,
            'N' => Self::Steal,
            _ => return None,
        })
    }

    /// Whether a trailing `#` (explicit length) is accepted.
    fn takes_length(self) -> bool {
        matches!(self, Self::Str | Self::NullableStr | Self::Bytes)
    }

    /// Codes that only make sense in one direction.
    fn valid_for(self, direction: Direction) -> bool {
        match direction {
            Direction::Parse => self != Self::Steal,
            Direction::Build => !matches!(self, Self::Predicate | Self::StrObject | Self::CheckedObject),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Parse,
    Build,
}

/// One node of a parsed format string.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Item {
    Unit { code: Code, with_length: bool },
    Tuple(Vec<Item>),
    List(Vec<Item>),
    Dict(Vec<(Item, Item)>),
}

impl Item {
    /// Number of slots (parse) or values (build) this item consumes.
    pub(crate) fn width(&self) -> usize {
        match self {
            Self::Unit { code, with_length } => 1 + usize::from(*with_length || *code == Code::CheckedObject),
            Self::Tuple(items) | Self::List(items) => items.iter().map(Self::width).sum(),
            Self::Dict(pairs) => pairs.iter().map(|(k, v)| k.width() + v.width()).sum(),
        }
    }
}

/// A parse-direction format: top-level fields plus the markers around them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseFormat {
    pub items: Vec<Item>,
    /// Index of the first optional field (`|`); `items.len()` when absent.
    pub required: usize,
    /// Index of the first keyword-only field (`$`); `items.len()` when absent.
    pub positional: usize,
    /// Function name from `:name`.
    pub fname: Option<String>,
    /// Replacement arity message from `;msg`.
    pub message: Option<String>,
}

impl ParseFormat {
    pub(crate) fn fname(&self) -> Option<&str> {
        self.fname.as_deref()
    }
}

fn bad_format(format: &str) -> RunError {
    ExcType::system_error(format!("bad format string: {format}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Paren,
    Square,
    Curly,
}

impl Bracket {
    fn close(self) -> char {
        match self {
            Self::Paren => ')',
            Self::Square => ']',
            Self::Curly => '}',
        }
    }

    fn wrap(self, items: Vec<Item>, format: &str) -> RunResult<Item> {
        Ok(match self {
            Self::Paren => Item::Tuple(items),
            Self::Square => Item::List(items),
            Self::Curly => {
                if items.len() % 2 != 0 {
                    return Err(bad_format(format));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    pairs.push((key, value));
                }
                Item::Dict(pairs)
            }
        })
    }
}

/// Tokenizes the field part of a format string (no `:`/`;` suffix handling).
///
/// `on_marker` receives each top-level `|` or `$` with the index of the
/// field that follows it.
fn tokenize(
    body: &str,
    format: &str,
    direction: Direction,
    mut on_marker: impl FnMut(char, usize) -> RunResult<()>,
) -> RunResult<Vec<Item>> {
    // Open containers and the items collected so far at each nesting level.
    let mut stack: SmallVec<[(Bracket, Vec<Item>); 4]> = SmallVec::new();
    let mut top: Vec<Item> = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        let open = match c {
            '(' => Some(Bracket::Paren),
            '[' | '{' if direction == Direction::Build => Some(if c == '[' { Bracket::Square } else { Bracket::Curly }),
            _ => None,
        };
        if let Some(bracket) = open {
            stack.push((bracket, Vec::new()));
            continue;
        }
        match c {
            ')' | ']' | '}' => {
                let (bracket, items) = stack.pop().ok_or_else(|| bad_format(format))?;
                if bracket.close() != c {
                    return Err(bad_format(format));
                }
                let item = bracket.wrap(items, format)?;
                match stack.last_mut() {
                    Some((_, items)) => items.push(item),
                    None => top.push(item),
                }
            }
            '|' | '$' if direction == Direction::Parse && stack.is_empty() => on_marker(c, top.len())?,
            ' ' | ',' | ':' | '\t' | '\n' if direction == Direction::Build => {}
            _ => {
                let mut code = Code::from_char(c).ok_or_else(|| bad_format(format))?;
                if code == Code::Object && direction == Direction::Parse && chars.peek() == Some(&'!') {
                    chars.next();
                    code = Code::CheckedObject;
                }
                if !code.valid_for(direction) {
                    return Err(bad_format(format));
                }
                let with_length = code.takes_length() && chars.peek() == Some(&'#');
                if with_length {
                    chars.next();
                }
                let item = Item::Unit { code, with_length };
                match stack.last_mut() {
                    Some((_, items)) => items.push(item),
                    None => top.push(item),
                }
            }
        }
    }
    if stack.is_empty() { Ok(top) } else { Err(bad_format(format)) }
}

/// Parses a `PyArg_ParseTuple*` format string.
pub(crate) fn parse_format(format: &str) -> RunResult<ParseFormat> {
    let (body, fname, message) = match format.find([':', ';']) {
        Some(at) => {
            let suffix = format[at + 1..].to_owned();
            if format[at..].starts_with(':') {
                (&format[..at], Some(suffix), None)
            } else {
                (&format[..at], None, Some(suffix))
            }
        }
        None => (format, None, None),
    };
    let mut required = None;
    let mut positional = None;
    let items = tokenize(body, format, Direction::Parse, |marker, at| {
        let target = if marker == '|' { &mut required } else { &mut positional };
        if target.is_some() {
            return Err(bad_format(format));
        }
        *target = Some(at);
        Ok(())
    })?;
    let len = items.len();
    let positional = positional.unwrap_or(len);
    let required = required.unwrap_or(len);
    Ok(ParseFormat {
        items,
        required,
        positional,
        fname,
        message,
    })
}

/// Parses a `Py_BuildValue` format string.
pub(crate) fn build_format(format: &str) -> RunResult<Vec<Item>> {
    tokenize(format, format, Direction::Build, |_, _| Ok(()))
}
